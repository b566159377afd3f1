pub mod auth;
pub mod chat;
pub mod emotes;
pub mod init;
pub mod subscriptions;
pub mod twitch;
pub mod webhooks;
