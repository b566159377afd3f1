pub mod broadcaster;
pub mod chat;
pub mod session;

pub use broadcaster::BroadcasterRepository;
pub use chat::ChatRepository;
pub use session::SessionRepository;
