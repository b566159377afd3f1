//! Shared cache used for live state, dedup markers, the app token and emote catalogs.
//!
//! Every dedup marker goes through [`SharedCache::set_nx_ex`] or
//! [`SharedCache::set_nx_then_get`]; both are a single atomic SET NX EX on the
//! server, which is what keeps at-least-once upstream delivery from producing
//! duplicate writes.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::AppResult;

#[cfg(test)]
pub mod memory;
pub mod redis;

pub use self::redis::RedisCache;

pub const WEBHOOK_EVENT_TTL: Duration = Duration::from_secs(12 * 60 * 60);
pub const CHAT_EVENT_TTL: Duration = Duration::from_secs(30);

/// Key holding the active session id of a broadcaster (internal id).
pub fn live_key(broadcaster_id: &str) -> String {
    format!("streamer-live:{}", broadcaster_id)
}

pub fn webhook_event_key(message_id: &str) -> String {
    format!("twitch-webhook-events:{}", message_id)
}

pub fn chat_message_key(message_id: &str) -> String {
    format!("twitch-chat-msg:{}", message_id)
}

pub fn clear_chat_key(digest: &str) -> String {
    format!("twitch-clear-msg:{}", digest)
}

#[async_trait]
pub trait SharedCache: Send + Sync {
    async fn get(&self, key: &str) -> AppResult<Option<String>>;

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> AppResult<()>;

    /// Set `key` only if it does not exist yet. Returns `true` when this call created it.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> AppResult<bool>;

    /// SET NX `marker_key` and GET `get_key` in one round trip.
    async fn set_nx_then_get(
        &self,
        marker_key: &str,
        ttl: Duration,
        get_key: &str,
    ) -> AppResult<(bool, Option<String>)>;

    async fn del(&self, key: &str) -> AppResult<()>;
}
