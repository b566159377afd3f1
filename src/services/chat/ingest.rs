//! Correlates chat events with live sessions and persists them.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;

use super::message::{ChatMessage, ClearChat};
use crate::cache::{self, SharedCache, CHAT_EVENT_TTL};
use crate::db::models::{Broadcaster, ChatBadge, ChatEmote, ChatSender, CreateChatRecord};
use crate::db::repository::ChatRepository;
use crate::error::{with_timeout, AppResult};
use crate::services::emotes::{Emote, EmoteProvider, EmoteResolver};

const NATIVE_EMOTE_URL: &str = "https://static-cdn.jtvnw.net/emoticons/v1";
const BADGE_URL: &str = "https://static-cdn.jtvnw.net/badges/v1";
const BROADCASTER_BADGE_URL: &str = "https://static-cdn.jtvnw.net/chat-badges/broadcaster.png";
const MODERATOR_BADGE_ID: &str = "3267646d-33f0-4b17-b3df-f923a41db1d0";
const VIP_BADGE_ID: &str = "b817aba4-fad8-49e2-b88a-7cc744dfa6ec";
const PARTNER_BADGE_ID: &str = "d12a2e27-16f6-41d0-ab77-b780518f00a3";
const SUBSCRIBER_BADGE_ID: &str = "5d9f2208-5dd8-11e7-8513-2ff4adfae661";

/// Immutable mapping of chat rooms to tracked broadcasters.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RoomTable {
    /// twitch id -> internal broadcaster id
    rooms: HashMap<String, String>,
    logins: BTreeSet<String>,
}

impl RoomTable {
    pub fn from_broadcasters(broadcasters: &[Broadcaster]) -> Self {
        Self {
            rooms: broadcasters
                .iter()
                .map(|b| (b.twitch_id.clone(), b.id.clone()))
                .collect(),
            logins: broadcasters
                .iter()
                .map(|b| b.twitch_login.to_lowercase())
                .collect(),
        }
    }

    pub fn resolve(&self, room_id: &str) -> Option<&str> {
        self.rooms.get(room_id).map(String::as_str)
    }

    pub fn logins(&self) -> &BTreeSet<String> {
        &self.logins
    }
}

/// Current room table; swapped wholesale, readers keep their snapshot.
#[derive(Debug, Default)]
pub struct RoomDirectory {
    current: RwLock<Arc<RoomTable>>,
}

impl RoomDirectory {
    pub fn new(table: RoomTable) -> Self {
        Self {
            current: RwLock::new(Arc::new(table)),
        }
    }

    pub fn snapshot(&self) -> Arc<RoomTable> {
        self.current.read().clone()
    }

    pub fn replace(&self, table: Arc<RoomTable>) {
        *self.current.write() = table;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    Stored,
    UnknownRoom,
    Duplicate,
    NotLive,
    CacheFailed,
    StoreFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearOutcome {
    Cleared(u64),
    NoTarget,
    UnknownRoom,
    Duplicate,
    NotLive,
    CacheFailed,
    StoreFailed,
}

fn badge_urls(badge_id: &str) -> Vec<String> {
    (1..=3)
        .map(|scale| format!("{}/{}/{}", BADGE_URL, badge_id, scale))
        .collect()
}

/// A badge counts when present with any version other than `0`.
fn has_badge(msg: &ChatMessage, name: &str) -> bool {
    msg.badge(name).map_or(false, |v| v != "0")
}

pub fn build_badges(msg: &ChatMessage) -> Vec<ChatBadge> {
    let mut badges = Vec::new();

    if has_badge(msg, "broadcaster") {
        badges.push(ChatBadge {
            name: "Broadcaster".to_string(),
            urls: vec![BROADCASTER_BADGE_URL.to_string()],
        });
    }
    if has_badge(msg, "moderator") {
        badges.push(ChatBadge {
            name: "Moderator".to_string(),
            urls: badge_urls(MODERATOR_BADGE_ID),
        });
    }
    if has_badge(msg, "vip") {
        badges.push(ChatBadge {
            name: "VIP".to_string(),
            urls: badge_urls(VIP_BADGE_ID),
        });
    }
    if has_badge(msg, "staff") {
        badges.push(ChatBadge {
            name: "Staff".to_string(),
            urls: Vec::new(),
        });
    }
    if has_badge(msg, "partner") {
        badges.push(ChatBadge {
            name: "Partner".to_string(),
            urls: badge_urls(PARTNER_BADGE_ID),
        });
    }
    if has_badge(msg, "subscriber") {
        let months = msg
            .badge_info("subscriber")
            .or_else(|| msg.badge("subscriber"))
            .unwrap_or_default();
        badges.push(ChatBadge {
            name: format!("Subscriber ({} months)", months),
            urls: badge_urls(SUBSCRIBER_BADGE_ID),
        });
    }

    badges
}

/// Native emotes first, then third-party matches on space-separated tokens.
/// A name already present is never replaced.
pub fn build_emotes(msg: &ChatMessage, third_party: &HashMap<String, Emote>) -> Vec<ChatEmote> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut emotes = Vec::new();

    for native in &msg.emotes {
        if seen.insert(native.name.clone()) {
            emotes.push(ChatEmote {
                name: native.name.clone(),
                zero_width: false,
                urls: ["1.0", "2.0", "3.0"]
                    .iter()
                    .map(|scale| format!("{}/{}/{}", NATIVE_EMOTE_URL, native.id, scale))
                    .collect(),
            });
        }
    }

    for token in msg.text.split(' ') {
        let Some(emote) = third_party.get(token) else {
            continue;
        };
        if seen.insert(token.to_string()) {
            emotes.push(ChatEmote {
                name: token.to_string(),
                zero_width: emote.zero_width,
                urls: emote.urls.clone(),
            });
        }
    }

    emotes
}

/// SHA-256 hex of the event's JSON form; clears carry no upstream id.
pub fn clear_chat_digest(event: &ClearChat) -> String {
    let data = serde_json::to_vec(event).unwrap_or_default();
    hex::encode(Sha256::digest(&data))
}

pub struct ChatIngest {
    db: SqlitePool,
    cache: Arc<dyn SharedCache>,
    emotes: EmoteResolver,
    rooms: Arc<RoomDirectory>,
    timeout: Duration,
}

impl ChatIngest {
    pub fn new(
        db: SqlitePool,
        cache: Arc<dyn SharedCache>,
        emotes: EmoteResolver,
        rooms: Arc<RoomDirectory>,
        timeout: Duration,
    ) -> Self {
        Self {
            db,
            cache,
            emotes,
            rooms,
            timeout,
        }
    }

    pub fn rooms(&self) -> &Arc<RoomDirectory> {
        &self.rooms
    }

    /// Dedup gate and live-session lookup in one round trip.
    async fn gate(
        &self,
        marker_key: &str,
        broadcaster_id: &str,
    ) -> AppResult<(bool, Option<String>)> {
        with_timeout(
            "chat dedup gate",
            self.timeout,
            self.cache
                .set_nx_then_get(marker_key, CHAT_EVENT_TTL, &cache::live_key(broadcaster_id)),
        )
        .await
    }

    pub async fn handle_message(&self, msg: &ChatMessage) -> MessageOutcome {
        let rooms = self.rooms.snapshot();
        let Some(broadcaster_id) = rooms.resolve(&msg.room_id) else {
            return MessageOutcome::UnknownRoom;
        };

        let session_id = match self.gate(&cache::chat_message_key(&msg.id), broadcaster_id).await {
            Ok((false, _)) => return MessageOutcome::Duplicate,
            Ok((true, None)) => return MessageOutcome::NotLive,
            Ok((true, Some(session_id))) => session_id,
            Err(e) => {
                tracing::warn!("Failed to gate chat message {}: {}", msg.id, e);
                return MessageOutcome::CacheFailed;
            }
        };

        let third_party = self.third_party_emotes(&msg.room_id).await;

        let record = CreateChatRecord {
            session_id,
            sender: ChatSender {
                message_id: msg.id.clone(),
                user_id: msg.user_id.clone(),
                login: msg.login.clone(),
                display_name: msg.display_name.clone(),
                color: msg.color.clone(),
            },
            timestamp: msg.timestamp,
            content: msg.text.clone(),
            badges: build_badges(msg),
            emotes: build_emotes(msg, &third_party),
        };

        match with_timeout(
            "chat insert",
            self.timeout,
            ChatRepository::insert(&self.db, record),
        )
        .await
        {
            Ok(_) => MessageOutcome::Stored,
            Err(e) => {
                tracing::error!("Failed to insert chat message {}: {}", msg.id, e);
                MessageOutcome::StoreFailed
            }
        }
    }

    pub async fn handle_clear_chat(&self, event: &ClearChat) -> ClearOutcome {
        if event.target_user_id.is_empty() {
            return ClearOutcome::NoTarget;
        }

        let rooms = self.rooms.snapshot();
        let Some(broadcaster_id) = rooms.resolve(&event.room_id) else {
            return ClearOutcome::UnknownRoom;
        };

        let marker = cache::clear_chat_key(&clear_chat_digest(event));
        let session_id = match self.gate(&marker, broadcaster_id).await {
            Ok((false, _)) => return ClearOutcome::Duplicate,
            Ok((true, None)) => return ClearOutcome::NotLive,
            Ok((true, Some(session_id))) => session_id,
            Err(e) => {
                tracing::warn!("Failed to gate clear chat in {}: {}", event.channel, e);
                return ClearOutcome::CacheFailed;
            }
        };

        match with_timeout(
            "chat clear",
            self.timeout,
            ChatRepository::delete_by_session_and_user(&self.db, &session_id, &event.target_user_id),
        )
        .await
        {
            Ok(removed) => {
                tracing::info!(
                    "Cleared {} message(s) of {} in session {}",
                    removed,
                    event.target_login,
                    session_id
                );
                ClearOutcome::Cleared(removed)
            }
            Err(e) => {
                tracing::error!("Failed to clear chat of {}: {}", event.target_user_id, e);
                ClearOutcome::StoreFailed
            }
        }
    }

    /// Name lookup over FFZ, BTTV then 7TV; later providers win a name clash.
    async fn third_party_emotes(&self, room_id: &str) -> HashMap<String, Emote> {
        let mut by_name = HashMap::new();
        for provider in EmoteProvider::THIRD_PARTY {
            match self.emotes.resolve(provider, room_id).await {
                Ok(emotes) => {
                    for emote in emotes {
                        by_name.insert(emote.name.clone(), emote);
                    }
                }
                Err(e) => tracing::debug!("Failed to get {} emotes: {}", provider.as_str(), e),
            }
        }
        by_name
    }
}
