use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSender {
    /// Upstream message id; unique across all records.
    pub message_id: String,
    pub user_id: String,
    pub login: String,
    pub display_name: String,
    pub color: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatBadge {
    pub name: String,
    pub urls: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatEmote {
    pub name: String,
    pub zero_width: bool,
    pub urls: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRecord {
    pub id: String,
    pub session_id: String,
    pub sender: ChatSender,
    pub timestamp: DateTime<Utc>,
    pub content: String,
    pub badges: Vec<ChatBadge>,
    pub emotes: Vec<ChatEmote>,
}

#[derive(Debug, Clone)]
pub struct CreateChatRecord {
    pub session_id: String,
    pub sender: ChatSender,
    pub timestamp: DateTime<Utc>,
    pub content: String,
    pub badges: Vec<ChatBadge>,
    pub emotes: Vec<ChatEmote>,
}
