use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Live,
    Queued,
    Processing,
    Ready,
    Storage,
    Failed,
    Canceled,
}

impl SessionState {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "live" => Some(SessionState::Live),
            "queued" => Some(SessionState::Queued),
            "processing" => Some(SessionState::Processing),
            "ready" => Some(SessionState::Ready),
            "storage" => Some(SessionState::Storage),
            "failed" => Some(SessionState::Failed),
            "canceled" => Some(SessionState::Canceled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionVisibility {
    Public,
    Deleted,
}

impl SessionVisibility {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "public" => Some(SessionVisibility::Public),
            "deleted" => Some(SessionVisibility::Deleted),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionVariant {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub bitrate: u32,
    pub ready: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryEntry {
    pub timestamp: DateTime<Utc>,
    pub category_id: String,
    pub name: String,
    pub url: String,
}

/// One continuous broadcast recording.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub broadcaster_id: String,
    pub title: String,
    /// Ordered oldest first.
    pub categories: Vec<CategoryEntry>,
    pub state: SessionState,
    pub visibility: SessionVisibility,
    pub variants: Vec<SessionVariant>,
    pub thumbnail_static: String,
    pub thumbnail_animated: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn last_category(&self) -> Option<&CategoryEntry> {
        self.categories.last()
    }
}

/// Field-set plus optional array-append applied to a session in one write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionUpdate {
    pub title: String,
    pub push_category: Option<CategoryEntry>,
}
