use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

use crate::cache::{self, WEBHOOK_EVENT_TTL};
use crate::db::models::{CategoryEntry, SessionUpdate};
use crate::db::repository::{BroadcasterRepository, SessionRepository};
use crate::error::{with_timeout, AppError, AppResult};
use crate::services::twitch::EventSubCondition;
use crate::AppState;

type HmacSha256 = Hmac<Sha256>;

const TWITCH_MESSAGE_ID_HEADER: &str = "twitch-eventsub-message-id";
const TWITCH_MESSAGE_TIMESTAMP_HEADER: &str = "twitch-eventsub-message-timestamp";
const TWITCH_MESSAGE_SIGNATURE_HEADER: &str = "twitch-eventsub-message-signature";
const TWITCH_MESSAGE_TYPE_HEADER: &str = "twitch-eventsub-message-type";

const MESSAGE_TYPE_VERIFICATION: &str = "webhook_callback_verification";
const MESSAGE_TYPE_NOTIFICATION: &str = "notification";
const MESSAGE_TYPE_REVOCATION: &str = "revocation";

const BOXART_URL: &str = "https://static-cdn.jtvnw.net/ttv-boxart";
const UNKNOWN_BOXART_URL: &str = "https://static-cdn.jtvnw.net/ttv-static/404_boxart.jpg";
const UNKNOWN_CATEGORY_NAME: &str = "Unknown";
const UNKNOWN_CATEGORY_ID: &str = "0";

#[derive(Debug, Clone)]
pub struct WebhookHeaders {
    pub message_id: String,
    pub timestamp: String,
    /// Decoded bytes of the `sha256=<hex>` signature.
    pub signature: Vec<u8>,
    pub message_type: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionInfo {
    pub id: String,
    pub status: String,
    #[serde(rename = "type")]
    pub subscription_type: String,
    #[serde(default)]
    pub condition: Option<EventSubCondition>,
}

impl SubscriptionInfo {
    pub fn broadcaster_id(&self) -> Option<&str> {
        self.condition
            .as_ref()
            .and_then(|c| c.broadcaster_user_id.as_deref())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct VerificationPayload {
    pub challenge: String,
    pub subscription: SubscriptionInfo,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelUpdateEvent {
    pub broadcaster_user_id: String,
    #[serde(default)]
    pub broadcaster_user_login: String,
    pub title: String,
    #[serde(default)]
    pub category_id: String,
    #[serde(default)]
    pub category_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationPayload {
    pub subscription: SubscriptionInfo,
    pub event: ChannelUpdateEvent,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RevocationPayload {
    pub subscription: SubscriptionInfo,
}

/// Body of an authenticated EventSub delivery, keyed by the message type header.
#[derive(Debug, Clone)]
pub enum WebhookMessage {
    Verification(VerificationPayload),
    Notification(NotificationPayload),
    Revocation(RevocationPayload),
    Unrecognized(String),
}

impl WebhookMessage {
    pub fn parse(message_type: &str, body: &[u8]) -> AppResult<Self> {
        let invalid = |e: serde_json::Error| AppError::BadRequest(format!("Invalid payload: {}", e));

        Ok(match message_type {
            MESSAGE_TYPE_VERIFICATION => {
                WebhookMessage::Verification(serde_json::from_slice(body).map_err(invalid)?)
            }
            MESSAGE_TYPE_NOTIFICATION => {
                WebhookMessage::Notification(serde_json::from_slice(body).map_err(invalid)?)
            }
            MESSAGE_TYPE_REVOCATION => {
                WebhookMessage::Revocation(serde_json::from_slice(body).map_err(invalid)?)
            }
            other => WebhookMessage::Unrecognized(other.to_string()),
        })
    }
}

/// What a notification did to the live session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationOutcome {
    Applied,
    /// The broadcaster has no active session.
    NotLive,
}

/// Title is always replaced; a category entry is appended only when the
/// category differs from the last recorded one.
pub fn plan_session_update(
    last: Option<&CategoryEntry>,
    event: &ChannelUpdateEvent,
    now: DateTime<Utc>,
) -> SessionUpdate {
    let changed = last.map_or(true, |entry| entry.category_id != event.category_id);

    let push_category = changed.then(|| {
        if event.category_name.is_empty() {
            CategoryEntry {
                timestamp: now,
                category_id: UNKNOWN_CATEGORY_ID.to_string(),
                name: UNKNOWN_CATEGORY_NAME.to_string(),
                url: UNKNOWN_BOXART_URL.to_string(),
            }
        } else {
            CategoryEntry {
                timestamp: now,
                category_id: event.category_id.clone(),
                name: event.category_name.clone(),
                url: format!("{}/{}-144x192.jpg", BOXART_URL, event.category_id),
            }
        }
    });

    SessionUpdate {
        title: event.title.clone(),
        push_category,
    }
}

pub struct WebhookService;

impl WebhookService {
    /// Extract and validate the EventSub headers
    pub fn extract_headers(headers: &HeaderMap) -> AppResult<WebhookHeaders> {
        let signature = Self::get_header(headers, TWITCH_MESSAGE_SIGNATURE_HEADER)?;
        let signature = signature
            .strip_prefix("sha256=")
            .and_then(|hex_sig| hex::decode(hex_sig).ok())
            .ok_or_else(|| AppError::BadRequest("Invalid signature format".to_string()))?;

        Ok(WebhookHeaders {
            message_id: Self::get_header(headers, TWITCH_MESSAGE_ID_HEADER)?,
            timestamp: Self::get_header(headers, TWITCH_MESSAGE_TIMESTAMP_HEADER)?,
            signature,
            message_type: Self::get_header(headers, TWITCH_MESSAGE_TYPE_HEADER)?,
        })
    }

    /// Verify the HMAC over `id ∥ timestamp ∥ body`.
    /// The timestamp's age is not checked; retries keep the original one.
    pub fn verify_signature(secret: &str, headers: &WebhookHeaders, body: &[u8]) -> AppResult<()> {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|_| AppError::Internal(anyhow::anyhow!("Failed to create HMAC")))?;

        mac.update(headers.message_id.as_bytes());
        mac.update(headers.timestamp.as_bytes());
        mac.update(body);

        mac.verify_slice(&headers.signature)
            .map_err(|_| AppError::BadRequest("Signature mismatch".to_string()))
    }

    /// Set the delivery marker. Returns `false` when the message was already seen.
    pub async fn claim_delivery(state: &AppState, message_id: &str) -> AppResult<bool> {
        with_timeout(
            "webhook dedup marker",
            state.config.upstream_timeout(),
            state
                .cache
                .set_nx_ex(&cache::webhook_event_key(message_id), "1", WEBHOOK_EVENT_TTL),
        )
        .await
    }

    /// Fold a `channel.update` notification into the broadcaster's live session
    pub async fn handle_notification(
        state: &AppState,
        payload: &NotificationPayload,
    ) -> AppResult<NotificationOutcome> {
        let timeout = state.config.upstream_timeout();
        let twitch_id = payload
            .subscription
            .broadcaster_id()
            .unwrap_or(&payload.event.broadcaster_user_id);
        if twitch_id.is_empty() {
            return Err(AppError::BadRequest("Missing broadcaster_user_id".to_string()));
        }

        let broadcaster = with_timeout(
            "broadcaster lookup",
            timeout,
            BroadcasterRepository::find_by_twitch_id(&state.db, twitch_id),
        )
        .await?
        .ok_or_else(|| {
            AppError::NotFound(format!(
                "Broadcaster {} ({})",
                twitch_id, payload.event.broadcaster_user_login
            ))
        })?;

        let session_id = with_timeout(
            "live state lookup",
            timeout,
            state.cache.get(&cache::live_key(&broadcaster.id)),
        )
        .await?;

        let Some(session_id) = session_id else {
            tracing::debug!(
                "Channel update for {} ignored; not live",
                broadcaster.twitch_login
            );
            return Ok(NotificationOutcome::NotLive);
        };

        let session = with_timeout(
            "session lookup",
            timeout,
            SessionRepository::find_by_id(&state.db, &session_id),
        )
        .await?
        .ok_or_else(|| {
            AppError::Internal(anyhow::anyhow!(
                "Live session {} of {} does not exist",
                session_id,
                broadcaster.twitch_login
            ))
        })?;

        let update = plan_session_update(session.last_category(), &payload.event, Utc::now());

        with_timeout(
            "session update",
            timeout,
            SessionRepository::apply_update(&state.db, &session.id, &update),
        )
        .await?;

        tracing::info!(
            "Updated session {} of {}: title={:?}, category_appended={}",
            session.id,
            broadcaster.twitch_login,
            update.title,
            update.push_category.is_some()
        );

        Ok(NotificationOutcome::Applied)
    }

    fn get_header(headers: &HeaderMap, name: &str) -> AppResult<String> {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
            .ok_or_else(|| AppError::BadRequest(format!("Missing header: {}", name)))
    }
}

/// Signature value Twitch would send for this delivery.
#[cfg(test)]
pub fn sign(secret: &str, message_id: &str, timestamp: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac key");
    mac.update(message_id.as_bytes());
    mac.update(timestamp.as_bytes());
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}
