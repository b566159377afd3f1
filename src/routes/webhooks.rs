use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::JoinHandle;
use std::time::Duration;

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use tower_governor::governor::GovernorConfigBuilder;
use tower_governor::key_extractor::SmartIpKeyExtractor;
use tower_governor::{GovernorError, GovernorLayer};

use crate::config::RateLimitConfig;
use crate::error::AppError;
use crate::services::webhooks::{NotificationOutcome, WebhookMessage, WebhookService};
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/webhook", post(handle_twitch_webhook))
}

/// The webhook router behind a per-client-IP limiter.
///
/// Also returns the thread that prunes the limiter's storage; it exits once
/// `stop` is set.
pub fn rate_limited_router(
    limits: &RateLimitConfig,
    stop: Arc<AtomicBool>,
) -> anyhow::Result<(Router<Arc<AppState>>, JoinHandle<()>)> {
    let mut builder = GovernorConfigBuilder::default().key_extractor(SmartIpKeyExtractor);
    builder.per_second(limits.webhook_per_second.into());
    builder.burst_size(limits.webhook_burst);
    builder.error_handler(rate_limit_response);
    let gov_conf = Arc::new(
        builder
            .finish()
            .ok_or_else(|| anyhow::anyhow!("Failed to build webhooks governor config"))?,
    );

    let cleaner = {
        let limiter = gov_conf.limiter().clone();
        let interval = Duration::from_secs(60);
        std::thread::spawn(move || {
            let tick = Duration::from_secs(1);
            loop {
                for _ in 0..interval.as_secs() {
                    if stop.load(Ordering::SeqCst) {
                        tracing::info!("Webhooks rate limiter cleanup thread exiting");
                        return;
                    }
                    std::thread::sleep(tick);
                }
                tracing::debug!("webhooks rate limiter size: {}", limiter.len());
                limiter.retain_recent();
            }
        })
    };

    let layer = GovernorLayer { config: gov_conf };
    Ok((router().layer(layer), cleaner))
}

fn rate_limit_response(error: GovernorError) -> http::Response<Body> {
    match error {
        GovernorError::TooManyRequests { wait_time, headers } => {
            // `wait_time` is provided as seconds
            let body = serde_json::json!({
                "error": {
                    "code": "RATE_LIMITED",
                    "message": "Rate limit exceeded",
                    "retry_after_seconds": wait_time
                }
            })
            .to_string();

            let mut resp = http::Response::new(Body::from(body));
            *resp.status_mut() = StatusCode::TOO_MANY_REQUESTS;
            resp.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );

            if let Some(hmap) = headers {
                for (name, value) in hmap.iter() {
                    resp.headers_mut().append(name.clone(), value.clone());
                }
            }

            resp.headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(wait_time));

            resp
        }
        GovernorError::UnableToExtractKey => {
            let mut resp = http::Response::new(Body::from(
                "Unable to determine client IP for rate limiting",
            ));
            *resp.status_mut() = StatusCode::BAD_REQUEST;
            resp
        }
        GovernorError::Other { code, msg, headers } => {
            let body = msg.unwrap_or_else(|| "Rate limiting error".to_string());
            let mut resp = http::Response::new(Body::from(body));
            let status =
                StatusCode::from_u16(code.as_u16()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            *resp.status_mut() = status;
            if let Some(hmap) = headers {
                for (name, value) in hmap.iter() {
                    resp.headers_mut().append(name.clone(), value.clone());
                }
            }
            resp
        }
    }
}

async fn handle_twitch_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let headers = WebhookService::extract_headers(&headers)?;

    WebhookService::verify_signature(&state.config.webhook.secret, &headers, &body)?;

    if !WebhookService::claim_delivery(&state, &headers.message_id).await? {
        tracing::debug!("Duplicate EventSub delivery {}", headers.message_id);
        return Ok(StatusCode::OK.into_response());
    }

    let message = WebhookMessage::parse(&headers.message_type, &body).map_err(|e| {
        tracing::error!(
            "Bad body from Twitch (message_id={}): {}",
            headers.message_id,
            e
        );
        e
    })?;

    match message {
        WebhookMessage::Verification(payload) => {
            tracing::info!(
                "Verifying EventSub subscription: id={}, type={}",
                payload.subscription.id,
                payload.subscription.subscription_type
            );
            Ok((
                StatusCode::OK,
                [(header::CONTENT_TYPE, "text/plain")],
                payload.challenge,
            )
                .into_response())
        }
        WebhookMessage::Notification(payload) => {
            match WebhookService::handle_notification(&state, &payload).await? {
                NotificationOutcome::Applied => Ok(StatusCode::NO_CONTENT.into_response()),
                NotificationOutcome::NotLive => Ok(StatusCode::OK.into_response()),
            }
        }
        WebhookMessage::Revocation(payload) => {
            tracing::warn!(
                "Subscription revoked: id={}, type={}, reason={}",
                payload.subscription.id,
                payload.subscription.subscription_type,
                payload.subscription.status
            );
            Ok(StatusCode::NO_CONTENT.into_response())
        }
        WebhookMessage::Unrecognized(message_type) => {
            tracing::warn!("Unknown message type: {}", message_type);
            Err(AppError::BadRequest(format!(
                "Unknown message type: {}",
                message_type
            )))
        }
    }
}
