use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};
use crate::services::auth::AppTokenProvider;
use crate::services::subscriptions::SubscriptionApi;

// ============================================================================
// EventSub Types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventSubCondition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broadcaster_user_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventSubTransport {
    pub method: String,
    #[serde(default)]
    pub callback: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventSubSubscription {
    pub id: String,
    pub status: String,
    #[serde(rename = "type")]
    pub subscription_type: String,
    pub version: String,
    pub condition: EventSubCondition,
    pub transport: EventSubTransport,
}

impl EventSubSubscription {
    pub fn broadcaster_id(&self) -> Option<&str> {
        self.condition.broadcaster_user_id.as_deref()
    }
}

#[derive(Debug, Serialize)]
pub struct CreateEventSubRequest {
    #[serde(rename = "type")]
    pub subscription_type: String,
    pub version: String,
    pub condition: EventSubCondition,
    pub transport: EventSubTransport,
}

#[derive(Debug, Default, Deserialize)]
pub struct Pagination {
    #[serde(default)]
    pub cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListEventSubResponse {
    pub data: Vec<EventSubSubscription>,
    #[serde(default)]
    pub pagination: Pagination,
}

/// One page of subscriptions and the cursor of the next page, if any.
#[derive(Debug)]
pub struct SubscriptionPage {
    pub subscriptions: Vec<EventSubSubscription>,
    pub cursor: Option<String>,
}

// ============================================================================
// Helix client
// ============================================================================

#[derive(Clone)]
pub struct TwitchClient {
    client: Client,
    api_url: String,
    tokens: AppTokenProvider,
}

impl TwitchClient {
    pub fn new(client: Client, api_url: &str, tokens: AppTokenProvider) -> Self {
        Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            tokens,
        }
    }

    /// Send a request, retrying 429 and 5xx responses and network errors with
    /// exponential backoff. Other statuses are returned to the caller.
    async fn send_with_backoff<F>(&self, make_request: F) -> AppResult<reqwest::Response>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        const MAX_RETRIES: usize = 3;
        let mut backoff_secs: u64 = 1;
        let max_backoff_secs: u64 = 16;

        for attempt in 0..MAX_RETRIES {
            match (make_request)().send().await {
                Ok(resp) => {
                    if resp.status() == StatusCode::TOO_MANY_REQUESTS
                        || resp.status().is_server_error()
                    {
                        let wait_secs = resp
                            .headers()
                            .get("retry-after")
                            .and_then(|h| h.to_str().ok())
                            .and_then(|s| s.parse::<u64>().ok())
                            .unwrap_or(backoff_secs)
                            .min(max_backoff_secs);

                        tracing::warn!(
                            "Transient Twitch error (status: {}). Retrying in {}s (attempt {}/{})",
                            resp.status(),
                            wait_secs,
                            attempt + 1,
                            MAX_RETRIES
                        );

                        if attempt + 1 >= MAX_RETRIES {
                            let err_text = resp.text().await.unwrap_or_default();
                            return Err(AppError::TwitchApi(format!(
                                "Failed after {} attempts: {}",
                                attempt + 1,
                                err_text
                            )));
                        }

                        tokio::time::sleep(Duration::from_secs(wait_secs)).await;
                        backoff_secs = std::cmp::min(backoff_secs * 2, max_backoff_secs);
                        continue;
                    }

                    return Ok(resp);
                }
                Err(e) => {
                    if attempt + 1 >= MAX_RETRIES {
                        return Err(e.into());
                    }
                    tracing::warn!(
                        "HTTP request failed: {}. Retrying in {}s (attempt {}/{})",
                        e,
                        backoff_secs,
                        attempt + 1,
                        MAX_RETRIES
                    );
                    tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
                    backoff_secs = std::cmp::min(backoff_secs * 2, max_backoff_secs);
                }
            }
        }

        Err(AppError::TwitchApi(
            "Exceeded Twitch retry attempts".to_string(),
        ))
    }

    /// Run a request that needs the app token. A 401 drops the cached token
    /// and the request is retried once with a fresh one.
    async fn send_app_request_with_token<F>(&self, make_request: F) -> AppResult<reqwest::Response>
    where
        F: Fn(&str) -> reqwest::RequestBuilder,
    {
        let mut refreshed_token = false;
        loop {
            let token = self.tokens.get_token().await?;
            let response = self.send_with_backoff(|| make_request(&token)).await?;

            if response.status() != StatusCode::UNAUTHORIZED {
                return Ok(response);
            }

            if refreshed_token {
                let error_text = response.text().await.unwrap_or_default();
                return Err(AppError::TwitchApi(format!(
                    "Unauthorized Twitch app request: {}",
                    error_text
                )));
            }

            tracing::warn!("Unauthorized Twitch app request. Refreshing token and retrying.");
            self.tokens.invalidate().await;
            refreshed_token = true;
        }
    }

    fn helix(&self, builder: reqwest::RequestBuilder, token: &str) -> reqwest::RequestBuilder {
        builder
            .header("Authorization", format!("Bearer {}", token))
            .header("Client-Id", self.tokens.client_id())
    }

    /// Fetch one page of subscriptions starting after `cursor`.
    pub async fn list_subscriptions_page(
        &self,
        cursor: Option<&str>,
    ) -> AppResult<SubscriptionPage> {
        let url = format!("{}/eventsub/subscriptions", self.api_url);
        let response = self
            .send_app_request_with_token(|token| {
                let mut req = self.client.get(&url);
                if let Some(after) = cursor {
                    req = req.query(&[("after", after)]);
                }
                self.helix(req, token)
            })
            .await?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(AppError::TwitchApi(format!(
                "Failed to list EventSub subscriptions: {}",
                error_text
            )));
        }

        let page: ListEventSubResponse = response.json().await.map_err(|e| {
            AppError::TwitchApi(format!("Failed to parse EventSub response: {}", e))
        })?;

        Ok(SubscriptionPage {
            subscriptions: page.data,
            cursor: page.pagination.cursor.filter(|c| !c.is_empty()),
        })
    }

    pub async fn create_eventsub_subscription(
        &self,
        subscription_type: &str,
        version: &str,
        broadcaster_user_id: &str,
        callback: &str,
        secret: &str,
    ) -> AppResult<EventSubSubscription> {
        let request = CreateEventSubRequest {
            subscription_type: subscription_type.to_string(),
            version: version.to_string(),
            condition: EventSubCondition {
                broadcaster_user_id: Some(broadcaster_user_id.to_string()),
            },
            transport: EventSubTransport {
                method: "webhook".to_string(),
                callback: Some(callback.to_string()),
                secret: Some(secret.to_string()),
            },
        };

        let url = format!("{}/eventsub/subscriptions", self.api_url);
        let response = self
            .send_app_request_with_token(|token| {
                self.helix(self.client.post(&url), token).json(&request)
            })
            .await?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(AppError::TwitchApi(format!(
                "Failed to create EventSub subscription: {}",
                error_text
            )));
        }

        let created: ListEventSubResponse = response.json().await.map_err(|e| {
            AppError::TwitchApi(format!("Failed to parse EventSub response: {}", e))
        })?;

        created
            .data
            .into_iter()
            .next()
            .ok_or_else(|| AppError::TwitchApi("No subscription created".to_string()))
    }

    pub async fn delete_eventsub_subscription(&self, subscription_id: &str) -> AppResult<()> {
        let url = format!("{}/eventsub/subscriptions", self.api_url);
        let response = self
            .send_app_request_with_token(|token| {
                self.helix(self.client.delete(&url), token)
                    .query(&[("id", subscription_id)])
            })
            .await?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(AppError::TwitchApi(format!(
                "Failed to delete EventSub subscription: {}",
                error_text
            )));
        }

        Ok(())
    }
}

#[async_trait]
impl SubscriptionApi for TwitchClient {
    async fn list_page(&self, cursor: Option<&str>) -> AppResult<SubscriptionPage> {
        self.list_subscriptions_page(cursor).await
    }

    async fn create(&self, broadcaster_user_id: &str, callback: &str, secret: &str) -> AppResult<()> {
        self.create_eventsub_subscription("channel.update", "1", broadcaster_user_id, callback, secret)
            .await
            .map(|_| ())
    }

    async fn delete(&self, subscription_id: &str) -> AppResult<()> {
        self.delete_eventsub_subscription(subscription_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory::MemoryCache;
    use crate::cache::SharedCache;
    use crate::config::Config;
    use crate::services::auth::APP_TOKEN_KEY;
    use crate::test_support::spawn_upstream;
    use axum::extract::Query;
    use axum::http::{HeaderMap, StatusCode as AxumStatus};
    use axum::response::IntoResponse;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    async fn client(base: &str, cache: Arc<dyn SharedCache>) -> TwitchClient {
        let mut twitch = Config::default().twitch;
        twitch.auth_url = base.to_string();
        twitch.api_url = base.to_string();
        twitch.client_id = "cid".to_string();
        let http = Client::new();
        let tokens = AppTokenProvider::new(http.clone(), cache, &twitch);
        TwitchClient::new(http, &twitch.api_url, tokens)
    }

    fn sub(id: &str, broadcaster: &str) -> serde_json::Value {
        serde_json::json!({
            "id": id,
            "status": "enabled",
            "type": "channel.update",
            "version": "1",
            "condition": { "broadcaster_user_id": broadcaster },
            "transport": { "method": "webhook", "callback": "https://example.invalid/webhook" },
            "created_at": "2024-01-01T00:00:00Z",
            "cost": 0
        })
    }

    #[tokio::test]
    async fn pages_follow_the_cursor() {
        let router = Router::new().route(
            "/eventsub/subscriptions",
            get(|Query(q): Query<HashMap<String, String>>| async move {
                match q.get("after").map(String::as_str) {
                    None => Json(serde_json::json!({
                        "data": [sub("s1", "1")],
                        "pagination": { "cursor": "page-2" }
                    })),
                    Some("page-2") => Json(serde_json::json!({
                        "data": [sub("s2", "2")],
                        "pagination": {}
                    })),
                    Some(_) => Json(serde_json::json!({ "data": [], "pagination": {} })),
                }
            }),
        );
        let base = spawn_upstream(router).await;
        let cache = Arc::new(MemoryCache::new());
        cache
            .set_ex(APP_TOKEN_KEY, "tok", std::time::Duration::from_secs(60))
            .await
            .unwrap();
        let twitch = client(&base, cache).await;

        let first = twitch.list_subscriptions_page(None).await.unwrap();
        assert_eq!(first.subscriptions[0].id, "s1");
        assert_eq!(first.cursor.as_deref(), Some("page-2"));

        let second = twitch.list_subscriptions_page(Some("page-2")).await.unwrap();
        assert_eq!(second.subscriptions[0].broadcaster_id(), Some("2"));
        assert!(second.cursor.is_none());
    }

    #[tokio::test]
    async fn unauthorized_refreshes_token_once() {
        let token_hits = Arc::new(AtomicUsize::new(0));
        let counter = token_hits.clone();
        let router = Router::new()
            .route(
                "/token",
                post(move || {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Json(serde_json::json!({ "access_token": "good", "expires_in": 60 }))
                    }
                }),
            )
            .route(
                "/eventsub/subscriptions",
                get(|headers: HeaderMap| async move {
                    let auth = headers
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    if auth == "Bearer good" {
                        Json(serde_json::json!({ "data": [], "pagination": {} })).into_response()
                    } else {
                        AxumStatus::UNAUTHORIZED.into_response()
                    }
                }),
            );
        let base = spawn_upstream(router).await;
        let cache = Arc::new(MemoryCache::new());
        cache
            .set_ex(APP_TOKEN_KEY, "stale", std::time::Duration::from_secs(60))
            .await
            .unwrap();
        let twitch = client(&base, cache.clone()).await;

        let page = twitch.list_subscriptions_page(None).await.unwrap();
        assert!(page.subscriptions.is_empty());
        assert_eq!(token_hits.load(Ordering::SeqCst), 1);
        assert_eq!(
            cache.get(APP_TOKEN_KEY).await.unwrap(),
            Some("good".to_string())
        );
    }

    #[tokio::test]
    async fn create_sends_channel_update_webhook() {
        let router = Router::new().route(
            "/eventsub/subscriptions",
            post(|Json(body): Json<serde_json::Value>| async move {
                assert_eq!(body["type"], "channel.update");
                assert_eq!(body["version"], "1");
                assert_eq!(body["condition"]["broadcaster_user_id"], "42");
                assert_eq!(body["transport"]["method"], "webhook");
                assert_eq!(body["transport"]["secret"], "s3cret");
                (
                    AxumStatus::ACCEPTED,
                    Json(serde_json::json!({ "data": [sub("new", "42")] })),
                )
            }),
        );
        let base = spawn_upstream(router).await;
        let cache = Arc::new(MemoryCache::new());
        cache
            .set_ex(APP_TOKEN_KEY, "tok", std::time::Duration::from_secs(60))
            .await
            .unwrap();
        let twitch = client(&base, cache).await;

        SubscriptionApi::create(&twitch, "42", "https://example.invalid/webhook", "s3cret")
            .await
            .unwrap();
    }
}
