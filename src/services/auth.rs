//! App-level bearer token for Helix calls, shared through the cache so every
//! instance reuses one token until it expires.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;

use crate::cache::SharedCache;
use crate::config::TwitchConfig;
use crate::error::{AppError, AppResult};

pub const APP_TOKEN_KEY: &str = "twitch:app-token";

#[derive(Debug, Deserialize)]
struct AppAccessTokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Clone)]
pub struct AppTokenProvider {
    client: Client,
    cache: Arc<dyn SharedCache>,
    auth_url: String,
    client_id: String,
    client_secret: String,
}

impl AppTokenProvider {
    pub fn new(client: Client, cache: Arc<dyn SharedCache>, twitch: &TwitchConfig) -> Self {
        Self {
            client,
            cache,
            auth_url: twitch.auth_url.trim_end_matches('/').to_string(),
            client_id: twitch.client_id.clone(),
            client_secret: twitch.client_secret.clone(),
        }
    }

    /// Return the cached app token, or fetch a new one with the client
    /// credentials grant and cache it for its lifetime.
    pub async fn get_token(&self) -> AppResult<String> {
        match self.cache.get(APP_TOKEN_KEY).await {
            Ok(Some(token)) => return Ok(token),
            Ok(None) => {}
            Err(e) => tracing::warn!("Failed to read cached app token: {}", e),
        }

        let response = self
            .client
            .post(format!("{}/token", self.auth_url))
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("grant_type", "client_credentials"),
            ])
            .send()
            .await
            .map_err(|e| AppError::TwitchApi(format!("Token request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(AppError::TwitchApi(format!(
                "Failed to get app access token ({}): {}",
                status, error_text
            )));
        }

        let token_response: AppAccessTokenResponse = response
            .json()
            .await
            .map_err(|e| AppError::TwitchApi(format!("Failed to parse token response: {}", e)))?;

        let ttl = Duration::from_secs(token_response.expires_in.max(1));
        if let Err(e) = self
            .cache
            .set_ex(APP_TOKEN_KEY, &token_response.access_token, ttl)
            .await
        {
            tracing::warn!("Failed to cache app token: {}", e);
        }

        tracing::info!(
            "Fetched Twitch app access token; valid for {}s",
            token_response.expires_in
        );

        Ok(token_response.access_token)
    }

    /// Forget the cached token after the API rejected it.
    pub async fn invalidate(&self) {
        if let Err(e) = self.cache.del(APP_TOKEN_KEY).await {
            tracing::warn!("Failed to drop cached app token: {}", e);
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }
}
