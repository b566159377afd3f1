//! Test helpers: local upstream stand-ins and a wired application state.

use std::sync::Arc;

use axum::Router;
use sqlx::SqlitePool;
use tokio::net::TcpListener;

use crate::cache::{memory::MemoryCache, SharedCache};
use crate::config::Config;
use crate::services::auth::AppTokenProvider;
use crate::services::emotes::EmoteResolver;
use crate::services::twitch::TwitchClient;
use crate::AppState;

/// Serve `router` on an ephemeral loopback port and return its base URL.
pub async fn spawn_upstream(router: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");

    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("upstream server");
    });

    format!("http://{}", addr)
}

/// A base URL nothing listens on; requests fail immediately.
pub const DEAD_UPSTREAM: &str = "http://127.0.0.1:9";

pub const WEBHOOK_SECRET: &str = "s3cr3t-webhook-secret";

/// Application state over `pool` and `cache` with every upstream unreachable.
pub fn app_state(pool: SqlitePool, cache: Arc<MemoryCache>) -> Arc<AppState> {
    let mut config = Config::default();
    config.webhook.secret = WEBHOOK_SECRET.to_string();
    config.twitch.auth_url = DEAD_UPSTREAM.to_string();
    config.twitch.api_url = DEAD_UPSTREAM.to_string();
    config.emotes.ffz_url = DEAD_UPSTREAM.to_string();
    config.emotes.bttv_url = DEAD_UPSTREAM.to_string();
    config.emotes.seventv_url = DEAD_UPSTREAM.to_string();
    config.chat.url = DEAD_UPSTREAM.replacen("http", "ws", 1);

    let cache: Arc<dyn SharedCache> = cache;
    let client = reqwest::Client::new();
    let tokens = AppTokenProvider::new(client.clone(), cache.clone(), &config.twitch);

    Arc::new(AppState {
        db: pool,
        twitch: TwitchClient::new(client.clone(), &config.twitch.api_url, tokens),
        emotes: EmoteResolver::new(client, cache.clone(), &config.emotes),
        cache,
        config,
    })
}
