use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod cache;
mod config;
mod db;
mod error;
mod routes;
mod services;
#[cfg(test)]
mod test_support;

use cache::{RedisCache, SharedCache};
use config::Config;
use services::{auth::AppTokenProvider, emotes::EmoteResolver, init, twitch::TwitchClient};

pub struct AppState {
    pub db: sqlx::SqlitePool,
    pub config: Config,
    pub cache: Arc<dyn SharedCache>,
    pub twitch: TwitchClient,
    pub emotes: EmoteResolver,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vod_ingest=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!("Starting VOD ingest service");

    let pool = init::init_db(&config).await?;

    tracing::info!("Connecting to Redis");
    let cache: Arc<dyn SharedCache> = Arc::new(RedisCache::connect(&config.redis.url).await?);

    let http_client = reqwest::Client::builder()
        .timeout(config.upstream_timeout())
        .build()?;
    let tokens = AppTokenProvider::new(http_client.clone(), cache.clone(), &config.twitch);

    let app_state = Arc::new(AppState {
        db: pool,
        twitch: TwitchClient::new(http_client.clone(), &config.twitch.api_url, tokens),
        emotes: EmoteResolver::new(http_client, cache.clone(), &config.emotes),
        cache,
        config: config.clone(),
    });

    // Create shutdown notifier for background workers and std threads
    let (shutdown_tx, _shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);
    let thread_shutdown = Arc::new(AtomicBool::new(false));

    // Spawn background workers (returns JoinHandles so we can await shutdown)
    let bg_handles = init::spawn_background_workers(app_state.clone(), shutdown_tx.clone()).await?;

    // Webhooks limiter and its storage cleanup thread
    let (webhooks, webhooks_cleaner) =
        routes::webhooks::rate_limited_router(&config.rate_limit, thread_shutdown.clone())?;

    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        // Twitch EventSub callback
        .merge(webhooks)
        .with_state(app_state.clone())
        .layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", config.server.host, config.server.port);
    tracing::info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;

    let shutdown_tx_clone = shutdown_tx.clone();
    let thread_shutdown_clone = thread_shutdown.clone();

    // In-flight requests complete before `serve` returns.
    let signal_fut = async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = ctrl_c => {},
                        _ = term.recv() => {},
                    }
                }
                Err(e) => {
                    tracing::warn!("Failed to bind SIGTERM, only Ctrl+C stops the server: {}", e);
                    let _ = ctrl_c.await;
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }

        tracing::info!("Shutdown signal received, notifying background workers and threads");
        let _ = shutdown_tx_clone.send(());
        thread_shutdown_clone.store(true, Ordering::SeqCst);
    };

    if let Err(e) = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(signal_fut)
    .await
    {
        tracing::error!("Server error: {}", e);
        let _ = shutdown_tx.send(());
        thread_shutdown.store(true, Ordering::SeqCst);
    }

    // Give background workers some time to finish their work.
    let shutdown_wait = Duration::from_secs(15);
    tracing::info!(
        "Waiting up to {}s for background workers to exit",
        shutdown_wait.as_secs()
    );

    let bg_wait = async {
        for h in bg_handles {
            let _ = h.await;
        }
    };
    let _ = tokio::time::timeout(shutdown_wait, bg_wait).await;

    if let Err(e) = webhooks_cleaner.join() {
        tracing::warn!("Webhooks cleanup thread join failed: {:?}", e);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
