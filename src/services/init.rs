//! Initialization helpers for the application:
//! - database connection + migrations
//! - background worker spawn helpers

use std::{path::Path, sync::Arc, time::Duration};

use anyhow::Result;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::services::chat::{ChatIngest, ChatWorker, RoomDirectory};
use crate::services::subscriptions::{SubscriptionApi, SubscriptionReconciler};
use crate::AppState;

/// Redact potentially sensitive information from a database URL before logging.
///
/// Attempts to parse the URL and remove userinfo (username:password) components.
/// Falls back to removing everything before '@' or returning "(redacted)".
pub fn redact_db_url(db_url: &str) -> String {
    match url::Url::parse(db_url) {
        Ok(url) if !url.cannot_be_a_base() && url.host_str().is_some() => {
            let host = url.host_str().unwrap_or_default();
            let port_part = url.port().map(|p| format!(":{}", p)).unwrap_or_default();
            format!("{}://{}{}{}", url.scheme(), host, port_part, url.path())
        }
        // `user:pass@host` parses with `user` as the scheme, so it lands here too.
        _ => match db_url.find('@') {
            Some(at_pos) => format!("(redacted){}", &db_url[at_pos + 1..]),
            None => "(redacted)".to_string(),
        },
    }
}

/// Open the SQLite document store and run migrations.
///
/// The parent directory of the database file is created when missing.
pub async fn init_db(config: &Config) -> Result<sqlx::SqlitePool> {
    let db_url = &config.database.url;
    tracing::info!("Connecting to database: {}", redact_db_url(db_url));

    let db_path = db_url.strip_prefix("sqlite://").unwrap_or(db_url);
    let db_file_path = Path::new(db_path);

    if let Some(parent) = db_file_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to create database directory {}: {}",
                    parent.display(),
                    e
                )
            })?;
        }
    }

    let connect_options = sqlx::sqlite::SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true);

    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(config.database.max_connections)
        .acquire_timeout(config.upstream_timeout())
        .connect_with(connect_options)
        .await?;

    tracing::info!("Running database migrations");
    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(pool)
}

/// Spawn background workers:
/// - EventSub subscription reconciler (immediately, then periodically)
/// - chat ingest worker (connection, room refresh and dispatch tasks)
///
/// Each worker listens for a shutdown notification via `shutdown`. Fails if
/// the chat worker cannot read the broadcaster registry at startup.
pub async fn spawn_background_workers(
    state: Arc<AppState>,
    shutdown: broadcast::Sender<()>,
) -> Result<Vec<JoinHandle<()>>> {
    let mut handles = Vec::new();
    let timeout = state.config.upstream_timeout();

    // Chat first: its initial registry read aborts startup.
    {
        let ingest = Arc::new(ChatIngest::new(
            state.db.clone(),
            state.cache.clone(),
            state.emotes.clone(),
            Arc::new(RoomDirectory::default()),
            timeout,
        ));
        let worker = ChatWorker::new(state.db.clone(), ingest, &state.config.chat, timeout);
        let chat_handles = worker
            .start(&shutdown)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to start chat worker: {}", e))?;
        handles.extend(chat_handles);
    }

    // EventSub reconciler
    {
        let api: Arc<dyn SubscriptionApi> = Arc::new(state.twitch.clone());
        let reconciler = SubscriptionReconciler::new(
            api,
            state.db.clone(),
            state.config.webhook.callback_url.clone(),
            state.config.webhook.secret.clone(),
            timeout,
        );
        let interval = Duration::from_secs(state.config.reconcile.interval_seconds);
        handles.push(tokio::spawn(reconciler.run(interval, shutdown.subscribe())));
    }

    Ok(handles)
}
