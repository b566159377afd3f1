use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Cache error: {0}")]
    Cache(#[from] redis::RedisError),

    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Twitch API error: {0}")]
    TwitchApi(String),

    #[error("Emote provider error: {0}")]
    EmoteProvider(String),

    #[error("Timed out: {0}")]
    Timeout(String),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            AppError::Database(e) => {
                tracing::error!("Database error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "DATABASE_ERROR",
                    "A database error occurred".to_string(),
                )
            }
            AppError::Cache(e) => {
                tracing::error!("Cache error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "CACHE_ERROR",
                    "A cache error occurred".to_string(),
                )
            }
            AppError::Request(e) => {
                tracing::error!("HTTP request error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "EXTERNAL_REQUEST_FAILED",
                    "Failed to communicate with external service".to_string(),
                )
            }
            AppError::TwitchApi(msg) => {
                tracing::error!("Twitch API error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "TWITCH_API_ERROR",
                    msg.clone(),
                )
            }
            AppError::EmoteProvider(msg) => {
                tracing::error!("Emote provider error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "EMOTE_PROVIDER_ERROR",
                    msg.clone(),
                )
            }
            AppError::Timeout(what) => {
                tracing::error!("Timed out: {}", what);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "TIMEOUT",
                    "An upstream call timed out".to_string(),
                )
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal error occurred".to_string(),
                )
            }
        };

        let body = ErrorResponse {
            error: ErrorBody {
                code: code.to_string(),
                message,
            },
        };

        (status, Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// Run `fut` under a request-scoped deadline, mapping expiry to [`AppError::Timeout`].
pub async fn with_timeout<T, F>(what: &str, limit: std::time::Duration, fut: F) -> AppResult<T>
where
    F: std::future::Future<Output = AppResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(res) => res,
        Err(_) => Err(AppError::Timeout(what.to_string())),
    }
}
