use std::env;
use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub twitch: TwitchConfig,
    pub webhook: WebhookConfig,
    pub chat: ChatConfig,
    pub emotes: EmoteConfig,
    pub reconcile: ReconcileConfig,
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Upper bound for every outbound call to Twitch, Redis or the database.
    pub upstream_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TwitchConfig {
    pub client_id: String,
    pub client_secret: String,
    /// Base of the OAuth endpoints, e.g. `https://id.twitch.tv/oauth2`.
    pub auth_url: String,
    /// Base of the Helix API, e.g. `https://api.twitch.tv/helix`.
    pub api_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
    /// Public URL Twitch delivers EventSub notifications to (must end in `/webhook`).
    pub callback_url: String,
    /// Shared secret used both when registering subscriptions and verifying signatures.
    pub secret: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatConfig {
    pub url: String,
    pub refresh_interval_seconds: u64,
    /// Maximum number of chat events handled concurrently.
    pub max_in_flight: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmoteConfig {
    pub ffz_url: String,
    pub bttv_url: String,
    pub seventv_url: String,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconcileConfig {
    pub interval_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Allowed requests per second (per IP) for the webhook endpoint
    pub webhook_per_second: u32,
    /// Burst size for the webhook endpoint
    pub webhook_burst: u32,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let defaults = Config::default();

        Ok(Config {
            server: ServerConfig {
                host: env::var("HOST").unwrap_or(defaults.server.host),
                port: env::var("PORT")
                    .unwrap_or_else(|_| "8080".to_string())
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue("PORT".to_string()))?,
                upstream_timeout_seconds: parse_or("UPSTREAM_TIMEOUT_SECONDS", 10),
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").unwrap_or(defaults.database.url),
                max_connections: parse_or("DATABASE_MAX_CONNECTIONS", 5),
            },
            redis: RedisConfig {
                url: env::var("REDIS_URL").unwrap_or(defaults.redis.url),
            },
            twitch: TwitchConfig {
                client_id: env::var("TWITCH_CLIENT_ID")
                    .map_err(|_| ConfigError::MissingEnv("TWITCH_CLIENT_ID".to_string()))?,
                client_secret: env::var("TWITCH_CLIENT_SECRET")
                    .map_err(|_| ConfigError::MissingEnv("TWITCH_CLIENT_SECRET".to_string()))?,
                auth_url: env::var("TWITCH_AUTH_URL").unwrap_or(defaults.twitch.auth_url),
                api_url: env::var("TWITCH_API_URL").unwrap_or(defaults.twitch.api_url),
            },
            webhook: WebhookConfig {
                callback_url: env::var("TWITCH_WEBHOOK_CALLBACK_URL")
                    .unwrap_or(defaults.webhook.callback_url),
                secret: env::var("TWITCH_WEBHOOK_SECRET")
                    .map_err(|_| ConfigError::MissingEnv("TWITCH_WEBHOOK_SECRET".to_string()))?,
            },
            chat: ChatConfig {
                url: env::var("TWITCH_CHAT_URL").unwrap_or(defaults.chat.url),
                refresh_interval_seconds: parse_or("CHAT_REFRESH_INTERVAL_SECONDS", 30 * 60),
                max_in_flight: parse_or("CHAT_MAX_IN_FLIGHT", 64),
            },
            emotes: EmoteConfig {
                ffz_url: env::var("FFZ_API_URL").unwrap_or(defaults.emotes.ffz_url),
                bttv_url: env::var("BTTV_API_URL").unwrap_or(defaults.emotes.bttv_url),
                seventv_url: env::var("SEVENTV_API_URL").unwrap_or(defaults.emotes.seventv_url),
                timeout_seconds: parse_or("EMOTE_TIMEOUT_SECONDS", 5),
            },
            reconcile: ReconcileConfig {
                interval_seconds: parse_or("RECONCILE_INTERVAL_SECONDS", 30 * 60),
            },
            rate_limit: RateLimitConfig {
                webhook_per_second: parse_or("RATE_LIMIT_WEBHOOKS_PER_SECOND", 10),
                webhook_burst: parse_or("RATE_LIMIT_WEBHOOKS_BURST", 50),
            },
        })
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.server.upstream_timeout_seconds)
    }
}

fn parse_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnv(String),

    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
                upstream_timeout_seconds: 10,
            },
            database: DatabaseConfig {
                url: "sqlite://data/vods.db".to_string(),
                max_connections: 5,
            },
            redis: RedisConfig {
                url: "redis://127.0.0.1:6379".to_string(),
            },
            twitch: TwitchConfig {
                client_id: String::new(),
                client_secret: String::new(),
                auth_url: "https://id.twitch.tv/oauth2".to_string(),
                api_url: "https://api.twitch.tv/helix".to_string(),
            },
            webhook: WebhookConfig {
                callback_url: "http://localhost:8080/webhook".to_string(),
                secret: String::new(),
            },
            chat: ChatConfig {
                url: "wss://irc-ws.chat.twitch.tv:443".to_string(),
                refresh_interval_seconds: 30 * 60,
                max_in_flight: 64,
            },
            emotes: EmoteConfig {
                ffz_url: "https://api.frankerfacez.com".to_string(),
                bttv_url: "https://api.betterttv.net".to_string(),
                seventv_url: "https://7tv.io".to_string(),
                timeout_seconds: 5,
            },
            reconcile: ReconcileConfig {
                interval_seconds: 30 * 60,
            },
            rate_limit: RateLimitConfig {
                webhook_per_second: 10,
                webhook_burst: 50,
            },
        }
    }
}
