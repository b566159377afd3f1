//! Third-party emote catalogs (FFZ, BTTV, 7TV), cached per broadcaster.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::cache::SharedCache;
use crate::config::EmoteConfig;
use crate::error::{with_timeout, AppError, AppResult};

const EMOTES_TTL: Duration = Duration::from_secs(30 * 60);
const FAILED_FETCH_TTL: Duration = Duration::from_secs(30);

const FFZ_CDN_URL: &str = "https://cdn.frankerfacez.com/emote";
const BTTV_CDN_URL: &str = "https://cdn.betterttv.net/emote";
const SEVENTV_CDN_URL: &str = "https://cdn.7tv.app/emote";

/// 7TV active-emote flag marking a zero-width overlay.
const SEVENTV_ACTIVE_ZERO_WIDTH: u32 = 1 << 0;
/// 7TV emote-data flag marking a zero-width overlay.
const SEVENTV_DATA_ZERO_WIDTH: u32 = 1 << 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EmoteProvider {
    #[serde(rename = "TWITCH")]
    Twitch,
    #[serde(rename = "FFZ")]
    Ffz,
    #[serde(rename = "BTTV")]
    Bttv,
    #[serde(rename = "7TV")]
    SevenTv,
}

impl EmoteProvider {
    /// Providers whose catalogs are fetched, in merge order.
    pub const THIRD_PARTY: [EmoteProvider; 3] =
        [EmoteProvider::Ffz, EmoteProvider::Bttv, EmoteProvider::SevenTv];

    pub fn as_str(self) -> &'static str {
        match self {
            EmoteProvider::Twitch => "twitch",
            EmoteProvider::Ffz => "ffz",
            EmoteProvider::Bttv => "bttv",
            EmoteProvider::SevenTv => "7tv",
        }
    }
}

pub fn catalog_key(provider: EmoteProvider, broadcaster_twitch_id: &str) -> String {
    format!("emotes-cached:{}:{}", provider.as_str(), broadcaster_twitch_id)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Emote {
    pub id: String,
    pub name: String,
    pub urls: Vec<String>,
    #[serde(default)]
    pub zero_width: bool,
    pub provider: EmoteProvider,
}

// ============================================================================
// Provider payloads
// ============================================================================

#[derive(Debug, Default, Deserialize)]
struct FfzRoom {
    #[serde(default)]
    sets: std::collections::BTreeMap<String, FfzEmoteSet>,
}

#[derive(Debug, Deserialize)]
struct FfzEmoteSet {
    #[serde(default)]
    emoticons: Vec<FfzEmote>,
}

#[derive(Debug, Deserialize)]
struct FfzEmote {
    id: u64,
    name: String,
}

#[derive(Debug, Deserialize)]
struct BttvEmote {
    id: String,
    code: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BttvChannel {
    #[serde(default)]
    channel_emotes: Vec<BttvEmote>,
    #[serde(default)]
    shared_emotes: Vec<BttvEmote>,
}

#[derive(Debug, Default, Deserialize)]
struct SevenTvEmoteSet {
    #[serde(default)]
    emotes: Vec<SevenTvActiveEmote>,
}

#[derive(Debug, Deserialize)]
struct SevenTvActiveEmote {
    id: String,
    name: String,
    #[serde(default)]
    flags: u32,
    #[serde(default)]
    data: Option<SevenTvEmoteData>,
}

#[derive(Debug, Deserialize)]
struct SevenTvEmoteData {
    #[serde(default)]
    flags: u32,
}

#[derive(Debug, Default, Deserialize)]
struct SevenTvUser {
    #[serde(default)]
    emote_set: Option<SevenTvEmoteSet>,
}

fn ffz_emotes(room: FfzRoom) -> impl Iterator<Item = Emote> {
    room.sets
        .into_values()
        .flat_map(|set| set.emoticons)
        .map(|e| Emote {
            id: e.id.to_string(),
            urls: ["1", "2", "4"]
                .iter()
                .map(|scale| format!("{}/{}/{}", FFZ_CDN_URL, e.id, scale))
                .collect(),
            name: e.name,
            zero_width: false,
            provider: EmoteProvider::Ffz,
        })
}

fn bttv_emote(e: BttvEmote) -> Emote {
    Emote {
        urls: ["1x", "2x", "3x"]
            .iter()
            .map(|scale| format!("{}/{}/{}", BTTV_CDN_URL, e.id, scale))
            .collect(),
        id: e.id,
        name: e.code,
        zero_width: false,
        provider: EmoteProvider::Bttv,
    }
}

fn seventv_emote(e: SevenTvActiveEmote) -> Emote {
    let data_flags = e.data.as_ref().map(|d| d.flags).unwrap_or(0);
    Emote {
        urls: ["1x", "2x", "3x", "4x"]
            .iter()
            .map(|scale| format!("{}/{}/{}.webp", SEVENTV_CDN_URL, e.id, scale))
            .collect(),
        zero_width: e.flags & SEVENTV_ACTIVE_ZERO_WIDTH != 0
            || data_flags & SEVENTV_DATA_ZERO_WIDTH != 0,
        id: e.id,
        name: e.name,
        provider: EmoteProvider::SevenTv,
    }
}

// ============================================================================
// Resolver
// ============================================================================

#[derive(Clone)]
pub struct EmoteResolver {
    client: Client,
    cache: Arc<dyn SharedCache>,
    ffz_url: String,
    bttv_url: String,
    seventv_url: String,
    timeout: Duration,
}

impl EmoteResolver {
    pub fn new(client: Client, cache: Arc<dyn SharedCache>, config: &EmoteConfig) -> Self {
        Self {
            client,
            cache,
            ffz_url: config.ffz_url.trim_end_matches('/').to_string(),
            bttv_url: config.bttv_url.trim_end_matches('/').to_string(),
            seventv_url: config.seventv_url.trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(config.timeout_seconds),
        }
    }

    /// Global then channel emotes of `provider` for a broadcaster.
    ///
    /// A failed fetch leaves a short-lived empty placeholder behind so a
    /// flapping provider is not hammered by every chat message.
    pub async fn resolve(
        &self,
        provider: EmoteProvider,
        broadcaster_twitch_id: &str,
    ) -> AppResult<Vec<Emote>> {
        if provider == EmoteProvider::Twitch {
            return Ok(Vec::new());
        }

        let key = catalog_key(provider, broadcaster_twitch_id);
        match with_timeout("emote cache read", self.timeout, self.cache.get(&key)).await {
            Ok(Some(raw)) => match serde_json::from_str::<Vec<Emote>>(&raw) {
                Ok(emotes) => return Ok(emotes),
                Err(e) => tracing::warn!("Bad cached {} emotes: {}", provider.as_str(), e),
            },
            Ok(None) => {}
            Err(e) => tracing::warn!("Failed to read cached {} emotes: {}", provider.as_str(), e),
        }

        let fetched = with_timeout(
            provider.as_str(),
            self.timeout,
            self.fetch(provider, broadcaster_twitch_id),
        )
        .await;

        let emotes = match fetched {
            Ok(emotes) => emotes,
            Err(e) => {
                let placeholder = with_timeout(
                    "emote cache write",
                    self.timeout,
                    self.cache.set_nx_ex(&key, "[]", FAILED_FETCH_TTL),
                );
                if let Err(cache_err) = placeholder.await {
                    tracing::warn!("Failed to cache empty {} emotes: {}", provider.as_str(), cache_err);
                }
                return Err(e);
            }
        };

        match serde_json::to_string(&emotes) {
            Ok(data) => {
                let stored = with_timeout(
                    "emote cache write",
                    self.timeout,
                    self.cache.set_ex(&key, &data, EMOTES_TTL),
                );
                if let Err(e) = stored.await {
                    tracing::warn!("Failed to set {} emote cache: {}", provider.as_str(), e);
                }
            }
            Err(e) => tracing::warn!("Failed to encode {} emotes: {}", provider.as_str(), e),
        }

        Ok(emotes)
    }

    async fn fetch(&self, provider: EmoteProvider, id: &str) -> AppResult<Vec<Emote>> {
        let mut emotes = Vec::new();
        match provider {
            EmoteProvider::Ffz => {
                let global: FfzRoom = self
                    .get_json(&format!("{}/v1/set/global", self.ffz_url))
                    .await?
                    .unwrap_or_default();
                let channel: FfzRoom = self
                    .get_json(&format!("{}/v1/room/id/{}", self.ffz_url, id))
                    .await?
                    .unwrap_or_default();
                emotes.extend(ffz_emotes(global));
                emotes.extend(ffz_emotes(channel));
            }
            EmoteProvider::Bttv => {
                let global: Vec<BttvEmote> = self
                    .get_json(&format!("{}/3/cached/emotes/global", self.bttv_url))
                    .await?
                    .unwrap_or_default();
                let channel: BttvChannel = self
                    .get_json(&format!("{}/3/cached/users/twitch/{}", self.bttv_url, id))
                    .await?
                    .unwrap_or_default();
                emotes.extend(global.into_iter().map(bttv_emote));
                emotes.extend(channel.channel_emotes.into_iter().map(bttv_emote));
                emotes.extend(channel.shared_emotes.into_iter().map(bttv_emote));
            }
            EmoteProvider::SevenTv => {
                let global: SevenTvEmoteSet = self
                    .get_json(&format!("{}/v3/emote-sets/global", self.seventv_url))
                    .await?
                    .unwrap_or_default();
                let channel: SevenTvUser = self
                    .get_json(&format!("{}/v3/users/twitch/{}", self.seventv_url, id))
                    .await?
                    .unwrap_or_default();
                emotes.extend(global.emotes.into_iter().map(seventv_emote));
                if let Some(set) = channel.emote_set {
                    emotes.extend(set.emotes.into_iter().map(seventv_emote));
                }
            }
            EmoteProvider::Twitch => {}
        }

        Ok(emotes)
    }

    /// GET a JSON document; a 404 means the provider knows nothing about it.
    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> AppResult<Option<T>> {
        let response = self.client.get(url).send().await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        if !response.status().is_success() {
            return Err(AppError::EmoteProvider(format!(
                "{} returned {}",
                url,
                response.status()
            )));
        }

        response
            .json()
            .await
            .map(Some)
            .map_err(|e| AppError::EmoteProvider(format!("Failed to parse {}: {}", url, e)))
    }
}
