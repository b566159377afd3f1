//! In-process [`SharedCache`] used by tests.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::SharedCache;
use crate::error::AppResult;

#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn live_value(map: &mut HashMap<String, (String, Instant)>, key: &str) -> Option<String> {
        match map.get(key) {
            Some((value, expires_at)) if *expires_at > Instant::now() => Some(value.clone()),
            Some(_) => {
                map.remove(key);
                None
            }
            None => None,
        }
    }

    fn try_set_nx(
        map: &mut HashMap<String, (String, Instant)>,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> bool {
        if Self::live_value(map, key).is_some() {
            return false;
        }
        map.insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        true
    }
}

#[async_trait]
impl SharedCache for MemoryCache {
    async fn get(&self, key: &str) -> AppResult<Option<String>> {
        Ok(Self::live_value(&mut self.entries.lock(), key))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> AppResult<()> {
        self.entries
            .lock()
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> AppResult<bool> {
        Ok(Self::try_set_nx(&mut self.entries.lock(), key, value, ttl))
    }

    async fn set_nx_then_get(
        &self,
        marker_key: &str,
        ttl: Duration,
        get_key: &str,
    ) -> AppResult<(bool, Option<String>)> {
        let mut map = self.entries.lock();
        let set = Self::try_set_nx(&mut map, marker_key, "1", ttl);
        Ok((set, Self::live_value(&mut map, get_key)))
    }

    async fn del(&self, key: &str) -> AppResult<()> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_nx_only_succeeds_once() {
        let cache = MemoryCache::new();
        assert!(cache.set_nx_ex("k", "1", Duration::from_secs(30)).await.unwrap());
        assert!(!cache.set_nx_ex("k", "1", Duration::from_secs(30)).await.unwrap());
    }

    #[tokio::test]
    async fn expired_entries_are_invisible() {
        let cache = MemoryCache::new();
        cache.set_ex("k", "v", Duration::from_millis(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(cache.get("k").await.unwrap(), None);
        assert!(cache.set_nx_ex("k", "1", Duration::from_secs(1)).await.unwrap());
    }
}
