//! Per-channel "latest key" cache.
//!
//! Writers race to update it, so the only update on the hot path is [`set_if_after`], which keeps
//! the greatest key it has seen. The value never moves backwards except through `set_latest`
//! (an explicit reset) or `delete_cache`.
//!
//! [`set_if_after`]: LatestContentCache::set_if_after

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use chronohub_core::{ChannelConfig, ContentKey};
use chronohub_observability::metrics::{LATEST_CACHE_HITS_TOTAL, LATEST_CACHE_MISSES_TOTAL};

#[async_trait]
pub trait LatestContentCache: Send + Sync {
    /// Cached value, [`ContentKey::none`] for a channel known to be empty.
    async fn get_latest(&self, channel: &str) -> Option<ContentKey>;

    async fn get_latest_or(&self, channel: &str, default: ContentKey) -> ContentKey {
        self.get_latest(channel).await.unwrap_or(default)
    }

    /// Overwrites the cached value.
    async fn set_latest(&self, channel: &str, key: ContentKey);

    /// Stores `key` only if it is greater than the cached value. Returns whether it was stored.
    async fn set_if_after(&self, channel: &str, key: ContentKey) -> bool;

    async fn delete_cache(&self, channel: &str);
}

#[derive(Debug, Default)]
pub struct InMemoryLatestCache {
    latest: DashMap<String, ContentKey>,
}

impl InMemoryLatestCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LatestContentCache for InMemoryLatestCache {
    async fn get_latest(&self, channel: &str) -> Option<ContentKey> {
        self.latest.get(channel).map(|k| k.value().clone())
    }

    async fn set_latest(&self, channel: &str, key: ContentKey) {
        self.latest.insert(channel.to_string(), key);
    }

    async fn set_if_after(&self, channel: &str, key: ContentKey) -> bool {
        match self.latest.entry(channel.to_string()) {
            Entry::Occupied(mut entry) => {
                if key > *entry.get() {
                    entry.insert(key);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(key);
                true
            }
        }
    }

    async fn delete_cache(&self, channel: &str) {
        self.latest.remove(channel);
    }
}

/// What the cache says about a channel's latest item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CachedLatest {
    /// Nothing cached; ask the tiers.
    Missing,
    /// The channel is known to hold nothing.
    Empty,
    Key(ContentKey),
}

/// Reads the cached latest key for `config`'s channel.
///
/// A cached key older than the channel's retention is reported as [`CachedLatest::Empty`] and
/// the cache is reset to [`ContentKey::none`], rather than serving an item the channel no longer
/// retains.
pub async fn read_cached_latest(
    cache: &dyn LatestContentCache,
    config: &ChannelConfig,
    now: DateTime<Utc>,
) -> CachedLatest {
    let cached = match cache.get_latest(&config.name).await {
        None => {
            LATEST_CACHE_MISSES_TOTAL.inc();
            return CachedLatest::Missing;
        }
        Some(key) => key,
    };
    LATEST_CACHE_HITS_TOTAL.inc();

    if cached.is_none() {
        return CachedLatest::Empty;
    }
    if cached.time() < config.ttl_time(now) {
        debug!(channel = %config.name, key = %cached, "Cached latest is past retention, resetting");
        cache.set_latest(&config.name, ContentKey::none()).await;
        return CachedLatest::Empty;
    }
    CachedLatest::Key(cached)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use chronohub_core::time;

    fn key_at(offset_secs: i64, hash: &str) -> ContentKey {
        ContentKey::new(time::now() - Duration::seconds(offset_secs), hash)
    }

    #[tokio::test]
    async fn test_set_if_after_is_monotonic() {
        let cache = InMemoryLatestCache::new();
        let keys = [
            key_at(30, "b"),
            key_at(60, "a"),
            key_at(10, "c"),
            key_at(30, "z"),
            key_at(10, "b"),
        ];
        let mut max = ContentKey::none();
        for key in keys {
            max = max.max(key.clone());
            cache.set_if_after("orders", key).await;
            assert_eq!(cache.get_latest("orders").await, Some(max.clone()));
        }
        assert_eq!(max.hash(), "c");
    }

    #[tokio::test]
    async fn test_none_is_replaced_by_any_key() {
        let cache = InMemoryLatestCache::new();
        cache.set_latest("orders", ContentKey::none()).await;
        assert!(cache.set_if_after("orders", key_at(5, "a")).await);
        assert!(!cache.set_if_after("orders", ContentKey::none()).await);
    }

    #[tokio::test]
    async fn test_get_latest_or_default() {
        let cache = InMemoryLatestCache::new();
        let default = key_at(0, "default");
        assert_eq!(cache.get_latest_or("orders", default.clone()).await, default);
        cache.delete_cache("orders").await;
        assert!(cache.get_latest("orders").await.is_none());
    }

    #[tokio::test]
    async fn test_expired_latest_resets_to_none() {
        let cache = InMemoryLatestCache::new();
        let config = ChannelConfig::new("orders").with_ttl_days(1);
        let now = time::now();

        cache.set_latest("orders", key_at(60, "fresh")).await;
        assert!(matches!(
            read_cached_latest(&cache, &config, now).await,
            CachedLatest::Key(_)
        ));

        cache
            .set_latest("orders", ContentKey::new(now - Duration::days(2), "old"))
            .await;
        assert_eq!(read_cached_latest(&cache, &config, now).await, CachedLatest::Empty);
        assert_eq!(cache.get_latest("orders").await, Some(ContentKey::none()));

        cache.delete_cache("orders").await;
        assert_eq!(read_cached_latest(&cache, &config, now).await, CachedLatest::Missing);
    }
}
