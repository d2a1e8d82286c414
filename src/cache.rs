use moka::future::Cache;
use moka::Expiry;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cache_validator::ValidatedCacheEntry;
use crate::models::ProviderId;

/// (provider, normalized query). Adapters of the same provider share entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    provider: ProviderId,
    query: String,
}

impl CacheKey {
    pub fn new(provider: &ProviderId, query: &str) -> Self {
        Self {
            provider: provider.clone(),
            query: normalize_query(query),
        }
    }
}

/// Trim, lower-case and collapse inner whitespace.
pub fn normalize_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug)]
struct StoredResponse {
    entry: ValidatedCacheEntry,
    ttl: Duration,
}

/// Each entry expires after the TTL it was written with.
struct PerEntryTtl;

impl Expiry<CacheKey, Arc<StoredResponse>> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &CacheKey,
        value: &Arc<StoredResponse>,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &CacheKey,
        value: &Arc<StoredResponse>,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

/// Session-wide cache of provider responses.
///
/// A hit skips the provider call entirely, so it never touches the breaker or
/// the budget ledger. Concurrent writers for the same key are last-write-wins.
#[derive(Clone)]
pub struct ResponseCache {
    inner: Cache<CacheKey, Arc<StoredResponse>>,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
}

impl ResponseCache {
    pub fn new(max_capacity: u64) -> Self {
        Self {
            inner: Cache::builder()
                .max_capacity(max_capacity)
                .expire_after(PerEntryTtl)
                .build(),
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, provider: &ProviderId, query: &str) -> Option<T> {
        let key = CacheKey::new(provider, query);

        let Some(stored) = self.inner.get(&key).await else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        match stored.entry.open::<T>() {
            Some(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(provider = %provider, "Cache hit for {:?}", key.query);
                Some(value)
            }
            None => {
                tracing::warn!(provider = %provider, "Discarding corrupted cache entry");
                self.inner.invalidate(&key).await;
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub async fn put<T: Serialize>(&self, provider: &ProviderId, query: &str, response: &T, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }

        match ValidatedCacheEntry::seal(response) {
            Ok(entry) => {
                let key = CacheKey::new(provider, query);
                self.inner
                    .insert(key, Arc::new(StoredResponse { entry, ttl }))
                    .await;
            }
            Err(e) => {
                tracing::warn!(provider = %provider, "Failed to serialize response for cache: {}", e);
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hunter() -> ProviderId {
        ProviderId::from("hunter")
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let cache = ResponseCache::default();
        cache
            .put(&hunter(), "bluedoor.com", &vec!["owner@bluedoor.com"], Duration::from_secs(60))
            .await;

        let cached: Option<Vec<String>> = cache.get(&hunter(), "bluedoor.com").await;
        assert_eq!(cached, Some(vec!["owner@bluedoor.com".to_string()]));
        assert_eq!(cache.stats(), CacheStats { hits: 1, misses: 0 });
    }

    #[tokio::test]
    async fn test_keys_are_normalized() {
        let cache = ResponseCache::default();
        cache
            .put(&hunter(), "  BlueDoor.com ", &42u32, Duration::from_secs(60))
            .await;

        assert_eq!(cache.get::<u32>(&hunter(), "bluedoor.com").await, Some(42));
    }

    #[tokio::test]
    async fn test_entries_are_scoped_per_provider() {
        let cache = ResponseCache::default();
        cache
            .put(&hunter(), "bluedoor.com", &1u32, Duration::from_secs(60))
            .await;

        assert_eq!(
            cache.get::<u32>(&ProviderId::from("pattern"), "bluedoor.com").await,
            None
        );
    }

    #[tokio::test]
    async fn test_entries_expire_after_their_ttl() {
        let cache = ResponseCache::default();
        cache
            .put(&hunter(), "bluedoor.com", &1u32, Duration::from_millis(50))
            .await;
        cache
            .put(&hunter(), "other.com", &2u32, Duration::from_secs(60))
            .await;

        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(cache.get::<u32>(&hunter(), "bluedoor.com").await, None);
        assert_eq!(cache.get::<u32>(&hunter(), "other.com").await, Some(2));
    }

    #[test]
    fn test_normalize_query() {
        assert_eq!(normalize_query("  Blue   Door\tBakery "), "blue door bakery");
    }
}
