//! Preview memoisation.
//!
//! Previews are keyed by `(model, query_text, preview_token_cap)` so a
//! repeated race within the TTL reuses the earlier preview instead of
//! burning backend tokens. Backed by an in-memory map, or by Redis when
//! the `redis-backend` feature is enabled. Any backend failure degrades
//! silently to a cache miss — the cache is never load-bearing for
//! correctness.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;
#[cfg(feature = "redis-backend")]
use tracing::warn;

use crate::ModelId;

/// Default entry TTL in seconds.
pub const DEFAULT_TTL_SECS: u64 = 600;

/// Cached preview payload: the generated text and the tokens it consumed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedPreview {
    pub text: String,
    pub tokens: u64,
}

/// Cache key for one `(model, query, cap)` triple.
pub fn preview_key(model: &ModelId, query_text: &str, token_cap: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(model.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(query_text.as_bytes());
    hasher.update([0u8]);
    hasher.update(token_cap.to_le_bytes());
    format!("preview:{:x}", hasher.finalize())
}

#[derive(Clone)]
struct MemoryEntry {
    value: CachedPreview,
    expires_at: SystemTime,
}

struct MemoryCache {
    store: DashMap<String, MemoryEntry>,
    max_entries: usize,
}

#[cfg(feature = "redis-backend")]
struct RedisCache {
    client: redis::Client,
}

#[derive(Clone)]
enum CacheBackend {
    Memory(Arc<MemoryCache>),
    #[cfg(feature = "redis-backend")]
    Redis(Arc<RedisCache>),
}

/// Preview cache with in-memory or Redis backing.
#[derive(Clone)]
pub struct PreviewCache {
    backend: CacheBackend,
}

impl PreviewCache {
    /// In-memory cache bounded to `max_entries` (FIFO eviction).
    pub fn new_memory(max_entries: usize) -> Self {
        Self {
            backend: CacheBackend::Memory(Arc::new(MemoryCache {
                store: DashMap::new(),
                max_entries: max_entries.max(1),
            })),
        }
    }

    /// Redis-backed cache. Verifies connectivity with a PING.
    #[cfg(feature = "redis-backend")]
    pub async fn new_redis(redis_url: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(redis_url)?;
        let mut conn = client.get_multiplexed_async_connection().await?;
        redis::cmd("PING").query_async::<()>(&mut conn).await?;
        Ok(Self {
            backend: CacheBackend::Redis(Arc::new(RedisCache { client })),
        })
    }

    /// Look up a preview; expired entries count as misses.
    pub async fn get(&self, key: &str) -> Option<CachedPreview> {
        match &self.backend {
            CacheBackend::Memory(cache) => {
                if let Some(entry) = cache.store.get(key) {
                    if entry.expires_at > SystemTime::now() {
                        debug!(key, "preview cache hit");
                        return Some(entry.value.clone());
                    }
                    drop(entry);
                    cache.store.remove(key);
                }
                None
            }
            #[cfg(feature = "redis-backend")]
            CacheBackend::Redis(cache) => match cache.get(key).await {
                Ok(Some(raw)) => match serde_json::from_str::<CachedPreview>(&raw) {
                    Ok(value) => {
                        debug!(key, "preview cache hit (redis)");
                        Some(value)
                    }
                    Err(e) => {
                        warn!(key, error = %e, "preview cache payload malformed");
                        None
                    }
                },
                Ok(None) => None,
                Err(e) => {
                    warn!(key, error = %e, "preview cache get failed");
                    None
                }
            },
        }
    }

    /// Store a preview with the given TTL. Empty previews are not cached.
    pub async fn put(&self, key: &str, value: &CachedPreview, ttl_secs: u64) {
        if value.text.is_empty() || value.tokens == 0 {
            return;
        }
        match &self.backend {
            CacheBackend::Memory(cache) => {
                if cache.store.len() >= cache.max_entries {
                    if let Some(first_key) = cache.store.iter().next().map(|e| e.key().clone()) {
                        cache.store.remove(&first_key);
                    }
                }
                cache.store.insert(
                    key.to_string(),
                    MemoryEntry {
                        value: value.clone(),
                        expires_at: SystemTime::now() + Duration::from_secs(ttl_secs),
                    },
                );
            }
            #[cfg(feature = "redis-backend")]
            CacheBackend::Redis(cache) => {
                let payload = match serde_json::to_string(value) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(key, error = %e, "preview cache encode failed");
                        return;
                    }
                };
                if let Err(e) = cache.set(key, &payload, ttl_secs).await {
                    warn!(key, error = %e, "preview cache put failed");
                }
            }
        }
    }

    /// Number of live entries (memory backend only; Redis reports 0).
    pub fn len(&self) -> usize {
        match &self.backend {
            CacheBackend::Memory(cache) => cache.store.len(),
            #[cfg(feature = "redis-backend")]
            CacheBackend::Redis(_) => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(feature = "redis-backend")]
impl RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, redis::RedisError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        redis::cmd("GET").arg(key).query_async(&mut conn).await
    }

    async fn set(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), redis::RedisError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        redis::cmd("SETEX")
            .arg(key)
            .arg(ttl_secs)
            .arg(value)
            .query_async(&mut conn)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn preview(text: &str, tokens: u64) -> CachedPreview {
        CachedPreview {
            text: text.to_string(),
            tokens,
        }
    }

    #[test]
    fn test_preview_key_deterministic() {
        let m = ModelId::new("gpt-a");
        let k1 = preview_key(&m, "hello", 120);
        let k2 = preview_key(&m, "hello", 120);
        assert_eq!(k1, k2);
    }

    #[test]
    fn test_preview_key_varies_by_all_components() {
        let a = ModelId::new("gpt-a");
        let b = ModelId::new("gpt-b");
        let base = preview_key(&a, "hello", 120);
        assert_ne!(base, preview_key(&b, "hello", 120));
        assert_ne!(base, preview_key(&a, "world", 120));
        assert_ne!(base, preview_key(&a, "hello", 121));
    }

    #[tokio::test]
    async fn test_memory_cache_roundtrip() {
        let cache = PreviewCache::new_memory(10);
        let key = preview_key(&ModelId::new("m"), "q", 100);
        cache.put(&key, &preview("summary", 42), 600).await;
        assert_eq!(cache.get(&key).await, Some(preview("summary", 42)));
    }

    #[tokio::test]
    async fn test_memory_cache_miss() {
        let cache = PreviewCache::new_memory(10);
        assert_eq!(cache.get("missing").await, None);
    }

    #[tokio::test]
    async fn test_memory_cache_expiry() {
        let cache = PreviewCache::new_memory(10);
        cache.put("k", &preview("v", 1), 0).await;
        // TTL of zero means the entry is already expired.
        assert_eq!(cache.get("k").await, None);
    }

    #[tokio::test]
    async fn test_empty_previews_not_cached() {
        let cache = PreviewCache::new_memory(10);
        cache.put("k1", &preview("", 5), 600).await;
        cache.put("k2", &preview("text", 0), 600).await;
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_memory_cache_evicts_at_capacity() {
        let cache = PreviewCache::new_memory(2);
        cache.put("k1", &preview("a", 1), 600).await;
        cache.put("k2", &preview("b", 1), 600).await;
        cache.put("k3", &preview("c", 1), 600).await;
        assert_eq!(cache.len(), 2);
    }
}
