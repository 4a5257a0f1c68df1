use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use moka::future::Cache;
use moka::Expiry;
use serde_json::Value;

use crate::config::CacheConfig;

/// Cache of rendered read views, keyed by [`cache_key`].
///
/// Presigned download URLs expire, so each entry carries its own ttl and the
/// cache must never serve an entry past it.
#[async_trait]
pub trait MediaCache: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Option<Value>;

    async fn put(&self, key: &str, value: Value, ttl: Duration);

    /// Drop an entry. Called before any state transition that would make the
    /// cached view stale.
    async fn invalidate(&self, key: &str);
}

pub fn cache_key(id: &str) -> String {
    format!("media:{id}")
}

#[derive(Clone)]
struct CachedEntry {
    value: Value,
    ttl: Duration,
}

struct PerEntryExpiry;

impl Expiry<String, CachedEntry> for PerEntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        entry: &CachedEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(entry.ttl)
    }
}

/// In-process cache with per-entry expiry.
pub struct MokaCache {
    entries: Cache<String, CachedEntry>,
}

impl MokaCache {
    pub fn new(max_entries: u64) -> Self {
        Self {
            entries: Cache::builder()
                .max_capacity(max_entries)
                .expire_after(PerEntryExpiry)
                .build(),
        }
    }
}

#[async_trait]
impl MediaCache for MokaCache {
    async fn get(&self, key: &str) -> Option<Value> {
        self.entries.get(key).await.map(|entry| entry.value)
    }

    async fn put(&self, key: &str, value: Value, ttl: Duration) {
        self.entries
            .insert(key.to_string(), CachedEntry { value, ttl })
            .await;
    }

    async fn invalidate(&self, key: &str) {
        self.entries.invalidate(key).await;
    }
}

/// Create the cache backend from cache configuration.
pub fn create_cache(config: &CacheConfig) -> Arc<dyn MediaCache> {
    Arc::new(MokaCache::new(config.max_entries))
}
