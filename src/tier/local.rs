//! In-process TTL tier
//!
//! One bounded TTL map per use case, keyed by the canonical cache key. The
//! sub-map adopts the TTL from the first config resolution for its use case
//! and keeps it until [`CacheTier::flush_all`] drops the sub-maps, after
//! which the next call re-resolves. Invalidation is not implemented here; the
//! remote tier provides that guarantee and this tier's TTL bounds staleness.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use moka::future::Cache as TtlCache;
use parking_lot::Mutex;

use crate::config::{CacheLayer, ConfigProvider};
use crate::error::{GCacheError, GCacheResult};
use crate::key::GCacheKey;
use crate::tier::{resolve_config, CacheTier, Fallback};

/// Default max entries per use case, bounding memory growth.
pub const LOCAL_CACHE_MAX_ENTRIES: u64 = 10_000;

/// In-process tier backed by per-use-case TTL maps.
pub struct LocalTier {
    provider: Arc<dyn ConfigProvider>,
    caches: Mutex<HashMap<String, TtlCache<GCacheKey, Vec<u8>>>>,
}

impl LocalTier {
    /// Create a local tier resolving TTLs through `provider`.
    pub fn new(provider: Arc<dyn ConfigProvider>) -> Self {
        Self {
            provider,
            caches: Mutex::new(HashMap::new()),
        }
    }

    /// Find or create the sub-map for this key's use case.
    async fn sub_map(&self, key: &GCacheKey) -> GCacheResult<TtlCache<GCacheKey, Vec<u8>>> {
        if let Some(cache) = self.caches.lock().get(key.use_case()) {
            return Ok(cache.clone());
        }

        // Resolve the TTL outside the lock; the provider is async.
        let config = resolve_config(&self.provider, key)
            .await
            .map_err(|e| GCacheError::ConfigProvider(e.to_string()))?
            .ok_or_else(|| GCacheError::MissingKeyConfig(key.use_case().to_string()))?;
        let ttl_sec = config
            .ttl_sec
            .get(&self.layer())
            .copied()
            .ok_or_else(|| GCacheError::MissingKeyConfig(key.use_case().to_string()))?;

        let mut caches = self.caches.lock();
        // Another task may have created the sub-map while we resolved config.
        let cache = caches
            .entry(key.use_case().to_string())
            .or_insert_with(|| {
                TtlCache::builder()
                    .max_capacity(LOCAL_CACHE_MAX_ENTRIES)
                    .time_to_live(Duration::from_secs(ttl_sec))
                    .build()
            })
            .clone();
        Ok(cache)
    }
}

#[async_trait]
impl CacheTier for LocalTier {
    async fn get(&self, key: &GCacheKey, fallback: Fallback) -> GCacheResult<Vec<u8>> {
        log::debug!("local tier lookup for {key}");
        let cache = self.sub_map(key).await?;

        if let Some(value) = cache.get(key).await {
            return Ok(value);
        }

        let value = fallback().await?;
        cache.insert(key.clone(), value.clone()).await;
        Ok(value)
    }

    async fn put(&self, key: &GCacheKey, value: Vec<u8>) -> GCacheResult<()> {
        let cache = self.sub_map(key).await?;
        cache.insert(key.clone(), value).await;
        Ok(())
    }

    async fn delete(&self, key: &GCacheKey) -> GCacheResult<bool> {
        let cache = self.sub_map(key).await?;
        Ok(cache.remove(key).await.is_some())
    }

    async fn flush_all(&self) -> GCacheResult<()> {
        self.caches.lock().clear();
        Ok(())
    }

    fn layer(&self) -> CacheLayer {
        CacheLayer::Local
    }
}
