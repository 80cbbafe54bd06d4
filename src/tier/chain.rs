//! Read-through composition of two tiers
//!
//! The chain wires the inner tier in as the outer tier's fallback: an outer
//! hit returns immediately, an outer miss reads the inner tier, and an inner
//! miss reads the source. On a double miss the source value populates both
//! tiers on the unwind.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::CacheLayer;
use crate::error::GCacheResult;
use crate::key::GCacheKey;
use crate::tier::{CacheTier, Fallback};

/// Two-tier cascade: `outer` over `inner`.
pub struct Chain {
    outer: Arc<dyn CacheTier>,
    inner: Arc<dyn CacheTier>,
}

impl Chain {
    /// Compose `outer` (consulted first) over `inner`.
    pub fn new(outer: Arc<dyn CacheTier>, inner: Arc<dyn CacheTier>) -> Self {
        Self { outer, inner }
    }
}

#[async_trait]
impl CacheTier for Chain {
    async fn get(&self, key: &GCacheKey, fallback: Fallback) -> GCacheResult<Vec<u8>> {
        let inner = self.inner.clone();
        let inner_key = key.clone();
        let inner_fallback: Fallback = Arc::new(move || {
            let inner = inner.clone();
            let key = inner_key.clone();
            let fallback = fallback.clone();
            Box::pin(async move { inner.get(&key, fallback).await })
        });
        self.outer.get(key, inner_fallback).await
    }

    async fn put(&self, key: &GCacheKey, value: Vec<u8>) -> GCacheResult<()> {
        self.outer.put(key, value).await
    }

    async fn delete(&self, key: &GCacheKey) -> GCacheResult<bool> {
        let outer_removed = self.outer.delete(key).await?;
        let inner_removed = self.inner.delete(key).await?;
        Ok(outer_removed || inner_removed)
    }

    async fn invalidate(
        &self,
        key_type: &str,
        id: &str,
        future_buffer_ms: u64,
    ) -> GCacheResult<()> {
        self.outer.invalidate(key_type, id, future_buffer_ms).await
    }

    async fn flush_all(&self) -> GCacheResult<()> {
        self.outer.flush_all().await
    }

    fn layer(&self) -> CacheLayer {
        self.outer.layer()
    }
}
