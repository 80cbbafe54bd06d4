//! Pass-through tier used when no remote store is configured

use async_trait::async_trait;

use crate::config::CacheLayer;
use crate::error::GCacheResult;
use crate::key::GCacheKey;
use crate::tier::{CacheTier, Fallback};

/// Tier that does nothing but invoke the fallback on get.
#[derive(Debug, Default)]
pub struct NoopTier;

impl NoopTier {
    /// Create a no-op tier.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CacheTier for NoopTier {
    async fn get(&self, _key: &GCacheKey, fallback: Fallback) -> GCacheResult<Vec<u8>> {
        fallback().await
    }

    async fn put(&self, _key: &GCacheKey, _value: Vec<u8>) -> GCacheResult<()> {
        Ok(())
    }

    async fn delete(&self, _key: &GCacheKey) -> GCacheResult<bool> {
        Ok(false)
    }

    fn layer(&self) -> CacheLayer {
        CacheLayer::Noop
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_get_always_calls_fallback() {
        let tier = NoopTier::new();
        let key = GCacheKey::builder("t", "1", "uc.noop").build();
        let fallback: Fallback = Arc::new(|| Box::pin(async { Ok(vec![1, 2, 3]) }));

        assert_eq!(tier.get(&key, fallback.clone()).await.unwrap(), vec![1, 2, 3]);
        // A second get still reaches the fallback; nothing was stored.
        assert_eq!(tier.get(&key, fallback).await.unwrap(), vec![1, 2, 3]);
        assert!(!tier.delete(&key).await.unwrap());
    }
}
