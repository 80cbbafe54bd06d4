//! The cache tier stack
//!
//! Every level of the stack implements [`CacheTier`]:
//! - [`local::LocalTier`]: in-process TTL maps, one per use case
//! - [`remote::RemoteTier`]: shared store with watermark invalidation
//! - [`noop::NoopTier`]: pass-through when no remote store is configured
//! - [`controller::Controller`]: gating and instrumentation wrapper
//! - [`chain::Chain`]: read-through composition of an outer and inner tier
//!
//! Tiers move serialized payload bytes; the engine owns the typed boundary.

pub mod chain;
pub mod controller;
pub mod local;
pub mod noop;
pub mod remote;

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::config::{CacheLayer, ConfigProvider, KeyConfig};
use crate::error::GCacheResult;
use crate::key::GCacheKey;

/// Lazy producer of the uncached value in serialized form. Cloneable so
/// wrappers can instrument it and retry it after tier failures.
pub type Fallback = Arc<dyn Fn() -> BoxFuture<'static, GCacheResult<Vec<u8>>> + Send + Sync>;

/// One level of the cache stack.
#[async_trait]
pub trait CacheTier: Send + Sync {
    /// Return the cached value for `key`, computing and storing it through
    /// `fallback` on a miss.
    async fn get(&self, key: &GCacheKey, fallback: Fallback) -> GCacheResult<Vec<u8>>;

    /// Store a value under `key`.
    async fn put(&self, key: &GCacheKey, value: Vec<u8>) -> GCacheResult<()>;

    /// Remove `key`; reports whether an entry was present.
    async fn delete(&self, key: &GCacheKey) -> GCacheResult<bool>;

    /// Invalidate every entry for `(key_type, id)` from now plus
    /// `future_buffer_ms` backwards. Only the remote tier implements this;
    /// other tiers rely on their TTLs.
    async fn invalidate(
        &self,
        _key_type: &str,
        _id: &str,
        _future_buffer_ms: u64,
    ) -> GCacheResult<()> {
        Ok(())
    }

    /// Remove every entry held by this tier.
    async fn flush_all(&self) -> GCacheResult<()> {
        Ok(())
    }

    /// The layer this tier reports for config lookups and metrics.
    fn layer(&self) -> CacheLayer;
}

/// Resolve the config for a key: the provider first, then the key's default.
pub(crate) async fn resolve_config(
    provider: &Arc<dyn ConfigProvider>,
    key: &GCacheKey,
) -> anyhow::Result<Option<KeyConfig>> {
    match provider.lookup(key).await? {
        Some(config) => Ok(Some(config)),
        None => Ok(key.default_config().cloned()),
    }
}
