//! Engine and the function-wrapping surface
//!
//! [`GCache`] is the process singleton that owns the tier stack:
//! `Chain(Controller(LocalTier), Controller(RemoteTier | NoopTier))`, the
//! use-case registry, and the worker bridge for synchronous callers.
//! [`GCache::cached`] turns an async closure into a [`CachedFn`], whose calls
//! build a key from their arguments and dispatch through the chain.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::args::{build_key, CachedOptions, CallArgs};
use crate::bridge::{SyncBridge, STOP_TIMEOUT};
use crate::config::GCacheConfig;
use crate::context;
use crate::error::{GCacheError, GCacheResult};
use crate::key::GCacheKey;
use crate::metrics::GCacheMetrics;
use crate::tier::chain::Chain;
use crate::tier::controller::{Controller, DisabledReason};
use crate::tier::local::LocalTier;
use crate::tier::noop::NoopTier;
use crate::tier::remote::{RedisStore, RemoteStore, RemoteTier};
use crate::tier::{CacheTier, Fallback};

/// Use-case name reserved for the invalidation protocol.
pub const RESERVED_USE_CASE: &str = "watermark";

/// Layer label used when a call is disabled before any tier is consulted.
const GLOBAL_LAYER: &str = "global";

/// Layer label used on key-construction error counts.
const KEY_CREATION_LAYER: &str = "key_creation";

/// The cache engine. At most one instance exists per process; dropping it
/// releases the slot and stops the worker pool.
pub struct GCache {
    local: Arc<dyn CacheTier>,
    remote: Arc<dyn CacheTier>,
    chain: Arc<dyn CacheTier>,
    registry: RwLock<HashSet<String>>,
    bridge: Arc<SyncBridge>,
}

impl GCache {
    /// Construct the engine.
    ///
    /// The remote tier is selected from the config: a custom store wins over
    /// a redis config, supplying both is [`GCacheError::RedisConfigConflict`],
    /// and supplying neither degrades the remote tier to a no-op.
    pub fn new(config: GCacheConfig) -> GCacheResult<Self> {
        if config.redis_config.is_some() && config.store.is_some() {
            return Err(GCacheError::RedisConfigConflict);
        }
        if !context::acquire_engine(config.urn_prefix.as_deref()) {
            return Err(GCacheError::AlreadyInstantiated);
        }

        GCacheMetrics::initialize(&config.metrics_prefix);

        let provider = config.config_provider.clone();
        let local: Arc<dyn CacheTier> = Arc::new(Controller::new(
            provider.clone(),
            Arc::new(LocalTier::new(provider.clone())),
        ));

        let store: Option<Arc<dyn RemoteStore>> = match (&config.redis_config, &config.store) {
            (Some(redis_config), None) => Some(Arc::new(RedisStore::new(redis_config))),
            (None, Some(store)) => Some(store.clone()),
            _ => None,
        };
        let remote_tier: Arc<dyn CacheTier> = match store {
            Some(store) => Arc::new(RemoteTier::new(provider.clone(), store)),
            None => Arc::new(NoopTier::new()),
        };
        let remote: Arc<dyn CacheTier> = Arc::new(Controller::new(provider, remote_tier));

        let chain: Arc<dyn CacheTier> = Arc::new(Chain::new(local.clone(), remote.clone()));

        Ok(Self {
            local,
            remote,
            chain,
            registry: RwLock::new(HashSet::new()),
            bridge: Arc::new(SyncBridge::new("gcache-worker")),
        })
    }

    /// Register `func` as the cached operation for `options.use_case`.
    ///
    /// Registration is where programmer errors surface: a duplicate use case,
    /// the reserved name, or separator characters in the key parts all fail
    /// here, synchronously.
    pub fn cached<T, F, Fut>(
        &self,
        options: CachedOptions,
        func: F,
    ) -> GCacheResult<CachedFn<T>>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        F: Fn(CallArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        options.validate()?;
        if options.use_case == RESERVED_USE_CASE {
            return Err(GCacheError::ReservedUseCaseName(options.use_case.clone()));
        }
        if !self.registry.write().insert(options.use_case.clone()) {
            return Err(GCacheError::UseCaseAlreadyRegistered(
                options.use_case.clone(),
            ));
        }

        let func = Arc::new(move |args: CallArgs| -> BoxFuture<'static, anyhow::Result<T>> {
            Box::pin(func(args))
        });

        Ok(CachedFn {
            options,
            func,
            chain: self.chain.clone(),
            bridge: self.bridge.clone(),
        })
    }

    /// Invalidate every tracked entry for `(key_type, id)`.
    ///
    /// `future_buffer_ms` pushes the watermark into the future, which also
    /// suppresses write-backs from fallbacks whose reads predate the
    /// invalidation. Routed to the remote tier only; the local tier relies on
    /// its TTL.
    pub async fn invalidate(
        &self,
        key_type: &str,
        id: &str,
        future_buffer_ms: u64,
    ) -> GCacheResult<()> {
        self.remote.invalidate(key_type, id, future_buffer_ms).await
    }

    /// Synchronous form of [`GCache::invalidate`], routed through the worker
    /// pool.
    pub fn invalidate_blocking(
        &self,
        key_type: &str,
        id: &str,
        future_buffer_ms: u64,
    ) -> GCacheResult<()> {
        let remote = self.remote.clone();
        let key_type = key_type.to_string();
        let id = id.to_string();
        self.bridge.submit(async move {
            remote.invalidate(&key_type, &id, future_buffer_ms).await
        })
    }

    /// Remove the entry for `key` from both tiers; true when either tier
    /// held an entry.
    pub async fn delete(&self, key: &GCacheKey) -> GCacheResult<bool> {
        self.chain.delete(key).await
    }

    /// Synchronous form of [`GCache::delete`].
    pub fn delete_blocking(&self, key: &GCacheKey) -> GCacheResult<bool> {
        let chain = self.chain.clone();
        let key = key.clone();
        self.bridge.submit(async move { chain.delete(&key).await })
    }

    /// Remove every local and remote entry. Useful for tests.
    pub async fn flush_all(&self) -> GCacheResult<()> {
        self.local.flush_all().await?;
        self.remote.flush_all().await
    }

    /// Synchronous form of [`GCache::flush_all`].
    pub fn flush_all_blocking(&self) -> GCacheResult<()> {
        let local = self.local.clone();
        let remote = self.remote.clone();
        self.bridge.submit(async move {
            local.flush_all().await?;
            remote.flush_all().await
        })
    }

    /// Enable (or disable) caching for synchronous code until the returned
    /// guard drops. See [`crate::context::enable`].
    pub fn enable(enabled: bool) -> context::EnableGuard {
        context::enable(enabled)
    }

    /// Run `future` with caching enabled (or disabled) for its task scope.
    /// See [`crate::context::with_enabled`].
    pub async fn with_enabled<F>(enabled: bool, future: F) -> F::Output
    where
        F: Future,
    {
        context::with_enabled(enabled, future).await
    }
}

impl Drop for GCache {
    fn drop(&mut self) {
        self.bridge.stop(STOP_TIMEOUT);
        context::release_engine();
    }
}

impl std::fmt::Debug for GCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GCache")
            .field("use_cases", &self.registry.read().len())
            .finish()
    }
}

/// A registered cached operation over values of type `T`.
pub struct CachedFn<T> {
    options: CachedOptions,
    func: Arc<dyn Fn(CallArgs) -> BoxFuture<'static, anyhow::Result<T>> + Send + Sync>,
    chain: Arc<dyn CacheTier>,
    bridge: Arc<SyncBridge>,
}

impl<T> Clone for CachedFn<T> {
    fn clone(&self) -> Self {
        Self {
            options: self.options.clone(),
            func: self.func.clone(),
            chain: self.chain.clone(),
            bridge: self.bridge.clone(),
        }
    }
}

impl<T> CachedFn<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// The registered use case name.
    pub fn use_case(&self) -> &str {
        &self.options.use_case
    }

    /// Build the cache key this call would use. Exposed for targeted
    /// [`GCache::delete`] calls.
    pub fn key_for(&self, args: &CallArgs) -> GCacheResult<GCacheKey> {
        build_key(&self.options, args)
    }

    /// Invoke the cached operation.
    ///
    /// With caching disabled in this context the function runs directly and
    /// no key is built. A key-construction failure (other than a missing id
    /// argument, which is a programmer error and propagates) is logged,
    /// counted, and degrades to direct execution.
    pub async fn call(&self, args: CallArgs) -> GCacheResult<T> {
        let metrics = GCacheMetrics::get();
        let mut should_cache = true;

        if !context::is_enabled() {
            metrics
                .disabled
                .with_label_values(&[
                    &self.options.use_case,
                    &self.options.key_type,
                    GLOBAL_LAYER,
                    DisabledReason::Context.as_str(),
                ])
                .inc();
            should_cache = false;
        }

        let key = if should_cache {
            match build_key(&self.options, &args) {
                Ok(key) => Some(key),
                Err(e @ GCacheError::KeyArgMissing(_)) => return Err(e),
                Err(e) => {
                    log::error!(
                        "could not construct cache key for {}: {e}",
                        self.options.use_case
                    );
                    metrics
                        .error
                        .with_label_values(&[
                            &self.options.use_case,
                            &self.options.key_type,
                            KEY_CREATION_LAYER,
                            e.kind(),
                            "false",
                        ])
                        .inc();
                    None
                }
            }
        } else {
            None
        };

        let Some(key) = key else {
            return (self.func)(args).await.map_err(GCacheError::Fallback);
        };

        let func = self.func.clone();
        let fallback_args = args;
        let fallback: Fallback = Arc::new(move || {
            let func = func.clone();
            let args = fallback_args.clone();
            Box::pin(async move {
                let value = func(args).await.map_err(GCacheError::Fallback)?;
                bincode::serialize(&value).map_err(|e| GCacheError::Serialization(e.to_string()))
            })
        });

        let bytes = self.chain.get(&key, fallback).await?;
        bincode::deserialize(&bytes).map_err(|e| GCacheError::Serialization(e.to_string()))
    }

    /// Synchronous form of [`CachedFn::call`], routed through the worker
    /// pool. Must not be invoked from inside another synchronous cached call;
    /// that fails with [`GCacheError::ReentrantSyncCall`].
    pub fn call_blocking(&self, args: CallArgs) -> GCacheResult<T> {
        let this = self.clone();
        self.bridge.submit(async move { this.call(args).await })
    }
}

impl<T> std::fmt::Debug for CachedFn<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedFn")
            .field("options", &self.options)
            .finish()
    }
}
