//! # GCache — Two-Tier Read-Through Caching
//!
//! A caching facade for service code: registered operations dispatch through
//! an in-process TTL tier backed by a shared redis tier, with coordinated
//! cross-process invalidation and bounded staleness.
//!
//! ## Architecture
//!
//! - `key`: canonical cache keys and the URN scheme
//! - `args`: type-erased call arguments and the registration surface
//! - `config`: per-use-case TTL/ramp configuration and engine options
//! - `context`: call-scoped enablement and process-global engine state
//! - `tier`: the cache stack — local, remote, noop, controller, chain
//! - `engine`: the engine singleton and the function-wrapping surface
//! - `bridge`: worker-thread pool bridging synchronous callers
//! - `metrics`: prometheus counters and histograms
//! - `error`: the error enum shared across the stack
//!
//! ## Example
//!
//! ```no_run
//! use gcache::{
//!     CachedOptions, CallArgs, GCache, GCacheConfig, IdArg, KeyConfig, RedisConfig,
//! };
//!
//! # async fn demo() -> gcache::GCacheResult<()> {
//! let engine = GCache::new(GCacheConfig {
//!     redis_config: Some(RedisConfig::default()),
//!     ..Default::default()
//! })?;
//!
//! let load_user = engine.cached(
//!     CachedOptions::new("users.load", "user_id", IdArg::name("user_id"))
//!         .default_config(KeyConfig::enabled(300)),
//!     |args: CallArgs| async move {
//!         let user_id: u64 = *args.get("user_id")?;
//!         Ok(format!("user-{user_id}"))
//!     },
//! )?;
//!
//! let user = GCache::with_enabled(true, async {
//!     load_user.call(CallArgs::new().arg("user_id", 7u64)).await
//! })
//! .await?;
//! # let _ = user;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

// Call arguments and registration options
pub mod args;

// Worker-thread bridge for synchronous callers
pub mod bridge;

// Layer and use-case configuration
pub mod config;

// Call-scoped enablement
pub mod context;

// Engine and cached-function surface
pub mod engine;

// Errors
pub mod error;

// Cache keys and URNs
pub mod key;

// Prometheus instrumentation
pub mod metrics;

// The cache tier stack
pub mod tier;

// Re-export commonly used types
pub use args::{ArgAdapter, ArgValue, CachedOptions, CallArgs, IdArg};
pub use config::{
    dump_configs, load_configs, CacheLayer, ConfigEntry, ConfigProvider, GCacheConfig,
    KeyConfig, KeyConfigs, MapConfigProvider, NullConfigProvider, RedisConfig,
};
pub use context::{enable, with_enabled, EnableGuard};
pub use engine::{CachedFn, GCache, RESERVED_USE_CASE};
pub use error::{GCacheError, GCacheResult};
pub use key::{Codec, GCacheKey, GCacheKeyBuilder};
pub use metrics::GCacheMetrics;
pub use tier::controller::DisabledReason;
pub use tier::remote::{
    default_client_factory, RedisClientFactory, RedisStore, RemoteStore,
};
pub use tier::{CacheTier, Fallback};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");
