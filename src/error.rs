//! Error types for the caching facade
//!
//! A single error enum covers the whole stack. Setup mistakes (duplicate use
//! cases, conflicting remote configuration, a second engine) surface
//! synchronously from registration; most runtime failures are absorbed by the
//! controller and degrade to the caller's fallback instead of reaching the
//! call site.

use thiserror::Error;

/// Errors produced by the caching stack
#[derive(Debug, Error)]
pub enum GCacheError {
    /// A cache engine already exists in this process
    #[error("a cache engine is already instantiated in this process")]
    AlreadyInstantiated,

    /// The use case name was registered by an earlier `cached` call
    #[error("use case already registered: {0}")]
    UseCaseAlreadyRegistered(String),

    /// The use case name collides with a name the stack reserves
    #[error("use case name is reserved: {0}")]
    ReservedUseCaseName(String),

    /// The declared id argument is not present in the call arguments
    #[error("key argument does not exist in cached call: {0}")]
    KeyArgMissing(String),

    /// A named argument requested by user code is not present in the call
    #[error("function argument does not exist in cached call: {0}")]
    FuncArgMissing(String),

    /// Key construction failed for a reason other than a missing id argument
    #[error("could not construct cache key: {0}")]
    KeyConstructionFailed(String),

    /// No usable TTL/ramp configuration for the use case on this layer
    #[error("missing entire or partial (ttl/ramp) key config for use case: {0}")]
    MissingKeyConfig(String),

    /// A synchronous cached call was issued from a cache worker thread
    #[error(
        "sync cached call issued from inside a cache worker; \
         convert the calling use case to async"
    )]
    ReentrantSyncCall,

    /// Both a redis config and a custom remote store were supplied
    #[error("cannot provide both a redis config and a custom remote store")]
    RedisConfigConflict,

    /// Caching is disabled in the current context (informational)
    #[error("caching is disabled in this context")]
    Disabled,

    /// The remote store driver reported an error
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Envelope or payload encoding/decoding failed
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The caller-supplied config provider failed
    #[error("config provider error: {0}")]
    ConfigProvider(String),

    /// The user fallback itself failed
    #[error("fallback failed: {0}")]
    Fallback(anyhow::Error),

    /// The worker pool could not be started
    #[error("worker pool error: {0}")]
    WorkerPool(String),

    /// A task was submitted to a worker that is stopping or stopped
    #[error("worker pool is stopped")]
    WorkerStopped,
}

impl GCacheError {
    /// Stable short name used as the `error` label on the error counter.
    pub fn kind(&self) -> &'static str {
        match self {
            GCacheError::AlreadyInstantiated => "already_instantiated",
            GCacheError::UseCaseAlreadyRegistered(_) => "use_case_already_registered",
            GCacheError::ReservedUseCaseName(_) => "reserved_use_case_name",
            GCacheError::KeyArgMissing(_) => "key_arg_missing",
            GCacheError::FuncArgMissing(_) => "func_arg_missing",
            GCacheError::KeyConstructionFailed(_) => "key_construction_failed",
            GCacheError::MissingKeyConfig(_) => "missing_key_config",
            GCacheError::ReentrantSyncCall => "reentrant_sync_call",
            GCacheError::RedisConfigConflict => "redis_config_conflict",
            GCacheError::Disabled => "disabled",
            GCacheError::Redis(_) => "redis",
            GCacheError::Serialization(_) => "serialization",
            GCacheError::ConfigProvider(_) => "config_provider",
            GCacheError::Fallback(_) => "fallback",
            GCacheError::WorkerPool(_) => "worker_pool",
            GCacheError::WorkerStopped => "worker_stopped",
        }
    }
}

/// Result type for cache operations
pub type GCacheResult<T> = Result<T, GCacheError>;
