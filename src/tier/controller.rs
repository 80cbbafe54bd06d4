//! Gating and instrumentation wrapper
//!
//! The controller sits in front of every concrete tier and decides, per
//! call, whether the tier participates at all: the context flag first, then
//! config presence (TTL and ramp for this layer), then the ramp draw. When
//! the tier runs, the controller counts requests/misses, times the tier and
//! the fallback separately, and converts tier failures into fallback results
//! so callers never observe infrastructure errors. The one exception is a
//! missing key config surfacing from a write: that means the configuration
//! drifted between the read and write paths, and it propagates to the caller
//! instead of being retried.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;

use crate::config::{CacheLayer, ConfigProvider};
use crate::context;
use crate::error::{GCacheError, GCacheResult};
use crate::key::GCacheKey;
use crate::metrics::GCacheMetrics;
use crate::tier::{resolve_config, CacheTier, Fallback};

/// Why a layer was skipped for a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisabledReason {
    /// The context flag is off
    Context,
    /// The ramp draw did not select this call
    RampedDown,
    /// No config, or no TTL/ramp entry for this layer
    MissingConfig,
    /// The config provider failed
    ConfigError,
    /// The backing store is known to be down
    ServerDown,
}

impl DisabledReason {
    /// Label value on the disabled counter.
    pub fn as_str(&self) -> &'static str {
        match self {
            DisabledReason::Context => "context",
            DisabledReason::RampedDown => "ramped_down",
            DisabledReason::MissingConfig => "missing_config",
            DisabledReason::ConfigError => "config_error",
            DisabledReason::ServerDown => "server_down",
        }
    }
}

/// Wrapper enforcing enabled-context gating, ramp sampling, degradation on
/// tier errors, and metrics emission for the tier it wraps.
pub struct Controller {
    provider: Arc<dyn ConfigProvider>,
    inner: Arc<dyn CacheTier>,
}

impl Controller {
    /// Wrap `inner` with gating and instrumentation.
    pub fn new(provider: Arc<dyn ConfigProvider>, inner: Arc<dyn CacheTier>) -> Self {
        Self { provider, inner }
    }

    fn count_disabled(&self, key: &GCacheKey, reason: DisabledReason) {
        GCacheMetrics::get()
            .disabled
            .with_label_values(&[
                key.use_case(),
                key.key_type(),
                self.layer().as_str(),
                reason.as_str(),
            ])
            .inc();
    }

    /// Whether this layer should serve the call.
    async fn should_cache(&self, key: &GCacheKey) -> bool {
        if !context::is_enabled() {
            // The engine counts context-disabled calls once, above the stack.
            return false;
        }
        match self.gate(key).await {
            Ok(selected) => selected,
            Err(e) => {
                log::error!("error resolving cache config for {key}: {e:#}");
                self.count_disabled(key, DisabledReason::ConfigError);
                false
            }
        }
    }

    async fn gate(&self, key: &GCacheKey) -> anyhow::Result<bool> {
        let Some(config) = resolve_config(&self.provider, key).await? else {
            self.count_disabled(key, DisabledReason::MissingConfig);
            return Ok(false);
        };

        let layer = self.layer();
        if config.ttl_sec.get(&layer).is_none() {
            self.count_disabled(key, DisabledReason::MissingConfig);
            return Ok(false);
        }
        let Some(&ramp) = config.ramp.get(&layer) else {
            self.count_disabled(key, DisabledReason::MissingConfig);
            return Ok(false);
        };

        if ramp >= 100 {
            return Ok(true);
        }
        if ramp > 0 && rand::thread_rng().gen_range(0..100) < ramp {
            return Ok(true);
        }
        self.count_disabled(key, DisabledReason::RampedDown);
        Ok(false)
    }
}

#[async_trait]
impl CacheTier for Controller {
    async fn get(&self, key: &GCacheKey, fallback: Fallback) -> GCacheResult<Vec<u8>> {
        if !self.should_cache(key).await {
            return fallback().await;
        }

        let metrics = GCacheMetrics::get();
        let layer = self.layer().as_str();
        metrics
            .request
            .with_label_values(&[key.use_case(), key.key_type(), layer])
            .inc();

        let start = Instant::now();
        let fallback_failed = Arc::new(AtomicBool::new(false));
        let fallback_nanos = Arc::new(AtomicU64::new(0));

        let instrumented: Fallback = {
            let fallback = fallback.clone();
            let fallback_failed = fallback_failed.clone();
            let fallback_nanos = fallback_nanos.clone();
            let use_case = key.use_case().to_string();
            let key_type = key.key_type().to_string();
            Arc::new(move || {
                let fallback = fallback.clone();
                let fallback_failed = fallback_failed.clone();
                let fallback_nanos = fallback_nanos.clone();
                let use_case = use_case.clone();
                let key_type = key_type.clone();
                Box::pin(async move {
                    let metrics = GCacheMetrics::get();
                    metrics
                        .miss
                        .with_label_values(&[&use_case, &key_type, layer])
                        .inc();
                    let fallback_start = Instant::now();
                    let result = fallback().await;
                    let elapsed = fallback_start.elapsed();
                    fallback_nanos.fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
                    metrics
                        .fallback_timer
                        .with_label_values(&[&use_case, &key_type, layer])
                        .observe(elapsed.as_secs_f64());
                    if result.is_err() {
                        fallback_failed.store(true, Ordering::SeqCst);
                    }
                    result
                })
            })
        };

        let result = match self.inner.get(key, instrumented).await {
            Ok(value) => Ok(value),
            Err(e) => {
                log::error!("error getting value from cache for {key}: {e}");
                let in_fallback = fallback_failed.load(Ordering::SeqCst);
                metrics
                    .error
                    .with_label_values(&[
                        key.use_case(),
                        key.key_type(),
                        layer,
                        e.kind(),
                        if in_fallback { "true" } else { "false" },
                    ])
                    .inc();
                if matches!(e, GCacheError::MissingKeyConfig(_)) {
                    // Config vanished between the gate check and a write:
                    // drift between read and write paths. Never retried or
                    // swallowed; rerunning the fallback here would duplicate
                    // its side effects and mask the misconfiguration.
                    Err(e)
                } else if in_fallback {
                    // The user fallback itself failed; surface that error.
                    Err(e)
                } else {
                    // The tier failed before the fallback produced a value;
                    // the source of truth is still reachable directly.
                    fallback().await
                }
            }
        };

        let tier_time = start
            .elapsed()
            .saturating_sub(Duration::from_nanos(fallback_nanos.load(Ordering::Relaxed)));
        metrics
            .get_timer
            .with_label_values(&[key.use_case(), key.key_type(), layer])
            .observe(tier_time.as_secs_f64());

        result
    }

    async fn put(&self, key: &GCacheKey, value: Vec<u8>) -> GCacheResult<()> {
        self.inner.put(key, value).await
    }

    async fn delete(&self, key: &GCacheKey) -> GCacheResult<bool> {
        self.inner.delete(key).await
    }

    async fn invalidate(
        &self,
        key_type: &str,
        id: &str,
        future_buffer_ms: u64,
    ) -> GCacheResult<()> {
        self.inner.invalidate(key_type, id, future_buffer_ms).await
    }

    async fn flush_all(&self) -> GCacheResult<()> {
        self.inner.flush_all().await
    }

    fn layer(&self) -> CacheLayer {
        self.inner.layer()
    }
}
