//! Prometheus instrumentation for the cache stack
//!
//! One family per concern, initialized once per process with the engine's
//! metrics prefix and registered on the default registry. Metric names are
//! part of the external interface; only the prefix varies.

use once_cell::sync::OnceCell;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts};

static METRICS: OnceCell<GCacheMetrics> = OnceCell::new();

/// Buckets for the operation timers: the prometheus defaults with an extra
/// sub-millisecond bucket, since tier hits routinely land under 1 ms.
fn timer_buckets() -> Vec<f64> {
    let mut buckets = vec![0.001];
    buckets.extend_from_slice(&prometheus::DEFAULT_BUCKETS[..]);
    buckets
}

/// Counter and histogram families shared by every tier wrapper.
pub struct GCacheMetrics {
    /// Requests that reached a tier (use_case, key_type, layer)
    pub request: IntCounterVec,
    /// Tier misses, counted when the instrumented fallback runs
    pub miss: IntCounterVec,
    /// Calls where a layer was skipped (use_case, key_type, layer, reason)
    pub disabled: IntCounterVec,
    /// Tier failures (use_case, key_type, layer, error, in_fallback)
    pub error: IntCounterVec,
    /// Invalidations issued (key_type, layer)
    pub invalidation: IntCounterVec,
    /// Tier get latency, excluding fallback time (seconds)
    pub get_timer: HistogramVec,
    /// User fallback latency (seconds)
    pub fallback_timer: HistogramVec,
    /// Envelope encode/decode latency (use_case, key_type, layer, operation)
    pub serialization_timer: HistogramVec,
    /// Stored envelope size in bytes, remote tier only
    pub size_histogram: HistogramVec,
}

impl GCacheMetrics {
    /// The process-wide metric families, created with the prefix of the first
    /// initializer (the engine) or `"api_"` when touched before an engine
    /// exists.
    pub fn get() -> &'static GCacheMetrics {
        Self::initialize("api_")
    }

    /// Create and register the metric families. Only the first call in the
    /// process takes effect; later prefixes are ignored.
    pub fn initialize(prefix: &str) -> &'static GCacheMetrics {
        METRICS.get_or_init(|| Self::build(prefix))
    }

    fn build(prefix: &str) -> GCacheMetrics {
        let registry = prometheus::default_registry();

        let request = IntCounterVec::new(
            Opts::new(format!("{prefix}gcache_request_counter"), "Cache request counter"),
            &["use_case", "key_type", "layer"],
        )
        .expect("valid metric definition");

        let miss = IntCounterVec::new(
            Opts::new(format!("{prefix}gcache_miss_counter"), "Cache miss counter"),
            &["use_case", "key_type", "layer"],
        )
        .expect("valid metric definition");

        let disabled = IntCounterVec::new(
            Opts::new(
                format!("{prefix}gcache_disabled_counter"),
                "Cache disabled counter",
            ),
            &["use_case", "key_type", "layer", "reason"],
        )
        .expect("valid metric definition");

        let error = IntCounterVec::new(
            Opts::new(format!("{prefix}gcache_error_counter"), "Cache error counter"),
            &["use_case", "key_type", "layer", "error", "in_fallback"],
        )
        .expect("valid metric definition");

        let invalidation = IntCounterVec::new(
            Opts::new(
                format!("{prefix}gcache_invalidation_counter"),
                "Cache invalidation counter",
            ),
            &["key_type", "layer"],
        )
        .expect("valid metric definition");

        let get_timer = HistogramVec::new(
            HistogramOpts::new(format!("{prefix}gcache_get_timer"), "Cache get timer")
                .buckets(timer_buckets()),
            &["use_case", "key_type", "layer"],
        )
        .expect("valid metric definition");

        let fallback_timer = HistogramVec::new(
            HistogramOpts::new(format!("{prefix}gcache_fallback_timer"), "Fallback timer")
                .buckets(timer_buckets()),
            &["use_case", "key_type", "layer"],
        )
        .expect("valid metric definition");

        let serialization_timer = HistogramVec::new(
            HistogramOpts::new(
                format!("{prefix}gcache_serialization_timer"),
                "Cache serialization timer",
            )
            .buckets(timer_buckets()),
            &["use_case", "key_type", "layer", "operation"],
        )
        .expect("valid metric definition");

        let size_histogram = HistogramVec::new(
            HistogramOpts::new(
                format!("{prefix}gcache_size_histogram"),
                "Cache size histogram",
            )
            .buckets(vec![
                100.0,
                1_000.0,
                10_000.0,
                100_000.0,
                1_000_000.0,
                10_000_000.0,
            ]),
            &["use_case", "key_type", "layer"],
        )
        .expect("valid metric definition");

        // Registration can only fail on duplicate names; the OnceCell makes
        // this a first-and-only registration.
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(request.clone()),
            Box::new(miss.clone()),
            Box::new(disabled.clone()),
            Box::new(error.clone()),
            Box::new(invalidation.clone()),
            Box::new(get_timer.clone()),
            Box::new(fallback_timer.clone()),
            Box::new(serialization_timer.clone()),
            Box::new(size_histogram.clone()),
        ];
        for collector in collectors {
            registry
                .register(collector)
                .expect("first registration of gcache metrics");
        }

        GCacheMetrics {
            request,
            miss,
            disabled,
            error,
            invalidation,
            get_timer,
            fallback_timer,
            serialization_timer,
            size_histogram,
        }
    }
}
