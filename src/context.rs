//! Call-scoped enablement and process-global engine state
//!
//! Caching is off by default and must be enabled explicitly for the scope of
//! a call. The flag is attached to the logical call context, not a thread: an
//! async scope carries it through `with_enabled`, synchronous code uses the
//! RAII [`enable`] guard, and the worker bridge snapshots the flag at submit
//! time and re-establishes it on the worker before running the task.
//!
//! The module also owns the small amount of process-global state the engine
//! publishes once at construction: the URN prefix and the singleton guard.

use std::cell::Cell;
use std::future::Future;
use std::marker::PhantomData;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

tokio::task_local! {
    /// Enabled flag for the current task scope.
    static TASK_ENABLED: bool;
}

thread_local! {
    /// Enabled flag for synchronous callers outside any task scope.
    static THREAD_ENABLED: Cell<bool> = const { Cell::new(false) };
}

/// Whether caching is enabled in the current call context.
///
/// The task-scoped flag wins when present; otherwise the thread-scoped flag
/// set by [`enable`] applies. Defaults to `false` so write paths cannot cache
/// by accident.
pub fn is_enabled() -> bool {
    TASK_ENABLED
        .try_with(|enabled| *enabled)
        .unwrap_or_else(|_| THREAD_ENABLED.with(|flag| flag.get()))
}

/// Run `future` with caching enabled (or disabled) for its whole task scope.
pub async fn with_enabled<F>(enabled: bool, future: F) -> F::Output
where
    F: Future,
{
    TASK_ENABLED.scope(enabled, future).await
}

/// RAII guard restoring the previous thread-scoped enabled flag on drop.
pub struct EnableGuard {
    previous: bool,
    // The guard must be dropped on the thread that created it.
    _not_send: PhantomData<*const ()>,
}

/// Enable (or disable) caching for synchronous code until the guard drops.
pub fn enable(enabled: bool) -> EnableGuard {
    let previous = THREAD_ENABLED.with(|flag| flag.replace(enabled));
    EnableGuard {
        previous,
        _not_send: PhantomData,
    }
}

impl Drop for EnableGuard {
    fn drop(&mut self) {
        let previous = self.previous;
        THREAD_ENABLED.with(|flag| flag.set(previous));
    }
}

struct EngineState {
    urn_prefix: String,
    instantiated: bool,
}

static ENGINE_STATE: Lazy<RwLock<EngineState>> = Lazy::new(|| {
    RwLock::new(EngineState {
        urn_prefix: "urn".to_string(),
        instantiated: false,
    })
});

/// Current URN prefix, as published by the engine (default `"urn"`).
pub(crate) fn urn_prefix() -> String {
    ENGINE_STATE.read().urn_prefix.clone()
}

/// Claim the process-wide engine slot, publishing the URN prefix.
///
/// Returns `false` when an engine is already active.
pub(crate) fn acquire_engine(urn_prefix: Option<&str>) -> bool {
    let mut state = ENGINE_STATE.write();
    if state.instantiated {
        return false;
    }
    if let Some(prefix) = urn_prefix {
        state.urn_prefix = prefix.to_string();
    }
    state.instantiated = true;
    true
}

/// Release the engine slot so a new engine can be constructed.
pub(crate) fn release_engine() {
    ENGINE_STATE.write().instantiated = false;
}
