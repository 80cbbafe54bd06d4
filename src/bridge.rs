//! Worker-thread bridge for synchronous callers
//!
//! The cache stack is async end-to-end. Synchronous callers submit work to a
//! fixed pool of worker threads, each driving its own single-threaded
//! cooperative scheduler: tasks on one worker interleave cooperatively,
//! tasks on different workers run in parallel, and the remote client a task
//! touches always belongs to the thread it runs on.
//!
//! The pool is constructed lazily on first use (forked processes must not
//! inherit live worker threads), picks a worker uniformly at random per
//! submission, snapshots the caller's enabled flag at submit time, and stops
//! with a bounded join.

use std::cell::Cell;
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use futures::future::BoxFuture;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::mpsc;

use crate::context;
use crate::error::{GCacheError, GCacheResult};

/// Number of worker threads in the pool.
pub const BRIDGE_POOL_SIZE: usize = 16;

/// How long `stop` waits for each worker to wind down.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(2);

thread_local! {
    static IS_BRIDGE_WORKER: Cell<bool> = const { Cell::new(false) };
}

/// Whether the current thread is one of the pool's scheduler threads.
pub(crate) fn on_worker_thread() -> bool {
    IS_BRIDGE_WORKER.with(|flag| flag.get())
}

type Task = BoxFuture<'static, ()>;

const CREATED: u8 = 0;
const RUNNING: u8 = 1;
const STOPPING: u8 = 2;
const STOPPED: u8 = 3;

/// One worker thread running a cooperative scheduler.
struct WorkerThread {
    sender: Mutex<Option<mpsc::UnboundedSender<Task>>>,
    state: Arc<AtomicU8>,
    join_handle: Mutex<Option<thread::JoinHandle<()>>>,
    exited: Mutex<Option<std::sync::mpsc::Receiver<()>>>,
}

impl WorkerThread {
    fn spawn(name: String) -> GCacheResult<Self> {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Task>();
        let state = Arc::new(AtomicU8::new(CREATED));
        let (exit_sender, exit_receiver) = std::sync::mpsc::channel();

        let worker_state = state.clone();
        let worker_name = name.clone();
        let join_handle = thread::Builder::new()
            .name(name)
            .spawn(move || {
                IS_BRIDGE_WORKER.with(|flag| flag.set(true));
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        log::error!("failed to start scheduler for '{worker_name}': {e}");
                        worker_state.store(STOPPED, Ordering::SeqCst);
                        let _ = exit_sender.send(());
                        return;
                    }
                };

                worker_state.store(RUNNING, Ordering::SeqCst);
                log::info!("cache worker '{worker_name}' started");
                runtime.block_on(async move {
                    while let Some(task) = receiver.recv().await {
                        tokio::spawn(task);
                    }
                });
                worker_state.store(STOPPED, Ordering::SeqCst);
                log::info!("cache worker '{worker_name}' stopped");
                let _ = exit_sender.send(());
            })
            .map_err(|e| GCacheError::WorkerPool(e.to_string()))?;

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            state,
            join_handle: Mutex::new(Some(join_handle)),
            exited: Mutex::new(Some(exit_receiver)),
        })
    }

    fn submit(&self, task: Task) -> GCacheResult<()> {
        if self.state.load(Ordering::SeqCst) >= STOPPING {
            return Err(GCacheError::WorkerStopped);
        }
        let sender = self.sender.lock();
        sender
            .as_ref()
            .ok_or(GCacheError::WorkerStopped)?
            .send(task)
            .map_err(|_| GCacheError::WorkerStopped)
    }

    /// Signal the scheduler to stop and wait up to `timeout` for the thread
    /// to exit. Tasks still in flight when the scheduler winds down are
    /// cancelled.
    fn stop(&self, timeout: Duration) {
        self.state.store(STOPPING, Ordering::SeqCst);
        // Dropping the sender closes the channel; the scheduler loop ends
        // once queued tasks have been drained into the runtime.
        self.sender.lock().take();

        let exited = self.exited.lock().take();
        let clean_exit = match exited {
            Some(receiver) => receiver.recv_timeout(timeout).is_ok(),
            None => false,
        };
        if clean_exit {
            if let Some(handle) = self.join_handle.lock().take() {
                let _ = handle.join();
            }
        } else {
            log::warn!("cache worker did not stop within {timeout:?}; detaching");
        }
    }
}

/// Fixed-size pool of worker threads bridging sync callers into the async
/// cache stack.
pub struct SyncBridge {
    name: String,
    pool_size: usize,
    workers: OnceCell<Vec<WorkerThread>>,
}

impl SyncBridge {
    /// Create a bridge with the default pool size. No threads start until
    /// the first submission.
    pub fn new(name: &str) -> Self {
        Self::with_pool_size(name, BRIDGE_POOL_SIZE)
    }

    /// Create a bridge with an explicit pool size.
    pub fn with_pool_size(name: &str, pool_size: usize) -> Self {
        Self {
            name: name.to_string(),
            pool_size: pool_size.max(1),
            workers: OnceCell::new(),
        }
    }

    fn workers(&self) -> GCacheResult<&[WorkerThread]> {
        let workers = self.workers.get_or_try_init(|| {
            let workers = (0..self.pool_size)
                .map(|index| WorkerThread::spawn(format!("{}-{}", self.name, index)))
                .collect::<GCacheResult<Vec<_>>>()?;
            log::info!("initialized cache worker pool '{}'", self.name);
            Ok::<_, GCacheError>(workers)
        })?;
        Ok(workers)
    }

    /// Run `future` on a worker and block the calling thread for its result.
    ///
    /// The caller's enabled flag is captured here and re-established on the
    /// worker before the future runs. Fails with
    /// [`GCacheError::ReentrantSyncCall`] when invoked from a worker thread:
    /// blocking a scheduler on work that may be queued behind it deadlocks.
    pub fn submit<T, F>(&self, future: F) -> GCacheResult<T>
    where
        T: Send + 'static,
        F: Future<Output = GCacheResult<T>> + Send + 'static,
    {
        if on_worker_thread() {
            return Err(GCacheError::ReentrantSyncCall);
        }
        if tokio::runtime::Handle::try_current().is_ok() {
            log::warn!(
                "sync cached call issued from an async context; this blocks the \
                 caller's runtime, prefer the async form"
            );
        }

        let enabled = context::is_enabled();
        let workers = self.workers()?;
        let worker = &workers[rand::thread_rng().gen_range(0..workers.len())];

        let (result_sender, result_receiver) = std::sync::mpsc::sync_channel(1);
        let task: Task = Box::pin(async move {
            let result = context::with_enabled(enabled, future).await;
            let _ = result_sender.send(result);
        });
        worker.submit(task)?;

        result_receiver
            .recv()
            .map_err(|_| GCacheError::WorkerStopped)?
    }

    /// Stop every worker with a bounded join. Idempotent; workers that never
    /// started are left untouched.
    pub fn stop(&self, timeout: Duration) {
        if let Some(workers) = self.workers.get() {
            log::info!("stopping cache worker pool '{}'", self.name);
            for worker in workers {
                worker.stop(timeout);
            }
        }
    }

    /// Queue depth probe used by tests; counts workers that have started.
    pub fn started_workers(&self) -> usize {
        self.workers.get().map_or(0, Vec::len)
    }
}

impl std::fmt::Debug for SyncBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncBridge")
            .field("name", &self.name)
            .field("pool_size", &self.pool_size)
            .field("started", &self.started_workers())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_is_lazy() {
        let bridge = SyncBridge::with_pool_size("gcache-test-lazy", 2);
        assert_eq!(bridge.started_workers(), 0);
        let value = bridge.submit(async { Ok(41 + 1) }).unwrap();
        assert_eq!(value, 42);
        assert_eq!(bridge.started_workers(), 2);
        bridge.stop(STOP_TIMEOUT);
    }

    #[test]
    fn test_submit_propagates_errors() {
        let bridge = SyncBridge::with_pool_size("gcache-test-err", 1);
        let result: GCacheResult<()> = bridge.submit(async {
            Err(GCacheError::Serialization("boom".to_string()))
        });
        assert!(matches!(result, Err(GCacheError::Serialization(_))));
        bridge.stop(STOP_TIMEOUT);
    }

    #[test]
    fn test_submit_after_stop_fails() {
        let bridge = SyncBridge::with_pool_size("gcache-test-stopped", 1);
        bridge.submit(async { Ok(()) }).unwrap();
        bridge.stop(STOP_TIMEOUT);
        let result = bridge.submit(async { Ok(()) });
        assert!(matches!(result, Err(GCacheError::WorkerStopped)));
    }

    #[test]
    fn test_reentrant_submit_is_rejected() {
        let bridge = Arc::new(SyncBridge::with_pool_size("gcache-test-reentrant", 1));
        let inner = bridge.clone();
        let result = bridge.submit(async move {
            // Submitting from the worker thread itself must fail fast.
            inner.submit(async { Ok(()) })
        });
        assert!(matches!(result, Err(GCacheError::ReentrantSyncCall)));
        bridge.stop(STOP_TIMEOUT);
    }

    #[test]
    fn test_enabled_flag_travels_with_task() {
        let bridge = SyncBridge::with_pool_size("gcache-test-context", 1);

        let seen = bridge.submit(async { Ok(context::is_enabled()) }).unwrap();
        assert!(!seen);

        let _guard = context::enable(true);
        let seen = bridge.submit(async { Ok(context::is_enabled()) }).unwrap();
        assert!(seen);
        bridge.stop(STOP_TIMEOUT);
    }

    #[test]
    fn test_tasks_on_one_worker_interleave() {
        let bridge = Arc::new(SyncBridge::with_pool_size("gcache-test-interleave", 1));

        // A long sleeper submitted first must not starve a later task: the
        // worker's scheduler interleaves them.
        let sleeper_bridge = bridge.clone();
        let sleeper = std::thread::spawn(move || {
            sleeper_bridge.submit(async {
                tokio::time::sleep(Duration::from_millis(400)).await;
                Ok(1u8)
            })
        });
        std::thread::sleep(Duration::from_millis(50));
        let start = std::time::Instant::now();
        let quick = bridge.submit(async { Ok(2u8) }).unwrap();
        assert_eq!(quick, 2);
        assert!(start.elapsed() < Duration::from_millis(300));
        assert_eq!(sleeper.join().unwrap().unwrap(), 1);
        bridge.stop(STOP_TIMEOUT);
    }
}
