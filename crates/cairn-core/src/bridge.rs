//! Execution bridge between blocking callers and async provider calls.
//!
//! The bridge owns a multi-threaded tokio runtime. Callers submit a future
//! and get back a [`Pending`] handle they can block on with a deadline.
//!
//! # Ordering
//!
//! Work submitted with the same lane key runs strictly one at a time in
//! submission order. Each submission takes the completion signal of the
//! previous one on its lane and waits for it before asking for a worker, so
//! the order is fixed at submit time, not at scheduling time.
//!
//! # Backpressure
//!
//! At most `workers` operations run at once. Submissions that have not yet
//! obtained a worker count as queued; once `queue_depth` are queued, new
//! submissions fail with `Overloaded` immediately.
//!
//! # Cancellation
//!
//! Cancelling (or timing out) a pending operation returns to the caller at
//! once. An operation that has not started is skipped. One that is already
//! running continues in the background and its result is discarded.

use crate::error::{CoreError, Result};
use crate::sandbox::{Operation, SandboxId};
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use tokio::runtime::{Handle, Runtime};
use tokio::sync::{oneshot, Semaphore};
use tokio_util::sync::CancellationToken;

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for the bridge.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Max operations running concurrently.
    ///
    /// Default: 8
    pub workers: usize,

    /// Max operations waiting for a worker before new ones are rejected.
    ///
    /// Default: 64
    pub queue_depth: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            queue_depth: 64,
        }
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Bridge statistics for observability.
///
/// All counters are atomic and can be read without locking.
#[derive(Debug, Default)]
pub struct BridgeStats {
    /// Operations accepted.
    pub submitted: AtomicU64,
    /// Operations that ran to completion (including failures).
    pub completed: AtomicU64,
    /// Operations rejected with `Overloaded`.
    pub rejected: AtomicU64,
    /// Waits that hit their deadline.
    pub timed_out: AtomicU64,
    /// Operations skipped because they were cancelled before starting.
    pub skipped: AtomicU64,
}

impl BridgeStats {
    /// Get the number of accepted operations.
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    /// Get the number of completed operations.
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Get the number of rejected operations.
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Get the number of timed-out waits.
    pub fn timed_out(&self) -> u64 {
        self.timed_out.load(Ordering::Relaxed)
    }

    /// Get the number of skipped operations.
    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Handles
// ============================================================================

/// Cancels one pending operation. Cheap to clone.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    token: CancellationToken,
}

impl CancelHandle {
    /// Request cancellation.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether cancellation was requested (or the wait timed out).
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// A submitted operation whose result has not been collected.
///
/// Dropping it detaches the operation: it still runs, the result is dropped.
#[must_use = "dropping a Pending detaches the operation"]
pub struct Pending<T> {
    rx: mpsc::Receiver<Result<T>>,
    token: CancellationToken,
    deadline: Instant,
    timeout: Duration,
    target: String,
    operation: Operation,
    stats: Arc<BridgeStats>,
}

impl<T> Pending<T> {
    /// Handle that cancels this operation.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            token: self.token.clone(),
        }
    }

    /// Deadline the wait is bounded by.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Block until the result arrives, the deadline passes, or the operation
    /// is cancelled.
    pub fn wait(self) -> Result<T> {
        let remaining = self.deadline.saturating_duration_since(Instant::now());
        match self.rx.recv_timeout(remaining) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                self.token.cancel();
                self.stats.timed_out.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    target_id = %self.target,
                    operation = %self.operation,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Bridge wait timed out"
                );
                Err(CoreError::Timeout {
                    target: self.target,
                    operation: self.operation,
                    after: self.timeout,
                })
            }
            Err(RecvTimeoutError::Disconnected) => Err(CoreError::backend(
                "bridge",
                format!("{} on {} lost its worker", self.operation, self.target),
            )),
        }
    }
}

// ============================================================================
// Bridge Implementation
// ============================================================================

#[derive(Default)]
struct Lane {
    tail: Option<oneshot::Receiver<()>>,
    pending: usize,
}

/// Runs async operations on a private runtime for blocking callers.
pub struct Bridge {
    runtime: Option<Runtime>,
    handle: Handle,
    config: BridgeConfig,
    workers: Arc<Semaphore>,
    queued: Arc<AtomicUsize>,
    lanes: Arc<Mutex<HashMap<SandboxId, Lane>>>,
    in_flight: Arc<(Mutex<usize>, Condvar)>,
    accepting: AtomicBool,
    stats: Arc<BridgeStats>,
}

impl Bridge {
    /// Create a bridge with its own runtime.
    pub fn new(config: BridgeConfig) -> Result<Self> {
        if config.workers == 0 {
            return Err(CoreError::InvalidConfig("bridge needs at least one worker".into()));
        }
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.workers.clamp(2, 64))
            .thread_name("cairn-bridge")
            .enable_all()
            .build()
            .map_err(|e| CoreError::InvalidConfig(format!("cannot start bridge runtime: {e}")))?;

        tracing::info!(
            workers = config.workers,
            queue_depth = config.queue_depth,
            "Creating execution bridge"
        );

        Ok(Self {
            handle: runtime.handle().clone(),
            runtime: Some(runtime),
            workers: Arc::new(Semaphore::new(config.workers)),
            queued: Arc::new(AtomicUsize::new(0)),
            lanes: Arc::new(Mutex::new(HashMap::new())),
            in_flight: Arc::new((Mutex::new(0), Condvar::new())),
            accepting: AtomicBool::new(true),
            stats: Arc::new(BridgeStats::default()),
            config,
        })
    }

    /// Runtime handle, for background tasks that live as long as the bridge.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Get the bridge configuration.
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Get the bridge statistics.
    pub fn stats(&self) -> &BridgeStats {
        &self.stats
    }

    /// Operations currently waiting for a worker.
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    /// Operations accepted and not yet finished.
    pub fn in_flight(&self) -> usize {
        *lock(&self.in_flight.0)
    }

    /// Whether new work is accepted.
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Submit `work`.
    ///
    /// `lane` serializes work per sandbox; `None` runs unordered. `timeout`
    /// bounds [`Pending::wait`], measured from now.
    pub fn submit<F, T>(
        &self,
        lane: Option<SandboxId>,
        target: impl Into<String>,
        operation: Operation,
        timeout: Duration,
        work: F,
    ) -> Result<Pending<T>>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.submit_with_abort(lane, target, operation, timeout, work, |_| async {})
    }

    /// Submit `work` with a follow-up that runs if the caller gives up on it.
    ///
    /// When the pending operation is cancelled or its wait times out before
    /// the work finishes, `on_abort` is spawned on the bridge runtime. Its
    /// argument tells whether the work had already started.
    pub fn submit_with_abort<F, T, A, AF>(
        &self,
        lane: Option<SandboxId>,
        target: impl Into<String>,
        operation: Operation,
        timeout: Duration,
        work: F,
        on_abort: A,
    ) -> Result<Pending<T>>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
        A: FnOnce(bool) -> AF + Send + 'static,
        AF: Future<Output = ()> + Send + 'static,
    {
        let target = target.into();
        if !self.is_accepting() {
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(CoreError::Overloaded {
                target,
                operation,
                queued: self.queued(),
            });
        }

        let queued = self.queued.fetch_add(1, Ordering::SeqCst);
        if queued >= self.config.queue_depth {
            self.queued.fetch_sub(1, Ordering::SeqCst);
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(target_id = %target, operation = %operation, queued, "Bridge overloaded");
            return Err(CoreError::Overloaded {
                target,
                operation,
                queued,
            });
        }
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        *lock(&self.in_flight.0) += 1;

        // Claim our place on the lane before anything is spawned.
        let (done_tx, done_rx) = oneshot::channel::<()>();
        let predecessor = lane.and_then(|id| {
            let mut lanes = lock(&self.lanes);
            let entry = lanes.entry(id).or_default();
            entry.pending += 1;
            entry.tail.replace(done_rx)
        });

        let token = CancellationToken::new();
        let started = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::sync_channel::<Result<T>>(1);

        let runner = Runner {
            lane,
            started: Arc::clone(&started),
            target: target.clone(),
            operation,
            token: token.clone(),
            workers: Arc::clone(&self.workers),
            queued: Arc::clone(&self.queued),
            lanes: Arc::clone(&self.lanes),
            in_flight: Arc::clone(&self.in_flight),
            stats: Arc::clone(&self.stats),
        };

        let inner = self
            .handle
            .spawn(runner.run(predecessor, done_tx, work));

        let outer_token = token.clone();
        let outer_target = target.clone();
        self.handle.spawn(async move {
            let result = tokio::select! {
                biased;
                joined = inner => joined.unwrap_or_else(|e| {
                    Err(CoreError::backend("bridge", format!("worker failed: {e}")))
                }),
                _ = outer_token.cancelled() => {
                    tokio::spawn(on_abort(started.load(Ordering::SeqCst)));
                    Err(CoreError::Cancelled {
                        target: outer_target,
                        operation,
                    })
                }
            };
            // The caller may have stopped waiting; that is fine.
            let _ = tx.try_send(result);
        });

        Ok(Pending {
            rx,
            token,
            deadline: Instant::now() + timeout,
            timeout,
            target,
            operation,
            stats: Arc::clone(&self.stats),
        })
    }

    /// Submit and wait.
    pub fn run<F, T>(
        &self,
        lane: Option<SandboxId>,
        target: impl Into<String>,
        operation: Operation,
        timeout: Duration,
        work: F,
    ) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.submit(lane, target, operation, timeout, work)?.wait()
    }

    /// Stop accepting work and wait up to `grace` for in-flight work.
    ///
    /// Returns `true` if everything drained.
    pub fn shutdown(&self, grace: Duration) -> bool {
        self.accepting.store(false, Ordering::SeqCst);
        let (count, cvar) = &*self.in_flight;
        let guard = lock(count);
        let (guard, result) = cvar
            .wait_timeout_while(guard, grace, |n| *n > 0)
            .unwrap_or_else(|e| e.into_inner());
        let drained = !result.timed_out();
        tracing::info!(
            drained,
            remaining = *guard,
            submitted = self.stats.submitted(),
            completed = self.stats.completed(),
            rejected = self.stats.rejected(),
            timed_out = self.stats.timed_out(),
            "Bridge shutdown"
        );
        drained
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            // Dropping a runtime inside another runtime's context panics.
            runtime.shutdown_background();
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Everything the spawned task needs to run one operation.
struct Runner {
    lane: Option<SandboxId>,
    started: Arc<AtomicBool>,
    target: String,
    operation: Operation,
    token: CancellationToken,
    workers: Arc<Semaphore>,
    queued: Arc<AtomicUsize>,
    lanes: Arc<Mutex<HashMap<SandboxId, Lane>>>,
    in_flight: Arc<(Mutex<usize>, Condvar)>,
    stats: Arc<BridgeStats>,
}

impl Runner {
    async fn run<F, T>(
        self,
        predecessor: Option<oneshot::Receiver<()>>,
        done: oneshot::Sender<()>,
        work: F,
    ) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        // Not cancellable: the lane must stay strictly sequential.
        if let Some(prev) = predecessor {
            let _ = prev.await;
        }

        let permit = tokio::select! {
            biased;
            _ = self.token.cancelled() => None,
            permit = Arc::clone(&self.workers).acquire_owned() => permit.ok(),
        };
        self.queued.fetch_sub(1, Ordering::SeqCst);

        let result = match permit {
            Some(_permit) if !self.token.is_cancelled() => {
                self.started.store(true, Ordering::SeqCst);
                let start = Instant::now();
                tracing::trace!(target_id = %self.target, operation = %self.operation, "Operation started");
                let result = AssertUnwindSafe(work).catch_unwind().await.unwrap_or_else(|_| {
                    tracing::error!(target_id = %self.target, operation = %self.operation, "Operation panicked");
                    Err(CoreError::backend(
                        "bridge",
                        format!("{} on {} panicked", self.operation, self.target),
                    ))
                });
                tracing::debug!(
                    target_id = %self.target,
                    operation = %self.operation,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    ok = result.is_ok(),
                    "Operation finished"
                );
                self.stats.completed.fetch_add(1, Ordering::Relaxed);
                result
            }
            _ => {
                tracing::debug!(target_id = %self.target, operation = %self.operation, "Skipping cancelled operation");
                self.stats.skipped.fetch_add(1, Ordering::Relaxed);
                Err(CoreError::Cancelled {
                    target: self.target.clone(),
                    operation: self.operation,
                })
            }
        };

        let _ = done.send(());
        if let Some(id) = self.lane {
            let mut lanes = lock(&self.lanes);
            if let Some(lane) = lanes.get_mut(&id) {
                lane.pending = lane.pending.saturating_sub(1);
                if lane.pending == 0 {
                    lanes.remove(&id);
                }
            }
        }

        let (count, cvar) = &*self.in_flight;
        let mut n = lock(count);
        *n = n.saturating_sub(1);
        cvar.notify_all();
        result
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    async fn explode() -> Result<()> {
        panic!("boom")
    }

    fn bridge(workers: usize, queue_depth: usize) -> Bridge {
        Bridge::new(BridgeConfig {
            workers,
            queue_depth,
        })
        .unwrap()
    }

    #[test]
    fn test_bridge_config_defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.workers, 8);
        assert_eq!(config.queue_depth, 64);
    }

    #[test]
    fn test_bridge_stats_default() {
        let stats = BridgeStats::default();
        assert_eq!(stats.submitted(), 0);
        assert_eq!(stats.completed(), 0);
        assert_eq!(stats.rejected(), 0);
        assert_eq!(stats.timed_out(), 0);
    }

    #[test]
    fn test_run_returns_result() {
        let b = bridge(2, 8);
        let value = b
            .run(None, "t", Operation::Execute, Duration::from_secs(5), async { Ok(41 + 1) })
            .unwrap();
        assert_eq!(value, 42);
        assert_eq!(b.stats().completed(), 1);
    }

    #[test]
    fn test_wait_times_out() {
        let b = bridge(2, 8);
        let start = Instant::now();
        let err = b
            .run(None, "slow", Operation::Execute, Duration::from_millis(100), async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, CoreError::Timeout { .. }));
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(b.stats().timed_out(), 1);
    }

    #[test]
    fn test_same_lane_is_serialized_in_order() {
        let b = bridge(4, 32);
        let id = SandboxId::new();
        let active = Arc::new(AtomicU32::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));

        let pending: Vec<_> = (0..6)
            .map(|i| {
                let active = Arc::clone(&active);
                let order = Arc::clone(&order);
                b.submit(Some(id), id.to_string(), Operation::Execute, Duration::from_secs(10), async move {
                    assert_eq!(active.fetch_add(1, Ordering::SeqCst), 0, "overlap on lane");
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    order.lock().unwrap().push(i);
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(i)
                })
                .unwrap()
            })
            .collect();

        for (i, p) in pending.into_iter().enumerate() {
            assert_eq!(p.wait().unwrap(), i);
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_different_lanes_run_in_parallel() {
        let b = bridge(4, 32);
        let start = Instant::now();
        let pending: Vec<_> = (0..4)
            .map(|_| {
                let id = SandboxId::new();
                b.submit(Some(id), id.to_string(), Operation::Execute, Duration::from_secs(10), async {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    Ok(())
                })
                .unwrap()
            })
            .collect();
        for p in pending {
            p.wait().unwrap();
        }
        assert!(start.elapsed() < Duration::from_millis(1000));
    }

    #[test]
    fn test_overloaded_when_queue_full() {
        let b = bridge(1, 2);
        let gate = Arc::new(tokio::sync::Notify::new());

        let mut held = Vec::new();
        for _ in 0..2 {
            let gate = Arc::clone(&gate);
            held.push(
                b.submit(None, "x", Operation::Execute, Duration::from_secs(10), async move {
                    gate.notified().await;
                    Ok(())
                })
                .unwrap(),
            );
        }
        // Give the first one time to take the only worker.
        std::thread::sleep(Duration::from_millis(100));
        held.push(
            b.submit(None, "x", Operation::Execute, Duration::from_secs(10), async { Ok(()) })
                .unwrap(),
        );

        let err = b
            .submit(None, "x", Operation::Execute, Duration::from_secs(10), async { Ok(()) })
            .err()
            .unwrap();
        assert!(matches!(err, CoreError::Overloaded { .. }));
        assert_eq!(b.stats().rejected(), 1);
        gate.notify_waiters();
        gate.notify_one();
        drop(held);
    }

    #[test]
    fn test_cancel_before_start_skips_work() {
        let b = bridge(1, 8);
        let id = SandboxId::new();
        let ran = Arc::new(AtomicBool::new(false));

        let first = b
            .submit(Some(id), "x", Operation::Execute, Duration::from_secs(10), async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(())
            })
            .unwrap();
        let flag = Arc::clone(&ran);
        let second = b
            .submit(Some(id), "x", Operation::Execute, Duration::from_secs(10), async move {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        second.cancel_handle().cancel();
        assert!(matches!(second.wait(), Err(CoreError::Cancelled { .. })));
        first.wait().unwrap();
        std::thread::sleep(Duration::from_millis(100));
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(b.stats().skipped(), 1);
    }

    #[test]
    fn test_panic_is_contained() {
        let b = bridge(2, 8);
        let err = b
            .run(None, "x", Operation::Execute, Duration::from_secs(5), explode())
            .unwrap_err();
        assert!(matches!(err, CoreError::BackendFailure { .. }));
        assert!(b
            .run(None, "x", Operation::Execute, Duration::from_secs(5), async { Ok(1) })
            .is_ok());
    }

    #[test]
    fn test_shutdown_drains_and_rejects() {
        let b = bridge(2, 8);
        let p = b
            .submit(None, "x", Operation::Destroy, Duration::from_secs(5), async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(())
            })
            .unwrap();
        assert!(b.shutdown(Duration::from_secs(5)));
        assert_eq!(b.in_flight(), 0);
        p.wait().unwrap();
        assert!(matches!(
            b.submit(None, "x", Operation::Execute, Duration::from_secs(1), async { Ok(()) }),
            Err(CoreError::Overloaded { .. })
        ));
    }

    #[test]
    fn test_abort_hook_reports_whether_work_started() {
        let b = bridge(1, 8);
        let id = SandboxId::new();
        let (seen_tx, seen_rx) = mpsc::channel::<(u8, bool)>();

        let tx = seen_tx.clone();
        let running = b
            .submit_with_abort(
                Some(id),
                "x",
                Operation::Execute,
                Duration::from_millis(100),
                async {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    Ok(())
                },
                move |started| async move {
                    let _ = tx.send((1, started));
                },
            )
            .unwrap();
        let queued = b
            .submit_with_abort(
                Some(id),
                "x",
                Operation::Execute,
                Duration::from_secs(10),
                async { Ok(()) },
                move |started| async move {
                    let _ = seen_tx.send((2, started));
                },
            )
            .unwrap();

        // Let the first one start before giving up on either.
        std::thread::sleep(Duration::from_millis(50));
        queued.cancel_handle().cancel();
        assert!(matches!(queued.wait(), Err(CoreError::Cancelled { .. })));
        assert!(matches!(running.wait(), Err(CoreError::Timeout { .. })));

        let mut seen = vec![
            seen_rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            seen_rx.recv_timeout(Duration::from_secs(2)).unwrap(),
        ];
        seen.sort();
        assert_eq!(seen, vec![(1, true), (2, false)]);
    }

    #[tokio::test]
    async fn test_bridge_can_be_dropped_inside_runtime() {
        let b = bridge(2, 8);
        drop(b);
    }
}
