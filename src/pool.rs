//! Bounded worker pool for independent collection operations.
//!
//! Each collection cycle fans out one work item per entity/dimension
//! (one application, one host, one report page) across a fixed number of
//! workers. Items are drained FIFO from a single shared queue; completion
//! order across items is unspecified. A failing item is logged and does
//! not abort its siblings.
//!
//! Cancellation is cooperative: workers check the token before taking a
//! new item, and `run()` returns promptly once cancellation is signaled
//! even if some workers are still mid-operation; those are detached,
//! allowed to finish their current item, and take no new work.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::emit;
use crate::metrics::events::{ActiveWorkers, ItemCompleted, ItemStatus, PoolStalled, QueueDepth};

/// Boxed error type surfaced by work item operations.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

type ItemFuture = Pin<Box<dyn Future<Output = Result<(), BoxError>> + Send>>;

/// A single independent unit of work: one fetch/transform/send operation.
///
/// Immutable once enqueued; owned exclusively by the pool until executed
/// exactly once, or dropped un-started when cancellation fires first.
pub struct WorkItem {
    label: String,
    op: ItemFuture,
}

impl WorkItem {
    /// Create a work item with a label used in logs and diagnostics.
    pub fn new(
        label: impl Into<String>,
        op: impl Future<Output = Result<(), BoxError>> + Send + 'static,
    ) -> Self {
        Self {
            label: label.into(),
            op: Box::pin(op),
        }
    }

    /// The diagnostic label.
    pub fn label(&self) -> &str {
        &self.label
    }
}

impl std::fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkItem")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

/// Outcome counts for one pool run.
///
/// Counts reflect the state observed when `run()` returned; items still
/// finishing on detached workers after a cancellation are not included.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Items a worker started executing.
    pub attempted: usize,
    /// Items that completed without error.
    pub succeeded: usize,
    /// Items whose operation returned an error (logged, siblings
    /// unaffected).
    pub failed: usize,
    /// Items never started because cancellation was observed first.
    pub skipped: usize,
}

/// Shared state between the pool supervisor and its workers.
struct Shared {
    queue: Mutex<VecDeque<WorkItem>>,
    /// worker id -> (item label, start time), for the stall watchdog.
    in_flight: Mutex<HashMap<usize, (String, Instant)>>,
    attempted: AtomicUsize,
    succeeded: AtomicUsize,
    failed: AtomicUsize,
    completed: AtomicUsize,
}

/// Bounded worker pool with cooperative cancellation.
pub struct WorkPool {
    concurrency: usize,
    watchdog_interval: Duration,
    token: CancellationToken,
}

impl WorkPool {
    /// Create a pool with the given concurrency limit (clamped to >= 1).
    pub fn new(concurrency: usize, token: CancellationToken) -> Self {
        Self {
            concurrency: concurrency.max(1),
            watchdog_interval: Duration::from_secs(60),
            token,
        }
    }

    /// Override the stall watchdog interval.
    pub fn with_watchdog_interval(mut self, interval: Duration) -> Self {
        self.watchdog_interval = interval;
        self
    }

    /// Execute every item, blocking until all have been attempted once or
    /// cancellation is observed.
    ///
    /// Items are taken FIFO; completion order is unspecified. Returns
    /// immediately for an empty input.
    pub async fn run(&self, items: Vec<WorkItem>) -> PoolStats {
        let total = items.len();
        if total == 0 {
            return PoolStats::default();
        }

        let shared = Arc::new(Shared {
            queue: Mutex::new(items.into()),
            in_flight: Mutex::new(HashMap::new()),
            attempted: AtomicUsize::new(0),
            succeeded: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
        });

        let workers = self.concurrency.min(total);
        let mut join_set = JoinSet::new();
        for worker_id in 0..workers {
            join_set.spawn(worker_loop(
                worker_id,
                shared.clone(),
                self.token.clone(),
            ));
        }

        emit!(ActiveWorkers { count: workers });
        debug!(workers, total, "Pool started");

        let mut watchdog = tokio::time::interval(self.watchdog_interval);
        watchdog.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        watchdog.tick().await; // first tick fires immediately
        let mut last_completed = 0usize;

        loop {
            tokio::select! {
                joined = join_set.join_next() => {
                    match joined {
                        Some(_) => {
                            emit!(ActiveWorkers { count: join_set.len() });
                        }
                        None => break,
                    }
                }
                _ = self.token.cancelled() => {
                    let running = join_set.len();
                    info!(running, "Cancellation observed, detaching running workers");
                    join_set.detach_all();
                    break;
                }
                _ = watchdog.tick() => {
                    let completed = shared.completed.load(Ordering::Relaxed);
                    if completed == last_completed {
                        self.report_stall(&shared).await;
                    }
                    last_completed = completed;
                }
            }
        }

        emit!(ActiveWorkers { count: 0 });

        let attempted = shared.attempted.load(Ordering::Relaxed);
        let stats = PoolStats {
            attempted,
            succeeded: shared.succeeded.load(Ordering::Relaxed),
            failed: shared.failed.load(Ordering::Relaxed),
            skipped: total - attempted,
        };
        debug!(?stats, "Pool finished");
        stats
    }

    /// Log a snapshot of every in-flight item for operator diagnosis.
    ///
    /// Nothing is killed: the snapshot identifies which upstream
    /// operation a stuck worker is waiting on.
    async fn report_stall(&self, shared: &Shared) {
        let in_flight = shared.in_flight.lock().await;
        warn!(
            stalled_secs = self.watchdog_interval.as_secs(),
            in_flight = in_flight.len(),
            "No pool progress within watchdog interval"
        );
        for (worker_id, (label, started)) in in_flight.iter() {
            warn!(
                worker = worker_id,
                item = label.as_str(),
                running_secs = started.elapsed().as_secs(),
                "In-flight work item"
            );
        }
        emit!(PoolStalled);
    }
}

/// Worker: take the next item from the shared queue, execute it, repeat
/// until the queue drains or cancellation is observed.
async fn worker_loop(worker_id: usize, shared: Arc<Shared>, token: CancellationToken) {
    loop {
        if token.is_cancelled() {
            debug!(worker = worker_id, "Cancelled, taking no more items");
            break;
        }

        let (item, depth) = {
            let mut queue = shared.queue.lock().await;
            let item = queue.pop_front();
            (item, queue.len())
        };
        let Some(item) = item else {
            break;
        };
        emit!(QueueDepth { count: depth });

        let WorkItem { label, op } = item;
        shared.attempted.fetch_add(1, Ordering::Relaxed);
        shared
            .in_flight
            .lock()
            .await
            .insert(worker_id, (label.clone(), Instant::now()));

        match op.await {
            Ok(()) => {
                shared.succeeded.fetch_add(1, Ordering::Relaxed);
                emit!(ItemCompleted {
                    status: ItemStatus::Success
                });
                debug!(worker = worker_id, item = label.as_str(), "Item complete");
            }
            Err(e) => {
                shared.failed.fetch_add(1, Ordering::Relaxed);
                emit!(ItemCompleted {
                    status: ItemStatus::Failed
                });
                warn!(
                    worker = worker_id,
                    item = label.as_str(),
                    "Item failed: {}",
                    e
                );
            }
        }

        shared.in_flight.lock().await.remove(&worker_id);
        shared.completed.fetch_add(1, Ordering::Relaxed);
    }
}
