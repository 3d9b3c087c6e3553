//! Internal events for metrics emission.
//!
//! Each event struct represents a measurable occurrence in the engine.
//! Events implement the `InternalEvent` trait which records the
//! corresponding Prometheus metric.

use metrics::{counter, gauge, histogram};
use std::time::Duration;
use tracing::trace;

/// Trait for internal events that can be emitted as metrics.
pub trait InternalEvent {
    /// Emit this event as a metric.
    fn emit(self);
}

/// Outcome of a work item execution.
#[derive(Debug, Clone, Copy)]
pub enum ItemStatus {
    Success,
    Failed,
}

impl ItemStatus {
    fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Success => "success",
            ItemStatus::Failed => "failed",
        }
    }
}

/// Event emitted when a work item finishes executing.
pub struct ItemCompleted {
    pub status: ItemStatus,
}

impl InternalEvent for ItemCompleted {
    fn emit(self) {
        trace!(status = self.status.as_str(), "Work item completed");
        counter!("stratus_work_items_total", "status" => self.status.as_str()).increment(1);
    }
}

/// Event emitted when a transient failure triggers a retry.
pub struct RetryAttempted;

impl InternalEvent for RetryAttempted {
    fn emit(self) {
        trace!("Retry attempted");
        counter!("stratus_retry_attempts_total").increment(1);
    }
}

/// Event emitted when the walker emits a sub-range.
pub struct WindowEmitted;

impl InternalEvent for WindowEmitted {
    fn emit(self) {
        trace!("Window emitted");
        counter!("stratus_windows_emitted_total").increment(1);
    }
}

/// Event emitted when a sub-range commit succeeds.
pub struct WindowCommitted;

impl InternalEvent for WindowCommitted {
    fn emit(self) {
        trace!("Window committed");
        counter!("stratus_windows_committed_total").increment(1);
    }
}

/// Event emitted when a checkpoint write completes.
pub struct CheckpointWritten {
    pub duration: Duration,
}

impl InternalEvent for CheckpointWritten {
    fn emit(self) {
        trace!(
            duration_ms = self.duration.as_millis(),
            "Checkpoint written"
        );
        histogram!("stratus_checkpoint_write_duration_seconds").record(self.duration.as_secs_f64());
    }
}

/// Outcome of a reference-cache lookup.
#[derive(Debug, Clone, Copy)]
pub enum CacheOutcome {
    Hit,
    Miss,
    Stale,
}

impl CacheOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            CacheOutcome::Hit => "hit",
            CacheOutcome::Miss => "miss",
            CacheOutcome::Stale => "stale",
        }
    }
}

/// Event emitted for every reference-cache lookup.
pub struct CacheLookup {
    pub outcome: CacheOutcome,
}

impl InternalEvent for CacheLookup {
    fn emit(self) {
        trace!(outcome = self.outcome.as_str(), "Cache lookup");
        counter!("stratus_cache_lookups_total", "outcome" => self.outcome.as_str()).increment(1);
    }
}

/// Event emitted when a cache refresh fails and the stale value is kept.
pub struct CacheRefreshFailed;

impl InternalEvent for CacheRefreshFailed {
    fn emit(self) {
        trace!("Cache refresh failed");
        counter!("stratus_cache_refresh_failures_total").increment(1);
    }
}

// ============================================================================
// Gauge events for concurrency and backpressure
// ============================================================================

/// Event emitted when the number of active pool workers changes.
pub struct ActiveWorkers {
    pub count: usize,
}

impl InternalEvent for ActiveWorkers {
    fn emit(self) {
        trace!(count = self.count, "Active workers");
        gauge!("stratus_active_workers").set(self.count as f64);
    }
}

/// Event emitted when the work queue depth changes.
pub struct QueueDepth {
    pub count: usize,
}

impl InternalEvent for QueueDepth {
    fn emit(self) {
        trace!(count = self.count, "Queue depth");
        gauge!("stratus_queue_depth").set(self.count as f64);
    }
}

/// Event emitted when the pool watchdog sees no progress.
pub struct PoolStalled;

impl InternalEvent for PoolStalled {
    fn emit(self) {
        trace!("Pool stalled");
        counter!("stratus_pool_stalls_total").increment(1);
    }
}
