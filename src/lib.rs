//! stratus: an incremental, resumable, concurrent collection engine.
//!
//! stratus is the machinery shared by metrics pollers that read from
//! upstream APIs (application-performance monitors, cloud billing and
//! metrics, on-host checks) and forward normalized points to a
//! line-oriented receiver:
//!
//! - `window` walks a time range in bounded chunks and persists a
//!   watermark through `checkpoint`, so a crashed or restarted run
//!   resumes without gaps or double-counting (at-least-once).
//! - `pool` fans independent fetch/transform/send operations across a
//!   bounded worker set with cooperative cancellation.
//! - `retry` wraps upstream calls with classifier-driven exponential
//!   backoff that respects cancellation.
//! - `cache` keeps a TTL-bounded, disk-backed copy of slow-changing
//!   reference data (tag lookups, metric-name catalogs).
//! - `polling` supplies the outer cycle loop drivers run inside.
//!
//! Cancellation is a single shared [`CancellationToken`] passed
//! explicitly to every component; setting it (usually via
//! [`signal::bind_shutdown`]) is observed at every suspension point.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use stratus::{
//!     CancellationToken, ChunkPolicy, FileCheckpointStore, WindowWalker, WorkItem, WorkPool,
//! };
//!
//! let token = CancellationToken::new();
//! stratus::signal::bind_shutdown(token.clone());
//!
//! let store = Arc::new(FileCheckpointStore::new("/var/lib/stratus").await?);
//! let Some(mut walker) = WindowWalker::resume(
//!     store, "newrelic", start, end, ChunkPolicy::default(), token.clone(),
//! ).await? else {
//!     return Ok(()); // too little new data; skip this cycle
//! };
//!
//! let pool = WorkPool::new(8, token.clone());
//! while let Some(range) = walker.next_window().await {
//!     let items: Vec<WorkItem> = build_items_for(range);
//!     pool.run(items).await;
//!     walker.commit(range).await?;
//! }
//! ```

pub mod cache;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod polling;
pub mod pool;
pub mod retry;
pub mod signal;
pub mod sink;
pub mod window;

// Re-export main types
pub use cache::ReferenceCache;
pub use checkpoint::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore, Watermark};
pub use config::EngineConfig;
pub use error::EngineError;
pub use polling::{run_collection_loop, CycleOutcome, PollingCollector};
pub use pool::{PoolStats, WorkItem, WorkPool};
pub use retry::{call_with_retry, FailureClass, RetryError, RetryPolicy};
pub use sink::{MetricPoint, MetricSink};
pub use window::{ChunkPolicy, TimeRange, WindowWalker};

// The shared cancellation capability; re-exported so drivers depend on
// one crate for the engine surface.
pub use tokio_util::sync::CancellationToken;
