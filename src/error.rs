//! Error types for stratus using snafu.
//!
//! This module defines structured error types with context selectors for
//! each subsystem, plus the top-level `EngineError` that aggregates them.
//! Cancellation is a distinguished outcome (`EngineError::Cancelled` here,
//! `RetryError::Cancelled` in the retry module) and is never treated as an
//! upstream failure.

use snafu::prelude::*;

// ============ Config Errors ============

/// Errors that can occur during configuration parsing and validation.
///
/// These are fatal: they are raised before any work items are scheduled.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[snafu(display("Failed to read configuration file"))]
    ReadFile { source: std::io::Error },

    /// Failed to parse YAML configuration.
    #[snafu(display("Failed to parse YAML configuration"))]
    YamlParse { source: serde_yaml::Error },

    /// Worker count must be at least one.
    #[snafu(display("workers must be at least 1"))]
    ZeroWorkers,

    /// Chunk cap must be positive.
    #[snafu(display("window.max_chunk_secs must be positive"))]
    ZeroChunk,

    /// Retry attempt budget must be at least one.
    #[snafu(display("retry.max_attempts must be at least 1"))]
    ZeroAttempts,

    /// Checkpoint directory is required.
    #[snafu(display("checkpoint_dir cannot be empty"))]
    EmptyCheckpointDir,

    /// Cache directory is required.
    #[snafu(display("cache.dir cannot be empty"))]
    EmptyCacheDir,
}

// ============ Checkpoint Errors ============

/// Errors that can occur while persisting or reading watermarks.
///
/// A `set` failure must be treated as fatal for the cycle's progress:
/// the range is not committed and will be re-processed on the next run.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CheckpointError {
    /// Failed to create the checkpoint directory.
    #[snafu(display("Failed to create checkpoint directory {path}"))]
    CreateCheckpointDir {
        path: String,
        source: std::io::Error,
    },

    /// Failed to read a stream's checkpoint file.
    #[snafu(display("Failed to read checkpoint for stream {stream_id}"))]
    ReadCheckpoint {
        stream_id: String,
        source: std::io::Error,
    },

    /// Failed to write a stream's checkpoint file.
    #[snafu(display("Failed to write checkpoint for stream {stream_id}"))]
    WriteCheckpoint {
        stream_id: String,
        source: std::io::Error,
    },

    /// Failed to decode a stored checkpoint.
    #[snafu(display("Failed to decode checkpoint for stream {stream_id}"))]
    DecodeCheckpoint {
        stream_id: String,
        source: serde_json::Error,
    },

    /// Failed to encode a checkpoint for storage.
    #[snafu(display("Failed to encode checkpoint for stream {stream_id}"))]
    EncodeCheckpoint {
        stream_id: String,
        source: serde_json::Error,
    },

    /// Failed to list the checkpoint directory.
    #[snafu(display("Failed to list checkpoint directory {path}"))]
    ListCheckpoints {
        path: String,
        source: std::io::Error,
    },
}

// ============ Window Errors ============

/// Errors from the time-window walker.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum WindowError {
    /// The requested range is inverted.
    #[snafu(display("Invalid range: start {start} is after end {end}"))]
    InvertedRange { start: String, end: String },

    /// Ranges must be committed in emission order.
    #[snafu(display(
        "Out-of-order commit for stream {stream_id}: expected a range starting at {expected}, got {got}"
    ))]
    CommitOutOfOrder {
        stream_id: String,
        expected: String,
        got: String,
    },

    /// The underlying watermark write failed; the range is not committed.
    #[snafu(display("Checkpoint write failed"))]
    CommitCheckpoint { source: CheckpointError },

    /// Reading the persisted watermark failed.
    #[snafu(display("Checkpoint read failed"))]
    ResumeCheckpoint { source: CheckpointError },
}

// ============ Cache Errors ============

/// Errors from the reference-data cache.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CacheError {
    /// Failed to create the cache directory.
    #[snafu(display("Failed to create cache directory {path}"))]
    CreateCacheDir {
        path: String,
        source: std::io::Error,
    },

    /// Failed to read a cached entry from disk.
    #[snafu(display("Failed to read cache entry for key {key}"))]
    ReadEntry {
        key: String,
        source: std::io::Error,
    },

    /// Failed to write a cache entry to disk.
    #[snafu(display("Failed to write cache entry for key {key}"))]
    WriteEntry {
        key: String,
        source: std::io::Error,
    },

    /// A cached entry on disk is not valid JSON.
    #[snafu(display("Failed to decode cache entry for key {key}"))]
    DecodeEntry {
        key: String,
        source: serde_json::Error,
    },

    /// Failed to encode a payload for storage.
    #[snafu(display("Failed to encode cache entry for key {key}"))]
    EncodeEntry {
        key: String,
        source: serde_json::Error,
    },

    /// The upstream fetch failed; any previously cached value is retained.
    #[snafu(display("Fetch failed for key {key}"))]
    Fetch {
        key: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

// ============ Metrics Errors ============

/// Errors that can occur during metrics initialization.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MetricsError {
    /// Failed to initialize Prometheus recorder.
    #[snafu(display("Failed to initialize Prometheus recorder"))]
    PrometheusInit {
        source: metrics_exporter_prometheus::BuildError,
    },

    /// Failed to parse the metrics listen address.
    #[snafu(display("Failed to parse metrics address"))]
    AddressParse { source: std::net::AddrParseError },
}

// ============ Engine Error (top-level) ============

/// Top-level engine errors that aggregate all subsystem error types.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum EngineError {
    /// Configuration error.
    #[snafu(display("Configuration error"))]
    Config { source: ConfigError },

    /// Checkpoint persistence error.
    #[snafu(display("Checkpoint error"))]
    Checkpoint { source: CheckpointError },

    /// Time-window walker error.
    #[snafu(display("Window error"))]
    Window { source: WindowError },

    /// Reference-data cache error.
    #[snafu(display("Cache error"))]
    Cache { source: CacheError },

    /// Metrics error.
    #[snafu(display("Metrics error"))]
    Metrics { source: MetricsError },

    /// Cancellation was observed; not a failure.
    #[snafu(display("Cancelled"))]
    Cancelled,
}

impl EngineError {
    /// Check if this error is the distinguished cancellation outcome.
    ///
    /// Cancellation propagates through the engine as an error value but
    /// must never be logged or counted as a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, EngineError::Cancelled)
    }
}
