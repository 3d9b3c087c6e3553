//! Engine configuration.
//!
//! Handles loading configuration from YAML files and validating it before
//! any work is scheduled. Malformed values (zero workers, zero chunk cap)
//! fail fast with a `ConfigError` rather than surfacing mid-cycle.

use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::path::Path;
use std::time::Duration;

use crate::error::{
    ConfigError, EmptyCacheDirSnafu, EmptyCheckpointDirSnafu, ReadFileSnafu, YamlParseSnafu,
    ZeroAttemptsSnafu, ZeroChunkSnafu, ZeroWorkersSnafu,
};
use crate::retry::RetryPolicy;
use crate::window::ChunkPolicy;

/// Main configuration for a collection engine instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Number of concurrent workers per collection cycle (default: 4).
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Seconds between collection cycles (default: 60; 0 = run once).
    #[serde(default = "default_delay_secs")]
    pub delay_secs: u64,

    /// Directory where per-stream watermarks are persisted.
    pub checkpoint_dir: String,

    /// Time-window chunking configuration (optional).
    #[serde(default)]
    pub window: WindowConfig,

    /// Retry/backoff configuration (optional).
    #[serde(default)]
    pub retry: RetryConfig,

    /// Reference-data cache configuration (optional).
    #[serde(default)]
    pub cache: CacheConfig,

    /// Metrics configuration (optional, enabled by default).
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl EngineConfig {
    /// Load configuration from a YAML file and validate it.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).context(ReadFileSnafu)?;
        let config: EngineConfig = serde_yaml::from_str(&contents).context(YamlParseSnafu)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration, failing fast on malformed values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure!(self.workers >= 1, ZeroWorkersSnafu);
        ensure!(self.window.max_chunk_secs > 0, ZeroChunkSnafu);
        ensure!(self.retry.max_attempts >= 1, ZeroAttemptsSnafu);
        ensure!(!self.checkpoint_dir.is_empty(), EmptyCheckpointDirSnafu);
        ensure!(!self.cache.dir.is_empty(), EmptyCacheDirSnafu);
        Ok(())
    }

    /// Delay between collection cycles.
    pub fn cycle_delay(&self) -> Duration {
        Duration::from_secs(self.delay_secs)
    }
}

/// Time-window chunking configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowConfig {
    /// Upper bound on a single chunk, in seconds (default: 600).
    #[serde(default = "default_max_chunk_secs")]
    pub max_chunk_secs: u64,

    /// Spans shorter than this skip the cycle entirely, in seconds
    /// (default: 60).
    #[serde(default = "default_min_span_secs")]
    pub min_span_secs: u64,

    /// A trailing remainder shorter than this is absorbed into the final
    /// chunk, in seconds (default: 60; 0 disables merging).
    #[serde(default = "default_merge_slack_secs")]
    pub merge_slack_secs: u64,

    /// Throttle pause between chunks while the remaining span still
    /// exceeds the chunk cap, in seconds (default: 30).
    #[serde(default = "default_pause_secs")]
    pub pause_secs: u64,
}

impl WindowConfig {
    /// Convert to the walker's chunk policy.
    pub fn to_policy(&self) -> ChunkPolicy {
        ChunkPolicy {
            max_chunk: chrono::Duration::seconds(self.max_chunk_secs as i64),
            min_span: chrono::Duration::seconds(self.min_span_secs as i64),
            merge_slack: chrono::Duration::seconds(self.merge_slack_secs as i64),
            pause_between: Duration::from_secs(self.pause_secs),
        }
    }
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            max_chunk_secs: default_max_chunk_secs(),
            min_span_secs: default_min_span_secs(),
            merge_slack_secs: default_merge_slack_secs(),
            pause_secs: default_pause_secs(),
        }
    }
}

/// Retry/backoff configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum attempts per operation (default: 5).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base backoff delay in seconds, doubled after each failed attempt
    /// (default: 5).
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: u64,
}

impl RetryConfig {
    /// Convert to a retry policy.
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, Duration::from_secs(self.base_delay_secs))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_secs: default_base_delay_secs(),
        }
    }
}

/// Reference-data cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Directory where cached payloads are stored.
    #[serde(default = "default_cache_dir")]
    pub dir: String,

    /// Time-to-live for cached entries, in seconds (default: 86400).
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
}

impl CacheConfig {
    /// Entry time-to-live.
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: default_cache_dir(),
            ttl_secs: default_cache_ttl_secs(),
        }
    }
}

/// Metrics configuration for the Prometheus endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Whether metrics collection is enabled (default: true).
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,

    /// Address to bind the metrics HTTP server (default: "0.0.0.0:9090").
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            address: default_metrics_address(),
        }
    }
}

fn default_workers() -> usize {
    4
}

fn default_delay_secs() -> u64 {
    60
}

fn default_max_chunk_secs() -> u64 {
    600
}

fn default_min_span_secs() -> u64 {
    60
}

fn default_merge_slack_secs() -> u64 {
    60
}

fn default_pause_secs() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_secs() -> u64 {
    5
}

fn default_cache_dir() -> String {
    "/var/cache/stratus".to_string()
}

fn default_cache_ttl_secs() -> u64 {
    86400
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_address() -> String {
    "0.0.0.0:9090".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> EngineConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = parse("checkpoint_dir: /var/lib/stratus");
        assert_eq!(config.workers, 4);
        assert_eq!(config.delay_secs, 60);
        assert_eq!(config.window.max_chunk_secs, 600);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.cache.ttl_secs, 86400);
        assert!(config.metrics.enabled);
        config.validate().unwrap();
    }

    #[test]
    fn test_zero_workers_rejected() {
        let config = parse("checkpoint_dir: /var/lib/stratus\nworkers: 0");
        assert!(matches!(config.validate(), Err(ConfigError::ZeroWorkers)));
    }

    #[test]
    fn test_zero_chunk_rejected() {
        let config = parse("checkpoint_dir: /var/lib/stratus\nwindow:\n  max_chunk_secs: 0");
        assert!(matches!(config.validate(), Err(ConfigError::ZeroChunk)));
    }

    #[test]
    fn test_empty_checkpoint_dir_rejected() {
        let config = parse("checkpoint_dir: \"\"");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::EmptyCheckpointDir)
        ));
    }

    #[test]
    fn test_window_config_to_policy() {
        let config = parse(
            "checkpoint_dir: /var/lib/stratus\nwindow:\n  max_chunk_secs: 300\n  pause_secs: 10",
        );
        let policy = config.window.to_policy();
        assert_eq!(policy.max_chunk, chrono::Duration::seconds(300));
        assert_eq!(policy.pause_between, Duration::from_secs(10));
    }
}
