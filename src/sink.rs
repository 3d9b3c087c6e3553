//! Metric emission surface.
//!
//! The engine hands normalized points to a [`MetricSink`]; the concrete
//! line-oriented receiver client lives outside this crate. Send failures
//! are transient from the engine's point of view; drivers wrap `send`
//! with [`crate::retry::call_with_retry`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Error type surfaced by sink implementations.
pub type SinkError = Box<dyn std::error::Error + Send + Sync>;

/// A normalized metric point ready for transmission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    /// Sanitized metric name (see [`sanitize_name`]).
    pub name: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    /// The host or entity the point describes.
    pub source: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl MetricPoint {
    /// Create a point with no tags.
    pub fn new(
        name: impl Into<String>,
        value: f64,
        timestamp: DateTime<Utc>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            value,
            timestamp,
            source: source.into(),
            tags: BTreeMap::new(),
        }
    }

    /// Attach a tag.
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

/// Sink for normalized metric points.
#[async_trait]
pub trait MetricSink: Send + Sync {
    /// Transmit one point; failures are retryable.
    async fn send(&self, point: &MetricPoint) -> Result<(), SinkError>;
}

/// Normalize an upstream metric name for the receiver.
///
/// Lowercases, then applies `*` -> `all`, `.` -> `_`, `//` -> `.`,
/// `/` -> `.` in that order, and finally replaces anything outside
/// `[a-z0-9_.-]` with `_`. Upstream paths like
/// `apps/Shop Frontend/HttpDispatcher` become
/// `apps.shop_frontend.httpdispatcher`.
pub fn sanitize_name(name: &str) -> String {
    let lowered = name.to_lowercase();
    let replaced = lowered
        .replace('*', "all")
        .replace('.', "_")
        .replace("//", ".")
        .replace('/', ".");

    replaced
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
