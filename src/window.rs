//! Time-window walking with persisted watermarks.
//!
//! A walker tiles a requested `[start, end)` interval into bounded,
//! contiguous chunks and advances the stream's watermark after each chunk
//! is committed. A crashed or restarted run resumes from the last
//! committed watermark: uncommitted ranges are re-emitted (at-least-once,
//! never at-most-once), committed ranges are never re-emitted.
//!
//! # Chunking
//!
//! Each chunk is capped at `max_chunk` (upstream samplers coarsen their
//! resolution beyond roughly ten minutes, so the cap keeps per-call
//! resolution stable). A trailing remainder shorter than `merge_slack` is
//! absorbed into the final chunk rather than emitted as a degenerate
//! window; the emitted ranges always tile the requested interval exactly.

use chrono::{DateTime, Utc};
use snafu::prelude::*;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::checkpoint::{CheckpointStore, Watermark};
use crate::emit;
use crate::error::{
    CommitCheckpointSnafu, CommitOutOfOrderSnafu, InvertedRangeSnafu, ResumeCheckpointSnafu,
    WindowError,
};
use crate::metrics::events::{CheckpointWritten, WindowCommitted, WindowEmitted};

/// Half-open time range: `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    /// Inclusive start.
    pub start: DateTime<Utc>,
    /// Exclusive end.
    pub end: DateTime<Utc>,
}

impl TimeRange {
    /// Create a range; `start` must not be after `end`.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        debug_assert!(start <= end, "inverted range");
        Self { start, end }
    }

    /// Length of the range.
    pub fn span(&self) -> chrono::Duration {
        self.end - self.start
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Chunking policy for walking a requested range.
#[derive(Debug, Clone, Copy)]
pub struct ChunkPolicy {
    /// Upper bound on a single chunk.
    pub max_chunk: chrono::Duration,
    /// Effective spans shorter than this skip the cycle entirely,
    /// avoiding thrashing on too-fresh data.
    pub min_span: chrono::Duration,
    /// A trailing remainder shorter than this is absorbed into the final
    /// chunk (which may then exceed `max_chunk` by less than the slack).
    /// Zero disables merging.
    pub merge_slack: chrono::Duration,
    /// Throttle pause before each chunk after the first, while the
    /// remaining span still exceeds `max_chunk`.
    pub pause_between: Duration,
}

impl Default for ChunkPolicy {
    fn default() -> Self {
        Self {
            max_chunk: chrono::Duration::minutes(10),
            min_span: chrono::Duration::seconds(60),
            merge_slack: chrono::Duration::seconds(60),
            pause_between: Duration::from_secs(30),
        }
    }
}

/// Walks `[start, end)` in bounded chunks, committing watermarks in order.
///
/// Typical driver loop:
///
/// ```ignore
/// let Some(mut walker) = WindowWalker::resume(store, "newrelic", start, end, policy, token).await?
/// else {
///     return Ok(()); // nothing to do this cycle
/// };
/// while let Some(range) = walker.next_window().await {
///     process(range).await?;
///     walker.commit(range).await?;
/// }
/// ```
pub struct WindowWalker {
    stream_id: String,
    store: Arc<dyn CheckpointStore>,
    policy: ChunkPolicy,
    token: CancellationToken,
    /// Start of the next range to emit.
    cursor: DateTime<Utc>,
    end: DateTime<Utc>,
    /// Start position of the oldest uncommitted range.
    committed: DateTime<Utc>,
    first: bool,
}

impl WindowWalker {
    /// Resume a walker for `stream_id` over `[requested_start, requested_end)`.
    ///
    /// The effective start is clamped forward to the persisted watermark,
    /// so ranges at or below an already committed watermark are never
    /// re-emitted. Returns `Ok(None)` when there is nothing to do this
    /// cycle: the stream is already caught up, or the effective span is
    /// below the policy's `min_span`.
    pub async fn resume(
        store: Arc<dyn CheckpointStore>,
        stream_id: impl Into<String>,
        requested_start: DateTime<Utc>,
        requested_end: DateTime<Utc>,
        policy: ChunkPolicy,
        token: CancellationToken,
    ) -> Result<Option<Self>, WindowError> {
        let stream_id = stream_id.into();
        ensure!(
            requested_start <= requested_end,
            InvertedRangeSnafu {
                start: requested_start.to_rfc3339(),
                end: requested_end.to_rfc3339(),
            }
        );

        let watermark = store
            .get(&stream_id)
            .await
            .context(ResumeCheckpointSnafu)?;

        let effective_start = match watermark {
            Some(Watermark::Timestamp { at }) if at > requested_start => {
                info!(
                    stream_id,
                    watermark = %at,
                    "Resuming from persisted watermark"
                );
                at
            }
            Some(Watermark::Sequence { ref id }) => {
                // A cursor watermark cannot position a time walker; the
                // driver that wrote it walks by cursor, not by time.
                warn!(
                    stream_id,
                    cursor = id.as_str(),
                    "Ignoring non-timestamp watermark"
                );
                requested_start
            }
            _ => requested_start,
        };

        if effective_start >= requested_end {
            debug!(stream_id = stream_id.as_str(), "Stream already caught up");
            return Ok(None);
        }

        if requested_end - effective_start < policy.min_span {
            info!(
                stream_id = stream_id.as_str(),
                span_secs = (requested_end - effective_start).num_seconds(),
                "Span below minimum, skipping cycle"
            );
            return Ok(None);
        }

        Ok(Some(Self {
            stream_id,
            store,
            policy,
            token,
            cursor: effective_start,
            end: requested_end,
            committed: effective_start,
            first: true,
        }))
    }

    /// The logical stream this walker advances.
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Span not yet emitted.
    pub fn remaining(&self) -> chrono::Duration {
        self.end - self.cursor
    }

    /// Emit the next sub-range, or `None` when the requested interval is
    /// exhausted or cancellation has been observed.
    ///
    /// Between chunks, while the remaining span still exceeds the chunk
    /// cap, a deliberate pause throttles the upstream call rate; the
    /// pause races the cancellation token and never outlives it by more
    /// than the sleep granularity.
    pub async fn next_window(&mut self) -> Option<TimeRange> {
        if self.token.is_cancelled() {
            debug!(stream_id = self.stream_id.as_str(), "Cancelled, stopping walk");
            return None;
        }

        let remaining = self.remaining();
        if remaining <= chrono::Duration::zero() {
            return None;
        }

        if !self.first && remaining > self.policy.max_chunk && !self.throttle_pause().await {
            return None;
        }

        let len = if remaining <= self.policy.max_chunk {
            remaining
        } else {
            let after = remaining - self.policy.max_chunk;
            if after < self.policy.merge_slack {
                // Absorb a degenerate trailing window into this chunk.
                remaining
            } else {
                self.policy.max_chunk
            }
        };

        let range = TimeRange::new(self.cursor, self.cursor + len);
        self.cursor = range.end;
        self.first = false;
        emit!(WindowEmitted);
        debug!(stream_id = self.stream_id.as_str(), range = %range, "Emitting window");
        Some(range)
    }

    /// Sleep the inter-chunk pause; returns false if cancelled during it.
    async fn throttle_pause(&self) -> bool {
        if self.policy.pause_between.is_zero() {
            return true;
        }
        debug!(
            stream_id = self.stream_id.as_str(),
            pause_secs = self.policy.pause_between.as_secs(),
            "Throttling before next chunk"
        );
        tokio::select! {
            _ = self.token.cancelled() => false,
            _ = tokio::time::sleep(self.policy.pause_between) => true,
        }
    }

    /// Commit a fully processed range, durably persisting `range.end` as
    /// the stream's watermark.
    ///
    /// Ranges must be committed in emission order; a commit for anything
    /// other than the oldest uncommitted range is rejected. A failed
    /// commit leaves the watermark untouched; the caller must treat it
    /// as fatal for this cycle's progress so the range is re-processed on
    /// the next run.
    pub async fn commit(&mut self, range: TimeRange) -> Result<(), WindowError> {
        ensure!(
            range.start == self.committed && range.end <= self.cursor,
            CommitOutOfOrderSnafu {
                stream_id: self.stream_id.clone(),
                expected: self.committed.to_rfc3339(),
                got: range.to_string(),
            }
        );

        let started = Instant::now();
        self.store
            .set(&self.stream_id, Watermark::timestamp(range.end))
            .await
            .context(CommitCheckpointSnafu)?;
        self.committed = range.end;

        emit!(WindowCommitted);
        emit!(CheckpointWritten {
            duration: started.elapsed()
        });
        debug!(stream_id = self.stream_id.as_str(), range = %range, "Committed window");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryCheckpointStore;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn mins(m: i64) -> chrono::Duration {
        chrono::Duration::minutes(m)
    }

    fn policy_no_pause() -> ChunkPolicy {
        ChunkPolicy {
            pause_between: Duration::ZERO,
            ..ChunkPolicy::default()
        }
    }

    async fn walker_over(
        store: Arc<dyn CheckpointStore>,
        span: chrono::Duration,
        policy: ChunkPolicy,
    ) -> WindowWalker {
        WindowWalker::resume(
            store,
            "test-stream",
            t0(),
            t0() + span,
            policy,
            CancellationToken::new(),
        )
        .await
        .unwrap()
        .unwrap()
    }

    async fn collect_ranges(walker: &mut WindowWalker) -> Vec<TimeRange> {
        let mut ranges = Vec::new();
        while let Some(range) = walker.next_window().await {
            walker.commit(range).await.unwrap();
            ranges.push(range);
        }
        ranges
    }

    #[tokio::test]
    async fn test_ranges_tile_requested_interval() {
        for span_mins in [10, 25, 30, 47, 61] {
            let store: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::new());
            let mut walker = walker_over(store, mins(span_mins), policy_no_pause()).await;
            let ranges = collect_ranges(&mut walker).await;

            assert_eq!(ranges.first().unwrap().start, t0());
            assert_eq!(ranges.last().unwrap().end, t0() + mins(span_mins));
            for pair in ranges.windows(2) {
                assert_eq!(pair[0].end, pair[1].start, "ranges must be contiguous");
                assert!(pair[0].start < pair[1].start, "ranges must increase");
            }
        }
    }

    #[tokio::test]
    async fn test_twenty_five_minutes_yields_three_chunks() {
        let store: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::new());
        let mut walker = walker_over(store, mins(25), policy_no_pause()).await;
        let ranges = collect_ranges(&mut walker).await;

        assert_eq!(
            ranges,
            vec![
                TimeRange::new(t0(), t0() + mins(10)),
                TimeRange::new(t0() + mins(10), t0() + mins(20)),
                TimeRange::new(t0() + mins(20), t0() + mins(25)),
            ]
        );
    }

    #[tokio::test]
    async fn test_short_remainder_merged_into_final_chunk() {
        let store: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::new());
        let policy = ChunkPolicy {
            merge_slack: chrono::Duration::seconds(30),
            pause_between: Duration::ZERO,
            ..ChunkPolicy::default()
        };
        // 20m10s: the trailing 10s is below the slack and gets absorbed.
        let span = mins(20) + chrono::Duration::seconds(10);
        let mut walker = walker_over(store, span, policy).await;
        let ranges = collect_ranges(&mut walker).await;

        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].span(), mins(10));
        assert_eq!(ranges[1].span(), mins(10) + chrono::Duration::seconds(10));
        assert_eq!(ranges[1].end, t0() + span);
    }

    #[tokio::test]
    async fn test_span_below_minimum_skips_cycle() {
        let store: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::new());
        let walker = WindowWalker::resume(
            store,
            "test-stream",
            t0(),
            t0() + chrono::Duration::seconds(45),
            policy_no_pause(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(walker.is_none());
    }

    #[tokio::test]
    async fn test_resume_clamps_start_to_watermark() {
        let store: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::new());
        store
            .set("test-stream", Watermark::timestamp(t0() + mins(20)))
            .await
            .unwrap();

        let mut walker = WindowWalker::resume(
            store,
            "test-stream",
            t0(),
            t0() + mins(25),
            policy_no_pause(),
            CancellationToken::new(),
        )
        .await
        .unwrap()
        .unwrap();

        let range = walker.next_window().await.unwrap();
        assert_eq!(range, TimeRange::new(t0() + mins(20), t0() + mins(25)));
    }

    #[tokio::test]
    async fn test_watermark_beyond_end_yields_nothing() {
        let store: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::new());
        store
            .set("test-stream", Watermark::timestamp(t0() + mins(30)))
            .await
            .unwrap();

        let walker = WindowWalker::resume(
            store,
            "test-stream",
            t0(),
            t0() + mins(25),
            policy_no_pause(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(walker.is_none());
    }

    #[tokio::test]
    async fn test_uncommitted_range_reemitted_on_resume() {
        let store: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::new());

        let mut walker = WindowWalker::resume(
            store.clone(),
            "test-stream",
            t0(),
            t0() + mins(25),
            policy_no_pause(),
            CancellationToken::new(),
        )
        .await
        .unwrap()
        .unwrap();
        let first = walker.next_window().await.unwrap();
        // Processing "crashes" here: no commit.
        drop(walker);

        let mut walker = WindowWalker::resume(
            store,
            "test-stream",
            t0(),
            t0() + mins(25),
            policy_no_pause(),
            CancellationToken::new(),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(walker.next_window().await.unwrap(), first);
    }

    #[tokio::test]
    async fn test_out_of_order_commit_rejected() {
        let store: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::new());
        let mut walker = walker_over(store, mins(25), policy_no_pause()).await;

        let first = walker.next_window().await.unwrap();
        let second = walker.next_window().await.unwrap();

        let err = walker.commit(second).await.unwrap_err();
        assert!(matches!(err, WindowError::CommitOutOfOrder { .. }));

        // Committing in order still works.
        walker.commit(first).await.unwrap();
        walker.commit(second).await.unwrap();
    }

    #[tokio::test]
    async fn test_cancellation_stops_emission() {
        let store: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::new());
        let token = CancellationToken::new();
        let mut walker = WindowWalker::resume(
            store,
            "test-stream",
            t0(),
            t0() + mins(25),
            policy_no_pause(),
            token.clone(),
        )
        .await
        .unwrap()
        .unwrap();

        let range = walker.next_window().await.unwrap();
        walker.commit(range).await.unwrap();

        token.cancel();
        assert!(walker.next_window().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_between_chunks_is_cancellable() {
        let store: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::new());
        let token = CancellationToken::new();
        let policy = ChunkPolicy {
            pause_between: Duration::from_secs(30),
            ..ChunkPolicy::default()
        };
        let mut walker = WindowWalker::resume(
            store,
            "test-stream",
            t0(),
            t0() + mins(25),
            policy,
            token.clone(),
        )
        .await
        .unwrap()
        .unwrap();

        let range = walker.next_window().await.unwrap();
        walker.commit(range).await.unwrap();

        // Cancel while the walker is in its inter-chunk pause.
        let cancel = tokio::spawn({
            let token = token.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                token.cancel();
            }
        });

        assert!(walker.next_window().await.is_none());
        cancel.await.unwrap();
    }

    #[tokio::test]
    async fn test_inverted_range_rejected() {
        let store: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::new());
        let result = WindowWalker::resume(
            store,
            "test-stream",
            t0() + mins(10),
            t0(),
            policy_no_pause(),
            CancellationToken::new(),
        )
        .await;

        assert!(matches!(result, Err(WindowError::InvertedRange { .. })));
    }
}
