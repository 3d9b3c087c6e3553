//! End-to-end collection cycle: walker + pool + retry + cache wired the
//! way a driver wires them, against real files and a fake upstream.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use stratus::cache::ReferenceCache;
use stratus::checkpoint::{CheckpointStore, FileCheckpointStore};
use stratus::pool::{BoxError, WorkItem, WorkPool};
use stratus::retry::{call_with_retry, FailureClass, RetryPolicy};
use stratus::window::{ChunkPolicy, WindowWalker};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

/// Fake upstream: fails the first call per entity, then succeeds.
struct FlakyUpstream {
    calls: AtomicUsize,
    sent: AtomicUsize,
}

impl FlakyUpstream {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            sent: AtomicUsize::new(0),
        }
    }

    async fn fetch_and_send(&self, attempt_tracker: &AtomicUsize) -> Result<(), String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if attempt_tracker.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err("503 service unavailable".to_string());
        }
        self.sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A full cycle over 25 minutes of data and three entities per window:
/// every window commits, every entity retries through its first
/// transient failure, and the reference cache is fetched exactly once.
#[tokio::test]
async fn test_full_cycle_commits_all_windows() {
    let checkpoint_dir = tempfile::TempDir::new().unwrap();
    let cache_dir = tempfile::TempDir::new().unwrap();

    let token = CancellationToken::new();
    let store: Arc<dyn CheckpointStore> = Arc::new(
        FileCheckpointStore::new(checkpoint_dir.path())
            .await
            .unwrap(),
    );
    let cache = Arc::new(ReferenceCache::new(cache_dir.path()).await.unwrap());
    let upstream = Arc::new(FlakyUpstream::new());
    let tag_fetches = Arc::new(AtomicUsize::new(0));

    let policy = ChunkPolicy {
        pause_between: Duration::ZERO,
        ..ChunkPolicy::default()
    };
    let mut walker = WindowWalker::resume(
        store.clone(),
        "cloud-metrics",
        t0(),
        t0() + chrono::Duration::minutes(25),
        policy,
        token.clone(),
    )
    .await
    .unwrap()
    .unwrap();

    let pool = WorkPool::new(2, token.clone());
    let retry = RetryPolicy::new(3, Duration::from_millis(1));
    let mut windows = 0;

    while let Some(range) = walker.next_window().await {
        let mut items = Vec::new();
        for entity in ["web-1", "web-2", "db-1"] {
            let token = token.clone();
            let cache = cache.clone();
            let upstream = upstream.clone();
            let tag_fetches = tag_fetches.clone();
            items.push(WorkItem::new(
                format!("{}@{}", entity, range.start),
                async move {
                    // Side lookup through the TTL cache.
                    let tags = cache
                        .get_or_fetch("instance-tags", Duration::from_secs(3600), move || {
                            async move {
                                tag_fetches.fetch_add(1, Ordering::SeqCst);
                                Ok(json!({ "web-1": "frontend" }))
                            }
                        })
                        .await
                        .map_err(|e| -> BoxError { e.to_string().into() })?;
                    assert!(tags.is_object());

                    // Upstream call with its first failure retried.
                    let attempts = AtomicUsize::new(0);
                    call_with_retry(retry, &token, |_: &String| FailureClass::Transient, || {
                        upstream.fetch_and_send(&attempts)
                    })
                    .await
                    .map_err(|e| -> BoxError { e.to_string().into() })?;
                    Ok(())
                },
            ));
        }

        let stats = pool.run(items).await;
        assert_eq!(stats.succeeded, 3);
        assert_eq!(stats.failed, 0);

        walker.commit(range).await.unwrap();
        windows += 1;
    }

    assert_eq!(windows, 3);
    // 3 windows x 3 entities, each with one failed then one successful call.
    assert_eq!(upstream.sent.load(Ordering::SeqCst), 9);
    assert_eq!(upstream.calls.load(Ordering::SeqCst), 18);
    // The tag lookup hit upstream once; everything else was cached.
    assert_eq!(tag_fetches.load(Ordering::SeqCst), 1);

    // The watermark reflects the final commit.
    let watermark = store.get("cloud-metrics").await.unwrap().unwrap();
    assert_eq!(
        watermark.as_timestamp(),
        Some(t0() + chrono::Duration::minutes(25))
    );
}

/// Cancelling mid-cycle stops the walker before the next window and
/// leaves the watermark at the last committed range, ready to resume.
#[tokio::test]
async fn test_cancellation_mid_cycle_preserves_watermark() {
    let checkpoint_dir = tempfile::TempDir::new().unwrap();

    let token = CancellationToken::new();
    let store: Arc<dyn CheckpointStore> = Arc::new(
        FileCheckpointStore::new(checkpoint_dir.path())
            .await
            .unwrap(),
    );

    let policy = ChunkPolicy {
        pause_between: Duration::ZERO,
        ..ChunkPolicy::default()
    };
    let mut walker = WindowWalker::resume(
        store.clone(),
        "cloud-metrics",
        t0(),
        t0() + chrono::Duration::minutes(25),
        policy,
        token.clone(),
    )
    .await
    .unwrap()
    .unwrap();

    let range = walker.next_window().await.unwrap();
    walker.commit(range).await.unwrap();
    token.cancel();
    assert!(walker.next_window().await.is_none());

    let watermark = store.get("cloud-metrics").await.unwrap().unwrap();
    assert_eq!(
        watermark.as_timestamp(),
        Some(t0() + chrono::Duration::minutes(10))
    );
}
