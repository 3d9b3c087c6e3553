//! TTL-bounded reference-data cache.
//!
//! Collectors consult slow-changing reference data on the side of every
//! window: tag lookups, metric-name catalogs, inventory maps. Fetching
//! those on every cycle wastes upstream quota, so payloads are cached on
//! disk and refreshed lazily once stale. A restart keeps warm entries:
//! the fetch time of an on-disk payload is recovered from the file's
//! modified time.
//!
//! Keys are opaque caller strings and may contain characters unsuitable
//! for file names; the on-disk name is the SHA-256 hex digest of the key.
//! A stale entry is never deleted eagerly, and a failed refresh leaves
//! the previous payload untouched so a transient upstream failure does
//! not erase a still-useful value.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};
use snafu::prelude::*;
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::emit;
use crate::error::{
    CacheError, CreateCacheDirSnafu, DecodeEntrySnafu, EncodeEntrySnafu, ReadEntrySnafu,
    WriteEntrySnafu,
};
use crate::metrics::events::{CacheLookup, CacheOutcome, CacheRefreshFailed};

/// Error type produced by fetch closures.
pub type FetchError = Box<dyn std::error::Error + Send + Sync>;

/// A cached payload and when it was fetched.
#[derive(Debug, Clone)]
struct CacheEntry {
    payload: Value,
    fetched_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Fresh means `now - fetched_at <= ttl`. An entry stamped in the
    /// future (clock moved backwards) counts as fresh.
    fn is_fresh_at(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        match (now - self.fetched_at).to_std() {
            Ok(age) => age <= ttl,
            Err(_) => true,
        }
    }
}

/// TTL-bounded, disk-backed cache for reference data.
///
/// Shared across all workers in a cycle; concurrent lookups for the same
/// key converge on a single upstream fetch (best effort) via a per-key
/// flight lock. Readers may observe a slightly stale value while another
/// task refreshes, which is acceptable for reference data.
pub struct ReferenceCache {
    dir: PathBuf,
    entries: RwLock<HashMap<String, CacheEntry>>,
    flights: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ReferenceCache {
    /// Open (creating if needed) a cache rooted at `dir`.
    pub async fn new(dir: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .context(CreateCacheDirSnafu {
                path: dir.display().to_string(),
            })?;
        Ok(Self {
            dir,
            entries: RwLock::new(HashMap::new()),
            flights: Mutex::new(HashMap::new()),
        })
    }

    /// Return the payload for `key`, fetching it if missing or stale.
    ///
    /// On a fresh hit `fetch` is not invoked. On a miss or stale entry,
    /// `fetch` runs; its failure propagates and the previous payload, if
    /// any, is retained.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        fetch: F,
    ) -> Result<Value, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, FetchError>>,
    {
        // Fast path: fresh in-memory entry, no locks beyond the read.
        if let Some(payload) = self.lookup_fresh(key, ttl).await {
            emit!(CacheLookup {
                outcome: CacheOutcome::Hit
            });
            return Ok(payload);
        }

        // Single flight per key: whoever gets the lock fetches; everyone
        // queued behind it re-checks and finds the refreshed entry.
        let flight = self.flight_lock(key).await;
        let _guard = flight.lock().await;

        if let Some(payload) = self.lookup_fresh(key, ttl).await {
            emit!(CacheLookup {
                outcome: CacheOutcome::Hit
            });
            return Ok(payload);
        }

        // Adopt an on-disk entry left by a previous run.
        let known = self.entries.read().await.contains_key(key);
        if !known {
            if let Some(entry) = self.load_from_disk(key).await? {
                let fresh = entry.is_fresh_at(ttl, Utc::now());
                let payload = entry.payload.clone();
                self.entries.write().await.insert(key.to_string(), entry);
                if fresh {
                    emit!(CacheLookup {
                        outcome: CacheOutcome::Hit
                    });
                    return Ok(payload);
                }
            }
        }

        let stale = self.entries.read().await.contains_key(key);
        emit!(CacheLookup {
            outcome: if stale {
                CacheOutcome::Stale
            } else {
                CacheOutcome::Miss
            }
        });
        debug!(key, stale, "Refreshing reference data");

        let payload = match fetch().await {
            Ok(payload) => payload,
            Err(source) => {
                emit!(CacheRefreshFailed);
                warn!(key, "Reference fetch failed, keeping previous value: {}", source);
                return Err(CacheError::Fetch {
                    key: key.to_string(),
                    source,
                });
            }
        };

        self.store(key, payload.clone()).await?;
        Ok(payload)
    }

    /// The payload for `key` if a fresh in-memory entry exists.
    async fn lookup_fresh(&self, key: &str, ttl: Duration) -> Option<Value> {
        let entries = self.entries.read().await;
        let entry = entries.get(key)?;
        entry
            .is_fresh_at(ttl, Utc::now())
            .then(|| entry.payload.clone())
    }

    /// Get or create the per-key flight lock.
    async fn flight_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut flights = self.flights.lock().await;
        flights
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        let digest = hex::encode(Sha256::digest(key.as_bytes()));
        self.dir.join(format!("{}.json", digest))
    }

    /// Load an entry from disk, recovering `fetched_at` from the file's
    /// modified time. A missing file is a plain miss.
    async fn load_from_disk(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let path = self.entry_path(key);
        let contents = match tokio::fs::read(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).context(ReadEntrySnafu {
                    key: key.to_string(),
                });
            }
        };

        let payload: Value = serde_json::from_slice(&contents).context(DecodeEntrySnafu {
            key: key.to_string(),
        })?;

        let modified = tokio::fs::metadata(&path)
            .await
            .and_then(|m| m.modified())
            .context(ReadEntrySnafu {
                key: key.to_string(),
            })?;

        debug!(key, path = %path.display(), "Adopted cache entry from disk");
        Ok(Some(CacheEntry {
            payload,
            fetched_at: DateTime::<Utc>::from(modified),
        }))
    }

    /// Persist a freshly fetched payload and update the in-memory entry.
    async fn store(&self, key: &str, payload: Value) -> Result<(), CacheError> {
        let json = serde_json::to_vec(&payload).context(EncodeEntrySnafu {
            key: key.to_string(),
        })?;

        let write_ctx = || WriteEntrySnafu {
            key: key.to_string(),
        };

        // Write-then-rename so a concurrent reader never sees a torn
        // payload; the rename refreshes the file's modified time.
        let path = self.entry_path(key);
        let tmp_path = path.with_extension("tmp");
        let mut file = tokio::fs::File::create(&tmp_path)
            .await
            .with_context(|_| write_ctx())?;
        file.write_all(&json).await.with_context(|_| write_ctx())?;
        file.sync_all().await.with_context(|_| write_ctx())?;
        drop(file);
        tokio::fs::rename(&tmp_path, &path)
            .await
            .with_context(|_| write_ctx())?;

        self.entries.write().await.insert(
            key.to_string(),
            CacheEntry {
                payload,
                fetched_at: Utc::now(),
            },
        );
        debug!(key, "Cache entry refreshed");
        Ok(())
    }
}
