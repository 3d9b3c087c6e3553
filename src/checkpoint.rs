//! Watermark persistence for resumable collection.
//!
//! Each logical stream (one per collector configuration section) owns a
//! single monotonic watermark: the position of the last fully processed
//! record. The store persists watermarks durably before `set` returns, so
//! a crash immediately afterwards never loses a committed range. Streams
//! are independently addressable; no cross-stream atomicity is provided
//! or required.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{
    CheckpointError, CreateCheckpointDirSnafu, DecodeCheckpointSnafu, EncodeCheckpointSnafu,
    ListCheckpointsSnafu, ReadCheckpointSnafu, WriteCheckpointSnafu,
};

/// Position of the last fully processed record in a logical stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Watermark {
    /// End of the last committed time window (exclusive).
    Timestamp { at: DateTime<Utc> },
    /// Opaque upstream cursor (e.g. a billing report id).
    Sequence { id: String },
}

impl Watermark {
    /// Create a timestamp watermark.
    pub fn timestamp(at: DateTime<Utc>) -> Self {
        Watermark::Timestamp { at }
    }

    /// Create an opaque sequence watermark.
    pub fn sequence(id: impl Into<String>) -> Self {
        Watermark::Sequence { id: id.into() }
    }

    /// The timestamp, if this is a time watermark.
    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Watermark::Timestamp { at } => Some(*at),
            Watermark::Sequence { .. } => None,
        }
    }
}

/// Stored representation: the watermark plus the original stream id, so
/// `list` can recover ids that were sanitized for file-system use.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CheckpointRecord {
    stream_id: String,
    watermark: Watermark,
}

/// Durable per-stream watermark storage.
///
/// Implementations must guarantee that `set` is durable before it
/// returns, and that concurrent `set` calls for different stream ids
/// never corrupt unrelated entries.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Read the persisted watermark for a stream, if any.
    async fn get(&self, stream_id: &str) -> Result<Option<Watermark>, CheckpointError>;

    /// Durably persist a stream's watermark.
    async fn set(&self, stream_id: &str, watermark: Watermark) -> Result<(), CheckpointError>;

    /// List the stream ids with a persisted watermark.
    async fn list(&self) -> Result<Vec<String>, CheckpointError>;
}

/// File-backed checkpoint store: one JSON file per stream.
///
/// Writes go to a uniquely named temp file, are flushed with `sync_all`,
/// and are renamed into place, so readers and concurrent writers only
/// ever observe a complete record.
pub struct FileCheckpointStore {
    dir: PathBuf,
    write_seq: AtomicU64,
}

impl FileCheckpointStore {
    /// Open (creating if needed) a checkpoint store in `dir`.
    pub async fn new(dir: impl Into<PathBuf>) -> Result<Self, CheckpointError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .context(CreateCheckpointDirSnafu {
                path: dir.display().to_string(),
            })?;
        Ok(Self {
            dir,
            write_seq: AtomicU64::new(0),
        })
    }

    fn entry_path(&self, stream_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sanitize_stream_id(stream_id)))
    }
}

/// Replace characters unsuitable for file names; stream ids may contain
/// arbitrary section-name characters.
fn sanitize_stream_id(stream_id: &str) -> String {
    stream_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn get(&self, stream_id: &str) -> Result<Option<Watermark>, CheckpointError> {
        let path = self.entry_path(stream_id);
        let contents = match tokio::fs::read(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).context(ReadCheckpointSnafu {
                    stream_id: stream_id.to_string(),
                });
            }
        };

        let record: CheckpointRecord =
            serde_json::from_slice(&contents).context(DecodeCheckpointSnafu {
                stream_id: stream_id.to_string(),
            })?;
        Ok(Some(record.watermark))
    }

    async fn set(&self, stream_id: &str, watermark: Watermark) -> Result<(), CheckpointError> {
        let record = CheckpointRecord {
            stream_id: stream_id.to_string(),
            watermark,
        };
        let json = serde_json::to_vec_pretty(&record).context(EncodeCheckpointSnafu {
            stream_id: stream_id.to_string(),
        })?;

        // Unique temp name so concurrent writers for the same stream
        // never share a partially written file.
        let seq = self.write_seq.fetch_add(1, Ordering::Relaxed);
        let final_path = self.entry_path(stream_id);
        let tmp_path = self
            .dir
            .join(format!(".{}.{}.tmp", sanitize_stream_id(stream_id), seq));

        let write_ctx = || WriteCheckpointSnafu {
            stream_id: stream_id.to_string(),
        };

        let mut file = tokio::fs::File::create(&tmp_path)
            .await
            .with_context(|_| write_ctx())?;
        file.write_all(&json).await.with_context(|_| write_ctx())?;
        // Durability before returning: callers assume the watermark
        // survives a crash immediately after set().
        file.sync_all().await.with_context(|_| write_ctx())?;
        drop(file);

        tokio::fs::rename(&tmp_path, &final_path)
            .await
            .with_context(|_| write_ctx())?;

        debug!(
            stream_id,
            path = %final_path.display(),
            "Checkpoint persisted"
        );
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>, CheckpointError> {
        let list_ctx = || ListCheckpointsSnafu {
            path: self.dir.display().to_string(),
        };

        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .with_context(|_| list_ctx())?;
        let mut streams = Vec::new();

        while let Some(entry) = entries.next_entry().await.with_context(|_| list_ctx())? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(record) = read_record(&path).await {
                streams.push(record.stream_id);
            }
        }

        streams.sort();
        Ok(streams)
    }
}

/// Best-effort read of a stored record; unreadable files are skipped
/// (a concurrent rename may have raced us).
async fn read_record(path: &Path) -> Option<CheckpointRecord> {
    let contents = tokio::fs::read(path).await.ok()?;
    serde_json::from_slice(&contents).ok()
}

/// In-memory checkpoint store for tests and embedding.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    entries: Mutex<HashMap<String, Watermark>>,
}

impl MemoryCheckpointStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn get(&self, stream_id: &str) -> Result<Option<Watermark>, CheckpointError> {
        Ok(self.entries.lock().await.get(stream_id).cloned())
    }

    async fn set(&self, stream_id: &str, watermark: Watermark) -> Result<(), CheckpointError> {
        self.entries
            .lock()
            .await
            .insert(stream_id.to_string(), watermark);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>, CheckpointError> {
        let mut streams: Vec<String> = self.entries.lock().await.keys().cloned().collect();
        streams.sort();
        Ok(streams)
    }
}
