use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{ArchiveMode, CompressionLevel};
use crate::core::record::Record;
use crate::core::types::Timestamp;

/// Immutable point-in-time extract of the store.
///
/// Records are individually consistent but may come from slightly
/// different moments; `taken_at` marks when extraction started.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveBatch {
    pub records: Vec<Record>,
    pub taken_at: Timestamp,
    pub mode: ArchiveMode,
}

impl ArchiveBatch {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("archive handoff for batch {taken_at} failed: {reason}")]
    HandoffFailed { taken_at: Timestamp, reason: String },
    #[error("archive io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("archive serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Append-only destination for archive batches, keyed by `taken_at`
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ArchiveSink: Send + Sync {
    async fn persist(&self, batch: &ArchiveBatch) -> Result<(), ArchiveError>;
}

/// Keeps batches in memory; mostly for tests and embedding
#[derive(Debug, Default)]
pub struct MemoryArchiveSink {
    batches: Mutex<BTreeMap<Timestamp, ArchiveBatch>>,
}

impl MemoryArchiveSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batches(&self) -> Vec<ArchiveBatch> {
        self.batches.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.batches.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.lock().is_empty()
    }
}

#[async_trait]
impl ArchiveSink for MemoryArchiveSink {
    async fn persist(&self, batch: &ArchiveBatch) -> Result<(), ArchiveError> {
        let mut batches = self.batches.lock();
        if batches.contains_key(&batch.taken_at) {
            return Err(ArchiveError::HandoffFailed {
                taken_at: batch.taken_at,
                reason: "batch already archived".into(),
            });
        }
        batches.insert(batch.taken_at, batch.clone());
        Ok(())
    }
}

/// Writes one JSON file per batch under a directory
#[derive(Debug, Clone)]
pub struct FileArchiveSink {
    directory: PathBuf,
    compression: CompressionLevel,
}

impl FileArchiveSink {
    pub fn new(directory: impl Into<PathBuf>, compression: CompressionLevel) -> Self {
        Self {
            directory: directory.into(),
            compression,
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// File a batch taken at `taken_at` is written to
    pub fn path_for(&self, taken_at: Timestamp) -> PathBuf {
        let extension = match self.compression {
            CompressionLevel::None => "json",
            CompressionLevel::Lz4 => "json.lz4",
        };
        self.directory
            .join(format!("batch-{:020}.{}", taken_at.as_nanos(), extension))
    }

    /// Reads a batch back, decompressing if needed
    pub fn load(&self, taken_at: Timestamp) -> Result<ArchiveBatch, ArchiveError> {
        let raw = std::fs::read(self.path_for(taken_at))?;
        let bytes = match self.compression {
            CompressionLevel::None => raw,
            CompressionLevel::Lz4 => lz4::block::decompress(&raw, None)?,
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn write(&self, batch: &ArchiveBatch) -> Result<PathBuf, ArchiveError> {
        let json = serde_json::to_vec(batch)?;
        let bytes = match self.compression {
            CompressionLevel::None => json,
            CompressionLevel::Lz4 => lz4::block::compress(&json, None, true)?,
        };

        std::fs::create_dir_all(&self.directory)?;
        let path = self.path_for(batch.taken_at);
        write_atomic(&self.directory, &path, |file| file.write_all(&bytes))?;
        Ok(path)
    }
}

/// Fills a temp file in `directory` and moves it to `path` once synced.
///
/// A failed write leaves nothing at `path`, so the same batch can be
/// written again later. An existing file at `path` is never replaced.
fn write_atomic(
    directory: &Path,
    path: &Path,
    fill: impl FnOnce(&mut File) -> std::io::Result<()>,
) -> std::io::Result<()> {
    let mut tmp = tempfile::Builder::new()
        .prefix(".batch-")
        .suffix(".tmp")
        .tempfile_in(directory)?;
    fill(tmp.as_file_mut())?;
    tmp.as_file().sync_all()?;
    tmp.persist_noclobber(path).map_err(|e| e.error)?;
    Ok(())
}

#[async_trait]
impl ArchiveSink for FileArchiveSink {
    async fn persist(&self, batch: &ArchiveBatch) -> Result<(), ArchiveError> {
        let sink = self.clone();
        let batch = batch.clone();
        let path = tokio::task::spawn_blocking(move || sink.write(&batch))
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))??;
        tracing::debug!(path = %path.display(), "archive batch written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::record::RecordDelta;

    fn batch(taken_at: u64) -> ArchiveBatch {
        ArchiveBatch {
            records: vec![Record::from_delta(
                "005930".into(),
                RecordDelta::price("krx", 70_000.0),
            )],
            taken_at: Timestamp::new(taken_at),
            mode: ArchiveMode::Full,
        }
    }

    #[tokio::test]
    async fn test_memory_sink_is_append_only() {
        let sink = MemoryArchiveSink::new();
        sink.persist(&batch(1)).await.unwrap();
        sink.persist(&batch(2)).await.unwrap();
        assert!(matches!(
            sink.persist(&batch(1)).await,
            Err(ArchiveError::HandoffFailed { .. })
        ));
        assert_eq!(sink.len(), 2);
    }

    #[tokio::test]
    async fn test_file_sink_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileArchiveSink::new(dir.path(), CompressionLevel::None);
        let first = batch(42);
        sink.persist(&first).await.unwrap();
        assert!(matches!(sink.persist(&batch(42)).await, Err(ArchiveError::Io(_))));
        let loaded = sink.load(Timestamp::new(42)).unwrap();
        assert_eq!(loaded.taken_at, first.taken_at);
        assert_eq!(loaded.records[0].key, "005930");
        assert_eq!(loaded.records[0].version, first.records[0].version);
    }

    fn entries(dir: &Path) -> usize {
        std::fs::read_dir(dir).unwrap().count()
    }

    #[tokio::test]
    async fn test_failed_write_leaves_no_file_and_retry_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileArchiveSink::new(dir.path(), CompressionLevel::None);
        let path = sink.path_for(Timestamp::new(42));

        let result = write_atomic(dir.path(), &path, |file| {
            file.write_all(br#"{"records":["#)?;
            Err(std::io::Error::new(std::io::ErrorKind::Other, "no space left on device"))
        });
        assert!(result.is_err());
        assert!(!path.exists());
        assert_eq!(entries(dir.path()), 0);

        sink.persist(&batch(42)).await.unwrap();
        assert_eq!(sink.load(Timestamp::new(42)).unwrap().records.len(), 1);
        assert_eq!(entries(dir.path()), 1);
    }

    #[tokio::test]
    async fn test_rejected_duplicate_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileArchiveSink::new(dir.path(), CompressionLevel::Lz4);
        sink.persist(&batch(9)).await.unwrap();
        assert!(sink.persist(&batch(9)).await.is_err());
        assert_eq!(entries(dir.path()), 1);
    }

    #[tokio::test]
    async fn test_file_sink_lz4_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileArchiveSink::new(dir.path().join("nested"), CompressionLevel::Lz4);
        sink.persist(&batch(7)).await.unwrap();
        assert!(sink.path_for(Timestamp::new(7)).to_string_lossy().ends_with(".json.lz4"));
        assert_eq!(sink.load(Timestamp::new(7)).unwrap().records.len(), 1);
    }
}
