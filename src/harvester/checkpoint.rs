//! Crawl checkpoints
//!
//! A checkpoint is the job's latest progress report. Only the running job
//! writes it and the newest write wins. The file sink replaces the document
//! atomically so a status reader never sees half a file.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use eyre::{Result, WrapErr};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

pub const CHECKPOINT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrawlStatus {
    Running,
    Completed,
    Error,
}

impl std::fmt::Display for CrawlStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CrawlStatus::Running => write!(f, "running"),
            CrawlStatus::Completed => write!(f, "completed"),
            CrawlStatus::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrawlCheckpoint {
    #[serde(default = "default_version")]
    pub version: u32,
    pub current_token_id: u64,
    pub status: CrawlStatus,
    /// Free-form counters; shape depends on the job
    #[serde(default)]
    pub stats: Value,
    /// Epoch milliseconds
    pub timestamp: i64,
}

fn default_version() -> u32 {
    CHECKPOINT_VERSION
}

impl CrawlCheckpoint {
    pub fn new(current_token_id: u64, status: CrawlStatus, stats: Value) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            current_token_id,
            status,
            stats,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    /// `stats.failedTokenIds`, if the job recorded any
    pub fn failed_token_ids(&self) -> Vec<u64> {
        self.stats
            .get("failedTokenIds")
            .and_then(Value::as_array)
            .map(|ids| ids.iter().filter_map(Value::as_u64).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
pub trait CheckpointSink: Send + Sync {
    async fn write(&self, checkpoint: &CrawlCheckpoint) -> Result<()>;
}

// ============================================
// FILE SINK
// ============================================

pub struct FileCheckpointSink {
    path: PathBuf,
}

impl FileCheckpointSink {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl CheckpointSink for FileCheckpointSink {
    async fn write(&self, checkpoint: &CrawlCheckpoint) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .wrap_err_with(|| format!("Failed to create {}", parent.display()))?;
            }
        }

        let content = serde_json::to_string_pretty(checkpoint)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content)
            .await
            .wrap_err_with(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .wrap_err_with(|| format!("Failed to replace {}", self.path.display()))?;

        debug!(
            "Checkpoint {} at token {} → {}",
            checkpoint.status,
            checkpoint.current_token_id,
            self.path.display()
        );
        Ok(())
    }
}

/// Read the last checkpoint, `None` if the file does not exist yet
pub fn read_checkpoint<P: AsRef<Path>>(path: P) -> Result<Option<CrawlCheckpoint>> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("Failed to read {}", path.display()))?;
    let checkpoint = serde_json::from_str(&content)
        .wrap_err_with(|| format!("Malformed checkpoint {}", path.display()))?;
    Ok(Some(checkpoint))
}

// ============================================
// MEMORY SINK
// ============================================

/// Keeps every checkpoint written, oldest first
#[derive(Default)]
pub struct MemoryCheckpointSink {
    written: Mutex<Vec<CrawlCheckpoint>>,
}

impl MemoryCheckpointSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<CrawlCheckpoint> {
        self.written
            .lock()
            .map(|w| w.clone())
            .unwrap_or_default()
    }

    pub fn last(&self) -> Option<CrawlCheckpoint> {
        self.written
            .lock()
            .ok()
            .and_then(|w| w.last().cloned())
    }
}

#[async_trait]
impl CheckpointSink for MemoryCheckpointSink {
    async fn write(&self, checkpoint: &CrawlCheckpoint) -> Result<()> {
        self.written
            .lock()
            .map_err(|_| eyre::eyre!("checkpoint sink poisoned"))?
            .push(checkpoint.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_format() {
        let cp = CrawlCheckpoint {
            version: 1,
            current_token_id: 500,
            status: CrawlStatus::Running,
            stats: json!({ "processed": 500 }),
            timestamp: 1_700_000_000_000,
        };
        let value = serde_json::to_value(&cp).unwrap();

        assert_eq!(value["currentTokenId"], 500);
        assert_eq!(value["status"], "running");
        assert_eq!(value["stats"]["processed"], 500);
        assert_eq!(value["timestamp"], 1_700_000_000_000i64);
        assert_eq!(value["version"], 1);
    }

    #[test]
    fn test_reads_unversioned_document() {
        let raw = r#"{"currentTokenId":12,"status":"error","stats":{},"timestamp":5}"#;
        let cp: CrawlCheckpoint = serde_json::from_str(raw).unwrap();
        assert_eq!(cp.version, CHECKPOINT_VERSION);
        assert_eq!(cp.status, CrawlStatus::Error);
    }

    #[test]
    fn test_failed_token_ids() {
        let cp = CrawlCheckpoint::new(
            10,
            CrawlStatus::Completed,
            json!({ "failedTokenIds": [3, 9, "x"] }),
        );
        assert_eq!(cp.failed_token_ids(), vec![3, 9]);

        let empty = CrawlCheckpoint::new(10, CrawlStatus::Completed, json!({}));
        assert!(empty.failed_token_ids().is_empty());
    }

    #[tokio::test]
    async fn test_file_sink_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("checkpoint.json");
        let sink = FileCheckpointSink::new(&path);

        assert!(read_checkpoint(&path).unwrap().is_none());

        sink.write(&CrawlCheckpoint::new(100, CrawlStatus::Running, json!({})))
            .await
            .unwrap();
        sink.write(&CrawlCheckpoint::new(200, CrawlStatus::Completed, json!({ "ok": true })))
            .await
            .unwrap();

        let cp = read_checkpoint(&path).unwrap().unwrap();
        assert_eq!(cp.current_token_id, 200);
        assert_eq!(cp.status, CrawlStatus::Completed);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_memory_sink_keeps_order() {
        let sink = MemoryCheckpointSink::new();
        for id in [1, 2, 3] {
            sink.write(&CrawlCheckpoint::new(id, CrawlStatus::Running, Value::Null))
                .await
                .unwrap();
        }
        let ids: Vec<u64> = sink.all().iter().map(|c| c.current_token_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(sink.last().map(|c| c.current_token_id), Some(3));
    }
}
