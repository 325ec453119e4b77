//! On-disk fallback: per-key snapshots and the write-ahead log
//!
//! Layout under the data directory:
//! - `snapshots/<sha256(key)>.json` holds the latest local value of one key
//! - `wal/<seq>-<txid>.json` holds one pending write-set; the sequence
//!   continues across restarts so file names sort in creation order

use super::lru::LocalEntry;
use super::transaction::StoreOp;
use crate::errors::{AppError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Snapshot {
    key: String,
    entry: LocalEntry,
}

/// A write-set awaiting dispatch or replay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalRecord {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub ops: Vec<StoreOp>,
}

/// Handle to a persisted WAL record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalHandle {
    path: PathBuf,
}

impl WalHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[derive(Debug)]
pub struct DiskStore {
    snapshot_dir: PathBuf,
    wal_dir: PathBuf,
    seq: AtomicU64,
}

impl DiskStore {
    /// Open (and create) the directory tree under `data_dir`
    pub async fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        let snapshot_dir = data_dir.join("snapshots");
        let wal_dir = data_dir.join("wal");
        tokio::fs::create_dir_all(&snapshot_dir).await?;
        tokio::fs::create_dir_all(&wal_dir).await?;

        let next_seq = Self::last_wal_seq(&wal_dir).await?.map_or(0, |seq| seq + 1);
        debug!(path = %data_dir.display(), next_seq, "Disk fallback opened");
        Ok(Self {
            snapshot_dir,
            wal_dir,
            seq: AtomicU64::new(next_seq),
        })
    }

    /// Highest sequence number among existing records, quarantined ones included
    async fn last_wal_seq(wal_dir: &Path) -> Result<Option<u64>> {
        let mut entries = tokio::fs::read_dir(wal_dir).await?;
        let mut last = None;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let seq = name
                .to_str()
                .and_then(|n| n.split('-').next())
                .and_then(|n| n.parse::<u64>().ok());
            if let Some(seq) = seq {
                last = last.max(Some(seq));
            }
        }
        Ok(last)
    }

    fn snapshot_path(&self, key: &str) -> PathBuf {
        let digest = hex::encode(Sha256::digest(key.as_bytes()));
        self.snapshot_dir.join(format!("{}.json", digest))
    }

    /// Write `bytes` to `path` via a synced temp file and rename
    async fn write_durable(path: &Path, bytes: &[u8]) -> Result<()> {
        let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("record");
        let tmp = path.with_file_name(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4().simple()));
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    pub async fn save_snapshot(&self, key: &str, entry: &LocalEntry) -> Result<()> {
        let snapshot = Snapshot {
            key: key.to_string(),
            entry: entry.clone(),
        };
        let bytes = serde_json::to_vec(&snapshot)?;
        Self::write_durable(&self.snapshot_path(key), &bytes).await
    }

    /// Load a live snapshot; expired snapshots are removed
    pub async fn load_snapshot(&self, key: &str) -> Result<Option<LocalEntry>> {
        let path = self.snapshot_path(key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let snapshot: Snapshot = serde_json::from_slice(&bytes)?;
        if snapshot.key != key {
            warn!(key, stored = %snapshot.key, "Snapshot digest collision, ignoring");
            return Ok(None);
        }
        if snapshot.entry.is_expired(Utc::now()) {
            self.remove_snapshot(key).await?;
            return Ok(None);
        }
        Ok(Some(snapshot.entry))
    }

    pub async fn remove_snapshot(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.snapshot_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Durably append a write-set to the log
    pub async fn append_wal(&self, id: &str, ops: &[StoreOp]) -> Result<WalHandle> {
        let record = WalRecord {
            id: id.to_string(),
            created_at: Utc::now(),
            ops: ops.to_vec(),
        };
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let name = format!("{:020}-{}.json", seq, id);
        let path = self.wal_dir.join(name);
        let bytes = serde_json::to_vec(&record)?;
        Self::write_durable(&path, &bytes).await?;
        debug!(transaction_id = id, ops = ops.len(), "WAL record written");
        Ok(WalHandle { path })
    }

    /// Pending WAL records in creation order
    pub async fn pending_wal(&self) -> Result<Vec<WalHandle>> {
        let mut entries = tokio::fs::read_dir(&self.wal_dir).await?;
        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths.into_iter().map(|path| WalHandle { path }).collect())
    }

    pub async fn read_wal(&self, handle: &WalHandle) -> Result<WalRecord> {
        let bytes = tokio::fs::read(&handle.path).await?;
        serde_json::from_slice(&bytes).map_err(|e| AppError::Wal {
            message: format!("corrupt WAL record {}: {}", handle.path.display(), e),
        })
    }

    pub async fn remove_wal(&self, handle: &WalHandle) -> Result<()> {
        match tokio::fs::remove_file(&handle.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Move an unreadable record out of the replay queue
    pub async fn quarantine_wal(&self, handle: &WalHandle) -> Result<()> {
        let target = handle.path.with_extension("corrupt");
        tokio::fs::rename(&handle.path, &target).await?;
        warn!(path = %target.display(), "WAL record quarantined");
        Ok(())
    }
}
