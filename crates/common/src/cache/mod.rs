//! Resilient shared-state store
//!
//! Provides:
//! - A remote backend behind [`RemoteStore`] (Redis in production)
//! - A bounded LRU plus optional per-key disk snapshots used while the
//!   remote is unavailable
//! - Grouped transactions backed by a write-ahead log and replayed on recovery
//! - A semaphore bounding concurrent remote calls
//!
//! Fallback writes are only visible inside this process until they are
//! replayed to the remote.

pub mod disk;
pub mod lru;
pub mod redis_store;
pub mod transaction;

pub use self::disk::{DiskStore, WalRecord};
pub use self::lru::{LocalEntry, LocalValue, LruCache, StreamEntry};
pub use self::redis_store::RedisStore;
pub use self::transaction::{StoreOp, Transaction, TransactionOutcome};

use crate::config::{AppConfig, FallbackConfig, RedisConfig};
use crate::errors::{AppError, Result};
use crate::metrics;
use async_trait::async_trait;
use chrono::Utc;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Remote key-value backend
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Apply a write-set as one grouped dispatch
    async fn apply(&self, ops: &[StoreOp]) -> Result<()>;

    /// Stream entries in append order
    async fn read_stream(&self, stream: &str) -> Result<Vec<StreamEntry>>;

    async fn members(&self, key: &str) -> Result<Vec<String>>;

    /// Keys starting with `prefix`
    async fn scan(&self, prefix: &str) -> Result<Vec<String>>;

    async fn ping(&self) -> Result<()>;
}

/// Outcome of a recovery sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub replayed: usize,
    /// Records left on disk because the sweep stopped early
    pub remaining: usize,
    pub quarantined: usize,
}

pub struct CacheStore {
    remote: Option<Arc<dyn RemoteStore>>,
    local: Mutex<LruCache>,
    disk: Option<DiskStore>,
    permits: Arc<Semaphore>,
    op_timeout: Duration,
    reconnect_interval: Duration,
    degraded: AtomicBool,
    last_failure: Mutex<Option<Instant>>,
    /// Write paths hold the read side from WAL append until the record is
    /// settled; recovery sweeps take the write side
    recovery: RwLock<()>,
}

impl CacheStore {
    /// Build a store over an optional remote backend
    pub async fn new(
        remote: Option<Arc<dyn RemoteStore>>,
        redis: &RedisConfig,
        fallback: &FallbackConfig,
    ) -> Result<Self> {
        let disk = if fallback.disk_enabled {
            Some(DiskStore::open(&fallback.data_dir).await?)
        } else {
            None
        };

        Ok(Self {
            remote,
            local: Mutex::new(LruCache::new(fallback.memory_capacity)),
            disk,
            permits: Arc::new(Semaphore::new(redis.max_concurrency.max(1))),
            op_timeout: redis.op_timeout(),
            reconnect_interval: redis.reconnect_interval(),
            degraded: AtomicBool::new(false),
            last_failure: Mutex::new(None),
            recovery: RwLock::new(()),
        })
    }

    /// Build the Redis-backed store from application config
    ///
    /// An empty Redis URL runs the store in local-only mode.
    pub async fn connect(config: &AppConfig) -> Result<Self> {
        let remote: Option<Arc<dyn RemoteStore>> = if config.redis.url.trim().is_empty() {
            warn!("No Redis URL configured, running with local state only");
            None
        } else {
            Some(Arc::new(RedisStore::new(&config.redis)?))
        };
        Self::new(remote, &config.redis, &config.fallback).await
    }

    /// Start a grouped write-set
    pub fn transaction(&self) -> Transaction<'_> {
        Transaction::new(self)
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    async fn mark_degraded(&self) {
        *self.last_failure.lock().await = Some(Instant::now());
        if !self.degraded.swap(true, Ordering::AcqRel) {
            warn!("Remote store unavailable, switching to local fallback");
        }
    }

    /// Run a remote future under a permit and the per-operation timeout
    async fn guarded<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        let _permit = self.permits.acquire().await.map_err(|_| AppError::Store {
            message: "store semaphore closed".to_string(),
        })?;
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(AppError::StoreTimeout {
                timeout_ms: self.op_timeout.as_millis() as u64,
            }),
        }
    }

    /// Whether remote calls may be attempted right now
    ///
    /// While degraded the remote is skipped for `reconnect_interval`, then
    /// probed; a successful probe replays pending writes first.
    async fn remote_ready(&self) -> bool {
        if !self.is_degraded() {
            return true;
        }
        if let Some(at) = *self.last_failure.lock().await {
            if at.elapsed() < self.reconnect_interval {
                return false;
            }
        }

        let Some(remote) = self.remote.clone() else {
            return false;
        };
        // Another caller is probing or a write-set is in flight
        let Ok(_guard) = self.recovery.try_write() else {
            return false;
        };
        if !self.is_degraded() {
            return true;
        }
        match self.restore_locked(&remote).await {
            Ok(report) => report.remaining == 0 && !self.is_degraded(),
            Err(e) => {
                error!(error = %e, "Recovery sweep failed");
                self.mark_degraded().await;
                false
            }
        }
    }

    /// Call the remote, or return `None` when the caller should fall back
    async fn call_remote<T, F, Fut>(&self, operation: &'static str, f: F) -> Option<T>
    where
        F: FnOnce(Arc<dyn RemoteStore>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let remote = self.remote.clone()?;
        if !self.remote_ready().await {
            metrics::record_store_fallback(operation);
            return None;
        }
        self.dispatch_remote(operation, remote, f).await
    }

    /// Call a remote already judged ready, marking the store degraded on failure
    async fn dispatch_remote<T, F, Fut>(
        &self,
        operation: &'static str,
        remote: Arc<dyn RemoteStore>,
        f: F,
    ) -> Option<T>
    where
        F: FnOnce(Arc<dyn RemoteStore>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match self.guarded(f(remote)).await {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(operation, error = %e, "Remote store call failed, using local fallback");
                metrics::record_store_fallback(operation);
                self.mark_degraded().await;
                None
            }
        }
    }

    /// Local entry from the LRU, falling back to the disk snapshot
    async fn local_entry(&self, key: &str) -> Option<LocalEntry> {
        let mut local = self.local.lock().await;
        self.load_into(&mut local, key).await
    }

    async fn load_into(&self, local: &mut LruCache, key: &str) -> Option<LocalEntry> {
        if let Some(entry) = local.get(key) {
            return Some(entry.clone());
        }
        let disk = self.disk.as_ref()?;
        match disk.load_snapshot(key).await {
            Ok(Some(entry)) => {
                local.put(key, entry.clone());
                Some(entry)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(key, error = %e, "Failed to read disk snapshot");
                None
            }
        }
    }

    /// Apply operations to the local copy
    ///
    /// With `persist` the resulting entries are snapshotted to disk; otherwise
    /// any snapshot of a touched key is stale and removed.
    async fn apply_local(&self, ops: &[StoreOp], persist: bool) {
        let mut touched = Vec::with_capacity(ops.len());
        {
            let mut local = self.local.lock().await;
            let now = Utc::now();
            for op in ops {
                let current = self.load_into(&mut local, op.key()).await;
                let next = next_local_entry(current, op, now);
                match &next {
                    Some(entry) => {
                        if let Some(evicted) = local.put(op.key(), entry.clone()) {
                            debug!(key = %evicted, "Evicted from local fallback");
                        }
                    }
                    None => {
                        local.remove(op.key());
                    }
                }
                touched.push((op.key().to_string(), next));
            }
        }

        let Some(disk) = &self.disk else {
            return;
        };
        for (key, entry) in touched {
            let result = match (persist, entry) {
                (true, Some(entry)) => disk.save_snapshot(&key, &entry).await,
                _ => disk.remove_snapshot(&key).await,
            };
            if let Err(e) = result {
                warn!(key = %key, error = %e, "Failed to update disk snapshot");
            }
        }
    }

    /// Replace the local copy with what the remote returned
    async fn refresh_local(&self, key: &str, value: Option<LocalValue>) {
        let mut local = self.local.lock().await;
        match value {
            Some(value) => {
                local.put(key, LocalEntry::new(value, None));
            }
            None => {
                local.remove(key);
            }
        }
    }

    /// Single-operation write
    ///
    /// A write the remote did not accept is applied locally and recorded in
    /// the log so the recovery sweep can replay it.
    async fn write(&self, op: StoreOp) {
        let ops = std::slice::from_ref(&op);
        let Some(remote) = self.remote.clone() else {
            // Local-only: the disk snapshot is the durable copy
            self.apply_local(ops, true).await;
            return;
        };

        let ready = self.remote_ready().await;
        let _in_flight = self.recovery.read().await;
        let sent = if ready {
            self.dispatch_remote(op.name(), remote, move |remote| async move { remote.apply(ops).await })
                .await
                .is_some()
        } else {
            metrics::record_store_fallback(op.name());
            false
        };

        self.apply_local(ops, !sent).await;

        if !sent {
            if let Some(disk) = &self.disk {
                let id = uuid::Uuid::new_v4().to_string();
                if let Err(e) = disk.append_wal(&id, std::slice::from_ref(&op)).await {
                    error!(key = op.key(), error = %e, "Failed to record pending write");
                }
            }
        }
    }

    /// Commit a write-set: log, dispatch, then clear the log record
    pub(crate) async fn execute(&self, id: String, ops: Vec<StoreOp>) -> TransactionOutcome {
        if ops.is_empty() {
            return TransactionOutcome {
                id,
                success: true,
                pending: false,
            };
        }

        let Some(remote) = self.remote.clone() else {
            self.apply_local(&ops, true).await;
            return TransactionOutcome {
                id,
                success: true,
                pending: false,
            };
        };

        let ready = self.remote_ready().await;
        // Held until the WAL record is settled so a sweep never replays it
        // concurrently with its own dispatch
        let _in_flight = self.recovery.read().await;
        let handle = match &self.disk {
            Some(disk) => match disk.append_wal(&id, &ops).await {
                Ok(handle) => Some(handle),
                Err(e) => {
                    error!(transaction_id = %id, error = %e, "Failed to write WAL record");
                    None
                }
            },
            None => None,
        };

        let ops_ref = &ops;
        let dispatched = if ready {
            self.dispatch_remote("transaction", remote, move |remote| async move { remote.apply(ops_ref).await })
                .await
                .is_some()
        } else {
            metrics::record_store_fallback("transaction");
            false
        };

        self.apply_local(&ops, !dispatched).await;

        if dispatched {
            if let (Some(disk), Some(handle)) = (&self.disk, &handle) {
                if let Err(e) = disk.remove_wal(handle).await {
                    warn!(transaction_id = %id, error = %e, "Failed to clear WAL record");
                }
            }
            debug!(transaction_id = %id, ops = ops.len(), "Transaction committed");
            TransactionOutcome {
                id,
                success: true,
                pending: false,
            }
        } else {
            warn!(
                transaction_id = %id,
                ops = ops.len(),
                pending = handle.is_some(),
                "Transaction applied to local fallback only"
            );
            TransactionOutcome {
                id,
                success: false,
                pending: handle.is_some(),
            }
        }
    }

    pub async fn set(&self, key: &str, value: impl Into<String>, ttl: Option<Duration>) {
        self.write(StoreOp::set(key, value, ttl)).await;
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        if let Some(value) = self
            .call_remote("get", |remote| async move { remote.get(key).await })
            .await
        {
            return value;
        }

        match self.local_entry(key).await {
            Some(LocalEntry {
                value: LocalValue::Value(value),
                ..
            }) => Some(value),
            _ => None,
        }
    }

    pub async fn delete(&self, key: &str) {
        self.write(StoreOp::delete(key)).await;
    }

    /// Append to a stream, returning the op id of the entry
    pub async fn append(&self, stream: &str, payload: impl Into<String>) -> String {
        let op = StoreOp::append(stream, payload);
        let op_id = match &op {
            StoreOp::StreamAppend { op_id, .. } => op_id.clone(),
            _ => String::new(),
        };
        self.write(op).await;
        op_id
    }

    /// Stream payloads in append order
    pub async fn read_stream(&self, stream: &str) -> Vec<String> {
        if let Some(entries) = self
            .call_remote("read_stream", |remote| async move { remote.read_stream(stream).await })
            .await
        {
            let payloads = entries.iter().map(|e| e.payload.clone()).collect();
            let value = (!entries.is_empty()).then_some(LocalValue::Stream(entries));
            self.refresh_local(stream, value).await;
            return payloads;
        }

        match self.local_entry(stream).await {
            Some(LocalEntry {
                value: LocalValue::Stream(entries),
                ..
            }) => entries.into_iter().map(|e| e.payload).collect(),
            _ => Vec::new(),
        }
    }

    pub async fn add_member(&self, key: &str, member: &str) {
        self.write(StoreOp::add_member(key, member)).await;
    }

    pub async fn remove_member(&self, key: &str, member: &str) {
        self.write(StoreOp::remove_member(key, member)).await;
    }

    /// Set members, sorted
    pub async fn members(&self, key: &str) -> Vec<String> {
        if let Some(members) = self
            .call_remote("members", |remote| async move { remote.members(key).await })
            .await
        {
            let set: BTreeSet<String> = members.iter().cloned().collect();
            let value = (!set.is_empty()).then_some(LocalValue::Set(set));
            self.refresh_local(key, value).await;
            return members;
        }

        match self.local_entry(key).await {
            Some(LocalEntry {
                value: LocalValue::Set(set),
                ..
            }) => set.into_iter().collect(),
            _ => Vec::new(),
        }
    }

    /// Keys starting with `prefix`
    ///
    /// The fallback only sees keys held in the local LRU.
    pub async fn scan(&self, prefix: &str) -> Vec<String> {
        if let Some(keys) = self
            .call_remote("scan", |remote| async move { remote.scan(prefix).await })
            .await
        {
            return keys;
        }
        self.local.lock().await.keys_with_prefix(prefix)
    }

    /// Probe the remote directly
    pub async fn ping(&self) -> bool {
        match &self.remote {
            Some(remote) => self.guarded(remote.ping()).await.is_ok(),
            None => false,
        }
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key).await {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    pub async fn set_json<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) -> Result<()> {
        let json = serde_json::to_string(value)?;
        self.set(key, json, ttl).await;
        Ok(())
    }

    /// Number of write-sets waiting on disk
    pub async fn pending_count(&self) -> usize {
        match &self.disk {
            Some(disk) => match disk.pending_wal().await {
                Ok(pending) => pending.len(),
                Err(e) => {
                    warn!(error = %e, "Failed to list WAL records");
                    0
                }
            },
            None => 0,
        }
    }

    /// Replay pending write-sets to the remote in creation order
    ///
    /// Each record is removed only after it was applied; the sweep stops at
    /// the first failure so later records never overtake earlier ones.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let Some(remote) = self.remote.clone() else {
            return Ok(RecoveryReport::default());
        };
        let _guard = self.recovery.write().await;
        self.restore_locked(&remote).await
    }

    async fn restore_locked(&self, remote: &Arc<dyn RemoteStore>) -> Result<RecoveryReport> {
        if let Err(e) = self.guarded(remote.ping()).await {
            debug!(error = %e, "Remote store still unreachable");
            self.mark_degraded().await;
            return Ok(RecoveryReport {
                remaining: self.pending_count().await,
                ..RecoveryReport::default()
            });
        }

        let report = self.replay_pending(remote).await?;
        if report.remaining == 0 {
            if self.degraded.swap(false, Ordering::AcqRel) {
                info!(replayed = report.replayed, "Remote store restored");
            }
        } else {
            self.mark_degraded().await;
        }
        Ok(report)
    }

    async fn replay_pending(&self, remote: &Arc<dyn RemoteStore>) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let Some(disk) = &self.disk else {
            return Ok(report);
        };

        let pending = disk.pending_wal().await?;
        for (position, handle) in pending.iter().enumerate() {
            let record = match disk.read_wal(handle).await {
                Ok(record) => record,
                Err(e) => {
                    error!(error = %e, "Skipping unreadable WAL record");
                    disk.quarantine_wal(handle).await?;
                    report.quarantined += 1;
                    continue;
                }
            };

            match self.guarded(remote.apply(&record.ops)).await {
                Ok(()) => {
                    disk.remove_wal(handle).await?;
                    metrics::record_wal_replay(true);
                    debug!(transaction_id = %record.id, ops = record.ops.len(), "WAL record replayed");
                    report.replayed += 1;
                }
                Err(e) => {
                    warn!(
                        transaction_id = %record.id,
                        error = %e,
                        "Replay failed, stopping recovery sweep"
                    );
                    metrics::record_wal_replay(false);
                    report.remaining = pending.len() - position;
                    return Ok(report);
                }
            }
        }

        if report.replayed > 0 {
            info!(replayed = report.replayed, "Recovery sweep complete");
        }
        Ok(report)
    }

    /// Periodically probe the remote and replay pending writes
    pub fn spawn_recovery_monitor(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(100)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if self.remote.is_none() {
                    continue;
                }
                if !self.is_degraded() && self.pending_count().await == 0 {
                    continue;
                }
                if let Err(e) = self.recover().await {
                    error!(error = %e, "Background recovery failed");
                }
            }
        })
    }
}

/// Cache key builder helpers
pub mod keys {
    /// Prefix shared by every cached answer of one partition
    pub fn query_prefix(partition: &str) -> String {
        format!("rag:query:{}:", partition)
    }

    pub fn query(partition: &str, digest: &str) -> String {
        format!("rag:query:{}:{}", partition, digest)
    }

    pub fn chat_session(chat_id: &str) -> String {
        format!("chat:{}", chat_id)
    }

    pub fn chat_messages(chat_id: &str) -> String {
        format!("chat:{}:messages", chat_id)
    }

    pub fn user_chats(user_id: &str, partition: &str) -> String {
        format!("user:{}:chats:{}", user_id, partition)
    }
}

/// Entry resulting from applying `op` to `current`; `None` removes the key
fn next_local_entry(
    current: Option<LocalEntry>,
    op: &StoreOp,
    now: chrono::DateTime<Utc>,
) -> Option<LocalEntry> {
    match op {
        StoreOp::Set { value, ttl_secs, .. } => {
            let expires_at = ttl_secs.map(|ttl| now + chrono::Duration::seconds(ttl as i64));
            Some(LocalEntry::new(LocalValue::Value(value.clone()), expires_at))
        }
        StoreOp::Delete { .. } => None,
        StoreOp::StreamAppend { op_id, payload, .. } => {
            let (mut entries, expires_at) = match current {
                Some(LocalEntry {
                    value: LocalValue::Stream(entries),
                    expires_at,
                }) => (entries, expires_at),
                _ => (Vec::new(), None),
            };
            if !entries.iter().any(|e| &e.op_id == op_id) {
                entries.push(StreamEntry {
                    op_id: op_id.clone(),
                    payload: payload.clone(),
                });
            }
            Some(LocalEntry::new(LocalValue::Stream(entries), expires_at))
        }
        StoreOp::AddMember { member, .. } => {
            let mut set = match current {
                Some(LocalEntry {
                    value: LocalValue::Set(set),
                    ..
                }) => set,
                _ => BTreeSet::new(),
            };
            set.insert(member.clone());
            Some(LocalEntry::new(LocalValue::Set(set), None))
        }
        StoreOp::RemoveMember { member, .. } => match current {
            Some(LocalEntry {
                value: LocalValue::Set(mut set),
                ..
            }) => {
                set.remove(member);
                (!set.is_empty()).then(|| LocalEntry::new(LocalValue::Set(set), None))
            }
            _ => None,
        },
    }
}
