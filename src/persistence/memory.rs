//! In-process storage backend.
//!
//! Keeps records in an ordered map so scans page the same way the
//! PostgreSQL backend's keyset queries do. Used by tests and by deployments
//! that run without a database (`STORAGE_BACKEND=memory`).

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::backend::{BackendConnector, StorageBackend};
use super::models::{KindStatistics, StorageStatistics};
use crate::config::DatabaseConfig;
use crate::domain::{PersistedRecord, RecordKey};
use crate::error::InfraError;

/// Ordered in-memory record store.
#[derive(Debug)]
pub struct MemoryBackend {
    records: RwLock<BTreeMap<RecordKey, PersistedRecord>>,
    closed: AtomicBool,
    reachable: AtomicBool,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Creates an empty, open backend.
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: RwLock::new(BTreeMap::new()),
            closed: AtomicBool::new(false),
            reachable: AtomicBool::new(true),
        }
    }

    /// Simulates the store going away (`false`) or coming back (`true`).
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Returns `true` once [`StorageBackend::close`] has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of stored records.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    /// Returns `true` if no record is stored.
    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Reads a record without touching its access bookkeeping.
    pub async fn peek(&self, id: &RecordKey) -> Option<PersistedRecord> {
        self.records.read().await.get(id).cloned()
    }

    /// Overwrites a stored record verbatim, bookkeeping included.
    pub async fn insert_raw(&self, record: PersistedRecord) {
        self.records.write().await.insert(record.id.clone(), record);
    }

    fn reopen(&self) {
        self.closed.store(false, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<(), InfraError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(InfraError::PoolClosed);
        }
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(InfraError::Storage("memory store unreachable".to_string()));
        }
        Ok(())
    }
}

fn merge(existing: Option<&PersistedRecord>, incoming: &PersistedRecord) -> PersistedRecord {
    match existing {
        Some(current) => PersistedRecord {
            data: incoming.data.clone(),
            compressed: incoming.compressed,
            updated_at: incoming.updated_at,
            ..current.clone()
        },
        None => incoming.clone(),
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> Result<(), InfraError> {
        self.ensure_available()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    async fn upsert(&self, record: &PersistedRecord) -> Result<(), InfraError> {
        self.ensure_available()?;
        let mut records = self.records.write().await;
        let merged = merge(records.get(&record.id), record);
        records.insert(record.id.clone(), merged);
        Ok(())
    }

    async fn upsert_batch(&self, batch: &[PersistedRecord]) -> Result<(), InfraError> {
        self.ensure_available()?;
        // Single write guard: readers see all of the batch or none of it.
        let mut records = self.records.write().await;
        for record in batch {
            let merged = merge(records.get(&record.id), record);
            records.insert(record.id.clone(), merged);
        }
        Ok(())
    }

    async fn fetch_and_touch(
        &self,
        id: &RecordKey,
        at: DateTime<Utc>,
    ) -> Result<Option<PersistedRecord>, InfraError> {
        self.ensure_available()?;
        let mut records = self.records.write().await;
        Ok(records.get_mut(id).map(|record| {
            record.record_access(at);
            record.clone()
        }))
    }

    async fn touch(&self, id: &RecordKey, at: DateTime<Utc>) -> Result<bool, InfraError> {
        self.ensure_available()?;
        let mut records = self.records.write().await;
        Ok(records.get_mut(id).map(|record| record.record_access(at)).is_some())
    }

    async fn delete(&self, id: &RecordKey) -> Result<bool, InfraError> {
        self.ensure_available()?;
        Ok(self.records.write().await.remove(id).is_some())
    }

    async fn scan(
        &self,
        after: Option<&RecordKey>,
        limit: usize,
    ) -> Result<Vec<PersistedRecord>, InfraError> {
        self.ensure_available()?;
        let records = self.records.read().await;
        let lower = after.map_or(Bound::Unbounded, |key| Bound::Excluded(key.clone()));
        Ok(records
            .range((lower, Bound::Unbounded))
            .take(limit)
            .map(|(_, record)| record.clone())
            .collect())
    }

    async fn replace_payload(
        &self,
        id: &RecordKey,
        expected_updated_at: DateTime<Utc>,
        data: &[u8],
        compressed: bool,
    ) -> Result<bool, InfraError> {
        self.ensure_available()?;
        let mut records = self.records.write().await;
        match records.get_mut(id) {
            Some(record) if record.updated_at == expected_updated_at => {
                record.data = data.to_vec();
                record.compressed = compressed;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn statistics(&self) -> Result<StorageStatistics, InfraError> {
        self.ensure_available()?;
        let records = self.records.read().await;
        let mut by_kind: BTreeMap<&str, KindStatistics> = BTreeMap::new();
        for record in records.values() {
            let entry = by_kind.entry(record.id.kind.as_str()).or_default();
            entry.records += 1;
            if record.compressed {
                entry.compressed += 1;
            }
            entry.accesses = entry.accesses.saturating_add(record.access_count);
        }
        let mut stats = StorageStatistics::default();
        for (kind, kind_stats) in by_kind {
            stats.add_kind(kind, kind_stats);
        }
        Ok(stats)
    }
}

/// Connector handing out one shared [`MemoryBackend`].
///
/// Every `connect` returns the same backend (reopened if it was closed), so
/// data survives a pool close/reopen cycle the way rows in a database would.
#[derive(Debug, Default)]
pub struct MemoryConnector {
    backend: Arc<MemoryBackend>,
    connects: AtomicUsize,
}

impl MemoryConnector {
    /// Wraps an existing backend, typically one a test keeps a handle to.
    #[must_use]
    pub fn with_backend(backend: Arc<MemoryBackend>) -> Self {
        Self {
            backend,
            connects: AtomicUsize::new(0),
        }
    }

    /// Returns the shared backend.
    #[must_use]
    pub fn backend(&self) -> Arc<MemoryBackend> {
        Arc::clone(&self.backend)
    }

    /// Number of successful `connect` calls.
    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackendConnector for MemoryConnector {
    async fn connect(&self, _config: &DatabaseConfig) -> Result<Arc<dyn StorageBackend>, InfraError> {
        self.backend.reopen();
        self.connects.fetch_add(1, Ordering::SeqCst);
        let backend: Arc<dyn StorageBackend> = Arc::clone(&self.backend) as Arc<dyn StorageBackend>;
        Ok(backend)
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    fn record(kind: &str, key: &str, data: &[u8]) -> PersistedRecord {
        PersistedRecord::new(RecordKey::new(kind, key), data.to_vec())
    }

    #[tokio::test]
    async fn upsert_keeps_access_bookkeeping() {
        let backend = MemoryBackend::new();
        let first = record("profile", "u1", b"v1");
        let Ok(()) = backend.upsert(&first).await else {
            panic!("upsert failed");
        };
        let at = first.created_at + chrono::Duration::seconds(1);
        let Ok(Some(_)) = backend.fetch_and_touch(&first.id, at).await else {
            panic!("record missing");
        };

        let mut second = record("profile", "u1", b"v2");
        second.updated_at = at;
        let Ok(()) = backend.upsert(&second).await else {
            panic!("upsert failed");
        };

        let Some(stored) = backend.peek(&first.id).await else {
            panic!("record missing");
        };
        assert_eq!(stored.data, b"v2");
        assert_eq!(stored.access_count, 1);
        assert_eq!(stored.created_at, first.created_at);
    }

    #[tokio::test]
    async fn scan_pages_in_key_order() {
        let backend = MemoryBackend::new();
        let batch: Vec<_> = ["c", "a", "b", "d"]
            .iter()
            .map(|k| record("profile", k, b"{}"))
            .collect();
        let Ok(()) = backend.upsert_batch(&batch).await else {
            panic!("batch failed");
        };

        let Ok(page) = backend.scan(None, 2).await else {
            panic!("scan failed");
        };
        let keys: Vec<_> = page.iter().map(|r| r.id.key.as_str()).collect();
        assert_eq!(keys, ["a", "b"]);

        let last = page.last().map(|r| r.id.clone());
        let Ok(rest) = backend.scan(last.as_ref(), 10).await else {
            panic!("scan failed");
        };
        let keys: Vec<_> = rest.iter().map(|r| r.id.key.as_str()).collect();
        assert_eq!(keys, ["c", "d"]);
    }

    #[tokio::test]
    async fn replace_payload_skips_records_written_since_read() {
        let backend = MemoryBackend::new();
        let original = record("verification", "c1", b"raw");
        let Ok(()) = backend.upsert(&original).await else {
            panic!("upsert failed");
        };

        let mut rewritten = record("verification", "c1", b"newer");
        rewritten.updated_at = original.updated_at + chrono::Duration::seconds(1);
        let Ok(()) = backend.upsert(&rewritten).await else {
            panic!("upsert failed");
        };

        let swapped = backend
            .replace_payload(&original.id, original.updated_at, b"packed", true)
            .await;
        assert_eq!(swapped.ok(), Some(false));
    }

    #[tokio::test]
    async fn unreachable_store_fails_ping() {
        let backend = MemoryBackend::new();
        backend.set_reachable(false);
        assert!(backend.ping().await.is_err());
        backend.set_reachable(true);
        assert!(backend.ping().await.is_ok());
    }

    #[tokio::test]
    async fn statistics_group_by_kind() {
        let backend = MemoryBackend::new();
        let mut packed = record("verification", "c1", b"x");
        packed.compressed = true;
        packed.access_count = 3;
        backend.insert_raw(packed).await;
        backend.insert_raw(record("profile", "u1", b"y")).await;

        let Ok(stats) = backend.statistics().await else {
            panic!("statistics failed");
        };
        assert_eq!(stats.total_records, 2);
        assert_eq!(stats.compressed_records, 1);
        assert_eq!(stats.total_accesses, 3);
        assert_eq!(stats.by_kind.get("verification").map(|k| k.accesses), Some(3));
    }
}
