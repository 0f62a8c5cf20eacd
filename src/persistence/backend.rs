//! Storage backend abstraction.
//!
//! The coordinator and repositories depend only on [`StorageBackend`].
//! Which implementation backs it is decided once at startup by picking a
//! [`BackendConnector`] with [`connector_for`].

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::memory::MemoryConnector;
use super::models::StorageStatistics;
use super::postgres::PostgresConnector;
use crate::config::{DatabaseConfig, StorageBackendKind};
use crate::domain::{PersistedRecord, RecordKey};
use crate::error::InfraError;

/// Operations every storage backend provides.
///
/// Writes that touch more than one row (`upsert_batch`) are atomic.
/// Reads that bump access bookkeeping (`fetch_and_touch`) do so in the same
/// statement as the read.
#[async_trait]
pub trait StorageBackend: Send + Sync + fmt::Debug {
    /// Backend name for logs and health reports.
    fn name(&self) -> &'static str;

    /// Liveness probe.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot answer a trivial query.
    async fn ping(&self) -> Result<(), InfraError>;

    /// Closes every underlying connection.
    async fn close(&self);

    /// Inserts a record or replaces the payload of an existing one.
    ///
    /// On conflict only `data`, `compressed` and `updated_at` change;
    /// creation time and access bookkeeping are kept.
    ///
    /// # Errors
    ///
    /// Returns [`InfraError::Storage`] on query failure.
    async fn upsert(&self, record: &PersistedRecord) -> Result<(), InfraError>;

    /// Upserts every record in one transaction.
    ///
    /// # Errors
    ///
    /// Returns [`InfraError::Storage`] on failure; no record is written.
    async fn upsert_batch(&self, records: &[PersistedRecord]) -> Result<(), InfraError>;

    /// Reads a record and records the access at `at`.
    ///
    /// # Errors
    ///
    /// Returns [`InfraError::Storage`] on query failure.
    async fn fetch_and_touch(
        &self,
        id: &RecordKey,
        at: DateTime<Utc>,
    ) -> Result<Option<PersistedRecord>, InfraError>;

    /// Records an access without reading the payload. Returns whether the
    /// record exists.
    ///
    /// # Errors
    ///
    /// Returns [`InfraError::Storage`] on query failure.
    async fn touch(&self, id: &RecordKey, at: DateTime<Utc>) -> Result<bool, InfraError>;

    /// Deletes a record. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// Returns [`InfraError::Storage`] on query failure.
    async fn delete(&self, id: &RecordKey) -> Result<bool, InfraError>;

    /// Returns up to `limit` records ordered by key, strictly after `after`.
    ///
    /// # Errors
    ///
    /// Returns [`InfraError::Storage`] on query failure.
    async fn scan(
        &self,
        after: Option<&RecordKey>,
        limit: usize,
    ) -> Result<Vec<PersistedRecord>, InfraError>;

    /// Swaps the payload representation if the record was not written since
    /// `expected_updated_at`. Returns whether the swap happened.
    ///
    /// # Errors
    ///
    /// Returns [`InfraError::Storage`] on query failure.
    async fn replace_payload(
        &self,
        id: &RecordKey,
        expected_updated_at: DateTime<Utc>,
        data: &[u8],
        compressed: bool,
    ) -> Result<bool, InfraError>;

    /// Aggregated record and access counters.
    ///
    /// # Errors
    ///
    /// Returns [`InfraError::Storage`] on query failure.
    async fn statistics(&self) -> Result<StorageStatistics, InfraError>;
}

/// Builds a connected [`StorageBackend`] from configuration.
#[async_trait]
pub trait BackendConnector: Send + Sync + fmt::Debug {
    /// Opens the backend.
    ///
    /// # Errors
    ///
    /// Returns [`InfraError::InitializationFailure`] if the store cannot be
    /// reached or prepared.
    async fn connect(&self, config: &DatabaseConfig) -> Result<Arc<dyn StorageBackend>, InfraError>;
}

/// Returns the connector for the configured backend kind.
#[must_use]
pub fn connector_for(kind: StorageBackendKind) -> Arc<dyn BackendConnector> {
    match kind {
        StorageBackendKind::Postgres => Arc::new(PostgresConnector),
        StorageBackendKind::Memory => Arc::new(MemoryConnector::default()),
    }
}
