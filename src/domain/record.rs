//! Persisted record: the storage-level shape of every entity.
//!
//! A [`PersistedRecord`] carries the serialized entity plus the access
//! bookkeeping the background compression sweep relies on. The domain
//! payload may be stored LZ4-compressed; [`PersistedRecord::decoded_data`]
//! hides that from readers.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::compression;
use crate::error::InfraError;

/// Identity of a record: entity kind plus the entity's own key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    /// Entity kind discriminator (e.g. `"profile"`).
    pub kind: String,
    /// Entity key, unique within its kind.
    pub key: String,
}

impl RecordKey {
    /// Creates a key from its parts.
    #[must_use]
    pub fn new(kind: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.key)
    }
}

/// A stored entity row.
///
/// Lifecycle: created on first write, `accessed_at`/`access_count` bumped
/// on every read, compressed in place by the maintenance sweep once it goes
/// cold, removed only by an explicit repository delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedRecord {
    /// Record identity.
    #[serde(flatten)]
    pub id: RecordKey,
    /// Serialized entity, LZ4-compressed when `compressed` is set.
    pub data: Vec<u8>,
    /// Whether `data` holds a compressed block.
    pub compressed: bool,
    /// First write timestamp.
    pub created_at: DateTime<Utc>,
    /// Last write timestamp. Compression does not change it.
    pub updated_at: DateTime<Utc>,
    /// Last read timestamp.
    pub accessed_at: DateTime<Utc>,
    /// Number of reads since creation.
    pub access_count: u64,
}

impl PersistedRecord {
    /// Builds a fresh, uncompressed record stamped with the current time.
    #[must_use]
    pub fn new(id: RecordKey, data: Vec<u8>) -> Self {
        let now = Utc::now();
        Self {
            id,
            data,
            compressed: false,
            created_at: now,
            updated_at: now,
            accessed_at: now,
            access_count: 0,
        }
    }

    /// Returns the serialized entity, decompressing if necessary.
    ///
    /// # Errors
    ///
    /// Returns [`InfraError::Compression`] if the stored block is corrupt.
    pub fn decoded_data(&self) -> Result<Vec<u8>, InfraError> {
        if self.compressed {
            compression::decompress(&self.data)
        } else {
            Ok(self.data.clone())
        }
    }

    /// Returns the compressed payload for this record, or `None` if it is
    /// already compressed.
    #[must_use]
    pub fn compressed_payload(&self) -> Option<Vec<u8>> {
        (!self.compressed).then(|| compression::compress(&self.data))
    }

    /// Records one read at `at`.
    pub fn record_access(&mut self, at: DateTime<Utc>) {
        self.accessed_at = at;
        self.access_count = self.access_count.saturating_add(1);
    }
}
