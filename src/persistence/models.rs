//! Aggregates reported by storage backends and the backup sweep.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-kind storage counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindStatistics {
    /// Stored records of this kind.
    pub records: u64,
    /// How many of them are compressed.
    pub compressed: u64,
    /// Sum of their access counts.
    pub accesses: u64,
}

/// Storage-wide counters returned by
/// [`super::StorageBackend::statistics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageStatistics {
    /// Total stored records.
    pub total_records: u64,
    /// Total compressed records.
    pub compressed_records: u64,
    /// Sum of all access counts.
    pub total_accesses: u64,
    /// Breakdown by record kind.
    pub by_kind: BTreeMap<String, KindStatistics>,
}

impl StorageStatistics {
    /// Adds one kind's counters to the totals.
    pub fn add_kind(&mut self, kind: &str, stats: KindStatistics) {
        self.total_records = self.total_records.saturating_add(stats.records);
        self.compressed_records = self.compressed_records.saturating_add(stats.compressed);
        self.total_accesses = self.total_accesses.saturating_add(stats.accesses);
        self.by_kind.insert(kind.to_string(), stats);
    }
}

/// A backup snapshot on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupInfo {
    /// Snapshot file path.
    pub path: PathBuf,
    /// When the snapshot was started.
    pub created_at: DateTime<Utc>,
    /// Records written.
    pub records: u64,
    /// File size in bytes.
    pub bytes: u64,
}
