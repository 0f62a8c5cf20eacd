//! Operational events broadcast by the coordinator and the cache layer.
//!
//! Every maintenance sweep and every memory alert emits an [`InfraEvent`]
//! through the [`super::EventBus`] so in-process observers can react
//! without polling.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Operational event.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum InfraEvent {
    /// The coordinator finished its first-acquire setup.
    CoordinatorStarted {
        /// Setup completion time.
        timestamp: DateTime<Utc>,
    },

    /// The coordinator tore down on its last release.
    CoordinatorStopped {
        /// Teardown completion time.
        timestamp: DateTime<Utc>,
    },

    /// Cache memory crossed the alert threshold.
    CacheMemoryAlert {
        /// Used memory as a percentage of the limit.
        usage_percent: f64,
        /// Bytes in use.
        used_bytes: u64,
        /// Configured limit in bytes.
        max_bytes: u64,
        /// Poll time.
        timestamp: DateTime<Utc>,
    },

    /// A compression sweep completed.
    CompressionSweepCompleted {
        /// Records inspected.
        scanned: u64,
        /// Records converted to compressed storage.
        compressed: u64,
        /// Bytes saved by compression.
        bytes_saved: u64,
        /// Completion time.
        timestamp: DateTime<Utc>,
    },

    /// A backup snapshot was written.
    BackupCreated {
        /// Snapshot file.
        path: PathBuf,
        /// Records in the snapshot.
        records: u64,
        /// Old snapshots pruned in the same sweep.
        pruned: u64,
        /// Completion time.
        timestamp: DateTime<Utc>,
    },

    /// A background sweep failed; the next tick retries.
    SweepFailed {
        /// Which sweep failed (`"compression"` or `"backup"`).
        sweep: String,
        /// Error description.
        error: String,
        /// Failure time.
        timestamp: DateTime<Utc>,
    },
}

impl InfraEvent {
    /// Snake-case event name, matching the serialized `event_type` tag.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::CoordinatorStarted { .. } => "coordinator_started",
            Self::CoordinatorStopped { .. } => "coordinator_stopped",
            Self::CacheMemoryAlert { .. } => "cache_memory_alert",
            Self::CompressionSweepCompleted { .. } => "compression_sweep_completed",
            Self::BackupCreated { .. } => "backup_created",
            Self::SweepFailed { .. } => "sweep_failed",
        }
    }

    /// Returns the event's timestamp.
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::CoordinatorStarted { timestamp }
            | Self::CoordinatorStopped { timestamp }
            | Self::CacheMemoryAlert { timestamp, .. }
            | Self::CompressionSweepCompleted { timestamp, .. }
            | Self::BackupCreated { timestamp, .. }
            | Self::SweepFailed { timestamp, .. } => *timestamp,
        }
    }
}
