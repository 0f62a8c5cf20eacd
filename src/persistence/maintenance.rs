//! Background maintenance sweeps: cold-record compression and backups.
//!
//! Both sweeps page through the store with keyset scans and check out a
//! pooled handle per batch or per record, never holding one across the
//! whole sweep. Live CRUD traffic keeps flowing while they run.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use super::models::BackupInfo;
use super::pool::ConnectionPool;
use crate::config::MaintenanceConfig;
use crate::domain::{PersistedRecord, RecordKey};
use crate::error::InfraError;

const BACKUP_PREFIX: &str = "backup-";
const BACKUP_SUFFIX: &str = ".jsonl";

/// Which records the compression sweep may compress.
///
/// A record qualifies when it is not compressed yet, has not been read for
/// at least `min_idle`, and has been read fewer than `max_access_count`
/// times.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionPolicy {
    /// Minimum time since the last read.
    pub min_idle: chrono::Duration,
    /// Exclusive upper bound on the access count.
    pub max_access_count: u64,
}

impl CompressionPolicy {
    /// Builds the policy from maintenance settings.
    #[must_use]
    pub fn from_config(config: &MaintenanceConfig) -> Self {
        Self {
            min_idle: chrono::Duration::days(i64::from(config.compression_min_idle_days)),
            max_access_count: config.compression_max_access_count,
        }
    }

    /// Returns `true` if `record` should be compressed at `now`.
    #[must_use]
    pub fn is_eligible(&self, record: &PersistedRecord, now: DateTime<Utc>) -> bool {
        !record.compressed
            && now.signed_duration_since(record.accessed_at) >= self.min_idle
            && record.access_count < self.max_access_count
    }
}

/// Outcome of one compression sweep.
///
/// `scanned` always equals `ineligible + skipped + compressed`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CompressionReport {
    /// Records examined.
    pub scanned: u64,
    /// Records left alone because the policy excludes them.
    pub ineligible: u64,
    /// Records rewritten in compressed form.
    pub compressed: u64,
    /// Eligible records skipped because a write landed mid-sweep or the
    /// compressed form was not smaller.
    pub skipped: u64,
    /// Payload bytes before compression, over compressed records.
    pub bytes_before: u64,
    /// Payload bytes after compression, over compressed records.
    pub bytes_after: u64,
}

impl CompressionReport {
    /// Bytes saved by the sweep.
    #[must_use]
    pub fn bytes_saved(&self) -> u64 {
        self.bytes_before.saturating_sub(self.bytes_after)
    }
}

fn byte_len(bytes: &[u8]) -> u64 {
    u64::try_from(bytes.len()).unwrap_or(u64::MAX)
}

/// Compresses every eligible record, batch by batch.
///
/// # Errors
///
/// Propagates pool and store errors; records compressed before the failure
/// stay compressed.
pub async fn compress_cold_records(
    pool: &ConnectionPool,
    policy: &CompressionPolicy,
    batch_size: usize,
) -> Result<CompressionReport, InfraError> {
    let batch_size = batch_size.max(1);
    let mut report = CompressionReport::default();
    let mut cursor: Option<RecordKey> = None;

    loop {
        let handle = pool.checkout().await?;
        let batch = handle.scan(cursor.as_ref(), batch_size).await?;
        handle.release();

        let now = Utc::now();
        let full_page = batch.len() == batch_size;
        cursor = batch.last().map(|record| record.id.clone());

        for record in &batch {
            report.scanned += 1;
            let packed = if policy.is_eligible(record, now) {
                record.compressed_payload()
            } else {
                None
            };
            let Some(packed) = packed else {
                report.ineligible += 1;
                continue;
            };
            if packed.len() >= record.data.len() {
                report.skipped += 1;
                continue;
            }
            let handle = pool.checkout().await?;
            let swapped = handle
                .replace_payload(&record.id, record.updated_at, &packed, true)
                .await?;
            handle.release();
            if swapped {
                report.compressed += 1;
                report.bytes_before = report.bytes_before.saturating_add(byte_len(&record.data));
                report.bytes_after = report.bytes_after.saturating_add(byte_len(&packed));
            } else {
                report.skipped += 1;
            }
        }

        if !full_page {
            break;
        }
    }
    Ok(report)
}

/// One line of a backup file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupLine {
    /// Entity kind.
    pub kind: String,
    /// Entity key.
    pub key: String,
    /// Whether the record was stored compressed.
    pub compressed: bool,
    /// First write.
    pub created_at: DateTime<Utc>,
    /// Last write.
    pub updated_at: DateTime<Utc>,
    /// Last read.
    pub accessed_at: DateTime<Utc>,
    /// Reads since creation.
    pub access_count: u64,
    /// The entity, decompressed.
    pub value: serde_json::Value,
}

impl BackupLine {
    fn from_record(record: &PersistedRecord) -> Result<Self, InfraError> {
        let value = serde_json::from_slice(&record.decoded_data()?)?;
        Ok(Self {
            kind: record.id.kind.clone(),
            key: record.id.key.clone(),
            compressed: record.compressed,
            created_at: record.created_at,
            updated_at: record.updated_at,
            accessed_at: record.accessed_at,
            access_count: record.access_count,
            value,
        })
    }
}

fn backup_file_name(at: DateTime<Utc>) -> String {
    format!("{BACKUP_PREFIX}{}{BACKUP_SUFFIX}", at.format("%Y%m%dT%H%M%S%.3fZ"))
}

/// Writes a full snapshot of the store to `dir` as JSON lines.
///
/// The snapshot is written to a `.partial` file and renamed once complete,
/// so a crash mid-backup never leaves a truncated file that looks valid.
///
/// # Errors
///
/// Propagates pool, store and filesystem errors.
pub async fn write_backup(
    pool: &ConnectionPool,
    dir: &Path,
    batch_size: usize,
) -> Result<BackupInfo, InfraError> {
    let batch_size = batch_size.max(1);
    tokio::fs::create_dir_all(dir).await?;
    let created_at = Utc::now();
    let path = dir.join(backup_file_name(created_at));
    let partial = path.with_extension("jsonl.partial");

    let file = tokio::fs::File::create(&partial).await?;
    let mut writer = tokio::io::BufWriter::new(file);
    let mut records = 0_u64;
    let mut cursor: Option<RecordKey> = None;

    loop {
        let handle = pool.checkout().await?;
        let batch = handle.scan(cursor.as_ref(), batch_size).await?;
        handle.release();

        for record in &batch {
            let mut line = serde_json::to_vec(&BackupLine::from_record(record)?)?;
            line.push(b'\n');
            writer.write_all(&line).await?;
            records += 1;
        }
        if batch.len() < batch_size {
            break;
        }
        cursor = batch.last().map(|record| record.id.clone());
    }

    writer.flush().await?;
    writer.into_inner().sync_all().await?;
    tokio::fs::rename(&partial, &path).await?;
    let bytes = tokio::fs::metadata(&path).await?.len();

    tracing::info!(path = %path.display(), records, bytes, "backup written");
    Ok(BackupInfo {
        path,
        created_at,
        records,
        bytes,
    })
}

/// Lists backup files in `dir`, oldest first.
///
/// # Errors
///
/// Returns [`InfraError::Io`] if the directory cannot be read. A missing
/// directory yields an empty list.
pub async fn list_backups(dir: &Path) -> Result<Vec<PathBuf>, InfraError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut backups = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with(BACKUP_PREFIX) && name.ends_with(BACKUP_SUFFIX) {
            backups.push(entry.path());
        }
    }
    // Timestamped names sort chronologically.
    backups.sort();
    Ok(backups)
}

/// Deletes backups whose modification time is older than `retention`.
/// Returns how many files were removed.
///
/// # Errors
///
/// Returns [`InfraError::Io`] if the directory cannot be listed.
pub async fn prune_backups(dir: &Path, retention: std::time::Duration) -> Result<u64, InfraError> {
    let now = std::time::SystemTime::now();
    let mut pruned = 0_u64;
    for path in list_backups(dir).await? {
        let modified = match tokio::fs::metadata(&path).await.and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "cannot stat backup");
                continue;
            }
        };
        let age = now.duration_since(modified).unwrap_or_default();
        if age < retention {
            continue;
        }
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                pruned += 1;
                tracing::info!(path = %path.display(), "pruned expired backup");
            }
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "cannot prune backup"),
        }
    }
    Ok(pruned)
}
