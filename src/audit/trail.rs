//! Tamper-evident audit trail.
//!
//! Every entry is signed with HMAC-SHA256 over its canonical fields and
//! appended as one JSON line to a rotating segment store. Reads recompute
//! the signature, so a line edited on disk shows up as
//! `signatureValid: false` rather than as an error.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::entry::{
    AuditPage, AuditQuery, CheckedEntry, LogEntry, SIGNATURE_ALGORITHM, Severity, event_types,
};
use super::segments::SegmentStore;
use super::signer::Signer;
use crate::config::AuditConfig;
use crate::error::InfraError;

const ARCHIVE_DIR: &str = "archive";

/// Output format for [`AuditTrail::export`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    /// Pretty-printed JSON array of checked entries.
    Json,
    /// RFC 4180 CSV with a header row.
    Csv,
}

/// Outcome of [`AuditTrail::archive`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveReport {
    /// Entries moved out of the live segments.
    pub archived: usize,
    /// Entries left in the live segments.
    pub retained: usize,
    /// Archive file written, if anything was archived.
    pub path: Option<PathBuf>,
}

/// Reporting window for [`AuditTrail::generate_compliance_report`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportPeriod {
    /// Inclusive start.
    pub start: DateTime<Utc>,
    /// Exclusive end.
    pub end: DateTime<Utc>,
}

impl ReportPeriod {
    /// The `days` days ending now.
    #[must_use]
    pub fn last_days(days: u32) -> Self {
        let end = Utc::now();
        Self {
            start: end - chrono::Duration::days(i64::from(days)),
            end,
        }
    }
}

/// Signature check totals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegritySummary {
    /// Entries whose signature matched.
    pub valid: u64,
    /// Entries whose signature did not match.
    pub invalid: u64,
    /// Ids of the failing entries.
    pub invalid_ids: Vec<Uuid>,
}

/// Aggregated audit activity over a period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComplianceReport {
    /// Period start.
    pub period_start: DateTime<Utc>,
    /// Period end.
    pub period_end: DateTime<Utc>,
    /// When the report was built.
    pub generated_at: DateTime<Utc>,
    /// Entries in the period.
    pub total_events: u64,
    /// Counts per event type.
    pub by_event_type: BTreeMap<String, u64>,
    /// Counts per severity.
    pub by_severity: BTreeMap<Severity, u64>,
    /// Counts per acting user; entries without one count under `system`.
    pub by_actor: BTreeMap<String, u64>,
    /// Signature integrity.
    pub integrity: IntegritySummary,
    /// Stored lines that could not be parsed at all.
    pub unreadable_lines: u64,
}

/// Append-only signed audit log.
pub struct AuditTrail {
    signer: Signer,
    segments: SegmentStore,
    source: String,
    retention_days: u32,
    gate: Mutex<()>,
}

impl std::fmt::Debug for AuditTrail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditTrail")
            .field("dir", &self.segments.dir())
            .field("source", &self.source)
            .field("retention_days", &self.retention_days)
            .finish_non_exhaustive()
    }
}

struct Loaded {
    entries: Vec<LogEntry>,
    unreadable: u64,
}

impl AuditTrail {
    /// Opens the log directory and sets up the signing key.
    ///
    /// # Errors
    ///
    /// Returns [`InfraError::Io`] if the directory cannot be created and
    /// [`InfraError::Configuration`] for an empty signing key.
    pub async fn open(config: &AuditConfig) -> Result<Self, InfraError> {
        let signer = Signer::new(config.signing_key.as_deref())?;
        let segments =
            SegmentStore::open(&config.log_dir, config.max_segment_bytes, config.max_segments)
                .await?;
        tracing::info!(
            dir = %config.log_dir.display(),
            max_segment_bytes = config.max_segment_bytes,
            max_segments = config.max_segments,
            "audit trail opened"
        );
        Ok(Self {
            signer,
            segments,
            source: config.source.clone(),
            retention_days: config.retention_days,
            gate: Mutex::new(()),
        })
    }

    /// Signs and appends one event.
    ///
    /// # Errors
    ///
    /// Returns [`InfraError::Serialization`] if `details` cannot be encoded
    /// or [`InfraError::Io`] if the line cannot be written.
    pub async fn log_event(
        &self,
        event_type: &str,
        user_id: Option<&str>,
        details: serde_json::Value,
        severity: Severity,
    ) -> Result<LogEntry, InfraError> {
        let mut entry = LogEntry {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            user_id: user_id.map(str::to_string),
            severity,
            details,
            source: self.source.clone(),
            signature: String::new(),
            signature_algorithm: SIGNATURE_ALGORITHM.to_string(),
        };
        entry.signature = self.signer.sign(&entry.canonical_bytes()?);
        let line = serde_json::to_string(&entry)?;

        let _gate = self.gate.lock().await;
        self.segments.append(&line).await?;
        tracing::debug!(id = %entry.id, event_type, %severity, "audit event logged");
        Ok(entry)
    }

    /// Recomputes the signature of `entry`.
    #[must_use]
    pub fn verify(&self, entry: &LogEntry) -> bool {
        if entry.signature_algorithm != SIGNATURE_ALGORITHM {
            return false;
        }
        match entry.canonical_bytes() {
            Ok(bytes) => self.signer.verify(&bytes, &entry.signature),
            Err(_) => false,
        }
    }

    fn check(&self, entry: LogEntry) -> CheckedEntry {
        let signature_valid = self.verify(&entry);
        if !signature_valid {
            tracing::warn!(id = %entry.id, event_type = %entry.event_type, "audit entry failed signature check");
        }
        CheckedEntry {
            entry,
            signature_valid,
        }
    }

    async fn load(&self) -> Result<Loaded, InfraError> {
        let lines = {
            let _gate = self.gate.lock().await;
            self.segments.read_lines().await?
        };
        let mut loaded = Loaded {
            entries: Vec::with_capacity(lines.len()),
            unreadable: 0,
        };
        for line in lines {
            match serde_json::from_str::<LogEntry>(&line) {
                Ok(entry) => loaded.entries.push(entry),
                Err(e) => {
                    loaded.unreadable += 1;
                    tracing::warn!(error = %e, "unreadable audit line skipped");
                }
            }
        }
        Ok(loaded)
    }

    async fn matching(&self, filters: &AuditQuery) -> Result<Vec<LogEntry>, InfraError> {
        let mut entries: Vec<LogEntry> = self
            .load()
            .await?
            .entries
            .into_iter()
            .filter(|entry| filters.matches(entry))
            .collect();
        // Stored oldest first; reversing keeps ties newest first.
        entries.reverse();
        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(entries)
    }

    /// Newest-first page of entries matching `filters`.
    ///
    /// # Errors
    ///
    /// Returns [`InfraError::Io`] if a segment cannot be read.
    pub async fn query(
        &self,
        filters: &AuditQuery,
        limit: usize,
        offset: usize,
    ) -> Result<AuditPage, InfraError> {
        let entries = self.matching(filters).await?;
        let total = entries.len();
        let entries = entries
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|entry| self.check(entry))
            .collect();
        Ok(AuditPage { entries, total })
    }

    /// Every entry matching `filters`, rendered as `format`.
    ///
    /// # Errors
    ///
    /// Returns [`InfraError::Io`] if a segment cannot be read or
    /// [`InfraError::Serialization`] if rendering fails.
    pub async fn export(
        &self,
        filters: &AuditQuery,
        format: ExportFormat,
    ) -> Result<String, InfraError> {
        let checked: Vec<CheckedEntry> = self
            .matching(filters)
            .await?
            .into_iter()
            .map(|entry| self.check(entry))
            .collect();
        match format {
            ExportFormat::Json => Ok(serde_json::to_string_pretty(&checked)?),
            ExportFormat::Csv => render_csv(&checked),
        }
    }

    /// Moves entries older than `older_than_days` (default: the configured
    /// retention) into `archive/` and rewrites the live segments with the
    /// rest.
    ///
    /// # Errors
    ///
    /// Returns [`InfraError::Io`] on filesystem failure. The archive file and
    /// the retained entries are both synced to disk before any existing
    /// segment is removed.
    pub async fn archive(&self, older_than_days: Option<u32>) -> Result<ArchiveReport, InfraError> {
        let days = older_than_days.unwrap_or(self.retention_days);
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(days));

        let report = {
            let _gate = self.gate.lock().await;
            let lines = self.segments.read_lines().await?;
            let (old, kept): (Vec<String>, Vec<String>) = lines.into_iter().partition(|line| {
                serde_json::from_str::<LogEntry>(line).is_ok_and(|entry| entry.timestamp < cutoff)
            });
            if old.is_empty() {
                return Ok(ArchiveReport {
                    archived: 0,
                    retained: kept.len(),
                    path: None,
                });
            }

            let archive_dir = self.segments.dir().join(ARCHIVE_DIR);
            tokio::fs::create_dir_all(&archive_dir).await?;
            let path = archive_dir.join(format!(
                "audit-{}.jsonl",
                Utc::now().format("%Y%m%dT%H%M%S%.3fZ")
            ));
            let mut file = tokio::fs::File::create(&path).await?;
            for line in &old {
                file.write_all(line.as_bytes()).await?;
                file.write_all(b"\n").await?;
            }
            file.flush().await?;
            file.sync_all().await?;

            self.segments.replace_all(&kept).await?;
            tracing::info!(
                path = %path.display(),
                archived = old.len(),
                retained = kept.len(),
                older_than_days = days,
                "audit entries archived"
            );
            ArchiveReport {
                archived: old.len(),
                retained: kept.len(),
                path: Some(path),
            }
        };

        self.log_event(
            event_types::AUDIT_ARCHIVED,
            None,
            serde_json::json!({ "archived": report.archived, "olderThanDays": days }),
            Severity::Info,
        )
        .await?;
        Ok(report)
    }

    /// Counts by event type, severity and actor over `period`, plus a
    /// signature integrity summary.
    ///
    /// # Errors
    ///
    /// Returns [`InfraError::Io`] if a segment cannot be read.
    pub async fn generate_compliance_report(
        &self,
        period: ReportPeriod,
    ) -> Result<ComplianceReport, InfraError> {
        let loaded = self.load().await?;
        let window = AuditQuery {
            since: Some(period.start),
            until: Some(period.end),
            ..AuditQuery::default()
        };
        let mut report = ComplianceReport {
            period_start: period.start,
            period_end: period.end,
            generated_at: Utc::now(),
            total_events: 0,
            by_event_type: BTreeMap::new(),
            by_severity: BTreeMap::new(),
            by_actor: BTreeMap::new(),
            integrity: IntegritySummary::default(),
            unreadable_lines: loaded.unreadable,
        };
        for entry in loaded.entries.into_iter().filter(|e| window.matches(e)) {
            report.total_events += 1;
            *report.by_event_type.entry(entry.event_type.clone()).or_default() += 1;
            *report.by_severity.entry(entry.severity).or_default() += 1;
            let actor = entry.user_id.clone().unwrap_or_else(|| "system".to_string());
            *report.by_actor.entry(actor).or_default() += 1;
            if self.verify(&entry) {
                report.integrity.valid += 1;
            } else {
                report.integrity.invalid += 1;
                report.integrity.invalid_ids.push(entry.id);
            }
        }
        if report.integrity.invalid > 0 {
            tracing::warn!(invalid = report.integrity.invalid, "compliance report found tampered entries");
        }
        Ok(report)
    }
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn render_csv(entries: &[CheckedEntry]) -> Result<String, InfraError> {
    let mut out = String::from(
        "id,timestamp,eventType,userId,severity,source,details,signature,signatureValid\n",
    );
    for CheckedEntry {
        entry,
        signature_valid,
    } in entries
    {
        let details = serde_json::to_string(&entry.details)?;
        let row = [
            entry.id.to_string(),
            entry.timestamp.to_rfc3339(),
            csv_field(&entry.event_type),
            csv_field(entry.user_id.as_deref().unwrap_or_default()),
            entry.severity.to_string(),
            csv_field(&entry.source),
            csv_field(&details),
            entry.signature.clone(),
            signature_valid.to_string(),
        ];
        out.push_str(&row.join(","));
        out.push('\n');
    }
    Ok(out)
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn trail(dir: &std::path::Path) -> AuditTrail {
        let config = AuditConfig {
            log_dir: dir.to_path_buf(),
            signing_key: Some("test-signing-key".to_string()),
            source: "audit-test".to_string(),
            ..AuditConfig::default()
        };
        let Ok(trail) = AuditTrail::open(&config).await else {
            panic!("audit trail failed to open");
        };
        trail
    }

    #[tokio::test]
    async fn edited_line_fails_verification() {
        let Ok(dir) = tempfile::tempdir() else {
            panic!("tempdir failed");
        };
        let trail = trail(dir.path()).await;
        let Ok(entry) = trail
            .log_event(event_types::LOGIN_FAILED, Some("user-1"), json!({"attempts": 6}), Severity::Warning)
            .await
        else {
            panic!("log_event failed");
        };
        assert!(trail.verify(&entry));

        let path = dir.path().join("audit.log");
        let Ok(stored) = std::fs::read_to_string(&path) else {
            panic!("read failed");
        };
        let Ok(mut line) = serde_json::from_str::<serde_json::Value>(stored.trim()) else {
            panic!("stored line is not json");
        };
        let Some(details) = line.get_mut("details").and_then(|d| d.as_object_mut()) else {
            panic!("details missing");
        };
        details.insert("attempts".to_string(), json!(7));
        let Ok(()) = std::fs::write(&path, format!("{line}\n")) else {
            panic!("write failed");
        };

        let Ok(edited) = serde_json::from_value::<LogEntry>(line) else {
            panic!("edited line does not parse");
        };
        assert!(!trail.verify(&edited));

        let Ok(page) = trail.query(&AuditQuery::default(), 10, 0).await else {
            panic!("query failed");
        };
        assert_eq!(page.total, 1);
        assert_eq!(page.entries.first().map(|e| e.signature_valid), Some(false));
    }

    #[tokio::test]
    async fn every_field_is_covered() {
        let Ok(dir) = tempfile::tempdir() else {
            panic!("tempdir failed");
        };
        let trail = trail(dir.path()).await;
        let Ok(entry) = trail
            .log_event(event_types::DATA_ACCESS, Some("user-2"), json!({"record": "p1"}), Severity::Info)
            .await
        else {
            panic!("log_event failed");
        };
        let mutations: Vec<Box<dyn Fn(&mut LogEntry)>> = vec![
            Box::new(|e: &mut LogEntry| e.id = Uuid::new_v4()),
            Box::new(|e: &mut LogEntry| e.timestamp += chrono::Duration::seconds(1)),
            Box::new(|e: &mut LogEntry| e.event_type = "login_success".to_string()),
            Box::new(|e: &mut LogEntry| e.user_id = None),
            Box::new(|e: &mut LogEntry| e.severity = Severity::Critical),
            Box::new(|e: &mut LogEntry| e.details = json!({})),
            Box::new(|e: &mut LogEntry| e.source = "elsewhere".to_string()),
            Box::new(|e: &mut LogEntry| e.signature_algorithm = "none".to_string()),
        ];
        for mutate in mutations {
            let mut copy = entry.clone();
            mutate(&mut copy);
            assert!(!trail.verify(&copy));
        }
    }

    #[tokio::test]
    async fn query_filters_and_paginates_newest_first() {
        let Ok(dir) = tempfile::tempdir() else {
            panic!("tempdir failed");
        };
        let trail = trail(dir.path()).await;
        for n in 0..5 {
            let Ok(_) = trail
                .log_event(event_types::LOGIN_FAILED, Some("user-1"), json!({"n": n}), Severity::Warning)
                .await
            else {
                panic!("log_event failed");
            };
        }
        let Ok(_) = trail
            .log_event(event_types::LOGIN_SUCCESS, Some("user-2"), json!({}), Severity::Info)
            .await
        else {
            panic!("log_event failed");
        };

        let failures = AuditQuery {
            event_type: Some(event_types::LOGIN_FAILED.to_string()),
            ..AuditQuery::default()
        };
        let Ok(page) = trail.query(&failures, 2, 1).await else {
            panic!("query failed");
        };
        assert_eq!(page.total, 5);
        assert_eq!(page.entries.len(), 2);
        assert!(page.entries.iter().all(|e| e.signature_valid));
        let ns: Vec<_> = page
            .entries
            .iter()
            .filter_map(|e| e.entry.details.get("n").and_then(serde_json::Value::as_i64))
            .collect();
        assert_eq!(ns, vec![3, 2]);

        let info = AuditQuery {
            severity: Some(Severity::Info),
            ..AuditQuery::default()
        };
        assert_eq!(trail.query(&info, 10, 0).await.ok().map(|p| p.total), Some(1));
    }

    #[tokio::test]
    async fn csv_export_quotes_json_details() {
        let Ok(dir) = tempfile::tempdir() else {
            panic!("tempdir failed");
        };
        let trail = trail(dir.path()).await;
        let Ok(_) = trail
            .log_event(event_types::SECURITY_ALERT, None, json!({"reason": "a, b"}), Severity::Critical)
            .await
        else {
            panic!("log_event failed");
        };
        let Ok(csv) = trail.export(&AuditQuery::default(), ExportFormat::Csv).await else {
            panic!("export failed");
        };
        let mut lines = csv.lines();
        assert_eq!(
            lines.next(),
            Some("id,timestamp,eventType,userId,severity,source,details,signature,signatureValid")
        );
        let Some(row) = lines.next() else {
            panic!("missing data row");
        };
        assert!(row.contains("\"{\"\"reason\"\":\"\"a, b\"\"}\""));
        assert!(row.ends_with(",true"));

        let Ok(json) = trail.export(&AuditQuery::default(), ExportFormat::Json).await else {
            panic!("export failed");
        };
        let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&json) else {
            panic!("json export does not parse");
        };
        assert_eq!(parsed.as_array().map(Vec::len), Some(1));
    }

    #[tokio::test]
    async fn archive_moves_old_entries_and_reports() {
        let Ok(dir) = tempfile::tempdir() else {
            panic!("tempdir failed");
        };
        let trail = trail(dir.path()).await;
        let Ok(_) = trail
            .log_event(event_types::DATA_MODIFICATION, Some("user-3"), json!({}), Severity::Info)
            .await
        else {
            panic!("log_event failed");
        };

        let Ok(nothing) = trail.archive(None).await else {
            panic!("archive failed");
        };
        assert_eq!(nothing.archived, 0);
        assert_eq!(nothing.retained, 1);

        // Zero days archives everything logged before now.
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let Ok(report) = trail.archive(Some(0)).await else {
            panic!("archive failed");
        };
        assert_eq!(report.archived, 1);
        assert_eq!(report.retained, 0);
        let Some(path) = report.path else {
            panic!("archive path missing");
        };
        assert!(path.starts_with(dir.path().join(ARCHIVE_DIR)));

        let Ok(page) = trail.query(&AuditQuery::default(), 10, 0).await else {
            panic!("query failed");
        };
        assert_eq!(page.total, 1);
        assert_eq!(
            page.entries.first().map(|e| e.entry.event_type.as_str()),
            Some(event_types::AUDIT_ARCHIVED)
        );
    }

    #[tokio::test]
    async fn archive_keeps_recent_entries_readable_after_reopen() {
        let Ok(dir) = tempfile::tempdir() else {
            panic!("tempdir failed");
        };
        let trail = trail(dir.path()).await;
        let Ok(mut stale) = trail
            .log_event(event_types::LOGIN_SUCCESS, Some("user-old"), json!({}), Severity::Info)
            .await
        else {
            panic!("log_event failed");
        };
        let Ok(()) = trail.segments.clear().await else {
            panic!("clear failed");
        };
        stale.timestamp = Utc::now() - chrono::Duration::days(45);
        let Ok(bytes) = stale.canonical_bytes() else {
            panic!("canonical bytes failed");
        };
        stale.signature = trail.signer.sign(&bytes);
        let Ok(line) = serde_json::to_string(&stale) else {
            panic!("serialize failed");
        };
        let Ok(()) = trail.segments.append(&line).await else {
            panic!("append failed");
        };
        for user in ["user-a", "user-b"] {
            let Ok(_) = trail
                .log_event(event_types::DATA_ACCESS, Some(user), json!({}), Severity::Info)
                .await
            else {
                panic!("log_event failed");
            };
        }

        let Ok(report) = trail.archive(Some(30)).await else {
            panic!("archive failed");
        };
        assert_eq!(report.archived, 1);
        assert_eq!(report.retained, 2);
        drop(trail);

        let reopened = self::trail(dir.path()).await;
        let Ok(page) = reopened.query(&AuditQuery::default(), 10, 0).await else {
            panic!("query failed");
        };
        assert_eq!(page.total, 3);
        assert!(page.entries.iter().all(|e| e.signature_valid));
        let mut users: Vec<_> = page
            .entries
            .iter()
            .filter_map(|e| e.entry.user_id.as_deref())
            .collect();
        users.sort_unstable();
        assert_eq!(users, vec!["user-a", "user-b"]);
    }

    #[tokio::test]
    async fn compliance_report_aggregates_and_flags_tampering() {
        let Ok(dir) = tempfile::tempdir() else {
            panic!("tempdir failed");
        };
        let trail = trail(dir.path()).await;
        let events = [
            (event_types::LOGIN_FAILED, Some("user-1"), Severity::Warning),
            (event_types::LOGIN_FAILED, Some("user-1"), Severity::Warning),
            (event_types::LOGIN_SUCCESS, Some("user-2"), Severity::Info),
            (event_types::STARTUP, None, Severity::Info),
        ];
        for (event_type, user, severity) in events {
            let Ok(_) = trail.log_event(event_type, user, json!({}), severity).await else {
                panic!("log_event failed");
            };
        }
        let path = dir.path().join("audit.log");
        let Ok(stored) = std::fs::read_to_string(&path) else {
            panic!("read failed");
        };
        let tampered = stored.replacen("\"user-2\"", "\"user-9\"", 1) + "not json\n";
        let Ok(()) = std::fs::write(&path, tampered) else {
            panic!("write failed");
        };

        let Ok(report) = trail.generate_compliance_report(ReportPeriod::last_days(1)).await else {
            panic!("report failed");
        };
        assert_eq!(report.total_events, 4);
        assert_eq!(report.by_event_type.get(event_types::LOGIN_FAILED), Some(&2));
        assert_eq!(report.by_severity.get(&Severity::Info), Some(&2));
        assert_eq!(report.by_actor.get("user-1"), Some(&2));
        assert_eq!(report.by_actor.get("system"), Some(&1));
        assert_eq!(report.integrity.valid, 3);
        assert_eq!(report.integrity.invalid, 1);
        assert_eq!(report.unreadable_lines, 1);
    }
}
