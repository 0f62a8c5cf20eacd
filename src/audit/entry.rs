//! Audit log entry schema and query filters.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Value of [`LogEntry::signature_algorithm`].
pub const SIGNATURE_ALGORITHM: &str = "HMAC-SHA256";

/// Well-known event types.
pub mod event_types {
    /// Process started.
    pub const STARTUP: &str = "startup";
    /// Process stopped.
    pub const SHUTDOWN: &str = "shutdown";
    /// Successful sign-in.
    pub const LOGIN_SUCCESS: &str = "login_success";
    /// Rejected sign-in.
    pub const LOGIN_FAILED: &str = "login_failed";
    /// A user read stored data.
    pub const DATA_ACCESS: &str = "data_access";
    /// A user changed stored data.
    pub const DATA_MODIFICATION: &str = "data_modification";
    /// Role or permission change.
    pub const PERMISSION_CHANGE: &str = "permission_change";
    /// Runtime configuration change.
    pub const CONFIGURATION_CHANGE: &str = "configuration_change";
    /// Content verification finished.
    pub const VERIFICATION_COMPLETED: &str = "verification_completed";
    /// Content verification could not finish.
    pub const VERIFICATION_FAILED: &str = "verification_failed";
    /// Suspicious activity worth investigating.
    pub const SECURITY_ALERT: &str = "security_alert";
    /// Audit entries moved to the archive.
    pub const AUDIT_ARCHIVED: &str = "audit_archived";
}

/// Entry severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Routine event.
    Info,
    /// Unusual but handled.
    Warning,
    /// Failed operation.
    Error,
    /// Requires immediate attention.
    Critical,
}

impl Severity {
    /// Lowercase name used in the persisted line.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One persisted audit line.
///
/// Every field except the two signature fields is covered by the
/// signature. Mutating any of them makes [`crate::audit::AuditTrail::verify`]
/// return `false`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    /// Unique entry id.
    pub id: Uuid,
    /// When the event was logged.
    pub timestamp: DateTime<Utc>,
    /// Event type, usually one of [`event_types`].
    pub event_type: String,
    /// Acting user, if any.
    pub user_id: Option<String>,
    /// Severity.
    pub severity: Severity,
    /// Free-form event details.
    pub details: serde_json::Value,
    /// Emitting service.
    pub source: String,
    /// Hex HMAC over the canonical fields.
    pub signature: String,
    /// Always [`SIGNATURE_ALGORITHM`].
    pub signature_algorithm: String,
}

/// Signed fields in their fixed order.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CanonicalFields<'a> {
    id: &'a Uuid,
    timestamp: &'a DateTime<Utc>,
    event_type: &'a str,
    user_id: Option<&'a str>,
    severity: Severity,
    details: &'a serde_json::Value,
    source: &'a str,
}

impl LogEntry {
    /// Bytes the signature is computed over.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::InfraError::Serialization`] if the details
    /// cannot be serialized.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, crate::error::InfraError> {
        Ok(serde_json::to_vec(&CanonicalFields {
            id: &self.id,
            timestamp: &self.timestamp,
            event_type: &self.event_type,
            user_id: self.user_id.as_deref(),
            severity: self.severity,
            details: &self.details,
            source: &self.source,
        })?)
    }
}

/// An entry returned by a query, with its signature re-checked.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckedEntry {
    /// The stored entry.
    #[serde(flatten)]
    pub entry: LogEntry,
    /// Result of recomputing the signature at read time.
    pub signature_valid: bool,
}

/// Filters for [`crate::audit::AuditTrail::query`] and
/// [`crate::audit::AuditTrail::export`]. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditQuery {
    /// Exact event type.
    pub event_type: Option<String>,
    /// Exact acting user.
    pub user_id: Option<String>,
    /// Exact severity.
    pub severity: Option<Severity>,
    /// Inclusive lower time bound.
    pub since: Option<DateTime<Utc>>,
    /// Exclusive upper time bound.
    pub until: Option<DateTime<Utc>>,
}

impl AuditQuery {
    /// Returns `true` if `entry` passes every set filter.
    #[must_use]
    pub fn matches(&self, entry: &LogEntry) -> bool {
        self.event_type.as_deref().is_none_or(|t| entry.event_type == t)
            && self
                .user_id
                .as_deref()
                .is_none_or(|u| entry.user_id.as_deref() == Some(u))
            && self.severity.is_none_or(|s| entry.severity == s)
            && self.since.is_none_or(|since| entry.timestamp >= since)
            && self.until.is_none_or(|until| entry.timestamp < until)
    }
}

/// One page of query results.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditPage {
    /// Entries on this page, newest first.
    pub entries: Vec<CheckedEntry>,
    /// Matching entries before pagination.
    pub total: usize,
}
