//! Signed, rotating audit log.
//!
//! [`AuditTrail`] appends HMAC-SHA256 signed [`LogEntry`] lines to
//! size-rotated segment files and supports filtered queries, export,
//! archival and compliance reports. A failed signature check is reported
//! as `signature_valid: false`, never as an error.

pub mod entry;
pub mod segments;
pub mod signer;
pub mod trail;

pub use entry::{
    AuditPage, AuditQuery, CheckedEntry, LogEntry, SIGNATURE_ALGORITHM, Severity, event_types,
};
pub use segments::SegmentStore;
pub use signer::Signer;
pub use trail::{
    ArchiveReport, AuditTrail, ComplianceReport, ExportFormat, IntegritySummary, ReportPeriod,
};
