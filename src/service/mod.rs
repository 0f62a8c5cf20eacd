//! Service layer: content verification on top of the infrastructure.
//!
//! [`VerificationService`] offloads analysis to the
//! [`crate::worker::WorkerPool`], stores results through the
//! [`crate::persistence::PersistenceCoordinator`] and records every outcome
//! in the [`crate::audit::AuditTrail`]. [`PhraseScanAnalyzer`] is the
//! default analyzer.

pub mod analyzer;
pub mod verification_service;

pub use analyzer::{Analysis, Finding, FindingSeverity, PhraseScanAnalyzer, assessment_for};
pub use verification_service::{FAILED_ASSESSMENT, VerificationService, content_id};
