//! Verification service: analysis offload, result storage and auditing.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use sha2::{Digest, Sha256};

use super::analyzer::Analysis;
use crate::audit::{AuditTrail, Severity, event_types};
use crate::domain::{VerificationRecord, VerificationStatus};
use crate::error::InfraError;
use crate::persistence::{CoordinatorLease, PersistenceCoordinator};
use crate::worker::{Analyzer, TaskOptions, WorkerPool, WorkerTask};

/// Assessment stored for requests whose analysis failed.
pub const FAILED_ASSESSMENT: &str = "Analysis Failed";

/// Lowercase hex SHA-256 of `content`; used as the content id.
#[must_use]
pub fn content_id(content: &[u8]) -> String {
    format!("{:x}", Sha256::digest(content))
}

/// Runs content analysis on the worker pool, stores each outcome through
/// the persistence coordinator and records it in the audit trail.
///
/// Holds a coordinator lease for its whole lifetime; call
/// [`VerificationService::shutdown`] to give it back.
pub struct VerificationService<A: Analyzer<Output = Analysis>> {
    persistence: CoordinatorLease,
    workers: WorkerPool<A>,
    audit: Arc<AuditTrail>,
}

impl<A: Analyzer<Output = Analysis>> fmt::Debug for VerificationService<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerificationService")
            .field("workers", &self.workers)
            .field("audit", &self.audit)
            .finish_non_exhaustive()
    }
}

impl<A: Analyzer<Output = Analysis>> VerificationService<A> {
    /// Takes a coordinator lease and wires the service.
    ///
    /// # Errors
    ///
    /// Propagates [`PersistenceCoordinator::initialize`] failures.
    pub async fn start(
        coordinator: &PersistenceCoordinator,
        workers: WorkerPool<A>,
        audit: Arc<AuditTrail>,
    ) -> Result<Self, InfraError> {
        let persistence = coordinator.initialize().await?;
        Ok(Self {
            persistence,
            workers,
            audit,
        })
    }

    /// Worker pool used for analysis.
    #[must_use]
    pub fn workers(&self) -> &WorkerPool<A> {
        &self.workers
    }

    /// Analyzes `content`, stores the result and audits it.
    ///
    /// A failed analysis is stored as a [`VerificationStatus::Failed`]
    /// record and audited before the error is returned.
    ///
    /// # Errors
    ///
    /// Returns the worker error ([`InfraError::WorkerTimeout`],
    /// [`InfraError::WorkerCrash`], ...) when analysis fails, or a pool or
    /// store error when the record cannot be saved.
    pub async fn verify_content(
        &self,
        user_id: &str,
        content: Vec<u8>,
        content_type: &str,
    ) -> Result<VerificationRecord, InfraError> {
        let content_id = content_id(&content);
        let content_size = content.len();
        let task = WorkerTask::new(
            content,
            TaskOptions {
                content_type: Some(content_type.to_string()),
                ..TaskOptions::default()
            },
        );
        let task_id = task.task_id;
        let mut record = VerificationRecord {
            content_id,
            user_id: user_id.to_string(),
            content_type: content_type.to_string(),
            content_size,
            score: 0.0,
            confidence: 0.0,
            assessment: FAILED_ASSESSMENT.to_string(),
            findings: Vec::new(),
            status: VerificationStatus::Failed,
            task_id,
            analyzed_at: Utc::now(),
        };

        match self.workers.dispatch(task, None).await {
            Ok(response) => {
                let analysis = response.output;
                record.score = analysis.score;
                record.confidence = analysis.confidence;
                record.assessment = analysis.assessment;
                record.findings = analysis
                    .findings
                    .into_iter()
                    .map(|finding| finding.description)
                    .collect();
                record.status = VerificationStatus::Completed;
                record.analyzed_at = Utc::now();
                self.persistence.save_verification(&record).await?;
                tracing::info!(
                    content_id = %record.content_id,
                    %task_id,
                    score = record.score,
                    assessment = %record.assessment,
                    "content verified"
                );
                self.audit_quietly(
                    event_types::VERIFICATION_COMPLETED,
                    user_id,
                    json!({
                        "contentId": record.content_id,
                        "taskId": task_id,
                        "score": record.score,
                        "assessment": record.assessment,
                    }),
                    Severity::Info,
                )
                .await;
                Ok(record)
            }
            Err(e) => {
                record.findings = vec![e.to_string()];
                record.analyzed_at = Utc::now();
                self.store_failure(&record).await;
                let severity = if e.is_retryable() {
                    Severity::Warning
                } else {
                    Severity::Error
                };
                tracing::warn!(content_id = %record.content_id, %task_id, error = %e, "verification failed");
                self.audit_quietly(
                    event_types::VERIFICATION_FAILED,
                    user_id,
                    json!({
                        "contentId": record.content_id,
                        "taskId": task_id,
                        "errorCode": e.error_code(),
                        "error": e.to_string(),
                    }),
                    severity,
                )
                .await;
                Err(e)
            }
        }
    }

    /// Reads a stored result by content id.
    ///
    /// # Errors
    ///
    /// Propagates pool and store errors.
    pub async fn get_result(
        &self,
        content_id: &str,
    ) -> Result<Option<VerificationRecord>, InfraError> {
        self.persistence.get_verification(content_id).await
    }

    /// Stores a failed outcome unless the same content already has a
    /// completed result.
    async fn store_failure(&self, record: &VerificationRecord) {
        match self.persistence.get_verification(&record.content_id).await {
            Ok(Some(previous)) if previous.status == VerificationStatus::Completed => {
                tracing::debug!(
                    content_id = %record.content_id,
                    "completed result kept over failed retry"
                );
                return;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(content_id = %record.content_id, error = %e, "previous result lookup failed");
            }
        }
        if let Err(e) = self.persistence.save_verification(record).await {
            tracing::warn!(content_id = %record.content_id, error = %e, "failed verification not stored");
        }
    }

    async fn audit_quietly(
        &self,
        event_type: &str,
        user_id: &str,
        details: serde_json::Value,
        severity: Severity,
    ) {
        if let Err(e) = self
            .audit
            .log_event(event_type, Some(user_id), details, severity)
            .await
        {
            tracing::error!(event_type, error = %e, "audit event not recorded");
        }
    }

    /// Releases the coordinator lease. Workers are left running for other
    /// owners of the pool.
    pub async fn shutdown(self) {
        self.persistence.release().await;
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::audit::AuditQuery;
    use crate::cache::MemoryCacheStore;
    use crate::config::{AuditConfig, CacheConfig, DatabaseConfig, MaintenanceConfig, WorkerConfig};
    use crate::domain::EventBus;
    use crate::persistence::ResourcePool;
    use crate::persistence::memory::MemoryConnector;
    use crate::service::PhraseScanAnalyzer;
    use crate::worker::analyzer_fn;
    use std::time::Duration;

    fn coordinator() -> PersistenceCoordinator {
        let pool = ResourcePool::new(
            DatabaseConfig::default(),
            Arc::new(MemoryConnector::default()),
        );
        PersistenceCoordinator::new(
            pool,
            Arc::new(MemoryCacheStore::new()),
            CacheConfig::default(),
            MaintenanceConfig::default(),
            EventBus::new(16),
        )
    }

    async fn audit(dir: &std::path::Path) -> Arc<AuditTrail> {
        let config = AuditConfig {
            log_dir: dir.to_path_buf(),
            signing_key: Some("k".to_string()),
            ..AuditConfig::default()
        };
        let Ok(audit) = AuditTrail::open(&config).await else {
            panic!("audit failed to open");
        };
        Arc::new(audit)
    }

    #[tokio::test]
    async fn verified_content_is_stored_and_audited() {
        let Ok(dir) = tempfile::tempdir() else {
            panic!("tempdir failed");
        };
        let coordinator = coordinator();
        let Ok(analyzer) = PhraseScanAnalyzer::new() else {
            panic!("analyzer failed");
        };
        let Ok(workers) = WorkerPool::new(analyzer, WorkerConfig::default()) else {
            panic!("workers failed");
        };
        let audit = audit(dir.path()).await;
        let Ok(service) = VerificationService::start(&coordinator, workers, Arc::clone(&audit)).await
        else {
            panic!("service failed to start");
        };
        assert_eq!(coordinator.reference_count().await, 1);

        let text = b"Shocking! Everyone says the bridge is closed.".to_vec();
        let Ok(record) = service.verify_content("user-7", text.clone(), "text/plain").await else {
            panic!("verification failed");
        };
        assert_eq!(record.status, VerificationStatus::Completed);
        assert_eq!(record.content_id, content_id(&text));
        assert!(record.score < 0.85);

        let Ok(Some(stored)) = service.get_result(&record.content_id).await else {
            panic!("record not stored");
        };
        assert_eq!(stored.task_id, record.task_id);

        let completed = AuditQuery {
            event_type: Some(event_types::VERIFICATION_COMPLETED.to_string()),
            user_id: Some("user-7".to_string()),
            ..AuditQuery::default()
        };
        let Ok(page) = audit.query(&completed, 10, 0).await else {
            panic!("audit query failed");
        };
        assert_eq!(page.total, 1);

        service.shutdown().await;
        assert!(!coordinator.is_initialized().await);
    }

    #[tokio::test]
    async fn timeout_is_stored_as_failed_and_audited_as_warning() {
        let Ok(dir) = tempfile::tempdir() else {
            panic!("tempdir failed");
        };
        let coordinator = coordinator();
        let slow = analyzer_fn(|_: &[u8], _: &TaskOptions| {
            std::thread::sleep(Duration::from_millis(200));
            Analysis {
                score: 1.0,
                confidence: 1.0,
                assessment: "Highly Authentic".to_string(),
                findings: Vec::new(),
            }
        });
        let config = WorkerConfig {
            max_workers: 1,
            task_timeout: Duration::from_millis(20),
            queue_capacity: 1,
            inline_threshold: 0,
        };
        let Ok(workers) = WorkerPool::new(slow, config) else {
            panic!("workers failed");
        };
        let audit = audit(dir.path()).await;
        let Ok(service) = VerificationService::start(&coordinator, workers, Arc::clone(&audit)).await
        else {
            panic!("service failed to start");
        };

        let Err(err) = service.verify_content("user-8", b"payload".to_vec(), "text/plain").await else {
            panic!("slow analysis should time out");
        };
        assert!(matches!(err, InfraError::WorkerTimeout { .. }));

        let Ok(Some(stored)) = service.get_result(&content_id(b"payload")).await else {
            panic!("failed record not stored");
        };
        assert_eq!(stored.status, VerificationStatus::Failed);
        assert_eq!(stored.assessment, FAILED_ASSESSMENT);

        let failures = AuditQuery {
            event_type: Some(event_types::VERIFICATION_FAILED.to_string()),
            severity: Some(Severity::Warning),
            ..AuditQuery::default()
        };
        assert_eq!(audit.query(&failures, 10, 0).await.ok().map(|p| p.total), Some(1));
        service.shutdown().await;
    }

    #[tokio::test]
    async fn failed_retry_keeps_completed_result() {
        let Ok(dir) = tempfile::tempdir() else {
            panic!("tempdir failed");
        };
        let coordinator = coordinator();
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let flaky = analyzer_fn(move |_: &[u8], _: &TaskOptions| {
            if seen.fetch_add(1, std::sync::atomic::Ordering::SeqCst) > 0 {
                std::thread::sleep(Duration::from_millis(200));
            }
            Analysis {
                score: 0.9,
                confidence: 0.9,
                assessment: "Highly Authentic".to_string(),
                findings: Vec::new(),
            }
        });
        let config = WorkerConfig {
            max_workers: 1,
            task_timeout: Duration::from_millis(50),
            queue_capacity: 1,
            inline_threshold: 0,
        };
        let Ok(workers) = WorkerPool::new(flaky, config) else {
            panic!("workers failed");
        };
        let audit = audit(dir.path()).await;
        let Ok(service) = VerificationService::start(&coordinator, workers, Arc::clone(&audit)).await
        else {
            panic!("service failed to start");
        };

        let Ok(first) = service.verify_content("user-9", b"same".to_vec(), "text/plain").await else {
            panic!("first verification failed");
        };
        assert_eq!(first.status, VerificationStatus::Completed);

        let Err(err) = service.verify_content("user-9", b"same".to_vec(), "text/plain").await else {
            panic!("second verification should time out");
        };
        assert!(matches!(err, InfraError::WorkerTimeout { .. }));

        let Ok(Some(stored)) = service.get_result(&content_id(b"same")).await else {
            panic!("record missing");
        };
        assert_eq!(stored.status, VerificationStatus::Completed);
        assert_eq!(stored.task_id, first.task_id);

        let failures = AuditQuery {
            event_type: Some(event_types::VERIFICATION_FAILED.to_string()),
            ..AuditQuery::default()
        };
        assert_eq!(audit.query(&failures, 10, 0).await.ok().map(|p| p.total), Some(1));
        service.shutdown().await;
    }
}
