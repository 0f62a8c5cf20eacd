//! End-to-end run of the stack on the in-process backends.

#![allow(clippy::panic)]

use std::path::Path;

use veritas_infra::app_state::AppState;
use veritas_infra::audit::{AuditQuery, ReportPeriod, event_types};
use veritas_infra::config::{
    AppConfig, AuditConfig, CacheBackendKind, CacheConfig, DatabaseConfig, MaintenanceConfig,
    StorageBackendKind,
};
use veritas_infra::domain::{InfraEvent, VerificationStatus};

fn config(dir: &Path) -> AppConfig {
    AppConfig {
        database: DatabaseConfig {
            backend: StorageBackendKind::Memory,
            ..DatabaseConfig::default()
        },
        cache: CacheConfig {
            backend: CacheBackendKind::Memory,
            ..CacheConfig::default()
        },
        audit: AuditConfig {
            log_dir: dir.join("audit"),
            signing_key: Some("integration-key".to_string()),
            ..AuditConfig::default()
        },
        maintenance: MaintenanceConfig {
            backup_dir: dir.join("backups"),
            ..MaintenanceConfig::default()
        },
        ..AppConfig::default()
    }
}

#[tokio::test]
async fn verification_flows_through_every_component() {
    let Ok(dir) = tempfile::tempdir() else {
        panic!("tempdir failed");
    };
    let Ok(state) = AppState::build(config(dir.path())).await else {
        panic!("state failed to build");
    };
    let mut events = state.events.subscribe();

    let Ok(service) = state.verification_service().await else {
        panic!("service failed to start");
    };
    let Ok(admin) = state.coordinator.initialize().await else {
        panic!("second initialize failed");
    };
    assert_eq!(state.coordinator.reference_count().await, 2);
    assert!(matches!(events.recv().await, Ok(InfraEvent::CoordinatorStarted { .. })));

    let article = "Reportedly, the city council approved the new transit budget. ".repeat(12);
    let Ok(record) = service
        .verify_content("reader-1", article.into_bytes(), "text/plain")
        .await
    else {
        panic!("verification failed");
    };
    assert_eq!(record.status, VerificationStatus::Completed);

    let services = &*admin;
    let Ok(Some(stored)) = services.get_verification(&record.content_id).await else {
        panic!("record missing through the admin lease");
    };
    assert_eq!(stored.assessment, record.assessment);

    let Ok(report) = services.compress_infrequently_accessed_data().await else {
        panic!("compression sweep failed");
    };
    assert_eq!(report.compressed, 0);

    let Ok(backup) = services.create_automatic_backup().await else {
        panic!("backup failed");
    };
    assert_eq!(backup.backup.records, 1);
    assert!(backup.backup.path.starts_with(dir.path().join("backups")));

    let health = services.get_health().await;
    assert_eq!(health.status, "healthy");
    assert_eq!(health.database.references, 1);

    let Ok(stats) = services.get_access_statistics().await else {
        panic!("statistics failed");
    };
    assert_eq!(stats.storage.by_kind.get("verification").map(|k| k.records), Some(1));
    assert!(stats.cache.hits >= 1);

    let Ok(compliance) = state
        .audit
        .generate_compliance_report(ReportPeriod::last_days(1))
        .await
    else {
        panic!("compliance report failed");
    };
    assert_eq!(
        compliance.by_event_type.get(event_types::VERIFICATION_COMPLETED),
        Some(&1)
    );
    assert_eq!(compliance.integrity.invalid, 0);
    let by_reader = AuditQuery {
        user_id: Some("reader-1".to_string()),
        ..AuditQuery::default()
    };
    assert_eq!(state.audit.query(&by_reader, 10, 0).await.ok().map(|p| p.total), Some(1));

    service.shutdown().await;
    assert!(state.coordinator.is_initialized().await);
    state.coordinator.close(admin).await;
    assert!(!state.coordinator.is_initialized().await);
    state.workers.close();
}
