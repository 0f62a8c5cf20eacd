//! Composition root state shared by everything the binary starts.

use std::sync::Arc;

use crate::audit::AuditTrail;
use crate::config::AppConfig;
use crate::domain::EventBus;
use crate::error::InfraError;
use crate::persistence::PersistenceCoordinator;
use crate::service::{PhraseScanAnalyzer, VerificationService};
use crate::worker::WorkerPool;

/// Capacity of the infrastructure event bus.
pub const EVENT_BUS_CAPACITY: usize = 256;

/// Process-wide handles, built once and cloned to consumers.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Loaded configuration.
    pub config: AppConfig,
    /// Infrastructure event broadcast.
    pub events: EventBus,
    /// Reference-counted persistence stack.
    pub coordinator: PersistenceCoordinator,
    /// Analysis workers.
    pub workers: WorkerPool<PhraseScanAnalyzer>,
    /// Signed audit log.
    pub audit: Arc<AuditTrail>,
}

impl AppState {
    /// Builds every component for `config`. Nothing connects to the store
    /// until the coordinator is first initialized.
    ///
    /// # Errors
    ///
    /// Returns [`InfraError::Configuration`] for a malformed cache URL or
    /// signing key, [`InfraError::InitializationFailure`] if the workers
    /// cannot start and [`InfraError::Io`] if the audit directory cannot be
    /// created.
    pub async fn build(config: AppConfig) -> Result<Self, InfraError> {
        let events = EventBus::new(EVENT_BUS_CAPACITY);
        let coordinator = PersistenceCoordinator::from_config(&config, events.clone())?;
        let workers = WorkerPool::new(PhraseScanAnalyzer::new()?, config.workers.clone())?;
        let audit = Arc::new(AuditTrail::open(&config.audit).await?);
        Ok(Self {
            config,
            events,
            coordinator,
            workers,
            audit,
        })
    }

    /// Starts a [`VerificationService`] holding its own coordinator lease.
    ///
    /// # Errors
    ///
    /// Propagates coordinator initialization failures.
    pub async fn verification_service(
        &self,
    ) -> Result<VerificationService<PhraseScanAnalyzer>, InfraError> {
        VerificationService::start(&self.coordinator, self.workers.clone(), Arc::clone(&self.audit))
            .await
    }
}
