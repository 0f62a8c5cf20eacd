//! Persistence coordinator: the top-level, reference-counted facade.
//!
//! The first [`PersistenceCoordinator::initialize`] acquires the
//! [`ResourcePool`], builds the [`CacheLayer`] and the repositories, hooks
//! cache memory alerts onto the [`EventBus`] and starts the compression and
//! backup sweeps. The last lease released stops the sweeps and the cache
//! monitor and gives the pool lease back.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::maintenance::{self, CompressionPolicy, CompressionReport};
use super::models::{BackupInfo, StorageStatistics};
use super::pool::{ConnectionPool, PoolHealth, PoolLease, ResourcePool};
use super::repository::Repository;
use crate::cache::{CacheLayer, CacheStats, CacheStore, MemoryAlert, open_store};
use crate::config::{AppConfig, CacheConfig, MaintenanceConfig};
use crate::domain::{EventBus, InfraEvent, UserProfile, VerificationRecord};
use crate::error::InfraError;
use crate::lifecycle::{Lease, Lifecycle, Shared};

/// Lease on the initialized coordinator. Releasing it is `close()`.
pub type CoordinatorLease = Lease<CoordinatorLifecycle>;

/// Last-run bookkeeping for one background sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepStatus {
    /// Completed runs, successful or not.
    pub runs: u64,
    /// Failed runs.
    pub failures: u64,
    /// End of the most recent run.
    pub last_run: Option<DateTime<Utc>>,
    /// Error of the most recent run, if it failed.
    pub last_error: Option<String>,
}

#[derive(Debug, Default)]
struct SweepSlot {
    gate: Mutex<()>,
    status: StdMutex<SweepStatus>,
}

impl SweepSlot {
    fn record<T>(&self, outcome: &Result<T, InfraError>) {
        let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        status.runs += 1;
        status.last_run = Some(Utc::now());
        match outcome {
            Ok(_) => status.last_error = None,
            Err(e) => {
                status.failures += 1;
                status.last_error = Some(e.to_string());
            }
        }
    }

    fn snapshot(&self) -> SweepStatus {
        self.status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Result of a backup sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupReport {
    /// The snapshot written.
    pub backup: BackupInfo,
    /// Expired snapshots removed afterwards.
    pub pruned: u64,
}

/// Everything the sweeps need, shared between the timers and manual calls.
#[derive(Debug)]
struct Maintenance {
    pool: Arc<ConnectionPool>,
    config: MaintenanceConfig,
    events: EventBus,
    compression: SweepSlot,
    backup: SweepSlot,
}

impl Maintenance {
    async fn compress(&self) -> Result<CompressionReport, InfraError> {
        let _running = self.compression.gate.lock().await;
        let policy = CompressionPolicy::from_config(&self.config);
        let outcome =
            maintenance::compress_cold_records(&self.pool, &policy, self.config.batch_size).await;
        self.compression.record(&outcome);
        match &outcome {
            Ok(report) => {
                tracing::info!(
                    scanned = report.scanned,
                    ineligible = report.ineligible,
                    compressed = report.compressed,
                    skipped = report.skipped,
                    bytes_saved = report.bytes_saved(),
                    "compression sweep completed"
                );
                self.events.publish(InfraEvent::CompressionSweepCompleted {
                    scanned: report.scanned,
                    compressed: report.compressed,
                    bytes_saved: report.bytes_saved(),
                    timestamp: Utc::now(),
                });
            }
            Err(e) => self.failed("compression", e),
        }
        outcome
    }

    async fn back_up(&self) -> Result<BackupReport, InfraError> {
        let _running = self.backup.gate.lock().await;
        let outcome = self.write_and_prune().await;
        self.backup.record(&outcome);
        match &outcome {
            Ok(report) => {
                self.events.publish(InfraEvent::BackupCreated {
                    path: report.backup.path.clone(),
                    records: report.backup.records,
                    pruned: report.pruned,
                    timestamp: Utc::now(),
                });
            }
            Err(e) => self.failed("backup", e),
        }
        outcome
    }

    async fn write_and_prune(&self) -> Result<BackupReport, InfraError> {
        let backup =
            maintenance::write_backup(&self.pool, &self.config.backup_dir, self.config.batch_size)
                .await?;
        let retention =
            Duration::from_secs(u64::from(self.config.backup_retention_days) * 24 * 3_600);
        let pruned = maintenance::prune_backups(&self.config.backup_dir, retention).await?;
        Ok(BackupReport { backup, pruned })
    }

    fn failed(&self, sweep: &str, err: &InfraError) {
        tracing::error!(sweep, error = %err, "maintenance sweep failed");
        self.events.publish(InfraEvent::SweepFailed {
            sweep: sweep.to_string(),
            error: err.to_string(),
            timestamp: Utc::now(),
        });
    }
}

fn spawn_sweep<F, Fut>(
    name: &'static str,
    period: Duration,
    token: CancellationToken,
    run: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let period = period.max(Duration::from_millis(10));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                () = token.cancelled() => break,
                _ = ticker.tick() => run().await,
            }
        }
        tracing::debug!(sweep = name, "sweep timer stopped");
    })
}

/// Aggregated health of the persistence stack.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoordinatorHealth {
    /// `"healthy"`, `"degraded"` (cache down or pool saturated) or
    /// `"unhealthy"` (store down).
    pub status: &'static str,
    /// Relational store health.
    pub database: PoolHealth,
    /// Whether the cache service answered a ping.
    pub cache_reachable: bool,
    /// Cache counters.
    pub cache: CacheStats,
    /// Compression sweep bookkeeping.
    pub compression: SweepStatus,
    /// Backup sweep bookkeeping.
    pub backup: SweepStatus,
    /// When the snapshot was taken.
    pub checked_at: DateTime<Utc>,
}

/// Store and cache access counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccessStatistics {
    /// Record counts and access totals from the store.
    pub storage: StorageStatistics,
    /// Cache hit/miss counters.
    pub cache: CacheStats,
    /// When the statistics were collected.
    pub collected_at: DateTime<Utc>,
}

/// The initialized persistence stack, reached through a [`CoordinatorLease`].
pub struct PersistenceServices {
    pool: ResourcePool,
    pool_lease: Mutex<Option<PoolLease>>,
    cache: Arc<CacheLayer>,
    profiles: Repository<UserProfile>,
    verifications: Repository<VerificationRecord>,
    maintenance: Arc<Maintenance>,
    sweeps: CancellationToken,
    sweep_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for PersistenceServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistenceServices")
            .field("cache", &self.cache)
            .field("profiles", &self.profiles)
            .field("verifications", &self.verifications)
            .finish_non_exhaustive()
    }
}

impl PersistenceServices {
    /// Reads a user profile.
    ///
    /// # Errors
    ///
    /// Propagates pool and store errors.
    pub async fn get_profile(&self, user_id: &str) -> Result<Option<UserProfile>, InfraError> {
        self.profiles.get(user_id).await
    }

    /// Reads several user profiles.
    ///
    /// # Errors
    ///
    /// Propagates pool and store errors.
    pub async fn get_profiles(
        &self,
        user_ids: &[String],
    ) -> Result<HashMap<String, UserProfile>, InfraError> {
        self.profiles.get_many(user_ids).await
    }

    /// Creates or updates a user profile.
    ///
    /// # Errors
    ///
    /// Propagates pool and store errors.
    pub async fn save_profile(&self, profile: &UserProfile) -> Result<(), InfraError> {
        self.profiles.save(profile).await
    }

    /// Creates or updates several profiles in one transaction.
    ///
    /// # Errors
    ///
    /// Propagates pool and store errors.
    pub async fn save_profiles(&self, profiles: &[UserProfile]) -> Result<(), InfraError> {
        self.profiles.save_many(profiles).await
    }

    /// Deletes a user profile. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// Propagates pool and store errors.
    pub async fn delete_profile(&self, user_id: &str) -> Result<bool, InfraError> {
        self.profiles.delete(user_id).await
    }

    /// Reads a verification record.
    ///
    /// # Errors
    ///
    /// Propagates pool and store errors.
    pub async fn get_verification(
        &self,
        content_id: &str,
    ) -> Result<Option<VerificationRecord>, InfraError> {
        self.verifications.get(content_id).await
    }

    /// Reads several verification records.
    ///
    /// # Errors
    ///
    /// Propagates pool and store errors.
    pub async fn get_verifications(
        &self,
        content_ids: &[String],
    ) -> Result<HashMap<String, VerificationRecord>, InfraError> {
        self.verifications.get_many(content_ids).await
    }

    /// Creates or updates a verification record.
    ///
    /// # Errors
    ///
    /// Propagates pool and store errors.
    pub async fn save_verification(&self, record: &VerificationRecord) -> Result<(), InfraError> {
        self.verifications.save(record).await
    }

    /// Creates or updates several verification records in one transaction.
    ///
    /// # Errors
    ///
    /// Propagates pool and store errors.
    pub async fn save_verifications(
        &self,
        records: &[VerificationRecord],
    ) -> Result<(), InfraError> {
        self.verifications.save_many(records).await
    }

    /// Deletes a verification record. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// Propagates pool and store errors.
    pub async fn delete_verification(&self, content_id: &str) -> Result<bool, InfraError> {
        self.verifications.delete(content_id).await
    }

    /// Runs the compression sweep now. Waits for a running sweep to finish
    /// first.
    ///
    /// # Errors
    ///
    /// Propagates pool and store errors.
    pub async fn compress_infrequently_accessed_data(
        &self,
    ) -> Result<CompressionReport, InfraError> {
        self.maintenance.compress().await
    }

    /// Writes a backup snapshot now and prunes expired ones.
    ///
    /// # Errors
    ///
    /// Propagates pool, store and filesystem errors.
    pub async fn create_automatic_backup(&self) -> Result<BackupReport, InfraError> {
        self.maintenance.back_up().await
    }

    /// Aggregated health. Never fails.
    pub async fn get_health(&self) -> CoordinatorHealth {
        let database = self.pool.health_check().await;
        let cache_reachable = self.cache.ping().await;
        let status = if database.status == "unhealthy" {
            "unhealthy"
        } else if !database.is_healthy() || !cache_reachable {
            "degraded"
        } else {
            "healthy"
        };
        CoordinatorHealth {
            status,
            database,
            cache_reachable,
            cache: self.cache.stats(),
            compression: self.maintenance.compression.snapshot(),
            backup: self.maintenance.backup.snapshot(),
            checked_at: Utc::now(),
        }
    }

    /// Store and cache access counters.
    ///
    /// # Errors
    ///
    /// Propagates pool and store errors.
    pub async fn get_access_statistics(&self) -> Result<AccessStatistics, InfraError> {
        let handle = self.maintenance.pool.checkout().await?;
        let storage = handle.statistics().await?;
        handle.release();
        Ok(AccessStatistics {
            storage,
            cache: self.cache.stats(),
            collected_at: Utc::now(),
        })
    }

    /// The cache layer shared by the repositories.
    #[must_use]
    pub fn cache(&self) -> Arc<CacheLayer> {
        Arc::clone(&self.cache)
    }

    async fn shutdown(&self) {
        self.sweeps.cancel();
        let tasks = std::mem::take(&mut *self.sweep_tasks.lock().await);
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "sweep task ended abnormally");
            }
        }
        self.cache.stop_monitor();
        if let Some(lease) = self.pool_lease.lock().await.take() {
            lease.release().await;
        }
    }
}

/// Setup and teardown hooks for [`PersistenceServices`].
pub struct CoordinatorLifecycle {
    pool: ResourcePool,
    cache_store: Arc<dyn CacheStore>,
    cache_config: CacheConfig,
    maintenance: MaintenanceConfig,
    events: EventBus,
}

impl fmt::Debug for CoordinatorLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoordinatorLifecycle")
            .field("pool", &self.pool)
            .field("cache_store", &self.cache_store.name())
            .field("maintenance", &self.maintenance)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Lifecycle for CoordinatorLifecycle {
    type Resource = PersistenceServices;

    fn name(&self) -> &'static str {
        "persistence_coordinator"
    }

    async fn open(&self) -> Result<PersistenceServices, InfraError> {
        let pool_lease = self.pool.acquire().await?;
        let Some(connections) = pool_lease.resource() else {
            return Err(InfraError::Internal("fresh pool lease has no pool".to_string()));
        };

        let cache = Arc::new(CacheLayer::new(
            Arc::clone(&self.cache_store),
            self.cache_config.clone(),
        ));
        if !cache.initialize().await {
            tracing::warn!("cache not configured; continuing with its current policy");
        }
        let events = self.events.clone();
        cache.on_memory_alert(Arc::new(move |alert: &MemoryAlert| -> anyhow::Result<()> {
            events.publish(InfraEvent::CacheMemoryAlert {
                usage_percent: alert.usage_percent,
                used_bytes: alert.used_bytes,
                max_bytes: alert.max_bytes,
                timestamp: alert.timestamp,
            });
            Ok(())
        }));
        cache.start_monitor();

        let profiles = Repository::new(Arc::clone(&connections), Arc::clone(&cache), None);
        let verifications = Repository::new(Arc::clone(&connections), Arc::clone(&cache), None);

        let maintenance = Arc::new(Maintenance {
            pool: connections,
            config: self.maintenance.clone(),
            events: self.events.clone(),
            compression: SweepSlot::default(),
            backup: SweepSlot::default(),
        });
        let sweeps = CancellationToken::new();
        let compression_task = {
            let maintenance = Arc::clone(&maintenance);
            spawn_sweep(
                "compression",
                self.maintenance.compression_interval,
                sweeps.child_token(),
                move || {
                    let maintenance = Arc::clone(&maintenance);
                    async move {
                        let _ = maintenance.compress().await;
                    }
                },
            )
        };
        let backup_task = {
            let maintenance = Arc::clone(&maintenance);
            spawn_sweep(
                "backup",
                self.maintenance.backup_interval,
                sweeps.child_token(),
                move || {
                    let maintenance = Arc::clone(&maintenance);
                    async move {
                        let _ = maintenance.back_up().await;
                    }
                },
            )
        };

        tracing::info!(
            compression_interval_secs = self.maintenance.compression_interval.as_secs(),
            backup_interval_secs = self.maintenance.backup_interval.as_secs(),
            "persistence coordinator initialized"
        );
        self.events.publish(InfraEvent::CoordinatorStarted {
            timestamp: Utc::now(),
        });

        Ok(PersistenceServices {
            pool: self.pool.clone(),
            pool_lease: Mutex::new(Some(pool_lease)),
            cache,
            profiles,
            verifications,
            maintenance,
            sweeps,
            sweep_tasks: Mutex::new(vec![compression_task, backup_task]),
        })
    }

    async fn close(&self, services: Arc<PersistenceServices>) {
        services.shutdown().await;
        tracing::info!("persistence coordinator closed");
        self.events.publish(InfraEvent::CoordinatorStopped {
            timestamp: Utc::now(),
        });
    }
}

/// Process-wide handle to the persistence stack.
///
/// Built once at the composition root and cloned to every consumer. Each
/// consumer calls [`PersistenceCoordinator::initialize`] and keeps the
/// returned lease for as long as it needs the stack.
#[derive(Debug, Clone)]
pub struct PersistenceCoordinator {
    shared: Arc<Shared<CoordinatorLifecycle>>,
    events: EventBus,
}

impl PersistenceCoordinator {
    /// Assembles a coordinator from its parts. Nothing connects until the
    /// first `initialize`.
    #[must_use]
    pub fn new(
        pool: ResourcePool,
        cache_store: Arc<dyn CacheStore>,
        cache_config: CacheConfig,
        maintenance: MaintenanceConfig,
        events: EventBus,
    ) -> Self {
        let lifecycle = CoordinatorLifecycle {
            pool,
            cache_store,
            cache_config,
            maintenance,
            events: events.clone(),
        };
        Self {
            shared: Shared::new(lifecycle),
            events,
        }
    }

    /// Assembles a coordinator for the backends named in `config`.
    ///
    /// # Errors
    ///
    /// Returns [`InfraError::Configuration`] if the cache URL is malformed.
    pub fn from_config(config: &AppConfig, events: EventBus) -> Result<Self, InfraError> {
        let pool = ResourcePool::from_config(config.database.clone());
        let cache_store = open_store(&config.cache)?;
        Ok(Self::new(
            pool,
            cache_store,
            config.cache.clone(),
            config.maintenance.clone(),
            events,
        ))
    }

    /// Takes a reference, running full setup on 0 → 1.
    ///
    /// # Errors
    ///
    /// Returns [`InfraError::InitializationFailure`] if the store is
    /// unreachable; nothing is left running in that case.
    pub async fn initialize(&self) -> Result<CoordinatorLease, InfraError> {
        self.shared.acquire().await
    }

    /// Gives a reference back, tearing everything down on 1 → 0.
    pub async fn close(&self, lease: CoordinatorLease) {
        lease.release().await;
    }

    /// Outstanding lease count.
    pub async fn reference_count(&self) -> usize {
        self.shared.reference_count().await
    }

    /// Returns `true` while initialized.
    pub async fn is_initialized(&self) -> bool {
        self.shared.is_open().await
    }

    /// Bus carrying sweep, backup and memory alert events.
    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.events
    }
}
