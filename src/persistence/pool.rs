//! Reference-counted connection pool.
//!
//! [`ResourcePool`] is the process-wide handle to the relational store. The
//! first [`ResourcePool::acquire`] connects the configured backend and runs
//! a liveness probe; the last lease released closes it. While open, the
//! [`ConnectionPool`] hands out at most `max_pool_size` [`PooledHandle`]s
//! at a time.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

use super::backend::{BackendConnector, StorageBackend, connector_for};
use crate::config::DatabaseConfig;
use crate::error::InfraError;
use crate::lifecycle::{Lease, Lifecycle, Shared};

/// Lease on the open [`ConnectionPool`].
pub type PoolLease = Lease<PoolLifecycle>;

/// Connect/probe/close hooks for the relational store.
#[derive(Debug)]
pub struct PoolLifecycle {
    config: DatabaseConfig,
    connector: Arc<dyn BackendConnector>,
}

#[async_trait]
impl Lifecycle for PoolLifecycle {
    type Resource = ConnectionPool;

    fn name(&self) -> &'static str {
        "connection_pool"
    }

    async fn open(&self) -> Result<ConnectionPool, InfraError> {
        let backend = self.connector.connect(&self.config).await?;
        if let Err(e) = backend.ping().await {
            backend.close().await;
            return Err(InfraError::InitializationFailure(format!(
                "liveness probe against {} failed: {e}",
                backend.name()
            )));
        }
        let max_size = usize::try_from(self.config.max_pool_size.max(1)).unwrap_or(1);
        tracing::info!(
            backend = backend.name(),
            max_size,
            min_size = self.config.min_pool_size,
            "connection pool opened"
        );
        Ok(ConnectionPool::new(
            backend,
            max_size,
            self.config.connection_timeout,
        ))
    }

    async fn close(&self, pool: Arc<ConnectionPool>) {
        pool.shutdown().await;
        tracing::info!(backend = pool.backend.name(), "connection pool closed");
    }
}

/// The open pool: a backend plus a bounded set of checkout permits.
pub struct ConnectionPool {
    backend: Arc<dyn StorageBackend>,
    permits: Arc<Semaphore>,
    max_size: usize,
    connection_timeout: Duration,
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("backend", &self.backend.name())
            .field("max_size", &self.max_size)
            .field("in_use", &self.in_use())
            .finish()
    }
}

impl ConnectionPool {
    /// Builds a pool over an already connected backend.
    #[must_use]
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        max_size: usize,
        connection_timeout: Duration,
    ) -> Self {
        let max_size = max_size.max(1);
        Self {
            backend,
            permits: Arc::new(Semaphore::new(max_size)),
            max_size,
            connection_timeout,
        }
    }

    /// Checks out a handle, waiting up to the connection timeout.
    ///
    /// # Errors
    ///
    /// - [`InfraError::ConnectionTimeout`] if no handle frees up in time.
    /// - [`InfraError::PoolClosed`] if the pool closes while waiting.
    pub async fn checkout(&self) -> Result<PooledHandle, InfraError> {
        let waiting = Arc::clone(&self.permits).acquire_owned();
        match tokio::time::timeout(self.connection_timeout, waiting).await {
            Ok(Ok(permit)) => Ok(self.handle(permit)),
            Ok(Err(_)) => Err(InfraError::PoolClosed),
            Err(_) => {
                let timeout_ms =
                    u64::try_from(self.connection_timeout.as_millis()).unwrap_or(u64::MAX);
                tracing::warn!(
                    max_size = self.max_size,
                    timeout_ms,
                    "pooled connection checkout timed out"
                );
                Err(InfraError::ConnectionTimeout { timeout_ms })
            }
        }
    }

    /// Checks out a handle only if one is free right now.
    ///
    /// # Errors
    ///
    /// - [`InfraError::ConnectionExhausted`] if every handle is in use.
    /// - [`InfraError::PoolClosed`] if the pool is closed.
    pub fn try_checkout(&self) -> Result<PooledHandle, InfraError> {
        match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => Ok(self.handle(permit)),
            Err(TryAcquireError::NoPermits) => Err(InfraError::ConnectionExhausted {
                max_size: self.max_size,
            }),
            Err(TryAcquireError::Closed) => Err(InfraError::PoolClosed),
        }
    }

    /// Number of handles currently checked out.
    #[must_use]
    pub fn in_use(&self) -> usize {
        if self.permits.is_closed() {
            return 0;
        }
        self.max_size.saturating_sub(self.permits.available_permits())
    }

    /// Configured maximum number of simultaneous handles.
    #[must_use]
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Name of the backend behind this pool.
    #[must_use]
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    fn handle(&self, permit: OwnedSemaphorePermit) -> PooledHandle {
        PooledHandle {
            backend: Arc::clone(&self.backend),
            _permit: permit,
        }
    }

    async fn shutdown(&self) {
        self.permits.close();
        self.backend.close().await;
    }
}

/// One checked-out connection.
///
/// Owned by the caller for the duration of one operation. The slot returns
/// to the pool when the handle is released or dropped; `release` consumes
/// the handle, so it cannot be used afterwards.
pub struct PooledHandle {
    backend: Arc<dyn StorageBackend>,
    _permit: OwnedSemaphorePermit,
}

impl fmt::Debug for PooledHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledHandle")
            .field("backend", &self.backend.name())
            .finish_non_exhaustive()
    }
}

impl PooledHandle {
    /// Returns the handle to the pool.
    pub fn release(self) {
        drop(self);
    }
}

impl Deref for PooledHandle {
    type Target = dyn StorageBackend;

    fn deref(&self) -> &Self::Target {
        self.backend.as_ref()
    }
}

/// Health snapshot of the pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolHealth {
    /// `"healthy"`, `"degraded"` (every handle in use) or `"unhealthy"`.
    pub status: &'static str,
    /// Human-readable detail.
    pub detail: String,
    /// Handles currently checked out.
    pub in_use: usize,
    /// Configured maximum.
    pub max_size: usize,
    /// Outstanding pool leases.
    pub references: usize,
}

impl PoolHealth {
    /// Returns `true` when the status is `"healthy"`.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

/// Shared, reference-counted handle to the relational store.
///
/// Cheap to clone; every clone refers to the same pool and count.
#[derive(Debug, Clone)]
pub struct ResourcePool {
    shared: Arc<Shared<PoolLifecycle>>,
}

impl ResourcePool {
    /// Creates a closed pool that connects through `connector` on first use.
    #[must_use]
    pub fn new(config: DatabaseConfig, connector: Arc<dyn BackendConnector>) -> Self {
        Self {
            shared: Shared::new(PoolLifecycle { config, connector }),
        }
    }

    /// Creates a closed pool for the backend named in `config`.
    #[must_use]
    pub fn from_config(config: DatabaseConfig) -> Self {
        let connector = connector_for(config.backend);
        Self::new(config, connector)
    }

    /// Takes a reference, connecting and probing the store on 0 → 1.
    ///
    /// # Errors
    ///
    /// Returns [`InfraError::InitializationFailure`] if the backend cannot
    /// be reached or fails its liveness probe.
    pub async fn acquire(&self) -> Result<PoolLease, InfraError> {
        self.shared.acquire().await
    }

    /// Outstanding lease count.
    pub async fn reference_count(&self) -> usize {
        self.shared.reference_count().await
    }

    /// Returns `true` while the pool is open.
    pub async fn is_open(&self) -> bool {
        self.shared.is_open().await
    }

    /// Probes the store through a pooled handle.
    ///
    /// Never waits for a handle: a saturated pool reports `"degraded"`.
    /// Never fails: every other problem is reported as `"unhealthy"`.
    pub async fn health_check(&self) -> PoolHealth {
        let references = self.shared.reference_count().await;
        let max_size = usize::try_from(self.shared.lifecycle().config.max_pool_size).unwrap_or(0);
        let Some(pool) = self.shared.current().await else {
            return PoolHealth {
                status: "unhealthy",
                detail: "pool is not open".to_string(),
                in_use: 0,
                max_size,
                references,
            };
        };

        let outcome = match pool.try_checkout() {
            Ok(handle) => {
                let probe = handle.ping().await;
                handle.release();
                probe
            }
            Err(e) => Err(e),
        };
        let (status, detail) = match outcome {
            Ok(()) => ("healthy", format!("{} responded to probe", pool.backend_name())),
            Err(InfraError::ConnectionExhausted { max_size }) => {
                tracing::debug!(max_size, "pool saturated during health check");
                ("degraded", format!("all {max_size} pooled connections in use"))
            }
            Err(e) => {
                tracing::warn!(error = %e, "pool health check failed");
                ("unhealthy", e.to_string())
            }
        };
        PoolHealth {
            status,
            detail,
            in_use: pool.in_use(),
            max_size: pool.max_size(),
            references,
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::config::StorageBackendKind;
    use crate::persistence::memory::{MemoryBackend, MemoryConnector};
    use tokio_test::{assert_pending, assert_ready, task};

    fn memory_pool(max: u32) -> (ResourcePool, Arc<MemoryConnector>) {
        let connector = Arc::new(MemoryConnector::default());
        let config = DatabaseConfig {
            backend: StorageBackendKind::Memory,
            max_pool_size: max,
            connection_timeout: Duration::from_secs(60),
            ..DatabaseConfig::default()
        };
        let pool = ResourcePool::new(config, Arc::clone(&connector) as Arc<dyn BackendConnector>);
        (pool, connector)
    }

    #[tokio::test]
    async fn sixth_checkout_waits_for_a_release() {
        let (pool, _) = memory_pool(5);
        let Ok(lease) = pool.acquire().await else {
            panic!("acquire failed");
        };

        let mut handles = Vec::new();
        for _ in 0..5 {
            let Ok(handle) = lease.checkout().await else {
                panic!("checkout within max_size failed");
            };
            handles.push(handle);
        }
        assert_eq!(lease.in_use(), 5);

        let mut sixth = task::spawn(lease.checkout());
        assert_pending!(sixth.poll());

        let Some(first) = handles.pop() else {
            panic!("no handle to release");
        };
        first.release();
        assert!(sixth.is_woken());
        let handle = assert_ready!(sixth.poll());
        assert!(handle.is_ok());

        drop(handle);
        drop(sixth);
        drop(handles);
        lease.release().await;
    }

    #[tokio::test]
    async fn try_checkout_reports_exhaustion() {
        let (pool, _) = memory_pool(1);
        let Ok(lease) = pool.acquire().await else {
            panic!("acquire failed");
        };
        let Ok(_held) = lease.try_checkout() else {
            panic!("first checkout failed");
        };
        let Err(err) = lease.try_checkout() else {
            panic!("second checkout should fail");
        };
        assert!(matches!(err, InfraError::ConnectionExhausted { max_size: 1 }));
        assert!(err.is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn checkout_times_out() {
        let connector = Arc::new(MemoryConnector::default());
        let config = DatabaseConfig {
            backend: StorageBackendKind::Memory,
            max_pool_size: 1,
            connection_timeout: Duration::from_millis(250),
            ..DatabaseConfig::default()
        };
        let pool = ResourcePool::new(config, connector);
        let Ok(lease) = pool.acquire().await else {
            panic!("acquire failed");
        };
        let Ok(_held) = lease.checkout().await else {
            panic!("first checkout failed");
        };
        let Err(err) = lease.checkout().await else {
            panic!("checkout should time out");
        };
        assert!(matches!(err, InfraError::ConnectionTimeout { timeout_ms: 250 }));
    }

    #[tokio::test]
    async fn last_release_closes_backend() {
        let (pool, connector) = memory_pool(2);
        let backend = connector.backend();

        let Ok(a) = pool.acquire().await else {
            panic!("acquire failed");
        };
        let Ok(b) = pool.clone().acquire().await else {
            panic!("acquire failed");
        };
        assert_eq!(connector.connect_count(), 1);
        assert_eq!(pool.reference_count().await, 2);

        a.release().await;
        assert!(!backend.is_closed());
        b.release().await;
        assert!(backend.is_closed());
        assert!(!pool.is_open().await);
    }

    #[tokio::test]
    async fn failed_probe_is_fatal_and_leaves_pool_closed() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set_reachable(false);
        let connector = Arc::new(MemoryConnector::with_backend(Arc::clone(&backend)));
        let pool = ResourcePool::new(
            DatabaseConfig {
                backend: StorageBackendKind::Memory,
                ..DatabaseConfig::default()
            },
            connector,
        );

        let Err(err) = pool.acquire().await else {
            panic!("probe failure must abort acquire");
        };
        assert!(matches!(err, InfraError::InitializationFailure(_)));
        assert!(err.is_fatal());
        assert_eq!(pool.reference_count().await, 0);
        assert!(backend.is_closed());
    }

    #[tokio::test]
    async fn saturated_pool_reports_degraded_without_waiting() {
        let (pool, _) = memory_pool(1);
        let Ok(lease) = pool.acquire().await else {
            panic!("acquire failed");
        };
        let Ok(held) = lease.try_checkout() else {
            panic!("checkout failed");
        };

        let checked = tokio::time::timeout(Duration::from_secs(1), pool.health_check()).await;
        let Ok(health) = checked else {
            panic!("health check waited for a handle");
        };
        assert_eq!(health.status, "degraded");
        assert_eq!(health.in_use, 1);

        held.release();
        assert!(pool.health_check().await.is_healthy());
        lease.release().await;
    }

    #[tokio::test]
    async fn health_reflects_backend_state() {
        let (pool, connector) = memory_pool(3);
        assert!(!pool.health_check().await.is_healthy());

        let Ok(lease) = pool.acquire().await else {
            panic!("acquire failed");
        };
        let health = pool.health_check().await;
        assert!(health.is_healthy());
        assert_eq!(health.references, 1);
        assert_eq!(health.max_size, 3);
        assert_eq!(health.in_use, 0);

        connector.backend().set_reachable(false);
        let health = pool.health_check().await;
        assert_eq!(health.status, "unhealthy");
        lease.release().await;
    }
}
