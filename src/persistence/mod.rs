//! Persistence layer: storage backends, the shared connection pool,
//! cache-aside repositories, background maintenance and the coordinator
//! that ties them together.
//!
//! Everything above this module depends only on the [`StorageBackend`]
//! trait; the concrete backend (PostgreSQL or in-memory) is chosen once at
//! startup through a [`BackendConnector`].

pub mod backend;
pub mod coordinator;
pub mod maintenance;
pub mod memory;
pub mod models;
pub mod pool;
pub mod postgres;
pub mod repository;

pub use backend::{BackendConnector, StorageBackend, connector_for};
pub use coordinator::{
    AccessStatistics, BackupReport, CoordinatorHealth, CoordinatorLease, PersistenceCoordinator,
    PersistenceServices, SweepStatus,
};
pub use maintenance::{CompressionPolicy, CompressionReport};
pub use memory::{MemoryBackend, MemoryConnector};
pub use models::{BackupInfo, KindStatistics, StorageStatistics};
pub use pool::{ConnectionPool, PoolHealth, PoolLease, PooledHandle, ResourcePool};
pub use postgres::{PostgresBackend, PostgresConnector};
pub use repository::Repository;
