//! # veritas-infra
//!
//! Resource lifecycle, caching, worker offload and signed audit
//! infrastructure for the Veritas content verification service.
//!
//! The content scoring itself is a pluggable [`worker::Analyzer`]; this
//! crate is everything around it.
//!
//! ## Architecture
//!
//! ```text
//! AppState (composition root)
//!     │
//!     ├── VerificationService (service/)
//!     │       ├── WorkerPool<Analyzer> (worker/)
//!     │       └── AuditTrail (audit/)
//!     │
//!     └── PersistenceCoordinator (persistence/, ref-counted)
//!             ├── ResourcePool ── StorageBackend (PostgreSQL | memory)
//!             ├── CacheLayer (cache/) ── CacheStore (Redis | memory)
//!             ├── Repository<UserProfile>, Repository<VerificationRecord>
//!             └── compression + backup sweeps ──► EventBus (domain/)
//! ```
//!
//! Shared resources follow one discipline, implemented once in
//! [`lifecycle`]: the first acquire builds, every acquire returns a scoped
//! lease, the last release tears down.

pub mod app_state;
pub mod audit;
pub mod cache;
pub mod compression;
pub mod config;
pub mod domain;
pub mod error;
pub mod lifecycle;
pub mod persistence;
pub mod service;
pub mod worker;
