//! Cache layer over an external key-value cache service.
//!
//! [`CacheLayer`] is what the rest of the crate talks to. It serializes
//! values, compresses large ones inside a [`CacheEnvelope`], absorbs store
//! outages and watches the service's memory usage. The [`CacheStore`]
//! trait hides whether Redis or the in-process store sits underneath.

pub mod envelope;
pub mod layer;
pub mod memory;
pub mod redis_store;
pub mod store;

pub use envelope::{CacheEnvelope, Encoding};
pub use layer::{AlertCallback, CacheLayer, CacheStats, MemoryAlert};
pub use memory::{EvictionPolicy, MemoryCacheStore};
pub use redis_store::RedisCacheStore;
pub use store::{CacheStore, MemoryUsage, open_store};
