//! Cache service abstraction.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use super::memory::MemoryCacheStore;
use super::redis_store::RedisCacheStore;
use crate::config::{CacheBackendKind, CacheConfig};
use crate::error::InfraError;

/// Memory statistics reported by the cache service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemoryUsage {
    /// Bytes currently used.
    pub used_bytes: u64,
    /// Configured limit; `0` means unlimited.
    pub max_bytes: u64,
}

impl MemoryUsage {
    /// used/max ratio, or `None` when no limit is configured.
    #[must_use]
    pub fn ratio(&self) -> Option<f64> {
        if self.max_bytes == 0 {
            return None;
        }
        #[allow(clippy::cast_precision_loss)]
        let ratio = self.used_bytes as f64 / self.max_bytes as f64;
        Some(ratio)
    }
}

/// Commands the cache layer issues against a key-value cache service.
///
/// Implementations report failures as [`InfraError::CacheUnavailable`];
/// the layer above turns those into misses and no-ops.
#[async_trait]
pub trait CacheStore: Send + Sync + fmt::Debug {
    /// Store name for logs.
    fn name(&self) -> &'static str;

    /// `GET key`.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, InfraError>;

    /// `SETEX key ttl value`.
    async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), InfraError>;

    /// `DEL key`. Returns whether the key existed.
    async fn delete(&self, key: &str) -> Result<bool, InfraError>;

    /// `MGET keys...`, one slot per requested key.
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, InfraError>;

    /// `MSET pairs...` with the same TTL on every key, applied atomically.
    async fn set_many(&self, entries: &[(String, Vec<u8>)], ttl: Duration)
    -> Result<(), InfraError>;

    /// `CONFIG SET maxmemory` and `maxmemory-policy`.
    async fn configure(&self, max_memory_bytes: u64, policy: &str) -> Result<(), InfraError>;

    /// `INFO memory`.
    async fn memory_usage(&self) -> Result<MemoryUsage, InfraError>;

    /// `PING`.
    async fn ping(&self) -> Result<(), InfraError>;
}

/// Builds the store named in `config`. Does not connect.
///
/// # Errors
///
/// Returns [`InfraError::Configuration`] if the Redis URL is malformed.
pub fn open_store(config: &CacheConfig) -> Result<Arc<dyn CacheStore>, InfraError> {
    let store: Arc<dyn CacheStore> = match config.backend {
        CacheBackendKind::Redis => Arc::new(RedisCacheStore::open(&config.redis_url)?),
        CacheBackendKind::Memory => Arc::new(MemoryCacheStore::new()),
    };
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_memory_has_no_ratio() {
        let usage = MemoryUsage {
            used_bytes: 10,
            max_bytes: 0,
        };
        assert!(usage.ratio().is_none());
    }

    #[test]
    fn ratio_is_used_over_max() {
        let usage = MemoryUsage {
            used_bytes: 850,
            max_bytes: 1_000,
        };
        assert_eq!(usage.ratio(), Some(0.85));
    }
}
