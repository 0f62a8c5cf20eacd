//! In-process cache store.
//!
//! Behaves like a single Redis node for the commands the layer uses:
//! per-key TTLs, a byte budget and an LRU eviction policy. Expiry uses
//! `tokio::time::Instant`, so paused-clock tests can fast-forward TTLs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use tokio::time::Instant;

use super::store::{CacheStore, MemoryUsage};
use crate::error::InfraError;

/// Eviction behaviour once the byte budget is exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    /// Evict the least recently used key.
    AllKeysLru,
    /// Evict the least recently used key that has a TTL. Every key written
    /// through this store has one, so this matches `AllKeysLru`.
    VolatileLru,
    /// Reject writes that would exceed the budget.
    NoEviction,
}

impl EvictionPolicy {
    /// Parses a Redis `maxmemory-policy` name.
    ///
    /// # Errors
    ///
    /// Returns [`InfraError::Configuration`] for unsupported policies.
    pub fn parse(raw: &str) -> Result<Self, InfraError> {
        match raw {
            "allkeys-lru" | "allkeys-lfu" | "allkeys-random" => Ok(Self::AllKeysLru),
            "volatile-lru" | "volatile-lfu" | "volatile-random" | "volatile-ttl" => {
                Ok(Self::VolatileLru)
            }
            "noeviction" => Ok(Self::NoEviction),
            other => Err(InfraError::Configuration(format!(
                "unsupported eviction policy `{other}`"
            ))),
        }
    }
}

#[derive(Debug)]
struct Stored {
    bytes: Vec<u8>,
    expires_at: Instant,
}

#[derive(Debug)]
struct Inner {
    entries: LruCache<String, Stored>,
    used_bytes: u64,
    max_bytes: u64,
    policy: EvictionPolicy,
}

fn footprint(key: &str, value: &[u8]) -> u64 {
    u64::try_from(key.len().saturating_add(value.len())).unwrap_or(u64::MAX)
}

impl Inner {
    fn remove(&mut self, key: &str) -> bool {
        match self.entries.pop(key) {
            Some(stored) => {
                self.used_bytes = self
                    .used_bytes
                    .saturating_sub(footprint(key, &stored.bytes));
                true
            }
            None => false,
        }
    }

    fn live(&mut self, key: &str, now: Instant) -> Option<Vec<u8>> {
        let expired = match self.entries.get(key) {
            Some(stored) if stored.expires_at > now => return Some(stored.bytes.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.remove(key);
        }
        None
    }

    fn insert(&mut self, key: &str, value: &[u8], ttl: Duration) -> Result<(), InfraError> {
        let size = footprint(key, value);
        self.remove(key);
        if self.max_bytes > 0
            && self.policy == EvictionPolicy::NoEviction
            && self.used_bytes.saturating_add(size) > self.max_bytes
        {
            return Err(InfraError::CacheUnavailable(
                "OOM command not allowed when used memory > 'maxmemory'".to_string(),
            ));
        }
        self.entries.put(
            key.to_string(),
            Stored {
                bytes: value.to_vec(),
                expires_at: Instant::now() + ttl,
            },
        );
        self.used_bytes = self.used_bytes.saturating_add(size);
        self.evict();
        Ok(())
    }

    fn evict(&mut self) {
        if self.max_bytes == 0 || self.policy == EvictionPolicy::NoEviction {
            return;
        }
        while self.used_bytes > self.max_bytes {
            let Some((key, stored)) = self.entries.pop_lru() else {
                break;
            };
            self.used_bytes = self
                .used_bytes
                .saturating_sub(footprint(&key, &stored.bytes));
            tracing::debug!(%key, "memory cache evicted key");
        }
    }
}

/// LRU-evicting in-process cache store.
#[derive(Debug)]
pub struct MemoryCacheStore {
    inner: Mutex<Inner>,
    reachable: AtomicBool,
}

impl Default for MemoryCacheStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCacheStore {
    /// Creates an empty store with no memory limit.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::unbounded(),
                used_bytes: 0,
                max_bytes: 0,
                policy: EvictionPolicy::AllKeysLru,
            }),
            reachable: AtomicBool::new(true),
        }
    }

    /// Simulates an outage (`false`) or recovery (`true`).
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Returns the stored bytes for `key` without touching recency.
    #[must_use]
    pub fn raw(&self, key: &str) -> Option<Vec<u8>> {
        self.lock().entries.peek(key).map(|stored| stored.bytes.clone())
    }

    /// Number of stored keys, expired ones included until next access.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Returns `true` if no key is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_reachable(&self) -> Result<(), InfraError> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(InfraError::CacheUnavailable(
                "memory cache marked unreachable".to_string(),
            ))
        }
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, InfraError> {
        self.ensure_reachable()?;
        Ok(self.lock().live(key, Instant::now()))
    }

    async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), InfraError> {
        self.ensure_reachable()?;
        self.lock().insert(key, value, ttl)
    }

    async fn delete(&self, key: &str) -> Result<bool, InfraError> {
        self.ensure_reachable()?;
        Ok(self.lock().remove(key))
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, InfraError> {
        self.ensure_reachable()?;
        let now = Instant::now();
        let mut inner = self.lock();
        Ok(keys.iter().map(|key| inner.live(key, now)).collect())
    }

    async fn set_many(
        &self,
        entries: &[(String, Vec<u8>)],
        ttl: Duration,
    ) -> Result<(), InfraError> {
        self.ensure_reachable()?;
        let mut inner = self.lock();
        for (key, value) in entries {
            inner.insert(key, value, ttl)?;
        }
        Ok(())
    }

    async fn configure(&self, max_memory_bytes: u64, policy: &str) -> Result<(), InfraError> {
        self.ensure_reachable()?;
        let policy = EvictionPolicy::parse(policy)?;
        let mut inner = self.lock();
        inner.max_bytes = max_memory_bytes;
        inner.policy = policy;
        inner.evict();
        Ok(())
    }

    async fn memory_usage(&self) -> Result<MemoryUsage, InfraError> {
        self.ensure_reachable()?;
        let inner = self.lock();
        Ok(MemoryUsage {
            used_bytes: inner.used_bytes,
            max_bytes: inner.max_bytes,
        })
    }

    async fn ping(&self) -> Result<(), InfraError> {
        self.ensure_reachable()
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let store = MemoryCacheStore::new();
        let Ok(()) = store.set_ex("k", b"v", Duration::from_secs(5)).await else {
            panic!("set failed");
        };
        assert_eq!(store.get("k").await.ok().flatten(), Some(b"v".to_vec()));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(store.get("k").await.ok().flatten(), None);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn lru_key_is_evicted_over_budget() {
        let store = MemoryCacheStore::new();
        let Ok(()) = store.configure(25, "allkeys-lru").await else {
            panic!("configure failed");
        };
        let ttl = Duration::from_secs(60);
        let _ = store.set_ex("a", &[0; 9], ttl).await;
        let _ = store.set_ex("b", &[0; 9], ttl).await;
        // Touch `a` so `b` becomes least recently used.
        let _ = store.get("a").await;
        let _ = store.set_ex("c", &[0; 9], ttl).await;

        assert!(store.raw("a").is_some());
        assert!(store.raw("b").is_none());
        assert!(store.raw("c").is_some());
        let Ok(usage) = store.memory_usage().await else {
            panic!("usage failed");
        };
        assert_eq!(usage.used_bytes, 20);
    }

    #[tokio::test]
    async fn noeviction_rejects_writes_over_budget() {
        let store = MemoryCacheStore::new();
        let _ = store.configure(10, "noeviction").await;
        assert!(store.set_ex("a", &[0; 5], Duration::from_secs(1)).await.is_ok());
        assert!(store.set_ex("b", &[0; 5], Duration::from_secs(1)).await.is_err());
    }

    #[tokio::test]
    async fn unknown_policy_is_a_configuration_error() {
        let store = MemoryCacheStore::new();
        let Err(err) = store.configure(0, "lottery").await else {
            panic!("policy should be rejected");
        };
        assert!(matches!(err, InfraError::Configuration(_)));
    }

    #[tokio::test]
    async fn outage_fails_every_command() {
        let store = MemoryCacheStore::new();
        store.set_reachable(false);
        assert!(store.get("k").await.is_err());
        assert!(store.ping().await.is_err());
    }
}
