//! Cache-aside repositories.
//!
//! Reads check the cache first, fall back to the store on a miss and
//! repopulate the cache. Writes go to the store first, then refresh the
//! cache. Cache and store are not transactionally coupled: a reader may see
//! a cached value up to its TTL after a concurrent write.

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::pool::{ConnectionPool, PooledHandle};
use crate::cache::CacheLayer;
use crate::domain::{Entity, PersistedRecord, RecordKey};
use crate::error::InfraError;

/// Typed access to one entity kind.
pub struct Repository<T: Entity> {
    pool: Arc<ConnectionPool>,
    cache: Arc<CacheLayer>,
    ttl: Option<Duration>,
    _entity: PhantomData<fn() -> T>,
}

impl<T: Entity> fmt::Debug for Repository<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Repository")
            .field("kind", &T::KIND)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl<T: Entity> Repository<T> {
    /// Creates a repository. `ttl` of `None` uses the cache default.
    #[must_use]
    pub fn new(pool: Arc<ConnectionPool>, cache: Arc<CacheLayer>, ttl: Option<Duration>) -> Self {
        Self {
            pool,
            cache,
            ttl,
            _entity: PhantomData,
        }
    }

    /// Cache key for an entity key: `"<kind>:<key>"`.
    #[must_use]
    pub fn cache_key(key: &str) -> String {
        format!("{}:{key}", T::KIND)
    }

    /// Reads one entity.
    ///
    /// Every successful read bumps the record's access bookkeeping, hit or
    /// miss, so hot records are never seen as cold by the compression sweep.
    /// A cache hit never waits for a pooled handle: when the pool is
    /// saturated the bump is deferred to a background task.
    ///
    /// # Errors
    ///
    /// Store errors on a cache miss propagate; a stored payload that no
    /// longer decodes surfaces as [`InfraError::Serialization`] or
    /// [`InfraError::Compression`].
    pub async fn get(&self, key: &str) -> Result<Option<T>, InfraError> {
        let id = RecordKey::new(T::KIND, key);
        let cache_key = Self::cache_key(key);

        if let Some(hit) = self.cache.get::<T>(&cache_key).await {
            self.record_hits(vec![id]).await;
            return Ok(Some(hit));
        }

        let handle = self.pool.checkout().await?;
        let record = handle.fetch_and_touch(&id, Utc::now()).await?;
        handle.release();
        let Some(record) = record else {
            return Ok(None);
        };
        let entity = decode::<T>(&record)?;
        self.cache.set(&cache_key, &entity, self.ttl).await;
        Ok(Some(entity))
    }

    /// Reads several entities. Missing keys are absent from the result.
    ///
    /// # Errors
    ///
    /// Same as [`Repository::get`].
    pub async fn get_many(&self, keys: &[String]) -> Result<HashMap<String, T>, InfraError> {
        let cache_keys: Vec<String> = keys.iter().map(|k| Self::cache_key(k)).collect();
        let mut cached = self.cache.get_multiple::<T>(&cache_keys).await;

        let mut found = HashMap::with_capacity(keys.len());
        let mut hits = Vec::new();
        let mut misses = Vec::new();
        for (key, cache_key) in keys.iter().zip(&cache_keys) {
            let id = RecordKey::new(T::KIND, key.as_str());
            match cached.remove(cache_key) {
                Some(hit) => {
                    found.insert(key.clone(), hit);
                    hits.push(id);
                }
                None => misses.push((key, cache_key, id)),
            }
        }
        self.record_hits(hits).await;
        if misses.is_empty() {
            return Ok(found);
        }

        let handle = self.pool.checkout().await?;
        let now = Utc::now();
        let mut refill = Vec::new();
        for (key, cache_key, id) in misses {
            if let Some(record) = handle.fetch_and_touch(&id, now).await? {
                let entity = decode::<T>(&record)?;
                refill.push((cache_key.clone(), serde_json::to_value(&entity)?));
                found.insert(key.clone(), entity);
            }
        }
        handle.release();

        if !refill.is_empty() {
            self.cache.set_multiple(&refill, self.ttl).await;
        }
        Ok(found)
    }

    /// Bumps access bookkeeping for cache hits without failing the read.
    async fn record_hits(&self, ids: Vec<RecordKey>) {
        if ids.is_empty() {
            return;
        }
        let now = Utc::now();
        match self.pool.try_checkout() {
            Ok(handle) => touch_all(handle, &ids, now).await,
            Err(InfraError::ConnectionExhausted { .. }) => {
                tracing::debug!(records = ids.len(), "pool saturated, access bookkeeping deferred");
                let pool = Arc::clone(&self.pool);
                tokio::spawn(async move {
                    match pool.checkout().await {
                        Ok(handle) => touch_all(handle, &ids, now).await,
                        Err(e) => {
                            tracing::warn!(records = ids.len(), error = %e, "deferred access bookkeeping dropped");
                        }
                    }
                });
            }
            Err(e) => {
                tracing::warn!(records = ids.len(), error = %e, "access bookkeeping skipped on cache hit");
            }
        }
    }

    /// Writes one entity, then refreshes its cache entry.
    ///
    /// # Errors
    ///
    /// Returns the store error; the cache is left untouched in that case.
    pub async fn save(&self, entity: &T) -> Result<(), InfraError> {
        let key = entity.key();
        let record = PersistedRecord::new(
            RecordKey::new(T::KIND, key.as_str()),
            serde_json::to_vec(entity)?,
        );

        let handle = self.pool.checkout().await?;
        handle.upsert(&record).await?;
        handle.release();

        self.cache.set(&Self::cache_key(&key), entity, self.ttl).await;
        Ok(())
    }

    /// Writes several entities in one transaction, then refreshes the cache.
    ///
    /// # Errors
    ///
    /// Returns the store error; no entity is written in that case.
    pub async fn save_many(&self, entities: &[T]) -> Result<(), InfraError> {
        if entities.is_empty() {
            return Ok(());
        }
        let mut records = Vec::with_capacity(entities.len());
        let mut cached = Vec::with_capacity(entities.len());
        for entity in entities {
            let key = entity.key();
            records.push(PersistedRecord::new(
                RecordKey::new(T::KIND, key.as_str()),
                serde_json::to_vec(entity)?,
            ));
            cached.push((Self::cache_key(&key), entity));
        }

        let handle = self.pool.checkout().await?;
        handle.upsert_batch(&records).await?;
        handle.release();

        self.cache.set_multiple(&cached, self.ttl).await;
        Ok(())
    }

    /// Deletes one entity from the store and the cache.
    /// Returns whether the store held it.
    ///
    /// # Errors
    ///
    /// Returns the store error.
    pub async fn delete(&self, key: &str) -> Result<bool, InfraError> {
        let handle = self.pool.checkout().await?;
        let existed = handle.delete(&RecordKey::new(T::KIND, key)).await?;
        handle.release();
        self.cache.delete(&Self::cache_key(key)).await;
        Ok(existed)
    }
}

async fn touch_all(handle: PooledHandle, ids: &[RecordKey], at: DateTime<Utc>) {
    for id in ids {
        if let Err(e) = handle.touch(id, at).await {
            tracing::warn!(record = %id, error = %e, "access bookkeeping failed on cache hit");
        }
    }
    handle.release();
}

fn decode<T: Entity>(record: &PersistedRecord) -> Result<T, InfraError> {
    let bytes = record.decoded_data()?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::cache::{CacheStore, MemoryCacheStore};
    use crate::config::CacheConfig;
    use crate::domain::UserProfile;
    use crate::persistence::memory::MemoryBackend;
    use crate::persistence::StorageBackend;

    struct Fixture {
        repo: Repository<UserProfile>,
        backend: Arc<MemoryBackend>,
        store: Arc<MemoryCacheStore>,
    }

    fn fixture() -> Fixture {
        let backend = Arc::new(MemoryBackend::new());
        let store = Arc::new(MemoryCacheStore::new());
        let pool = Arc::new(ConnectionPool::new(
            Arc::clone(&backend) as Arc<dyn StorageBackend>,
            4,
            Duration::from_secs(1),
        ));
        let cache = Arc::new(CacheLayer::new(
            Arc::clone(&store) as Arc<dyn CacheStore>,
            CacheConfig::default(),
        ));
        Fixture {
            repo: Repository::new(pool, cache, None),
            backend,
            store,
        }
    }

    fn profile(id: &str) -> UserProfile {
        UserProfile {
            user_id: id.to_string(),
            email: format!("{id}@example.com"),
            username: id.to_string(),
            is_active: true,
            preferences: serde_json::json!({"notifications": true}),
        }
    }

    #[tokio::test]
    async fn miss_reads_store_and_populates_cache() {
        let fx = fixture();
        let Ok(()) = fx.repo.save(&profile("u1")).await else {
            panic!("save failed");
        };
        fx.store.delete("profile:u1").await.ok();

        let Ok(Some(loaded)) = fx.repo.get("u1").await else {
            panic!("profile missing");
        };
        assert_eq!(loaded, profile("u1"));
        assert!(fx.store.raw("profile:u1").is_some());

        let Some(record) = fx.backend.peek(&RecordKey::new("profile", "u1")).await else {
            panic!("record missing");
        };
        assert_eq!(record.access_count, 1);
    }

    #[tokio::test]
    async fn hits_still_count_as_accesses() {
        let fx = fixture();
        let Ok(()) = fx.repo.save(&profile("u2")).await else {
            panic!("save failed");
        };
        for _ in 0..3 {
            let Ok(Some(_)) = fx.repo.get("u2").await else {
                panic!("profile missing");
            };
        }
        let Some(record) = fx.backend.peek(&RecordKey::new("profile", "u2")).await else {
            panic!("record missing");
        };
        assert_eq!(record.access_count, 3);
    }

    #[tokio::test]
    async fn hit_on_saturated_pool_returns_and_defers_bookkeeping() {
        let backend = Arc::new(MemoryBackend::new());
        let store = Arc::new(MemoryCacheStore::new());
        let pool = Arc::new(ConnectionPool::new(
            Arc::clone(&backend) as Arc<dyn StorageBackend>,
            1,
            Duration::from_secs(30),
        ));
        let cache = Arc::new(CacheLayer::new(
            Arc::clone(&store) as Arc<dyn CacheStore>,
            CacheConfig::default(),
        ));
        let repo: Repository<UserProfile> = Repository::new(Arc::clone(&pool), cache, None);
        let Ok(()) = repo.save(&profile("busy")).await else {
            panic!("save failed");
        };

        let Ok(held) = pool.try_checkout() else {
            panic!("checkout failed");
        };
        let read = tokio::time::timeout(Duration::from_secs(1), repo.get("busy")).await;
        let Ok(Ok(Some(loaded))) = read else {
            panic!("cache hit waited on the saturated pool");
        };
        assert_eq!(loaded.user_id, "busy");
        let id = RecordKey::new("profile", "busy");
        assert_eq!(backend.peek(&id).await.map(|r| r.access_count), Some(0));

        held.release();
        let mut counted = 0;
        for _ in 0..50 {
            counted = backend.peek(&id).await.map_or(0, |r| r.access_count);
            if counted == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(counted, 1);
    }

    #[tokio::test]
    async fn cache_outage_falls_back_to_store() {
        let fx = fixture();
        let Ok(()) = fx.repo.save(&profile("u3")).await else {
            panic!("save failed");
        };
        fx.store.set_reachable(false);
        let Ok(Some(loaded)) = fx.repo.get("u3").await else {
            panic!("store fallback failed");
        };
        assert_eq!(loaded.user_id, "u3");
    }

    #[tokio::test]
    async fn compressed_record_reads_transparently() {
        let fx = fixture();
        let Ok(()) = fx.repo.save(&profile("u4")).await else {
            panic!("save failed");
        };
        let id = RecordKey::new("profile", "u4");
        let Some(mut record) = fx.backend.peek(&id).await else {
            panic!("record missing");
        };
        let Some(packed) = record.compressed_payload() else {
            panic!("already compressed");
        };
        record.data = packed;
        record.compressed = true;
        fx.backend.insert_raw(record).await;
        fx.store.delete("profile:u4").await.ok();

        let Ok(Some(loaded)) = fx.repo.get("u4").await else {
            panic!("profile missing");
        };
        assert_eq!(loaded, profile("u4"));
    }

    #[tokio::test]
    async fn batch_save_and_get() {
        let fx = fixture();
        let profiles = vec![profile("a"), profile("b"), profile("c")];
        let Ok(()) = fx.repo.save_many(&profiles).await else {
            panic!("batch save failed");
        };
        fx.store.delete("profile:b").await.ok();

        let keys = vec!["a".to_string(), "b".to_string(), "zzz".to_string()];
        let Ok(found) = fx.repo.get_many(&keys).await else {
            panic!("batch get failed");
        };
        assert_eq!(found.len(), 2);
        assert_eq!(found.get("b"), Some(&profile("b")));
        assert!(fx.store.raw("profile:b").is_some());
    }

    #[tokio::test]
    async fn delete_clears_store_and_cache() {
        let fx = fixture();
        let Ok(()) = fx.repo.save(&profile("gone")).await else {
            panic!("save failed");
        };
        assert_eq!(fx.repo.delete("gone").await.ok(), Some(true));
        assert!(fx.store.raw("profile:gone").is_none());
        assert!(matches!(fx.repo.get("gone").await, Ok(None)));
        assert_eq!(fx.repo.delete("gone").await.ok(), Some(false));
    }
}
