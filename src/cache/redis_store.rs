//! Redis-backed cache store.
//!
//! The connection is established lazily and re-established after failures,
//! so an unreachable Redis never blocks startup; commands simply report
//! [`InfraError::CacheUnavailable`] until it comes back.

use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tokio::sync::Mutex;

use super::store::{CacheStore, MemoryUsage};
use crate::error::InfraError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Cache store speaking RESP to a Redis-compatible service.
pub struct RedisCacheStore {
    client: redis::Client,
    manager: Mutex<Option<ConnectionManager>>,
}

impl std::fmt::Debug for RedisCacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCacheStore")
            .field("addr", &self.client.get_connection_info().addr)
            .finish_non_exhaustive()
    }
}

impl RedisCacheStore {
    /// Parses `url` without connecting.
    ///
    /// # Errors
    ///
    /// Returns [`InfraError::Configuration`] if the URL is malformed.
    pub fn open(url: &str) -> Result<Self, InfraError> {
        let client = redis::Client::open(url)
            .map_err(|e| InfraError::Configuration(format!("invalid REDIS_URL: {e}")))?;
        Ok(Self {
            client,
            manager: Mutex::new(None),
        })
    }

    async fn connection(&self) -> Result<ConnectionManager, InfraError> {
        let mut slot = self.manager.lock().await;
        if let Some(manager) = slot.as_ref() {
            return Ok(manager.clone());
        }
        let connecting = ConnectionManager::new(self.client.clone());
        let manager = tokio::time::timeout(CONNECT_TIMEOUT, connecting)
            .await
            .map_err(|_| InfraError::CacheUnavailable("redis connect timed out".to_string()))??;
        tracing::info!(addr = %self.client.get_connection_info().addr, "redis connected");
        *slot = Some(manager.clone());
        Ok(manager)
    }

    async fn forget_on_io_error(&self, err: &redis::RedisError) {
        if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
            *self.manager.lock().await = None;
        }
    }

    async fn run<T, F, Fut>(&self, op: F) -> Result<T, InfraError>
    where
        F: FnOnce(ConnectionManager) -> Fut + Send,
        Fut: std::future::Future<Output = redis::RedisResult<T>> + Send,
        T: Send,
    {
        let conn = self.connection().await?;
        match op(conn).await {
            Ok(value) => Ok(value),
            Err(e) => {
                self.forget_on_io_error(&e).await;
                Err(e.into())
            }
        }
    }
}

fn ttl_seconds(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

/// Extracts `used_memory` and `maxmemory` from an `INFO memory` reply.
fn parse_memory_info(info: &str) -> MemoryUsage {
    let mut usage = MemoryUsage {
        used_bytes: 0,
        max_bytes: 0,
    };
    for line in info.lines() {
        let Some((field, value)) = line.trim().split_once(':') else {
            continue;
        };
        match field {
            "used_memory" => usage.used_bytes = value.parse().unwrap_or(0),
            "maxmemory" => usage.max_bytes = value.parse().unwrap_or(0),
            _ => {}
        }
    }
    usage
}

#[async_trait]
impl CacheStore for RedisCacheStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, InfraError> {
        self.run(|mut conn| async move { conn.get(key).await })
            .await
    }

    async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), InfraError> {
        self.run(|mut conn| async move { conn.set_ex(key, value, ttl_seconds(ttl)).await })
            .await
    }

    async fn delete(&self, key: &str) -> Result<bool, InfraError> {
        let removed: u64 = self
            .run(|mut conn| async move { conn.del(key).await })
            .await?;
        Ok(removed > 0)
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, InfraError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut mget = redis::cmd("MGET");
        for key in keys {
            mget.arg(key);
        }
        self.run(|mut conn| async move { mget.query_async(&mut conn).await })
            .await
    }

    async fn set_many(
        &self,
        entries: &[(String, Vec<u8>)],
        ttl: Duration,
    ) -> Result<(), InfraError> {
        if entries.is_empty() {
            return Ok(());
        }
        let seconds = ttl_seconds(ttl);
        let mut pipe = redis::pipe();
        pipe.atomic().cmd("MSET");
        for (key, value) in entries {
            pipe.arg(key).arg(value);
        }
        pipe.ignore();
        for (key, _) in entries {
            pipe.cmd("EXPIRE").arg(key).arg(seconds).ignore();
        }
        self.run(|mut conn| async move { pipe.query_async(&mut conn).await })
            .await
    }

    async fn configure(&self, max_memory_bytes: u64, policy: &str) -> Result<(), InfraError> {
        self.run(|mut conn| async move {
            let () = redis::cmd("CONFIG")
                .arg("SET")
                .arg("maxmemory")
                .arg(max_memory_bytes)
                .query_async(&mut conn)
                .await?;
            redis::cmd("CONFIG")
                .arg("SET")
                .arg("maxmemory-policy")
                .arg(policy)
                .query_async(&mut conn)
                .await
        })
        .await
    }

    async fn memory_usage(&self) -> Result<MemoryUsage, InfraError> {
        let info: String = self
            .run(|mut conn| async move {
                redis::cmd("INFO").arg("memory").query_async(&mut conn).await
            })
            .await?;
        Ok(parse_memory_info(&info))
    }

    async fn ping(&self) -> Result<(), InfraError> {
        let _pong: String = self
            .run(|mut conn| async move { redis::cmd("PING").query_async(&mut conn).await })
            .await?;
        Ok(())
    }
}
