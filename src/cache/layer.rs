//! Fail-open cache layer with transparent compression and memory monitoring.
//!
//! Values are serialized to JSON, sealed in a [`CacheEnvelope`] and handed
//! to a [`CacheStore`]. Every store failure is logged and turned into a
//! miss or a no-op: callers treat the cache as best-effort and fall back to
//! the source of truth.

use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::envelope::CacheEnvelope;
use super::store::{CacheStore, open_store};
use crate::config::CacheConfig;
use crate::error::InfraError;

/// Payload handed to memory alert callbacks.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryAlert {
    /// When the poll ran.
    pub timestamp: DateTime<Utc>,
    /// used/max as a percentage.
    pub usage_percent: f64,
    /// Bytes used by the cache service.
    pub used_bytes: u64,
    /// Configured limit.
    pub max_bytes: u64,
}

/// Callback invoked when memory usage crosses the alert threshold.
pub type AlertCallback = Arc<dyn Fn(&MemoryAlert) -> anyhow::Result<()> + Send + Sync>;

/// Snapshot of the layer's counters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CacheStats {
    /// Reads answered from the cache.
    pub hits: u64,
    /// Reads that found nothing (or hit an outage).
    pub misses: u64,
    /// Successful writes.
    pub sets: u64,
    /// Successful deletes.
    pub deletes: u64,
    /// Store failures absorbed by the layer.
    pub errors: u64,
    /// hits / (hits + misses), `0.0` before the first read.
    pub hit_rate: f64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    errors: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    fn snapshot(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let reads = hits.saturating_add(misses);
        #[allow(clippy::cast_precision_loss)]
        let hit_rate = if reads == 0 {
            0.0
        } else {
            hits as f64 / reads as f64
        };
        CacheStats {
            hits,
            misses,
            sets: self.sets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            hit_rate,
        }
    }
}

/// Client-side cache facade.
pub struct CacheLayer {
    store: Arc<dyn CacheStore>,
    config: CacheConfig,
    counters: Counters,
    callbacks: RwLock<Vec<AlertCallback>>,
    monitor: Mutex<Option<CancellationToken>>,
}

impl fmt::Debug for CacheLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheLayer")
            .field("store", &self.store.name())
            .field("compression_threshold", &self.config.compression_threshold)
            .field("stats", &self.counters.snapshot())
            .finish_non_exhaustive()
    }
}

impl CacheLayer {
    /// Wraps an existing store.
    #[must_use]
    pub fn new(store: Arc<dyn CacheStore>, config: CacheConfig) -> Self {
        Self {
            store,
            config,
            counters: Counters::default(),
            callbacks: RwLock::new(Vec::new()),
            monitor: Mutex::new(None),
        }
    }

    /// Builds the store named in `config`. Does not connect.
    ///
    /// # Errors
    ///
    /// Returns [`InfraError::Configuration`] if the Redis URL is malformed.
    pub fn from_config(config: CacheConfig) -> Result<Self, InfraError> {
        let store = open_store(&config)?;
        Ok(Self::new(store, config))
    }

    /// Pushes the memory limit and eviction policy to the cache service.
    ///
    /// Returns `false` if the service could not be configured; the layer
    /// still works, with whatever policy the service already has.
    pub async fn initialize(&self) -> bool {
        match self
            .store
            .configure(self.config.max_memory_bytes, &self.config.eviction_policy)
            .await
        {
            Ok(()) => {
                tracing::info!(
                    store = self.store.name(),
                    max_memory_bytes = self.config.max_memory_bytes,
                    policy = %self.config.eviction_policy,
                    "cache configured"
                );
                true
            }
            Err(e) => {
                self.absorb("configure", &e);
                false
            }
        }
    }

    /// Returns the configured default TTL.
    #[must_use]
    pub fn default_ttl(&self) -> Duration {
        self.config.default_ttl
    }

    /// Returns the underlying store.
    #[must_use]
    pub fn store(&self) -> Arc<dyn CacheStore> {
        Arc::clone(&self.store)
    }

    /// Reads and decodes `key`. Outages and undecodable values are misses.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = match self.store.get(key).await {
            Ok(raw) => raw,
            Err(e) => {
                self.absorb("get", &e);
                None
            }
        };
        let value = raw.and_then(|bytes| self.decode(key, &bytes));
        self.count_read(value.is_some());
        value
    }

    /// Serializes and stores `value`. `None` uses the default TTL.
    ///
    /// Returns whether the write reached the cache.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> bool {
        let Some(bytes) = self.encode(key, value) else {
            return false;
        };
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        match self.store.set_ex(key, &bytes, ttl).await {
            Ok(()) => {
                Counters::bump(&self.counters.sets, 1);
                true
            }
            Err(e) => {
                self.absorb("set", &e);
                false
            }
        }
    }

    /// Removes `key`. Returns whether a value was removed.
    pub async fn delete(&self, key: &str) -> bool {
        match self.store.delete(key).await {
            Ok(removed) => {
                Counters::bump(&self.counters.deletes, 1);
                removed
            }
            Err(e) => {
                self.absorb("delete", &e);
                false
            }
        }
    }

    /// Reads several keys at once. Only hits appear in the result.
    pub async fn get_multiple<T: DeserializeOwned>(&self, keys: &[String]) -> HashMap<String, T> {
        if keys.is_empty() {
            return HashMap::new();
        }
        let raw = match self.store.get_many(keys).await {
            Ok(raw) => raw,
            Err(e) => {
                self.absorb("get_multiple", &e);
                vec![None; keys.len()]
            }
        };
        let mut found = HashMap::with_capacity(keys.len());
        for (key, bytes) in keys.iter().zip(raw) {
            let value = bytes.and_then(|bytes| self.decode(key, &bytes));
            self.count_read(value.is_some());
            if let Some(value) = value {
                found.insert(key.clone(), value);
            }
        }
        found
    }

    /// Stores several values with one TTL. Returns whether the batch landed.
    pub async fn set_multiple<T: Serialize>(
        &self,
        entries: &[(String, T)],
        ttl: Option<Duration>,
    ) -> bool {
        let mut encoded = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            let Some(bytes) = self.encode(key, value) else {
                return false;
            };
            encoded.push((key.clone(), bytes));
        }
        if encoded.is_empty() {
            return true;
        }
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        match self.store.set_many(&encoded, ttl).await {
            Ok(()) => {
                Counters::bump(
                    &self.counters.sets,
                    u64::try_from(encoded.len()).unwrap_or(u64::MAX),
                );
                true
            }
            Err(e) => {
                self.absorb("set_multiple", &e);
                false
            }
        }
    }

    /// Returns `true` if the cache service answers.
    pub async fn ping(&self) -> bool {
        self.store.ping().await.is_ok()
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.counters.snapshot()
    }

    /// Registers a memory alert callback.
    pub fn on_memory_alert(&self, callback: AlertCallback) {
        self.callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback);
    }

    /// Polls memory usage once and fires callbacks if the alert threshold
    /// is crossed. Returns the alert that fired, if any.
    pub async fn check_memory(&self) -> Option<MemoryAlert> {
        let usage = match self.store.memory_usage().await {
            Ok(usage) => usage,
            Err(e) => {
                self.absorb("memory_usage", &e);
                return None;
            }
        };
        let ratio = usage.ratio()?;
        if ratio < self.config.memory_alert_threshold {
            return None;
        }
        let alert = MemoryAlert {
            timestamp: Utc::now(),
            usage_percent: ratio * 100.0,
            used_bytes: usage.used_bytes,
            max_bytes: usage.max_bytes,
        };
        tracing::warn!(
            usage_percent = alert.usage_percent,
            used_bytes = alert.used_bytes,
            max_bytes = alert.max_bytes,
            "cache memory usage above alert threshold"
        );
        let callbacks = self
            .callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for callback in callbacks {
            match std::panic::catch_unwind(AssertUnwindSafe(|| callback(&alert))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(error = %e, "memory alert callback failed"),
                Err(_) => tracing::error!("memory alert callback panicked"),
            }
        }
        Some(alert)
    }

    /// Starts polling memory usage every `memory_check_interval`.
    /// Calling it again while a monitor runs is a no-op.
    pub fn start_monitor(self: &Arc<Self>) {
        let mut slot = self.monitor.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return;
        }
        let token = CancellationToken::new();
        *slot = Some(token.clone());
        drop(slot);

        let layer = Arc::downgrade(self);
        let period = self.config.memory_check_interval.max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(layer) = layer.upgrade() else {
                            break;
                        };
                        layer.check_memory().await;
                    }
                }
            }
            tracing::debug!("cache memory monitor stopped");
        });
        let interval_ms = u64::try_from(period.as_millis()).unwrap_or(u64::MAX);
        tracing::info!(interval_ms, "cache memory monitor started");
    }

    /// Stops the memory monitor, if running.
    pub fn stop_monitor(&self) {
        let token = self
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(token) = token {
            token.cancel();
        }
    }

    /// Returns `true` while the memory monitor runs.
    #[must_use]
    pub fn is_monitoring(&self) -> bool {
        self.monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn encode<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Option<Vec<u8>> {
        match serde_json::to_vec(value) {
            Ok(serialized) => Some(
                CacheEnvelope::seal(serialized, self.config.compression_threshold).to_bytes(),
            ),
            Err(e) => {
                tracing::warn!(%key, error = %e, "cache value not serializable");
                Counters::bump(&self.counters.errors, 1);
                None
            }
        }
    }

    fn decode<T: DeserializeOwned>(&self, key: &str, bytes: &[u8]) -> Option<T> {
        let decoded = CacheEnvelope::from_bytes(bytes)
            .and_then(CacheEnvelope::open)
            .and_then(|serialized| serde_json::from_slice(&serialized).map_err(InfraError::from));
        match decoded {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(%key, error = %e, "discarding undecodable cache value");
                Counters::bump(&self.counters.errors, 1);
                None
            }
        }
    }

    fn count_read(&self, hit: bool) {
        if hit {
            Counters::bump(&self.counters.hits, 1);
        } else {
            Counters::bump(&self.counters.misses, 1);
        }
    }

    fn absorb(&self, operation: &'static str, err: &InfraError) {
        Counters::bump(&self.counters.errors, 1);
        tracing::warn!(
            store = self.store.name(),
            operation,
            error = %err,
            "cache unavailable, continuing without it"
        );
    }
}

impl Drop for CacheLayer {
    fn drop(&mut self) {
        self.stop_monitor();
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::cache::MemoryCacheStore;
    use std::sync::atomic::AtomicUsize;

    fn memory_layer(config: CacheConfig) -> (Arc<CacheLayer>, Arc<MemoryCacheStore>) {
        let store = Arc::new(MemoryCacheStore::new());
        let layer = Arc::new(CacheLayer::new(
            Arc::clone(&store) as Arc<dyn CacheStore>,
            config,
        ));
        (layer, store)
    }

    fn stored_compressed(store: &MemoryCacheStore, key: &str) -> bool {
        let Some(raw) = store.raw(key) else {
            panic!("{key} not stored");
        };
        let Ok(envelope) = CacheEnvelope::from_bytes(&raw) else {
            panic!("{key} has no envelope");
        };
        envelope.is_compressed()
    }

    #[tokio::test]
    async fn compression_threshold_boundary() {
        let (layer, store) = memory_layer(CacheConfig {
            compression_threshold: 10_000,
            ..CacheConfig::default()
        });
        // JSON strings serialize with two quote bytes.
        let small = "a".repeat(9_997);
        let large = "a".repeat(9_999);
        assert_eq!(serde_json::to_vec(&small).map(|v| v.len()).ok(), Some(9_999));
        assert_eq!(serde_json::to_vec(&large).map(|v| v.len()).ok(), Some(10_001));

        assert!(layer.set("small", &small, None).await);
        assert!(layer.set("large", &large, None).await);
        assert!(!stored_compressed(&store, "small"));
        assert!(stored_compressed(&store, "large"));

        assert_eq!(layer.get::<String>("small").await, Some(small));
        assert_eq!(layer.get::<String>("large").await, Some(large));
    }

    #[tokio::test(start_paused = true)]
    async fn value_expires_after_ttl() {
        let (layer, _) = memory_layer(CacheConfig::default());
        let value = serde_json::json!({"score": 0.72, "findings": ["unverified claims"]});
        assert!(layer.set("result:c1", &value, Some(Duration::from_secs(30))).await);
        assert_eq!(layer.get::<serde_json::Value>("result:c1").await, Some(value));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(layer.get::<serde_json::Value>("result:c1").await, None);
    }

    #[tokio::test]
    async fn outage_degrades_to_misses() {
        let (layer, store) = memory_layer(CacheConfig::default());
        assert!(layer.set("k", &1_u32, None).await);
        store.set_reachable(false);

        assert_eq!(layer.get::<u32>("k").await, None);
        assert!(!layer.set("k", &2_u32, None).await);
        assert!(!layer.delete("k").await);
        assert!(layer.get_multiple::<u32>(&["k".to_string()]).await.is_empty());
        assert!(!layer.ping().await);

        let stats = layer.stats();
        assert_eq!(stats.misses, 2);
        assert!(stats.errors >= 4);
    }

    #[tokio::test]
    async fn batch_reads_return_only_hits() {
        let (layer, _) = memory_layer(CacheConfig::default());
        let entries = vec![("a".to_string(), 1_u32), ("b".to_string(), 2_u32)];
        assert!(layer.set_multiple(&entries, None).await);

        let keys = vec!["a".to_string(), "missing".to_string(), "b".to_string()];
        let found = layer.get_multiple::<u32>(&keys).await;
        assert_eq!(found.len(), 2);
        assert_eq!(found.get("b"), Some(&2));

        let stats = layer.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.sets, 2);
    }

    #[tokio::test]
    async fn alert_fires_above_threshold_and_survives_bad_callbacks() {
        let (layer, _) = memory_layer(CacheConfig {
            max_memory_bytes: 1_000,
            memory_alert_threshold: 0.5,
            ..CacheConfig::default()
        });
        assert!(layer.initialize().await);
        assert!(layer.check_memory().await.is_none());

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        layer.on_memory_alert(Arc::new(|_: &MemoryAlert| -> anyhow::Result<()> {
            anyhow::bail!("pager offline")
        }));
        layer.on_memory_alert(Arc::new(|_: &MemoryAlert| -> anyhow::Result<()> {
            panic!("callback bug")
        }));
        layer.on_memory_alert(Arc::new(move |alert: &MemoryAlert| -> anyhow::Result<()> {
            assert!(alert.usage_percent >= 50.0);
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        assert!(layer.set("big", &"x".repeat(600), None).await);
        let Some(alert) = layer.check_memory().await else {
            panic!("alert should fire");
        };
        assert_eq!(alert.max_bytes, 1_000);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_polls_until_stopped() {
        let (layer, _) = memory_layer(CacheConfig {
            max_memory_bytes: 100,
            memory_alert_threshold: 0.1,
            memory_check_interval: Duration::from_secs(60),
            ..CacheConfig::default()
        });
        let _ = layer.initialize().await;
        assert!(layer.set("k", &"y".repeat(20), None).await);

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        layer.on_memory_alert(Arc::new(move |_: &MemoryAlert| -> anyhow::Result<()> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        layer.start_monitor();
        assert!(layer.is_monitoring());
        for _ in 0..3 {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        tokio::task::yield_now().await;
        let polls = fired.load(Ordering::SeqCst);
        assert!(polls >= 2, "expected at least two polls, got {polls}");

        layer.stop_monitor();
        assert!(!layer.is_monitoring());
        tokio::time::sleep(Duration::from_secs(300)).await;
        let after = fired.load(Ordering::SeqCst);
        assert!(after <= polls + 1);
    }
}
