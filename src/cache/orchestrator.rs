//! The tiered cache front door

use crate::cache::codec::CompressionCodec;
use crate::cache::config::{CacheConfig, RemoteConfig, MAX_TTL_SECONDS};
use crate::cache::memory::MemoryCache;
use crate::cache::remote::{RedisStoreFactory, RemoteStore, RemoteStoreFactory, SetCondition};
use crate::cache::resilience::{Resilience, ResilienceSnapshot};
use crate::cache::stampede::{InFlightTable, LocalLockTable};
use crate::cache::telemetry::{CacheMetrics, MetricsSink, MonitoringSink, TracingMonitor};
use crate::cache::types::{namespaced_key, CacheLayerSnapshot, CacheTier, RemoteSnapshot};
use crate::error::{CacheError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Two-tier cache: a shared remote store in front of a bounded memory tier
///
/// Reads try the remote store first and fall back to memory; writes go to both.
/// Remote failures never reach the caller. They feed a resilience tracker that
/// bypasses the remote store entirely after repeated failures, so an outage
/// degrades the cache to memory-only instead of failing requests.
///
/// `TieredCache` is a cheap handle; clones share all state.
///
/// # Example
///
/// ```no_run
/// use tiered_cache::{CacheConfig, TieredCache};
///
/// # async fn example() -> tiered_cache::Result<()> {
/// let cache = TieredCache::new(
///     CacheConfig::builder()
///         .namespace("catalog")
///         .remote_url("redis://127.0.0.1:6379")
///         .build(),
/// )?;
///
/// let names: Vec<String> = cache
///     .remember("products:featured", 300, || async {
///         Ok(vec!["lamp".to_string(), "desk".to_string()])
///     })
///     .await?;
/// assert_eq!(names.len(), 2);
///
/// cache.close().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct TieredCache {
    inner: Arc<CacheInner>,
}

/// Shared state behind every [`TieredCache`] handle
pub(crate) struct CacheInner {
    pub(crate) config: CacheConfig,
    pub(crate) resilience: Resilience,
    pub(crate) inflight: InFlightTable,
    pub(crate) local_locks: LocalLockTable,
    memory: MemoryCache<Value>,
    codec: CompressionCodec,
    metrics: Arc<dyn MetricsSink>,
    factory: Option<Arc<dyn RemoteStoreFactory>>,
    client: Mutex<Option<Arc<dyn RemoteStore>>>,
    init_gate: tokio::sync::Mutex<()>,
    init_attempts: AtomicU64,
}

/// Builder for a [`TieredCache`] with injected collaborators
pub struct TieredCacheBuilder {
    config: CacheConfig,
    remote_factory: Option<Arc<dyn RemoteStoreFactory>>,
    monitor: Option<Arc<dyn MonitoringSink>>,
    metrics: Option<Arc<dyn MetricsSink>>,
}

impl TieredCacheBuilder {
    /// Use a custom remote store factory instead of Redis
    pub fn remote_factory(mut self, factory: Arc<dyn RemoteStoreFactory>) -> Self {
        self.remote_factory = Some(factory);
        self
    }

    pub fn monitor(mut self, monitor: Arc<dyn MonitoringSink>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Replace the default in-memory metrics sink
    pub fn metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Validate the configuration and start background tasks
    ///
    /// Must be called inside a tokio runtime for the memory sweeper and the
    /// hit-ratio reporter to run. No remote connection is opened here.
    pub fn build(self) -> Result<TieredCache> {
        let config = self.config;
        config.validate()?;

        let monitor = self.monitor.unwrap_or_else(|| Arc::new(TracingMonitor));

        let metrics = match self.metrics {
            Some(metrics) => metrics,
            None => {
                let metrics = CacheMetrics::new(config.monitoring.clone(), Arc::clone(&monitor));
                metrics.start_reporter();
                Arc::new(metrics)
            }
        };

        let factory = self.remote_factory.or_else(|| {
            config
                .remote
                .clone()
                .map(|remote| Arc::new(RedisStoreFactory::new(remote)) as Arc<dyn RemoteStoreFactory>)
        });

        let memory = MemoryCache::new(&config.memory);
        memory.start_sweeper();

        info!(
            namespace = %config.namespace,
            remote = factory.is_some(),
            max_entries = memory.max_entries(),
            "Tiered cache initialized"
        );

        let inner = CacheInner {
            resilience: Resilience::new(config.resilience.clone(), monitor),
            inflight: InFlightTable::new(),
            local_locks: LocalLockTable::new(),
            memory,
            codec: CompressionCodec::new(config.compression.clone()),
            metrics,
            factory,
            client: Mutex::new(None),
            init_gate: tokio::sync::Mutex::new(()),
            init_attempts: AtomicU64::new(0),
            config,
        };

        Ok(TieredCache {
            inner: Arc::new(inner),
        })
    }
}

impl TieredCache {
    /// Create a cache from configuration, using Redis when `config.remote` is set
    pub fn new(config: CacheConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn builder(config: CacheConfig) -> TieredCacheBuilder {
        TieredCacheBuilder {
            config,
            remote_factory: None,
            monitor: None,
            metrics: None,
        }
    }

    /// Look up a value, remote tier first
    ///
    /// Returns `None` on a miss, and also when the stored value does not
    /// deserialize into `T`.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.inner.get_value(key).await?;
        match serde_json::from_value(value) {
            Ok(value) => Some(value),
            Err(e) => {
                debug!(key = %key, error = %e, "Cached value has an unexpected shape");
                None
            }
        }
    }

    /// Store a value in both tiers
    ///
    /// Fails only if `value` cannot be serialized to JSON; remote errors are
    /// absorbed and the memory tier is always written.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl_seconds: u64) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.inner.set_value(key, &value, ttl_seconds).await;
        Ok(())
    }

    /// Remove a key from both tiers
    pub async fn delete(&self, key: &str) {
        let namespaced = self.inner.namespaced(key);

        if let Some(remote) = self.inner.remote().await {
            match remote.del(&namespaced).await {
                Ok(_) => self.inner.resilience.record_success(),
                Err(e) => self.inner.record_remote_failure("del", &namespaced, &e),
            }
        }

        self.inner.memory.delete(&namespaced).await;
    }

    /// Return the cached value, or compute and cache it with stampede protection
    ///
    /// Concurrent callers for the same key in this process share one `factory`
    /// run. Across processes a lock elects one recomputer while the others wait
    /// up to `max_wait` for its result, then compute on their own.
    ///
    /// A `factory` error is returned to every caller sharing the run and is not
    /// cached.
    pub async fn remember<T, F, Fut>(&self, key: &str, ttl_seconds: u64, factory: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        if let Some(value) = self.get(key).await {
            return Ok(value);
        }

        let load = self.inner.inflight_load(key, ttl_seconds, move || async move {
            let value = factory().await?;
            Ok::<Value, anyhow::Error>(serde_json::to_value(value)?)
        });

        let value = load.await.map_err(CacheError::Factory)?;
        Ok(serde_json::from_value(value)?)
    }

    /// Release the remote connection and stop background work
    ///
    /// The handle stays usable afterwards; the memory tier simply starts empty
    /// and a new remote client is created on demand.
    pub async fn close(&self) {
        if let Some(client) = self.inner.take_client() {
            if let Err(e) = client.quit().await {
                debug!(error = %e, "Error while closing remote client");
            }
        }

        self.inner.memory.close().await;
        self.inner.inflight.clear();
        self.inner.local_locks.clear();
        self.inner.metrics.shutdown();

        info!(namespace = %self.inner.config.namespace, "Tiered cache closed");
    }

    /// Read-only view for health endpoints
    pub async fn snapshot(&self) -> CacheLayerSnapshot {
        CacheLayerSnapshot {
            namespace: self.inner.config.namespace.clone(),
            remote: RemoteSnapshot {
                configured: self.inner.factory.is_some(),
                url: self.remote_config().map(|remote| remote.url.clone()),
            },
            resilience: self.inner.resilience.snapshot(),
            memory_entries: self.inner.memory.len().await,
            inflight_loads: self.inner.inflight.len(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.inner.config.namespace
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn remote_config(&self) -> Option<&RemoteConfig> {
        self.inner.config.remote.as_ref()
    }

    pub fn metrics(&self) -> Arc<dyn MetricsSink> {
        Arc::clone(&self.inner.metrics)
    }

    /// Whether remote operations are currently bypassed
    pub fn is_fallback_active(&self) -> bool {
        self.inner.resilience.is_fallback_active()
    }

    pub fn resilience(&self) -> ResilienceSnapshot {
        self.inner.resilience.snapshot()
    }

    /// Watch resilience state changes
    pub fn subscribe_resilience(&self) -> watch::Receiver<ResilienceSnapshot> {
        self.inner.resilience.subscribe()
    }
}

impl CacheInner {
    pub(crate) fn namespaced(&self, key: &str) -> String {
        namespaced_key(&self.config.namespace, key)
    }

    pub(crate) fn current_client(&self) -> Option<Arc<dyn RemoteStore>> {
        self.client
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn take_client(&self) -> Option<Arc<dyn RemoteStore>> {
        self.client
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Remote client if one is configured and the remote store is not bypassed
    ///
    /// The client is created on first use. Concurrent callers share a single
    /// initialization attempt, and a failed attempt counts as a remote failure.
    pub(crate) async fn remote(&self) -> Option<Arc<dyn RemoteStore>> {
        let factory = self.factory.as_ref()?;

        if self.resilience.is_fallback_active() {
            return None;
        }

        if let Some(client) = self.current_client() {
            return Some(client);
        }

        let attempts_seen = self.init_attempts.load(Ordering::Acquire);
        let _gate = self.init_gate.lock().await;

        if let Some(client) = self.current_client() {
            return Some(client);
        }
        if self.init_attempts.load(Ordering::Acquire) != attempts_seen {
            // another caller just tried and failed
            return None;
        }

        let result = match factory.create().await {
            Ok(client) => client.connect().await.map(|_| client),
            Err(e) => Err(e),
        };
        self.init_attempts.fetch_add(1, Ordering::AcqRel);

        match result {
            Ok(client) => {
                *self.client.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&client));
                debug!(namespace = %self.config.namespace, "Remote cache client ready");
                Some(client)
            }
            Err(e) => {
                self.record_remote_failure("connect", &self.config.namespace, &e);
                None
            }
        }
    }

    /// Log a failed remote call and feed it to the resilience tracker
    pub(crate) fn record_remote_failure(&self, operation: &str, key: &str, error: &CacheError) {
        warn!(operation = %operation, key = %key, error = %error, "Remote cache operation failed");

        let reason = format!("{} failed: {}", operation, error);
        if self.resilience.record_failure(&reason) {
            self.dispose_client();
        }
    }

    fn dispose_client(&self) {
        let Some(client) = self.take_client() else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = client.quit().await {
                        debug!(error = %e, "Error while disposing remote client");
                    }
                });
            }
            Err(_) => debug!("No tokio runtime available, dropping remote client without quit"),
        }
    }

    fn decode(&self, key: &str, raw: &str) -> Option<Value> {
        let json = self.codec.decompress(raw)?;
        match serde_json::from_str(&json) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to parse remote cache value");
                None
            }
        }
    }

    /// Look up a raw JSON value, remote tier first, reporting hit or miss
    pub(crate) async fn get_value(&self, key: &str) -> Option<Value> {
        let namespaced = self.namespaced(key);

        if let Some(remote) = self.remote().await {
            match remote.get(&namespaced).await {
                Ok(Some(raw)) => {
                    self.resilience.record_success();
                    if let Some(value) = self.decode(&namespaced, &raw) {
                        debug!(key = %namespaced, tier = %CacheTier::Remote, "Cache hit");
                        self.metrics.record_hit(CacheTier::Remote);
                        return Some(value);
                    }
                }
                Ok(None) => self.resilience.record_success(),
                Err(e) => self.record_remote_failure("get", &namespaced, &e),
            }
        }

        match self.memory.get(&namespaced).await {
            Some(value) => {
                debug!(key = %namespaced, tier = %CacheTier::Memory, "Cache hit");
                self.metrics.record_hit(CacheTier::Memory);
                Some(value)
            }
            None => {
                debug!(key = %namespaced, "Cache miss");
                self.metrics.record_miss();
                None
            }
        }
    }

    /// Write a JSON value to both tiers
    pub(crate) async fn set_value(&self, key: &str, value: &Value, ttl_seconds: u64) {
        let namespaced = self.namespaced(key);
        let ttl_seconds = ttl_seconds.clamp(1, MAX_TTL_SECONDS);

        if let Some(remote) = self.remote().await {
            match serde_json::to_string(value) {
                Ok(json) => {
                    let wire = self.codec.encode(json);
                    match remote
                        .set(&namespaced, &wire, ttl_seconds, SetCondition::Always)
                        .await
                    {
                        Ok(_) => self.resilience.record_success(),
                        Err(e) => self.record_remote_failure("set", &namespaced, &e),
                    }
                }
                Err(e) => warn!(key = %namespaced, error = %e, "Failed to serialize cache value"),
            }
        }

        self.memory.set(&namespaced, value.clone(), ttl_seconds).await;
        debug!(key = %namespaced, ttl_seconds, "Cached value");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::resilience::ResilienceMode;
    use serde::Deserialize;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Profile {
        name: String,
    }

    fn memory_only() -> TieredCache {
        TieredCache::new(CacheConfig::builder().namespace("test").build()).unwrap()
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let cache = memory_only();
        let profile = Profile {
            name: "A".to_string(),
        };

        cache.set("profile:1", &profile, 60).await.unwrap();
        assert_eq!(cache.get::<Profile>("profile:1").await, Some(profile));
        assert_eq!(cache.get::<Profile>("profile:2").await, None);
    }

    #[tokio::test]
    async fn test_shape_mismatch_reads_as_miss() {
        let cache = memory_only();
        cache.set("count", &42, 60).await.unwrap();

        assert_eq!(cache.get::<u32>("count").await, Some(42));
        assert_eq!(cache.get::<Profile>("count").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_ttl_is_floored() {
        let cache = memory_only();
        cache.set("k", &"v", 0).await.unwrap();

        tokio::time::advance(Duration::from_millis(900)).await;
        assert_eq!(cache.get::<String>("k").await.as_deref(), Some("v"));

        tokio::time::advance(Duration::from_millis(200)).await;
        assert_eq!(cache.get::<String>("k").await, None);
    }

    #[tokio::test]
    async fn test_delete() {
        let cache = memory_only();
        cache.set("k", &1, 60).await.unwrap();
        cache.delete("k").await;

        assert_eq!(cache.get::<i32>("k").await, None);
    }

    #[tokio::test]
    async fn test_remember_caches_result() {
        let cache = memory_only();
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let calls = Arc::clone(&calls);
            let value: Vec<u32> = cache
                .remember("numbers", 60, move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(vec![1, 2, 3])
                })
                .await
                .unwrap();
            assert_eq!(value, vec![1, 2, 3]);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.snapshot().await.inflight_loads, 0);
    }

    #[tokio::test]
    async fn test_remember_error_is_not_cached() {
        let cache = memory_only();

        let result: Result<String> = cache
            .remember("flaky", 60, || async { Err(anyhow::anyhow!("upstream timeout")) })
            .await;
        let err = result.unwrap_err();
        assert!(err.to_string().contains("upstream timeout"));
        assert!(err.factory_error().is_some());

        assert_eq!(cache.get::<String>("flaky").await, None);
        let value: String = cache
            .remember("flaky", 60, || async { Ok("recovered".to_string()) })
            .await
            .unwrap();
        assert_eq!(value, "recovered");
    }

    #[tokio::test]
    async fn test_close_clears_memory() {
        let cache = memory_only();
        cache.set("k", &1, 60).await.unwrap();
        cache.close().await;

        assert_eq!(cache.snapshot().await.memory_entries, 0);
        assert_eq!(cache.get::<i32>("k").await, None);
    }

    #[tokio::test]
    async fn test_snapshot_of_memory_only_cache() {
        let cache = memory_only();
        cache.set("a", &1, 60).await.unwrap();
        cache.set("b", &2, 60).await.unwrap();

        let snapshot = cache.snapshot().await;
        assert_eq!(snapshot.namespace, "test");
        assert!(!snapshot.remote.configured);
        assert_eq!(snapshot.remote.url, None);
        assert_eq!(snapshot.resilience.mode, ResilienceMode::Unknown);
        assert_eq!(snapshot.memory_entries, 2);
        assert!(!cache.is_fallback_active());
    }

    #[tokio::test]
    async fn test_remote_config_accessor() {
        let cache = TieredCache::new(
            CacheConfig::builder()
                .remote_url("redis://cache.internal:6379")
                .build(),
        )
        .unwrap();

        assert_eq!(cache.namespace(), "app");
        assert_eq!(
            cache.remote_config().map(|remote| remote.url.as_str()),
            Some("redis://cache.internal:6379")
        );
        assert!(cache.snapshot().await.remote.configured);
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let result = TieredCache::new(CacheConfig::builder().namespace("").build());
        assert!(matches!(result, Err(CacheError::ConfigError(_))));
    }
}
