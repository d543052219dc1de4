//! # Tiered Caching Layer
//!
//! A remote key-value store (Redis) in front of a bounded in-process memory
//! tier, hardened for production traffic.
//!
//! ## Features
//!
//! - **Two tiers**: reads try the shared remote store, then fall back to memory;
//!   writes go to both
//! - **Outage fallback**: repeated remote failures switch the cache to
//!   memory-only for a cooldown period, then the remote store is retried
//! - **Stampede protection**: `remember` coalesces concurrent recomputation
//!   in-process and elects one recomputer across processes with a lock
//! - **TTL jitter**: recomputed values expire at slightly different times
//! - **Compression**: large payloads are brotli or gzip compressed on the wire
//! - **Bounded memory**: TTL expiry, a background sweeper and FIFO eviction
//! - **Monitoring**: hit/miss metrics, hit-ratio alerts and resilience events
//!
//! ## Architecture
//!
//! ```text
//!   TieredCache ──▶ Resilience ──ok──▶ RemoteStore (codec on the wire)
//!        │                 └─fallback─┐
//!        └──────────────────────────▶ MemoryCache
//! ```
//!
//! ## Example
//!
//! ```rust
//! use tiered_cache::cache::{CacheConfig, TieredCache};
//!
//! # async fn example() -> tiered_cache::Result<()> {
//! let config = CacheConfig::builder()
//!     .namespace("sessions")
//!     .max_entries(10_000)
//!     .build();
//!
//! let cache = TieredCache::new(config)?;
//!
//! cache.set("user:42", &"alice", 3600).await?;
//!
//! if let Some(name) = cache.get::<String>("user:42").await {
//!     println!("Cache hit: {}", name);
//! }
//!
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod entry;
pub mod memory;
pub mod orchestrator;
pub mod remote;
pub mod resilience;
pub mod stampede;
pub mod telemetry;
pub mod types;

pub use codec::{CompressionCodec, COMPRESSED_PREFIX};
pub use config::{
    CacheConfig, CacheConfigBuilder, CompressionConfig, CompressionEncoding, MemoryConfig,
    MonitoringConfig, RemoteConfig, ResilienceConfig, StampedeConfig, MAX_TTL_SECONDS,
};
pub use entry::CacheEntry;
pub use memory::MemoryCache;
pub use orchestrator::{TieredCache, TieredCacheBuilder};
pub use remote::{RedisStore, RedisStoreFactory, RemoteStore, RemoteStoreFactory, SetCondition};
pub use resilience::{ResilienceMode, ResilienceSnapshot};
pub use stampede::{apply_safe_ttl, jitter_cap, LockHandle};
pub use telemetry::{
    CacheMetrics, MetricsSink, MetricsSnapshot, MonitoringEvent, MonitoringSink, Severity,
    TracingMonitor,
};
pub use types::{CacheLayerSnapshot, CacheTier, RemoteSnapshot};
