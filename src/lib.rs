//! # tiered-cache
//!
//! A two-tier cache for async Rust services: a shared Redis store backed by a
//! bounded in-process memory tier.
//!
//! ## Features
//!
//! - Remote-first reads with transparent memory fallback
//! - Automatic bypass of an unhealthy remote store, with lazy recovery
//! - `remember` with in-process single-flight and cross-process locking
//! - Brotli/gzip compression of large payloads
//! - Configuration from code or `CACHE_*` environment variables
//!
//! ## Quick start
//!
//! ```no_run
//! use tiered_cache::{CacheConfig, TieredCache};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let cache = TieredCache::new(CacheConfig::from_env())?;
//!
//!     let report: serde_json::Value = cache
//!         .remember("reports:daily", 600, || async {
//!             Ok(serde_json::json!({ "orders": 1280, "revenue": 45210.5 }))
//!         })
//!         .await?;
//!     println!("Report: {}", report);
//!
//!     println!("{}", cache.snapshot().await);
//!     cache.close().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Outage behaviour
//!
//! Remote errors are never returned to callers. After
//! `resilience.failure_threshold` consecutive failures the remote store is
//! skipped for `resilience.cooldown`, and the cache serves from memory only.
//! Subscribe to changes with [`TieredCache::subscribe_resilience`].
//!
//! ```no_run
//! use tiered_cache::{CacheConfig, ResilienceMode, TieredCache};
//!
//! # async fn example() -> tiered_cache::Result<()> {
//! let cache = TieredCache::new(CacheConfig::builder().remote_url("redis://127.0.0.1:6379").build())?;
//! let mut changes = cache.subscribe_resilience();
//!
//! tokio::spawn(async move {
//!     while changes.changed().await.is_ok() {
//!         if changes.borrow().mode == ResilienceMode::Fallback {
//!             eprintln!("cache running memory-only");
//!         }
//!     }
//! });
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod error;

// Re-export main types for convenience
pub use cache::{
    CacheConfig, CacheConfigBuilder, CacheLayerSnapshot, CacheMetrics, CacheTier,
    CompressionEncoding, MetricsSink, MonitoringEvent, MonitoringSink, RedisStoreFactory,
    RemoteConfig, RemoteStore, RemoteStoreFactory, ResilienceMode, ResilienceSnapshot,
    SetCondition, Severity, TieredCache, TieredCacheBuilder,
};
pub use error::{CacheError, Result};
