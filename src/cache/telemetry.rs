//! Monitoring and metrics sinks
//!
//! The cache reports to two fire-and-forget collaborators: a monitoring sink for
//! rare, noteworthy transitions (fallback activated, connection restored, hit
//! ratio degraded) and a metrics sink for per-lookup hit/miss counting. Both are
//! traits so applications can route them anywhere; the defaults log through
//! `tracing` and keep counters in memory.

use crate::cache::config::MonitoringConfig;
use crate::cache::types::CacheTier;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Severity of a monitoring event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// A noteworthy cache event for external monitoring
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringEvent {
    pub category: String,
    pub severity: Severity,
    pub message: String,
    pub resource: String,
    pub metadata: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
}

impl MonitoringEvent {
    /// Create a cache-category event for the remote cache resource
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            category: "cache".to_string(),
            severity,
            message: message.into(),
            resource: "cache.remote".to_string(),
            metadata: serde_json::Value::Null,
            occurred_at: Utc::now(),
        }
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = resource.into();
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Receiver of monitoring events; must not block
pub trait MonitoringSink: Send + Sync {
    fn record_event(&self, event: MonitoringEvent);
}

/// Monitoring sink that writes events to the tracing log
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingMonitor;

impl MonitoringSink for TracingMonitor {
    fn record_event(&self, event: MonitoringEvent) {
        match event.severity {
            Severity::Info => info!(
                category = %event.category,
                resource = %event.resource,
                metadata = %event.metadata,
                "{}", event.message
            ),
            Severity::Warning => warn!(
                category = %event.category,
                resource = %event.resource,
                metadata = %event.metadata,
                "{}", event.message
            ),
            Severity::Critical => error!(
                category = %event.category,
                resource = %event.resource,
                metadata = %event.metadata,
                "{}", event.message
            ),
        }
    }
}

/// Receiver of per-lookup hit/miss signals; must not block
pub trait MetricsSink: Send + Sync {
    fn record_hit(&self, tier: CacheTier);
    fn record_miss(&self);
    fn shutdown(&self);
}

/// Hit/miss counters for one reporting window
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub remote_hits: u64,
    pub memory_hits: u64,
    pub hit_ratio: f64,
    pub window_samples: u64,
}

impl fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MetricsSnapshot {{ hits: {}, misses: {}, remote_hits: {}, memory_hits: {}, hit_ratio: {:.2} }}",
            self.hits, self.misses, self.remote_hits, self.memory_hits, self.hit_ratio
        )
    }
}

/// In-memory metrics sink with an optional periodic hit-ratio reporter
pub struct CacheMetrics {
    config: MonitoringConfig,
    counters: Arc<Counters>,
    monitor: Arc<dyn MonitoringSink>,
    reporter: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    remote_hits: AtomicU64,
    memory_hits: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> MetricsSnapshot {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        MetricsSnapshot {
            hits,
            misses,
            remote_hits: self.remote_hits.load(Ordering::Relaxed),
            memory_hits: self.memory_hits.load(Ordering::Relaxed),
            hit_ratio: if total == 0 { 0.0 } else { hits as f64 / total as f64 },
            window_samples: total,
        }
    }

    fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.remote_hits.store(0, Ordering::Relaxed);
        self.memory_hits.store(0, Ordering::Relaxed);
    }
}

impl CacheMetrics {
    pub fn new(config: MonitoringConfig, monitor: Arc<dyn MonitoringSink>) -> Self {
        Self {
            config,
            counters: Arc::new(Counters::default()),
            monitor,
            reporter: Mutex::new(None),
        }
    }

    /// Current window, without resetting it
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.counters.snapshot()
    }

    /// Current window, resetting the counters if it holds any samples
    pub fn snapshot_and_reset(&self) -> Option<MetricsSnapshot> {
        snapshot_and_reset(&self.counters)
    }

    /// Judge the current window and emit a monitoring event if the hit ratio is low
    pub fn report(&self) -> Option<Severity> {
        report_window(&self.config, &self.counters, self.monitor.as_ref())
    }

    /// Spawn the periodic reporter on the current tokio runtime
    pub fn start_reporter(&self) {
        if !self.config.enabled {
            return;
        }

        let mut slot = self.reporter.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return;
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("No tokio runtime available, cache hit-ratio reporter not started");
            return;
        };

        let counters = Arc::downgrade(&self.counters);
        let config = self.config.clone();
        let monitor = Arc::clone(&self.monitor);
        *slot = Some(handle.spawn(run_reporter(counters, config, monitor)));
    }
}

impl MetricsSink for CacheMetrics {
    fn record_hit(&self, tier: CacheTier) {
        if !self.config.enabled {
            return;
        }
        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        match tier {
            CacheTier::Remote => self.counters.remote_hits.fetch_add(1, Ordering::Relaxed),
            CacheTier::Memory => self.counters.memory_hits.fetch_add(1, Ordering::Relaxed),
        };
    }

    fn record_miss(&self) {
        if !self.config.enabled {
            return;
        }
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn shutdown(&self) {
        if let Some(handle) = self
            .reporter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
        self.counters.reset();
    }
}

impl Drop for CacheMetrics {
    fn drop(&mut self) {
        if let Some(handle) = self
            .reporter
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

fn snapshot_and_reset(counters: &Counters) -> Option<MetricsSnapshot> {
    let snapshot = counters.snapshot();
    if snapshot.window_samples == 0 {
        return None;
    }
    counters.reset();
    Some(snapshot)
}

fn report_window(
    config: &MonitoringConfig,
    counters: &Counters,
    monitor: &dyn MonitoringSink,
) -> Option<Severity> {
    if !config.enabled {
        return None;
    }

    let snapshot = snapshot_and_reset(counters)?;
    if snapshot.window_samples < config.min_samples || snapshot.hit_ratio >= config.warn_threshold {
        debug!("Cache metrics window: {}", snapshot);
        return None;
    }

    let severity = if snapshot.hit_ratio < config.critical_threshold {
        Severity::Critical
    } else {
        Severity::Warning
    };

    monitor.record_event(
        MonitoringEvent::new(severity, "Cache hit ratio dropped below target")
            .with_resource("cache-store")
            .with_metadata(serde_json::json!({
                "hits": snapshot.hits,
                "misses": snapshot.misses,
                "remoteHits": snapshot.remote_hits,
                "memoryHits": snapshot.memory_hits,
                "hitRatio": snapshot.hit_ratio,
                "windowSamples": snapshot.window_samples,
                "warnThreshold": config.warn_threshold,
                "criticalThreshold": config.critical_threshold,
                "intervalMs": config.report_interval.as_millis() as u64,
            })),
    );
    Some(severity)
}

async fn run_reporter(counters: Weak<Counters>, config: MonitoringConfig, monitor: Arc<dyn MonitoringSink>) {
    let interval = config.report_interval;
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let Some(counters) = counters.upgrade() else {
            break;
        };
        report_window(&config, &counters, monitor.as_ref());
    }
}
