//! Configuration for the tiered cache
//!
//! Every knob has a default tuned for a typical web backend. Configuration can be
//! assembled with [`CacheConfig::builder`] or read from `CACHE_*` environment
//! variables with [`CacheConfig::from_env`], which clamps each value into its
//! supported range instead of rejecting it.

use crate::error::{CacheError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Smallest sweep interval the memory tier accepts
pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(1_000);

/// Smallest entry budget the memory tier accepts
pub const MIN_MAX_ENTRIES: usize = 100;

/// Longest TTL any tier is given; larger values are clamped to this (ten years)
pub const MAX_TTL_SECONDS: u64 = 10 * 365 * 24 * 60 * 60;

/// Top-level configuration for [`TieredCache`](crate::cache::TieredCache)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Prefix applied to every key, isolating this cache inside a shared remote store
    pub namespace: String,

    /// Remote store connection settings; `None` runs the cache memory-only
    pub remote: Option<RemoteConfig>,

    /// Memory tier bounds
    pub memory: MemoryConfig,

    /// Stampede protection tuning for `remember`
    pub stampede: StampedeConfig,

    /// Compression of values written to the remote store
    pub compression: CompressionConfig,

    /// Remote outage detection and fallback
    pub resilience: ResilienceConfig,

    /// Hit-ratio reporting
    pub monitoring: MonitoringConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            namespace: "app".to_string(),
            remote: None,
            memory: MemoryConfig::default(),
            stampede: StampedeConfig::default(),
            compression: CompressionConfig::default(),
            resilience: ResilienceConfig::default(),
            monitoring: MonitoringConfig::default(),
        }
    }
}

/// Connection settings for the remote key-value store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Connection URL, e.g. `redis://127.0.0.1:6379`
    pub url: String,

    /// Reconnect attempts per request before the command fails
    pub max_retries_per_request: usize,

    /// Upper bound on establishing a connection
    pub connection_timeout: Duration,

    /// Upper bound on a single command round-trip
    pub response_timeout: Duration,
}

impl RemoteConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            max_retries_per_request: 1,
            connection_timeout: Duration::from_secs(2),
            response_timeout: Duration::from_millis(500),
        }
    }
}

/// Bounds of the in-process memory tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// How often the background sweeper drops expired entries (floored at 1s)
    pub sweep_interval: Duration,

    /// Maximum number of entries before eviction kicks in (floored at 100)
    pub max_entries: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(60),
            max_entries: 5_000,
        }
    }
}

/// Tuning for the `remember` stampede guard
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StampedeConfig {
    /// Expiry of the recomputation lock, remote or local
    pub lock_ttl_seconds: u64,

    /// Poll interval while waiting for another actor to fill the cache
    pub wait_interval: Duration,

    /// Longest a caller waits before recomputing on its own
    pub max_wait: Duration,

    /// Absolute cap on TTL jitter
    pub max_jitter_seconds: u64,

    /// Relative cap on TTL jitter, as a fraction of the TTL (0.0 - 0.8)
    pub max_jitter_percent: f64,
}

impl Default for StampedeConfig {
    fn default() -> Self {
        Self {
            lock_ttl_seconds: 5,
            wait_interval: Duration::from_millis(50),
            max_wait: Duration::from_millis(1_500),
            max_jitter_seconds: 10,
            max_jitter_percent: 0.15,
        }
    }
}

/// Compression algorithm used for remote payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionEncoding {
    Brotli,
    Gzip,
}

impl CompressionEncoding {
    /// Name used in the wire header
    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionEncoding::Brotli => "brotli",
            CompressionEncoding::Gzip => "gzip",
        }
    }
}

impl fmt::Display for CompressionEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CompressionEncoding {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "brotli" => Ok(CompressionEncoding::Brotli),
            "gzip" => Ok(CompressionEncoding::Gzip),
            other => Err(CacheError::ConfigError(format!(
                "unknown compression encoding: {}",
                other
            ))),
        }
    }
}

/// Compression of values on their way to the remote store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressionConfig {
    pub enabled: bool,

    /// Payloads smaller than this (in UTF-8 bytes) are stored as plain JSON
    pub min_size_bytes: usize,

    pub encoding: CompressionEncoding,

    /// Brotli quality, 1 - 11
    pub brotli_quality: u32,

    /// Gzip level, 1 - 9
    pub gzip_level: u32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_size_bytes: 4 * 1024,
            encoding: CompressionEncoding::Brotli,
            brotli_quality: 5,
            gzip_level: 6,
        }
    }
}

/// Remote outage detection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResilienceConfig {
    /// When false the remote store is always attempted and never bypassed
    pub enabled: bool,

    /// Consecutive failures (since the last success) that trip the fallback
    pub failure_threshold: u32,

    /// How long the remote store is bypassed once the fallback trips
    pub cooldown: Duration,

    /// Minimum gap between fallback log lines
    pub log_throttle: Duration,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 3,
            cooldown: Duration::from_secs(60),
            log_throttle: Duration::from_secs(30),
        }
    }
}

/// Periodic hit-ratio reporting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringConfig {
    pub enabled: bool,

    pub report_interval: Duration,

    /// Hit ratio below which a warning event is emitted
    pub warn_threshold: f64,

    /// Hit ratio below which a critical event is emitted
    pub critical_threshold: f64,

    /// Lookups needed in a window before the ratio is judged
    pub min_samples: u64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            report_interval: Duration::from_secs(60),
            warn_threshold: 0.8,
            critical_threshold: 0.5,
            min_samples: 200,
        }
    }
}

impl CacheConfig {
    /// Create a new builder for cache configuration
    pub fn builder() -> CacheConfigBuilder {
        CacheConfigBuilder::default()
    }

    /// Load configuration from the process environment (and `.env`, if present)
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source
    ///
    /// Unset or unparsable values fall back to the defaults; numeric values are
    /// clamped into their supported range.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = CacheConfig::default();
        let env = EnvReader { lookup };

        let namespace = env
            .string("CACHE_NAMESPACE")
            .unwrap_or(defaults.namespace);

        let remote = env
            .string("CACHE_REDIS_URL")
            .or_else(|| env.string("REDIS_URL"))
            .map(|url| {
                let remote_defaults = RemoteConfig::default();
                RemoteConfig {
                    url,
                    max_retries_per_request: env.positive(
                        "CACHE_REDIS_MAX_RETRIES_PER_REQUEST",
                        remote_defaults.max_retries_per_request as u64,
                    ) as usize,
                    connection_timeout: Duration::from_millis(env.positive(
                        "CACHE_REDIS_CONNECT_TIMEOUT_MS",
                        remote_defaults.connection_timeout.as_millis() as u64,
                    )),
                    response_timeout: Duration::from_millis(env.positive(
                        "CACHE_REDIS_RESPONSE_TIMEOUT_MS",
                        remote_defaults.response_timeout.as_millis() as u64,
                    )),
                }
            });

        let memory = MemoryConfig {
            sweep_interval: Duration::from_millis(env.positive(
                "CACHE_MEMORY_SWEEP_INTERVAL_MS",
                defaults.memory.sweep_interval.as_millis() as u64,
            )),
            max_entries: env.positive(
                "CACHE_MEMORY_MAX_ENTRIES",
                defaults.memory.max_entries as u64,
            ) as usize,
        };

        let jitter_percent = env
            .float("CACHE_STAMPEDE_MAX_JITTER_PERCENT")
            .unwrap_or(defaults.stampede.max_jitter_percent * 100.0)
            .clamp(0.0, 80.0);

        let stampede = StampedeConfig {
            lock_ttl_seconds: env.positive("CACHE_STAMPEDE_LOCK_TTL_SECONDS", 5).clamp(1, 60),
            wait_interval: Duration::from_millis(
                env.positive("CACHE_STAMPEDE_WAIT_INTERVAL_MS", 50).clamp(10, 1_000),
            ),
            max_wait: Duration::from_millis(
                env.positive("CACHE_STAMPEDE_MAX_WAIT_MS", 1_500).clamp(100, 10_000),
            ),
            max_jitter_seconds: env
                .positive("CACHE_STAMPEDE_MAX_JITTER_SECONDS", 10)
                .clamp(0, 120),
            max_jitter_percent: jitter_percent / 100.0,
        };

        let compression = CompressionConfig {
            enabled: env.boolean("CACHE_COMPRESSION_ENABLED", true),
            min_size_bytes: env
                .positive("CACHE_COMPRESSION_MIN_SIZE_BYTES", 4 * 1024)
                .clamp(256, 10 * 1024 * 1024) as usize,
            encoding: env
                .string("CACHE_COMPRESSION_ENCODING")
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(CompressionEncoding::Brotli),
            brotli_quality: env
                .positive("CACHE_COMPRESSION_BROTLI_QUALITY", 5)
                .clamp(1, 11) as u32,
            gzip_level: env.positive("CACHE_COMPRESSION_GZIP_LEVEL", 6).clamp(1, 9) as u32,
        };

        let resilience = ResilienceConfig {
            enabled: env.boolean("CACHE_FALLBACK_ENABLED", true),
            failure_threshold: env
                .positive("CACHE_FALLBACK_FAILURE_THRESHOLD", 3)
                .clamp(1, 50) as u32,
            cooldown: Duration::from_millis(env.positive("CACHE_FALLBACK_COOLDOWN_MS", 60_000)),
            log_throttle: Duration::from_millis(
                env.positive("CACHE_FALLBACK_LOG_THROTTLE_MS", 30_000),
            ),
        };

        let monitoring = MonitoringConfig {
            enabled: env.boolean("CACHE_MONITORING_ENABLED", true),
            report_interval: Duration::from_millis(
                env.positive("CACHE_MONITORING_INTERVAL_MS", 60_000),
            ),
            warn_threshold: env
                .float("CACHE_MONITORING_WARN_THRESHOLD")
                .unwrap_or(defaults.monitoring.warn_threshold)
                .clamp(0.0, 1.0),
            critical_threshold: env
                .float("CACHE_MONITORING_CRITICAL_THRESHOLD")
                .unwrap_or(defaults.monitoring.critical_threshold)
                .clamp(0.0, 1.0),
            min_samples: env.positive("CACHE_MONITORING_MIN_SAMPLES", 200),
        };

        Self {
            namespace,
            remote,
            memory,
            stampede,
            compression,
            resilience,
            monitoring,
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.namespace.trim().is_empty() {
            return Err(CacheError::ConfigError(
                "namespace must not be empty".to_string(),
            ));
        }

        if let Some(remote) = &self.remote {
            if remote.url.trim().is_empty() {
                return Err(CacheError::ConfigError(
                    "remote url must not be empty".to_string(),
                ));
            }
        }

        if self.stampede.lock_ttl_seconds == 0 {
            return Err(CacheError::ConfigError(
                "lock_ttl_seconds must be greater than 0".to_string(),
            ));
        }

        if self.stampede.wait_interval.is_zero() {
            return Err(CacheError::ConfigError(
                "wait_interval must be greater than 0".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.stampede.max_jitter_percent) {
            return Err(CacheError::ConfigError(
                "max_jitter_percent must be between 0.0 and 1.0".to_string(),
            ));
        }

        if !(1..=11).contains(&self.compression.brotli_quality) {
            return Err(CacheError::ConfigError(
                "brotli_quality must be between 1 and 11".to_string(),
            ));
        }

        if !(1..=9).contains(&self.compression.gzip_level) {
            return Err(CacheError::ConfigError(
                "gzip_level must be between 1 and 9".to_string(),
            ));
        }

        if self.resilience.failure_threshold == 0 {
            return Err(CacheError::ConfigError(
                "failure_threshold must be greater than 0".to_string(),
            ));
        }

        if self.monitoring.critical_threshold > self.monitoring.warn_threshold {
            return Err(CacheError::ConfigError(
                "critical_threshold must not exceed warn_threshold".to_string(),
            ));
        }

        Ok(())
    }
}

/// Builder for cache configuration
#[derive(Debug, Default)]
pub struct CacheConfigBuilder {
    config: CacheConfig,
}

impl CacheConfigBuilder {
    /// Set the key namespace
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.config.namespace = namespace.into();
        self
    }

    /// Connect to a remote store at `url` with default connection options
    pub fn remote_url(mut self, url: impl Into<String>) -> Self {
        self.config.remote = Some(RemoteConfig::new(url));
        self
    }

    /// Set full remote connection settings
    pub fn remote(mut self, remote: RemoteConfig) -> Self {
        self.config.remote = Some(remote);
        self
    }

    /// Set the memory tier entry budget
    pub fn max_entries(mut self, max: usize) -> Self {
        self.config.memory.max_entries = max;
        self
    }

    /// Set the memory tier sweep interval
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.config.memory.sweep_interval = interval;
        self
    }

    pub fn stampede(mut self, stampede: StampedeConfig) -> Self {
        self.config.stampede = stampede;
        self
    }

    pub fn compression(mut self, compression: CompressionConfig) -> Self {
        self.config.compression = compression;
        self
    }

    /// Enable or disable remote payload compression
    pub fn enable_compression(mut self, enable: bool) -> Self {
        self.config.compression.enabled = enable;
        self
    }

    pub fn resilience(mut self, resilience: ResilienceConfig) -> Self {
        self.config.resilience = resilience;
        self
    }

    pub fn monitoring(mut self, monitoring: MonitoringConfig) -> Self {
        self.config.monitoring = monitoring;
        self
    }

    /// Build the cache configuration
    pub fn build(self) -> CacheConfig {
        self.config
    }
}

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
            .map(|raw| raw.trim().to_string())
            .filter(|raw| !raw.is_empty())
    }

    fn positive(&self, name: &str, fallback: u64) -> u64 {
        self.string(name)
            .and_then(|raw| raw.parse::<f64>().ok())
            .filter(|value| value.is_finite() && *value > 0.0)
            .map(|value| value.floor() as u64)
            .unwrap_or(fallback)
    }

    fn float(&self, name: &str) -> Option<f64> {
        self.string(name)
            .and_then(|raw| raw.parse::<f64>().ok())
            .filter(|value| value.is_finite())
    }

    fn boolean(&self, name: &str, fallback: bool) -> bool {
        match self.string(name).map(|raw| raw.to_ascii_lowercase()) {
            Some(raw) if matches!(raw.as_str(), "1" | "true" | "yes" | "on") => true,
            Some(raw) if matches!(raw.as_str(), "0" | "false" | "no" | "off") => false,
            _ => fallback,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = CacheConfig::default();
        assert_eq!(config.namespace, "app");
        assert!(config.remote.is_none());
        assert_eq!(config.memory.max_entries, 5_000);
        assert_eq!(config.stampede.lock_ttl_seconds, 5);
        assert_eq!(config.compression.encoding, CompressionEncoding::Brotli);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut invalid = CacheConfig::default();
        invalid.namespace = "  ".to_string();
        assert!(invalid.validate().is_err());

        let mut invalid = CacheConfig::default();
        invalid.compression.brotli_quality = 12;
        assert!(invalid.validate().is_err());

        let mut invalid = CacheConfig::default();
        invalid.stampede.max_jitter_percent = 1.5;
        assert!(invalid.validate().is_err());

        let mut invalid = CacheConfig::default();
        invalid.monitoring.critical_threshold = 0.9;
        assert!(invalid.validate().is_err());
    }

    #[test]
    fn test_config_builder() {
        let config = CacheConfig::builder()
            .namespace("svc")
            .remote_url("redis://cache:6379")
            .max_entries(250)
            .enable_compression(false)
            .build();

        assert_eq!(config.namespace, "svc");
        assert_eq!(config.remote.map(|r| r.url), Some("redis://cache:6379".to_string()));
        assert_eq!(config.memory.max_entries, 250);
        assert!(!config.compression.enabled);
    }

    #[test]
    fn test_from_lookup_defaults() {
        let config = CacheConfig::from_lookup(|_| None);
        assert_eq!(config.namespace, "app");
        assert!(config.remote.is_none());
        assert_eq!(config.stampede.max_wait, Duration::from_millis(1_500));
        assert!((config.stampede.max_jitter_percent - 0.15).abs() < f64::EPSILON);
    }

    #[test]
    fn test_from_lookup_clamps_values() {
        let config = CacheConfig::from_lookup(lookup_from(&[
            ("CACHE_NAMESPACE", " billing "),
            ("REDIS_URL", "redis://fallback:6379"),
            ("CACHE_STAMPEDE_LOCK_TTL_SECONDS", "600"),
            ("CACHE_STAMPEDE_WAIT_INTERVAL_MS", "1"),
            ("CACHE_STAMPEDE_MAX_JITTER_PERCENT", "95"),
            ("CACHE_COMPRESSION_MIN_SIZE_BYTES", "10"),
            ("CACHE_COMPRESSION_ENCODING", "GZIP"),
            ("CACHE_COMPRESSION_GZIP_LEVEL", "42"),
            ("CACHE_FALLBACK_FAILURE_THRESHOLD", "0"),
            ("CACHE_FALLBACK_ENABLED", "off"),
        ]));

        assert_eq!(config.namespace, "billing");
        assert_eq!(config.remote.map(|r| r.url), Some("redis://fallback:6379".to_string()));
        assert_eq!(config.stampede.lock_ttl_seconds, 60);
        assert_eq!(config.stampede.wait_interval, Duration::from_millis(10));
        assert!((config.stampede.max_jitter_percent - 0.8).abs() < 1e-9);
        assert_eq!(config.compression.min_size_bytes, 256);
        assert_eq!(config.compression.encoding, CompressionEncoding::Gzip);
        assert_eq!(config.compression.gzip_level, 9);
        // zero is not a positive integer, so the default applies
        assert_eq!(config.resilience.failure_threshold, 3);
        assert!(!config.resilience.enabled);
    }

    #[test]
    fn test_cache_redis_url_wins_over_redis_url() {
        let config = CacheConfig::from_lookup(lookup_from(&[
            ("CACHE_REDIS_URL", "redis://primary:6379"),
            ("REDIS_URL", "redis://fallback:6379"),
        ]));
        assert_eq!(config.remote.map(|r| r.url), Some("redis://primary:6379".to_string()));
    }

    #[test]
    fn test_unknown_encoding_falls_back_to_brotli() {
        let config = CacheConfig::from_lookup(lookup_from(&[("CACHE_COMPRESSION_ENCODING", "zstd")]));
        assert_eq!(config.compression.encoding, CompressionEncoding::Brotli);
        assert!("zstd".parse::<CompressionEncoding>().is_err());
    }
}
