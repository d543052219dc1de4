//! Core type definitions for the cache system

use crate::cache::resilience::ResilienceSnapshot;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Suffix appended to a namespaced key to form its stampede lock key
pub const LOCK_SUFFIX: &str = ":lock";

/// Tier that served a cache hit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheTier {
    /// Shared remote key-value store
    Remote,

    /// Process-local memory tier
    Memory,
}

impl fmt::Display for CacheTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheTier::Remote => write!(f, "remote"),
            CacheTier::Memory => write!(f, "memory"),
        }
    }
}

/// Build `"{namespace}:{key}"`
pub fn namespaced_key(namespace: &str, key: &str) -> String {
    format!("{}:{}", namespace, key)
}

/// Build the lock key guarding recomputation of a namespaced key
pub fn lock_key(namespaced_key: &str) -> String {
    format!("{}{}", namespaced_key, LOCK_SUFFIX)
}

/// Remote store section of a [`CacheLayerSnapshot`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteSnapshot {
    pub configured: bool,
    pub url: Option<String>,
}

/// Read-only view of the whole cache for health and monitoring endpoints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheLayerSnapshot {
    pub namespace: String,
    pub remote: RemoteSnapshot,
    pub resilience: ResilienceSnapshot,
    pub memory_entries: usize,
    pub inflight_loads: usize,
}

impl fmt::Display for CacheLayerSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CacheLayerSnapshot {{ namespace: {}, remote_configured: {}, mode: {}, memory_entries: {}, inflight_loads: {} }}",
            self.namespace,
            self.remote.configured,
            self.resilience.mode,
            self.memory_entries,
            self.inflight_loads
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_formats() {
        let key = namespaced_key("app", "user:42");
        assert_eq!(key, "app:user:42");
        assert_eq!(lock_key(&key), "app:user:42:lock");
    }

    #[test]
    fn test_cache_tier_display() {
        assert_eq!(format!("{}", CacheTier::Remote), "remote");
        assert_eq!(format!("{}", CacheTier::Memory), "memory");
        assert_eq!(serde_json::to_string(&CacheTier::Memory).unwrap(), "\"memory\"");
    }
}
