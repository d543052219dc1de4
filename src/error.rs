//! Error types for cache operations
//!
//! Most failures inside the cache never reach the caller: remote errors feed the
//! resilience state machine and malformed payloads read as misses. The variants
//! here cover what does surface (serialization of caller values, invalid
//! configuration, factory failures in `remember`) plus the errors adapters report
//! back to the orchestrator.

use std::sync::Arc;
use thiserror::Error;

/// Main error type for cache operations
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    /// Remote store error - connection, command or protocol failure
    #[error("Remote store error: {0}")]
    Remote(String),

    /// Serialization/Deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Compression or decompression failure
    #[error("Compression error: {0}")]
    Compression(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The `remember` factory failed; every waiter on the same key sees the same error
    #[error("Cache factory failed: {0}")]
    Factory(Arc<anyhow::Error>),
}

impl CacheError {
    /// Borrow the original factory error, if this is a factory failure
    pub fn factory_error(&self) -> Option<&anyhow::Error> {
        match self {
            CacheError::Factory(inner) => Some(inner.as_ref()),
            _ => None,
        }
    }
}

/// Result type alias for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

impl From<redis::RedisError> for CacheError {
    fn from(e: redis::RedisError) -> Self {
        CacheError::Remote(e.to_string())
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = CacheError::Remote("connection refused".to_string());
        assert_eq!(error.to_string(), "Remote store error: connection refused");

        let error = CacheError::ConfigError("namespace must not be empty".to_string());
        assert!(error.to_string().contains("namespace"));
    }

    #[test]
    fn test_error_conversion() {
        let redis_error = redis::RedisError::from((redis::ErrorKind::IoError, "connection reset"));
        let error: CacheError = redis_error.into();
        assert!(matches!(error, CacheError::Remote(_)));

        let json_error = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let error: CacheError = json_error.into();
        assert!(matches!(error, CacheError::Serialization(_)));
    }

    #[test]
    fn test_factory_error_is_shared() {
        let error = CacheError::Factory(Arc::new(anyhow::anyhow!("upstream timeout")));
        let cloned = error.clone();

        assert_eq!(
            cloned.factory_error().map(|e| e.to_string()),
            Some("upstream timeout".to_string())
        );
        assert!(error.to_string().contains("upstream timeout"));
    }
}
