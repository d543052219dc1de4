//! Remote key-value store adapter
//!
//! The orchestrator talks to the shared store only through [`RemoteStore`], and
//! obtains a client lazily through [`RemoteStoreFactory`] so that a store which
//! is down at startup does not prevent the cache from serving from memory.
//! [`RedisStore`] is the production implementation.

use crate::cache::config::RemoteConfig;
use crate::error::{CacheError, Result};
use async_trait::async_trait;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::AsyncCommands;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

/// Condition attached to a remote write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetCondition {
    /// Plain `SET key value EX ttl`
    Always,
    /// `SET key value EX ttl NX`: succeed only if the key is absent
    IfAbsent,
}

/// Async client of a remote key-value store
///
/// Every method may fail; the orchestrator routes failures into its resilience
/// tracking and never surfaces them to cache callers.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Establish the connection
    async fn connect(&self) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write with expiry; returns whether the store accepted the write
    async fn set(&self, key: &str, value: &str, ttl_seconds: u64, condition: SetCondition) -> Result<bool>;

    /// Delete a key; returns the number of keys removed
    async fn del(&self, key: &str) -> Result<u64>;

    /// Close the connection
    async fn quit(&self) -> Result<()>;

    /// Delete `key` only while it still holds `token`
    ///
    /// The default reads then deletes, which leaves a small window between the
    /// two calls; stores with server-side scripting should override it.
    async fn release_lock(&self, key: &str, token: &str) -> Result<bool> {
        match self.get(key).await? {
            Some(current) if current == token => Ok(self.del(key).await? > 0),
            _ => Ok(false),
        }
    }
}

/// Lazily constructs remote store clients
#[async_trait]
pub trait RemoteStoreFactory: Send + Sync {
    /// Build a new, not yet connected client
    async fn create(&self) -> Result<Arc<dyn RemoteStore>>;
}

const RELEASE_LOCK_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Redis-backed remote store over a reconnecting connection manager
pub struct RedisStore {
    config: RemoteConfig,
    client: redis::Client,
    connection: Mutex<Option<ConnectionManager>>,
}

impl RedisStore {
    /// Create a client for `config.url`; no connection is opened yet
    pub fn new(config: RemoteConfig) -> Result<Self> {
        let client = redis::Client::open(config.url.as_str())?;
        Ok(Self {
            config,
            client,
            connection: Mutex::new(None),
        })
    }

    fn connection(&self) -> Result<ConnectionManager> {
        self.connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| CacheError::Remote("redis connection not established".to_string()))
    }
}

#[async_trait]
impl RemoteStore for RedisStore {
    async fn connect(&self) -> Result<()> {
        let manager_config = ConnectionManagerConfig::new()
            .set_number_of_retries(self.config.max_retries_per_request)
            .set_connection_timeout(self.config.connection_timeout)
            .set_response_timeout(self.config.response_timeout);

        let manager = ConnectionManager::new_with_config(self.client.clone(), manager_config).await?;
        *self.connection.lock().unwrap_or_else(PoisonError::into_inner) = Some(manager);

        info!("Connected to redis");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection()?;
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl_seconds: u64, condition: SetCondition) -> Result<bool> {
        let mut conn = self.connection()?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("EX").arg(ttl_seconds.max(1));
        if condition == SetCondition::IfAbsent {
            cmd.arg("NX");
        }

        let reply: Option<String> = cmd.query_async(&mut conn).await?;
        Ok(reply.as_deref() == Some("OK"))
    }

    async fn del(&self, key: &str) -> Result<u64> {
        let mut conn = self.connection()?;
        let removed: u64 = conn.del(key).await?;
        Ok(removed)
    }

    async fn quit(&self) -> Result<()> {
        let taken = self
            .connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(mut conn) = taken {
            let _: () = redis::cmd("QUIT").query_async(&mut conn).await?;
            debug!("Closed redis connection");
        }
        Ok(())
    }

    async fn release_lock(&self, key: &str, token: &str) -> Result<bool> {
        let mut conn = self.connection()?;
        let removed: u64 = redis::Script::new(RELEASE_LOCK_SCRIPT)
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }
}

/// Factory producing [`RedisStore`] clients from a [`RemoteConfig`]
#[derive(Debug, Clone)]
pub struct RedisStoreFactory {
    config: RemoteConfig,
}

impl RedisStoreFactory {
    pub fn new(config: RemoteConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl RemoteStoreFactory for RedisStoreFactory {
    async fn create(&self) -> Result<Arc<dyn RemoteStore>> {
        Ok(Arc::new(RedisStore::new(self.config.clone())?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_url_is_rejected() {
        let result = RedisStore::new(RemoteConfig::new("not a url"));
        assert!(matches!(result, Err(CacheError::Remote(_))));
    }

    #[tokio::test]
    async fn test_operations_before_connect_fail() {
        let store = RedisStore::new(RemoteConfig::new("redis://127.0.0.1:6379")).unwrap();

        assert!(store.get("app:key").await.is_err());
        assert!(store
            .set("app:key", "value", 10, SetCondition::Always)
            .await
            .is_err());
        // quitting an unopened store is a no-op
        assert!(store.quit().await.is_ok());
    }
}
