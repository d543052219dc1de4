//! Shared helpers for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tiered_cache::cache::{MonitoringEvent, MonitoringSink};
use tiered_cache::{CacheError, RemoteStore, RemoteStoreFactory, Result, SetCondition};
use tokio::time::Instant;

/// Install a test log subscriber once; honours `RUST_LOG`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// In-memory stand-in for a Redis server shared by several caches
#[derive(Default)]
pub struct MockRemote {
    entries: Mutex<HashMap<String, (String, Instant)>>,
    ttls: Mutex<HashMap<String, u64>>,
    fill_on_contention: Mutex<Option<(String, String)>>,
    failing: AtomicBool,
    pub connects: AtomicUsize,
    pub gets: AtomicUsize,
    pub sets: AtomicUsize,
    pub dels: AtomicUsize,
    pub quits: AtomicUsize,
}

impl MockRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A remote whose every call fails, as if the server were down
    pub fn failing() -> Arc<Self> {
        let remote = Self::new();
        remote.set_failing(true);
        remote
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Raw stored string, bypassing the cache's decoding
    pub fn raw(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        self.entries
            .lock()
            .unwrap()
            .get(key)
            .filter(|(_, expires_at)| *expires_at > now)
            .map(|(value, _)| value.clone())
    }

    /// Store a raw string directly
    pub fn put_raw(&self, key: &str, value: &str, ttl: Duration) {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
    }

    /// Write `key` the moment a conditional write is refused, as a lock holder
    /// finishing right as another caller loses the race would
    pub fn fill_on_contention(&self, key: &str, value: &str) {
        *self.fill_on_contention.lock().unwrap() = Some((key.to_string(), value.to_string()));
    }

    /// TTL passed with the last write of `key`
    pub fn last_ttl(&self, key: &str) -> Option<u64> {
        self.ttls.lock().unwrap().get(key).copied()
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(CacheError::Remote("connection refused".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RemoteStore for MockRemote {
    async fn connect(&self) -> Result<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.check()
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        Ok(self.raw(key))
    }

    async fn set(&self, key: &str, value: &str, ttl_seconds: u64, condition: SetCondition) -> Result<bool> {
        self.sets.fetch_add(1, Ordering::SeqCst);
        self.check()?;

        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        if condition == SetCondition::IfAbsent {
            if let Some((_, expires_at)) = entries.get(key) {
                if *expires_at > now {
                    if let Some((fill_key, fill_value)) = self.fill_on_contention.lock().unwrap().take() {
                        entries.insert(fill_key, (fill_value, now + Duration::from_secs(60)));
                    }
                    return Ok(false);
                }
            }
        }

        entries.insert(
            key.to_string(),
            (value.to_string(), now + Duration::from_secs(ttl_seconds)),
        );
        self.ttls.lock().unwrap().insert(key.to_string(), ttl_seconds);
        Ok(true)
    }

    async fn del(&self, key: &str) -> Result<u64> {
        self.dels.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        Ok(self.entries.lock().unwrap().remove(key).map_or(0, |_| 1))
    }

    async fn quit(&self) -> Result<()> {
        self.quits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out the same shared [`MockRemote`] on every call
pub struct MockRemoteFactory {
    remote: Arc<MockRemote>,
    pub creates: AtomicUsize,
}

impl MockRemoteFactory {
    pub fn new(remote: Arc<MockRemote>) -> Arc<Self> {
        Arc::new(Self {
            remote,
            creates: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl RemoteStoreFactory for MockRemoteFactory {
    async fn create(&self) -> Result<Arc<dyn RemoteStore>> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::clone(&self.remote) as Arc<dyn RemoteStore>)
    }
}

/// Monitoring sink that keeps every event for inspection
#[derive(Default)]
pub struct RecordingMonitor {
    events: Mutex<Vec<MonitoringEvent>>,
}

impl RecordingMonitor {
    pub fn messages(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|event| event.message.clone())
            .collect()
    }
}

impl MonitoringSink for RecordingMonitor {
    fn record_event(&self, event: MonitoringEvent) {
        self.events.lock().unwrap().push(event);
    }
}
