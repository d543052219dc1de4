//! Bounded in-process memory tier with TTL expiry and FIFO eviction

use crate::cache::config::{MemoryConfig, MIN_MAX_ENTRIES, MIN_SWEEP_INTERVAL};
use crate::cache::entry::CacheEntry;
use indexmap::IndexMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Process-local cache of namespaced keys
///
/// This implementation provides:
/// - Async access via RwLock
/// - Lazy TTL expiration on read plus a periodic background sweep
/// - A hard entry budget enforced on every write
///
/// Eviction removes expired entries first and then the oldest-inserted key.
/// Overwriting a key keeps its original insertion position, so this is FIFO,
/// not LRU.
pub struct MemoryCache<V> {
    store: Arc<RwLock<MemoryStore<V>>>,
    sweep_interval: Duration,
    max_entries: usize,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

/// Internal storage, kept in insertion order
struct MemoryStore<V> {
    entries: IndexMap<String, CacheEntry<V>>,
}

impl<V> MemoryStore<V> {
    fn sweep_expired(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired_at(now));
        before - self.entries.len()
    }

    fn evict_if_needed(&mut self, max_entries: usize, now: Instant) {
        if self.entries.len() <= max_entries {
            return;
        }

        let expired = self.sweep_expired(now);
        if expired > 0 {
            debug!("Dropped {} expired entries while over budget", expired);
        }

        if self.entries.len() <= max_entries {
            return;
        }

        if let Some((key, _)) = self.entries.shift_remove_index(0) {
            debug!("Evicting oldest entry due to max_entries limit: {}", key);
        }
    }
}

impl<V: Clone + Send + Sync + 'static> MemoryCache<V> {
    /// Create a new memory tier; the sweeper is not started until [`start_sweeper`](Self::start_sweeper)
    pub fn new(config: &MemoryConfig) -> Self {
        let sweep_interval = config.sweep_interval.max(MIN_SWEEP_INTERVAL);
        let max_entries = config.max_entries.max(MIN_MAX_ENTRIES);

        Self {
            store: Arc::new(RwLock::new(MemoryStore {
                entries: IndexMap::new(),
            })),
            sweep_interval,
            max_entries,
            sweeper: Mutex::new(None),
        }
    }

    /// Effective entry budget after applying the floor
    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Effective sweep interval after applying the floor
    pub fn sweep_interval(&self) -> Duration {
        self.sweep_interval
    }

    /// Get a live value, lazily dropping it if it has expired
    pub async fn get(&self, key: &str) -> Option<V> {
        let mut store = self.store.write().await;
        let now = Instant::now();

        let expired = match store.entries.get(key) {
            None => return None,
            Some(entry) => entry.is_expired_at(now),
        };

        if expired {
            debug!("Memory entry expired: {}", key);
            store.entries.shift_remove(key);
            return None;
        }

        store.entries.get(key).map(|entry| entry.value.clone())
    }

    /// Insert or overwrite a value; `ttl_seconds` is floored at one second
    pub async fn set(&self, key: &str, value: V, ttl_seconds: u64) {
        let mut store = self.store.write().await;
        let now = Instant::now();

        store
            .entries
            .insert(key.to_string(), CacheEntry::new(value, ttl_seconds, now));
        store.evict_if_needed(self.max_entries, now);
    }

    /// Remove a specific entry
    pub async fn delete(&self, key: &str) {
        let mut store = self.store.write().await;
        store.entries.shift_remove(key);
    }

    /// Get number of entries, expired-but-unswept ones included
    pub async fn len(&self) -> usize {
        self.store.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.store.read().await.entries.is_empty()
    }

    /// Spawn the background sweeper on the current tokio runtime
    ///
    /// Does nothing if a sweeper is already running or no runtime is available.
    pub fn start_sweeper(&self) {
        let mut slot = self.sweeper.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return;
        }

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!("No tokio runtime available, memory cache sweeper not started");
                return;
            }
        };

        let store = Arc::downgrade(&self.store);
        let interval = self.sweep_interval;
        let max_entries = self.max_entries;

        info!(
            "Starting memory cache sweeper (interval: {:?}, max_entries: {})",
            interval, max_entries
        );
        *slot = Some(handle.spawn(run_sweeper(store, interval, max_entries)));
    }

    /// Stop the sweeper and drop every entry
    pub async fn close(&self) {
        if let Some(handle) = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }

        let mut store = self.store.write().await;
        let count = store.entries.len();
        store.entries.clear();
        debug!("Closed memory cache, dropped {} entries", count);
    }
}

impl<V> Drop for MemoryCache<V> {
    fn drop(&mut self) {
        if let Some(handle) = self
            .sweeper
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

/// Background task for periodic cleanup; exits once the cache is dropped
async fn run_sweeper<V>(store: Weak<RwLock<MemoryStore<V>>>, interval: Duration, max_entries: usize) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let Some(store) = store.upgrade() else {
            break;
        };

        let mut store = store.write().await;
        let now = Instant::now();
        let removed = store.sweep_expired(now);
        store.evict_if_needed(max_entries, now);

        if removed > 0 {
            debug!("Memory sweeper removed {} expired entries", removed);
        }
    }
}
