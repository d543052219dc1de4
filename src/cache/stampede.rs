//! Stampede protection for `remember`
//!
//! Three layers keep a cold key from being recomputed by every caller at once:
//!
//! 1. An in-flight table coalesces concurrent loads of one key inside this
//!    process onto a single shared future.
//! 2. A lock at `"{namespaced_key}:lock"` elects one recomputer across
//!    processes. The lock lives in the remote store when it is reachable and in
//!    a local table otherwise.
//! 3. Callers that lose the election poll the cache until the winner's value
//!    appears. When `max_wait` runs out they recompute anyway.
//!
//! Values written by a load get a jittered TTL so keys filled together do not
//! expire together.

use crate::cache::config::{StampedeConfig, MAX_TTL_SECONDS};
use crate::cache::orchestrator::CacheInner;
use crate::cache::remote::SetCondition;
use crate::cache::types::lock_key;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use rand::Rng;
use serde_json::Value;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// Result of a load as seen by every caller sharing it
pub type LoadResult = std::result::Result<Value, Arc<anyhow::Error>>;

/// A load that any number of callers can await
pub type SharedLoad = Shared<BoxFuture<'static, LoadResult>>;

/// Outcome of one lock attempt; released exactly once
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockHandle {
    NotAcquired,
    Remote { lock_key: String, token: String },
    Local { lock_key: String },
}

impl LockHandle {
    pub fn is_acquired(&self) -> bool {
        !matches!(self, LockHandle::NotAcquired)
    }
}

/// Process-local recomputation locks, used while the remote store is out of reach
#[derive(Debug, Default)]
pub struct LocalLockTable {
    locks: DashMap<String, Instant>,
}

impl LocalLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock unless an unexpired holder exists
    pub fn try_acquire(&self, lock_key: &str, ttl: Duration) -> bool {
        let now = Instant::now();
        self.sweep(now);

        match self.locks.entry(lock_key.to_string()) {
            Entry::Occupied(mut held) => {
                if *held.get() > now {
                    return false;
                }
                held.insert(now + ttl);
                true
            }
            Entry::Vacant(slot) => {
                slot.insert(now + ttl);
                true
            }
        }
    }

    pub fn release(&self, lock_key: &str) {
        self.locks.remove(lock_key);
    }

    /// Drop every lock whose expiry has passed
    pub fn sweep(&self, now: Instant) {
        self.locks.retain(|_, expires_at| *expires_at > now);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    pub fn clear(&self) {
        self.locks.clear();
    }
}

struct InFlight {
    id: u64,
    load: SharedLoad,
}

/// Loads currently running in this process, keyed by namespaced key
#[derive(Default)]
pub struct InFlightTable {
    loads: DashMap<String, InFlight>,
    next_id: AtomicU64,
}

impl InFlightTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the running load for `key`, or register the one built by `start`
    ///
    /// `start` receives the id the load must pass to [`InFlightTable::finish`].
    /// It runs under the table's shard lock, so it must only build the future.
    pub fn join_or_start<F>(&self, key: &str, start: F) -> SharedLoad
    where
        F: FnOnce(u64) -> SharedLoad,
    {
        match self.loads.entry(key.to_string()) {
            Entry::Occupied(running) => {
                debug!(key = %key, "Joining in-flight load");
                running.get().load.clone()
            }
            Entry::Vacant(slot) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let load = start(id);
                slot.insert(InFlight {
                    id,
                    load: load.clone(),
                });
                load
            }
        }
    }

    /// Unregister the load `id` if it is still the one registered for `key`
    pub fn finish(&self, key: &str, id: u64) {
        self.loads.remove_if(key, |_, running| running.id == id);
    }

    pub fn len(&self) -> usize {
        self.loads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loads.is_empty()
    }

    pub fn clear(&self) {
        self.loads.clear();
    }
}

/// Upper bound of the jitter subtracted from `ttl_seconds`
pub fn jitter_cap(ttl_seconds: u64, config: &StampedeConfig) -> u64 {
    let by_percent = (ttl_seconds as f64 * config.max_jitter_percent).floor();
    if by_percent <= 0.0 {
        return 0;
    }
    (by_percent as u64).min(config.max_jitter_seconds)
}

/// Shorten a TTL by a random amount within the jitter cap, never below 1s
pub fn apply_safe_ttl(ttl_seconds: u64, config: &StampedeConfig) -> u64 {
    let cap = jitter_cap(ttl_seconds, config);
    if cap == 0 {
        return ttl_seconds;
    }

    let jitter = rand::thread_rng().gen_range(0..=cap);
    ttl_seconds.saturating_sub(jitter).max(1)
}

impl CacheInner {
    /// Try to become the recomputer of `namespaced_key`
    pub(crate) async fn acquire_lock(&self, namespaced_key: &str) -> LockHandle {
        let lock_key = lock_key(namespaced_key);
        let lock_ttl = self.config.stampede.lock_ttl_seconds.max(1);

        if let Some(remote) = self.remote().await {
            let token = Uuid::new_v4().to_string();
            match remote
                .set(&lock_key, &token, lock_ttl, SetCondition::IfAbsent)
                .await
            {
                Ok(true) => {
                    self.resilience.record_success();
                    debug!(lock_key = %lock_key, "Acquired remote stampede lock");
                    return LockHandle::Remote { lock_key, token };
                }
                Ok(false) => {
                    self.resilience.record_success();
                    return LockHandle::NotAcquired;
                }
                Err(e) => self.record_remote_failure("lock", &lock_key, &e),
            }
        }

        if self
            .local_locks
            .try_acquire(&lock_key, Duration::from_secs(lock_ttl))
        {
            debug!(lock_key = %lock_key, "Acquired local stampede lock");
            LockHandle::Local { lock_key }
        } else {
            LockHandle::NotAcquired
        }
    }

    /// Release a lock handle; failures are logged and left to the lock TTL
    pub(crate) async fn release_lock(&self, handle: LockHandle) {
        match handle {
            LockHandle::NotAcquired => {}
            LockHandle::Local { lock_key } => self.local_locks.release(&lock_key),
            LockHandle::Remote { lock_key, token } => {
                let Some(remote) = self.current_client() else {
                    debug!(lock_key = %lock_key, "Remote client gone, leaving lock to expire");
                    return;
                };
                match remote.release_lock(&lock_key, &token).await {
                    Ok(released) => {
                        if !released {
                            debug!(lock_key = %lock_key, "Stampede lock already expired or taken over");
                        }
                    }
                    Err(e) => warn!(lock_key = %lock_key, error = %e, "Failed to release stampede lock"),
                }
            }
        }
    }

    /// Poll the cache until a value appears or `max_wait` runs out
    async fn wait_for_value(&self, key: &str) -> Option<Value> {
        let deadline = Instant::now() + self.config.stampede.max_wait;

        loop {
            if let Some(value) = self.get_value(key).await {
                return Some(value);
            }

            let now = Instant::now();
            if now >= deadline {
                return None;
            }

            let pause = self.config.stampede.wait_interval.min(deadline - now);
            tokio::time::sleep(pause).await;
        }
    }

    /// Recompute `key` under the stampede lock and write the result
    pub(crate) async fn load<F, Fut>(&self, key: &str, ttl_seconds: u64, factory: F) -> LoadResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Value>>,
    {
        let namespaced = self.namespaced(key);

        let mut handle = self.acquire_lock(&namespaced).await;
        if !handle.is_acquired() {
            if let Some(value) = self.wait_for_value(key).await {
                debug!(key = %key, "Observed value computed by lock holder");
                return Ok(value);
            }

            debug!(key = %key, "Stampede wait timed out, recomputing");
            handle = self.acquire_lock(&namespaced).await;
        }

        // A panicking factory still has to give the lock back
        let outcome = match AssertUnwindSafe(async move { factory().await }).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(_) => Err(anyhow::anyhow!("cache loader panicked")),
        };
        if let Ok(value) = &outcome {
            let ttl = apply_safe_ttl(ttl_seconds.clamp(1, MAX_TTL_SECONDS), &self.config.stampede);
            self.set_value(key, value, ttl).await;
        }

        self.release_lock(handle).await;
        outcome.map_err(|e| {
            warn!(key = %key, error = %e, "Cache loader failed");
            Arc::new(e)
        })
    }

    /// Shared load for `key`, starting one if none is running
    pub(crate) fn inflight_load<F, Fut>(self: &Arc<Self>, key: &str, ttl_seconds: u64, factory: F) -> SharedLoad
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let namespaced = self.namespaced(key);
        self.inflight.join_or_start(&namespaced, |id| {
            let inner = Arc::clone(self);
            let key = key.to_string();
            let namespaced = namespaced.clone();

            async move {
                // Spawned so a started load runs to completion even if every caller goes away
                let loader = Arc::clone(&inner);
                let loader_key = namespaced.clone();
                let task = tokio::spawn(async move {
                    let result = loader.load(&key, ttl_seconds, factory).await;
                    loader.inflight.finish(&loader_key, id);
                    result
                });

                let result = match task.await {
                    Ok(result) => result,
                    Err(e) => Err(Arc::new(anyhow::anyhow!("cache loader task failed: {}", e))),
                };

                // The task may have died before unregistering; finish ignores a stale id
                inner.inflight.finish(&namespaced, id);
                result
            }
            .boxed()
            .shared()
        })
    }
}
