//! Remote store health tracking
//!
//! A small state machine decides whether the orchestrator should talk to the
//! remote store at all. Failures are counted since the last success; once the
//! streak reaches `failure_threshold` the remote store is bypassed for
//! `cooldown`. The cooldown is re-checked lazily on the next access, so no timer
//! is involved.
//!
//! ```text
//!   Unknown ──success──▶ Ready ──threshold failures──▶ Fallback
//!      ▲                   ▲                              │
//!      └──cooldown elapsed─┼──────────────────────────────┘
//!                          └──────────success─────────────┘
//! ```

use crate::cache::config::ResilienceConfig;
use crate::cache::telemetry::{MonitoringEvent, MonitoringSink, Severity};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Remote store health as seen by this process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResilienceMode {
    /// Tracking switched off; the remote store is always attempted
    Disabled,
    /// No recent signal, or a fallback just expired
    Unknown,
    /// Last remote operation succeeded
    Ready,
    /// Remote store bypassed until the cooldown elapses
    Fallback,
}

impl fmt::Display for ResilienceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResilienceMode::Disabled => write!(f, "disabled"),
            ResilienceMode::Unknown => write!(f, "unknown"),
            ResilienceMode::Ready => write!(f, "ready"),
            ResilienceMode::Fallback => write!(f, "fallback"),
        }
    }
}

/// Outcome of a state transition that callers may need to act on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Nothing observable changed
    Unchanged,
    /// Counters or reason changed without a mode change
    Updated,
    /// The fallback tripped; the remote client should be disposed
    FallbackActivated { reason: String },
    /// A success ended a fallback
    Restored,
    /// Some other mode change happened (first success, or cooldown expired)
    ModeChanged,
}

/// Mutable health state; transitions are the only way to change it
#[derive(Debug, Clone)]
pub struct ResilienceState {
    pub enabled: bool,
    pub mode: ResilienceMode,
    pub failure_count: u32,
    pub last_failure_at: Option<Instant>,
    pub fallback_until: Option<Instant>,
    pub reason: Option<String>,
}

impl ResilienceState {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            mode: if enabled {
                ResilienceMode::Unknown
            } else {
                ResilienceMode::Disabled
            },
            failure_count: 0,
            last_failure_at: None,
            fallback_until: None,
            reason: None,
        }
    }

    /// Count a remote failure, tripping the fallback at the threshold
    pub fn record_failure(&mut self, reason: &str, config: &ResilienceConfig, now: Instant) -> Transition {
        if !self.enabled {
            return Transition::Unchanged;
        }

        self.failure_count += 1;
        self.last_failure_at = Some(now);
        self.reason = Some(reason.to_string());

        if self.failure_count < config.failure_threshold {
            return Transition::Updated;
        }

        if self.mode == ResilienceMode::Fallback && self.fallback_until.is_some_and(|until| until > now) {
            return Transition::Updated;
        }

        self.mode = ResilienceMode::Fallback;
        self.failure_count = 0;
        self.fallback_until = Some(now + config.cooldown);
        Transition::FallbackActivated {
            reason: reason.to_string(),
        }
    }

    /// Reset the failure streak and mark the remote store healthy
    pub fn record_success(&mut self) -> Transition {
        if !self.enabled {
            return Transition::Unchanged;
        }

        let previous = self.mode;
        if previous == ResilienceMode::Ready && self.failure_count == 0 {
            return Transition::Unchanged;
        }

        self.mode = ResilienceMode::Ready;
        self.failure_count = 0;
        self.last_failure_at = None;
        self.fallback_until = None;
        self.reason = None;

        match previous {
            ResilienceMode::Fallback => Transition::Restored,
            ResilienceMode::Ready => Transition::Updated,
            _ => Transition::ModeChanged,
        }
    }

    /// Expire a fallback whose cooldown has elapsed
    pub fn refresh(&mut self, now: Instant) -> Transition {
        if !self.enabled || self.mode != ResilienceMode::Fallback {
            return Transition::Unchanged;
        }

        match self.fallback_until {
            Some(until) if now < until => Transition::Unchanged,
            _ => {
                self.mode = ResilienceMode::Unknown;
                self.fallback_until = None;
                Transition::ModeChanged
            }
        }
    }

    pub fn is_fallback(&self) -> bool {
        self.enabled && self.mode == ResilienceMode::Fallback
    }

    pub fn snapshot(&self, now: Instant) -> ResilienceSnapshot {
        ResilienceSnapshot {
            enabled: self.enabled,
            mode: self.mode,
            failure_count: self.failure_count,
            last_failure_ms_ago: self
                .last_failure_at
                .map(|at| now.saturating_duration_since(at).as_millis() as u64),
            fallback_remaining_ms: self
                .fallback_until
                .map(|until| until.saturating_duration_since(now).as_millis() as u64),
            reason: self.reason.clone(),
        }
    }
}

/// Point-in-time, serializable view of the resilience state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResilienceSnapshot {
    pub enabled: bool,
    pub mode: ResilienceMode,
    pub failure_count: u32,
    pub last_failure_ms_ago: Option<u64>,
    pub fallback_remaining_ms: Option<u64>,
    pub reason: Option<String>,
}

/// Shared tracker owning the state, its subscribers and the fallback log throttle
pub struct Resilience {
    config: ResilienceConfig,
    state: Mutex<ResilienceState>,
    last_log_at: Mutex<Option<Instant>>,
    changes: watch::Sender<ResilienceSnapshot>,
    monitor: Arc<dyn MonitoringSink>,
}

impl Resilience {
    pub fn new(config: ResilienceConfig, monitor: Arc<dyn MonitoringSink>) -> Self {
        let state = ResilienceState::new(config.enabled);
        let (changes, _) = watch::channel(state.snapshot(Instant::now()));

        Self {
            config,
            state: Mutex::new(state),
            last_log_at: Mutex::new(None),
            changes,
            monitor,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ResilienceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether remote operations should be skipped right now
    ///
    /// Expires an elapsed fallback as a side effect.
    pub fn is_fallback_active(&self) -> bool {
        let now = Instant::now();
        let mut state = self.lock();
        let transition = state.refresh(now);
        let active = state.is_fallback();
        let snapshot = state.snapshot(now);
        drop(state);

        if transition == Transition::ModeChanged {
            debug!("Remote fallback cooldown elapsed, retrying remote store");
            self.publish(snapshot);
        }
        active
    }

    /// Record a failed remote operation
    ///
    /// Returns true if this failure tripped the fallback, in which case the
    /// caller must dispose its remote client.
    pub fn record_failure(&self, reason: &str) -> bool {
        if !self.config.enabled {
            return false;
        }

        let now = Instant::now();
        let mut state = self.lock();
        let transition = state.record_failure(reason, &self.config, now);
        let snapshot = state.snapshot(now);
        drop(state);

        match transition {
            Transition::FallbackActivated { reason } => {
                self.log_throttled(&format!(
                    "Remote store unavailable ({}); using in-memory cache only",
                    reason
                ));
                self.publish(snapshot.clone());
                self.monitor.record_event(
                    MonitoringEvent::new(
                        Severity::Warning,
                        "Remote cache fallback activated",
                    )
                    .with_metadata(serde_json::json!({
                        "reason": reason,
                        "fallbackRemainingMs": snapshot.fallback_remaining_ms,
                    })),
                );
                true
            }
            _ => {
                self.publish(snapshot);
                false
            }
        }
    }

    /// Record a successful remote operation
    pub fn record_success(&self) {
        let now = Instant::now();
        let mut state = self.lock();
        let transition = state.record_success();
        let snapshot = state.snapshot(now);
        drop(state);

        match transition {
            Transition::Unchanged => {}
            Transition::Restored => {
                self.log_throttled("Remote cache connection restored");
                self.publish(snapshot);
                self.monitor.record_event(MonitoringEvent::new(
                    Severity::Info,
                    "Remote cache connection restored",
                ));
            }
            _ => self.publish(snapshot),
        }
    }

    pub fn snapshot(&self) -> ResilienceSnapshot {
        self.lock().snapshot(Instant::now())
    }

    /// Receive every state change from now on
    pub fn subscribe(&self) -> watch::Receiver<ResilienceSnapshot> {
        self.changes.subscribe()
    }

    fn publish(&self, snapshot: ResilienceSnapshot) {
        self.changes.send_replace(snapshot);
    }

    /// Log `message` unless another line went out within `log_throttle`; true if logged
    fn log_throttled(&self, message: &str) -> bool {
        let now = Instant::now();
        let mut last = self.last_log_at.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(at) = *last {
            if now.saturating_duration_since(at) < self.config.log_throttle {
                return false;
            }
        }
        *last = Some(now);
        warn!("{}", message);
        true
    }
}
