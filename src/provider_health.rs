//! Per-entry provider health tracking.
//!
//! Implements a three-state lifecycle (healthy, cooldown, dead) with
//! exponential backoff. Each chain entry owns one tracker; the chain
//! consults it before every attempt and the background prober uses it to
//! decide which entries need a liveness check.

use std::sync::Mutex;
use std::time::{Duration, Instant};

// ─────────────────────────────────────────────────────────────────────────────
// Clock
// ─────────────────────────────────────────────────────────────────────────────

/// Time source for cooldown arithmetic. Injectable so tests can advance
/// time deterministically instead of sleeping.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Production clock reading `Instant::now()`.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Backoff and probing configuration for one chain entry.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Cooldown after the first failure.
    pub initial_backoff: Duration,
    /// Backoff cap.
    pub max_backoff: Duration,
    /// Consecutive failures after which the entry is dead (probe-only).
    pub max_failures: u32,
    /// Background prober cadence for this entry.
    pub check_interval: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            max_failures: 5,
            check_interval: Duration::from_secs(10),
        }
    }
}

impl HealthConfig {
    /// Replace non-positive values with defaults.
    pub fn normalized(self) -> Self {
        let defaults = Self::default();
        Self {
            initial_backoff: positive_or(self.initial_backoff, defaults.initial_backoff),
            max_backoff: positive_or(self.max_backoff, defaults.max_backoff),
            max_failures: if self.max_failures == 0 {
                defaults.max_failures
            } else {
                self.max_failures
            },
            check_interval: positive_or(self.check_interval, defaults.check_interval),
        }
    }
}

fn positive_or(value: Duration, fallback: Duration) -> Duration {
    if value.is_zero() {
        fallback
    } else {
        value
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tracker
// ─────────────────────────────────────────────────────────────────────────────

/// Health lifecycle state of a chain entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    /// Serving traffic normally.
    Healthy,
    /// Recent failure; eligible again once the cooldown is due.
    Cooldown,
    /// Failure budget exhausted; only a successful probe revives it.
    Dead,
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Cooldown => write!(f, "cooldown"),
            Self::Dead => write!(f, "dead"),
        }
    }
}

/// Observer invoked on every state transition, outside the tracker's lock.
pub type StateObserver = Box<dyn Fn(HealthState, HealthState) + Send + Sync>;

#[derive(Debug)]
struct HealthInner {
    state: HealthState,
    consecutive_failures: u32,
    current_backoff: Duration,
    cooldown_until: Option<Instant>,
}

/// Per-entry health state machine with exponential backoff.
///
/// Created healthy. Any success resets it to healthy; failures walk it
/// through cooldown toward dead. The lock is never held across I/O or the
/// observer callback.
pub struct HealthTracker {
    name: String,
    config: HealthConfig,
    clock: Box<dyn Clock>,
    inner: Mutex<HealthInner>,
    observer: Option<StateObserver>,
}

impl std::fmt::Debug for HealthTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthTracker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

impl HealthTracker {
    /// Create a tracker using the system clock.
    pub fn new(name: impl Into<String>, config: HealthConfig) -> Self {
        Self::with_clock(name, config, Box::new(SystemClock))
    }

    /// Create a tracker with an injected clock (tests).
    pub fn with_clock(name: impl Into<String>, config: HealthConfig, clock: Box<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            config: config.normalized(),
            clock,
            inner: Mutex::new(HealthInner {
                state: HealthState::Healthy,
                consecutive_failures: 0,
                current_backoff: Duration::ZERO,
                cooldown_until: None,
            }),
            observer: None,
        }
    }

    /// Attach a state-change observer (builder style).
    pub fn with_observer(mut self, observer: StateObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// The entry's configured check interval, for the prober.
    pub fn check_interval(&self) -> Duration {
        self.config.check_interval
    }

    /// Current lifecycle state.
    pub fn state(&self) -> HealthState {
        self.lock().state
    }

    /// Current consecutive-failure count.
    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    /// Whether the entry may serve a request now: healthy, or in cooldown
    /// with the cooldown due. The edge is inclusive: an entry whose
    /// cooldown expires at T is available at T.
    pub fn is_available(&self) -> bool {
        let now = self.clock.now();
        let inner = self.lock();
        match inner.state {
            HealthState::Healthy => true,
            HealthState::Cooldown => inner.cooldown_until.map_or(true, |until| now >= until),
            HealthState::Dead => false,
        }
    }

    /// Whether the background prober should exercise this entry: dead, or
    /// in cooldown with the cooldown due.
    pub fn needs_probe(&self) -> bool {
        let now = self.clock.now();
        let inner = self.lock();
        match inner.state {
            HealthState::Healthy => false,
            HealthState::Cooldown => inner.cooldown_until.map_or(true, |until| now >= until),
            HealthState::Dead => true,
        }
    }

    /// Record a successful call (or probe). Resets all counters and revives
    /// the entry from any state.
    pub fn record_success(&self) {
        let transition = {
            let mut inner = self.lock();
            let from = inner.state;
            inner.state = HealthState::Healthy;
            inner.consecutive_failures = 0;
            inner.current_backoff = Duration::ZERO;
            inner.cooldown_until = None;
            (from != HealthState::Healthy).then_some((from, HealthState::Healthy))
        };
        self.notify(transition);
    }

    /// Record a retryable failure: bump the consecutive count, extend the
    /// backoff (doubling, clamped to the cap), and move to cooldown or dead.
    pub fn record_failure(&self) {
        let now = self.clock.now();
        let (transition, failures, backoff) = {
            let mut inner = self.lock();
            let from = inner.state;
            inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
            inner.current_backoff = if inner.current_backoff.is_zero() {
                self.config.initial_backoff
            } else {
                (inner.current_backoff * 2).min(self.config.max_backoff)
            };
            inner.cooldown_until = Some(now + inner.current_backoff);
            inner.state = if inner.consecutive_failures >= self.config.max_failures {
                HealthState::Dead
            } else {
                HealthState::Cooldown
            };
            let to = inner.state;
            (
                (from != to).then_some((from, to)),
                inner.consecutive_failures,
                inner.current_backoff,
            )
        };

        if matches!(transition, Some((_, HealthState::Dead))) {
            tracing::warn!(
                entry = %self.name,
                consecutive_failures = failures,
                "Provider marked dead, waiting for probe revival"
            );
        } else {
            tracing::info!(
                entry = %self.name,
                consecutive_failures = failures,
                cooldown_secs = backoff.as_secs_f64(),
                "Provider placed in cooldown"
            );
        }
        self.notify(transition);
    }

    fn notify(&self, transition: Option<(HealthState, HealthState)>) {
        if let (Some(observer), Some((from, to))) = (&self.observer, transition) {
            observer(from, to);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HealthInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
