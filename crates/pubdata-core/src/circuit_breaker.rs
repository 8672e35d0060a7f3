use std::collections::{HashMap, VecDeque};
use std::fmt::{Display, Formatter};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Runtime circuit state for one upstream dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl Display for CircuitState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Circuit breaker thresholds and timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    /// Failures older than this are forgotten while closed.
    pub failure_window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            failure_window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitStats {
    pub key: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub total_failures: u64,
    pub total_successes: u64,
    pub rejected: u64,
    pub time_in_state_ms: u64,
}

#[derive(Debug)]
struct CircuitInner {
    state: CircuitState,
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    entered_at: Instant,
    /// Bumped on every transition; permits from an older generation are stale.
    generation: u64,
    trial_in_flight: bool,
    total_failures: u64,
    total_successes: u64,
    rejected: u64,
}

impl CircuitInner {
    fn new(now: Instant) -> Self {
        Self {
            state: CircuitState::Closed,
            failures: VecDeque::new(),
            opened_at: None,
            entered_at: now,
            generation: 0,
            trial_in_flight: false,
            total_failures: 0,
            total_successes: 0,
            rejected: 0,
        }
    }

    fn enter(&mut self, state: CircuitState, now: Instant) {
        self.state = state;
        self.entered_at = now;
        self.generation = self.generation.wrapping_add(1);
        self.trial_in_flight = false;
        match state {
            CircuitState::Open => self.opened_at = Some(now),
            CircuitState::Closed => {
                self.opened_at = None;
                self.failures.clear();
            }
            CircuitState::HalfOpen => {}
        }
    }
}

/// Thread-safe circuit breaker for one dependency.
#[derive(Debug)]
pub struct CircuitBreaker {
    key: String,
    config: CircuitBreakerConfig,
    inner: Mutex<CircuitInner>,
}

impl CircuitBreaker {
    pub fn new(key: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            key: key.into(),
            config,
            inner: Mutex::new(CircuitInner::new(Instant::now())),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub const fn config(&self) -> CircuitBreakerConfig {
        self.config
    }

    /// Admits a call, or returns `None` while the circuit is open or a
    /// half-open trial is already running.
    ///
    /// The permit should be settled with an outcome. Dropping it unsettled
    /// gives a half-open trial slot back without changing state.
    pub fn try_acquire(self: &Arc<Self>) -> Option<CircuitPermit> {
        let now = Instant::now();
        let mut inner = self.lock();
        self.advance(&mut inner, now);

        let state = inner.state;
        let trial = match state {
            CircuitState::Closed => false,
            CircuitState::HalfOpen if !inner.trial_in_flight => {
                inner.trial_in_flight = true;
                debug!(key = %self.key, "circuit admitting half-open trial");
                true
            }
            CircuitState::HalfOpen | CircuitState::Open => {
                inner.rejected += 1;
                return None;
            }
        };

        Some(CircuitPermit {
            breaker: Arc::clone(self),
            generation: inner.generation,
            trial,
            settled: false,
        })
    }

    /// Counts a success against the current state.
    pub fn record_success(&self) {
        self.settle(true, None);
    }

    /// Counts a failure against the current state.
    pub fn record_failure(&self) {
        self.settle(false, None);
    }

    /// Applies an outcome. With `issued_in`, an outcome from a permit issued
    /// before the latest transition is tallied but cannot move the state.
    fn settle(&self, success: bool, issued_in: Option<u64>) {
        let now = Instant::now();
        let mut inner = self.lock();
        if success {
            inner.total_successes += 1;
        } else {
            inner.total_failures += 1;
        }
        if issued_in.is_some_and(|generation| generation != inner.generation) {
            debug!(key = %self.key, success, "ignoring outcome from an earlier circuit generation");
            return;
        }

        if success {
            self.on_success(&mut inner, now);
        } else {
            self.on_failure(&mut inner, now);
        }
    }

    fn on_success(&self, inner: &mut CircuitInner, now: Instant) {
        let state = inner.state;
        match state {
            CircuitState::HalfOpen => {
                inner.enter(CircuitState::Closed, now);
                info!(key = %self.key, "circuit closed after successful trial");
            }
            CircuitState::Closed => inner.failures.clear(),
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self, inner: &mut CircuitInner, now: Instant) {
        let state = inner.state;
        match state {
            CircuitState::Closed => {
                if let Some(horizon) = now.checked_sub(self.config.failure_window) {
                    while inner.failures.front().is_some_and(|at| *at <= horizon) {
                        inner.failures.pop_front();
                    }
                }
                inner.failures.push_back(now);
                if inner.failures.len() >= self.config.failure_threshold as usize {
                    inner.enter(CircuitState::Open, now);
                    warn!(
                        key = %self.key,
                        failures = self.config.failure_threshold,
                        recovery_ms = self.config.recovery_timeout.as_millis() as u64,
                        "circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.failures.push_back(now);
                inner.enter(CircuitState::Open, now);
                warn!(key = %self.key, "circuit re-opened after failed trial");
            }
            CircuitState::Open => {}
        }
    }

    /// Current state, applying an elapsed recovery timeout.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.advance(&mut inner, Instant::now());
        inner.state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failures.len() as u32
    }

    pub fn opened_at(&self) -> Option<Instant> {
        self.lock().opened_at
    }

    pub fn stats(&self) -> CircuitStats {
        let now = Instant::now();
        let mut inner = self.lock();
        self.advance(&mut inner, now);
        CircuitStats {
            key: self.key.clone(),
            state: inner.state,
            failure_count: inner.failures.len() as u32,
            total_failures: inner.total_failures,
            total_successes: inner.total_successes,
            rejected: inner.rejected,
            time_in_state_ms: now.saturating_duration_since(inner.entered_at).as_millis() as u64,
        }
    }

    /// Forces the circuit closed and forgets recent failures.
    pub fn reset(&self) {
        self.lock().enter(CircuitState::Closed, Instant::now());
    }

    fn release_trial(&self, generation: u64) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen && inner.generation == generation {
            inner.trial_in_flight = false;
        }
    }

    fn advance(&self, inner: &mut CircuitInner, now: Instant) {
        if inner.state != CircuitState::Open {
            return;
        }
        let recovered = inner
            .opened_at
            .is_some_and(|opened_at| now.saturating_duration_since(opened_at) >= self.config.recovery_timeout);
        if recovered {
            inner.enter(CircuitState::HalfOpen, now);
            debug!(key = %self.key, "circuit half-open");
        }
    }

    fn lock(&self) -> MutexGuard<'_, CircuitInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Admission ticket for one call through a [`CircuitBreaker`].
#[derive(Debug)]
pub struct CircuitPermit {
    breaker: Arc<CircuitBreaker>,
    generation: u64,
    trial: bool,
    settled: bool,
}

impl CircuitPermit {
    pub const fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn record_success(mut self) {
        self.settled = true;
        self.breaker.settle(true, Some(self.generation));
    }

    pub fn record_failure(mut self) {
        self.settled = true;
        self.breaker.settle(false, Some(self.generation));
    }

    /// Ends the call without counting it either way.
    pub fn release(self) {}
}

impl Drop for CircuitPermit {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            self.breaker.release_trial(self.generation);
        }
    }
}

/// Lazily created breakers, one per dependency key.
#[derive(Debug, Default)]
pub struct CircuitRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    default: CircuitBreakerConfig,
    overrides: HashMap<String, CircuitBreakerConfig>,
}

impl CircuitRegistry {
    pub fn new(default: CircuitBreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            default,
            overrides: HashMap::new(),
        }
    }

    pub fn with_override(mut self, key: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        self.overrides.insert(key.into(), config);
        self
    }

    pub fn get(&self, key: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.get(key) {
            return Arc::clone(&breaker);
        }
        let config = self.overrides.get(key).copied().unwrap_or(self.default);
        Arc::clone(
            &self
                .breakers
                .entry(key.to_owned())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(key, config))),
        )
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    pub fn open_count(&self) -> usize {
        self.breakers
            .iter()
            .filter(|breaker| breaker.state() == CircuitState::Open)
            .count()
    }

    /// Per-breaker stats sorted by key.
    pub fn stats(&self) -> Vec<CircuitStats> {
        let mut stats: Vec<_> = self.breakers.iter().map(|breaker| breaker.stats()).collect();
        stats.sort_by(|left, right| left.key.cmp(&right.key));
        stats
    }

    pub fn reset_all(&self) {
        for breaker in self.breakers.iter() {
            breaker.reset();
        }
    }
}
