//! Circuit Breaker Implementation
//!
//! Implements the circuit breaker pattern to isolate failing endpoints.
//! The circuit breaker has three states:
//! - Closed: Normal operation, requests pass through
//! - Open: Too many failures, the endpoint is excluded from selection
//! - HalfOpen: Testing recovery, a fixed number of trial requests allowed
//!
//! State transitions:
//! - Closed → Open: After consecutive failures reach the threshold
//! - Open → HalfOpen: On the first eligibility check after the open timeout
//! - HalfOpen → Closed: On the first successful trial request
//! - HalfOpen → Open: On any failed trial request
//!
//! Every transition happens under the breaker's own mutex, so concurrent
//! outcome reports for one endpoint are linearized and can never double
//! count a transition.

use dashmap::DashMap;
use meridian_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - requests pass through
    Closed = 0,
    /// Failing - endpoint excluded from selection
    Open = 1,
    /// Testing recovery - limited trial requests allowed
    HalfOpen = 2,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit
    pub failure_threshold: u32,
    /// Duration to wait before transitioning from open to half-open
    pub open_timeout: Duration,
    /// Number of trial requests admitted while half-open
    pub half_open_max_probes: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout: Duration::from_secs(30),
            half_open_max_probes: 1,
        }
    }
}

impl CircuitBreakerConfig {
    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(Error::InvalidConfig(
                "failure_threshold must be greater than 0".to_string(),
            ));
        }
        if self.open_timeout.is_zero() {
            return Err(Error::InvalidConfig(
                "open_timeout must be greater than 0".to_string(),
            ));
        }
        if self.half_open_max_probes == 0 {
            return Err(Error::InvalidConfig(
                "half_open_max_probes must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// How a request was let through the breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Breaker closed, ordinary request
    Normal,
    /// Breaker half-open, this request consumed one probe permit
    Trial,
    /// Breaker open or out of probe permits
    Rejected,
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub opened_at: Option<Instant>,
    pub half_open_probes_remaining: u32,
    /// Number of transitions into Open since creation
    pub times_opened: u64,
}

impl Default for CircuitSnapshot {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            opened_at: None,
            half_open_probes_remaining: 0,
            times_opened: 0,
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    config: CircuitBreakerConfig,
    state: CircuitState,
    failure_count: u32,
    opened_at: Option<Instant>,
    probes_remaining: u32,
    times_opened: u64,
}

/// Circuit breaker for a single endpoint
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Create a closed circuit breaker for the named endpoint
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(BreakerState {
                config,
                state: CircuitState::Closed,
                failure_count: 0,
                opened_at: None,
                probes_remaining: 0,
                times_opened: 0,
            }),
        }
    }

    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, CircuitBreakerConfig::default())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, applying a due Open → HalfOpen transition first
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        inner.state
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        CircuitSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            opened_at: inner.opened_at,
            half_open_probes_remaining: if inner.state == CircuitState::HalfOpen {
                inner.probes_remaining
            } else {
                0
            },
            times_opened: inner.times_opened,
        }
    }

    /// Whether the endpoint may be offered to the selector
    pub fn is_eligible(&self) -> bool {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => inner.probes_remaining > 0,
            CircuitState::Open => false,
        }
    }

    /// Admit one request, consuming a probe permit when half-open
    pub fn try_acquire(&self) -> Admission {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        match inner.state {
            CircuitState::Closed => Admission::Normal,
            CircuitState::HalfOpen if inner.probes_remaining > 0 => {
                inner.probes_remaining -= 1;
                tracing::debug!(
                    endpoint = %self.name,
                    probes_remaining = inner.probes_remaining,
                    "Admitted half-open trial request"
                );
                Admission::Trial
            }
            CircuitState::HalfOpen | CircuitState::Open => Admission::Rejected,
        }
    }

    /// Give back a trial permit whose request ended without an outcome
    pub fn release(&self, admission: Admission) {
        if admission != Admission::Trial {
            return;
        }
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.probes_remaining =
                (inner.probes_remaining + 1).min(inner.config.half_open_max_probes);
        }
    }

    /// Record the outcome of a request admitted with `admission`
    pub fn record(&self, admission: Admission, success: bool) {
        let mut inner = self.lock();
        self.apply(&mut inner, admission, success);
    }

    /// Record an outcome without an explicit admission
    ///
    /// While half-open the outcome is treated as the result of a trial.
    pub fn record_outcome(&self, success: bool) {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        let admission = match inner.state {
            CircuitState::HalfOpen => Admission::Trial,
            _ => Admission::Normal,
        };
        self.apply(&mut inner, admission, success);
    }

    pub fn record_success(&self) {
        self.record_outcome(true);
    }

    pub fn record_failure(&self) {
        self.record_outcome(false);
    }

    /// Replace the thresholds; the current state is kept
    pub fn configure(&self, config: CircuitBreakerConfig) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.probes_remaining = inner.probes_remaining.min(config.half_open_max_probes);
        }
        inner.config = config;
    }

    pub fn config(&self) -> CircuitBreakerConfig {
        self.lock().config.clone()
    }

    /// Force the circuit to open (manual intervention)
    pub fn force_open(&self) {
        let mut inner = self.lock();
        self.transition_to_open(&mut inner);
    }

    /// Force the circuit to close (manual intervention)
    pub fn force_close(&self) {
        let mut inner = self.lock();
        self.transition_to_closed(&mut inner);
    }

    fn apply(&self, inner: &mut BreakerState, admission: Admission, success: bool) {
        match (inner.state, admission) {
            (CircuitState::Closed, _) => {
                if success {
                    inner.failure_count = 0;
                } else {
                    inner.failure_count = inner.failure_count.saturating_add(1);
                    if inner.failure_count >= inner.config.failure_threshold {
                        self.transition_to_open(inner);
                    }
                }
            }
            (CircuitState::HalfOpen, Admission::Trial) => {
                if success {
                    self.transition_to_closed(inner);
                } else {
                    inner.failure_count = inner.failure_count.saturating_add(1);
                    self.transition_to_open(inner);
                }
            }
            // Outcome of a request admitted before the breaker left Closed
            (CircuitState::HalfOpen, _) | (CircuitState::Open, _) => {
                tracing::trace!(
                    endpoint = %self.name,
                    state = ?inner.state,
                    success,
                    "Ignoring stale outcome"
                );
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn refresh(&self, inner: &mut BreakerState) {
        if inner.state != CircuitState::Open {
            return;
        }
        let due = inner
            .opened_at
            .is_none_or(|opened| opened.elapsed() >= inner.config.open_timeout);
        if due {
            inner.state = CircuitState::HalfOpen;
            inner.probes_remaining = inner.config.half_open_max_probes;
            tracing::info!(
                endpoint = %self.name,
                probes = inner.probes_remaining,
                "Circuit breaker half-open (testing recovery)"
            );
        }
    }

    fn transition_to_open(&self, inner: &mut BreakerState) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.probes_remaining = 0;
        inner.times_opened += 1;
        tracing::warn!(
            endpoint = %self.name,
            failures = inner.failure_count,
            timeout_ms = inner.config.open_timeout.as_millis() as u64,
            "Circuit breaker opened"
        );
    }

    fn transition_to_closed(&self, inner: &mut BreakerState) {
        let was = inner.state;
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.opened_at = None;
        inner.probes_remaining = 0;
        if was != CircuitState::Closed {
            tracing::info!(endpoint = %self.name, "Circuit breaker closed (recovered)");
        }
    }
}

/// Wrapper that can be shared across threads
pub type SharedCircuitBreaker = Arc<CircuitBreaker>;

/// Per-endpoint circuit breakers keyed by endpoint name
///
/// Endpoints without an entry are treated as closed: absence is not failure.
#[derive(Debug)]
pub struct CircuitBreakers {
    breakers: DashMap<String, SharedCircuitBreaker>,
    default_config: CircuitBreakerConfig,
}

impl CircuitBreakers {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            default_config,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }

    pub fn default_config(&self) -> &CircuitBreakerConfig {
        &self.default_config
    }

    /// Create a fresh closed breaker for an endpoint, replacing any existing one
    pub fn register(&self, name: &str, config: Option<CircuitBreakerConfig>) {
        let config = config.unwrap_or_else(|| self.default_config.clone());
        self.breakers
            .insert(name.to_string(), Arc::new(CircuitBreaker::new(name, config)));
    }

    /// Set the thresholds used for one endpoint
    pub fn configure(&self, name: &str, config: CircuitBreakerConfig) -> Result<()> {
        config.validate()?;
        match self.breakers.get(name) {
            Some(breaker) => breaker.configure(config),
            None => {
                self.breakers
                    .insert(name.to_string(), Arc::new(CircuitBreaker::new(name, config)));
            }
        }
        tracing::debug!(endpoint = %name, "Circuit breaker reconfigured");
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<SharedCircuitBreaker> {
        self.breakers.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn is_eligible(&self, name: &str) -> bool {
        self.get(name).is_none_or(|breaker| breaker.is_eligible())
    }

    pub fn current_state(&self, name: &str) -> CircuitSnapshot {
        self.get(name)
            .map(|breaker| breaker.snapshot())
            .unwrap_or_default()
    }

    /// Endpoints without a breaker are always admitted
    pub fn try_acquire(&self, name: &str) -> Admission {
        self.get(name)
            .map_or(Admission::Normal, |breaker| breaker.try_acquire())
    }

    pub fn release(&self, name: &str, admission: Admission) {
        if let Some(breaker) = self.get(name) {
            breaker.release(admission);
        }
    }

    /// Outcomes for endpoints without a breaker are dropped
    pub fn record(&self, name: &str, admission: Admission, success: bool) {
        if let Some(breaker) = self.get(name) {
            breaker.record(admission, success);
        }
    }

    pub fn record_outcome(&self, name: &str, success: bool) {
        self.get_or_create(name).record_outcome(success);
    }

    /// Returns false if the endpoint has no breaker
    pub fn force_open(&self, name: &str) -> bool {
        match self.get(name) {
            Some(breaker) => {
                breaker.force_open();
                true
            }
            None => false,
        }
    }

    /// Returns false if the endpoint has no breaker
    pub fn force_close(&self, name: &str) -> bool {
        match self.get(name) {
            Some(breaker) => {
                breaker.force_close();
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, name: &str) -> bool {
        self.breakers.remove(name).is_some()
    }

    fn get_or_create(&self, name: &str) -> SharedCircuitBreaker {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.default_config.clone())))
            .clone()
    }
}

impl Default for CircuitBreakers {
    fn default() -> Self {
        Self::with_defaults()
    }
}
