//! Health Monitoring
//!
//! Tracks endpoint health from two independent sources: outcomes of real
//! requests reported by the router, and probes (on-demand via
//! [`HealthMonitor::force_check`] or periodic via
//! [`HealthMonitor::spawn_prober`]).
//!
//! Health is a soft signal. It only changes how the health-aware strategy
//! scores an endpoint; exclusion is the circuit breaker's job.

use meridian_core::{Error, RequestContext, RequestOutcome, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::circuit_breaker::{CircuitBreakers, CircuitState};
use crate::registry::{Endpoint, EndpointRegistry};

/// Health status of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Recent uptime at or above the degraded ratio
    Healthy,
    /// Still usable, but recent uptime is below the degraded ratio
    Degraded,
    /// Too many consecutive failures
    Unhealthy,
}

impl HealthStatus {
    /// Multiplier applied to an endpoint's weight by health-aware selection
    pub fn score(&self) -> f64 {
        match self {
            HealthStatus::Healthy => 1.0,
            HealthStatus::Degraded => 0.5,
            HealthStatus::Unhealthy => 0.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }
}

/// Configuration for health monitoring
#[derive(Debug, Clone, PartialEq)]
pub struct HealthMonitorConfig {
    /// Consecutive failures at which an endpoint becomes unhealthy
    pub unhealthy_threshold: u32,
    /// Uptime ratio below which an endpoint is degraded (0.0 to 1.0)
    pub degraded_ratio: f64,
    /// Number of trailing outcomes used for the uptime ratio
    pub window_size: usize,
    /// Minimum outcomes in the window before the uptime ratio is trusted
    pub min_samples: usize,
    /// Default interval of the background prober
    pub probe_interval: Duration,
    /// Timeout for a single probe
    pub probe_timeout: Duration,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            unhealthy_threshold: 3,
            degraded_ratio: 0.9,
            window_size: 100,
            min_samples: 5,
            probe_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

impl HealthMonitorConfig {
    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.unhealthy_threshold == 0 {
            return Err(Error::InvalidConfig(
                "unhealthy_threshold must be greater than 0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.degraded_ratio) {
            return Err(Error::InvalidConfig(
                "degraded_ratio must be between 0.0 and 1.0".to_string(),
            ));
        }
        if self.window_size == 0 {
            return Err(Error::InvalidConfig(
                "window_size must be greater than 0".to_string(),
            ));
        }
        if self.min_samples > self.window_size {
            return Err(Error::InvalidConfig(
                "min_samples cannot exceed window_size".to_string(),
            ));
        }
        if self.probe_interval.is_zero() || self.probe_timeout.is_zero() {
            return Err(Error::InvalidConfig(
                "probe_interval and probe_timeout must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Snapshot of an endpoint's health record
#[derive(Debug, Clone, PartialEq)]
pub struct HealthRecord {
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    pub last_success_at: Option<Instant>,
    pub last_failure_at: Option<Instant>,
    /// Successes / total over the trailing window (1.0 when empty)
    pub uptime_ratio: f64,
    /// Number of outcomes currently in the window
    pub window_len: usize,
    pub last_latency: Option<Duration>,
    pub status: HealthStatus,
}

#[derive(Debug)]
struct HealthState {
    consecutive_successes: u32,
    consecutive_failures: u32,
    last_success: Option<Instant>,
    last_failure: Option<Instant>,
    last_latency: Option<Duration>,
    window: VecDeque<bool>,
    window_successes: usize,
    status: HealthStatus,
}

impl HealthState {
    fn new(window_size: usize) -> Self {
        Self {
            consecutive_successes: 0,
            consecutive_failures: 0,
            last_success: None,
            last_failure: None,
            last_latency: None,
            window: VecDeque::with_capacity(window_size),
            window_successes: 0,
            status: HealthStatus::Healthy,
        }
    }

    fn uptime_ratio(&self) -> f64 {
        if self.window.is_empty() {
            return 1.0;
        }
        self.window_successes as f64 / self.window.len() as f64
    }

    fn push(&mut self, success: bool, latency: Duration, config: &HealthMonitorConfig) {
        let now = Instant::now();
        if success {
            self.consecutive_successes = self.consecutive_successes.saturating_add(1);
            self.consecutive_failures = 0;
            self.last_success = Some(now);
        } else {
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            self.consecutive_successes = 0;
            self.last_failure = Some(now);
        }
        self.last_latency = Some(latency);

        while self.window.len() >= config.window_size {
            if self.window.pop_front() == Some(true) {
                self.window_successes -= 1;
            }
        }
        self.window.push_back(success);
        if success {
            self.window_successes += 1;
        }

        self.status = derive_status(self, config);
    }

    fn to_record(&self) -> HealthRecord {
        HealthRecord {
            consecutive_successes: self.consecutive_successes,
            consecutive_failures: self.consecutive_failures,
            last_success_at: self.last_success,
            last_failure_at: self.last_failure,
            uptime_ratio: self.uptime_ratio(),
            window_len: self.window.len(),
            last_latency: self.last_latency,
            status: self.status,
        }
    }
}

/// Status as a pure function of the counters and thresholds
fn derive_status(state: &HealthState, config: &HealthMonitorConfig) -> HealthStatus {
    if state.consecutive_failures >= config.unhealthy_threshold {
        HealthStatus::Unhealthy
    } else if state.window.len() >= config.min_samples
        && state.uptime_ratio() < config.degraded_ratio
    {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

#[derive(Debug)]
struct EndpointHealth {
    state: Mutex<HealthState>,
}

impl EndpointHealth {
    fn new(window_size: usize) -> Self {
        Self {
            state: Mutex::new(HealthState::new(window_size)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HealthState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Health monitor for tracking endpoint health
#[derive(Debug)]
pub struct HealthMonitor {
    registry: Arc<EndpointRegistry>,
    /// Per-endpoint health records
    endpoints: RwLock<HashMap<String, Arc<EndpointHealth>>>,
    config: HealthMonitorConfig,
}

impl HealthMonitor {
    /// Create a new health monitor probing endpoints from `registry`
    pub fn new(registry: Arc<EndpointRegistry>, config: HealthMonitorConfig) -> Self {
        Self {
            registry,
            endpoints: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn with_defaults(registry: Arc<EndpointRegistry>) -> Self {
        Self::new(registry, HealthMonitorConfig::default())
    }

    pub fn config(&self) -> &HealthMonitorConfig {
        &self.config
    }

    /// Start tracking an endpoint; existing records are kept
    pub fn register(&self, name: impl Into<String>) {
        let name = name.into();
        let mut endpoints = self
            .endpoints
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        endpoints
            .entry(name.clone())
            .or_insert_with(|| Arc::new(EndpointHealth::new(self.config.window_size)));
        tracing::debug!(endpoint = %name, "Registered endpoint for health monitoring");
    }

    /// Replace an endpoint's record with a fresh one
    pub fn reset(&self, name: &str) {
        let mut endpoints = self
            .endpoints
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        endpoints.insert(
            name.to_string(),
            Arc::new(EndpointHealth::new(self.config.window_size)),
        );
        tracing::debug!(endpoint = %name, "Reset health record");
    }

    /// Stop tracking an endpoint
    pub fn remove(&self, name: &str) -> bool {
        let mut endpoints = self
            .endpoints
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        endpoints.remove(name).is_some()
    }

    /// Record the result of a health probe
    ///
    /// Outcomes for endpoints that are not registered are dropped.
    pub fn record_probe(&self, name: &str, success: bool, latency: Duration) {
        let Some(health) = self.get(name) else {
            return;
        };
        let mut state = health.lock();
        let before = state.status;
        state.push(success, latency, &self.config);
        if state.status != before {
            tracing::info!(
                endpoint = %name,
                from = before.as_str(),
                to = state.status.as_str(),
                uptime_ratio = state.uptime_ratio(),
                "Endpoint health changed"
            );
        }
    }

    /// Record the outcome of a real request
    pub fn record_outcome(&self, outcome: &RequestOutcome) {
        self.record_probe(&outcome.endpoint, outcome.success, outcome.latency);
    }

    /// Current status; endpoints without a record are healthy
    pub fn status(&self, name: &str) -> HealthStatus {
        self.get(name)
            .map(|health| health.lock().status)
            .unwrap_or(HealthStatus::Healthy)
    }

    pub fn record(&self, name: &str) -> Option<HealthRecord> {
        self.get(name).map(|health| health.lock().to_record())
    }

    pub fn endpoint_names(&self) -> Vec<String> {
        self.endpoints
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    /// Probe one endpoint now and return its resulting status
    pub async fn force_check(&self, name: &str) -> Result<HealthStatus> {
        let endpoint = self
            .registry
            .get(name)
            .ok_or_else(|| Error::EndpointNotFound(name.to_string()))?;
        if self.get(name).is_none() {
            self.register(name);
        }
        self.probe(&endpoint).await;
        Ok(self.status(name))
    }

    /// Run one probe round over enabled endpoints whose breaker is not open
    pub async fn probe_all(&self, breakers: &CircuitBreakers) {
        let targets: Vec<Arc<Endpoint>> = self
            .registry
            .list()
            .into_iter()
            .filter(|e| e.is_enabled())
            .filter(|e| breakers.current_state(e.name()).state != CircuitState::Open)
            .collect();

        tracing::trace!(endpoints = targets.len(), "Running health probe round");
        futures::future::join_all(targets.iter().map(|e| self.probe(e))).await;
    }

    /// Spawn the background prober on the current tokio runtime
    ///
    /// The prober only reads and writes health records. It stops when the
    /// returned handle is shut down or dropped.
    pub fn spawn_prober(
        self: &Arc<Self>,
        breakers: Arc<CircuitBreakers>,
        interval: Duration,
    ) -> ProberHandle {
        let monitor = Arc::clone(self);
        let token = CancellationToken::new();
        let shutdown = token.clone();
        let interval = interval.max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            tracing::info!(
                interval_ms = interval.as_millis() as u64,
                "Starting background health prober"
            );
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("Health prober shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        monitor.probe_all(&breakers).await;
                    }
                }
            }
        });

        ProberHandle {
            token,
            handle: Some(handle),
        }
    }

    async fn probe(&self, endpoint: &Endpoint) -> bool {
        let timeout = self.config.probe_timeout;
        let ctx = RequestContext::new().with_timeout(timeout);
        let started = Instant::now();

        let result =
            tokio::time::timeout(timeout, endpoint.dispatcher().health_check(ctx)).await;
        let latency = started.elapsed();

        let success = match result {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                tracing::warn!(endpoint = %endpoint.name(), error = %err, "Health probe failed");
                false
            }
            Err(_) => {
                tracing::warn!(
                    endpoint = %endpoint.name(),
                    timeout_ms = timeout.as_millis() as u64,
                    "Health probe timed out"
                );
                false
            }
        };

        self.record_probe(endpoint.name(), success, latency);
        success
    }

    fn get(&self, name: &str) -> Option<Arc<EndpointHealth>> {
        self.endpoints
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
            .cloned()
    }
}

/// Handle for the background health prober
#[derive(Debug)]
pub struct ProberHandle {
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl ProberHandle {
    /// Signal the prober to stop and wait for it to finish
    pub async fn shutdown(mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for ProberHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
