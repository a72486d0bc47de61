//! Request router
//!
//! The [`Router`] ties the registry, circuit breakers, health monitor,
//! selector and metrics together. One [`Router::dispatch`] call walks the
//! eligible set until an endpoint succeeds, the fallback policy gives up, or
//! the caller cancels.

use dashmap::DashMap;
use meridian_core::{
    CompletionRequest, CompletionResponse, Dispatcher, Error, RequestContext, RequestOutcome,
    Result,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::circuit_breaker::{Admission, CircuitBreakerConfig, CircuitBreakers, CircuitSnapshot};
use crate::config::{FallbackPolicy, RouterConfig};
use crate::health::{HealthMonitor, HealthMonitorConfig, HealthRecord, HealthStatus, ProberHandle};
use crate::metrics::{DEFAULT_LATENCY_WINDOW, MetricsAggregator, MetricsSnapshot};
use crate::registry::{Endpoint, EndpointRegistry};
use crate::strategy::{LoadSignals, SelectionStrategy, Selector};

#[derive(Debug, Clone)]
struct SessionBinding {
    endpoint: String,
    last_used: Instant,
}

/// Session key to endpoint bindings with an optional idle TTL
///
/// Expired bindings are swept from `bind` at most once per TTL, so the map
/// holds only keys bound within roughly the last two TTLs.
#[derive(Debug)]
struct StickySessions {
    ttl: Option<Duration>,
    bindings: DashMap<String, SessionBinding>,
    next_sweep: Mutex<Instant>,
}

impl StickySessions {
    fn new(ttl: Option<Duration>) -> Self {
        let next_sweep = ttl.map_or_else(Instant::now, |ttl| Instant::now() + ttl);
        Self {
            ttl,
            bindings: DashMap::new(),
            next_sweep: Mutex::new(next_sweep),
        }
    }

    fn is_expired(&self, binding: &SessionBinding, now: Instant) -> bool {
        self.ttl
            .is_some_and(|ttl| now.duration_since(binding.last_used) >= ttl)
    }

    fn lookup(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        let binding = self.bindings.get(key)?.clone();
        if self.is_expired(&binding, now) {
            self.bindings.remove(key);
            return None;
        }
        Some(binding.endpoint)
    }

    fn bind(&self, key: &str, endpoint: &str) {
        self.bindings.insert(
            key.to_string(),
            SessionBinding {
                endpoint: endpoint.to_string(),
                last_used: Instant::now(),
            },
        );
        self.sweep_if_due();
    }

    fn sweep_if_due(&self) {
        let Some(ttl) = self.ttl else {
            return;
        };
        // A concurrent binder already sweeping is good enough
        let Ok(mut next_sweep) = self.next_sweep.try_lock() else {
            return;
        };
        let now = Instant::now();
        if now < *next_sweep {
            return;
        }
        *next_sweep = now + ttl;
        drop(next_sweep);

        let pruned = self.prune();
        if pruned > 0 {
            tracing::debug!(pruned, "Swept expired sticky sessions");
        }
    }

    fn unbind_endpoint(&self, endpoint: &str) {
        self.bindings.retain(|_, binding| binding.endpoint != endpoint);
    }

    fn prune(&self) -> usize {
        let now = Instant::now();
        let before = self.bindings.len();
        self.bindings.retain(|_, binding| !self.is_expired(binding, now));
        before.saturating_sub(self.bindings.len())
    }

    fn len(&self) -> usize {
        self.bindings.len()
    }
}

/// Builder for [`Router`]
#[derive(Debug, Clone)]
pub struct RouterBuilder {
    strategy: SelectionStrategy,
    fallback: FallbackPolicy,
    max_fallback_attempts: Option<usize>,
    call_timeout: Option<Duration>,
    circuit_breaker: CircuitBreakerConfig,
    health: HealthMonitorConfig,
    sticky_sessions: Option<Option<Duration>>,
    latency_window: usize,
}

impl Default for RouterBuilder {
    fn default() -> Self {
        Self {
            strategy: SelectionStrategy::default(),
            fallback: FallbackPolicy::default(),
            max_fallback_attempts: None,
            call_timeout: None,
            circuit_breaker: CircuitBreakerConfig::default(),
            health: HealthMonitorConfig::default(),
            sticky_sessions: None,
            latency_window: DEFAULT_LATENCY_WINDOW,
        }
    }
}

impl RouterBuilder {
    pub fn strategy(mut self, strategy: SelectionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn fallback(mut self, fallback: FallbackPolicy) -> Self {
        self.fallback = fallback;
        self
    }

    /// Extra attempts after a failure; defaults to endpoint count - 1
    pub fn max_fallback_attempts(mut self, attempts: usize) -> Self {
        self.max_fallback_attempts = Some(attempts);
        self
    }

    /// Bound each adapter call; expiry counts as an endpoint failure
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    /// Breaker thresholds for endpoints without their own
    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = config;
        self
    }

    pub fn health(mut self, config: HealthMonitorConfig) -> Self {
        self.health = config;
        self
    }

    /// Pin session keys to endpoints; `None` keeps bindings until removal
    pub fn sticky_sessions(mut self, ttl: Option<Duration>) -> Self {
        self.sticky_sessions = Some(ttl);
        self
    }

    pub fn latency_window(mut self, samples: usize) -> Self {
        self.latency_window = samples;
        self
    }

    pub fn build(self) -> Result<Router> {
        self.circuit_breaker.validate()?;
        self.health.validate()?;
        if self.call_timeout.is_some_and(|t| t.is_zero()) {
            return Err(Error::InvalidConfig(
                "call_timeout must be greater than 0".to_string(),
            ));
        }
        if self.latency_window == 0 {
            return Err(Error::InvalidConfig(
                "latency_window must be greater than 0".to_string(),
            ));
        }

        let registry = Arc::new(EndpointRegistry::new());
        Ok(Router {
            health: Arc::new(HealthMonitor::new(Arc::clone(&registry), self.health)),
            registry,
            breakers: Arc::new(CircuitBreakers::new(self.circuit_breaker)),
            metrics: MetricsAggregator::new(self.latency_window),
            selector: Selector::new(self.strategy),
            sticky: self.sticky_sessions.map(StickySessions::new),
            fallback: self.fallback,
            max_fallback_attempts: self.max_fallback_attempts,
            call_timeout: self.call_timeout,
            prober: Mutex::new(None),
        })
    }
}

/// Load and health signals read from the router's own state
struct RouterSignals<'a> {
    metrics: &'a MetricsAggregator,
    health: &'a HealthMonitor,
}

impl LoadSignals for RouterSignals<'_> {
    fn in_flight(&self, endpoint: &str) -> u64 {
        self.metrics.in_flight(endpoint)
    }

    fn health(&self, endpoint: &str) -> HealthStatus {
        self.health.status(endpoint)
    }
}

/// Multi-endpoint request router
#[derive(Debug)]
pub struct Router {
    registry: Arc<EndpointRegistry>,
    breakers: Arc<CircuitBreakers>,
    health: Arc<HealthMonitor>,
    metrics: MetricsAggregator,
    selector: Selector,
    sticky: Option<StickySessions>,
    fallback: FallbackPolicy,
    max_fallback_attempts: Option<usize>,
    call_timeout: Option<Duration>,
    prober: Mutex<Option<ProberHandle>>,
}

impl Router {
    pub fn builder() -> RouterBuilder {
        RouterBuilder::default()
    }

    /// Build a router from configuration
    ///
    /// Every descriptor needs a dispatcher under the same name in
    /// `dispatchers`. Background probing is not started; call
    /// [`Router::start_health_prober`] from inside a tokio runtime.
    pub fn from_config(
        config: &RouterConfig,
        dispatchers: &HashMap<String, Arc<dyn Dispatcher>>,
    ) -> Result<Self> {
        config.validate()?;

        let mut builder = Router::builder()
            .strategy(config.strategy)
            .fallback(config.fallback)
            .circuit_breaker(CircuitBreakerConfig::from(&config.circuit_breaker))
            .health(HealthMonitorConfig::from(&config.health))
            .latency_window(config.latency_window);
        if let Some(attempts) = config.max_fallback_attempts {
            builder = builder.max_fallback_attempts(attempts);
        }
        if let Some(timeout) = config.call_timeout() {
            builder = builder.call_timeout(timeout);
        }
        if let Some(ttl) = config.sticky_ttl() {
            builder = builder.sticky_sessions(ttl);
        }
        let router = builder.build()?;

        for descriptor in &config.endpoints {
            let dispatcher = dispatchers.get(&descriptor.name).ok_or_else(|| {
                Error::InvalidConfig(format!(
                    "no dispatcher supplied for endpoint '{}'",
                    descriptor.name
                ))
            })?;

            let mut endpoint = Endpoint::new(&descriptor.name, Arc::clone(dispatcher))
                .with_weight(descriptor.weight)
                .with_priority(descriptor.priority)
                .with_enabled(descriptor.enabled);
            if let Some(settings) = &descriptor.circuit_breaker {
                endpoint = endpoint.with_circuit_breaker(CircuitBreakerConfig::from(settings));
            }
            router.add_endpoint(endpoint)?;
        }

        tracing::info!(
            endpoints = router.registry.len(),
            strategy = config.strategy.as_str(),
            fallback = config.fallback.as_str(),
            "Router configured"
        );
        Ok(router)
    }

    /// Dispatch a request to one of the configured endpoints
    ///
    /// Returns [`Error::NoEligibleEndpoints`] when nothing could be tried,
    /// [`Error::AllEndpointsFailed`] when retries are exhausted, and
    /// [`Error::Cancelled`] / [`Error::DeadlineExceeded`] when the caller's
    /// context ends first. The caller's deadline covers every attempt.
    pub async fn dispatch(
        &self,
        ctx: &RequestContext,
        request: CompletionRequest,
    ) -> Result<CompletionResponse> {
        ctx.check()?;

        let max_attempts = match self.fallback {
            FallbackPolicy::FailFast => 1,
            FallbackPolicy::RetryOtherEndpoint => {
                let extra = self
                    .max_fallback_attempts
                    .unwrap_or_else(|| self.registry.len().saturating_sub(1));
                extra.saturating_add(1)
            }
        };

        let mut attempted: Vec<String> = Vec::new();
        let mut rejected: Vec<String> = Vec::new();
        let mut last_error: Option<Error> = None;

        while attempted.len() < max_attempts {
            let eligible: Vec<Arc<Endpoint>> = self
                .registry
                .list()
                .into_iter()
                .filter(|e| e.is_enabled())
                .filter(|e| !attempted.iter().any(|name| name == e.name()))
                .filter(|e| !rejected.iter().any(|name| name == e.name()))
                .filter(|e| self.breakers.is_eligible(e.name()))
                .collect();

            if eligible.is_empty() {
                break;
            }

            let endpoint = match self.sticky_endpoint(ctx, &eligible) {
                Some(endpoint) => endpoint,
                None => self.selector.select(
                    &eligible,
                    self.selector.strategy(),
                    &self.signals(),
                )?,
            };
            let name = endpoint.name().to_string();

            let admission = self.breakers.try_acquire(&name);
            if admission == Admission::Rejected {
                tracing::debug!(endpoint = %name, "Lost half-open probe, skipping endpoint");
                rejected.push(name);
                continue;
            }

            match self.attempt(&endpoint, admission, ctx, request.clone()).await {
                Ok(mut response) => {
                    if let (Some(sticky), Some(key)) = (&self.sticky, ctx.session_key()) {
                        sticky.bind(key, &name);
                    }
                    response.served_by = Some(name);
                    return Ok(response);
                }
                Err(err) if err.is_cancellation() => return Err(err),
                Err(err) => {
                    attempted.push(name);
                    if self.fallback == FallbackPolicy::FailFast {
                        return Err(err);
                    }
                    last_error = Some(err);
                }
            }
        }

        match last_error {
            Some(last_error) => {
                tracing::warn!(
                    attempted = ?attempted,
                    error = %last_error,
                    "All attempted endpoints failed"
                );
                Err(Error::AllEndpointsFailed {
                    attempted,
                    last_error: Box::new(last_error),
                })
            }
            None => {
                tracing::warn!("No eligible endpoints for request");
                Err(Error::NoEligibleEndpoints)
            }
        }
    }

    /// One adapter call, bounded by the caller's context and the call timeout
    async fn attempt(
        &self,
        endpoint: &Endpoint,
        admission: Admission,
        ctx: &RequestContext,
        request: CompletionRequest,
    ) -> Result<CompletionResponse> {
        let name = endpoint.name();
        let in_flight = self.metrics.begin(name);
        let started = Instant::now();
        tracing::debug!(endpoint = %name, trial = admission == Admission::Trial, "Dispatching request");

        let call = endpoint.dispatcher().call(request, ctx.clone());
        let bounded = async {
            match self.call_timeout {
                Some(limit) => tokio::time::timeout(limit, call).await.unwrap_or_else(|_| {
                    Err(Error::Timeout(format!(
                        "endpoint '{}' did not respond within {}ms",
                        name,
                        limit.as_millis()
                    )))
                }),
                None => call.await,
            }
        };

        let result = tokio::select! {
            biased;
            _ = ctx.cancellation().cancelled() => Err(Error::Cancelled),
            _ = wait_for_deadline(ctx) => Err(Error::DeadlineExceeded),
            result = bounded => result,
        };
        drop(in_flight);
        let latency = started.elapsed();

        let outcome = match &result {
            Ok(_) => Some(RequestOutcome::success(name, latency)),
            Err(err) => RequestOutcome::from_error(name, latency, err),
        };

        match outcome {
            Some(outcome) => {
                if let Err(err) = &result {
                    tracing::warn!(
                        endpoint = %name,
                        error = %err,
                        latency_ms = latency.as_millis() as u64,
                        "Endpoint request failed"
                    );
                }
                self.metrics.record(&outcome);
                self.breakers.record(name, admission, outcome.success);
                self.health.record_outcome(&outcome);
            }
            None => {
                tracing::debug!(endpoint = %name, "Request cancelled by caller");
                self.breakers.release(name, admission);
                self.metrics.record_cancelled(name);
            }
        }

        result
    }

    fn sticky_endpoint(
        &self,
        ctx: &RequestContext,
        eligible: &[Arc<Endpoint>],
    ) -> Option<Arc<Endpoint>> {
        let sticky = self.sticky.as_ref()?;
        let bound = sticky.lookup(ctx.session_key()?)?;
        let endpoint = eligible.iter().find(|e| e.name() == bound)?;
        tracing::debug!(endpoint = %bound, "Using sticky session binding");
        Some(Arc::clone(endpoint))
    }

    fn signals(&self) -> RouterSignals<'_> {
        RouterSignals {
            metrics: &self.metrics,
            health: &self.health,
        }
    }

    /// Register an endpoint with fresh breaker, health and metrics state
    ///
    /// The state exists before the endpoint becomes selectable, so the first
    /// outcomes of a concurrent dispatch are never dropped.
    pub fn add_endpoint(&self, endpoint: Endpoint) -> Result<Arc<Endpoint>> {
        let name = endpoint.name().to_string();
        if self.registry.contains(&name) {
            return Err(Error::DuplicateEndpoint(name));
        }

        self.breakers.register(&name, endpoint.circuit_breaker().cloned());
        self.health.reset(&name);
        self.metrics.remove(&name);
        self.metrics.register(&name);
        self.selector.forget(&name);

        match self.registry.add(endpoint) {
            Ok(endpoint) => Ok(endpoint),
            // Lost a race to a concurrent add; the winner owns this state
            Err(err @ Error::DuplicateEndpoint(_)) => Err(err),
            Err(err) => {
                self.breakers.remove(&name);
                self.health.remove(&name);
                self.metrics.remove(&name);
                Err(err)
            }
        }
    }

    /// Remove an endpoint and everything tracked for it
    pub fn remove_endpoint(&self, name: &str) -> bool {
        if !self.registry.remove(name) {
            return false;
        }
        self.breakers.remove(name);
        self.health.remove(name);
        self.metrics.remove(name);
        self.selector.forget(name);
        if let Some(sticky) = &self.sticky {
            sticky.unbind_endpoint(name);
        }
        true
    }

    pub fn enable_endpoint(&self, name: &str) -> bool {
        self.registry.enable(name)
    }

    pub fn disable_endpoint(&self, name: &str) -> bool {
        self.registry.disable(name)
    }

    pub fn endpoints(&self) -> Vec<Arc<Endpoint>> {
        self.registry.list()
    }

    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        &self.registry
    }

    pub fn strategy(&self) -> SelectionStrategy {
        self.selector.strategy()
    }

    pub fn set_strategy(&self, strategy: SelectionStrategy) {
        self.selector.set_strategy(strategy);
    }

    pub fn fallback_policy(&self) -> FallbackPolicy {
        self.fallback
    }

    /// Replace an endpoint's breaker thresholds, keeping its current state
    pub fn configure_circuit_breaker(&self, name: &str, config: CircuitBreakerConfig) -> Result<()> {
        if !self.registry.contains(name) {
            return Err(Error::EndpointNotFound(name.to_string()));
        }
        self.breakers.configure(name, config)
    }

    pub fn circuit_state(&self, name: &str) -> CircuitSnapshot {
        self.breakers.current_state(name)
    }

    pub fn force_open(&self, name: &str) -> bool {
        self.breakers.force_open(name)
    }

    pub fn force_close(&self, name: &str) -> bool {
        self.breakers.force_close(name)
    }

    pub fn health_status(&self, name: &str) -> HealthStatus {
        self.health.status(name)
    }

    pub fn health_record(&self, name: &str) -> Option<HealthRecord> {
        self.health.record(name)
    }

    /// Probe one endpoint now
    pub async fn force_check(&self, name: &str) -> Result<HealthStatus> {
        self.health.force_check(name).await
    }

    /// Start background probing at the configured interval
    ///
    /// Must be called from within a tokio runtime. Does nothing if the
    /// prober is already running.
    pub fn start_health_prober(&self) {
        let mut prober = self.prober.lock().unwrap_or_else(|p| p.into_inner());
        if prober.as_ref().is_some_and(|handle| handle.is_running()) {
            return;
        }
        let interval = self.health.config().probe_interval;
        *prober = Some(
            self.health
                .spawn_prober(Arc::clone(&self.breakers), interval),
        );
    }

    /// Stop background probing and wait for the prober to exit
    pub async fn stop_health_prober(&self) {
        let handle = self
            .prober
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.shutdown().await;
        }
    }

    /// Drop expired sticky bindings, returning how many were removed
    pub fn prune_sessions(&self) -> usize {
        let pruned = self.sticky.as_ref().map(|s| s.prune()).unwrap_or(0);
        if pruned > 0 {
            tracing::debug!(pruned, "Pruned expired sticky sessions");
        }
        pruned
    }

    pub fn session_count(&self) -> usize {
        self.sticky.as_ref().map(|s| s.len()).unwrap_or(0)
    }

    /// Metrics for one endpoint with its circuit and health state
    pub fn snapshot(&self, name: &str) -> Option<MetricsSnapshot> {
        self.metrics
            .snapshot(name)
            .map(|snapshot| self.enrich(name, snapshot))
    }

    /// Metrics summed over every endpoint
    pub fn global_snapshot(&self) -> MetricsSnapshot {
        self.metrics.global_snapshot()
    }

    /// Enriched snapshots keyed by endpoint name
    pub fn export(&self) -> HashMap<String, MetricsSnapshot> {
        self.metrics
            .export()
            .into_iter()
            .map(|(name, snapshot)| {
                let snapshot = self.enrich(&name, snapshot);
                (name, snapshot)
            })
            .collect()
    }

    fn enrich(&self, name: &str, mut snapshot: MetricsSnapshot) -> MetricsSnapshot {
        snapshot.circuit_state = Some(self.breakers.current_state(name).state);
        snapshot.health_status = Some(self.health.status(name));
        snapshot
    }
}

async fn wait_for_deadline(ctx: &RequestContext) {
    match ctx.deadline() {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}
