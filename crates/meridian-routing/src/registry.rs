//! Endpoint Registry
//!
//! Holds the configured endpoints in registration order. The list itself is
//! behind a single `RwLock` that is only written on add/remove; the enabled
//! flag lives in an atomic on each endpoint so enabling and disabling never
//! block the selection path.

use meridian_core::{Dispatcher, Error, Result};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use crate::circuit_breaker::CircuitBreakerConfig;

/// Default selection weight
pub const DEFAULT_WEIGHT: f64 = 1.0;

/// One configured backend
pub struct Endpoint {
    name: String,
    weight: f64,
    priority: i32,
    enabled: AtomicBool,
    /// Breaker thresholds overriding the router-wide defaults
    circuit_breaker: Option<CircuitBreakerConfig>,
    dispatcher: Arc<dyn Dispatcher>,
}

impl Endpoint {
    /// Create an enabled endpoint with weight 1.0 and priority 0
    pub fn new(name: impl Into<String>, dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self {
            name: name.into(),
            weight: DEFAULT_WEIGHT,
            priority: 0,
            enabled: AtomicBool::new(true),
            circuit_breaker: None,
            dispatcher,
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    /// Lower values are preferred by priority-based selection
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_enabled(self, enabled: bool) -> Self {
        self.enabled.store(enabled, Ordering::Release);
        self
    }

    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(config);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn circuit_breaker(&self) -> Option<&CircuitBreakerConfig> {
        self.circuit_breaker.as_ref()
    }

    pub fn dispatcher(&self) -> &Arc<dyn Dispatcher> {
        &self.dispatcher
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidConfig(
                "endpoint name cannot be empty".to_string(),
            ));
        }
        if !self.weight.is_finite() || self.weight <= 0.0 {
            return Err(Error::InvalidConfig(format!(
                "endpoint '{}' weight must be a positive number, got {}",
                self.name, self.weight
            )));
        }
        if let Some(config) = &self.circuit_breaker {
            config.validate()?;
        }
        Ok(())
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.name)
            .field("weight", &self.weight)
            .field("priority", &self.priority)
            .field("enabled", &self.is_enabled())
            .field("circuit_breaker", &self.circuit_breaker)
            .finish_non_exhaustive()
    }
}

/// Registry of configured endpoints
#[derive(Debug, Default)]
pub struct EndpointRegistry {
    endpoints: RwLock<Vec<Arc<Endpoint>>>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an endpoint
    ///
    /// Fails with [`Error::DuplicateEndpoint`] if the name is taken and with
    /// [`Error::InvalidConfig`] for an empty name or a non-positive weight.
    pub fn add(&self, endpoint: Endpoint) -> Result<Arc<Endpoint>> {
        endpoint.validate()?;

        let mut endpoints = self
            .endpoints
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if endpoints.iter().any(|e| e.name == endpoint.name) {
            return Err(Error::DuplicateEndpoint(endpoint.name));
        }

        let endpoint = Arc::new(endpoint);
        endpoints.push(Arc::clone(&endpoint));
        tracing::info!(
            endpoint = %endpoint.name,
            weight = endpoint.weight,
            priority = endpoint.priority,
            "Registered endpoint"
        );
        Ok(endpoint)
    }

    /// Remove an endpoint, returning false if it was not registered
    ///
    /// In-flight requests keep their own `Arc` and finish normally.
    pub fn remove(&self, name: &str) -> bool {
        let mut endpoints = self
            .endpoints
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = endpoints.len();
        endpoints.retain(|e| e.name != name);
        let removed = endpoints.len() != before;
        if removed {
            tracing::info!(endpoint = %name, "Removed endpoint");
        }
        removed
    }

    /// Enable an endpoint, returning false if it is unknown
    pub fn enable(&self, name: &str) -> bool {
        self.set_enabled(name, true)
    }

    /// Disable an endpoint, returning false if it is unknown
    pub fn disable(&self, name: &str) -> bool {
        self.set_enabled(name, false)
    }

    /// All endpoints in registration order, enabled or not
    pub fn list(&self) -> Vec<Arc<Endpoint>> {
        self.endpoints
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<Endpoint>> {
        self.endpoints
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .find(|e| e.name == name)
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.endpoints
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        match self.get(name) {
            Some(endpoint) => {
                endpoint.set_enabled(enabled);
                tracing::info!(endpoint = %name, enabled, "Endpoint availability changed");
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_core::{CompletionRequest, CompletionResponse, RequestContext};
    use std::thread;

    struct NoopDispatcher;

    #[async_trait::async_trait]
    impl Dispatcher for NoopDispatcher {
        async fn call(
            &self,
            request: CompletionRequest,
            _ctx: RequestContext,
        ) -> Result<CompletionResponse> {
            Ok(CompletionResponse::new(request.payload))
        }
    }

    fn endpoint(name: &str) -> Endpoint {
        Endpoint::new(name, Arc::new(NoopDispatcher))
    }

    fn names(registry: &EndpointRegistry) -> Vec<String> {
        registry.list().iter().map(|e| e.name().to_string()).collect()
    }

    #[test]
    fn test_add_and_list_preserves_order() {
        let registry = EndpointRegistry::new();
        registry.add(endpoint("a")).unwrap();
        registry.add(endpoint("b")).unwrap();
        registry.add(endpoint("c")).unwrap();

        assert_eq!(names(&registry), vec!["a", "b", "c"]);
        assert_eq!(registry.len(), 3);
        assert!(registry.get("b").is_some());
        assert!(registry.get("z").is_none());
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let registry = EndpointRegistry::new();
        registry.add(endpoint("a")).unwrap();

        let err = registry.add(endpoint("a")).unwrap_err();
        assert!(matches!(err, Error::DuplicateEndpoint(name) if name == "a"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_invalid_endpoints_rejected() {
        let registry = EndpointRegistry::new();

        assert!(matches!(
            registry.add(endpoint("  ")),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(
            registry.add(endpoint("zero").with_weight(0.0)),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(
            registry.add(endpoint("neg").with_weight(-2.0)),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(
            registry.add(endpoint("nan").with_weight(f64::NAN)),
            Err(Error::InvalidConfig(_))
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_remove_unknown_is_noop() {
        let registry = EndpointRegistry::new();
        registry.add(endpoint("a")).unwrap();

        assert!(!registry.remove("missing"));
        assert!(registry.remove("a"));
        assert!(!registry.remove("a"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_enable_disable() {
        let registry = EndpointRegistry::new();
        let a = registry.add(endpoint("a")).unwrap();
        assert!(a.is_enabled());

        assert!(registry.disable("a"));
        assert!(!a.is_enabled());
        assert!(!registry.get("a").unwrap().is_enabled());

        assert!(registry.enable("a"));
        assert!(a.is_enabled());

        assert!(!registry.disable("missing"));
    }

    #[test]
    fn test_endpoint_builder() {
        let e = endpoint("primary")
            .with_weight(3.5)
            .with_priority(2)
            .with_enabled(false);
        assert_eq!(e.name(), "primary");
        assert_eq!(e.weight(), 3.5);
        assert_eq!(e.priority(), 2);
        assert!(!e.is_enabled());

        let debug = format!("{:?}", e);
        assert!(debug.contains("primary"));
    }

    #[test]
    fn test_concurrent_mutation_and_reads() {
        let registry = Arc::new(EndpointRegistry::new());
        let mut handles = vec![];

        for i in 0..8 {
            let registry = Arc::clone(&registry);
            handles.push(thread::spawn(move || {
                let name = format!("e{}", i);
                registry.add(endpoint(&name)).unwrap();
                for _ in 0..100 {
                    registry.disable(&name);
                    let _ = registry.list();
                    registry.enable(&name);
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry.len(), 8);
        assert!(registry.list().iter().all(|e| e.is_enabled()));
    }
}
