//! Meridian Routing Engine
//!
//! This crate provides the routing logic for Meridian:
//! - Endpoint registry
//! - Circuit breakers
//! - Health monitoring
//! - Selection strategies
//! - Metrics aggregation
//! - The router with fallback and sticky sessions

pub mod circuit_breaker;
pub mod config;
pub mod health;
pub mod metrics;
pub mod registry;
pub mod router;
pub mod strategy;

// Re-export commonly used types
pub use circuit_breaker::{
    Admission, CircuitBreaker, CircuitBreakerConfig, CircuitBreakers, CircuitSnapshot,
    CircuitState, SharedCircuitBreaker,
};
pub use config::{
    CircuitBreakerSettings, EndpointDescriptor, FallbackPolicy, HealthSettings, RouterConfig,
    StickySessionSettings,
};
pub use health::{HealthMonitor, HealthMonitorConfig, HealthRecord, HealthStatus, ProberHandle};
pub use metrics::{InFlightGuard, MetricsAggregator, MetricsSnapshot};
pub use registry::{Endpoint, EndpointRegistry};
pub use router::{Router, RouterBuilder};
pub use strategy::{LoadSignals, NoSignals, SelectionStrategy, Selector};
