//! Prometheus export of router metrics
//!
//! The router keeps its own counters; this exporter mirrors them into
//! Prometheus gauges from [`MetricsSnapshot`]s each time [`update`] runs.
//!
//! [`update`]: PrometheusExporter::update

use meridian_routing::{CircuitState, HealthStatus, MetricsSnapshot, Router};
use prometheus::{GaugeVec, Opts, Registry, TextEncoder};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Result;

/// Prometheus gauges for every endpoint
#[derive(Clone)]
pub struct PrometheusExporter {
    registry: Arc<Registry>,

    /// Completed requests by result (success, failure, cancelled)
    ///
    /// A gauge mirroring the router's own counters, so no `_total` suffix.
    pub requests: GaugeVec,
    /// Success rate (0.0-1.0)
    pub success_rate: GaugeVec,
    /// Latency percentiles in milliseconds
    pub latency_ms: GaugeVec,
    /// Circuit state (0=closed, 1=open, 2=half-open)
    pub circuit_state: GaugeVec,
    /// Health status (0=unknown, 1=healthy, 2=degraded, 3=unhealthy)
    pub health_status: GaugeVec,
    /// Requests currently in flight
    pub in_flight: GaugeVec,
}

impl PrometheusExporter {
    /// Create an exporter with its own registry
    pub fn new() -> Result<Self> {
        Self::with_registry(Registry::new())
    }

    /// Create an exporter registering into an existing registry
    pub fn with_registry(registry: Registry) -> Result<Self> {
        let requests = GaugeVec::new(
            Opts::new(
                "meridian_endpoint_requests",
                "Requests completed by an endpoint",
            ),
            &["endpoint", "result"],
        )?;

        let success_rate = GaugeVec::new(
            Opts::new(
                "meridian_endpoint_success_rate",
                "Endpoint success rate (0.0-1.0)",
            ),
            &["endpoint"],
        )?;

        let latency_ms = GaugeVec::new(
            Opts::new(
                "meridian_endpoint_latency_ms",
                "Endpoint latency percentiles in milliseconds",
            ),
            &["endpoint", "quantile"],
        )?;

        let circuit_state = GaugeVec::new(
            Opts::new(
                "meridian_endpoint_circuit_state",
                "Circuit breaker state (0=closed, 1=open, 2=half-open)",
            ),
            &["endpoint"],
        )?;

        let health_status = GaugeVec::new(
            Opts::new(
                "meridian_endpoint_health_status",
                "Endpoint health (0=unknown, 1=healthy, 2=degraded, 3=unhealthy)",
            ),
            &["endpoint"],
        )?;

        let in_flight = GaugeVec::new(
            Opts::new(
                "meridian_endpoint_in_flight",
                "Requests currently in flight",
            ),
            &["endpoint"],
        )?;

        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(success_rate.clone()))?;
        registry.register(Box::new(latency_ms.clone()))?;
        registry.register(Box::new(circuit_state.clone()))?;
        registry.register(Box::new(health_status.clone()))?;
        registry.register(Box::new(in_flight.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            requests,
            success_rate,
            latency_ms,
            circuit_state,
            health_status,
            in_flight,
        })
    }

    /// Get the Prometheus registry for exporting metrics
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Replace all gauges with the given snapshots
    ///
    /// Endpoints missing from `snapshots` disappear from the output.
    pub fn update(&self, snapshots: &HashMap<String, MetricsSnapshot>) {
        self.requests.reset();
        self.success_rate.reset();
        self.latency_ms.reset();
        self.circuit_state.reset();
        self.health_status.reset();
        self.in_flight.reset();

        for (endpoint, snapshot) in snapshots {
            let name = endpoint.as_str();
            for (result, value) in [
                ("success", snapshot.successes),
                ("failure", snapshot.failures),
                ("cancelled", snapshot.cancellations),
            ] {
                self.requests
                    .with_label_values(&[name, result])
                    .set(value as f64);
            }

            self.success_rate
                .with_label_values(&[name])
                .set(snapshot.success_rate);

            for (quantile, value) in [
                ("0.5", snapshot.p50_latency_ms),
                ("0.95", snapshot.p95_latency_ms),
                ("0.99", snapshot.p99_latency_ms),
            ] {
                self.latency_ms
                    .with_label_values(&[name, quantile])
                    .set(value);
            }

            if let Some(state) = snapshot.circuit_state {
                self.circuit_state
                    .with_label_values(&[name])
                    .set(circuit_state_value(state));
            }
            self.health_status
                .with_label_values(&[name])
                .set(health_status_value(snapshot.health_status));
            self.in_flight
                .with_label_values(&[name])
                .set(snapshot.in_flight as f64);
        }
    }

    /// Pull the current export from a router
    pub fn observe(&self, router: &Router) {
        self.update(&router.export());
    }

    /// Render the registry in the Prometheus text exposition format
    pub fn render(&self) -> Result<String> {
        let families = self.registry.gather();
        Ok(TextEncoder::new().encode_to_string(&families)?)
    }
}

fn circuit_state_value(state: CircuitState) -> f64 {
    match state {
        CircuitState::Closed => 0.0,
        CircuitState::Open => 1.0,
        CircuitState::HalfOpen => 2.0,
    }
}

fn health_status_value(status: Option<HealthStatus>) -> f64 {
    match status {
        None => 0.0,
        Some(HealthStatus::Healthy) => 1.0,
        Some(HealthStatus::Degraded) => 2.0,
        Some(HealthStatus::Unhealthy) => 3.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests: 10,
            successes: 8,
            failures: 2,
            cancellations: 1,
            success_rate: 0.8,
            p50_latency_ms: 12.0,
            p95_latency_ms: 40.0,
            p99_latency_ms: 95.0,
            in_flight: 3,
            circuit_state: Some(CircuitState::HalfOpen),
            health_status: Some(HealthStatus::Degraded),
            ..Default::default()
        }
    }

    #[test]
    fn test_exporter_creation() {
        let exporter = PrometheusExporter::new().unwrap();
        assert!(!exporter.render().unwrap().contains("endpoint="));
    }

    #[test]
    fn test_update_sets_gauges() {
        let exporter = PrometheusExporter::new().unwrap();
        let mut snapshots = HashMap::new();
        snapshots.insert("primary".to_string(), snapshot());
        exporter.update(&snapshots);

        assert_eq!(
            exporter
                .requests
                .with_label_values(&["primary", "success"])
                .get(),
            8.0
        );
        assert_eq!(
            exporter
                .requests
                .with_label_values(&["primary", "cancelled"])
                .get(),
            1.0
        );
        assert_eq!(
            exporter
                .latency_ms
                .with_label_values(&["primary", "0.99"])
                .get(),
            95.0
        );
        assert_eq!(exporter.circuit_state.with_label_values(&["primary"]).get(), 2.0);
        assert_eq!(exporter.health_status.with_label_values(&["primary"]).get(), 2.0);
        assert_eq!(exporter.in_flight.with_label_values(&["primary"]).get(), 3.0);
        assert_eq!(exporter.success_rate.with_label_values(&["primary"]).get(), 0.8);
    }

    #[test]
    fn test_render_text_format() {
        let exporter = PrometheusExporter::new().unwrap();
        let mut snapshots = HashMap::new();
        snapshots.insert("primary".to_string(), snapshot());
        exporter.update(&snapshots);

        let text = exporter.render().unwrap();
        assert!(text.contains("meridian_endpoint_requests{endpoint=\"primary\",result=\"success\"} 8"));
        assert!(!text.contains("_total"));
        assert!(text.contains("meridian_endpoint_latency_ms{endpoint=\"primary\",quantile=\"0.95\"} 40"));
        assert!(text.contains("meridian_endpoint_circuit_state{endpoint=\"primary\"} 2"));
    }

    #[test]
    fn test_update_drops_removed_endpoints() {
        let exporter = PrometheusExporter::new().unwrap();
        let mut snapshots = HashMap::new();
        snapshots.insert("old".to_string(), snapshot());
        exporter.update(&snapshots);
        assert!(exporter.render().unwrap().contains("endpoint=\"old\""));

        snapshots.clear();
        snapshots.insert("new".to_string(), MetricsSnapshot::default());
        exporter.update(&snapshots);

        let text = exporter.render().unwrap();
        assert!(!text.contains("endpoint=\"old\""));
        assert!(text.contains("meridian_endpoint_health_status{endpoint=\"new\"} 0"));
    }

    #[test]
    fn test_shared_registry_rejects_duplicates() {
        let registry = Registry::new();
        let first = PrometheusExporter::with_registry(registry.clone());
        assert!(first.is_ok());
        assert!(PrometheusExporter::with_registry(registry).is_err());
    }
}
