//! Metrics Aggregation
//!
//! Per-endpoint request counters and a bounded latency window. Each
//! endpoint's counters and window live behind one short mutex, so a
//! snapshot is always an internally consistent copy. In-flight requests are
//! tracked separately with an atomic gauge.

use dashmap::DashMap;
use meridian_core::{ErrorKind, RequestOutcome};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::circuit_breaker::CircuitState;
use crate::health::HealthStatus;

/// Default number of latency samples kept per endpoint
pub const DEFAULT_LATENCY_WINDOW: usize = 1024;

/// Point-in-time metrics for one endpoint or for the whole router
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub successes: u64,
    pub failures: u64,
    /// Cancelled or deadline-expired calls; not part of the other counters
    pub cancellations: u64,
    /// successes / total_requests, 0.0 before the first request
    pub success_rate: f64,
    pub p50_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub in_flight: u64,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub failures_by_kind: HashMap<ErrorKind, u64>,
    /// Filled in by the router
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_state: Option<CircuitState>,
    /// Filled in by the router
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_status: Option<HealthStatus>,
}

#[derive(Debug)]
struct Counters {
    total: u64,
    successes: u64,
    failures: u64,
    cancellations: u64,
    failures_by_kind: HashMap<ErrorKind, u64>,
    /// Latencies in milliseconds, oldest first
    latencies: VecDeque<f64>,
}

impl Counters {
    fn new(window: usize) -> Self {
        Self {
            total: 0,
            successes: 0,
            failures: 0,
            cancellations: 0,
            failures_by_kind: HashMap::new(),
            latencies: VecDeque::with_capacity(window),
        }
    }
}

#[derive(Debug)]
struct EndpointMetrics {
    counters: Mutex<Counters>,
    in_flight: AtomicU64,
    window: usize,
}

impl EndpointMetrics {
    fn new(window: usize) -> Self {
        Self {
            counters: Mutex::new(Counters::new(window)),
            in_flight: AtomicU64::new(0),
            window,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Counters> {
        self.counters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, outcome: &RequestOutcome) {
        let mut counters = self.lock();
        counters.total += 1;
        if outcome.success {
            counters.successes += 1;
        } else {
            counters.failures += 1;
            let kind = outcome.error_kind.unwrap_or(ErrorKind::Other);
            *counters.failures_by_kind.entry(kind).or_insert(0) += 1;
        }

        while counters.latencies.len() >= self.window {
            counters.latencies.pop_front();
        }
        counters.latencies.push_back(millis(outcome.latency));
    }

    /// Consistent copy of the counters plus the current in-flight gauge
    fn snapshot(&self) -> (MetricsSnapshot, Vec<f64>) {
        let (mut snapshot, latencies) = {
            let counters = self.lock();
            let snapshot = MetricsSnapshot {
                total_requests: counters.total,
                successes: counters.successes,
                failures: counters.failures,
                cancellations: counters.cancellations,
                failures_by_kind: counters.failures_by_kind.clone(),
                ..Default::default()
            };
            (snapshot, counters.latencies.iter().copied().collect::<Vec<_>>())
        };
        snapshot.in_flight = self.in_flight.load(Ordering::Acquire);
        (snapshot, latencies)
    }
}

/// Decrements the in-flight gauge when dropped
#[derive(Debug)]
#[must_use = "the request stops counting as in flight when the guard is dropped"]
pub struct InFlightGuard {
    metrics: Arc<EndpointMetrics>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.metrics.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Aggregates request outcomes per endpoint
#[derive(Debug)]
pub struct MetricsAggregator {
    endpoints: DashMap<String, Arc<EndpointMetrics>>,
    window: usize,
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_LATENCY_WINDOW)
    }
}

impl MetricsAggregator {
    /// Create an aggregator keeping `window` latency samples per endpoint
    pub fn new(window: usize) -> Self {
        Self {
            endpoints: DashMap::new(),
            window: window.max(1),
        }
    }

    /// Start tracking an endpoint; existing counters are kept
    pub fn register(&self, name: &str) {
        self.endpoints
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(EndpointMetrics::new(self.window)));
    }

    /// Record a completed call
    ///
    /// Outcomes for endpoints that are not registered are dropped.
    pub fn record(&self, outcome: &RequestOutcome) {
        if let Some(metrics) = self.get(&outcome.endpoint) {
            metrics.record(outcome);
        }
    }

    /// Record a cancelled or deadline-expired call
    pub fn record_cancelled(&self, name: &str) {
        if let Some(metrics) = self.get(name) {
            metrics.lock().cancellations += 1;
        }
    }

    /// Mark a request as in flight until the guard is dropped
    pub fn begin(&self, name: &str) -> InFlightGuard {
        let metrics = self
            .get(name)
            .unwrap_or_else(|| Arc::new(EndpointMetrics::new(1)));
        metrics.in_flight.fetch_add(1, Ordering::AcqRel);
        InFlightGuard { metrics }
    }

    pub fn in_flight(&self, name: &str) -> u64 {
        self.get(name)
            .map(|m| m.in_flight.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    pub fn snapshot(&self, name: &str) -> Option<MetricsSnapshot> {
        self.get(name).map(|metrics| {
            let (mut snapshot, mut latencies) = metrics.snapshot();
            fill_derived(&mut snapshot, &mut latencies);
            snapshot
        })
    }

    /// Sum over all endpoints, with percentiles over every endpoint's window
    pub fn global_snapshot(&self) -> MetricsSnapshot {
        let mut global = MetricsSnapshot::default();
        let mut latencies = Vec::new();

        for metrics in self.shards() {
            let (snapshot, samples) = metrics.snapshot();
            global.total_requests += snapshot.total_requests;
            global.successes += snapshot.successes;
            global.failures += snapshot.failures;
            global.cancellations += snapshot.cancellations;
            global.in_flight += snapshot.in_flight;
            for (kind, n) in snapshot.failures_by_kind {
                *global.failures_by_kind.entry(kind).or_insert(0) += n;
            }
            latencies.extend(samples);
        }

        fill_derived(&mut global, &mut latencies);
        global
    }

    /// Snapshot of every tracked endpoint keyed by name
    pub fn export(&self) -> HashMap<String, MetricsSnapshot> {
        let names: Vec<String> = self.endpoints.iter().map(|e| e.key().clone()).collect();
        names
            .into_iter()
            .filter_map(|name| self.snapshot(&name).map(|s| (name, s)))
            .collect()
    }

    /// Stop tracking an endpoint
    pub fn remove(&self, name: &str) -> bool {
        self.endpoints.remove(name).is_some()
    }

    fn get(&self, name: &str) -> Option<Arc<EndpointMetrics>> {
        self.endpoints.get(name).map(|e| Arc::clone(e.value()))
    }

    fn shards(&self) -> Vec<Arc<EndpointMetrics>> {
        // Clone out so no shard lock is held while taking endpoint locks
        self.endpoints.iter().map(|e| Arc::clone(e.value())).collect()
    }
}

fn millis(latency: Duration) -> f64 {
    latency.as_secs_f64() * 1000.0
}

fn fill_derived(snapshot: &mut MetricsSnapshot, latencies: &mut [f64]) {
    snapshot.success_rate = if snapshot.total_requests == 0 {
        0.0
    } else {
        snapshot.successes as f64 / snapshot.total_requests as f64
    };

    latencies.sort_by(|a, b| a.total_cmp(b));
    snapshot.p50_latency_ms = percentile(latencies, 50.0);
    snapshot.p95_latency_ms = percentile(latencies, 95.0);
    snapshot.p99_latency_ms = percentile(latencies, 99.0);
}

/// Nearest-rank percentile over sorted samples
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn aggregator(names: &[&str]) -> MetricsAggregator {
        let metrics = MetricsAggregator::default();
        for name in names {
            metrics.register(name);
        }
        metrics
    }

    #[test]
    fn test_percentile_nearest_rank() {
        let samples: Vec<f64> = (1..=100).map(|n| n as f64).collect();
        assert_eq!(percentile(&samples, 50.0), 50.0);
        assert_eq!(percentile(&samples, 95.0), 95.0);
        assert_eq!(percentile(&samples, 99.0), 99.0);

        assert_eq!(percentile(&[7.0], 50.0), 7.0);
        assert_eq!(percentile(&[7.0], 99.0), 7.0);
        assert_eq!(percentile(&[], 99.0), 0.0);
    }

    #[test]
    fn test_record_counts() {
        let metrics = aggregator(&["a"]);
        metrics.record(&RequestOutcome::success("a", ms(10)));
        metrics.record(&RequestOutcome::success("a", ms(20)));
        metrics.record(&RequestOutcome::failure("a", ms(30), ErrorKind::Timeout));
        metrics.record(&RequestOutcome::failure("a", ms(40), ErrorKind::Status));
        metrics.record_cancelled("a");

        let snapshot = metrics.snapshot("a").unwrap();
        assert_eq!(snapshot.total_requests, 4);
        assert_eq!(snapshot.successes, 2);
        assert_eq!(snapshot.failures, 2);
        assert_eq!(snapshot.cancellations, 1);
        assert_eq!(snapshot.success_rate, 0.5);
        assert_eq!(snapshot.failures_by_kind[&ErrorKind::Timeout], 1);
        assert_eq!(snapshot.failures_by_kind[&ErrorKind::Status], 1);
        assert_eq!(snapshot.p50_latency_ms, 20.0);
        assert_eq!(snapshot.p99_latency_ms, 40.0);
        assert!(snapshot.circuit_state.is_none());
    }

    #[test]
    fn test_empty_snapshot() {
        let metrics = aggregator(&["a"]);
        let snapshot = metrics.snapshot("a").unwrap();
        assert_eq!(snapshot, MetricsSnapshot::default());
        assert!(metrics.snapshot("missing").is_none());
    }

    #[test]
    fn test_unregistered_outcomes_dropped() {
        let metrics = MetricsAggregator::default();
        metrics.record(&RequestOutcome::success("ghost", ms(1)));
        metrics.record_cancelled("ghost");
        assert!(metrics.snapshot("ghost").is_none());
        assert!(metrics.export().is_empty());
    }

    #[test]
    fn test_latency_window_bounded() {
        let metrics = MetricsAggregator::new(10);
        metrics.register("a");
        for n in 1..=100 {
            metrics.record(&RequestOutcome::success("a", ms(n)));
        }

        let snapshot = metrics.snapshot("a").unwrap();
        assert_eq!(snapshot.total_requests, 100);
        // Only samples 91..=100 remain
        assert_eq!(snapshot.p50_latency_ms, 95.0);
        assert_eq!(snapshot.p99_latency_ms, 100.0);
    }

    #[test]
    fn test_percentiles_ordered() {
        let metrics = aggregator(&["a"]);
        for n in [5u64, 900, 12, 48, 3, 250, 77, 1, 64, 33, 2000] {
            metrics.record(&RequestOutcome::success("a", ms(n)));
        }

        let snapshot = metrics.snapshot("a").unwrap();
        assert!(snapshot.p50_latency_ms <= snapshot.p95_latency_ms);
        assert!(snapshot.p95_latency_ms <= snapshot.p99_latency_ms);
    }

    #[test]
    fn test_in_flight_guard() {
        let metrics = aggregator(&["a"]);
        let first = metrics.begin("a");
        let second = metrics.begin("a");
        assert_eq!(metrics.in_flight("a"), 2);
        assert_eq!(metrics.snapshot("a").unwrap().in_flight, 2);

        drop(first);
        assert_eq!(metrics.in_flight("a"), 1);
        drop(second);
        assert_eq!(metrics.in_flight("a"), 0);

        // Unknown endpoints get a detached gauge
        let detached = metrics.begin("missing");
        assert_eq!(metrics.in_flight("missing"), 0);
        drop(detached);
    }

    #[test]
    fn test_global_snapshot_and_export() {
        let metrics = aggregator(&["a", "b"]);
        metrics.record(&RequestOutcome::success("a", ms(10)));
        metrics.record(&RequestOutcome::success("a", ms(30)));
        metrics.record(&RequestOutcome::failure("b", ms(20), ErrorKind::Connection));
        metrics.record_cancelled("b");
        let _guard = metrics.begin("b");

        let global = metrics.global_snapshot();
        assert_eq!(global.total_requests, 3);
        assert_eq!(global.successes, 2);
        assert_eq!(global.failures, 1);
        assert_eq!(global.cancellations, 1);
        assert_eq!(global.in_flight, 1);
        assert_eq!(global.p50_latency_ms, 20.0);
        assert_eq!(global.failures_by_kind[&ErrorKind::Connection], 1);

        let export = metrics.export();
        assert_eq!(export.len(), 2);
        assert_eq!(export["a"].successes, 2);
        assert_eq!(export["b"].failures, 1);
    }

    #[test]
    fn test_remove() {
        let metrics = aggregator(&["a"]);
        metrics.record(&RequestOutcome::success("a", ms(1)));
        assert!(metrics.remove("a"));
        assert!(!metrics.remove("a"));
        assert!(metrics.snapshot("a").is_none());

        // Re-registering starts from zero
        metrics.register("a");
        assert_eq!(metrics.snapshot("a").unwrap().total_requests, 0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = aggregator(&["a"]);
        metrics.record(&RequestOutcome::failure("a", ms(5), ErrorKind::Timeout));
        let json = serde_json::to_value(metrics.snapshot("a").unwrap()).unwrap();

        assert_eq!(json["failures"], 1);
        assert_eq!(json["failures_by_kind"]["timeout"], 1);
        assert!(json.get("circuit_state").is_none());
    }

    #[test]
    fn test_concurrent_snapshots_consistent() {
        let metrics = Arc::new(aggregator(&["a"]));
        let mut handles = vec![];

        for i in 0..4 {
            let metrics = Arc::clone(&metrics);
            handles.push(thread::spawn(move || {
                for _ in 0..500 {
                    if i % 2 == 0 {
                        metrics.record(&RequestOutcome::success("a", ms(1)));
                    } else {
                        metrics.record(&RequestOutcome::failure("a", ms(1), ErrorKind::Other));
                    }
                }
            }));
        }

        let reader = {
            let metrics = Arc::clone(&metrics);
            thread::spawn(move || {
                for _ in 0..200 {
                    let s = metrics.snapshot("a").unwrap();
                    assert_eq!(s.total_requests, s.successes + s.failures);
                }
            })
        };

        for handle in handles {
            handle.join().unwrap();
        }
        reader.join().unwrap();

        let snapshot = metrics.snapshot("a").unwrap();
        assert_eq!(snapshot.total_requests, 2000);
        assert_eq!(snapshot.successes, 1000);
    }
}
