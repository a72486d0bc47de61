//! Selection strategies
//!
//! The [`Selector`] picks one endpoint from an already-filtered eligible set.
//! Eligibility (enabled flag, circuit state, endpoints already attempted in
//! this dispatch) is decided by the caller; the selector only orders.
//!
//! ## Strategies
//!
//! - **round-robin**: one shared cursor modulo the eligible-set length
//! - **weighted**: smooth weighted round-robin (nginx) over endpoint weights
//! - **least-connections**: fewest in-flight requests, ties to the earliest registered
//! - **priority-based**: lowest priority tier, round-robin inside the tier
//! - **random**: uniform
//! - **health-aware**: smooth weighted round-robin over `weight × health score`
//!
//! ```rust
//! use meridian_routing::SelectionStrategy;
//!
//! let strategy: SelectionStrategy = "least-connections".parse().unwrap();
//! assert_eq!(strategy, SelectionStrategy::LeastConnections);
//! ```
//!
//! ## Thread Safety
//!
//! The active strategy and the cursors are atomics, so swapping the
//! strategy never blocks a concurrent selection. The smooth weighted state
//! sits behind a mutex held only for the arithmetic of one pick.

use meridian_core::{Error, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::health::HealthStatus;
use crate::registry::Endpoint;

/// Endpoint selection strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[repr(u8)]
pub enum SelectionStrategy {
    #[default]
    RoundRobin = 0,
    Weighted = 1,
    LeastConnections = 2,
    PriorityBased = 3,
    Random = 4,
    HealthAware = 5,
}

impl SelectionStrategy {
    pub const ALL: [SelectionStrategy; 6] = [
        SelectionStrategy::RoundRobin,
        SelectionStrategy::Weighted,
        SelectionStrategy::LeastConnections,
        SelectionStrategy::PriorityBased,
        SelectionStrategy::Random,
        SelectionStrategy::HealthAware,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionStrategy::RoundRobin => "round-robin",
            SelectionStrategy::Weighted => "weighted",
            SelectionStrategy::LeastConnections => "least-connections",
            SelectionStrategy::PriorityBased => "priority-based",
            SelectionStrategy::Random => "random",
            SelectionStrategy::HealthAware => "health-aware",
        }
    }

    fn from_u8(value: u8) -> Self {
        Self::ALL
            .get(value as usize)
            .copied()
            .unwrap_or_default()
    }
}

impl fmt::Display for SelectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SelectionStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .find(|strategy| strategy.as_str() == s)
            .copied()
            .ok_or_else(|| Error::InvalidConfig(format!("unknown selection strategy '{}'", s)))
    }
}

/// Runtime load and health signals consulted by some strategies
pub trait LoadSignals {
    /// Requests currently in flight against the endpoint
    fn in_flight(&self, endpoint: &str) -> u64;

    /// Current health status of the endpoint
    fn health(&self, endpoint: &str) -> HealthStatus;
}

/// Signals for callers that track neither load nor health
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSignals;

impl LoadSignals for NoSignals {
    fn in_flight(&self, _endpoint: &str) -> u64 {
        0
    }

    fn health(&self, _endpoint: &str) -> HealthStatus {
        HealthStatus::Healthy
    }
}

/// Smooth weighted round-robin state keyed by endpoint name
#[derive(Debug, Default)]
struct SmoothWeighted {
    current: Mutex<HashMap<String, f64>>,
}

impl SmoothWeighted {
    /// Pick an index from `candidates` given their effective weights
    ///
    /// Candidates with a non-positive weight never win. Returns `None` when
    /// every weight is non-positive.
    fn pick(&self, candidates: &[Arc<Endpoint>], weights: &[f64]) -> Option<usize> {
        let mut current = self
            .current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut total = 0.0;
        let mut best: Option<(usize, f64)> = None;
        for (index, (endpoint, &weight)) in candidates.iter().zip(weights).enumerate() {
            if weight <= 0.0 {
                continue;
            }
            total += weight;
            let value = current.entry(endpoint.name().to_string()).or_insert(0.0);
            *value += weight;
            if best.is_none_or(|(_, best_value)| *value > best_value) {
                best = Some((index, *value));
            }
        }

        let (index, _) = best?;
        if let Some(value) = current.get_mut(candidates[index].name()) {
            *value -= total;
        }
        Some(index)
    }

    fn forget(&self, name: &str) {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(name);
    }
}

/// Picks endpoints from an eligible set
#[derive(Debug, Default)]
pub struct Selector {
    strategy: AtomicU8,
    round_robin: AtomicUsize,
    priority_round_robin: AtomicUsize,
    weighted: SmoothWeighted,
    health_weighted: SmoothWeighted,
}

impl Selector {
    pub fn new(strategy: SelectionStrategy) -> Self {
        Self {
            strategy: AtomicU8::new(strategy as u8),
            ..Default::default()
        }
    }

    /// Currently active strategy
    pub fn strategy(&self) -> SelectionStrategy {
        SelectionStrategy::from_u8(self.strategy.load(Ordering::Acquire))
    }

    /// Swap the active strategy; the next selection uses it
    pub fn set_strategy(&self, strategy: SelectionStrategy) {
        let previous = SelectionStrategy::from_u8(
            self.strategy.swap(strategy as u8, Ordering::AcqRel),
        );
        if previous != strategy {
            tracing::info!(
                from = previous.as_str(),
                to = strategy.as_str(),
                "Selection strategy changed"
            );
        }
    }

    /// Select one endpoint from `eligible` using `strategy`
    ///
    /// Fails with [`Error::NoEligibleEndpoints`] on an empty set.
    pub fn select(
        &self,
        eligible: &[Arc<Endpoint>],
        strategy: SelectionStrategy,
        signals: &dyn LoadSignals,
    ) -> Result<Arc<Endpoint>> {
        if eligible.is_empty() {
            return Err(Error::NoEligibleEndpoints);
        }

        let index = match strategy {
            SelectionStrategy::RoundRobin => self.next_round_robin(eligible.len()),
            SelectionStrategy::Weighted => {
                let weights: Vec<f64> = eligible.iter().map(|e| e.weight()).collect();
                self.weighted
                    .pick(eligible, &weights)
                    .unwrap_or_else(|| self.next_round_robin(eligible.len()))
            }
            SelectionStrategy::LeastConnections => least_loaded(eligible, signals),
            SelectionStrategy::PriorityBased => self.next_in_top_tier(eligible),
            SelectionStrategy::Random => rand::rng().random_range(0..eligible.len()),
            SelectionStrategy::HealthAware => {
                let scores: Vec<f64> = eligible
                    .iter()
                    .map(|e| e.weight() * signals.health(e.name()).score())
                    .collect();
                match self.health_weighted.pick(eligible, &scores) {
                    Some(index) => index,
                    None => {
                        tracing::debug!("All eligible endpoints scored zero, using round-robin");
                        self.next_round_robin(eligible.len())
                    }
                }
            }
        };

        let endpoint = Arc::clone(&eligible[index]);
        tracing::debug!(
            endpoint = %endpoint.name(),
            strategy = strategy.as_str(),
            eligible = eligible.len(),
            "Selected endpoint"
        );
        Ok(endpoint)
    }

    /// Drop per-endpoint selection state
    pub fn forget(&self, name: &str) {
        self.weighted.forget(name);
        self.health_weighted.forget(name);
    }

    fn next_round_robin(&self, len: usize) -> usize {
        // fetch_add wraps on overflow
        self.round_robin.fetch_add(1, Ordering::AcqRel) % len
    }

    fn next_in_top_tier(&self, eligible: &[Arc<Endpoint>]) -> usize {
        let Some(top) = eligible.iter().map(|e| e.priority()).min() else {
            return 0;
        };
        let tier: Vec<usize> = eligible
            .iter()
            .enumerate()
            .filter(|(_, e)| e.priority() == top)
            .map(|(index, _)| index)
            .collect();
        let slot = self.priority_round_robin.fetch_add(1, Ordering::AcqRel) % tier.len();
        tier[slot]
    }
}

fn least_loaded(eligible: &[Arc<Endpoint>], signals: &dyn LoadSignals) -> usize {
    let mut best = 0;
    let mut best_load = u64::MAX;
    for (index, endpoint) in eligible.iter().enumerate() {
        let load = signals.in_flight(endpoint.name());
        // strict comparison keeps the earliest registered on ties
        if load < best_load {
            best = index;
            best_load = load;
        }
    }
    best
}
