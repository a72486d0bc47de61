//! Router configuration
//!
//! Serde model for descriptor-driven router construction. Durations are
//! integers suffixed with their unit. Files are YAML unless the extension is
//! `.toml`.
//!
//! ```yaml
//! strategy: weighted
//! fallback: retry-other-endpoint
//! call_timeout_ms: 30000
//! circuit_breaker:
//!   failure_threshold: 5
//!   open_timeout_secs: 30
//! endpoints:
//!   - name: primary
//!     weight: 3.0
//!   - name: backup
//!     priority: 1
//!     circuit_breaker:
//!       failure_threshold: 2
//! ```

use meridian_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::health::HealthMonitorConfig;
use crate::metrics::DEFAULT_LATENCY_WINDOW;
use crate::registry::DEFAULT_WEIGHT;
use crate::strategy::SelectionStrategy;

/// What the router does after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FallbackPolicy {
    /// Return the first failure to the caller
    FailFast,
    /// Try another eligible endpoint
    #[default]
    RetryOtherEndpoint,
}

impl FallbackPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            FallbackPolicy::FailFast => "fail-fast",
            FallbackPolicy::RetryOtherEndpoint => "retry-other-endpoint",
        }
    }
}

impl FromStr for FallbackPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        [FallbackPolicy::FailFast, FallbackPolicy::RetryOtherEndpoint]
            .into_iter()
            .find(|policy| policy.as_str() == s)
            .ok_or_else(|| Error::InvalidConfig(format!("unknown fallback policy '{}'", s)))
    }
}

/// Top-level router configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default)]
    pub strategy: SelectionStrategy,

    #[serde(default)]
    pub fallback: FallbackPolicy,

    /// Extra attempts after the first failure (default: endpoints - 1)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_fallback_attempts: Option<usize>,

    /// Per-call adapter timeout, independent of the caller's deadline
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_timeout_ms: Option<u64>,

    /// Latency samples kept per endpoint for percentiles
    #[serde(default = "default_latency_window")]
    pub latency_window: usize,

    /// Breaker defaults for endpoints without their own thresholds
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSettings,

    #[serde(default)]
    pub health: HealthSettings,

    #[serde(default)]
    pub sticky_sessions: StickySessionSettings,

    #[serde(default)]
    pub endpoints: Vec<EndpointDescriptor>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            strategy: SelectionStrategy::default(),
            fallback: FallbackPolicy::default(),
            max_fallback_attempts: None,
            call_timeout_ms: None,
            circuit_breaker: CircuitBreakerSettings::default(),
            health: HealthSettings::default(),
            sticky_sessions: StickySessionSettings::default(),
            latency_window: default_latency_window(),
            endpoints: Vec::new(),
        }
    }
}

/// One configured endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    pub name: String,

    #[serde(default = "default_weight")]
    pub weight: f64,

    /// Lower is preferred by priority-based selection
    #[serde(default)]
    pub priority: i32,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Overrides the router-wide breaker defaults
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<CircuitBreakerSettings>,
}

impl EndpointDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            weight: default_weight(),
            priority: 0,
            enabled: true,
            circuit_breaker: None,
        }
    }
}

/// Circuit breaker thresholds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerSettings {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_open_timeout_secs")]
    pub open_timeout_secs: u64,

    #[serde(default = "default_half_open_max_probes")]
    pub half_open_max_probes: u32,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            open_timeout_secs: default_open_timeout_secs(),
            half_open_max_probes: default_half_open_max_probes(),
        }
    }
}

impl From<&CircuitBreakerSettings> for CircuitBreakerConfig {
    fn from(settings: &CircuitBreakerSettings) -> Self {
        CircuitBreakerConfig {
            failure_threshold: settings.failure_threshold,
            open_timeout: Duration::from_secs(settings.open_timeout_secs),
            half_open_max_probes: settings.half_open_max_probes,
        }
    }
}

/// Health monitor thresholds and probe timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSettings {
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,

    #[serde(default = "default_degraded_ratio")]
    pub degraded_ratio: f64,

    #[serde(default = "default_window_size")]
    pub window_size: usize,

    #[serde(default = "default_min_samples")]
    pub min_samples: usize,

    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,

    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            unhealthy_threshold: default_unhealthy_threshold(),
            degraded_ratio: default_degraded_ratio(),
            window_size: default_window_size(),
            min_samples: default_min_samples(),
            probe_interval_secs: default_probe_interval_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
        }
    }
}

impl From<&HealthSettings> for HealthMonitorConfig {
    fn from(settings: &HealthSettings) -> Self {
        HealthMonitorConfig {
            unhealthy_threshold: settings.unhealthy_threshold,
            degraded_ratio: settings.degraded_ratio,
            window_size: settings.window_size,
            min_samples: settings.min_samples,
            probe_interval: Duration::from_secs(settings.probe_interval_secs),
            probe_timeout: Duration::from_secs(settings.probe_timeout_secs),
        }
    }
}

/// Session pinning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StickySessionSettings {
    #[serde(default)]
    pub enabled: bool,

    /// Idle time after which a binding is forgotten; `0` keeps bindings forever
    #[serde(default = "default_sticky_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for StickySessionSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl_secs: default_sticky_ttl_secs(),
        }
    }
}

fn default_latency_window() -> usize {
    DEFAULT_LATENCY_WINDOW
}

fn default_weight() -> f64 {
    DEFAULT_WEIGHT
}

fn default_true() -> bool {
    true
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_open_timeout_secs() -> u64 {
    30
}

fn default_half_open_max_probes() -> u32 {
    1
}

fn default_unhealthy_threshold() -> u32 {
    3
}

fn default_degraded_ratio() -> f64 {
    0.9
}

fn default_window_size() -> usize {
    100
}

fn default_min_samples() -> usize {
    5
}

fn default_probe_interval_secs() -> u64 {
    30
}

fn default_probe_timeout_secs() -> u64 {
    5
}

fn default_sticky_ttl_secs() -> u64 {
    1800
}

impl RouterConfig {
    /// Load configuration from a YAML or TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;

        let config = if path.extension().and_then(|s| s.to_str()) == Some("toml") {
            Self::from_toml(&contents)?
        } else {
            // Default to YAML
            Self::from_yaml(&contents)?
        };

        tracing::info!(
            path = %path.display(),
            endpoints = config.endpoints.len(),
            "Loaded router configuration"
        );
        Ok(config)
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(contents)
            .map_err(|e| Error::InvalidConfig(format!("invalid YAML configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)
            .map_err(|e| Error::InvalidConfig(format!("invalid TOML configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Override settings from `MERIDIAN_*` environment variables
    ///
    /// Invalid values are logged and ignored.
    pub fn merge_env(&mut self) {
        if let Ok(val) = std::env::var("MERIDIAN_STRATEGY") {
            match val.parse() {
                Ok(strategy) => self.strategy = strategy,
                Err(e) => tracing::warn!(value = %val, error = %e, "Ignoring MERIDIAN_STRATEGY"),
            }
        }

        if let Ok(val) = std::env::var("MERIDIAN_FALLBACK") {
            match val.parse() {
                Ok(fallback) => self.fallback = fallback,
                Err(e) => tracing::warn!(value = %val, error = %e, "Ignoring MERIDIAN_FALLBACK"),
            }
        }

        if let Ok(val) = std::env::var("MERIDIAN_CALL_TIMEOUT_MS") {
            match val.parse::<u64>() {
                Ok(ms) if ms > 0 => self.call_timeout_ms = Some(ms),
                _ => tracing::warn!(value = %val, "Ignoring invalid MERIDIAN_CALL_TIMEOUT_MS"),
            }
        }
    }

    /// Reject configurations the router cannot run with
    pub fn validate(&self) -> Result<()> {
        CircuitBreakerConfig::from(&self.circuit_breaker).validate()?;
        HealthMonitorConfig::from(&self.health).validate()?;

        if self.call_timeout_ms == Some(0) {
            return Err(Error::InvalidConfig(
                "call_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.latency_window == 0 {
            return Err(Error::InvalidConfig(
                "latency_window must be greater than 0".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for endpoint in &self.endpoints {
            if endpoint.name.trim().is_empty() {
                return Err(Error::InvalidConfig(
                    "endpoint name cannot be empty".to_string(),
                ));
            }
            if !seen.insert(endpoint.name.as_str()) {
                return Err(Error::DuplicateEndpoint(endpoint.name.clone()));
            }
            if !endpoint.weight.is_finite() || endpoint.weight <= 0.0 {
                return Err(Error::InvalidConfig(format!(
                    "endpoint '{}' weight must be a positive number, got {}",
                    endpoint.name, endpoint.weight
                )));
            }
            if let Some(settings) = &endpoint.circuit_breaker {
                CircuitBreakerConfig::from(settings).validate()?;
            }
        }

        Ok(())
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }

    /// Binding TTL when sticky sessions are enabled, `Some(None)` for no expiry
    pub fn sticky_ttl(&self) -> Option<Option<Duration>> {
        let ttl_secs = self.sticky_sessions.ttl_secs;
        self.sticky_sessions
            .enabled
            .then(|| (ttl_secs > 0).then(|| Duration::from_secs(ttl_secs)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::Builder;

    const YAML: &str = r#"
strategy: weighted
fallback: fail-fast
max_fallback_attempts: 2
call_timeout_ms: 1500
circuit_breaker:
  failure_threshold: 4
  open_timeout_secs: 10
health:
  unhealthy_threshold: 2
sticky_sessions:
  enabled: true
  ttl_secs: 60
endpoints:
  - name: primary
    weight: 3.0
  - name: backup
    priority: 1
    enabled: false
    circuit_breaker:
      failure_threshold: 2
"#;

    #[test]
    fn test_defaults() {
        let config: RouterConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config, RouterConfig::default());
        assert_eq!(config.strategy, SelectionStrategy::RoundRobin);
        assert_eq!(config.fallback, FallbackPolicy::RetryOtherEndpoint);
        assert_eq!(config.latency_window, 1024);
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.health.probe_timeout_secs, 5);
        assert!(config.sticky_ttl().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_yaml() {
        let config = RouterConfig::from_yaml(YAML).unwrap();

        assert_eq!(config.strategy, SelectionStrategy::Weighted);
        assert_eq!(config.fallback, FallbackPolicy::FailFast);
        assert_eq!(config.max_fallback_attempts, Some(2));
        assert_eq!(config.call_timeout(), Some(Duration::from_millis(1500)));
        assert_eq!(config.circuit_breaker.failure_threshold, 4);
        // Unset fields inside a section keep their defaults
        assert_eq!(config.circuit_breaker.half_open_max_probes, 1);
        assert_eq!(config.health.unhealthy_threshold, 2);
        assert_eq!(config.health.window_size, 100);
        assert_eq!(config.sticky_ttl(), Some(Some(Duration::from_secs(60))));

        assert_eq!(config.endpoints.len(), 2);
        let primary = &config.endpoints[0];
        assert_eq!(primary.weight, 3.0);
        assert!(primary.enabled);
        assert!(primary.circuit_breaker.is_none());

        let backup = &config.endpoints[1];
        assert_eq!(backup.weight, 1.0);
        assert_eq!(backup.priority, 1);
        assert!(!backup.enabled);
        assert_eq!(backup.circuit_breaker.as_ref().unwrap().failure_threshold, 2);
    }

    #[test]
    fn test_toml_matches_yaml() {
        let yaml = RouterConfig::from_yaml(YAML).unwrap();
        let toml = toml::to_string(&yaml).unwrap();
        let parsed = RouterConfig::from_toml(&toml).unwrap();
        assert_eq!(parsed, yaml);
    }

    #[test]
    fn test_sticky_without_expiry_survives_reserialization() {
        let config =
            RouterConfig::from_yaml("sticky_sessions:\n  enabled: true\n  ttl_secs: 0\n").unwrap();
        assert_eq!(config.sticky_ttl(), Some(None));

        let yaml = serde_yaml::to_string(&config).unwrap();
        let from_yaml = RouterConfig::from_yaml(&yaml).unwrap();
        assert_eq!(from_yaml, config);
        assert_eq!(from_yaml.sticky_ttl(), Some(None));

        let toml = toml::to_string(&config).unwrap();
        let from_toml = RouterConfig::from_toml(&toml).unwrap();
        assert_eq!(from_toml, config);
        assert_eq!(from_toml.sticky_ttl(), Some(None));

        let written = RouterConfig::from_toml("[sticky_sessions]\nenabled = true\nttl_secs = 0\n").unwrap();
        assert_eq!(written.sticky_ttl(), Some(None));
    }

    #[test]
    fn test_fallback_policy_from_str() {
        assert_eq!("fail-fast".parse::<FallbackPolicy>().unwrap(), FallbackPolicy::FailFast);
        assert_eq!(
            "retry-other-endpoint".parse::<FallbackPolicy>().unwrap(),
            FallbackPolicy::RetryOtherEndpoint
        );
        assert!(matches!(
            "retry".parse::<FallbackPolicy>(),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_from_file_by_extension() {
        let mut yaml_file = Builder::new().suffix(".yaml").tempfile().unwrap();
        yaml_file.write_all(YAML.as_bytes()).unwrap();
        let from_yaml = RouterConfig::from_file(yaml_file.path()).unwrap();

        let mut toml_file = Builder::new().suffix(".toml").tempfile().unwrap();
        toml_file
            .write_all(
                br#"
strategy = "priority-based"

[[endpoints]]
name = "a"

[[endpoints]]
name = "b"
priority = 2
"#,
            )
            .unwrap();
        let from_toml = RouterConfig::from_file(toml_file.path()).unwrap();

        assert_eq!(from_yaml.endpoints.len(), 2);
        assert_eq!(from_toml.strategy, SelectionStrategy::PriorityBased);
        assert_eq!(from_toml.endpoints[1].priority, 2);
    }

    #[test]
    fn test_missing_file() {
        let err = RouterConfig::from_file("/nonexistent/meridian.yaml").unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let cases = [
            "circuit_breaker:\n  failure_threshold: 0\n",
            "circuit_breaker:\n  open_timeout_secs: 0\n",
            "health:\n  degraded_ratio: 2.0\n",
            "call_timeout_ms: 0\n",
            "latency_window: 0\n",
            "sticky_sessions:\n  ttl_secs: -1\n",
            "endpoints:\n  - name: a\n    weight: 0\n",
            "endpoints:\n  - name: ''\n",
            "endpoints:\n  - name: a\n    circuit_breaker:\n      half_open_max_probes: 0\n",
            "strategy: fastest\n",
        ];
        for case in cases {
            assert!(RouterConfig::from_yaml(case).is_err(), "accepted: {}", case);
        }

        let err = RouterConfig::from_yaml("endpoints:\n  - name: a\n  - name: a\n").unwrap_err();
        assert!(matches!(err, Error::DuplicateEndpoint(name) if name == "a"));
    }

    #[test]
    fn test_settings_conversions() {
        let breaker = CircuitBreakerConfig::from(&CircuitBreakerSettings {
            failure_threshold: 3,
            open_timeout_secs: 7,
            half_open_max_probes: 2,
        });
        assert_eq!(breaker.open_timeout, Duration::from_secs(7));
        assert_eq!(breaker.half_open_max_probes, 2);

        let health = HealthMonitorConfig::from(&HealthSettings::default());
        assert_eq!(health, HealthMonitorConfig::default());
    }

    #[test]
    #[serial]
    fn test_merge_env() {
        // SAFETY: serialized with the other env tests
        unsafe {
            std::env::set_var("MERIDIAN_STRATEGY", "least-connections");
            std::env::set_var("MERIDIAN_FALLBACK", "fail-fast");
            std::env::set_var("MERIDIAN_CALL_TIMEOUT_MS", "250");
        }

        let mut config = RouterConfig::default();
        config.merge_env();

        unsafe {
            std::env::remove_var("MERIDIAN_STRATEGY");
            std::env::remove_var("MERIDIAN_FALLBACK");
            std::env::remove_var("MERIDIAN_CALL_TIMEOUT_MS");
        }

        assert_eq!(config.strategy, SelectionStrategy::LeastConnections);
        assert_eq!(config.fallback, FallbackPolicy::FailFast);
        assert_eq!(config.call_timeout_ms, Some(250));
    }

    #[test]
    #[serial]
    fn test_merge_env_ignores_invalid() {
        unsafe {
            std::env::set_var("MERIDIAN_STRATEGY", "fastest");
            std::env::set_var("MERIDIAN_FALLBACK", "retry");
            std::env::set_var("MERIDIAN_CALL_TIMEOUT_MS", "soon");
        }

        let mut config = RouterConfig::default();
        config.merge_env();

        unsafe {
            std::env::remove_var("MERIDIAN_STRATEGY");
            std::env::remove_var("MERIDIAN_FALLBACK");
            std::env::remove_var("MERIDIAN_CALL_TIMEOUT_MS");
        }

        assert_eq!(config, RouterConfig::default());
    }
}
