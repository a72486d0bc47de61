//! Meridian Observability
//!
//! This crate provides observability features:
//! - Structured logging setup (tracing-subscriber)
//! - Prometheus export of router metrics

pub mod error;
pub mod exporter;
pub mod logging;

pub use error::{ObservabilityError, Result};
pub use exporter::PrometheusExporter;
pub use logging::{LogFormat, LoggingConfig, build_filter, init_logging};
