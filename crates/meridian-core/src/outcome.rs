//! Per-attempt outcome passed from the router to its observers

use crate::error::{Error, ErrorKind};
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Result of one completed dispatch attempt against one endpoint
///
/// Cancelled attempts never produce an outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestOutcome {
    pub endpoint: String,
    pub success: bool,
    pub latency: Duration,
    pub error_kind: Option<ErrorKind>,
    pub timestamp: DateTime<Utc>,
}

impl RequestOutcome {
    pub fn success(endpoint: impl Into<String>, latency: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            success: true,
            latency,
            error_kind: None,
            timestamp: Utc::now(),
        }
    }

    pub fn failure(endpoint: impl Into<String>, latency: Duration, kind: ErrorKind) -> Self {
        Self {
            endpoint: endpoint.into(),
            success: false,
            latency,
            error_kind: Some(kind),
            timestamp: Utc::now(),
        }
    }

    /// Build a failure outcome from an adapter error
    ///
    /// Returns `None` when the error is a caller cancellation, which must not
    /// be recorded as an endpoint failure.
    pub fn from_error(endpoint: impl Into<String>, latency: Duration, error: &Error) -> Option<Self> {
        if error.is_cancellation() {
            return None;
        }
        let kind = error.kind().unwrap_or(ErrorKind::Other);
        Some(Self::failure(endpoint, latency, kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_outcome() {
        let outcome = RequestOutcome::success("a", Duration::from_millis(12));
        assert!(outcome.success);
        assert_eq!(outcome.endpoint, "a");
        assert_eq!(outcome.error_kind, None);
    }

    #[test]
    fn test_outcome_from_transport_error() {
        let err = Error::Status {
            code: 502,
            message: "bad gateway".to_string(),
        };
        let outcome = RequestOutcome::from_error("b", Duration::from_millis(3), &err).unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.error_kind, Some(ErrorKind::Status));
    }

    #[test]
    fn test_cancellation_produces_no_outcome() {
        assert!(RequestOutcome::from_error("c", Duration::ZERO, &Error::Cancelled).is_none());
        assert!(
            RequestOutcome::from_error("c", Duration::ZERO, &Error::DeadlineExceeded).is_none()
        );
    }
}
