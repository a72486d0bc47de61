//! Error types for Meridian Core

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Configuration errors
    #[error("Duplicate endpoint: {0}")]
    DuplicateEndpoint(String),

    #[error("Endpoint not found: {0}")]
    EndpointNotFound(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Availability errors
    #[error("No eligible endpoints: every endpoint is disabled or circuit-open")]
    NoEligibleEndpoints,

    #[error("All endpoints failed (attempted: {attempted:?}): {last_error}")]
    AllEndpointsFailed {
        attempted: Vec<String>,
        #[source]
        last_error: Box<Error>,
    },

    // Transport errors reported by dispatchers
    #[error("Endpoint call timed out: {0}")]
    Timeout(String),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Endpoint returned status {code}: {message}")]
    Status { code: u16, message: String },

    #[error("Provider error: {0}")]
    Provider(String),

    // Caller-side termination
    #[error("Request cancelled by caller")]
    Cancelled,

    #[error("Request deadline exceeded")]
    DeadlineExceeded,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Outcome taxonomy for errors that count as an endpoint failure.
    ///
    /// Returns `None` for errors that say nothing about endpoint health
    /// (caller cancellation, configuration and availability errors).
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Error::Timeout(_) => Some(ErrorKind::Timeout),
            Error::Connection(_) => Some(ErrorKind::Connection),
            Error::Status { .. } => Some(ErrorKind::Status),
            Error::Provider(_) | Error::Serialization(_) | Error::Io(_) => Some(ErrorKind::Other),
            _ => None,
        }
    }

    /// True for caller-initiated termination (cancellation or deadline)
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled | Error::DeadlineExceeded)
    }
}

/// Classification of a failed endpoint call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The call did not finish within its timeout
    Timeout,
    /// The endpoint could not be reached
    Connection,
    /// The endpoint answered with a non-success status
    Status,
    /// Any other adapter failure
    Other,
}

pub type Result<T> = std::result::Result<T, Error>;
