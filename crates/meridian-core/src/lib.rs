//! Meridian Core Types and Traits
//!
//! This crate provides the fundamental types and traits used throughout Meridian:
//! - Opaque completion request/response envelopes
//! - The dispatcher trait implemented by endpoint adapters
//! - Request context (cancellation, deadline, session key)
//! - Core error types and the outcome taxonomy

pub mod context;
pub mod dispatcher;
pub mod error;
pub mod outcome;
pub mod request;

pub use context::RequestContext;
pub use dispatcher::Dispatcher;
pub use error::{Error, ErrorKind, Result};
pub use outcome::RequestOutcome;
pub use request::{CompletionRequest, CompletionResponse};
