//! Dispatcher trait definitions
//!
//! A dispatcher is the per-provider adapter that performs the actual network
//! call for an endpoint. Any `Err` returned from [`Dispatcher::call`] is
//! treated as a failed attempt unless it is [`Error::Cancelled`] or
//! [`Error::DeadlineExceeded`].
//!
//! Implementations should honor `ctx.cancellation()` promptly (within about
//! a second); the router additionally drops the call future when the caller
//! cancels or the deadline passes.
//!
//! [`Error::Cancelled`]: crate::Error::Cancelled
//! [`Error::DeadlineExceeded`]: crate::Error::DeadlineExceeded

use crate::{
    Result,
    context::RequestContext,
    request::{CompletionRequest, CompletionResponse},
};

#[async_trait::async_trait]
pub trait Dispatcher: Send + Sync {
    /// Perform one completion call against the endpoint
    async fn call(
        &self,
        request: CompletionRequest,
        ctx: RequestContext,
    ) -> Result<CompletionResponse>;

    /// Lightweight liveness check used by health probing
    ///
    /// Adapters without a cheap probe keep the default, which reports the
    /// endpoint as reachable.
    async fn health_check(&self, _ctx: RequestContext) -> Result<()> {
        Ok(())
    }
}
