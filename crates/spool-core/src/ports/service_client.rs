//! ServiceClient port - outbound calls to other handlers.
//!
//! The engine routes calls to services it hosts through `LocalServiceClient`
//! and everything else through an optional remote client supplied by the
//! embedding application.

use async_trait::async_trait;

use crate::domain::{IdempotencyToken, InvocationTarget, TerminalError};

/// Response classes at the call boundary.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CallError {
    /// The target rejected the call. Not retried.
    #[error("call failed: {0}")]
    Terminal(TerminalError),

    /// The call may succeed if repeated with the same token.
    #[error("call failed transiently: {0}")]
    Transient(String),
}

#[async_trait]
pub trait ServiceClient: Send + Sync {
    /// Request/response call. Implementations must de-duplicate on `token`.
    async fn call(
        &self,
        target: &InvocationTarget,
        token: &IdempotencyToken,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, CallError>;

    /// Fire-and-forget submission. Returns once the target accepted the request.
    async fn send(
        &self,
        target: &InvocationTarget,
        payload: serde_json::Value,
    ) -> Result<(), CallError>;
}
