use thiserror::Error;

use crate::domain::InvocationId;
use crate::ports::StoreError;

/// Errors of the engine's public API.
#[derive(Debug, Error)]
pub enum SpoolError {
    #[error("service '{0}' is not registered")]
    ServiceNotFound(String),

    #[error("handler '{handler}' not found on service '{service}'")]
    HandlerNotFound { service: String, handler: String },

    #[error("target '{0}' needs an entity key")]
    MissingKey(String),

    #[error("target '{0}' is a stateless service and takes no key")]
    UnexpectedKey(String),

    #[error("invocation {0} not found")]
    InvocationNotFound(InvocationId),

    #[error("invocation {0} has not finished")]
    NotFinished(InvocationId),

    #[error("payload error: {0}")]
    Payload(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("engine is shut down")]
    ShutDown,
}
