//! In-process service client.
//!
//! Calls to services hosted by the same engine become invocations admitted
//! with the call token as their idempotency key, so a retried call attaches to
//! the invocation the first attempt created instead of running the handler
//! again.

use std::sync::Weak;

use async_trait::async_trait;

use crate::app::engine::{Engine, EngineInner, InvocationRequest};
use crate::domain::{IdempotencyToken, InvocationResponse, InvocationTarget, TerminalError};
use crate::error::SpoolError;
use crate::ports::{CallError, ServiceClient};

pub struct LocalServiceClient {
    engine: Weak<EngineInner>,
}

impl LocalServiceClient {
    pub(crate) fn new(engine: Weak<EngineInner>) -> Self {
        Self { engine }
    }

    fn engine(&self) -> Result<Engine, CallError> {
        self.engine
            .upgrade()
            .map(Engine::from_inner)
            .ok_or_else(|| CallError::Transient("engine is shut down".into()))
    }
}

fn call_error(error: SpoolError) -> CallError {
    match error {
        SpoolError::ServiceNotFound(_) | SpoolError::HandlerNotFound { .. } => {
            CallError::Terminal(TerminalError::with_code(404, error.to_string()))
        }
        SpoolError::MissingKey(_) | SpoolError::UnexpectedKey(_) | SpoolError::Payload(_) => {
            CallError::Terminal(TerminalError::with_code(400, error.to_string()))
        }
        other => CallError::Transient(other.to_string()),
    }
}

#[async_trait]
impl ServiceClient for LocalServiceClient {
    async fn call(
        &self,
        target: &InvocationTarget,
        token: &IdempotencyToken,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, CallError> {
        let engine = self.engine()?;
        let request = InvocationRequest::new(target.clone(), payload)
            .with_idempotency_key(token.as_str());
        let id = engine.submit(request).await.map_err(call_error)?;

        match engine.wait_for(id).await.map_err(call_error)? {
            InvocationResponse::Completed { value, .. } => Ok(value),
            InvocationResponse::Failed { error, .. } => Err(CallError::Terminal(error)),
            InvocationResponse::Suspended { id } => Err(CallError::Transient(format!(
                "invocation {id} is still suspended"
            ))),
        }
    }

    async fn send(
        &self,
        target: &InvocationTarget,
        payload: serde_json::Value,
    ) -> Result<(), CallError> {
        let engine = self.engine()?;
        engine
            .submit(InvocationRequest::new(target.clone(), payload))
            .await
            .map_err(call_error)?;
        Ok(())
    }
}
