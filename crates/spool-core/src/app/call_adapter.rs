//! Idempotent call adapter.
//!
//! Routes outbound calls to the local engine or the remote client and retries
//! transient failures with backoff. Every retry of one call carries the same
//! token, so the target can de-duplicate. Terminal failures are returned at
//! once.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, warn};

use super::retry::RetryPolicy;
use crate::domain::{IdempotencyToken, InvocationTarget, TerminalError};
use crate::ports::{CallError, ServiceClient};

pub struct CallAdapter {
    local: Arc<dyn ServiceClient>,
    remote: Option<Arc<dyn ServiceClient>>,
    local_services: HashSet<String>,
    retry: RetryPolicy,
}

impl CallAdapter {
    pub fn new(
        local: Arc<dyn ServiceClient>,
        remote: Option<Arc<dyn ServiceClient>>,
        local_services: impl IntoIterator<Item = String>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            local,
            remote,
            local_services: local_services.into_iter().collect(),
            retry,
        }
    }

    fn route(&self, target: &InvocationTarget) -> Result<&Arc<dyn ServiceClient>, CallError> {
        if self.local_services.contains(&target.service) {
            return Ok(&self.local);
        }
        self.remote.as_ref().ok_or_else(|| {
            CallError::Terminal(TerminalError::with_code(
                404,
                format!("no route to service '{}'", target.service),
            ))
        })
    }

    pub async fn call(
        &self,
        target: &InvocationTarget,
        token: &IdempotencyToken,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, CallError> {
        let client = self.route(target)?;
        let mut attempts = 0;
        loop {
            attempts += 1;
            match client.call(target, token, payload.clone()).await {
                Err(CallError::Transient(reason)) if self.retry.should_retry(attempts) => {
                    let delay = self.retry.next_delay(attempts);
                    warn!(%target, %token, attempts, ?delay, %reason, "call failed transiently, retrying");
                    tokio::time::sleep(delay).await;
                }
                other => {
                    debug!(%target, %token, attempts, ok = other.is_ok(), "call finished");
                    return other;
                }
            }
        }
    }

    pub async fn send(
        &self,
        target: &InvocationTarget,
        payload: serde_json::Value,
    ) -> Result<(), CallError> {
        let client = self.route(target)?;
        let mut attempts = 0;
        loop {
            attempts += 1;
            match client.send(target, payload.clone()).await {
                Err(CallError::Transient(reason)) if self.retry.should_retry(attempts) => {
                    let delay = self.retry.next_delay(attempts);
                    warn!(%target, attempts, ?delay, %reason, "send failed transiently, retrying");
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }
}
