//! Invocation targets: which service, which handler, which entity key.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of a registered service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    /// Stateless; handlers take no key.
    Service,

    /// Keyed entity with durable state; exclusive and shared handlers.
    VirtualObject,

    /// Keyed workflow; one `run` handler executed once per key, plus shared handlers.
    Workflow,
}

/// Admission class of a handler. Decides which per-key lock it takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerKind {
    /// Handler of a stateless service. No key, no lock.
    Stateless,

    /// Write-capable, strictly one at a time per key.
    Exclusive,

    /// Read-only, concurrent with other shared handlers, fenced from writers.
    Shared,

    /// The workflow body. Exclusive, and executed at most once per key.
    WorkflowRun,
}

impl HandlerKind {
    pub fn can_write_state(self) -> bool {
        matches!(self, HandlerKind::Exclusive | HandlerKind::WorkflowRun)
    }

    pub fn requires_key(self) -> bool {
        !matches!(self, HandlerKind::Stateless)
    }
}

/// Entity key: the instance identifier partitioning state and write access.
///
/// Scoped by service, so `account/A` and `transfer/A` are different entities.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceId {
    pub service: String,
    pub key: String,
}

impl ServiceId {
    pub fn new(service: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service, self.key)
    }
}

/// Address of one handler call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InvocationTarget {
    pub service: String,
    pub handler: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl InvocationTarget {
    /// Target on a stateless service.
    pub fn service(service: impl Into<String>, handler: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            handler: handler.into(),
            key: None,
        }
    }

    /// Target on a keyed service (virtual object or workflow).
    pub fn keyed(
        service: impl Into<String>,
        handler: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            service: service.into(),
            handler: handler.into(),
            key: Some(key.into()),
        }
    }

    pub fn service_id(&self) -> Option<ServiceId> {
        self.key
            .as_ref()
            .map(|key| ServiceId::new(self.service.clone(), key.clone()))
    }
}

impl fmt::Display for InvocationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.key {
            Some(key) => write!(f, "{}/{}/{}", self.service, key, self.handler),
            None => write!(f, "{}/{}", self.service, self.handler),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyed_target_exposes_service_id() {
        let target = InvocationTarget::keyed("account", "withdraw", "A");
        assert_eq!(target.service_id(), Some(ServiceId::new("account", "A")));
        assert_eq!(target.to_string(), "account/A/withdraw");
    }

    #[test]
    fn stateless_target_has_no_service_id() {
        let target = InvocationTarget::service("txn", "transfer");
        assert_eq!(target.service_id(), None);
        assert_eq!(target.to_string(), "txn/transfer");
    }

    #[test]
    fn only_exclusive_kinds_write_state() {
        assert!(HandlerKind::Exclusive.can_write_state());
        assert!(HandlerKind::WorkflowRun.can_write_state());
        assert!(!HandlerKind::Shared.can_write_state());
        assert!(!HandlerKind::Stateless.can_write_state());
    }
}
