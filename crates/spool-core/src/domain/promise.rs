//! Durable promise records.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::ids::InvocationId;
use super::target::ServiceId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", content = "value", rename_all = "snake_case")]
pub enum PromiseState {
    Pending,
    Resolved(serde_json::Value),
}

/// A named resolve-once future, scoped to an entity/workflow key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromiseRecord {
    pub service_id: ServiceId,
    pub name: String,
    pub state: PromiseState,

    /// Invocations suspended on this promise.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub waiters: BTreeSet<InvocationId>,
}

impl PromiseRecord {
    pub fn pending(service_id: ServiceId, name: impl Into<String>) -> Self {
        Self {
            service_id,
            name: name.into(),
            state: PromiseState::Pending,
            waiters: BTreeSet::new(),
        }
    }

    pub fn value(&self) -> Option<&serde_json::Value> {
        match &self.state {
            PromiseState::Resolved(v) => Some(v),
            PromiseState::Pending => None,
        }
    }
}

/// Result of a `resolve` call.
///
/// Resolution is first-wins. A second `resolve` changes nothing and reports
/// the value that is already there.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ResolveOutcome {
    Resolved,
    AlreadyResolved { existing: serde_json::Value },
}

impl ResolveOutcome {
    pub fn was_accepted(&self) -> bool {
        matches!(self, ResolveOutcome::Resolved)
    }
}
