//! Entity state and buffered state changes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Committed state of one entity: field name -> value.
pub type EntityState = BTreeMap<String, serde_json::Value>;

/// One buffered change to a field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "value", rename_all = "snake_case")]
pub enum StateChange {
    Set(serde_json::Value),
    Clear,
}

/// State mutations of one invocation that are not yet visible to others.
///
/// Applied to the entity state atomically when the invocation suspends or
/// completes. Later changes to the same field replace earlier ones.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateDelta {
    changes: BTreeMap<String, StateChange>,
}

impl StateDelta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, field: impl Into<String>, value: serde_json::Value) {
        self.changes.insert(field.into(), StateChange::Set(value));
    }

    pub fn clear(&mut self, field: impl Into<String>) {
        self.changes.insert(field.into(), StateChange::Clear);
    }

    /// `None` when the field is untouched by this delta.
    pub fn change(&self, field: &str) -> Option<&StateChange> {
        self.changes.get(field)
    }

    /// Read a field through this delta on top of `base`.
    pub fn read<'a>(
        &'a self,
        base: &'a EntityState,
        field: &str,
    ) -> Option<&'a serde_json::Value> {
        match self.changes.get(field) {
            Some(StateChange::Set(value)) => Some(value),
            Some(StateChange::Clear) => None,
            None => base.get(field),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &StateChange)> {
        self.changes.iter()
    }

    pub fn apply_to(&self, state: &mut EntityState) {
        for (field, change) in &self.changes {
            match change {
                StateChange::Set(value) => {
                    state.insert(field.clone(), value.clone());
                }
                StateChange::Clear => {
                    state.remove(field);
                }
            }
        }
    }
}
