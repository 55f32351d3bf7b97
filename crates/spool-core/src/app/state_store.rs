//! Entity state store: committed field maps, partitioned by entity key.
//!
//! Handlers never write here directly. Their changes are buffered in a
//! `StateDelta` and applied in one step at a suspend/complete boundary, after
//! the store commit that carries the same delta succeeded.

use std::collections::HashMap;

use crate::domain::{EntityState, ServiceId, StateDelta};

#[derive(Debug, Default)]
pub struct EntityStateStore {
    entities: HashMap<ServiceId, EntityState>,
}

impl EntityStateStore {
    pub fn from_entries(entries: impl IntoIterator<Item = (ServiceId, EntityState)>) -> Self {
        Self {
            entities: entries.into_iter().collect(),
        }
    }

    pub fn get(&self, service_id: &ServiceId, field: &str) -> Option<&serde_json::Value> {
        self.entities.get(service_id).and_then(|s| s.get(field))
    }

    /// Copy of the entity's committed state; empty for unknown entities.
    pub fn state(&self, service_id: &ServiceId) -> EntityState {
        self.entities.get(service_id).cloned().unwrap_or_default()
    }

    pub fn apply(&mut self, service_id: &ServiceId, delta: &StateDelta) {
        let state = self.entities.entry(service_id.clone()).or_default();
        delta.apply_to(state);
        if state.is_empty() {
            self.entities.remove(service_id);
        }
    }
}
