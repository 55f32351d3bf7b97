//! Durable promise registry.
//!
//! Promises are keyed by (entity key, name). Every mutation is prepared here
//! as an updated record, committed by the engine, and only then applied with
//! `upsert`, so the in-memory view never runs ahead of the store.

use std::collections::HashMap;

use crate::domain::{InvocationId, PromiseRecord, PromiseState, ResolveOutcome, ServiceId};

/// A prepared resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedResolve {
    pub outcome: ResolveOutcome,

    /// Record to commit; `None` when the promise was already resolved.
    pub record: Option<PromiseRecord>,

    /// Invocations to resume after the commit.
    pub waiters: Vec<InvocationId>,
}

#[derive(Debug, Default)]
pub struct PromiseRegistry {
    promises: HashMap<(ServiceId, String), PromiseRecord>,
}

impl PromiseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: impl IntoIterator<Item = PromiseRecord>) -> Self {
        let mut registry = Self::new();
        for record in records {
            registry.upsert(record);
        }
        registry
    }

    pub fn get(&self, service_id: &ServiceId, name: &str) -> Option<&PromiseRecord> {
        self.promises.get(&(service_id.clone(), name.to_string()))
    }

    /// Resolved value, if any.
    pub fn peek(&self, service_id: &ServiceId, name: &str) -> Option<&serde_json::Value> {
        self.get(service_id, name).and_then(PromiseRecord::value)
    }

    /// First resolution wins. Later ones report the existing value.
    pub fn prepare_resolve(
        &self,
        service_id: &ServiceId,
        name: &str,
        value: serde_json::Value,
    ) -> PreparedResolve {
        let current = self
            .get(service_id, name)
            .cloned()
            .unwrap_or_else(|| PromiseRecord::pending(service_id.clone(), name));

        match current.state {
            PromiseState::Resolved(existing) => PreparedResolve {
                outcome: ResolveOutcome::AlreadyResolved { existing },
                record: None,
                waiters: Vec::new(),
            },
            PromiseState::Pending => {
                let waiters = current.waiters.iter().copied().collect();
                PreparedResolve {
                    outcome: ResolveOutcome::Resolved,
                    record: Some(PromiseRecord {
                        state: PromiseState::Resolved(value),
                        waiters: Default::default(),
                        ..current
                    }),
                    waiters,
                }
            }
        }
    }

    /// Record with `invocation` added to the waiters.
    pub fn prepare_subscribe(
        &self,
        service_id: &ServiceId,
        name: &str,
        invocation: InvocationId,
    ) -> PromiseRecord {
        let mut record = self
            .get(service_id, name)
            .cloned()
            .unwrap_or_else(|| PromiseRecord::pending(service_id.clone(), name));
        record.waiters.insert(invocation);
        record
    }

    /// Record with `invocation` removed; `None` if it was not waiting.
    pub fn prepare_unsubscribe(
        &self,
        service_id: &ServiceId,
        name: &str,
        invocation: InvocationId,
    ) -> Option<PromiseRecord> {
        let mut record = self.get(service_id, name)?.clone();
        record.waiters.remove(&invocation).then_some(record)
    }

    pub fn upsert(&mut self, record: PromiseRecord) {
        self.promises
            .insert((record.service_id.clone(), record.name.clone()), record);
    }

    pub fn len(&self) -> usize {
        self.promises.len()
    }

    pub fn is_empty(&self) -> bool {
        self.promises.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use ulid::Ulid;

    fn wf() -> ServiceId {
        ServiceId::new("transfer", "t1")
    }

    fn inv() -> InvocationId {
        InvocationId::from_ulid(Ulid::new())
    }

    #[test]
    fn resolve_hands_out_waiters_and_clears_them() {
        let mut registry = PromiseRegistry::new();
        let (a, b) = (inv(), inv());
        registry.upsert(registry.prepare_subscribe(&wf(), "approved", a));
        registry.upsert(registry.prepare_subscribe(&wf(), "approved", b));

        let prepared = registry.prepare_resolve(&wf(), "approved", json!(true));
        assert_eq!(prepared.outcome, ResolveOutcome::Resolved);
        assert_eq!(prepared.waiters.len(), 2);

        let record = prepared.record.unwrap();
        assert!(record.waiters.is_empty());
        registry.upsert(record);
        assert_eq!(registry.peek(&wf(), "approved"), Some(&json!(true)));
    }

    #[test]
    fn second_resolution_is_a_reported_noop() {
        let mut registry = PromiseRegistry::new();
        let first = registry.prepare_resolve(&wf(), "approved", json!(false));
        registry.upsert(first.record.unwrap());

        let second = registry.prepare_resolve(&wf(), "approved", json!(true));
        assert_eq!(
            second.outcome,
            ResolveOutcome::AlreadyResolved { existing: json!(false) }
        );
        assert!(second.record.is_none());
        assert_eq!(registry.peek(&wf(), "approved"), Some(&json!(false)));
    }

    #[test]
    fn unsubscribe_only_touches_waiting_invocations() {
        let mut registry = PromiseRegistry::new();
        let a = inv();
        registry.upsert(registry.prepare_subscribe(&wf(), "approved", a));

        assert!(registry.prepare_unsubscribe(&wf(), "approved", inv()).is_none());
        let record = registry.prepare_unsubscribe(&wf(), "approved", a).unwrap();
        assert!(record.waiters.is_empty());
    }

    #[test]
    fn promises_are_scoped_by_key() {
        let mut registry = PromiseRegistry::new();
        let prepared = registry.prepare_resolve(&wf(), "approved", json!(true));
        registry.upsert(prepared.record.unwrap());
        assert_eq!(registry.peek(&ServiceId::new("transfer", "t2"), "approved"), None);
    }
}
