//! In-memory durable store.
//!
//! Clones share the same tables, so a test can hand one clone to an engine,
//! drop that engine, and start a new one on another clone to simulate a
//! process restart.
//!
//! # 学習ポイント
//! - `Arc<Mutex<..>>` 共有による「再起動」のシミュレーション
//! - `CommitBatch` 単位で全テーブルを一度に書き換える (部分適用なし)

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{
    EntityState, InvocationId, InvocationRecord, PromiseRecord, ServiceId, TimerKey, TimerRecord,
};
use crate::ports::{CommitBatch, DurableStore, IdempotencyEntry, StoreError, StoreSnapshot};

/// Table set shared by the in-memory and file stores.
#[derive(Debug, Clone, Default)]
pub(crate) struct Tables {
    invocations: HashMap<InvocationId, InvocationRecord>,
    entity_state: HashMap<ServiceId, EntityState>,
    promises: HashMap<(ServiceId, String), PromiseRecord>,
    timers: HashMap<TimerKey, TimerRecord>,
    idempotency: HashMap<(String, String), InvocationId>,
}

impl Tables {
    pub(crate) fn apply(&mut self, batch: &CommitBatch) {
        for record in &batch.invocations {
            self.invocations.insert(record.id, record.clone());
        }
        for (service_id, delta) in &batch.state {
            let state = self.entity_state.entry(service_id.clone()).or_default();
            delta.apply_to(state);
            if state.is_empty() {
                self.entity_state.remove(service_id);
            }
        }
        for promise in &batch.promises {
            self.promises.insert(
                (promise.service_id.clone(), promise.name.clone()),
                promise.clone(),
            );
        }
        for timer in &batch.timers {
            self.timers.insert(timer.key(), timer.clone());
        }
        for entry in &batch.idempotency {
            self.idempotency
                .insert((entry.scope.clone(), entry.key.clone()), entry.invocation_id);
        }
    }

    pub(crate) fn snapshot(&self) -> StoreSnapshot {
        let mut invocations: Vec<_> = self.invocations.values().cloned().collect();
        invocations.sort_by_key(|r| r.id);

        let mut entity_state: Vec<_> = self
            .entity_state
            .iter()
            .map(|(id, state)| (id.clone(), state.clone()))
            .collect();
        entity_state.sort_by(|a, b| a.0.cmp(&b.0));

        let mut promises: Vec<_> = self.promises.values().cloned().collect();
        promises.sort_by(|a, b| (&a.service_id, &a.name).cmp(&(&b.service_id, &b.name)));

        let mut timers: Vec<_> = self.timers.values().cloned().collect();
        timers.sort_by_key(|t| (t.wake_at, t.invocation_id));

        let mut idempotency: Vec<_> = self
            .idempotency
            .iter()
            .map(|((scope, key), id)| IdempotencyEntry {
                scope: scope.clone(),
                key: key.clone(),
                invocation_id: *id,
            })
            .collect();
        idempotency.sort_by(|a, b| (&a.scope, &a.key).cmp(&(&b.scope, &b.key)));

        StoreSnapshot {
            invocations,
            entity_state,
            promises,
            timers,
            idempotency,
        }
    }

    pub(crate) fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        let mut tables = Tables::default();
        tables.apply(&CommitBatch {
            invocations: snapshot.invocations,
            state: Vec::new(),
            promises: snapshot.promises,
            timers: snapshot.timers,
            idempotency: snapshot.idempotency,
        });
        tables.entity_state = snapshot.entity_state.into_iter().collect();
        tables
    }
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    tables: Arc<Mutex<Tables>>,
    commits: Arc<AtomicU64>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful commits so far.
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl DurableStore for InMemoryStore {
    async fn load(&self) -> Result<StoreSnapshot, StoreError> {
        Ok(self.tables.lock().await.snapshot())
    }

    async fn commit(&self, batch: &CommitBatch) -> Result<(), StoreError> {
        self.tables.lock().await.apply(batch);
        self.commits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{InvocationTarget, StateDelta, TimerState};
    use chrono::Utc;
    use serde_json::json;
    use ulid::Ulid;

    fn record() -> InvocationRecord {
        InvocationRecord::new(
            InvocationId::from_ulid(Ulid::new()),
            InvocationTarget::keyed("account", "deposit", "A"),
            json!({"cents": 10}),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn commits_are_visible_to_every_clone() {
        let store = InMemoryStore::new();
        let other = store.clone();

        let rec = record();
        let mut delta = StateDelta::new();
        delta.set("balance", json!(100_010));
        let batch =
            CommitBatch::invocation(rec.clone()).with_state(ServiceId::new("account", "A"), delta);
        store.commit(&batch).await.unwrap();

        let snapshot = other.load().await.unwrap();
        assert_eq!(snapshot.invocations, vec![rec]);
        assert_eq!(
            snapshot.entity_state[0].1.get("balance"),
            Some(&json!(100_010))
        );
        assert_eq!(other.commit_count(), 1);
    }

    #[tokio::test]
    async fn timer_upserts_replace_by_key() {
        let store = InMemoryStore::new();
        let armed = TimerRecord::armed(record().id, Utc::now());

        let mut batch = CommitBatch::new();
        batch.timers.push(armed.clone());
        store.commit(&batch).await.unwrap();

        let mut batch = CommitBatch::new();
        batch.timers.push(armed.with_state(TimerState::Fired));
        store.commit(&batch).await.unwrap();

        let snapshot = store.load().await.unwrap();
        assert_eq!(snapshot.timers.len(), 1);
        assert_eq!(snapshot.timers[0].state, TimerState::Fired);
    }

    #[test]
    fn snapshot_roundtrip_rebuilds_tables() {
        let mut tables = Tables::default();
        let rec = record();
        let mut batch = CommitBatch::invocation(rec.clone());
        batch.idempotency.push(IdempotencyEntry {
            scope: "account/A/deposit".into(),
            key: "tok-1".into(),
            invocation_id: rec.id,
        });
        let mut delta = StateDelta::new();
        delta.set("balance", json!(1));
        tables.apply(&batch.with_state(ServiceId::new("account", "A"), delta));

        let rebuilt = Tables::from_snapshot(tables.snapshot());
        assert_eq!(rebuilt.snapshot(), tables.snapshot());
    }
}
