//! DurableStore port - the engine's source of truth.
//!
//! The engine keeps every table in memory and writes through this port. A
//! `CommitBatch` is the unit of atomicity: the state delta, the journal
//! advancement and the suspend marker of one boundary land together or not at
//! all.
//!
//! # Implementations
//! - **InMemoryStore**: tests and demos; survives engine restarts within one process.
//! - **FileStore**: JSON snapshot on disk, replaced atomically per commit.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{
    EntityState, InvocationId, InvocationRecord, PromiseRecord, ServiceId, StateDelta,
    TimerRecord,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store backend error: {0}")]
    Backend(String),
}

/// Maps an idempotency key within a scope to the invocation that owns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyEntry {
    pub scope: String,
    pub key: String,
    pub invocation_id: InvocationId,
}

/// Everything the engine needs to rebuild itself after a restart.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub invocations: Vec<InvocationRecord>,
    pub entity_state: Vec<(ServiceId, EntityState)>,
    pub promises: Vec<PromiseRecord>,
    pub timers: Vec<TimerRecord>,
    pub idempotency: Vec<IdempotencyEntry>,
}

/// One atomic write.
///
/// Records are upserts keyed by their natural identity. State deltas are
/// applied on top of the entity's committed state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommitBatch {
    pub invocations: Vec<InvocationRecord>,
    pub state: Vec<(ServiceId, StateDelta)>,
    pub promises: Vec<PromiseRecord>,
    pub timers: Vec<TimerRecord>,
    pub idempotency: Vec<IdempotencyEntry>,
}

impl CommitBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn invocation(record: InvocationRecord) -> Self {
        Self {
            invocations: vec![record],
            ..Self::default()
        }
    }

    /// Adds a state delta, skipping empty ones.
    pub fn with_state(mut self, service_id: ServiceId, delta: StateDelta) -> Self {
        if !delta.is_empty() {
            self.state.push((service_id, delta));
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.invocations.is_empty()
            && self.state.is_empty()
            && self.promises.is_empty()
            && self.timers.is_empty()
            && self.idempotency.is_empty()
    }
}

#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Read everything. Called once when an engine starts.
    async fn load(&self) -> Result<StoreSnapshot, StoreError>;

    /// Persist a batch atomically. On `Err` nothing of the batch is durable.
    async fn commit(&self, batch: &CommitBatch) -> Result<(), StoreError>;
}
