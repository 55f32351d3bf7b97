//! Step journal records.
//!
//! A journal is the per-invocation append-only log of step outcomes and the
//! replay source of truth. Records are never reordered or removed. The only
//! mutation allowed is completing a `Pending` record (a sleep or a promise
//! await) exactly once.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::TerminalError;
use super::ids::IdempotencyToken;
use super::target::InvocationTarget;

/// What a journal entry stands for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    /// A side-effecting closure run through `Context::run`.
    Run,
    GetState { field: String },
    SetState { field: String },
    ClearState { field: String },
    Sleep { wake_at: DateTime<Utc> },
    AwaitPromise { name: String },
    ResolvePromise { name: String },
    Call {
        target: InvocationTarget,
        token: IdempotencyToken,
    },
    Send { target: InvocationTarget },
}

impl StepKind {
    /// Whether a re-execution produced the same kind of step.
    ///
    /// Sleep deadlines are computed from the clock, so only the variant is
    /// compared for them.
    pub fn same_shape(&self, other: &StepKind) -> bool {
        match (self, other) {
            (StepKind::Sleep { .. }, StepKind::Sleep { .. }) => true,
            (a, b) => a == b,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            StepKind::Run => "run",
            StepKind::GetState { .. } => "get_state",
            StepKind::SetState { .. } => "set_state",
            StepKind::ClearState { .. } => "clear_state",
            StepKind::Sleep { .. } => "sleep",
            StepKind::AwaitPromise { .. } => "await_promise",
            StepKind::ResolvePromise { .. } => "resolve_promise",
            StepKind::Call { .. } => "call",
            StepKind::Send { .. } => "send",
        }
    }
}

/// Result stored for a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum StepOutcome {
    /// Waiting on a timer or promise.
    Pending,

    /// Completed without a value (state writes, sleeps, sends, absent state reads).
    Empty,

    Value(serde_json::Value),

    /// Terminal failure; replay reproduces it without re-running the producer.
    Failure(TerminalError),
}

impl StepOutcome {
    pub fn is_pending(&self) -> bool {
        matches!(self, StepOutcome::Pending)
    }
}

/// One entry in the step journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub name: String,
    pub ordinal: u32,
    pub kind: StepKind,
    pub outcome: StepOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl StepRecord {
    pub fn completed(
        ordinal: u32,
        name: impl Into<String>,
        kind: StepKind,
        outcome: StepOutcome,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.into(),
            ordinal,
            kind,
            outcome,
            completed_at: Some(at),
        }
    }

    pub fn pending(ordinal: u32, name: impl Into<String>, kind: StepKind) -> Self {
        Self {
            name: name.into(),
            ordinal,
            kind,
            outcome: StepOutcome::Pending,
            completed_at: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        !self.outcome.is_pending()
    }
}

/// Ordered list of step records of one invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Journal {
    entries: Vec<StepRecord>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, ordinal: usize) -> Option<&StepRecord> {
        self.entries.get(ordinal)
    }

    pub fn entries(&self) -> &[StepRecord] {
        &self.entries
    }

    /// Append a record. Its ordinal must equal the current length.
    pub fn append(&mut self, record: StepRecord) -> Result<(), JournalError> {
        if record.ordinal as usize != self.entries.len() {
            return Err(JournalError::OrdinalGap {
                expected: self.entries.len() as u32,
                actual: record.ordinal,
            });
        }
        self.entries.push(record);
        Ok(())
    }

    /// Complete a pending record. Completed records are immutable.
    pub fn complete(
        &mut self,
        ordinal: usize,
        outcome: StepOutcome,
        at: DateTime<Utc>,
    ) -> Result<(), JournalError> {
        let entry = self
            .entries
            .get_mut(ordinal)
            .ok_or(JournalError::MissingEntry(ordinal as u32))?;
        if entry.is_completed() {
            return Err(JournalError::AlreadyCompleted(entry.name.clone()));
        }
        entry.outcome = outcome;
        entry.completed_at = Some(at);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JournalError {
    #[error("journal append out of order: expected ordinal {expected}, got {actual}")]
    OrdinalGap { expected: u32, actual: u32 },

    #[error("no journal entry at ordinal {0}")]
    MissingEntry(u32),

    #[error("journal entry '{0}' is already completed")]
    AlreadyCompleted(String),
}
