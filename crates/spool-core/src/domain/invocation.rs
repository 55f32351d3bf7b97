//! Invocation record: the durable unit owned by the scheduler.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::TerminalError;
use super::ids::InvocationId;
use super::journal::Journal;
use super::state::StateDelta;
use super::target::{InvocationTarget, ServiceId};

/// Invocation state machine.
///
/// ```text
/// Admitted(Running) -> Running -> SuspendedOnPromise -> Running -> ...
///                              -> SuspendedOnTimer   -> Running -> ...
///                              -> Completed
///                              -> Failed
/// ```
/// Suspended states go back to `Running` only on the matching resolve/fire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum InvocationStatus {
    Running,
    SuspendedOnPromise { service_id: ServiceId, name: String },
    SuspendedOnTimer { wake_at: DateTime<Utc> },
    Completed,
    Failed,
}

impl InvocationStatus {
    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(&self) -> bool {
        matches!(self, InvocationStatus::Completed | InvocationStatus::Failed)
    }

    pub fn is_suspended(&self) -> bool {
        matches!(
            self,
            InvocationStatus::SuspendedOnPromise { .. } | InvocationStatus::SuspendedOnTimer { .. }
        )
    }
}

/// Final result of a completed invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum InvocationResult {
    Success(serde_json::Value),
    Failure(TerminalError),
}

/// Durable record of one invocation.
///
/// Holds the journal and the state delta that has been journaled but not yet
/// applied to the entity (that happens at the next suspend/complete boundary).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationRecord {
    pub id: InvocationId,
    pub target: InvocationTarget,
    pub input: serde_json::Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,

    pub status: InvocationStatus,
    pub journal: Journal,

    #[serde(default, skip_serializing_if = "StateDelta::is_empty")]
    pub pending_state: StateDelta,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<InvocationResult>,

    /// Number of attempts made (re-admissions included).
    pub attempts: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    #[serde(default)]
    pub cancel_requested: bool,

    /// The cancellation was already raised inside the handler.
    #[serde(default)]
    pub cancel_delivered: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InvocationRecord {
    pub fn new(
        id: InvocationId,
        target: InvocationTarget,
        input: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            target,
            input,
            idempotency_key: None,
            status: InvocationStatus::Running,
            journal: Journal::new(),
            pending_state: StateDelta::new(),
            result: None,
            attempts: 0,
            last_error: None,
            cancel_requested: false,
            cancel_delivered: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Current journal cursor.
    pub fn cursor(&self) -> usize {
        self.journal.len()
    }

    pub fn start_attempt(&mut self, now: DateTime<Utc>) {
        self.status = InvocationStatus::Running;
        self.attempts += 1;
        self.updated_at = now;
    }

    pub fn mark_suspended(&mut self, status: InvocationStatus, now: DateTime<Utc>) {
        debug_assert!(status.is_suspended());
        self.status = status;
        self.updated_at = now;
    }

    pub fn mark_completed(&mut self, value: serde_json::Value, now: DateTime<Utc>) {
        self.status = InvocationStatus::Completed;
        self.result = Some(InvocationResult::Success(value));
        self.updated_at = now;
    }

    pub fn mark_failed(&mut self, error: TerminalError, now: DateTime<Utc>) {
        self.status = InvocationStatus::Failed;
        self.last_error = Some(error.to_string());
        self.result = Some(InvocationResult::Failure(error));
        self.updated_at = now;
    }

    pub fn record_transient(&mut self, error: String, now: DateTime<Utc>) {
        self.last_error = Some(error);
        self.updated_at = now;
    }
}

/// What `invoke` hands back to the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum InvocationResponse {
    Completed {
        id: InvocationId,
        value: serde_json::Value,
    },
    Failed {
        id: InvocationId,
        error: TerminalError,
    },
    /// The invocation is parked on a promise or timer; it resumes on its own.
    Suspended { id: InvocationId },
}

impl InvocationResponse {
    pub fn id(&self) -> InvocationId {
        match self {
            InvocationResponse::Completed { id, .. }
            | InvocationResponse::Failed { id, .. }
            | InvocationResponse::Suspended { id } => *id,
        }
    }

    pub fn value(&self) -> Option<&serde_json::Value> {
        match self {
            InvocationResponse::Completed { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn is_suspended(&self) -> bool {
        matches!(self, InvocationResponse::Suspended { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use ulid::Ulid;

    fn record() -> InvocationRecord {
        InvocationRecord::new(
            InvocationId::from_ulid(Ulid::new()),
            InvocationTarget::keyed("transfer", "run", "t1"),
            json!({"cents": 5_000}),
            Utc::now(),
        )
    }

    #[test]
    fn new_record_is_running_with_empty_journal() {
        let r = record();
        assert_eq!(r.status, InvocationStatus::Running);
        assert_eq!(r.cursor(), 0);
        assert_eq!(r.attempts, 0);
    }

    #[test]
    fn completion_and_failure_are_terminal() {
        let mut r = record();
        r.start_attempt(Utc::now());
        r.mark_completed(json!(true), Utc::now());
        assert!(r.status.is_terminal());
        assert_eq!(r.result, Some(InvocationResult::Success(json!(true))));

        let mut r = record();
        r.mark_failed(TerminalError::new("account unavailable"), Utc::now());
        assert!(r.status.is_terminal());
        assert_eq!(r.last_error.as_deref(), Some("[500] account unavailable"));
    }

    #[test]
    fn suspension_is_not_terminal() {
        let mut r = record();
        r.mark_suspended(
            InvocationStatus::SuspendedOnPromise {
                service_id: ServiceId::new("transfer", "t1"),
                name: "approved".into(),
            },
            Utc::now(),
        );
        assert!(r.status.is_suspended());
        assert!(!r.status.is_terminal());
    }

    #[test]
    fn record_roundtrips_through_json() {
        let mut r = record();
        r.pending_state.set("amount", json!(12_000));
        let back: InvocationRecord =
            serde_json::from_value(serde_json::to_value(&r).unwrap()).unwrap();
        assert_eq!(back, r);
    }
}
