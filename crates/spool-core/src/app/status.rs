use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{
    InvocationId, InvocationRecord, InvocationResult, InvocationStatus, InvocationTarget,
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationCounts {
    pub running: usize,
    pub suspended: usize,
    pub completed: usize,
    pub failed: usize,
}

impl InvocationCounts {
    pub fn tally<'a>(records: impl IntoIterator<Item = &'a InvocationRecord>) -> Self {
        let mut counts = Self::default();
        for record in records {
            match record.status {
                InvocationStatus::Running => counts.running += 1,
                InvocationStatus::SuspendedOnPromise { .. }
                | InvocationStatus::SuspendedOnTimer { .. } => counts.suspended += 1,
                InvocationStatus::Completed => counts.completed += 1,
                InvocationStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    pub fn total(&self) -> usize {
        self.running + self.suspended + self.completed + self.failed
    }
}

/// Read-only view of one invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvocationView {
    pub id: InvocationId,
    pub target: InvocationTarget,
    pub status: InvocationStatus,
    pub attempts: u32,
    pub journal_len: usize,
    pub last_error: Option<String>,
    pub result: Option<InvocationResult>,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&InvocationRecord> for InvocationView {
    fn from(record: &InvocationRecord) -> Self {
        Self {
            id: record.id,
            target: record.target.clone(),
            status: record.status.clone(),
            attempts: record.attempts,
            journal_len: record.journal.len(),
            last_error: record.last_error.clone(),
            result: record.result.clone(),
            cancel_requested: record.cancel_requested,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}
