//! Durable timer records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::InvocationId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerState {
    Armed,
    Fired,
    Cancelled,
}

/// Timers are identified by (owning invocation, wall-clock deadline).
pub type TimerKey = (InvocationId, DateTime<Utc>);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerRecord {
    pub invocation_id: InvocationId,
    pub wake_at: DateTime<Utc>,
    pub state: TimerState,
}

impl TimerRecord {
    pub fn armed(invocation_id: InvocationId, wake_at: DateTime<Utc>) -> Self {
        Self {
            invocation_id,
            wake_at,
            state: TimerState::Armed,
        }
    }

    pub fn key(&self) -> TimerKey {
        (self.invocation_id, self.wake_at)
    }

    pub fn is_armed(&self) -> bool {
        self.state == TimerState::Armed
    }

    pub fn with_state(&self, state: TimerState) -> Self {
        Self {
            state,
            ..self.clone()
        }
    }
}
