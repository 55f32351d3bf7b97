//! Durable timer service.
//!
//! Timer records live in a map keyed by (invocation, deadline); armed ones are
//! also queued in a min-heap on their wall-clock deadline. Heap entries are
//! never removed eagerly: a cancelled or fired timer leaves a stale entry that
//! is skipped when it surfaces.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::domain::{InvocationId, TimerKey, TimerRecord, TimerState};

#[derive(Debug, Default)]
pub struct TimerService {
    records: HashMap<TimerKey, TimerRecord>,
    queue: BinaryHeap<Reverse<TimerKeyOrd>>,
}

/// Heap ordering: deadline first, invocation id to break ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct TimerKeyOrd(DateTime<Utc>, InvocationId);

impl TimerService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: impl IntoIterator<Item = TimerRecord>) -> Self {
        let mut service = Self::new();
        for record in records {
            service.upsert(record);
        }
        service
    }

    pub fn get(&self, key: &TimerKey) -> Option<&TimerRecord> {
        self.records.get(key)
    }

    pub fn state(&self, invocation: InvocationId, wake_at: DateTime<Utc>) -> Option<TimerState> {
        self.records.get(&(invocation, wake_at)).map(|r| r.state)
    }

    /// Armed record to commit, or `None` if this timer already exists.
    pub fn prepare_arm(
        &self,
        invocation: InvocationId,
        wake_at: DateTime<Utc>,
    ) -> Option<TimerRecord> {
        (!self.records.contains_key(&(invocation, wake_at)))
            .then(|| TimerRecord::armed(invocation, wake_at))
    }

    /// Fired version of an armed timer.
    pub fn prepare_fire(&self, key: &TimerKey) -> Option<TimerRecord> {
        self.records
            .get(key)
            .filter(|r| r.is_armed())
            .map(|r| r.with_state(TimerState::Fired))
    }

    /// Cancelled versions of every armed timer of an invocation.
    pub fn prepare_cancel_all(&self, invocation: InvocationId) -> Vec<TimerRecord> {
        self.records
            .values()
            .filter(|r| r.invocation_id == invocation && r.is_armed())
            .map(|r| r.with_state(TimerState::Cancelled))
            .collect()
    }

    /// Deadlines of an invocation's fired timers.
    pub fn fired_for(&self, invocation: InvocationId) -> HashSet<DateTime<Utc>> {
        self.records
            .values()
            .filter(|r| r.invocation_id == invocation && r.state == TimerState::Fired)
            .map(|r| r.wake_at)
            .collect()
    }

    pub fn upsert(&mut self, record: TimerRecord) {
        if record.is_armed() {
            self.queue
                .push(Reverse(TimerKeyOrd(record.wake_at, record.invocation_id)));
        }
        self.records.insert(record.key(), record);
    }

    /// Pop every armed timer due at `now` and return the fired records to commit.
    ///
    /// Popped entries leave the heap; if the commit fails, hand them back with
    /// `requeue`.
    pub fn take_due(&mut self, now: DateTime<Utc>) -> Vec<TimerRecord> {
        let mut due = Vec::new();
        while let Some(Reverse(TimerKeyOrd(wake_at, invocation))) = self.queue.peek().copied() {
            if wake_at > now {
                break;
            }
            self.queue.pop();
            if let Some(fired) = self.prepare_fire(&(invocation, wake_at)) {
                due.push(fired);
            }
        }
        due
    }

    pub fn requeue(&mut self, keys: impl IntoIterator<Item = TimerKey>) {
        for (invocation, wake_at) in keys {
            self.queue.push(Reverse(TimerKeyOrd(wake_at, invocation)));
        }
    }

    /// Earliest armed deadline. Drops stale heap entries on the way.
    pub fn next_deadline(&mut self) -> Option<DateTime<Utc>> {
        while let Some(Reverse(TimerKeyOrd(wake_at, invocation))) = self.queue.peek().copied() {
            if self
                .records
                .get(&(invocation, wake_at))
                .is_some_and(TimerRecord::is_armed)
            {
                return Some(wake_at);
            }
            self.queue.pop();
        }
        None
    }

    #[cfg(test)]
    fn armed_count(&self) -> usize {
        self.records.values().filter(|r| r.is_armed()).count()
    }
}
