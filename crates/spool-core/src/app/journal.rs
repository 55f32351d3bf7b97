//! Journal replay cursor.
//!
//! A handler re-runs from the top on every attempt. Each step it reaches is
//! matched against the journal entry at the cursor: same name and same kind
//! means the stored outcome is handed back, anything else is a
//! non-deterministic replay. Past the end of the journal, steps are fresh and
//! their outcomes get appended.

use std::collections::HashSet;

use chrono::{DateTime, Utc};

use crate::domain::{HandlerError, Journal, StepKind, StepOutcome, StepRecord};

/// Result of entering a step.
#[derive(Debug, Clone, PartialEq)]
pub enum Entry {
    /// The step is in the journal. Its producer must not run again.
    Replayed(StepRecord),

    /// New work at this ordinal.
    Fresh(u32),
}

#[derive(Debug)]
pub struct JournalReplayer {
    journal: Journal,
    cursor: usize,
    names: HashSet<String>,
    in_flight: Option<String>,
}

fn describe(name: &str, kind: &StepKind) -> String {
    format!("{} '{}'", kind.label(), name)
}

impl JournalReplayer {
    pub fn new(journal: Journal) -> Self {
        Self {
            journal,
            cursor: 0,
            names: HashSet::new(),
            in_flight: None,
        }
    }

    /// Still re-reading journaled steps?
    pub fn is_replaying(&self) -> bool {
        self.cursor < self.journal.len()
    }

    /// Ordinal the next step will get.
    pub fn position(&self) -> usize {
        self.cursor
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub fn enter(&mut self, name: &str, kind: &StepKind) -> Result<Entry, HandlerError> {
        if self.in_flight.is_some() {
            return Err(HandlerError::ConcurrentStep(name.to_string()));
        }
        if !self.names.insert(name.to_string()) {
            return Err(HandlerError::DuplicateStep(name.to_string()));
        }

        let ordinal = self.cursor as u32;
        match self.journal.get(self.cursor) {
            Some(record) => {
                if record.name != name || !record.kind.same_shape(kind) {
                    return Err(HandlerError::NonDeterministic {
                        ordinal,
                        expected: describe(&record.name, &record.kind),
                        actual: describe(name, kind),
                    });
                }
                self.cursor += 1;
                Ok(Entry::Replayed(record.clone()))
            }
            None => {
                self.in_flight = Some(name.to_string());
                Ok(Entry::Fresh(ordinal))
            }
        }
    }

    /// Append the record of the fresh step in flight.
    pub fn record(&mut self, record: StepRecord) -> Result<(), HandlerError> {
        let name = record.name.clone();
        self.journal
            .append(record)
            .map_err(|_| HandlerError::ConcurrentStep(name))?;
        self.in_flight = None;
        self.cursor += 1;
        Ok(())
    }

    /// Drop the fresh step in flight without journaling it, so it can be
    /// entered again under the same name.
    pub fn abandon(&mut self) {
        if let Some(name) = self.in_flight.take() {
            self.names.remove(&name);
        }
    }

    /// Complete a pending sleep/await entry that was replayed.
    pub fn complete_pending(
        &mut self,
        ordinal: u32,
        outcome: StepOutcome,
        at: DateTime<Utc>,
    ) -> Result<(), HandlerError> {
        self.journal
            .complete(ordinal as usize, outcome, at)
            .map_err(|e| HandlerError::NonDeterministic {
                ordinal,
                expected: "pending step".into(),
                actual: e.to_string(),
            })
    }

    pub fn into_journal(self) -> Journal {
        self.journal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn journal_with(names: &[&str]) -> Journal {
        let mut journal = Journal::new();
        for (i, name) in names.iter().enumerate() {
            journal
                .append(StepRecord::completed(
                    i as u32,
                    *name,
                    StepKind::Run,
                    StepOutcome::Value(json!(i)),
                    Utc::now(),
                ))
                .unwrap();
        }
        journal
    }

    #[test]
    fn journaled_steps_replay_then_fresh_steps_follow() {
        let mut replayer = JournalReplayer::new(journal_with(&["token", "withdraw"]));
        assert!(replayer.is_replaying());

        let first = replayer.enter("token", &StepKind::Run).unwrap();
        assert!(matches!(first, Entry::Replayed(r) if r.outcome == StepOutcome::Value(json!(0))));
        replayer.enter("withdraw", &StepKind::Run).unwrap();
        assert!(!replayer.is_replaying());

        assert_eq!(replayer.enter("deposit", &StepKind::Run).unwrap(), Entry::Fresh(2));
        replayer
            .record(StepRecord::completed(
                2,
                "deposit",
                StepKind::Run,
                StepOutcome::Empty,
                Utc::now(),
            ))
            .unwrap();
        assert_eq!(replayer.position(), 3);
        assert_eq!(replayer.into_journal().len(), 3);
    }

    #[test]
    fn renamed_step_is_non_deterministic() {
        let mut replayer = JournalReplayer::new(journal_with(&["token", "withdraw"]));
        replayer.enter("token", &StepKind::Run).unwrap();

        let err = replayer.enter("deposit", &StepKind::Run).unwrap_err();
        assert!(matches!(err, HandlerError::NonDeterministic { ordinal: 1, .. }));
    }

    #[test]
    fn changed_step_kind_is_non_deterministic() {
        let mut replayer = JournalReplayer::new(journal_with(&["balance"]));
        let err = replayer
            .enter("balance", &StepKind::GetState { field: "balance".into() })
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn reused_name_is_a_duplicate_step() {
        let mut replayer = JournalReplayer::new(journal_with(&["deposit"]));
        replayer.enter("deposit", &StepKind::Run).unwrap();
        let err = replayer.enter("deposit", &StepKind::Run).unwrap_err();
        assert_eq!(err, HandlerError::DuplicateStep("deposit".into()));
    }

    #[test]
    fn second_fresh_step_while_one_is_in_flight_is_rejected() {
        let mut replayer = JournalReplayer::new(Journal::new());
        replayer.enter("a", &StepKind::Run).unwrap();
        let err = replayer.enter("b", &StepKind::Run).unwrap_err();
        assert_eq!(err, HandlerError::ConcurrentStep("b".into()));
    }

    #[test]
    fn abandoned_step_can_be_entered_again() {
        let mut replayer = JournalReplayer::new(Journal::new());
        replayer.enter("flaky", &StepKind::Run).unwrap();
        replayer.abandon();
        assert_eq!(replayer.enter("flaky", &StepKind::Run).unwrap(), Entry::Fresh(0));
    }
}
