//! Handler context: the API business code runs against.
//!
//! Every operation is a journaled step. On re-execution the context hands
//! back journaled outcomes without repeating the work; past the end of the
//! journal it performs the work and appends the outcome.
//!
//! Anything non-deterministic (randomness, wall-clock time, I/O) must go
//! through `run`, otherwise a replay can take a different path and the
//! invocation fails as non-deterministic.
//!
//! Engine-named steps carry the journal ordinal in their name
//! (`sleep#3`, `get:balance#0`, `call:account/deposit#5`), so they never
//! collide with caller-chosen names.

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::engine::Engine;
use super::journal::{Entry, JournalReplayer};
use crate::domain::{
    EntityState, HandlerError, HandlerKind, IdempotencyToken, InvocationId, InvocationTarget,
    Journal, ResolveOutcome, ServiceId, StateDelta, StepKind, StepOutcome, StepRecord,
    TerminalError,
};
use crate::ports::CallError;
use crate::typed::codec::{self, BAD_REQUEST};

/// What an attempt stopped on.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Suspension {
    Promise { service_id: ServiceId, name: String },
    Timer { wake_at: DateTime<Utc> },
}

/// Everything the engine needs from a finished attempt.
#[derive(Debug)]
pub(crate) struct AttemptOutcome {
    pub journal: Journal,
    pub pending_state: StateDelta,
    pub suspension: Option<Suspension>,
    pub fatal: Option<HandlerError>,
    pub cancel_delivered: bool,
    pub position: usize,
}

/// Inputs of one attempt.
pub(crate) struct ContextSeed {
    pub invocation_id: InvocationId,
    pub target: InvocationTarget,
    pub kind: HandlerKind,
    pub journal: Journal,
    pub pending_state: StateDelta,
    pub base_state: EntityState,
    pub fired_timers: HashSet<DateTime<Utc>>,
    pub cancel: Arc<AtomicBool>,
    pub cancel_delivered: bool,
    /// Replay only: any step past the journal is an error and nothing is committed.
    pub dry_run: bool,
}

struct Progress {
    replayer: JournalReplayer,
    pending_state: StateDelta,
    suspension: Option<Suspension>,
    fatal: Option<HandlerError>,
    cancel_delivered: bool,
}

struct ContextInner {
    engine: Engine,
    invocation_id: InvocationId,
    target: InvocationTarget,
    kind: HandlerKind,
    service_id: Option<ServiceId>,
    base_state: EntityState,
    fired_timers: HashSet<DateTime<Utc>>,
    cancel: Arc<AtomicBool>,
    dry_run: bool,
    progress: Mutex<Progress>,
}

/// Handle passed to every handler invocation. Cheap to clone.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    pub(crate) fn new(engine: Engine, seed: ContextSeed) -> Self {
        let service_id = seed.target.service_id();
        Self {
            inner: Arc::new(ContextInner {
                engine,
                invocation_id: seed.invocation_id,
                target: seed.target,
                kind: seed.kind,
                service_id,
                base_state: seed.base_state,
                fired_timers: seed.fired_timers,
                cancel: seed.cancel,
                dry_run: seed.dry_run,
                progress: Mutex::new(Progress {
                    replayer: JournalReplayer::new(seed.journal),
                    pending_state: seed.pending_state,
                    suspension: None,
                    fatal: None,
                    cancel_delivered: seed.cancel_delivered,
                }),
            }),
        }
    }

    pub fn invocation_id(&self) -> InvocationId {
        self.inner.invocation_id
    }

    pub fn target(&self) -> &InvocationTarget {
        &self.inner.target
    }

    /// Entity key; `None` on stateless services.
    pub fn key(&self) -> Option<&str> {
        self.inner.target.key.as_deref()
    }

    pub fn service_id(&self) -> Option<&ServiceId> {
        self.inner.service_id.as_ref()
    }

    pub fn handler_kind(&self) -> HandlerKind {
        self.inner.kind
    }

    /// True while the handler is re-reading journaled steps.
    pub fn is_replaying(&self) -> bool {
        self.progress().replayer.is_replaying()
    }

    /// Token derived from the invocation id and the current journal position.
    ///
    /// Stable across replays without a journal entry of its own. Two tokens
    /// taken at the same position (no step in between) are equal.
    pub fn deterministic_token(&self) -> IdempotencyToken {
        let position = self.progress().replayer.position();
        IdempotencyToken::new(format!("{}-{}", self.inner.invocation_id, position))
    }

    /// Run a side effect at most once per invocation.
    ///
    /// Transient producer errors are retried in place with the step retry
    /// policy; when that runs out the error propagates and nothing is
    /// journaled. A terminal error is journaled and reproduced on replay.
    pub async fn run<T, F, Fut>(&self, name: &str, mut producer: F) -> Result<T, HandlerError>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, HandlerError>>,
    {
        let kind = StepKind::Run;
        let ordinal = match self.enter(name, &kind)? {
            Entry::Replayed(record) => return replayed(record),
            Entry::Fresh(ordinal) => ordinal,
        };
        if self.deliver_cancellation() {
            return self.fail_step(ordinal, name, kind, TerminalError::cancelled()).await;
        }

        let retry = self.inner.engine.config().step_retry.clone();
        let mut attempts = 0;
        let produced = loop {
            attempts += 1;
            match producer().await {
                Ok(value) => break Ok(value),
                Err(HandlerError::Terminal(e)) => break Err(e),
                Err(HandlerError::Transient(reason)) if retry.should_retry(attempts) => {
                    let delay = retry.next_delay(attempts);
                    warn!(
                        invocation.id = %self.inner.invocation_id,
                        step = name,
                        attempts,
                        ?delay,
                        %reason,
                        "step failed transiently, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(other) => {
                    self.progress().replayer.abandon();
                    return Err(other);
                }
            }
        };

        let stored = produced.and_then(|value| {
            serde_json::to_value(&value)
                .map(|json| (json, value))
                .map_err(|e| TerminalError::new(format!("cannot encode step '{name}': {e}")))
        });
        match stored {
            Ok((json, value)) => {
                self.append(ordinal, name, kind, StepOutcome::Value(json))?;
                self.checkpoint().await?;
                debug!(invocation.id = %self.inner.invocation_id, step = name, "step journaled");
                Ok(value)
            }
            Err(e) => self.fail_step(ordinal, name, kind, e).await,
        }
    }

    /// Read a state field of this entity.
    ///
    /// Sees this invocation's own uncommitted writes. The value read is
    /// journaled, so a replay observes it again even if another invocation
    /// changed the field while this one was suspended.
    pub fn get_state<T: DeserializeOwned>(&self, field: &str) -> Result<Option<T>, HandlerError> {
        self.require_state()?;
        let name = self.auto_name(&format!("get:{field}"));
        let kind = StepKind::GetState {
            field: field.to_string(),
        };
        let value = match self.enter(&name, &kind)? {
            Entry::Replayed(record) => match record.outcome {
                StepOutcome::Value(v) => Some(v),
                StepOutcome::Failure(e) => return Err(HandlerError::Terminal(e)),
                StepOutcome::Empty | StepOutcome::Pending => None,
            },
            Entry::Fresh(ordinal) => {
                let mut progress = self.progress();
                let current = progress
                    .pending_state
                    .read(&self.inner.base_state, field)
                    .cloned();
                let outcome = current.clone().map_or(StepOutcome::Empty, StepOutcome::Value);
                self.append_locked(&mut progress, ordinal, &name, kind, outcome)?;
                current
            }
        };
        value.map(|v| codec::decode(field, v)).transpose()
    }

    /// Buffer a write. It becomes visible to other invocations at the next
    /// suspension or at completion.
    pub fn set_state<T: Serialize + ?Sized>(&self, field: &str, value: &T) -> Result<(), HandlerError> {
        self.require_writable()?;
        let json = codec::encode(field, value)?;
        let name = self.auto_name(&format!("set:{field}"));
        let kind = StepKind::SetState {
            field: field.to_string(),
        };
        if let Entry::Fresh(ordinal) = self.enter(&name, &kind)? {
            let mut progress = self.progress();
            progress.pending_state.set(field, json);
            self.append_locked(&mut progress, ordinal, &name, kind, StepOutcome::Empty)?;
        }
        Ok(())
    }

    pub fn clear_state(&self, field: &str) -> Result<(), HandlerError> {
        self.require_writable()?;
        let name = self.auto_name(&format!("clear:{field}"));
        let kind = StepKind::ClearState {
            field: field.to_string(),
        };
        if let Entry::Fresh(ordinal) = self.enter(&name, &kind)? {
            let mut progress = self.progress();
            progress.pending_state.clear(field);
            self.append_locked(&mut progress, ordinal, &name, kind, StepOutcome::Empty)?;
        }
        Ok(())
    }

    /// Durable sleep. The invocation suspends and a timer resumes it.
    pub async fn sleep(&self, duration: Duration) -> Result<(), HandlerError> {
        let duration = chrono::Duration::from_std(duration).map_err(|e| {
            HandlerError::Terminal(TerminalError::with_code(BAD_REQUEST, format!("sleep: {e}")))
        })?;
        self.sleep_until(self.inner.engine.now() + duration).await
    }

    /// Durable sleep until a wall-clock deadline.
    pub async fn sleep_until(&self, wake_at: DateTime<Utc>) -> Result<(), HandlerError> {
        let name = self.auto_name("sleep");
        let kind = StepKind::Sleep { wake_at };
        match self.enter(&name, &kind)? {
            Entry::Replayed(record) => match record.outcome {
                StepOutcome::Failure(e) => Err(HandlerError::Terminal(e)),
                StepOutcome::Pending => {
                    let StepKind::Sleep { wake_at } = record.kind else {
                        return Ok(());
                    };
                    if self.deliver_cancellation() {
                        return self
                            .fail_pending(record.ordinal, TerminalError::cancelled())
                            .await;
                    }
                    if !self.inner.dry_run && self.inner.fired_timers.contains(&wake_at) {
                        self.complete_pending(record.ordinal, StepOutcome::Empty)?;
                        Ok(())
                    } else {
                        self.suspend(Suspension::Timer { wake_at })
                    }
                }
                StepOutcome::Empty | StepOutcome::Value(_) => Ok(()),
            },
            Entry::Fresh(ordinal) => {
                if self.deliver_cancellation() {
                    return self.fail_step(ordinal, &name, kind, TerminalError::cancelled()).await;
                }
                self.append_pending(ordinal, &name, kind)?;
                self.suspend(Suspension::Timer { wake_at })
            }
        }
    }

    /// Wait for a durable promise of this entity/workflow.
    pub async fn await_promise<T: DeserializeOwned>(&self, name: &str) -> Result<T, HandlerError> {
        let service_id = self.require_key("promises")?;
        let step = self.auto_name(&format!("promise:{name}"));
        let kind = StepKind::AwaitPromise {
            name: name.to_string(),
        };
        match self.enter(&step, &kind)? {
            Entry::Replayed(record) => match record.outcome {
                StepOutcome::Value(v) => codec::decode(name, v),
                StepOutcome::Empty => codec::decode(name, serde_json::Value::Null),
                StepOutcome::Failure(e) => Err(HandlerError::Terminal(e)),
                StepOutcome::Pending => {
                    if self.deliver_cancellation() {
                        return self
                            .fail_pending(record.ordinal, TerminalError::cancelled())
                            .await;
                    }
                    let resolved = if self.inner.dry_run {
                        None
                    } else {
                        self.inner.engine.peek_promise(&service_id, name).await
                    };
                    match resolved {
                        Some(value) => {
                            self.complete_pending(record.ordinal, StepOutcome::Value(value.clone()))?;
                            codec::decode(name, value)
                        }
                        None => self.suspend(Suspension::Promise {
                            service_id,
                            name: name.to_string(),
                        }),
                    }
                }
            },
            Entry::Fresh(ordinal) => {
                if self.deliver_cancellation() {
                    return self.fail_step(ordinal, &step, kind, TerminalError::cancelled()).await;
                }
                match self.inner.engine.peek_promise(&service_id, name).await {
                    Some(value) => {
                        self.append(ordinal, &step, kind, StepOutcome::Value(value.clone()))?;
                        codec::decode(name, value)
                    }
                    None => {
                        self.append_pending(ordinal, &step, kind)?;
                        self.suspend(Suspension::Promise {
                            service_id,
                            name: name.to_string(),
                        })
                    }
                }
            }
        }
    }

    /// Resolve a durable promise of this entity/workflow. First resolution wins.
    pub async fn resolve_promise<T: Serialize + ?Sized>(
        &self,
        name: &str,
        value: &T,
    ) -> Result<ResolveOutcome, HandlerError> {
        let service_id = self.require_key("promises")?;
        let json = codec::encode(name, value)?;
        let step = self.auto_name(&format!("resolve:{name}"));
        let kind = StepKind::ResolvePromise {
            name: name.to_string(),
        };
        match self.enter(&step, &kind)? {
            Entry::Replayed(record) => match record.outcome {
                StepOutcome::Value(v) => codec::decode("resolve outcome", v),
                StepOutcome::Failure(e) => Err(HandlerError::Terminal(e)),
                StepOutcome::Empty | StepOutcome::Pending => Ok(ResolveOutcome::Resolved),
            },
            Entry::Fresh(ordinal) => {
                let outcome = match self
                    .inner
                    .engine
                    .resolve_promise_value(service_id, name, json)
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        self.progress().replayer.abandon();
                        return Err(HandlerError::Transient(e.to_string()));
                    }
                };
                let stored = codec::encode("resolve outcome", &outcome)?;
                self.append(ordinal, &step, kind, StepOutcome::Value(stored))?;
                self.checkpoint().await?;
                Ok(outcome)
            }
        }
    }

    /// Request/response call to another handler, de-duplicated on `token`.
    ///
    /// Terminal failures of the callee come back as `HandlerError::Terminal`
    /// and are journaled; transient ones are retried by the call adapter.
    pub async fn call<I, O>(
        &self,
        target: &InvocationTarget,
        token: &IdempotencyToken,
        input: &I,
    ) -> Result<O, HandlerError>
    where
        I: Serialize + ?Sized,
        O: DeserializeOwned,
    {
        let name = self.auto_name(&format!("call:{}/{}", target.service, target.handler));
        let kind = StepKind::Call {
            target: target.clone(),
            token: token.clone(),
        };
        let ordinal = match self.enter(&name, &kind)? {
            Entry::Replayed(record) => return replayed(record),
            Entry::Fresh(ordinal) => ordinal,
        };
        if self.deliver_cancellation() {
            return self.fail_step(ordinal, &name, kind, TerminalError::cancelled()).await;
        }
        let payload = match codec::encode("call input", input) {
            Ok(payload) => payload,
            Err(e) => {
                self.progress().replayer.abandon();
                return Err(e);
            }
        };

        match self.inner.engine.calls().call(target, token, payload).await {
            Ok(value) => {
                self.append(ordinal, &name, kind, StepOutcome::Value(value.clone()))?;
                self.checkpoint().await?;
                codec::decode("call output", value)
            }
            Err(CallError::Terminal(e)) => self.fail_step(ordinal, &name, kind, e).await,
            Err(CallError::Transient(reason)) => {
                self.progress().replayer.abandon();
                Err(HandlerError::Transient(reason))
            }
        }
    }

    /// Fire-and-forget submission. At least once: the target may see it again
    /// if this invocation crashes between submitting and journaling.
    pub async fn send<I: Serialize + ?Sized>(
        &self,
        target: &InvocationTarget,
        input: &I,
    ) -> Result<(), HandlerError> {
        let name = self.auto_name(&format!("send:{}/{}", target.service, target.handler));
        let kind = StepKind::Send {
            target: target.clone(),
        };
        let ordinal = match self.enter(&name, &kind)? {
            Entry::Replayed(record) => return replayed::<()>(record),
            Entry::Fresh(ordinal) => ordinal,
        };
        if self.deliver_cancellation() {
            return self.fail_step(ordinal, &name, kind, TerminalError::cancelled()).await;
        }
        let payload = match codec::encode("send input", input) {
            Ok(payload) => payload,
            Err(e) => {
                self.progress().replayer.abandon();
                return Err(e);
            }
        };

        match self.inner.engine.calls().send(target, payload).await {
            Ok(()) => {
                self.append(ordinal, &name, kind, StepOutcome::Empty)?;
                self.checkpoint().await
            }
            Err(CallError::Terminal(e)) => self.fail_step(ordinal, &name, kind, e).await,
            Err(CallError::Transient(reason)) => {
                self.progress().replayer.abandon();
                Err(HandlerError::Transient(reason))
            }
        }
    }

    pub(crate) fn finish(&self) -> AttemptOutcome {
        let progress = self.progress();
        AttemptOutcome {
            journal: progress.replayer.journal().clone(),
            pending_state: progress.pending_state.clone(),
            suspension: progress.suspension.clone(),
            fatal: progress.fatal.clone(),
            cancel_delivered: progress.cancel_delivered,
            position: progress.replayer.position(),
        }
    }

    fn progress(&self) -> MutexGuard<'_, Progress> {
        self.inner
            .progress
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    fn auto_name(&self, prefix: &str) -> String {
        format!("{prefix}#{}", self.progress().replayer.position())
    }

    /// Enter a step. A suspension or fatal error raised earlier in this
    /// attempt is raised again, even if the handler swallowed it.
    fn enter(&self, name: &str, kind: &StepKind) -> Result<Entry, HandlerError> {
        let mut progress = self.progress();
        if let Some(fatal) = &progress.fatal {
            return Err(fatal.clone());
        }
        if progress.suspension.is_some() {
            return Err(HandlerError::Suspended);
        }

        let entered = progress.replayer.enter(name, kind);
        let entered = match entered {
            Ok(Entry::Fresh(ordinal)) if self.inner.dry_run => Err(HandlerError::NonDeterministic {
                ordinal,
                expected: "end of journal".into(),
                actual: format!("{} '{}'", kind.label(), name),
            }),
            other => other,
        };
        if let Err(e) = &entered
            && e.is_fatal()
        {
            progress.fatal = Some(e.clone());
        }
        entered
    }

    fn deliver_cancellation(&self) -> bool {
        let mut progress = self.progress();
        if !progress.cancel_delivered && self.inner.cancel.load(Ordering::SeqCst) {
            progress.cancel_delivered = true;
            true
        } else {
            false
        }
    }

    fn suspend<T>(&self, suspension: Suspension) -> Result<T, HandlerError> {
        debug!(invocation.id = %self.inner.invocation_id, ?suspension, "suspending");
        self.progress().suspension = Some(suspension);
        Err(HandlerError::Suspended)
    }

    fn append(
        &self,
        ordinal: u32,
        name: &str,
        kind: StepKind,
        outcome: StepOutcome,
    ) -> Result<(), HandlerError> {
        let mut progress = self.progress();
        self.append_locked(&mut progress, ordinal, name, kind, outcome)
    }

    fn append_locked(
        &self,
        progress: &mut Progress,
        ordinal: u32,
        name: &str,
        kind: StepKind,
        outcome: StepOutcome,
    ) -> Result<(), HandlerError> {
        let record = StepRecord::completed(ordinal, name, kind, outcome, self.inner.engine.now());
        progress.replayer.record(record).inspect_err(|e| {
            progress.fatal = Some(e.clone());
        })
    }

    fn append_pending(&self, ordinal: u32, name: &str, kind: StepKind) -> Result<(), HandlerError> {
        let mut progress = self.progress();
        let record = StepRecord::pending(ordinal, name, kind);
        let appended = progress.replayer.record(record);
        if let Err(e) = &appended {
            progress.fatal = Some(e.clone());
        }
        appended
    }

    fn complete_pending(&self, ordinal: u32, outcome: StepOutcome) -> Result<(), HandlerError> {
        let now = self.inner.engine.now();
        let mut progress = self.progress();
        let completed = progress.replayer.complete_pending(ordinal, outcome, now);
        if let Err(e) = &completed {
            progress.fatal = Some(e.clone());
        }
        completed
    }

    async fn fail_step<T>(
        &self,
        ordinal: u32,
        name: &str,
        kind: StepKind,
        error: TerminalError,
    ) -> Result<T, HandlerError> {
        self.append(ordinal, name, kind, StepOutcome::Failure(error.clone()))?;
        self.checkpoint().await?;
        debug!(invocation.id = %self.inner.invocation_id, step = name, %error, "step failed terminally");
        Err(HandlerError::Terminal(error))
    }

    async fn fail_pending<T>(&self, ordinal: u32, error: TerminalError) -> Result<T, HandlerError> {
        self.complete_pending(ordinal, StepOutcome::Failure(error.clone()))?;
        self.checkpoint().await?;
        Err(HandlerError::Terminal(error))
    }

    /// Persist the journal and the buffered state delta (not yet applied).
    async fn checkpoint(&self) -> Result<(), HandlerError> {
        if self.inner.dry_run {
            return Ok(());
        }
        let (journal, pending_state, cancel_delivered) = {
            let progress = self.progress();
            (
                progress.replayer.journal().clone(),
                progress.pending_state.clone(),
                progress.cancel_delivered,
            )
        };
        self.inner
            .engine
            .checkpoint(self.inner.invocation_id, journal, pending_state, cancel_delivered)
            .await
            .map_err(|e| HandlerError::Transient(format!("checkpoint failed: {e}")))
    }

    fn require_state(&self) -> Result<(), HandlerError> {
        self.require_key("state").map(|_| ())
    }

    fn require_key(&self, what: &str) -> Result<ServiceId, HandlerError> {
        self.inner.service_id.clone().ok_or_else(|| {
            HandlerError::Terminal(TerminalError::with_code(
                BAD_REQUEST,
                format!("{what} need a keyed service, '{}' has no key", self.inner.target),
            ))
        })
    }

    fn require_writable(&self) -> Result<(), HandlerError> {
        self.require_state()?;
        if self.inner.kind.can_write_state() {
            Ok(())
        } else {
            Err(HandlerError::Terminal(TerminalError::with_code(
                BAD_REQUEST,
                format!("{:?} handler '{}' cannot write state", self.inner.kind, self.inner.target),
            )))
        }
    }
}

/// Hand back a journaled outcome.
fn replayed<T: DeserializeOwned>(record: StepRecord) -> Result<T, HandlerError> {
    match record.outcome {
        StepOutcome::Value(v) => codec::decode(&record.name, v),
        StepOutcome::Empty => codec::decode(&record.name, serde_json::Value::Null),
        StepOutcome::Failure(e) => Err(HandlerError::Terminal(e)),
        StepOutcome::Pending => Err(HandlerError::NonDeterministic {
            ordinal: record.ordinal,
            expected: format!("{} '{}' (pending)", record.kind.label(), record.name),
            actual: "completed step".into(),
        }),
    }
}
