//! Engine - scheduler, recovery and public API.
//!
//! All durable tables live in one `EngineState` behind a tokio mutex. Every
//! change follows the same path: prepare a `CommitBatch`, commit it to the
//! store, then apply it to memory, all under that mutex. If the commit fails
//! the in-memory view is untouched.
//!
//! Lock order: an entity key is always awaited before the state mutex, never
//! the other way round. Places in a key queue are reserved under the state
//! mutex at admission, which only touches the queue's own std mutex.
//!
//! Each invocation is driven by at most one task. A resume arriving while
//! that task runs only marks it for another pass.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{Mutex as AsyncMutex, Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::call_adapter::CallAdapter;
use super::config::EngineConfig;
use super::context::{AttemptOutcome, Context, ContextSeed, Suspension};
use super::key_lock::KeyLocks;
use super::promises::PromiseRegistry;
use super::state_store::EntityStateStore;
use super::status::{InvocationCounts, InvocationView};
use super::timer_loop;
use super::timers::TimerService;
use crate::domain::{
    EntityState, HandlerError, HandlerKind, InvocationId, InvocationRecord, InvocationResponse,
    InvocationResult, InvocationStatus, InvocationTarget, Journal, ResolveOutcome, ServiceId,
    StateDelta, TerminalError, TimerRecord, TimerState,
};
use crate::error::SpoolError;
use crate::impls::LocalServiceClient;
use crate::ports::{
    Clock, CommitBatch, DurableStore, IdGenerator, IdempotencyEntry, ServiceClient, StoreError,
    StoreSnapshot,
};
use crate::typed::ServiceRegistry;

/// Idempotency scope of workflow bodies: one `run` per workflow key.
const WORKFLOW_SCOPE: &str = "workflow";

/// A request to start an invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationRequest {
    pub target: InvocationTarget,
    pub payload: serde_json::Value,

    /// Requests with the same key on the same target attach to one invocation.
    pub idempotency_key: Option<String>,
}

impl InvocationRequest {
    pub fn new(target: InvocationTarget, payload: serde_json::Value) -> Self {
        Self {
            target,
            payload,
            idempotency_key: None,
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// Outcome of re-running a finished invocation against its journal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayReport {
    /// Every journaled step was reproduced and the result matched.
    Reproduced { steps: usize },
    Diverged { reason: String },
}

impl ReplayReport {
    pub fn is_reproduced(&self) -> bool {
        matches!(self, ReplayReport::Reproduced { .. })
    }
}

/// Everything an engine is wired from. Built by `EngineBuilder`.
pub(crate) struct EngineParts {
    pub registry: ServiceRegistry,
    pub store: Arc<dyn DurableStore>,
    pub clock: Arc<dyn Clock>,
    pub ids: Arc<dyn IdGenerator>,
    pub config: EngineConfig,
    pub remote: Option<Arc<dyn ServiceClient>>,
}

#[derive(Default)]
struct EngineState {
    invocations: HashMap<InvocationId, InvocationRecord>,
    entity_state: EntityStateStore,
    promises: PromiseRegistry,
    timers: TimerService,
    idempotency: HashMap<(String, String), InvocationId>,
}

impl EngineState {
    fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        Self {
            invocations: snapshot
                .invocations
                .into_iter()
                .map(|r| (r.id, r))
                .collect(),
            entity_state: EntityStateStore::from_entries(snapshot.entity_state),
            promises: PromiseRegistry::from_records(snapshot.promises),
            timers: TimerService::from_records(snapshot.timers),
            idempotency: snapshot
                .idempotency
                .into_iter()
                .map(|e| ((e.scope, e.key), e.invocation_id))
                .collect(),
        }
    }

    /// Apply a batch that is already durable.
    fn apply(&mut self, batch: CommitBatch) {
        for record in batch.invocations {
            self.invocations.insert(record.id, record);
        }
        for (service_id, delta) in &batch.state {
            self.entity_state.apply(service_id, delta);
        }
        for promise in batch.promises {
            self.promises.upsert(promise);
        }
        for timer in batch.timers {
            self.timers.upsert(timer);
        }
        for entry in batch.idempotency {
            self.idempotency
                .insert((entry.scope, entry.key), entry.invocation_id);
        }
    }
}

/// What the driver does after an attempt settled.
#[derive(Debug)]
enum Next {
    Done,
    Rerun,
    RetryAfter(Duration),
}

pub(crate) struct EngineInner {
    registry: ServiceRegistry,
    store: Arc<dyn DurableStore>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    config: EngineConfig,
    calls: CallAdapter,
    locks: KeyLocks,
    state: AsyncMutex<EngineState>,

    /// Invocations with a live driver task, and whether it must run again.
    driving: Mutex<HashMap<InvocationId, bool>>,
    cancel_flags: Mutex<HashMap<InvocationId, Arc<AtomicBool>>>,

    /// Notified after every settled attempt.
    settled: Notify,
    timer_wake: Arc<Notify>,
    shutdown: watch::Sender<bool>,
    timer_task: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a running engine. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub(crate) fn from_inner(inner: Arc<EngineInner>) -> Self {
        Self { inner }
    }

    /// Load the store, start the timer loop and resume unfinished work.
    pub(crate) async fn start(parts: EngineParts) -> Result<Self, StoreError> {
        let snapshot = parts.store.load().await?;
        let state = EngineState::from_snapshot(snapshot);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let local_services = parts.registry.service_names();
        let call_retry = parts.config.call_retry.clone();

        let inner = Arc::new_cyclic(|weak| EngineInner {
            calls: CallAdapter::new(
                Arc::new(LocalServiceClient::new(weak.clone())),
                parts.remote,
                local_services,
                call_retry,
            ),
            registry: parts.registry,
            store: parts.store,
            clock: parts.clock,
            ids: parts.ids,
            config: parts.config,
            locks: KeyLocks::new(),
            state: AsyncMutex::new(state),
            driving: Mutex::new(HashMap::new()),
            cancel_flags: Mutex::new(HashMap::new()),
            settled: Notify::new(),
            timer_wake: Arc::new(Notify::new()),
            shutdown,
            timer_task: Mutex::new(None),
        });
        let engine = Self { inner };

        let handle = timer_loop::spawn(
            Arc::downgrade(&engine.inner),
            engine.inner.timer_wake.clone(),
            shutdown_rx,
            engine.inner.config.timer_poll_interval(),
        );
        *lock(&engine.inner.timer_task) = Some(handle);

        engine.recover().await;
        Ok(engine)
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub(crate) fn calls(&self) -> &CallAdapter {
        &self.inner.calls
    }

    fn is_shut_down(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    /// Admit an invocation and start driving it. Returns without waiting.
    ///
    /// A request whose idempotency key was seen before on the same target,
    /// or a second `run` of the same workflow key, returns the id of the
    /// existing invocation.
    #[instrument(skip(self, request), fields(target = %request.target))]
    pub async fn submit(&self, request: InvocationRequest) -> Result<InvocationId, SpoolError> {
        if self.is_shut_down() {
            return Err(SpoolError::ShutDown);
        }
        let registered = self.inner.registry.lookup(&request.target)?;

        let mut claims = Vec::new();
        if registered.kind == HandlerKind::WorkflowRun
            && let Some(service_id) = request.target.service_id()
        {
            claims.push((WORKFLOW_SCOPE.to_string(), service_id.to_string()));
        }
        if let Some(key) = &request.idempotency_key {
            claims.push((request.target.to_string(), key.clone()));
        }

        let mut state = self.inner.state.lock().await;
        if let Some(existing) = claims
            .iter()
            .find_map(|claim| state.idempotency.get(claim).copied())
        {
            debug!(invocation.id = %existing, "attached to existing invocation");
            return Ok(existing);
        }

        let id = self.inner.ids.generate_invocation_id();
        let service_id = request.target.service_id();
        let mut record =
            InvocationRecord::new(id, request.target, request.payload, self.now());
        record.idempotency_key = request.idempotency_key;
        let mut batch = CommitBatch::invocation(record);
        batch.idempotency = claims
            .into_iter()
            .map(|(scope, key)| IdempotencyEntry {
                scope,
                key,
                invocation_id: id,
            })
            .collect();

        self.inner.store.commit(&batch).await?;
        state.apply(batch);
        self.inner
            .locks
            .enqueue(service_id.as_ref(), id, registered.kind);
        drop(state);

        info!(invocation.id = %id, "invocation admitted");
        self.resume(id);
        Ok(id)
    }

    /// Submit and wait until the invocation finishes or first suspends.
    pub async fn invoke<T: Serialize + ?Sized>(
        &self,
        target: InvocationTarget,
        payload: &T,
    ) -> Result<InvocationResponse, SpoolError> {
        let payload = serde_json::to_value(payload)?;
        self.invoke_request(InvocationRequest::new(target, payload))
            .await
    }

    pub async fn invoke_request(
        &self,
        request: InvocationRequest,
    ) -> Result<InvocationResponse, SpoolError> {
        let id = self.submit(request).await?;
        self.wait_until(id, |status| *status != InvocationStatus::Running)
            .await
    }

    /// Wait for a terminal state. Returns `Suspended` only once the engine is
    /// shut down.
    pub async fn wait_for(&self, id: InvocationId) -> Result<InvocationResponse, SpoolError> {
        self.wait_until(id, InvocationStatus::is_terminal).await
    }

    async fn wait_until(
        &self,
        id: InvocationId,
        done: impl Fn(&InvocationStatus) -> bool,
    ) -> Result<InvocationResponse, SpoolError> {
        loop {
            let notified = self.inner.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = self.inner.state.lock().await;
                let record = state
                    .invocations
                    .get(&id)
                    .ok_or(SpoolError::InvocationNotFound(id))?;
                if done(&record.status) || self.is_shut_down() {
                    return Ok(response(record));
                }
            }
            notified.await;
        }
    }

    /// Make sure a driver task runs the invocation.
    fn resume(&self, id: InvocationId) {
        {
            let mut driving = lock(&self.inner.driving);
            if let Some(rerun) = driving.get_mut(&id) {
                *rerun = true;
                return;
            }
            driving.insert(id, false);
        }
        let engine = self.clone();
        tokio::spawn(async move { engine.drive(id).await });
    }

    async fn drive(&self, id: InvocationId) {
        loop {
            self.run_invocation(id).await;
            let again = {
                let mut driving = lock(&self.inner.driving);
                match driving.get_mut(&id) {
                    Some(rerun) if *rerun => {
                        *rerun = false;
                        true
                    }
                    _ => {
                        driving.remove(&id);
                        false
                    }
                }
            };
            if !again {
                break;
            }
        }
    }

    /// One pass over an invocation: wait for its key, then attempt until it
    /// finishes or suspends. The key stays held through retry backoff.
    #[instrument(skip(self), fields(invocation.id = %id))]
    async fn run_invocation(&self, id: InvocationId) {
        let Some((target, live)) = self.target_of(id).await else {
            return;
        };
        let service_id = target.service_id();
        if !live || self.is_shut_down() {
            self.inner.locks.withdraw(service_id.as_ref(), id);
            return;
        }
        let registered = match self.inner.registry.lookup(&target) {
            Ok(registered) => registered,
            Err(e) => {
                warn!(error = %e, "handler no longer registered");
                self.inner.locks.withdraw(service_id.as_ref(), id);
                self.fail_unroutable(id, TerminalError::with_code(404, e.to_string()))
                    .await;
                return;
            }
        };

        let _guard = self
            .inner
            .locks
            .acquire(service_id.as_ref(), id, registered.kind)
            .await;
        loop {
            if self.is_shut_down() {
                return;
            }
            let Some((ctx, input)) = self.begin_attempt(id, registered.kind).await else {
                return;
            };

            let handler = registered.handler.clone();
            let attempt_ctx = ctx.clone();
            let joined =
                tokio::spawn(async move { handler.handle_dyn(attempt_ctx, input).await }).await;
            let result = joined.unwrap_or_else(|e| {
                Err(HandlerError::terminal(format!("handler panicked: {e}")))
            });

            match self.settle(id, ctx.finish(), result).await {
                Next::Done => return,
                Next::Rerun => continue,
                Next::RetryAfter(delay) => {
                    debug!(?delay, "retrying invocation");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Target of an invocation, and whether it is still unfinished.
    async fn target_of(&self, id: InvocationId) -> Option<(InvocationTarget, bool)> {
        let state = self.inner.state.lock().await;
        state
            .invocations
            .get(&id)
            .map(|r| (r.target.clone(), !r.status.is_terminal()))
    }

    async fn begin_attempt(
        &self,
        id: InvocationId,
        kind: HandlerKind,
    ) -> Option<(Context, serde_json::Value)> {
        let now = self.now();
        let (record, base_state, fired_timers) = {
            let mut state = self.inner.state.lock().await;
            let record = state.invocations.get_mut(&id)?;
            if record.status.is_terminal() {
                return None;
            }
            record.start_attempt(now);
            let record = record.clone();
            let base_state = record
                .target
                .service_id()
                .map(|service_id| state.entity_state.state(&service_id))
                .unwrap_or_default();
            (record, base_state, state.timers.fired_for(id))
        };
        debug!(attempt = record.attempts, replay = record.journal.len(), "attempt started");

        let cancel = self.cancel_flag(id);
        if record.cancel_requested {
            cancel.store(true, Ordering::SeqCst);
        }
        let seed = ContextSeed {
            invocation_id: id,
            target: record.target,
            kind,
            journal: record.journal,
            pending_state: record.pending_state,
            base_state,
            fired_timers,
            cancel,
            cancel_delivered: record.cancel_delivered,
            dry_run: false,
        };
        Some((Context::new(self.clone(), seed), record.input))
    }

    /// Persist the outcome of one attempt and decide what happens next.
    async fn settle(
        &self,
        id: InvocationId,
        outcome: AttemptOutcome,
        result: Result<serde_json::Value, HandlerError>,
    ) -> Next {
        let now = self.now();
        let mut state = self.inner.state.lock().await;
        let Some(mut record) = state.invocations.get(&id).cloned() else {
            return Next::Done;
        };
        if record.status.is_terminal() {
            return Next::Done;
        }
        record.journal = outcome.journal;
        record.pending_state = outcome.pending_state;
        record.cancel_delivered = outcome.cancel_delivered;
        record.updated_at = now;

        let service_id = record.target.service_id();
        let mut batch = CommitBatch::new();
        let mut next = Next::Done;
        let mut arm_timer = false;

        let fatal = outcome
            .fatal
            .or_else(|| result.as_ref().err().filter(|e| e.is_fatal()).cloned());

        if let Some(fatal) = fatal {
            error!(error = %fatal, "invocation failed fatally");
            record.pending_state = StateDelta::new();
            record.mark_failed(TerminalError::new(fatal.to_string()), now);
            batch.timers = state.timers.prepare_cancel_all(id);
        } else if let Some(suspension) = outcome.suspension {
            let delta = std::mem::take(&mut record.pending_state);
            if let Some(service_id) = &service_id {
                batch = batch.with_state(service_id.clone(), delta);
            }
            if record.cancel_requested && !record.cancel_delivered {
                next = Next::Rerun;
            } else {
                match suspension {
                    Suspension::Promise { service_id, name } => {
                        if state.promises.peek(&service_id, &name).is_some() {
                            next = Next::Rerun;
                        } else {
                            batch
                                .promises
                                .push(state.promises.prepare_subscribe(&service_id, &name, id));
                            debug!(promise = %name, "suspended on promise");
                            record.mark_suspended(
                                InvocationStatus::SuspendedOnPromise { service_id, name },
                                now,
                            );
                        }
                    }
                    Suspension::Timer { wake_at } => {
                        if state.timers.state(id, wake_at) == Some(TimerState::Fired) {
                            next = Next::Rerun;
                        } else {
                            batch.timers.extend(state.timers.prepare_arm(id, wake_at));
                            debug!(%wake_at, "suspended on timer");
                            record.mark_suspended(InvocationStatus::SuspendedOnTimer { wake_at }, now);
                            arm_timer = true;
                        }
                    }
                }
            }
        } else {
            match result {
                Ok(value) => {
                    let delta = std::mem::take(&mut record.pending_state);
                    if let Some(service_id) = &service_id {
                        batch = batch.with_state(service_id.clone(), delta);
                    }
                    record.mark_completed(value, now);
                }
                Err(HandlerError::Terminal(e)) => {
                    let delta = std::mem::take(&mut record.pending_state);
                    if let Some(service_id) = &service_id {
                        batch = batch.with_state(service_id.clone(), delta);
                    }
                    record.mark_failed(e, now);
                }
                Err(HandlerError::Transient(reason)) => {
                    let retry = &self.inner.config.invocation_retry;
                    if retry.should_retry(record.attempts) {
                        warn!(attempts = record.attempts, %reason, "invocation failed transiently");
                        next = Next::RetryAfter(retry.next_delay(record.attempts));
                        record.record_transient(reason, now);
                    } else {
                        record.pending_state = StateDelta::new();
                        record.mark_failed(
                            TerminalError::new(format!("retries exhausted: {reason}")),
                            now,
                        );
                    }
                }
                Err(other) => {
                    record.pending_state = StateDelta::new();
                    record.mark_failed(
                        TerminalError::new(format!("handler returned {other} without suspending")),
                        now,
                    );
                }
            }
        }

        let finished = record.status.is_terminal();
        let attempts = record.attempts;
        batch.invocations.push(record);
        if let Err(e) = self.inner.store.commit(&batch).await {
            warn!(error = %e, "commit failed, retrying attempt");
            return Next::RetryAfter(self.inner.config.invocation_retry.next_delay(attempts));
        }
        state.apply(batch);
        drop(state);

        if finished {
            lock(&self.inner.cancel_flags).remove(&id);
            info!(attempts, "invocation finished");
        }
        if arm_timer {
            self.inner.timer_wake.notify_one();
        }
        self.inner.settled.notify_waiters();
        next
    }

    async fn fail_unroutable(&self, id: InvocationId, error: TerminalError) {
        let now = self.now();
        let mut state = self.inner.state.lock().await;
        let Some(mut record) = state.invocations.get(&id).cloned() else {
            return;
        };
        record.mark_failed(error, now);
        let batch = CommitBatch::invocation(record);
        match self.inner.store.commit(&batch).await {
            Ok(()) => state.apply(batch),
            Err(e) => warn!(error = %e, "cannot record failed invocation"),
        }
        drop(state);
        self.inner.settled.notify_waiters();
    }

    /// Persist the journal of a running attempt. The state delta is stored
    /// but stays unapplied.
    pub(crate) async fn checkpoint(
        &self,
        id: InvocationId,
        journal: Journal,
        pending_state: StateDelta,
        cancel_delivered: bool,
    ) -> Result<(), StoreError> {
        let now = self.now();
        let mut state = self.inner.state.lock().await;
        let Some(mut record) = state.invocations.get(&id).cloned() else {
            return Ok(());
        };
        record.journal = journal;
        record.pending_state = pending_state;
        record.cancel_delivered = cancel_delivered;
        record.updated_at = now;

        let batch = CommitBatch::invocation(record);
        self.inner.store.commit(&batch).await?;
        state.apply(batch);
        Ok(())
    }

    fn cancel_flag(&self, id: InvocationId) -> Arc<AtomicBool> {
        lock(&self.inner.cancel_flags)
            .entry(id)
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .clone()
    }

    /// Request cancellation.
    ///
    /// A suspended invocation fails at once with a 409. A running one sees a
    /// terminal `cancelled` error at its next step (or the step it is parked
    /// on), which it may catch to compensate. Returns `false` if the
    /// invocation had already finished.
    #[instrument(skip(self), fields(invocation.id = %id))]
    pub async fn cancel(&self, id: InvocationId) -> Result<bool, SpoolError> {
        let now = self.now();
        let mut state = self.inner.state.lock().await;
        let mut record = state
            .invocations
            .get(&id)
            .cloned()
            .ok_or(SpoolError::InvocationNotFound(id))?;
        if record.status.is_terminal() {
            return Ok(false);
        }

        record.cancel_requested = true;
        record.updated_at = now;
        let mut batch = CommitBatch::new();
        let suspended = record.status.is_suspended();
        if suspended {
            if let InvocationStatus::SuspendedOnPromise { service_id, name } = &record.status {
                batch
                    .promises
                    .extend(state.promises.prepare_unsubscribe(service_id, name, id));
            }
            batch.timers = state.timers.prepare_cancel_all(id);
            record.cancel_delivered = true;
            record.mark_failed(TerminalError::cancelled(), now);
        }
        batch.invocations.push(record);

        self.inner.store.commit(&batch).await?;
        state.apply(batch);
        drop(state);

        if suspended {
            lock(&self.inner.cancel_flags).remove(&id);
            info!("suspended invocation cancelled");
            self.inner.settled.notify_waiters();
        } else {
            self.cancel_flag(id).store(true, Ordering::SeqCst);
            info!("cancellation requested");
        }
        Ok(true)
    }

    /// Fire one armed timer. Returns `false` if it was not armed.
    pub async fn on_timer_fired(
        &self,
        id: InvocationId,
        wake_at: DateTime<Utc>,
    ) -> Result<bool, SpoolError> {
        {
            let mut state = self.inner.state.lock().await;
            let Some(fired) = state.timers.prepare_fire(&(id, wake_at)) else {
                return Ok(false);
            };
            let batch = CommitBatch {
                timers: vec![fired],
                ..CommitBatch::default()
            };
            self.inner.store.commit(&batch).await?;
            state.apply(batch);
        }
        self.resume(id);
        Ok(true)
    }

    /// Fire every timer due at the clock's current time.
    pub async fn fire_due_timers(&self) -> Result<usize, SpoolError> {
        let now = self.now();
        let due: Vec<TimerRecord> = {
            let mut state = self.inner.state.lock().await;
            let due = state.timers.take_due(now);
            if due.is_empty() {
                return Ok(0);
            }
            let batch = CommitBatch {
                timers: due.clone(),
                ..CommitBatch::default()
            };
            if let Err(e) = self.inner.store.commit(&batch).await {
                state.timers.requeue(due.iter().map(TimerRecord::key));
                return Err(e.into());
            }
            state.apply(batch);
            due
        };
        for timer in &due {
            debug!(invocation.id = %timer.invocation_id, wake_at = %timer.wake_at, "timer fired");
            self.resume(timer.invocation_id);
        }
        Ok(due.len())
    }

    pub async fn next_timer_deadline(&self) -> Option<DateTime<Utc>> {
        self.inner.state.lock().await.timers.next_deadline()
    }

    /// Resolve a durable promise from outside any handler. First resolution
    /// wins; later ones report the existing value.
    pub async fn resolve_promise<T: Serialize + ?Sized>(
        &self,
        service_id: ServiceId,
        name: &str,
        value: &T,
    ) -> Result<ResolveOutcome, SpoolError> {
        let value = serde_json::to_value(value)?;
        self.resolve_promise_value(service_id, name, value).await
    }

    pub(crate) async fn resolve_promise_value(
        &self,
        service_id: ServiceId,
        name: &str,
        value: serde_json::Value,
    ) -> Result<ResolveOutcome, SpoolError> {
        let prepared = {
            let mut state = self.inner.state.lock().await;
            let prepared = state.promises.prepare_resolve(&service_id, name, value);
            if let Some(record) = prepared.record.clone() {
                let batch = CommitBatch {
                    promises: vec![record],
                    ..CommitBatch::default()
                };
                self.inner.store.commit(&batch).await?;
                state.apply(batch);
            }
            prepared
        };

        if prepared.outcome.was_accepted() {
            info!(%service_id, promise = name, waiters = prepared.waiters.len(), "promise resolved");
        } else {
            debug!(%service_id, promise = name, "promise already resolved");
        }
        for waiter in prepared.waiters {
            self.resume(waiter);
        }
        Ok(prepared.outcome)
    }

    pub async fn peek_promise(&self, service_id: &ServiceId, name: &str) -> Option<serde_json::Value> {
        let state = self.inner.state.lock().await;
        state.promises.peek(service_id, name).cloned()
    }

    /// Committed state of an entity.
    pub async fn state(&self, service_id: &ServiceId) -> EntityState {
        self.inner.state.lock().await.entity_state.state(service_id)
    }

    pub async fn state_value<T: DeserializeOwned>(
        &self,
        service_id: &ServiceId,
        field: &str,
    ) -> Result<Option<T>, SpoolError> {
        let value = {
            let state = self.inner.state.lock().await;
            state.entity_state.get(service_id, field).cloned()
        };
        Ok(value.map(serde_json::from_value).transpose()?)
    }

    pub async fn invocation(&self, id: InvocationId) -> Option<InvocationView> {
        let state = self.inner.state.lock().await;
        state.invocations.get(&id).map(InvocationView::from)
    }

    /// All invocations, oldest first.
    pub async fn invocations(&self) -> Vec<InvocationView> {
        let state = self.inner.state.lock().await;
        let mut views: Vec<InvocationView> =
            state.invocations.values().map(InvocationView::from).collect();
        views.sort_by_key(|v| (v.created_at, v.id));
        views
    }

    pub async fn status(&self) -> InvocationCounts {
        let state = self.inner.state.lock().await;
        InvocationCounts::tally(state.invocations.values())
    }

    /// Re-run a finished invocation against its journal without side effects
    /// and check that it takes the same path to the same result.
    ///
    /// Only results produced by the handler itself can be reproduced;
    /// invocations failed by the engine (cancelled while suspended, retries
    /// exhausted, fatal replay errors) report a divergence.
    #[instrument(skip(self), fields(invocation.id = %id))]
    pub async fn verify_replay(&self, id: InvocationId) -> Result<ReplayReport, SpoolError> {
        let record = {
            let state = self.inner.state.lock().await;
            state
                .invocations
                .get(&id)
                .cloned()
                .ok_or(SpoolError::InvocationNotFound(id))?
        };
        if !record.status.is_terminal() {
            return Err(SpoolError::NotFinished(id));
        }
        let registered = self.inner.registry.lookup(&record.target)?;

        let seed = ContextSeed {
            invocation_id: id,
            target: record.target.clone(),
            kind: registered.kind,
            journal: record.journal.clone(),
            pending_state: StateDelta::new(),
            base_state: EntityState::new(),
            fired_timers: HashSet::new(),
            cancel: Arc::new(AtomicBool::new(false)),
            cancel_delivered: true,
            dry_run: true,
        };
        let ctx = Context::new(self.clone(), seed);
        let result = registered
            .handler
            .handle_dyn(ctx.clone(), record.input.clone())
            .await;
        let outcome = ctx.finish();

        let report = if let Some(fatal) = outcome.fatal {
            ReplayReport::Diverged {
                reason: fatal.to_string(),
            }
        } else if let Some(suspension) = outcome.suspension {
            ReplayReport::Diverged {
                reason: format!("replay stopped on {suspension:?}"),
            }
        } else if outcome.position != record.journal.len() {
            ReplayReport::Diverged {
                reason: format!(
                    "replay reached {} of {} journaled steps",
                    outcome.position,
                    record.journal.len()
                ),
            }
        } else {
            let replayed = match result {
                Ok(value) => Some(InvocationResult::Success(value)),
                Err(HandlerError::Terminal(e)) => Some(InvocationResult::Failure(e)),
                Err(_) => None,
            };
            if replayed.is_some() && replayed == record.result {
                ReplayReport::Reproduced {
                    steps: record.journal.len(),
                }
            } else {
                ReplayReport::Diverged {
                    reason: format!("replay ended with {replayed:?}, recorded {:?}", record.result),
                }
            }
        };
        info!(reproduced = report.is_reproduced(), "replay verified");
        Ok(report)
    }

    /// Stop admitting work and stop the timer loop. In-flight attempts run to
    /// their next boundary; unfinished invocations resume on the next start.
    pub async fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
        self.inner.timer_wake.notify_one();
        self.inner.settled.notify_waiters();

        let handle = lock(&self.inner.timer_task).take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            warn!(error = %e, "timer loop ended abnormally");
        }
        info!("engine shut down");
    }

    /// Resume unfinished work. Invocations re-enter their key queues in
    /// admission order, ahead of anything submitted after the restart.
    async fn recover(&self) {
        let resumable: Vec<InvocationId> = {
            let state = self.inner.state.lock().await;
            let mut records: Vec<&InvocationRecord> = state
                .invocations
                .values()
                .filter(|r| match &r.status {
                    InvocationStatus::Running => true,
                    InvocationStatus::SuspendedOnPromise { service_id, name } => {
                        state.promises.peek(service_id, name).is_some()
                    }
                    InvocationStatus::SuspendedOnTimer { wake_at } => {
                        state.timers.state(r.id, *wake_at) == Some(TimerState::Fired)
                    }
                    InvocationStatus::Completed | InvocationStatus::Failed => false,
                })
                .collect();
            records.sort_by_key(|r| (r.created_at, r.id));
            for record in &records {
                if let Ok(registered) = self.inner.registry.lookup(&record.target) {
                    self.inner.locks.enqueue(
                        record.target.service_id().as_ref(),
                        record.id,
                        registered.kind,
                    );
                }
            }
            records.iter().map(|r| r.id).collect()
        };
        if !resumable.is_empty() {
            info!(count = resumable.len(), "resuming unfinished invocations");
        }
        for id in resumable {
            self.resume(id);
        }
    }
}

fn response(record: &InvocationRecord) -> InvocationResponse {
    match &record.result {
        Some(InvocationResult::Success(value)) => InvocationResponse::Completed {
            id: record.id,
            value: value.clone(),
        },
        Some(InvocationResult::Failure(error)) => InvocationResponse::Failed {
            id: record.id,
            error: error.clone(),
        },
        None => InvocationResponse::Suspended { id: record.id },
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
