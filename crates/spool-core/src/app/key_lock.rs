//! Per-entity admission queues.
//!
//! Every entity key has a FIFO of invocations waiting for it. Exclusive
//! handlers and workflow bodies hold the key alone; shared handlers hold it
//! together, as long as no writer is queued ahead of them. Stateless handlers
//! never queue.
//!
//! The engine calls `enqueue` when it admits an invocation, while it still
//! holds the state mutex, so the queue order is admission order no matter
//! when each driver task gets scheduled. `acquire` then waits for that place
//! to reach the front. A guard stays with its invocation across retries and
//! is released on suspension or completion.
//!
//! # 学習ポイント
//! - `std::sync::Mutex` で守った `VecDeque` + `tokio::sync::Notify` による FIFO 待ち行列
//! - `notified()` を `enable()` してから状態を確認し、起床通知の取りこぼしを防ぐ
//! - `Drop` で後片付け: guard の解放も、途中で捨てられた `acquire` も列から抜ける

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;

use crate::domain::{HandlerKind, InvocationId, ServiceId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Exclusive,
    Shared,
}

impl Mode {
    fn of(kind: HandlerKind) -> Option<Self> {
        match kind {
            HandlerKind::Stateless => None,
            HandlerKind::Shared => Some(Mode::Shared),
            HandlerKind::Exclusive | HandlerKind::WorkflowRun => Some(Mode::Exclusive),
        }
    }
}

#[derive(Debug, Default)]
struct KeyQueue {
    waiting: VecDeque<(InvocationId, Mode)>,
    writer: Option<InvocationId>,
    readers: HashSet<InvocationId>,
    granted: Arc<Notify>,
}

impl KeyQueue {
    fn holds(&self, id: InvocationId) -> bool {
        self.writer == Some(id) || self.readers.contains(&id)
    }

    fn enqueue(&mut self, id: InvocationId, mode: Mode) {
        if self.holds(id) || self.waiting.iter().any(|(w, _)| *w == id) {
            return;
        }
        self.waiting.push_back((id, mode));
        self.promote();
    }

    fn remove(&mut self, id: InvocationId) {
        if self.writer == Some(id) {
            self.writer = None;
        }
        self.readers.remove(&id);
        self.waiting.retain(|(w, _)| *w != id);
        self.promote();
    }

    /// Grant the key to the front of the queue for as long as it fits.
    fn promote(&mut self) {
        let mut granted = false;
        while let Some(&(id, mode)) = self.waiting.front() {
            let fits = self.writer.is_none() && (mode == Mode::Shared || self.readers.is_empty());
            if !fits {
                break;
            }
            self.waiting.pop_front();
            match mode {
                Mode::Exclusive => self.writer = Some(id),
                Mode::Shared => {
                    self.readers.insert(id);
                }
            }
            granted = true;
        }
        if granted {
            self.granted.notify_waiters();
        }
    }

    fn is_idle(&self) -> bool {
        self.waiting.is_empty() && self.writer.is_none() && self.readers.is_empty()
    }
}

type Queues = Arc<Mutex<HashMap<ServiceId, KeyQueue>>>;

fn lock(queues: &Queues) -> MutexGuard<'_, HashMap<ServiceId, KeyQueue>> {
    queues.lock().unwrap_or_else(|e| e.into_inner())
}

/// Drop `id` from the queue of `service_id`, wherever it stands.
fn leave(queues: &Queues, service_id: &ServiceId, id: InvocationId) {
    let mut queues = lock(queues);
    if let Some(queue) = queues.get_mut(service_id) {
        queue.remove(id);
        if queue.is_idle() {
            queues.remove(service_id);
        }
    }
}

/// Held while an invocation owns its key. Dropping it lets the next in line in.
#[derive(Debug)]
pub struct KeyGuard {
    held: Option<(Queues, ServiceId, InvocationId)>,
}

impl KeyGuard {
    fn unlocked() -> Self {
        Self { held: None }
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        if let Some((queues, service_id, id)) = self.held.take() {
            leave(&queues, &service_id, id);
        }
    }
}

/// Leaves the queue if `acquire` is abandoned before the key is granted.
struct Waiting<'a> {
    queues: &'a Queues,
    service_id: &'a ServiceId,
    id: InvocationId,
    armed: bool,
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        if self.armed {
            leave(self.queues, self.service_id, self.id);
        }
    }
}

#[derive(Debug, Default)]
pub struct KeyLocks {
    queues: Queues,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a place in line. A no-op for keyless targets, stateless
    /// handlers, and invocations already queued or holding the key.
    pub fn enqueue(&self, service_id: Option<&ServiceId>, id: InvocationId, kind: HandlerKind) {
        let (Some(service_id), Some(mode)) = (service_id, Mode::of(kind)) else {
            return;
        };
        lock(&self.queues)
            .entry(service_id.clone())
            .or_default()
            .enqueue(id, mode);
    }

    /// Give up a place taken with `enqueue` that will never be used.
    pub fn withdraw(&self, service_id: Option<&ServiceId>, id: InvocationId) {
        if let Some(service_id) = service_id {
            leave(&self.queues, service_id, id);
        }
    }

    /// Wait until `id` owns the key, queueing it at the back unless it
    /// already has a place.
    pub async fn acquire(
        &self,
        service_id: Option<&ServiceId>,
        id: InvocationId,
        kind: HandlerKind,
    ) -> KeyGuard {
        let (Some(service_id), Some(mode)) = (service_id, Mode::of(kind)) else {
            return KeyGuard::unlocked();
        };
        let mut waiting = Waiting {
            queues: &self.queues,
            service_id,
            id,
            armed: true,
        };

        loop {
            let granted = {
                let mut queues = lock(&self.queues);
                let queue = queues.entry(service_id.clone()).or_default();
                queue.enqueue(id, mode);
                if queue.holds(id) {
                    break;
                }
                queue.granted.clone()
            };
            let notified = granted.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.holds(service_id, id) {
                break;
            }
            notified.await;
        }

        waiting.armed = false;
        KeyGuard {
            held: Some((self.queues.clone(), service_id.clone(), id)),
        }
    }

    fn holds(&self, service_id: &ServiceId, id: InvocationId) -> bool {
        lock(&self.queues)
            .get(service_id)
            .is_some_and(|queue| queue.holds(id))
    }
}
