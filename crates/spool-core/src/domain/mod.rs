//! Domain model: ids, targets, journal, invocation/promise/timer records, errors.
//!
//! Architecture-agnostic: nothing here knows about locks, stores or tokio.

pub mod errors;
pub mod ids;
pub mod invocation;
pub mod journal;
pub mod promise;
pub mod state;
pub mod target;
pub mod timer;

pub use self::errors::{ErrorKind, HandlerError, TerminalError};
pub use self::ids::{IdempotencyToken, InvocationId, ParseIdError};
pub use self::invocation::{
    InvocationRecord, InvocationResponse, InvocationResult, InvocationStatus,
};
pub use self::journal::{Journal, JournalError, StepKind, StepOutcome, StepRecord};
pub use self::promise::{PromiseRecord, PromiseState, ResolveOutcome};
pub use self::state::{EntityState, StateChange, StateDelta};
pub use self::target::{HandlerKind, InvocationTarget, ServiceId, ServiceKind};
pub use self::timer::{TimerKey, TimerRecord, TimerState};
