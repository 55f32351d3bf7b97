//! spool-core
//!
//! A durable execution engine: handler code runs as a sequence of journaled
//! steps, suspends on durable promises and timers, and resumes by replaying
//! its journal after a suspension or a crash.
//!
//! # Modules
//! - **domain**: records and errors (ids, targets, journal, invocations, promises, timers)
//! - **ports**: seams (Clock, IdGenerator, DurableStore, ServiceClient)
//! - **impls**: port implementations (InMemoryStore, FileStore, LocalServiceClient)
//! - **app**: the engine (replay, state, promises, timers, key locks, scheduler, builder)
//! - **typed**: handler API (Handler trait, ServiceDefinition, ServiceRegistry)

pub mod app;
pub mod domain;
pub mod error;
pub mod impls;
pub mod ports;
pub mod typed;

pub use crate::app::{
    BuildError, Context, Engine, EngineBuilder, EngineConfig, InvocationCounts,
    InvocationRequest, InvocationView, ReplayReport, RetryPolicy,
};
pub use crate::domain::{
    HandlerError, IdempotencyToken, InvocationId, InvocationResponse, InvocationTarget,
    ResolveOutcome, ServiceId, TerminalError,
};
pub use crate::error::SpoolError;
pub use crate::typed::{Handler, ServiceDefinition, handler_fn};
