//! App - the engine.
//!
//! Combines the ports into the durable execution runtime.
//!
//! # Main components
//! - **Engine**: admission, scheduling, settlement, recovery, public API
//! - **Context**: the journaled API handler code runs against
//! - **EngineBuilder**: wiring and fail-fast startup validation
//! - **JournalReplayer**: matches re-executed steps against the journal
//! - **KeyLocks**: per-entity admission (exclusive / shared)
//! - **PromiseRegistry**, **TimerService**, **EntityStateStore**: in-memory tables
//! - **CallAdapter**: idempotent outbound calls with retry
//! - **timer_loop**: fires due timers

pub mod builder;
pub mod call_adapter;
pub mod config;
pub mod context;
pub mod engine;
pub mod journal;
pub mod key_lock;
pub mod promises;
pub mod retry;
pub mod state_store;
pub mod status;
mod timer_loop;
pub mod timers;

pub use self::builder::{BuildError, EngineBuilder};
pub use self::config::{ConfigError, EngineConfig};
pub use self::context::Context;
pub use self::engine::{Engine, InvocationRequest, ReplayReport};
pub use self::retry::RetryPolicy;
pub use self::status::{InvocationCounts, InvocationView};
