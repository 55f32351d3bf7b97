//! Typed handler API.
//!
//! # Two layers
//! - **Typed**: `Handler` with associated input/output types, `handler_fn` for closures
//! - **Dyn**: `DynHandler`, object-safe, JSON in and out
//!
//! `ServiceDefinition` groups handlers under a service name and kind;
//! `ServiceRegistry` validates and resolves them.

pub mod codec;
pub mod handler;
pub mod registry;

pub use self::handler::{DynHandler, FnHandler, Handler, TypedHandler, handler_fn};
pub use self::registry::{
    RegisteredHandler, RegistryError, ServiceDefinition, ServiceRegistry, WORKFLOW_RUN,
};
