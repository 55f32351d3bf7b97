//! Ports - traits at the seams of the engine.
//!
//! Each trait hides one external concern (time, id allocation, durable
//! storage, outbound calls) so the engine can be wired with production or
//! test implementations.

pub mod clock;
pub mod id_generator;
pub mod service_client;
pub mod store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::service_client::{CallError, ServiceClient};
pub use self::store::{CommitBatch, DurableStore, IdempotencyEntry, StoreError, StoreSnapshot};
