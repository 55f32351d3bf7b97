//! Impls - port implementations.
//!
//! # Contents
//! - **InMemoryStore**: shared in-memory tables, for tests and demos
//! - **FileStore**: JSON snapshot file with atomic replace
//! - **LocalServiceClient**: routes calls to services hosted by the same engine

pub mod file_store;
pub mod local_client;
pub mod memory_store;

pub use self::file_store::FileStore;
pub use self::local_client::LocalServiceClient;
pub use self::memory_store::InMemoryStore;
