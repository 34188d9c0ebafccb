//! Rampart Storage - the durable store boundary
//!
//! This crate provides:
//! - KVStore trait for storage abstraction
//! - redb-based and in-memory implementations
//! - Key encoding
//! - A versioned object store with optimistic concurrency and a watch bus
//! - The WorkloadWriter trait the scheduler and controllers write through

pub mod encoding;
pub mod error;
pub mod event_bus;
pub mod kv;
pub mod memory_backend;
pub mod object_store;
pub mod redb_backend;
pub mod testing;
pub mod writer;

// Re-export commonly used types
pub use encoding::KeyEncoder;
pub use error::{Result, StorageError};
pub use event_bus::EventBusConfig;
pub use kv::{KVStore, Transaction};
pub use memory_backend::MemoryBackend;
pub use object_store::ObjectStore;
pub use redb_backend::RedbBackend;
pub use writer::WorkloadWriter;
