// Allow unused assignments for diagnostic fields - they're used by the macros
#![allow(unused_assignments)]

use miette::Diagnostic;
use thiserror::Error;

/// Scheduler error type
#[derive(Error, Debug, Diagnostic)]
pub enum SchedulerError {
    /// No ordering policy with this name
    #[error("Unknown ordering policy: {name}")]
    #[diagnostic(
        code(scheduler::unknown_ordering),
        help("Use one of: PriorityThenFairness, RoundRobin")
    )]
    UnknownOrdering { name: String },

    /// Cache error
    #[error("Cache error: {0}")]
    #[diagnostic(
        code(scheduler::cache_error),
        help("The cache is rebuilt from the store when its accounting drifts")
    )]
    CacheError(#[from] rampart_cache::CacheError),

    /// Storage error
    #[error("Storage error: {0}")]
    #[diagnostic(
        code(scheduler::storage_error),
        help("Check the underlying storage system")
    )]
    StorageError(#[from] rampart_storage::StorageError),

    /// Queue error
    #[error("Queue error: {0}")]
    #[diagnostic(code(scheduler::queue_error), help("Check the queueing settings"))]
    QueueError(#[from] rampart_queue::QueueError),

    /// Core error
    #[error("Core error: {0}")]
    #[diagnostic(code(scheduler::core_error), help("This is an internal error"))]
    CoreError(#[from] rampart_core::RampartError),

    /// Internal error
    #[error("Internal error: {message}")]
    #[diagnostic(
        code(scheduler::internal_error),
        help("This is likely a bug. Please report it")
    )]
    InternalError { message: String },
}

/// Result type for scheduler operations
pub type Result<T> = std::result::Result<T, SchedulerError>;

impl SchedulerError {
    /// Create an UnknownOrdering error
    pub fn unknown_ordering(name: impl Into<String>) -> Self {
        Self::UnknownOrdering { name: name.into() }
    }

    /// Create an InternalError
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::InternalError {
            message: message.into(),
        }
    }
}
