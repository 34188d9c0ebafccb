// Allow unused assignments for diagnostic fields - they're used by the macros
#![allow(unused_assignments)]

use miette::Diagnostic;
use thiserror::Error;

/// Controller error type
#[derive(Error, Debug, Diagnostic)]
pub enum ControllerError {
    /// A check controller with this name is already registered
    #[error("Check controller already registered: {name}")]
    #[diagnostic(
        code(controller::duplicate_check_controller),
        help("Each AdmissionCheck controller name can be registered once")
    )]
    DuplicateCheckController { name: String },

    /// The watch stream ended
    #[error("Watch stream closed")]
    #[diagnostic(
        code(controller::watch_closed),
        help("The object store was dropped while controllers were still running")
    )]
    WatchClosed,

    /// Cache error
    #[error("Cache error: {0}")]
    #[diagnostic(
        code(controller::cache_error),
        help("The cache is rebuilt from the store when its accounting drifts")
    )]
    CacheError(#[from] rampart_cache::CacheError),

    /// Storage error
    #[error("Storage error: {0}")]
    #[diagnostic(
        code(controller::storage_error),
        help("Check the underlying storage system")
    )]
    StorageError(#[from] rampart_storage::StorageError),

    /// Queue error
    #[error("Queue error: {0}")]
    #[diagnostic(code(controller::queue_error), help("Check the queueing settings"))]
    QueueError(#[from] rampart_queue::QueueError),

    /// Core error
    #[error("Core error: {0}")]
    #[diagnostic(code(controller::core_error), help("This is an internal error"))]
    CoreError(#[from] rampart_core::RampartError),
}

/// Result type for controller operations
pub type Result<T> = std::result::Result<T, ControllerError>;

impl ControllerError {
    /// Create a DuplicateCheckController error
    pub fn duplicate_check_controller(name: impl Into<String>) -> Self {
        Self::DuplicateCheckController { name: name.into() }
    }
}
