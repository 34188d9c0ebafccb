// Allow unused assignments for diagnostic fields - they're used by the macros
#![allow(unused_assignments)]

use miette::Diagnostic;
use thiserror::Error;

/// Queue manager error type
#[derive(Error, Debug, Diagnostic)]
pub enum QueueError {
    /// ClusterQueue has no queue
    #[error("ClusterQueue not found: {name}")]
    #[diagnostic(
        code(queue::cluster_queue_not_found),
        help("Add the ClusterQueue to the queue manager before updating it")
    )]
    ClusterQueueNotFound { name: String },

    /// Backoff settings are inconsistent
    #[error("Invalid backoff: {message}")]
    #[diagnostic(
        code(queue::invalid_backoff),
        help("The base delay must not exceed the maximum and jitter must be within [0, 1]")
    )]
    InvalidBackoff { message: String },
}

/// Result type for queue operations
pub type Result<T> = std::result::Result<T, QueueError>;

impl QueueError {
    /// Create a ClusterQueueNotFound error
    pub fn cluster_queue_not_found(name: impl Into<String>) -> Self {
        Self::ClusterQueueNotFound { name: name.into() }
    }

    /// Create an InvalidBackoff error
    pub fn invalid_backoff(message: impl Into<String>) -> Self {
        Self::InvalidBackoff {
            message: message.into(),
        }
    }
}
