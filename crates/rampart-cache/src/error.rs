// Allow unused assignments for diagnostic fields - they're used by the macros
#![allow(unused_assignments)]

use miette::Diagnostic;
use thiserror::Error;

/// Cache error type
#[derive(Error, Debug, Diagnostic)]
pub enum CacheError {
    /// ClusterQueue is not known to the cache
    #[error("ClusterQueue not found: {name}")]
    #[diagnostic(
        code(cache::cluster_queue_not_found),
        help("Create the ClusterQueue before admitting workloads into it")
    )]
    ClusterQueueNotFound { name: String },

    /// ClusterQueue cannot admit
    #[error("ClusterQueue {name} is not active: {reason}")]
    #[diagnostic(
        code(cache::cluster_queue_inactive),
        help("Fix the ClusterQueue configuration; its status carries the reason")
    )]
    ClusterQueueInactive { name: String, reason: String },

    /// ClusterQueue still holds reserved workloads
    #[error("ClusterQueue {name} still holds {workloads} reserved workloads")]
    #[diagnostic(
        code(cache::cluster_queue_not_drained),
        help("The ClusterQueue is removed once its reserved workloads finish or are evicted")
    )]
    ClusterQueueNotDrained { name: String, workloads: usize },

    /// Workload already holds a reservation
    #[error("Workload {workload} already holds a reservation in {cluster_queue}")]
    #[diagnostic(
        code(cache::already_reserved),
        help("A workload can hold at most one admission at a time")
    )]
    AlreadyReserved {
        workload: String,
        cluster_queue: String,
    },

    /// Accounting no longer matches the reserved workloads
    #[error("Cache invariant violated: {details}")]
    #[diagnostic(
        code(cache::invariant_violation),
        help("The cache will be rebuilt from the store")
    )]
    InvariantViolation { details: String },

    /// Core error
    #[error("Core error: {0}")]
    #[diagnostic(code(cache::core_error), help("This is an internal error"))]
    CoreError(#[from] rampart_core::RampartError),
}

/// Result type for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

impl CacheError {
    /// Create a ClusterQueueNotFound error
    pub fn cluster_queue_not_found(name: impl Into<String>) -> Self {
        Self::ClusterQueueNotFound { name: name.into() }
    }

    /// Create a ClusterQueueInactive error
    pub fn cluster_queue_inactive(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ClusterQueueInactive {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create a ClusterQueueNotDrained error
    pub fn cluster_queue_not_drained(name: impl Into<String>, workloads: usize) -> Self {
        Self::ClusterQueueNotDrained {
            name: name.into(),
            workloads,
        }
    }

    /// Create an AlreadyReserved error
    pub fn already_reserved(workload: impl Into<String>, cluster_queue: impl Into<String>) -> Self {
        Self::AlreadyReserved {
            workload: workload.into(),
            cluster_queue: cluster_queue.into(),
        }
    }

    /// Create an InvariantViolation error
    pub fn invariant_violation(details: impl Into<String>) -> Self {
        Self::InvariantViolation {
            details: details.into(),
        }
    }
}
