//! Rampart Queue - pending workloads ordered per ClusterQueue
//!
//! This crate provides:
//! - The [`QueueManager`] routing workloads through LocalQueues into
//!   ordered per-ClusterQueue queues
//! - Head selection under StrictFIFO and BestEffortFIFO
//! - Requeueing with exponential [`Backoff`] and jitter

pub mod backoff;
pub mod cluster_queue;
pub mod error;
pub mod manager;
pub mod types;

// Re-export commonly used types
pub use backoff::Backoff;
pub use error::{QueueError, Result};
pub use manager::{QueueConfig, QueueManager};
pub use types::{PendingCounts, RequeueReason, WorkloadInfo};
