//! Rampart Cache - in-memory projection of queues, flavors and admitted usage
//!
//! This crate provides:
//! - The watch-fed [`Cache`] of ClusterQueues, Cohorts, flavors, admission
//!   checks and the usage of quota-reserved workloads
//! - O(1) copy-on-write [`Snapshot`]s with the cohort quota arithmetic
//! - Usage reports for periodic logging

pub mod cache;
pub mod cluster_queue;
pub mod error;
pub mod report;
pub mod snapshot;
pub mod types;

// Re-export commonly used types
pub use cache::{Cache, StatusChanges};
pub use cluster_queue::CachedClusterQueue;
pub use error::{CacheError, Result};
pub use report::{ClusterQueueUsage, CohortResourceUsage, CohortUsage, ResourceUsage, UsageReport};
pub use snapshot::Snapshot;
pub use types::{
    CachedAdmissionCheck, CachedCohort, CachedResourceGroup, CachedWorkload, QueueStatus,
    QuotaLimits, Usage,
};
