//! Rampart Scheduler - admission cycles over pending workloads
//!
//! This crate provides:
//! - The cyclic [`Scheduler`]: snapshot, heads, flavor assignment,
//!   preemption, commit and rollback
//! - Flavor assignment honoring flavor fungibility
//! - Minimal victim search for preemption
//! - Pluggable cross-queue ordering policies

pub mod error;
pub mod flavor;
pub mod ordering;
pub mod preemption;
pub mod scheduler;
pub mod types;

// Re-export commonly used types
pub use error::{Result, SchedulerError};
pub use flavor::assign_flavors;
pub use ordering::{
    ordering_by_name, EntryOrdering, FairnessTracker, PriorityThenFairness, RoundRobin,
};
pub use preemption::{find_victims, PreemptionOutcome};
pub use scheduler::{Scheduler, SchedulerConfig};
pub use types::{AssignmentMode, CycleReport, Entry, FlavorAssignment, PodSetFlavors};
