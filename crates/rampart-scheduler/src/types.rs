use rampart_cache::Usage;
use rampart_core::{Admission, PodSetAssignment, WorkloadKey};
use rampart_queue::{RequeueReason, WorkloadInfo};
use std::collections::BTreeMap;

/// How a workload can be placed into a ClusterQueue. Ordered worst to best.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AssignmentMode {
    /// Does not fit even with every workload evicted
    NoFit,
    /// Fits after evicting some workloads
    Preempt,
    /// Fits in the available quota
    Fit,
}

/// Flavors chosen for one pod set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodSetFlavors {
    pub name: String,
    pub count: i32,
    /// resource → flavor
    pub flavors: BTreeMap<String, String>,
    /// resource → total quantity
    pub requests: BTreeMap<String, i64>,
}

/// Result of flavor assignment for one workload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlavorAssignment {
    pub mode: AssignmentMode,
    pub pod_sets: Vec<PodSetFlavors>,
    /// Total per (flavor, resource)
    pub usage: Usage,
    /// Some flavor-resource goes beyond nominal quota
    pub borrows: bool,
    /// Why the mode is not `Fit`
    pub reason: Option<String>,
}

impl FlavorAssignment {
    pub(crate) fn no_fit(reason: impl Into<String>) -> Self {
        Self {
            mode: AssignmentMode::NoFit,
            pod_sets: Vec::new(),
            usage: Usage::new(),
            borrows: false,
            reason: Some(reason.into()),
        }
    }

    /// The admission record to write for this assignment
    pub fn to_admission(&self, cluster_queue: &str) -> Admission {
        Admission {
            cluster_queue: cluster_queue.to_string(),
            pod_set_assignments: self
                .pod_sets
                .iter()
                .map(|ps| {
                    PodSetAssignment::new(&ps.name, ps.count, ps.flavors.clone(), &ps.requests)
                })
                .collect(),
        }
    }
}

/// A head taking part in a cycle
#[derive(Debug, Clone)]
pub struct Entry {
    pub info: WorkloadInfo,
    /// Assignment against the cycle's snapshot, before any decision
    pub assignment: FlavorAssignment,
}

impl Entry {
    pub fn cluster_queue(&self) -> &str {
        &self.info.cluster_queue
    }

    pub fn fits_without_borrowing(&self) -> bool {
        self.assignment.mode == AssignmentMode::Fit && !self.assignment.borrows
    }
}

/// What one cycle decided
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub admitted: Vec<WorkloadKey>,
    pub evicted: Vec<WorkloadKey>,
    pub requeued: Vec<(WorkloadKey, RequeueReason)>,
}

impl CycleReport {
    pub fn is_empty(&self) -> bool {
        self.admitted.is_empty() && self.evicted.is_empty() && self.requeued.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rampart_core::FlavorResource;

    #[test]
    fn test_mode_ordering() {
        assert!(AssignmentMode::Fit > AssignmentMode::Preempt);
        assert!(AssignmentMode::Preempt > AssignmentMode::NoFit);
        assert_eq!(
            AssignmentMode::Fit.min(AssignmentMode::Preempt),
            AssignmentMode::Preempt
        );
    }

    #[test]
    fn test_to_admission() {
        let assignment = FlavorAssignment {
            mode: AssignmentMode::Fit,
            pod_sets: vec![PodSetFlavors {
                name: "main".to_string(),
                count: 2,
                flavors: BTreeMap::from([("cpu".to_string(), "spot".to_string())]),
                requests: BTreeMap::from([("cpu".to_string(), 3000)]),
            }],
            usage: Usage::from([(FlavorResource::new("spot", "cpu"), 3000)]),
            borrows: false,
            reason: None,
        };
        let admission = assignment.to_admission("team-a");
        assert_eq!(admission.cluster_queue, "team-a");
        assert_eq!(admission.usage().unwrap(), assignment.usage);
    }
}
