use chrono::{DateTime, Utc};
use rampart_core::{Workload, WorkloadKey};
use serde::Serialize;
use std::cmp::Reverse;
use std::time::Duration;

/// A pending workload as its ClusterQueue holds it
#[derive(Debug, Clone)]
pub struct WorkloadInfo {
    pub key: WorkloadKey,
    /// Last observed object
    pub workload: Workload,
    pub cluster_queue: String,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    /// When the workload first became schedulable in its ClusterQueue
    pub eligible_since: DateTime<Utc>,
    /// Consecutive infeasible attempts
    pub attempts: u32,
    /// Not proposed again before this time
    pub not_before: Option<DateTime<Utc>>,
}

impl WorkloadInfo {
    pub(crate) fn new(workload: Workload, cluster_queue: String, now: DateTime<Utc>) -> Self {
        let created_at = workload.creation_time().unwrap_or(now);
        Self {
            key: workload.key(),
            priority: workload.spec.priority,
            workload,
            cluster_queue,
            created_at,
            eligible_since: now,
            attempts: 0,
            not_before: None,
        }
    }

    pub(crate) fn order_key(&self) -> OrderKey {
        (
            Reverse(self.priority),
            self.eligible_since,
            self.created_at,
            self.key.clone(),
        )
    }

    pub fn is_backing_off(&self, now: DateTime<Utc>) -> bool {
        self.not_before.is_some_and(|t| t > now)
    }
}

/// Priority desc, then eligible-since, creation time and key asc
pub(crate) type OrderKey = (Reverse<i32>, DateTime<Utc>, DateTime<Utc>, WorkloadKey);

/// Why a popped head goes back to its queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequeueReason {
    /// Its quota was taken away
    Evicted,
    /// Victims are being evicted on its behalf
    PreemptionPending,
    /// The cycle stopped before deciding
    CycleAborted,
    /// Its reservation lost against a newer version
    Conflict,
    /// Nothing fits, even with preemption
    Infeasible,
    /// An admission check asked for a retry
    CheckRetry { delay: Duration },
}

impl RequeueReason {
    /// Whether the workload may be proposed again right away
    pub fn is_immediate(&self) -> bool {
        matches!(
            self,
            Self::Evicted | Self::PreemptionPending | Self::CycleAborted | Self::Conflict
        )
    }
}

/// Pending workloads of one ClusterQueue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingCounts {
    /// Queued and ready to be proposed
    pub active: usize,
    /// Parked or backing off
    pub inadmissible: usize,
}

impl PendingCounts {
    pub fn total(&self) -> usize {
        self.active + self.inadmissible
    }
}
