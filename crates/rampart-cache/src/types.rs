use crate::Result;
use chrono::{DateTime, Utc};
use rampart_core::{
    Admission, AdmissionCheck, CheckRetryPolicy, FlavorResource, Workload, WorkloadKey,
};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// Quantities per (flavor, resource), in canonical units
pub type Usage = BTreeMap<FlavorResource, i64>;

/// Add `delta` into `total`
pub fn add_usage(total: &mut Usage, delta: &Usage) {
    for (fr, value) in delta {
        *total.entry(fr.clone()).or_default() += value;
    }
}

/// Subtract `delta` from `total`, dropping entries that reach zero
pub fn sub_usage(total: &mut Usage, delta: &Usage) {
    for (fr, value) in delta {
        if let Some(current) = total.get_mut(fr) {
            *current -= value;
            if *current == 0 {
                total.remove(fr);
            }
        } else if *value != 0 {
            total.insert(fr.clone(), -value);
        }
    }
}

/// Quota of one ClusterQueue for one (flavor, resource)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QuotaLimits {
    pub nominal: i64,
    pub borrowing_limit: Option<i64>,
    pub lending_limit: Option<i64>,
}

impl QuotaLimits {
    /// The part of nominal quota that is never lent to the cohort
    pub fn guaranteed(&self) -> i64 {
        self.lending_limit
            .map(|lending| (self.nominal - lending).max(0))
            .unwrap_or(0)
    }

    /// The part of nominal quota offered to the cohort
    pub fn lendable(&self) -> i64 {
        self.lending_limit.unwrap_or(self.nominal)
    }
}

/// Whether a ClusterQueue may admit
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum QueueStatus {
    Active,
    /// Misconfigured or waiting on a dependency
    Pending { reason: String, message: String },
    /// Deletion requested while workloads still hold quota
    Terminating,
}

impl QueueStatus {
    pub fn pending(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Pending {
            reason: reason.into(),
            message: message.into(),
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    /// Short machine-readable reason
    pub fn reason(&self) -> &str {
        match self {
            Self::Active => "Ready",
            Self::Pending { reason, .. } => reason,
            Self::Terminating => "Terminating",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Active => "Can admit new workloads",
            Self::Pending { message, .. } => message,
            Self::Terminating => "Deletion requested; waiting for reserved workloads to drain",
        }
    }
}

/// A quota-reserved (or assumed) workload as the cache accounts it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedWorkload {
    pub key: WorkloadKey,
    pub cluster_queue: String,
    pub priority: i32,
    pub usage: Usage,
    pub reserved_at: DateTime<Utc>,
    pub created_at: Option<DateTime<Utc>>,
    /// Reserved by the scheduler but not yet observed from the store
    pub assumed: bool,
    /// An eviction has been issued for it
    pub evicting: bool,
}

impl CachedWorkload {
    pub fn new(workload: &Workload, admission: &Admission, now: DateTime<Utc>) -> Result<Self> {
        Ok(Self {
            key: workload.key(),
            cluster_queue: admission.cluster_queue.clone(),
            priority: workload.spec.priority,
            usage: admission.usage()?,
            reserved_at: workload.reservation_time().unwrap_or(now),
            created_at: workload.creation_time(),
            assumed: false,
            evicting: false,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResourceGroup {
    pub covered_resources: Vec<String>,
    /// Flavor names in preference order
    pub flavors: Vec<String>,
}

impl CachedResourceGroup {
    pub fn covers(&self, resource: &str) -> bool {
        self.covered_resources.iter().any(|r| r == resource)
    }
}

/// A cohort: member names plus the quota an explicit Cohort object adds
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CachedCohort {
    pub name: String,
    pub members: BTreeSet<String>,
    pub own_quota: BTreeMap<FlavorResource, i64>,
    /// Backed by a Cohort object rather than only named by queues
    pub explicit: bool,
}

impl CachedCohort {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Implicit and memberless cohorts can be dropped
    pub fn is_unused(&self) -> bool {
        !self.explicit && self.members.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedAdmissionCheck {
    pub name: String,
    pub controller_name: String,
    pub active: bool,
    pub retry_policy: CheckRetryPolicy,
}

impl From<&AdmissionCheck> for CachedAdmissionCheck {
    fn from(check: &AdmissionCheck) -> Self {
        use rampart_core::Resource;
        Self {
            name: check.name().to_string(),
            controller_name: check.spec.controller_name.clone(),
            active: check.status.active,
            retry_policy: check.spec.retry_policy.clone(),
        }
    }
}
