use super::quantities::{format_quantity, parse_quantity};
use super::{validate_base, Resource, ResourceError};
use crate::types::{FlavorResource, WorkloadKey};
use crate::Result;
use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// The admission unit: one job's resource request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Workload {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: WorkloadSpec,
    #[serde(default)]
    pub status: WorkloadStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadSpec {
    pub queue_name: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub pod_sets: Vec<PodSet>,
}

fn default_active() -> bool {
    true
}

impl Default for WorkloadSpec {
    fn default() -> Self {
        Self {
            queue_name: String::new(),
            priority: 0,
            active: true,
            pod_sets: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSet {
    pub name: String,
    #[serde(default = "default_count")]
    pub count: i32,
    /// Per-pod requests
    #[serde(default)]
    pub requests: BTreeMap<String, Quantity>,
}

fn default_count() -> i32 {
    1
}

impl PodSet {
    pub fn new(name: impl Into<String>, count: i32) -> Self {
        Self {
            name: name.into(),
            count,
            requests: BTreeMap::new(),
        }
    }

    /// Add a per-pod request
    pub fn with_request(
        mut self,
        resource: impl Into<String>,
        quantity: impl Into<String>,
    ) -> Self {
        self.requests.insert(resource.into(), Quantity(quantity.into()));
        self
    }

    /// count × per-pod request, per resource, in canonical units
    pub fn total_requests(&self) -> Result<BTreeMap<String, i64>> {
        let mut totals = BTreeMap::new();
        for (resource, quantity) in &self.requests {
            let per_pod = parse_quantity(resource, quantity)?;
            totals.insert(resource.clone(), per_pod.saturating_mul(i64::from(self.count)));
        }
        Ok(totals)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionType {
    QuotaReserved,
    AdmissionChecksComplete,
    Admitted,
    Evicted,
    Finished,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadCondition {
    #[serde(rename = "type")]
    pub type_: ConditionType,
    pub status: bool,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<WorkloadCondition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admission: Option<Admission>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub admission_checks: Vec<AdmissionCheckState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requeue_state: Option<RequeueState>,
}

/// The quota reservation granted to a workload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Admission {
    pub cluster_queue: String,
    pub pod_set_assignments: Vec<PodSetAssignment>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSetAssignment {
    pub name: String,
    pub count: i32,
    /// resource → flavor
    #[serde(default)]
    pub flavors: BTreeMap<String, String>,
    /// resource → total quantity for the pod set
    #[serde(default)]
    pub resource_usage: BTreeMap<String, Quantity>,
}

impl PodSetAssignment {
    /// Build an assignment from canonical totals
    pub fn new(
        name: impl Into<String>,
        count: i32,
        flavors: BTreeMap<String, String>,
        usage: &BTreeMap<String, i64>,
    ) -> Self {
        Self {
            name: name.into(),
            count,
            flavors,
            resource_usage: usage
                .iter()
                .map(|(resource, value)| (resource.clone(), format_quantity(resource, *value)))
                .collect(),
        }
    }
}

impl Admission {
    /// Total usage of this admission per (flavor, resource)
    pub fn usage(&self) -> Result<BTreeMap<FlavorResource, i64>> {
        let mut usage: BTreeMap<FlavorResource, i64> = BTreeMap::new();
        for assignment in &self.pod_set_assignments {
            for (resource, quantity) in &assignment.resource_usage {
                let Some(flavor) = assignment.flavors.get(resource) else {
                    continue;
                };
                let value = parse_quantity(resource, quantity)?;
                *usage
                    .entry(FlavorResource::new(flavor, resource))
                    .or_default() += value;
            }
        }
        Ok(usage)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CheckState {
    #[default]
    Pending,
    Ready,
    Retry,
    Rejected,
}

/// State of one AdmissionCheck for one workload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionCheckState {
    pub name: String,
    pub state: CheckState,
    #[serde(default)]
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequeueState {
    #[serde(default)]
    pub count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requeue_at: Option<DateTime<Utc>>,
}

impl Workload {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        queue_name: impl Into<String>,
    ) -> Self {
        Self {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some(namespace.into()),
                ..Default::default()
            },
            spec: WorkloadSpec {
                queue_name: queue_name.into(),
                ..Default::default()
            },
            status: WorkloadStatus::default(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.spec.priority = priority;
        self
    }

    pub fn with_pod_set(mut self, pod_set: PodSet) -> Self {
        self.spec.pod_sets.push(pod_set);
        self
    }

    pub fn key(&self) -> WorkloadKey {
        WorkloadKey::new(self.namespace(), self.name())
    }

    pub fn creation_time(&self) -> Option<DateTime<Utc>> {
        self.metadata.creation_timestamp.as_ref().map(|t| t.0)
    }

    pub fn condition(&self, type_: ConditionType) -> Option<&WorkloadCondition> {
        self.status.conditions.iter().find(|c| c.type_ == type_)
    }

    pub fn is_condition_true(&self, type_: ConditionType) -> bool {
        self.condition(type_).is_some_and(|c| c.status)
    }

    /// Set a condition. The transition time only moves when the status flips.
    /// Returns whether anything changed.
    pub fn set_condition(
        &mut self,
        type_: ConditionType,
        status: bool,
        reason: impl Into<String>,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> bool {
        let reason = reason.into();
        let message = message.into();
        match self.status.conditions.iter_mut().find(|c| c.type_ == type_) {
            Some(existing) => {
                if existing.status == status
                    && existing.reason == reason
                    && existing.message == message
                {
                    return false;
                }
                if existing.status != status {
                    existing.last_transition_time = now;
                }
                existing.status = status;
                existing.reason = reason;
                existing.message = message;
                true
            }
            None => {
                self.status.conditions.push(WorkloadCondition {
                    type_,
                    status,
                    reason,
                    message,
                    last_transition_time: now,
                });
                true
            }
        }
    }

    /// QuotaReserved is true and an admission record is present
    pub fn has_quota_reservation(&self) -> bool {
        self.status.admission.is_some() && self.is_condition_true(ConditionType::QuotaReserved)
    }

    pub fn is_admitted(&self) -> bool {
        self.is_condition_true(ConditionType::Admitted)
    }

    pub fn is_finished(&self) -> bool {
        self.is_condition_true(ConditionType::Finished)
    }

    pub fn is_active(&self) -> bool {
        self.spec.active
    }

    /// Name of the ClusterQueue holding the reservation
    pub fn admitted_cluster_queue(&self) -> Option<&str> {
        self.status
            .admission
            .as_ref()
            .filter(|_| self.is_condition_true(ConditionType::QuotaReserved))
            .map(|a| a.cluster_queue.as_str())
    }

    /// When the current reservation was made
    pub fn reservation_time(&self) -> Option<DateTime<Utc>> {
        self.condition(ConditionType::QuotaReserved)
            .filter(|c| c.status)
            .map(|c| c.last_transition_time)
    }

    /// Record a quota reservation
    pub fn set_quota_reservation(&mut self, admission: Admission, now: DateTime<Utc>) {
        let message = format!("Quota reserved in ClusterQueue {}", admission.cluster_queue);
        self.status.admission = Some(admission);
        self.set_condition(ConditionType::QuotaReserved, true, "QuotaReserved", message, now);
        if self.condition(ConditionType::Evicted).is_some() {
            self.set_condition(ConditionType::Evicted, false, "QuotaReserved", "", now);
        }
    }

    /// Drop the reservation and mark the workload evicted. Every admission
    /// check goes back to Pending and must pass again on the next reservation.
    pub fn clear_reservation(
        &mut self,
        reason: impl Into<String>,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) {
        let reason = reason.into();
        let message = message.into();
        self.status.admission = None;
        self.set_condition(ConditionType::QuotaReserved, false, reason.clone(), "", now);
        if self.condition(ConditionType::Admitted).is_some() {
            self.set_condition(ConditionType::Admitted, false, reason.clone(), "", now);
        }
        if self.condition(ConditionType::AdmissionChecksComplete).is_some() {
            self.set_condition(
                ConditionType::AdmissionChecksComplete,
                false,
                reason.clone(),
                "",
                now,
            );
        }
        self.set_condition(ConditionType::Evicted, true, reason, message, now);
        for check in &mut self.status.admission_checks {
            if check.state != CheckState::Pending {
                check.state = CheckState::Pending;
                check.message.clear();
                check.last_transition_time = now;
            }
        }
    }

    pub fn check_state(&self, name: &str) -> Option<&AdmissionCheckState> {
        self.status.admission_checks.iter().find(|c| c.name == name)
    }

    /// Set the state of one check. Returns whether anything changed.
    pub fn set_check_state(
        &mut self,
        name: &str,
        state: CheckState,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> bool {
        let message = message.into();
        match self
            .status
            .admission_checks
            .iter_mut()
            .find(|c| c.name == name)
        {
            Some(existing) => {
                if existing.state == state && existing.message == message {
                    return false;
                }
                if existing.state != state {
                    existing.last_transition_time = now;
                }
                existing.state = state;
                existing.message = message;
                true
            }
            None => {
                self.status.admission_checks.push(AdmissionCheckState {
                    name: name.to_string(),
                    state,
                    message,
                    last_transition_time: now,
                });
                true
            }
        }
    }

    /// Total requests of the workload per resource, across all pod sets
    pub fn total_requests(&self) -> Result<BTreeMap<String, i64>> {
        let mut totals: BTreeMap<String, i64> = BTreeMap::new();
        for pod_set in &self.spec.pod_sets {
            for (resource, value) in pod_set.total_requests()? {
                *totals.entry(resource).or_default() += value;
            }
        }
        Ok(totals)
    }
}

impl Resource for Workload {
    const KIND: &'static str = "Workload";
    const NAMESPACED: bool = true;

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn validate(&self) -> std::result::Result<(), ResourceError> {
        validate_base(&self.metadata, Self::NAMESPACED)?;

        if self.spec.queue_name.is_empty() {
            return Err(ResourceError::MissingField("spec.queueName".to_string()));
        }
        if self.spec.pod_sets.is_empty() {
            return Err(ResourceError::ValidationFailed(
                "Workload must have at least one pod set".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for pod_set in &self.spec.pod_sets {
            if !seen.insert(pod_set.name.as_str()) {
                return Err(ResourceError::ValidationFailed(format!(
                    "duplicate pod set name {}",
                    pod_set.name
                )));
            }
            if pod_set.count < 1 {
                return Err(ResourceError::ValidationFailed(format!(
                    "pod set {} must have a positive count",
                    pod_set.name
                )));
            }
            if pod_set.total_requests().is_err() {
                return Err(ResourceError::ValidationFailed(format!(
                    "pod set {} has an invalid resource request",
                    pod_set.name
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample() -> Workload {
        Workload::new("team-a", "job-1", "main")
            .with_priority(10)
            .with_pod_set(
                PodSet::new("workers", 4)
                    .with_request("cpu", "500m")
                    .with_request("memory", "1Gi"),
            )
    }

    #[test]
    fn test_total_requests() {
        let wl = sample();
        let totals = wl.total_requests().unwrap();
        assert_eq!(totals["cpu"], 2000);
        assert_eq!(totals["memory"], 4 * 1024 * 1024 * 1024);
        assert!(wl.validate().is_ok());
    }

    #[test]
    fn test_spec_defaults() {
        let wl: Workload = serde_json::from_str(
            r#"{
                "metadata": {"name": "w", "namespace": "ns"},
                "spec": {"queueName": "q", "podSets": [{"name": "main"}]}
            }"#,
        )
        .unwrap();
        assert!(wl.spec.active);
        assert_eq!(wl.spec.priority, 0);
        assert_eq!(wl.spec.pod_sets[0].count, 1);
    }

    #[test]
    fn test_validation() {
        let mut wl = sample();
        wl.spec.pod_sets.push(PodSet::new("workers", 1));
        assert!(wl.validate().is_err());

        let wl = Workload::new("team-a", "job-1", "main");
        assert!(wl.validate().is_err());

        let wl = Workload::new("team-a", "job-1", "main").with_pod_set(PodSet::new("a", 0));
        assert!(wl.validate().is_err());
    }

    #[test]
    fn test_set_condition_transition_time() {
        let mut wl = sample();
        let t0 = Utc::now();
        let t1 = t0 + Duration::seconds(5);

        assert!(wl.set_condition(ConditionType::QuotaReserved, true, "QuotaReserved", "", t0));
        assert!(!wl.set_condition(ConditionType::QuotaReserved, true, "QuotaReserved", "", t1));
        assert_eq!(
            wl.condition(ConditionType::QuotaReserved).unwrap().last_transition_time,
            t0
        );

        assert!(wl.set_condition(ConditionType::QuotaReserved, true, "Other", "", t1));
        assert_eq!(
            wl.condition(ConditionType::QuotaReserved).unwrap().last_transition_time,
            t0
        );

        assert!(wl.set_condition(ConditionType::QuotaReserved, false, "Evicted", "", t1));
        assert_eq!(
            wl.condition(ConditionType::QuotaReserved).unwrap().last_transition_time,
            t1
        );
    }

    #[test]
    fn test_reservation_lifecycle() {
        let mut wl = sample();
        let now = Utc::now();
        let mut flavors = BTreeMap::new();
        flavors.insert("cpu".to_string(), "default".to_string());
        let usage = BTreeMap::from([("cpu".to_string(), 2000)]);
        let admission = Admission {
            cluster_queue: "cq".to_string(),
            pod_set_assignments: vec![PodSetAssignment::new("workers", 4, flavors, &usage)],
        };

        wl.set_quota_reservation(admission, now);
        assert!(wl.has_quota_reservation());
        assert_eq!(wl.admitted_cluster_queue(), Some("cq"));
        assert_eq!(wl.reservation_time(), Some(now));

        let usage = wl.status.admission.as_ref().unwrap().usage().unwrap();
        assert_eq!(usage[&FlavorResource::new("default", "cpu")], 2000);

        wl.set_check_state("prov", CheckState::Ready, "capacity found", now);
        wl.clear_reservation("Preempted", "preempted by team-a/job-2", now);
        assert!(!wl.has_quota_reservation());
        // Checks must approve the next reservation again
        let prov = wl.check_state("prov").unwrap();
        assert_eq!(prov.state, CheckState::Pending);
        assert!(prov.message.is_empty());
        assert!(wl.is_condition_true(ConditionType::Evicted));
        assert_eq!(wl.admitted_cluster_queue(), None);
        assert_eq!(wl.reservation_time(), None);
    }

    #[test]
    fn test_set_check_state() {
        let mut wl = sample();
        let now = Utc::now();
        assert!(wl.set_check_state("prov", CheckState::Pending, "", now));
        assert!(!wl.set_check_state("prov", CheckState::Pending, "", now));
        assert!(wl.set_check_state("prov", CheckState::Ready, "capacity found", now));
        assert_eq!(wl.check_state("prov").unwrap().state, CheckState::Ready);
        assert!(wl.check_state("other").is_none());
    }
}
