use crate::types::{
    add_usage, sub_usage, CachedAdmissionCheck, CachedResourceGroup, CachedWorkload, QueueStatus,
    QuotaLimits, Usage,
};
use rampart_core::{
    parse_quantity, ClusterQueue, FlavorFungibility, FlavorResource, PreemptionPolicy,
    QueueingStrategy, Resource, WorkloadKey,
};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

pub const REASON_INVALID_QUOTA: &str = "InvalidQuota";
pub const REASON_INVALID_RESOURCE_GROUPS: &str = "InvalidResourceGroups";
pub const REASON_FLAVOR_NOT_FOUND: &str = "FlavorNotFound";
pub const REASON_CHECK_NOT_FOUND: &str = "AdmissionCheckNotFound";
pub const REASON_CHECK_INACTIVE: &str = "AdmissionCheckInactive";

/// A ClusterQueue as the cache sees it: parsed quotas plus the workloads
/// holding quota in it
#[derive(Debug, Clone)]
pub struct CachedClusterQueue {
    pub name: String,
    pub cohort: Option<String>,
    pub resource_groups: Vec<CachedResourceGroup>,
    pub quotas: BTreeMap<FlavorResource, QuotaLimits>,
    pub queueing_strategy: QueueingStrategy,
    pub preemption: PreemptionPolicy,
    pub flavor_fungibility: FlavorFungibility,
    pub admission_checks: Vec<String>,
    pub status: QueueStatus,
    pub usage: Usage,
    pub workloads: BTreeMap<WorkloadKey, CachedWorkload>,
    /// Problem found while parsing the spec, independent of other objects
    spec_error: Option<QueueStatus>,
    terminating: bool,
}

impl CachedClusterQueue {
    /// Parse a ClusterQueue definition. Invalid quota never fails the call;
    /// it leaves the queue pending with a reason.
    pub fn from_spec(cq: &ClusterQueue) -> Self {
        let mut resource_groups = Vec::with_capacity(cq.spec.resource_groups.len());
        let mut quotas = BTreeMap::new();
        let mut quota_error = None;
        let mut groups_error = None;
        let mut covered: HashSet<&str> = HashSet::new();

        for group in &cq.spec.resource_groups {
            for resource in &group.covered_resources {
                if !covered.insert(resource.as_str()) && groups_error.is_none() {
                    groups_error = Some(QueueStatus::pending(
                        REASON_INVALID_RESOURCE_GROUPS,
                        format!("resource {} is covered by more than one resource group", resource),
                    ));
                }
            }
            for flavor in &group.flavors {
                for quota in &flavor.resources {
                    let problem = match parse_limits(&quota.name, quota) {
                        Ok(limits) => {
                            quotas.insert(FlavorResource::new(&flavor.name, &quota.name), limits);
                            limits_problem(&limits).map(str::to_string)
                        }
                        Err(e) => Some(e.to_string()),
                    };
                    if let (Some(problem), None) = (problem, &quota_error) {
                        quota_error = Some(QueueStatus::pending(
                            REASON_INVALID_QUOTA,
                            format!("{}/{}: {}", flavor.name, quota.name, problem),
                        ));
                    }
                }
            }
            resource_groups.push(CachedResourceGroup {
                covered_resources: group.covered_resources.clone(),
                flavors: group.flavors.iter().map(|f| f.name.clone()).collect(),
            });
        }

        Self {
            name: cq.name().to_string(),
            cohort: cq.cohort().map(str::to_string),
            resource_groups,
            quotas,
            queueing_strategy: cq.spec.queueing_strategy,
            preemption: cq.spec.preemption,
            flavor_fungibility: cq.spec.flavor_fungibility,
            admission_checks: cq.spec.admission_checks.clone(),
            status: QueueStatus::pending("Initializing", "Waiting for dependencies"),
            usage: Usage::new(),
            workloads: BTreeMap::new(),
            spec_error: quota_error.or(groups_error),
            terminating: false,
        }
    }

    /// Take over the definition of `updated`, keeping accounted workloads
    pub fn apply_definition(&mut self, updated: CachedClusterQueue) {
        let workloads = std::mem::take(&mut self.workloads);
        let usage = std::mem::take(&mut self.usage);
        let terminating = self.terminating;
        *self = updated;
        self.workloads = workloads;
        self.usage = usage;
        self.terminating = terminating;
    }

    /// Status implied by the definition and the objects it references
    pub fn derive_status(
        &self,
        flavors: &BTreeSet<String>,
        checks: &HashMap<String, CachedAdmissionCheck>,
    ) -> QueueStatus {
        if self.terminating {
            return QueueStatus::Terminating;
        }
        if let Some(error) = &self.spec_error {
            return error.clone();
        }

        let missing: Vec<&str> = self
            .resource_groups
            .iter()
            .flat_map(|g| g.flavors.iter())
            .filter(|f| !flavors.contains(*f))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return QueueStatus::pending(
                REASON_FLAVOR_NOT_FOUND,
                format!(
                    "Can't admit new workloads; references missing ResourceFlavor(s): {}",
                    missing.join(", ")
                ),
            );
        }

        for name in &self.admission_checks {
            match checks.get(name) {
                None => {
                    return QueueStatus::pending(
                        REASON_CHECK_NOT_FOUND,
                        format!(
                            "Can't admit new workloads; references missing AdmissionCheck {}",
                            name
                        ),
                    )
                }
                Some(check) if !check.active => {
                    return QueueStatus::pending(
                        REASON_CHECK_INACTIVE,
                        format!("Can't admit new workloads; AdmissionCheck {} is not active", name),
                    )
                }
                Some(_) => {}
            }
        }

        QueueStatus::Active
    }

    pub fn is_terminating(&self) -> bool {
        self.terminating
    }

    pub fn set_terminating(&mut self) {
        self.terminating = true;
        self.status = QueueStatus::Terminating;
    }

    pub fn quota(&self, fr: &FlavorResource) -> Option<&QuotaLimits> {
        self.quotas.get(fr)
    }

    /// Current usage of one flavor-resource
    pub fn used(&self, fr: &FlavorResource) -> i64 {
        self.usage.get(fr).copied().unwrap_or(0)
    }

    /// The resource group covering `resource`
    pub fn group_for(&self, resource: &str) -> Option<&CachedResourceGroup> {
        self.resource_groups.iter().find(|g| g.covers(resource))
    }

    pub fn add_workload(&mut self, workload: CachedWorkload) {
        add_usage(&mut self.usage, &workload.usage);
        if let Some(previous) = self.workloads.insert(workload.key.clone(), workload) {
            sub_usage(&mut self.usage, &previous.usage);
        }
    }

    pub fn remove_workload(&mut self, key: &WorkloadKey) -> Option<CachedWorkload> {
        let removed = self.workloads.remove(key)?;
        sub_usage(&mut self.usage, &removed.usage);
        Some(removed)
    }

    /// Workloads holding quota, assumed ones included
    pub fn reserved_count(&self) -> usize {
        self.workloads.len()
    }

    /// Usage recomputed from the accounted workloads
    pub fn recomputed_usage(&self) -> Usage {
        let mut usage = Usage::new();
        for workload in self.workloads.values() {
            add_usage(&mut usage, &workload.usage);
        }
        usage
    }
}

fn parse_limits(
    resource: &str,
    quota: &rampart_core::ResourceQuota,
) -> rampart_core::Result<QuotaLimits> {
    Ok(QuotaLimits {
        nominal: parse_quantity(resource, &quota.nominal_quota)?,
        borrowing_limit: quota
            .borrowing_limit
            .as_ref()
            .map(|q| parse_quantity(resource, q))
            .transpose()?,
        lending_limit: quota
            .lending_limit
            .as_ref()
            .map(|q| parse_quantity(resource, q))
            .transpose()?,
    })
}

fn limits_problem(limits: &QuotaLimits) -> Option<&'static str> {
    if limits.nominal < 0 {
        return Some("nominalQuota must not be negative");
    }
    if limits.borrowing_limit.is_some_and(|b| b < 0) {
        return Some("borrowingLimit must not be negative");
    }
    match limits.lending_limit {
        Some(l) if l < 0 => Some("lendingLimit must not be negative"),
        Some(l) if l > limits.nominal => Some("lendingLimit exceeds nominalQuota"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rampart_core::{FlavorQuotas, ResourceGroup, ResourceQuota};

    fn queue(quotas: Vec<ResourceQuota>) -> ClusterQueue {
        let mut cq = ClusterQueue::new("team-a");
        cq.spec.resource_groups = vec![ResourceGroup {
            covered_resources: vec!["cpu".to_string(), "memory".to_string()],
            flavors: vec![FlavorQuotas {
                name: "default".to_string(),
                resources: quotas,
            }],
        }];
        cq
    }

    fn flavors(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_parse_quotas() {
        let mut cpu = ResourceQuota::new("cpu", "4");
        cpu.lending_limit = Some(rampart_core::Quantity("1".to_string()));
        let cached = CachedClusterQueue::from_spec(&queue(vec![
            cpu,
            ResourceQuota::new("memory", "8Gi"),
        ]));

        let limits = cached.quota(&FlavorResource::new("default", "cpu")).unwrap();
        assert_eq!(limits.nominal, 4000);
        assert_eq!(limits.lending_limit, Some(1000));
        assert_eq!(
            cached.quota(&FlavorResource::new("default", "memory")).unwrap().nominal,
            8 * 1024 * 1024 * 1024
        );
        assert!(cached.group_for("memory").is_some());
        assert!(cached.group_for("gpu").is_none());
    }

    #[test]
    fn test_status_active_when_dependencies_exist() {
        let cached = CachedClusterQueue::from_spec(&queue(vec![ResourceQuota::new("cpu", "4")]));
        assert!(!cached.status.is_active());
        assert!(cached.derive_status(&flavors(&["default"]), &HashMap::new()).is_active());
    }

    #[test]
    fn test_status_missing_flavor() {
        let cached = CachedClusterQueue::from_spec(&queue(vec![ResourceQuota::new("cpu", "4")]));
        let status = cached.derive_status(&flavors(&[]), &HashMap::new());
        assert_eq!(status.reason(), REASON_FLAVOR_NOT_FOUND);
    }

    #[test]
    fn test_status_lending_above_nominal() {
        let mut cpu = ResourceQuota::new("cpu", "4");
        cpu.lending_limit = Some(rampart_core::Quantity("5".to_string()));
        let cached = CachedClusterQueue::from_spec(&queue(vec![cpu]));
        let status = cached.derive_status(&flavors(&["default"]), &HashMap::new());
        assert_eq!(status.reason(), REASON_INVALID_QUOTA);
    }

    #[test]
    fn test_status_resource_covered_twice() {
        let mut cq = queue(vec![ResourceQuota::new("cpu", "4")]);
        cq.spec.resource_groups.push(ResourceGroup {
            covered_resources: vec!["cpu".to_string()],
            flavors: vec![],
        });
        let cached = CachedClusterQueue::from_spec(&cq);
        let status = cached.derive_status(&flavors(&["default"]), &HashMap::new());
        assert_eq!(status.reason(), REASON_INVALID_RESOURCE_GROUPS);
    }

    #[test]
    fn test_status_inactive_check() {
        let mut cq = queue(vec![ResourceQuota::new("cpu", "4")]);
        cq.spec.admission_checks = vec!["provisioning".to_string()];
        let mut cached = CachedClusterQueue::from_spec(&cq);

        let status = cached.derive_status(&flavors(&["default"]), &HashMap::new());
        assert_eq!(status.reason(), REASON_CHECK_NOT_FOUND);

        let mut checks = HashMap::new();
        checks.insert(
            "provisioning".to_string(),
            CachedAdmissionCheck {
                name: "provisioning".to_string(),
                controller_name: "example.com/provisioner".to_string(),
                active: false,
                retry_policy: Default::default(),
            },
        );
        let status = cached.derive_status(&flavors(&["default"]), &checks);
        assert_eq!(status.reason(), REASON_CHECK_INACTIVE);

        if let Some(check) = checks.get_mut("provisioning") {
            check.active = true;
        }
        assert!(cached.derive_status(&flavors(&["default"]), &checks).is_active());

        cached.set_terminating();
        assert_eq!(cached.derive_status(&flavors(&["default"]), &checks), QueueStatus::Terminating);
    }
}
