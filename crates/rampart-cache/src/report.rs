use crate::Snapshot;
use serde::Serialize;
use std::collections::BTreeSet;

/// Usage of one flavor-resource in a ClusterQueue, in canonical units
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUsage {
    pub flavor: String,
    pub resource: String,
    pub nominal: i64,
    pub used: i64,
    pub borrowed: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterQueueUsage {
    pub name: String,
    pub cohort: Option<String>,
    pub status: String,
    /// Workloads holding quota, assumed ones included
    pub reserved_workloads: usize,
    pub resources: Vec<ResourceUsage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CohortResourceUsage {
    pub flavor: String,
    pub resource: String,
    pub requestable: i64,
    pub used: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CohortUsage {
    pub name: String,
    pub members: Vec<String>,
    pub resources: Vec<CohortResourceUsage>,
}

/// Periodic summary of quota usage, sorted by name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageReport {
    pub cluster_queues: Vec<ClusterQueueUsage>,
    pub cohorts: Vec<CohortUsage>,
}

impl UsageReport {
    pub fn from_snapshot(snapshot: &Snapshot) -> Self {
        let mut cluster_queues: Vec<ClusterQueueUsage> = snapshot
            .cluster_queues()
            .map(|cq| {
                let frs: BTreeSet<_> = cq.quotas.keys().chain(cq.usage.keys()).collect();
                ClusterQueueUsage {
                    name: cq.name.clone(),
                    cohort: cq.cohort.clone(),
                    status: cq.status.reason().to_string(),
                    reserved_workloads: cq.reserved_count(),
                    resources: frs
                        .into_iter()
                        .map(|fr| ResourceUsage {
                            flavor: fr.flavor.clone(),
                            resource: fr.resource.clone(),
                            nominal: cq.quota(fr).map(|q| q.nominal).unwrap_or(0),
                            used: cq.used(fr),
                            borrowed: snapshot.borrowed(&cq.name, fr),
                        })
                        .collect(),
                }
            })
            .collect();
        cluster_queues.sort_by(|a, b| a.name.cmp(&b.name));

        let mut cohorts: Vec<CohortUsage> = snapshot
            .cohorts()
            .map(|cohort| {
                let members: Vec<_> = cohort
                    .members
                    .iter()
                    .filter_map(|m| snapshot.cluster_queue(m))
                    .collect();
                let frs: BTreeSet<_> = members
                    .iter()
                    .flat_map(|cq| cq.quotas.keys())
                    .chain(cohort.own_quota.keys())
                    .collect();
                CohortUsage {
                    name: cohort.name.clone(),
                    members: cohort.members.iter().cloned().collect(),
                    resources: frs
                        .into_iter()
                        .map(|fr| CohortResourceUsage {
                            flavor: fr.flavor.clone(),
                            resource: fr.resource.clone(),
                            requestable: snapshot.cohort_requestable(&cohort.name, fr),
                            used: snapshot.cohort_usage(&cohort.name, fr),
                        })
                        .collect(),
                }
            })
            .collect();
        cohorts.sort_by(|a, b| a.name.cmp(&b.name));

        Self {
            cluster_queues,
            cohorts,
        }
    }

    /// Workloads holding quota across all queues
    pub fn total_reserved(&self) -> usize {
        self.cluster_queues.iter().map(|cq| cq.reserved_workloads).sum()
    }
}

#[cfg(test)]
mod tests {
    use crate::Cache;
    use chrono::Utc;
    use rampart_core::{
        Admission, ClusterQueue, FlavorQuotas, PodSet, PodSetAssignment, ResourceFlavor,
        ResourceGroup, ResourceQuota, Workload,
    };
    use std::collections::BTreeMap;

    #[test]
    fn test_report_borrowing_queue() {
        let cache = Cache::new();
        cache.upsert_flavor(&ResourceFlavor::new("default"));
        for name in ["a", "b"] {
            let mut cq = ClusterQueue::new(name);
            cq.spec.cohort = Some("pool".to_string());
            cq.spec.resource_groups = vec![ResourceGroup {
                covered_resources: vec!["cpu".to_string()],
                flavors: vec![FlavorQuotas {
                    name: "default".to_string(),
                    resources: vec![ResourceQuota::new("cpu", "2")],
                }],
            }];
            cache.upsert_cluster_queue(&cq);
        }

        let mut wl = Workload::new("ns", "big", "main")
            .with_pod_set(PodSet::new("main", 3).with_request("cpu", "1"));
        wl.set_quota_reservation(
            Admission {
                cluster_queue: "a".to_string(),
                pod_set_assignments: vec![PodSetAssignment::new(
                    "main",
                    3,
                    BTreeMap::from([("cpu".to_string(), "default".to_string())]),
                    &BTreeMap::from([("cpu".to_string(), 3000)]),
                )],
            },
            Utc::now(),
        );
        cache.add_or_update_workload(&wl).unwrap();

        let report = cache.usage_report();
        assert_eq!(report.total_reserved(), 1);
        let a = &report.cluster_queues[0];
        assert_eq!(a.name, "a");
        assert_eq!(a.status, "Ready");
        assert_eq!(a.resources[0].used, 3000);
        assert_eq!(a.resources[0].borrowed, 1000);

        let pool = &report.cohorts[0];
        assert_eq!(pool.members, vec!["a", "b"]);
        assert_eq!(pool.resources[0].requestable, 4000);
        assert_eq!(pool.resources[0].used, 3000);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["clusterQueues"][1]["name"], "b");
    }
}
