use crate::cluster_queue::CachedClusterQueue;
use crate::types::{CachedAdmissionCheck, CachedCohort, CachedWorkload};
use crate::{CacheError, Result};
use rampart_core::{FlavorResource, WorkloadKey};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Everything the cache knows. Cloning is shallow: queues and cohorts sit
/// behind their own `Arc`s and are copied only when written.
#[derive(Debug, Clone, Default)]
pub(crate) struct CacheState {
    pub(crate) cluster_queues: HashMap<String, Arc<CachedClusterQueue>>,
    pub(crate) cohorts: HashMap<String, Arc<CachedCohort>>,
    pub(crate) flavors: BTreeSet<String>,
    pub(crate) admission_checks: HashMap<String, CachedAdmissionCheck>,
    /// Workload → ClusterQueue it holds quota in
    pub(crate) workload_index: HashMap<WorkloadKey, String>,
    /// Reserved workloads whose ClusterQueue is not known yet
    pub(crate) orphans: HashMap<WorkloadKey, CachedWorkload>,
}

impl CacheState {
    pub(crate) fn cluster_queue_mut(&mut self, name: &str) -> Option<&mut CachedClusterQueue> {
        self.cluster_queues.get_mut(name).map(Arc::make_mut)
    }

    pub(crate) fn insert_workload(&mut self, workload: CachedWorkload) -> Result<()> {
        let cq_name = workload.cluster_queue.clone();
        let key = workload.key.clone();
        let cq = self
            .cluster_queue_mut(&cq_name)
            .ok_or_else(|| CacheError::cluster_queue_not_found(&cq_name))?;
        cq.add_workload(workload);
        self.workload_index.insert(key, cq_name);
        Ok(())
    }

    pub(crate) fn take_workload(&mut self, key: &WorkloadKey) -> Option<CachedWorkload> {
        if let Some(orphan) = self.orphans.remove(key) {
            return Some(orphan);
        }
        let cq_name = self.workload_index.remove(key)?;
        self.cluster_queue_mut(&cq_name)?.remove_workload(key)
    }

    pub(crate) fn cached_workload(&self, key: &WorkloadKey) -> Option<&CachedWorkload> {
        let cq_name = self.workload_index.get(key)?;
        self.cluster_queues.get(cq_name)?.workloads.get(key)
    }
}

/// Immutable point-in-time view of the cache with the quota arithmetic.
///
/// Mutating a snapshot (the scheduler's per-cycle working copy) copies only
/// what it touches; the cache and other snapshots never see the change.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    state: Arc<CacheState>,
}

impl Snapshot {
    pub(crate) fn new(state: Arc<CacheState>) -> Self {
        Self { state }
    }

    pub fn cluster_queue(&self, name: &str) -> Option<&CachedClusterQueue> {
        self.state.cluster_queues.get(name).map(Arc::as_ref)
    }

    pub fn cluster_queues(&self) -> impl Iterator<Item = &CachedClusterQueue> {
        self.state.cluster_queues.values().map(Arc::as_ref)
    }

    pub fn cohort(&self, name: &str) -> Option<&CachedCohort> {
        self.state.cohorts.get(name).map(Arc::as_ref)
    }

    pub fn cohorts(&self) -> impl Iterator<Item = &CachedCohort> {
        self.state.cohorts.values().map(Arc::as_ref)
    }

    pub fn has_flavor(&self, name: &str) -> bool {
        self.state.flavors.contains(name)
    }

    pub fn admission_check(&self, name: &str) -> Option<&CachedAdmissionCheck> {
        self.state.admission_checks.get(name)
    }

    pub fn workload(&self, key: &WorkloadKey) -> Option<&CachedWorkload> {
        self.state.cached_workload(key)
    }

    /// Members of `cq`'s cohort other than `cq` itself
    pub fn cohort_peers(&self, cq: &str) -> Vec<&CachedClusterQueue> {
        let Some(cohort) = self
            .cluster_queue(cq)
            .and_then(|c| c.cohort.as_deref())
            .and_then(|name| self.cohort(name))
        else {
            return Vec::new();
        };
        cohort
            .members
            .iter()
            .filter(|m| m.as_str() != cq)
            .filter_map(|m| self.cluster_queue(m))
            .collect()
    }

    pub fn used(&self, cq: &str, fr: &FlavorResource) -> i64 {
        self.cluster_queue(cq).map(|c| c.used(fr)).unwrap_or(0)
    }

    /// Capacity the cohort pool offers for `fr`: lendable quota of every
    /// member plus the cohort's own quota
    pub fn cohort_requestable(&self, cohort: &str, fr: &FlavorResource) -> i64 {
        let Some(cohort) = self.cohort(cohort) else {
            return 0;
        };
        let lendable: i64 = cohort
            .members
            .iter()
            .filter_map(|m| self.cluster_queue(m))
            .filter_map(|cq| cq.quota(fr))
            .map(|q| q.lendable())
            .sum();
        lendable + cohort.own_quota.get(fr).copied().unwrap_or(0)
    }

    /// Usage members draw from the pool, beyond their guaranteed quota
    pub fn cohort_usage(&self, cohort: &str, fr: &FlavorResource) -> i64 {
        let Some(cohort) = self.cohort(cohort) else {
            return 0;
        };
        cohort
            .members
            .iter()
            .filter_map(|m| self.cluster_queue(m))
            .map(|cq| {
                let guaranteed = cq.quota(fr).map(|q| q.guaranteed()).unwrap_or(0);
                (cq.used(fr) - guaranteed).max(0)
            })
            .sum()
    }

    /// How much more of `fr` the queue can take right now
    pub fn available(&self, cq: &str, fr: &FlavorResource) -> i64 {
        let Some(queue) = self.cluster_queue(cq) else {
            return 0;
        };
        self.available_with_usage(queue, fr, queue.used(fr), true)
    }

    /// How much of `fr` the queue could take if every workload were evicted
    pub fn potential(&self, cq: &str, fr: &FlavorResource) -> i64 {
        let Some(queue) = self.cluster_queue(cq) else {
            return 0;
        };
        self.available_with_usage(queue, fr, 0, false)
    }

    fn available_with_usage(
        &self,
        queue: &CachedClusterQueue,
        fr: &FlavorResource,
        used: i64,
        count_cohort_usage: bool,
    ) -> i64 {
        let Some(quota) = queue.quota(fr) else {
            return 0;
        };
        let Some(cohort) = queue.cohort.as_deref() else {
            return (quota.nominal - used).max(0);
        };

        let local = (quota.guaranteed() - used).max(0);
        let pool_used = if count_cohort_usage {
            self.cohort_usage(cohort, fr)
        } else {
            0
        };
        let pool = (self.cohort_requestable(cohort, fr) - pool_used).max(0);
        let mut available = local + pool;
        if let Some(borrowing) = quota.borrowing_limit {
            available = available.min(quota.nominal + borrowing - used);
        }
        available.max(0)
    }

    /// Usage of `fr` above the queue's nominal quota
    pub fn borrowed(&self, cq: &str, fr: &FlavorResource) -> i64 {
        let Some(queue) = self.cluster_queue(cq) else {
            return 0;
        };
        let nominal = queue.quota(fr).map(|q| q.nominal).unwrap_or(0);
        (queue.used(fr) - nominal).max(0)
    }

    pub fn is_borrowing(&self, cq: &str) -> bool {
        self.cluster_queue(cq)
            .is_some_and(|queue| queue.usage.keys().any(|fr| self.borrowed(cq, fr) > 0))
    }

    /// Account a workload in the working copy
    pub fn add_workload(&mut self, workload: CachedWorkload) -> Result<()> {
        Arc::make_mut(&mut self.state).insert_workload(workload)
    }

    /// Drop a workload from the working copy
    pub fn remove_workload(&mut self, key: &WorkloadKey) -> Option<CachedWorkload> {
        Arc::make_mut(&mut self.state).take_workload(key)
    }

    /// Check the usage accounting and indexes.
    ///
    /// Usage above quota after a quota shrink is reported by
    /// [`Snapshot::overcommitted`], not here.
    pub fn verify(&self) -> Result<()> {
        let state = &self.state;
        for (name, cq) in &state.cluster_queues {
            if cq.recomputed_usage() != cq.usage {
                return Err(CacheError::invariant_violation(format!(
                    "usage of ClusterQueue {} does not match its workloads",
                    name
                )));
            }
            for (key, workload) in &cq.workloads {
                if workload.cluster_queue != *name {
                    return Err(CacheError::invariant_violation(format!(
                        "workload {} is accounted in {} but admitted to {}",
                        key, name, workload.cluster_queue
                    )));
                }
                if state.workload_index.get(key) != Some(name) {
                    return Err(CacheError::invariant_violation(format!(
                        "workload {} is missing from the index",
                        key
                    )));
                }
            }
            if let Some(cohort) = &cq.cohort {
                let member = state
                    .cohorts
                    .get(cohort)
                    .is_some_and(|c| c.members.contains(name));
                if !member {
                    return Err(CacheError::invariant_violation(format!(
                        "ClusterQueue {} is not a member of cohort {}",
                        name, cohort
                    )));
                }
            }
        }
        for (key, cq_name) in &state.workload_index {
            let present = state
                .cluster_queues
                .get(cq_name)
                .is_some_and(|cq| cq.workloads.contains_key(key));
            if !present {
                return Err(CacheError::invariant_violation(format!(
                    "index points workload {} at {} which does not hold it",
                    key, cq_name
                )));
            }
        }
        Ok(())
    }

    /// Queues and flavor-resources whose usage exceeds what their quota
    /// allows, which happens only after quota shrinks
    pub fn overcommitted(&self) -> Vec<(String, FlavorResource)> {
        let mut result = Vec::new();
        for cq in self.cluster_queues() {
            for (fr, used) in &cq.usage {
                let limit = match (cq.quota(fr), cq.cohort.as_deref()) {
                    (None, _) => 0,
                    (Some(q), None) => q.nominal,
                    (Some(q), Some(cohort)) => {
                        let pool = q.guaranteed() + self.cohort_requestable(cohort, fr);
                        q.borrowing_limit
                            .map(|b| pool.min(q.nominal + b))
                            .unwrap_or(pool)
                    }
                };
                if *used > limit {
                    result.push((cq.name.clone(), fr.clone()));
                }
            }
        }
        for cohort in self.cohorts() {
            let frs: BTreeSet<&FlavorResource> = cohort
                .members
                .iter()
                .filter_map(|m| self.cluster_queue(m))
                .flat_map(|cq| cq.usage.keys())
                .collect();
            for fr in frs {
                if self.cohort_usage(&cohort.name, fr) > self.cohort_requestable(&cohort.name, fr) {
                    result.push((cohort.name.clone(), fr.clone()));
                }
            }
        }
        result.sort();
        result.dedup();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{QuotaLimits, Usage};
    use chrono::Utc;
    use rampart_core::{ClusterQueue, FlavorQuotas, Quantity, ResourceGroup, ResourceQuota};

    fn cpu() -> FlavorResource {
        FlavorResource::new("default", "cpu")
    }

    fn queue(
        name: &str,
        cohort: Option<&str>,
        nominal: &str,
        lending: Option<&str>,
        borrowing: Option<&str>,
    ) -> CachedClusterQueue {
        let mut cq = ClusterQueue::new(name);
        cq.spec.cohort = cohort.map(str::to_string);
        let mut quota = ResourceQuota::new("cpu", nominal);
        quota.lending_limit = lending.map(|l| Quantity(l.to_string()));
        quota.borrowing_limit = borrowing.map(|b| Quantity(b.to_string()));
        cq.spec.resource_groups = vec![ResourceGroup {
            covered_resources: vec!["cpu".to_string()],
            flavors: vec![FlavorQuotas {
                name: "default".to_string(),
                resources: vec![quota],
            }],
        }];
        CachedClusterQueue::from_spec(&cq)
    }

    fn state(queues: Vec<CachedClusterQueue>) -> CacheState {
        let mut state = CacheState::default();
        state.flavors.insert("default".to_string());
        for cq in queues {
            if let Some(cohort) = &cq.cohort {
                let entry = state
                    .cohorts
                    .entry(cohort.clone())
                    .or_insert_with(|| Arc::new(CachedCohort::new(cohort)));
                Arc::make_mut(entry).members.insert(cq.name.clone());
            }
            state.cluster_queues.insert(cq.name.clone(), Arc::new(cq));
        }
        state
    }

    fn workload(name: &str, cq: &str, millis: i64) -> CachedWorkload {
        CachedWorkload {
            key: WorkloadKey::new("ns", name),
            cluster_queue: cq.to_string(),
            priority: 0,
            usage: Usage::from([(cpu(), millis)]),
            reserved_at: Utc::now(),
            created_at: None,
            assumed: false,
            evicting: false,
        }
    }

    #[test]
    fn test_available_without_cohort() {
        let mut snapshot = Snapshot::new(Arc::new(state(vec![queue("a", None, "4", None, None)])));
        assert_eq!(snapshot.available("a", &cpu()), 4000);

        snapshot.add_workload(workload("w1", "a", 3000)).unwrap();
        assert_eq!(snapshot.available("a", &cpu()), 1000);
        assert_eq!(snapshot.potential("a", &cpu()), 4000);
        assert_eq!(snapshot.available("a", &FlavorResource::new("default", "gpu")), 0);
    }

    #[test]
    fn test_borrowing_within_cohort() {
        let mut snapshot = Snapshot::new(Arc::new(state(vec![
            queue("a", Some("pool"), "4", None, None),
            queue("b", Some("pool"), "4", None, None),
        ])));
        assert_eq!(snapshot.available("a", &cpu()), 8000);

        snapshot.add_workload(workload("w1", "a", 6000)).unwrap();
        assert_eq!(snapshot.borrowed("a", &cpu()), 2000);
        assert!(snapshot.is_borrowing("a"));
        assert_eq!(snapshot.available("b", &cpu()), 2000);
        assert_eq!(snapshot.potential("b", &cpu()), 8000);
        assert_eq!(snapshot.cohort_usage("pool", &cpu()), 6000);
    }

    #[test]
    fn test_lending_limit_guarantees_quota() {
        let mut snapshot = Snapshot::new(Arc::new(state(vec![
            queue("a", Some("pool"), "4", Some("1"), None),
            queue("b", Some("pool"), "4", None, None),
        ])));
        assert_eq!(snapshot.cohort_requestable("pool", &cpu()), 5000);
        assert_eq!(snapshot.available("b", &cpu()), 5000);
        assert_eq!(snapshot.available("a", &cpu()), 8000);

        // b takes everything the pool offers; a keeps its guaranteed 3
        snapshot.add_workload(workload("w1", "b", 5000)).unwrap();
        assert_eq!(snapshot.available("a", &cpu()), 3000);
        assert_eq!(snapshot.available("b", &cpu()), 0);
    }

    #[test]
    fn test_borrowing_limit_caps_available() {
        let snapshot = Snapshot::new(Arc::new(state(vec![
            queue("a", Some("pool"), "4", None, Some("1")),
            queue("b", Some("pool"), "4", None, None),
        ])));
        assert_eq!(snapshot.available("a", &cpu()), 5000);
        assert_eq!(snapshot.potential("a", &cpu()), 5000);
    }

    #[test]
    fn test_cohort_own_quota() {
        let mut state = state(vec![queue("a", Some("pool"), "4", None, None)]);
        if let Some(cohort) = state.cohorts.get_mut("pool") {
            Arc::make_mut(cohort).own_quota.insert(cpu(), 2000);
        }
        let snapshot = Snapshot::new(Arc::new(state));
        assert_eq!(snapshot.available("a", &cpu()), 6000);
    }

    #[test]
    fn test_working_copy_is_isolated() {
        let original = Snapshot::new(Arc::new(state(vec![queue("a", None, "4", None, None)])));
        let mut working = original.clone();
        working.add_workload(workload("w1", "a", 2000)).unwrap();

        assert_eq!(working.used("a", &cpu()), 2000);
        assert_eq!(original.used("a", &cpu()), 0);
        assert!(original.workload(&WorkloadKey::new("ns", "w1")).is_none());

        let removed = working.remove_workload(&WorkloadKey::new("ns", "w1")).unwrap();
        assert_eq!(removed.usage[&cpu()], 2000);
        assert_eq!(working.used("a", &cpu()), 0);
    }

    #[test]
    fn test_verify_detects_drift() {
        let mut state = state(vec![queue("a", None, "4", None, None)]);
        state.insert_workload(workload("w1", "a", 1000)).unwrap();
        assert!(Snapshot::new(Arc::new(state.clone())).verify().is_ok());

        if let Some(cq) = state.cluster_queue_mut("a") {
            cq.usage.insert(cpu(), 5000);
        }
        let err = Snapshot::new(Arc::new(state)).verify().unwrap_err();
        assert!(matches!(err, CacheError::InvariantViolation { .. }));
    }

    #[test]
    fn test_overcommit_is_not_a_violation() {
        let mut state = state(vec![queue("a", None, "4", None, None)]);
        state.insert_workload(workload("w1", "a", 4000)).unwrap();
        if let Some(cq) = state.cluster_queue_mut("a") {
            cq.quotas.insert(
                cpu(),
                QuotaLimits {
                    nominal: 2000,
                    ..Default::default()
                },
            );
        }
        let snapshot = Snapshot::new(Arc::new(state));
        assert!(snapshot.verify().is_ok());
        assert_eq!(snapshot.overcommitted(), vec![("a".to_string(), cpu())]);
        assert_eq!(snapshot.available("a", &cpu()), 0);
    }
}
