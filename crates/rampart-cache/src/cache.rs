use crate::cluster_queue::CachedClusterQueue;
use crate::report::UsageReport;
use crate::snapshot::{CacheState, Snapshot};
use crate::types::{CachedAdmissionCheck, CachedCohort, CachedWorkload, QueueStatus};
use crate::{CacheError, Result};
use chrono::Utc;
use parking_lot::RwLock;
use rampart_core::{
    parse_quantity, Admission, AdmissionCheck, ClusterQueue, Cohort, FlavorResource, Resource,
    ResourceFlavor, Workload, WorkloadKey,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// ClusterQueues whose status changed as a side effect of an update
pub type StatusChanges = Vec<(String, QueueStatus)>;

/// Watch-fed projection of queue definitions and quota usage.
///
/// Writers serialize on one lock and copy the state only when a snapshot
/// still shares it, so [`Cache::snapshot`] is a reference-count bump.
pub struct Cache {
    state: RwLock<Arc<CacheState>>,
    resync_requested: AtomicBool,
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}

impl Cache {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(Arc::new(CacheState::default())),
            resync_requested: AtomicBool::new(false),
        }
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut CacheState) -> R) -> R {
        let mut guard = self.state.write();
        f(Arc::make_mut(&mut guard))
    }

    /// Point-in-time view of everything in the cache
    pub fn snapshot(&self) -> Snapshot {
        Snapshot::new(Arc::clone(&self.state.read()))
    }

    /// Add or replace a ClusterQueue definition and return its status
    pub fn upsert_cluster_queue(&self, cq: &ClusterQueue) -> QueueStatus {
        let updated = CachedClusterQueue::from_spec(cq);
        let name = updated.name.clone();

        self.mutate(|state| {
            let previous_cohort = state
                .cluster_queues
                .get(&name)
                .and_then(|existing| existing.cohort.clone());
            let new_cohort = updated.cohort.clone();

            match state.cluster_queue_mut(&name) {
                Some(existing) => existing.apply_definition(updated),
                None => {
                    state.cluster_queues.insert(name.clone(), Arc::new(updated));
                }
            }

            if previous_cohort != new_cohort {
                if let Some(old) = previous_cohort {
                    leave_cohort(state, &old, &name);
                }
                if let Some(new) = new_cohort {
                    join_cohort(state, &new, &name);
                }
            }

            adopt_orphans(state, &name);
            refresh_statuses(state);

            let status = state
                .cluster_queues
                .get(&name)
                .map(|cq| cq.status.clone())
                .unwrap_or(QueueStatus::Terminating);
            info!(cluster_queue = %name, status = %status.reason(), "ClusterQueue updated");
            status
        })
    }

    /// Remove a ClusterQueue. One that still holds workloads is marked
    /// terminating and refused.
    pub fn delete_cluster_queue(&self, name: &str) -> Result<()> {
        self.mutate(|state| {
            let Some(cq) = state.cluster_queue_mut(name) else {
                return Ok(());
            };
            let reserved = cq.reserved_count();
            if reserved > 0 {
                if !cq.is_terminating() {
                    info!(cluster_queue = %name, reserved, "ClusterQueue terminating");
                }
                cq.set_terminating();
                return Err(CacheError::cluster_queue_not_drained(name, reserved));
            }

            if let Some(removed) = state.cluster_queues.remove(name) {
                if let Some(cohort) = &removed.cohort {
                    leave_cohort(state, cohort, name);
                }
            }
            info!(cluster_queue = %name, "ClusterQueue deleted");
            Ok(())
        })
    }

    pub fn upsert_cohort(&self, cohort: &Cohort) -> Result<()> {
        let mut own_quota: BTreeMap<FlavorResource, i64> = BTreeMap::new();
        for group in &cohort.spec.resource_groups {
            for flavor in &group.flavors {
                for quota in &flavor.resources {
                    let nominal = parse_quantity(&quota.name, &quota.nominal_quota)?;
                    *own_quota
                        .entry(FlavorResource::new(&flavor.name, &quota.name))
                        .or_default() += nominal;
                }
            }
        }

        let name = cohort.name().to_string();
        self.mutate(|state| {
            let entry = state
                .cohorts
                .entry(name.clone())
                .or_insert_with(|| Arc::new(CachedCohort::new(&name)));
            let cached = Arc::make_mut(entry);
            cached.explicit = true;
            cached.own_quota = own_quota;
        });
        debug!(cohort = %name, "Cohort updated");
        Ok(())
    }

    pub fn delete_cohort(&self, name: &str) {
        self.mutate(|state| {
            if let Some(entry) = state.cohorts.get_mut(name) {
                let cached = Arc::make_mut(entry);
                cached.explicit = false;
                cached.own_quota.clear();
                if cached.is_unused() {
                    state.cohorts.remove(name);
                }
            }
        });
        debug!(cohort = %name, "Cohort deleted");
    }

    pub fn upsert_flavor(&self, flavor: &ResourceFlavor) -> StatusChanges {
        let name = flavor.name().to_string();
        self.mutate(|state| {
            state.flavors.insert(name.clone());
            debug!(flavor = %name, "ResourceFlavor added");
            refresh_statuses(state)
        })
    }

    pub fn delete_flavor(&self, name: &str) -> StatusChanges {
        self.mutate(|state| {
            state.flavors.remove(name);
            debug!(flavor = %name, "ResourceFlavor removed");
            refresh_statuses(state)
        })
    }

    pub fn upsert_admission_check(&self, check: &AdmissionCheck) -> StatusChanges {
        let cached = CachedAdmissionCheck::from(check);
        self.mutate(|state| {
            debug!(check = %cached.name, active = cached.active, "AdmissionCheck updated");
            state.admission_checks.insert(cached.name.clone(), cached);
            refresh_statuses(state)
        })
    }

    pub fn delete_admission_check(&self, name: &str) -> StatusChanges {
        self.mutate(|state| {
            state.admission_checks.remove(name);
            debug!(check = %name, "AdmissionCheck removed");
            refresh_statuses(state)
        })
    }

    /// Reconcile the cache with an observed workload.
    ///
    /// A reserved, unfinished workload is accounted (confirming an
    /// assumption, or moving it when its ClusterQueue changed). Anything else
    /// is released, except a pending assumption, which only
    /// [`Cache::forget_workload`] rolls back.
    pub fn add_or_update_workload(&self, workload: &Workload) -> Result<()> {
        let key = workload.key();
        let reserved = workload
            .status
            .admission
            .as_ref()
            .filter(|_| workload.has_quota_reservation() && !workload.is_finished());

        let Some(admission) = reserved else {
            let finished = workload.is_finished();
            self.mutate(|state| {
                let assumed = state.cached_workload(&key).is_some_and(|w| w.assumed);
                if assumed && !finished {
                    return;
                }
                if state.take_workload(&key).is_some() {
                    debug!(workload = %key, "Released quota");
                }
            });
            return Ok(());
        };

        let mut cached = CachedWorkload::new(workload, admission, Utc::now())?;
        self.mutate(|state| {
            let previous = state.take_workload(&key);
            if let Some(previous) = &previous {
                if previous.cluster_queue == cached.cluster_queue {
                    cached.evicting = previous.evicting;
                    if previous.assumed {
                        debug!(workload = %key, "Assumption confirmed");
                    }
                } else {
                    info!(
                        workload = %key,
                        from = %previous.cluster_queue,
                        to = %cached.cluster_queue,
                        "Workload moved between ClusterQueues"
                    );
                }
            }

            if state.cluster_queues.contains_key(&cached.cluster_queue) {
                state.insert_workload(cached)
            } else {
                debug!(
                    workload = %key,
                    cluster_queue = %cached.cluster_queue,
                    "Reserved workload waits for its ClusterQueue"
                );
                state.orphans.insert(key.clone(), cached);
                Ok(())
            }
        })
    }

    /// Tentatively reserve quota for `workload` under `admission`
    pub fn assume_workload(&self, workload: &Workload, admission: &Admission) -> Result<()> {
        let key = workload.key();
        let mut cached = CachedWorkload::new(workload, admission, Utc::now())?;
        cached.reserved_at = Utc::now();
        cached.assumed = true;

        self.mutate(|state| {
            if let Some(cq) = state.workload_index.get(&key) {
                return Err(CacheError::already_reserved(key.to_string(), cq));
            }
            let cq = state
                .cluster_queues
                .get(&admission.cluster_queue)
                .ok_or_else(|| CacheError::cluster_queue_not_found(&admission.cluster_queue))?;
            if !cq.status.is_active() {
                return Err(CacheError::cluster_queue_inactive(
                    &cq.name,
                    cq.status.reason(),
                ));
            }
            state.insert_workload(cached)?;
            debug!(workload = %key, cluster_queue = %admission.cluster_queue, "Workload assumed");
            Ok(())
        })
    }

    /// Release whatever `key` holds. Returns whether anything was released.
    pub fn forget_workload(&self, key: &WorkloadKey) -> bool {
        let released = self.mutate(|state| state.take_workload(key).is_some());
        if released {
            debug!(workload = %key, "Workload forgotten");
        }
        released
    }

    /// Record that an eviction was issued so preemption skips the workload
    pub fn mark_evicting(&self, key: &WorkloadKey) -> bool {
        self.mutate(|state| {
            let Some(cq_name) = state.workload_index.get(key).cloned() else {
                return false;
            };
            let Some(cq) = state.cluster_queue_mut(&cq_name) else {
                return false;
            };
            match cq.workloads.get_mut(key) {
                Some(workload) => {
                    workload.evicting = true;
                    true
                }
                None => false,
            }
        })
    }

    pub fn request_resync(&self) {
        if !self.resync_requested.swap(true, Ordering::SeqCst) {
            warn!("Cache resync requested");
        }
    }

    /// Consume a pending resync request
    pub fn take_resync_request(&self) -> bool {
        self.resync_requested.swap(false, Ordering::SeqCst)
    }

    /// Drop all state ahead of a full re-listing
    pub fn reset(&self) {
        *self.state.write() = Arc::new(CacheState::default());
        info!("Cache reset");
    }

    pub fn cluster_queue_status(&self, name: &str) -> Option<QueueStatus> {
        self.state
            .read()
            .cluster_queues
            .get(name)
            .map(|cq| cq.status.clone())
    }

    /// AdmissionChecks a ClusterQueue requires
    pub fn cluster_queue_checks(&self, name: &str) -> Option<Vec<String>> {
        self.state
            .read()
            .cluster_queues
            .get(name)
            .map(|cq| cq.admission_checks.clone())
    }

    pub fn admission_check(&self, name: &str) -> Option<CachedAdmissionCheck> {
        self.state.read().admission_checks.get(name).cloned()
    }

    /// ClusterQueue `key` currently holds quota in
    pub fn workload_cluster_queue(&self, key: &WorkloadKey) -> Option<String> {
        self.state.read().workload_index.get(key).cloned()
    }

    /// `name` plus every other member of its cohort
    pub fn cohort_members_of(&self, name: &str) -> Vec<String> {
        let state = self.state.read();
        let cohort = state
            .cluster_queues
            .get(name)
            .and_then(|cq| cq.cohort.as_ref())
            .and_then(|c| state.cohorts.get(c));
        match cohort {
            Some(cohort) => cohort.members.iter().cloned().collect(),
            None => vec![name.to_string()],
        }
    }

    pub fn usage_report(&self) -> UsageReport {
        UsageReport::from_snapshot(&self.snapshot())
    }
}

fn join_cohort(state: &mut CacheState, cohort: &str, cq: &str) {
    let entry = state
        .cohorts
        .entry(cohort.to_string())
        .or_insert_with(|| Arc::new(CachedCohort::new(cohort)));
    Arc::make_mut(entry).members.insert(cq.to_string());
}

fn leave_cohort(state: &mut CacheState, cohort: &str, cq: &str) {
    if let Some(entry) = state.cohorts.get_mut(cohort) {
        let cached = Arc::make_mut(entry);
        cached.members.remove(cq);
        if cached.is_unused() {
            state.cohorts.remove(cohort);
        }
    }
}

fn adopt_orphans(state: &mut CacheState, cq: &str) {
    let keys: Vec<WorkloadKey> = state
        .orphans
        .iter()
        .filter(|(_, w)| w.cluster_queue == cq)
        .map(|(k, _)| k.clone())
        .collect();
    for key in keys {
        if let Some(orphan) = state.orphans.remove(&key) {
            if let Err(e) = state.insert_workload(orphan) {
                warn!(workload = %key, error = %e, "Failed to account reserved workload");
            }
        }
    }
}

fn refresh_statuses(state: &mut CacheState) -> StatusChanges {
    let mut changes = Vec::new();
    let names: Vec<String> = state.cluster_queues.keys().cloned().collect();
    for name in names {
        let Some(current) = state.cluster_queues.get(&name) else {
            continue;
        };
        let status = current.derive_status(&state.flavors, &state.admission_checks);
        if status == current.status {
            continue;
        }
        if let Some(cq) = state.cluster_queue_mut(&name) {
            cq.status = status.clone();
        }
        info!(cluster_queue = %name, status = %status.reason(), "ClusterQueue status changed");
        changes.push((name, status));
    }
    changes
}
