use crate::registry::CheckControllerRegistry;
use crate::watch::EventHandler;
use crate::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use rampart_cache::{Cache, QueueStatus, StatusChanges};
use rampart_core::{
    AdmissionCheck, ClusterQueue, ClusterQueueSpec, ClusterQueueStatus, Cohort, LocalQueue,
    Resource, ResourceEvent, ResourceFlavor, Workload,
};
use rampart_queue::QueueManager;
use rampart_storage::ObjectStore;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Feeds store events into the cache and the queue manager, and writes
/// ClusterQueue status back to the store.
pub struct Informer {
    store: Arc<ObjectStore>,
    cache: Arc<Cache>,
    queues: Arc<QueueManager>,
    registry: Arc<CheckControllerRegistry>,
    /// ClusterQueues deleted from the store while still holding workloads
    pending_deletions: Mutex<BTreeSet<String>>,
    /// Last spec seen per ClusterQueue, to tell spec edits from status writes
    known_specs: Mutex<HashMap<String, ClusterQueueSpec>>,
    /// Scheduler cycle lock, held while the cache and queues are rebuilt
    cycle_gate: Option<Arc<tokio::sync::Mutex<()>>>,
}

impl Informer {
    pub fn new(
        store: Arc<ObjectStore>,
        cache: Arc<Cache>,
        queues: Arc<QueueManager>,
        registry: Arc<CheckControllerRegistry>,
    ) -> Self {
        Self {
            store,
            cache,
            queues,
            registry,
            pending_deletions: Mutex::new(BTreeSet::new()),
            known_specs: Mutex::new(HashMap::new()),
            cycle_gate: None,
        }
    }

    /// Keep resyncs out of scheduling cycles
    pub fn with_cycle_gate(mut self, gate: Arc<tokio::sync::Mutex<()>>) -> Self {
        self.cycle_gate = Some(gate);
        self
    }

    /// Names of ClusterQueues waiting for their workloads to drain
    pub fn pending_deletions(&self) -> Vec<String> {
        self.pending_deletions.lock().iter().cloned().collect()
    }

    fn on_flavor(&self, event: &ResourceEvent) -> Result<()> {
        let changes = if event.is_delete() {
            self.cache.delete_flavor(&event.resource_key.name)
        } else {
            let flavor: ResourceFlavor = event.decode()?;
            self.cache.upsert_flavor(&flavor)
        };
        self.apply_status_changes(changes);
        Ok(())
    }

    fn on_admission_check(&self, event: &ResourceEvent) -> Result<()> {
        let changes = if event.is_delete() {
            self.cache.delete_admission_check(&event.resource_key.name)
        } else {
            let mut check: AdmissionCheck = event.decode()?;
            check.status.active |= self.registry.is_registered(&check.spec.controller_name);
            self.cache.upsert_admission_check(&check)
        };
        self.apply_status_changes(changes);
        Ok(())
    }

    fn on_cohort(&self, event: &ResourceEvent) -> Result<()> {
        let name = event.resource_key.name.clone();
        if event.is_delete() {
            self.cache.delete_cohort(&name);
        } else {
            let cohort: Cohort = event.decode()?;
            self.cache.upsert_cohort(&cohort)?;
        }
        // Borrowable capacity moved for every member
        let members: Vec<String> = self
            .cache
            .snapshot()
            .cohort(&name)
            .map(|cohort| cohort.members.iter().cloned().collect())
            .unwrap_or_default();
        self.queues.queue_inadmissible_workloads(&members);
        Ok(())
    }

    fn on_cluster_queue(&self, event: &ResourceEvent) -> Result<()> {
        let name = event.resource_key.name.clone();
        if event.is_delete() {
            self.known_specs.lock().remove(&name);
            self.delete_cluster_queue(&name);
            return Ok(());
        }

        let cq: ClusterQueue = event.decode()?;
        self.pending_deletions.lock().remove(&name);
        let status = self.cache.upsert_cluster_queue(&cq);
        self.queues.add_or_update_cluster_queue(&cq, status.is_active());
        self.write_status(&name, &status);

        let spec_changed = self
            .known_specs
            .lock()
            .insert(name.clone(), cq.spec.clone())
            .is_none_or(|previous| previous != cq.spec);
        if spec_changed {
            self.queues
                .queue_inadmissible_workloads(&self.cache.cohort_members_of(&name));
        }
        Ok(())
    }

    fn delete_cluster_queue(&self, name: &str) {
        match self.cache.delete_cluster_queue(name) {
            Ok(()) => {
                self.pending_deletions.lock().remove(name);
                self.queues.delete_cluster_queue(name);
            }
            Err(e) => {
                info!(cluster_queue = %name, "Deferring ClusterQueue deletion: {}", e);
                self.pending_deletions.lock().insert(name.to_string());
                if let Err(e) = self.queues.set_cluster_queue_active(name, false) {
                    debug!(cluster_queue = %name, "No pending queue to deactivate: {}", e);
                }
            }
        }
    }

    fn retry_pending_deletions(&self) {
        let pending = self.pending_deletions();
        for name in pending {
            self.delete_cluster_queue(&name);
        }
    }

    fn on_local_queue(&self, event: &ResourceEvent) -> Result<()> {
        if event.is_delete() {
            self.queues
                .delete_local_queue(&event.resource_key.namespace, &event.resource_key.name);
        } else {
            let lq: LocalQueue = event.decode()?;
            self.queues.add_or_update_local_queue(&lq);
        }
        Ok(())
    }

    fn on_workload(&self, event: &ResourceEvent) -> Result<()> {
        if event.is_delete() {
            let workload: Workload = event.decode()?;
            let key = workload.key();
            let previous = self.cache.workload_cluster_queue(&key);
            self.cache.forget_workload(&key);
            self.queues.delete_workload(&key);
            self.released(previous.as_deref(), None);
            return Ok(());
        }

        let workload: Workload = event.decode()?;
        let key = workload.key();
        let previous = self.cache.workload_cluster_queue(&key);
        if let Err(e) = self.cache.add_or_update_workload(&workload) {
            warn!(workload = %key, "Cache rejected workload, requesting resync: {}", e);
            self.cache.request_resync();
        }
        self.queues.add_or_update_workload(&workload);
        let current = self.cache.workload_cluster_queue(&key);
        self.released(previous.as_deref(), current.as_deref());
        Ok(())
    }

    /// Quota moved off `previous`: its cohort gets another look and
    /// terminating ClusterQueues may now drain
    fn released(&self, previous: Option<&str>, current: Option<&str>) {
        let Some(previous) = previous else {
            return;
        };
        if current == Some(previous) {
            return;
        }
        self.queues
            .queue_inadmissible_workloads(&self.cache.cohort_members_of(previous));
        self.retry_pending_deletions();
    }

    fn apply_status_changes(&self, changes: StatusChanges) {
        for (name, status) in changes {
            if let Err(e) = self.queues.set_cluster_queue_active(&name, status.is_active()) {
                debug!(cluster_queue = %name, "No pending queue for status change: {}", e);
            }
            self.write_status(&name, &status);
            if status.is_active() {
                self.queues
                    .queue_inadmissible_workloads(&self.cache.cohort_members_of(&name));
            }
        }
    }

    /// Mirror the cache's view of a ClusterQueue into its stored status
    fn write_status(&self, name: &str, status: &QueueStatus) {
        let desired = ClusterQueueStatus {
            active: status.is_active(),
            reason: Some(status.reason().to_string()),
            message: Some(status.message().to_string()),
        };
        let mut cq = match self.store.try_get::<ClusterQueue>("", name) {
            Ok(Some(cq)) => cq,
            Ok(None) => return,
            Err(e) => {
                warn!(cluster_queue = %name, "Failed to read ClusterQueue: {}", e);
                return;
            }
        };
        if cq.status == desired {
            return;
        }
        cq.status = desired;
        match self.store.update(cq) {
            Ok(_) => debug!(
                cluster_queue = %name,
                status = %status.reason(),
                "ClusterQueue status written"
            ),
            Err(e) if e.is_conflict() => debug!(
                cluster_queue = %name,
                "ClusterQueue moved on, status rewritten on its event"
            ),
            Err(e) => warn!(cluster_queue = %name, "Failed to write ClusterQueue status: {}", e),
        }
    }

    /// Rebuild the cache and queues from a full listing, definitions first
    fn sync_all(&self) -> Result<()> {
        for flavor in self.store.list::<ResourceFlavor>(None)? {
            self.cache.upsert_flavor(&flavor);
        }
        for mut check in self.store.list::<AdmissionCheck>(None)? {
            check.status.active |= self.registry.is_registered(&check.spec.controller_name);
            self.cache.upsert_admission_check(&check);
        }
        for cohort in self.store.list::<Cohort>(None)? {
            if let Err(e) = self.cache.upsert_cohort(&cohort) {
                warn!(cohort = %cohort.name(), "Skipping cohort: {}", e);
            }
        }

        let cluster_queues = self.store.list::<ClusterQueue>(None)?;
        {
            let mut known = self.known_specs.lock();
            known.clear();
            for cq in &cluster_queues {
                known.insert(cq.name().to_string(), cq.spec.clone());
            }
        }
        for cq in &cluster_queues {
            self.cache.upsert_cluster_queue(cq);
        }
        for cq in &cluster_queues {
            // Statuses settle once every queue and cohort is known
            let status = self
                .cache
                .cluster_queue_status(cq.name())
                .unwrap_or(QueueStatus::Terminating);
            self.queues.add_or_update_cluster_queue(cq, status.is_active());
            self.write_status(cq.name(), &status);
        }

        for lq in self.store.list::<LocalQueue>(None)? {
            self.queues.add_or_update_local_queue(&lq);
        }

        let workloads = self.store.list::<Workload>(None)?;
        for workload in &workloads {
            if let Err(e) = self.cache.add_or_update_workload(workload) {
                warn!(workload = %workload.key(), "Cache rejected workload: {}", e);
            }
            self.queues.add_or_update_workload(workload);
        }

        self.retry_pending_deletions();
        info!(
            cluster_queues = cluster_queues.len(),
            workloads = workloads.len(),
            "Informer synced"
        );
        Ok(())
    }
}

#[async_trait]
impl EventHandler for Informer {
    fn name(&self) -> &str {
        "informer"
    }

    async fn handle_event(&self, event: &ResourceEvent) -> Result<()> {
        let kind = event.gvk.kind.as_str();
        if kind == Workload::KIND {
            self.on_workload(event)
        } else if kind == ClusterQueue::KIND {
            self.on_cluster_queue(event)
        } else if kind == LocalQueue::KIND {
            self.on_local_queue(event)
        } else if kind == Cohort::KIND {
            self.on_cohort(event)
        } else if kind == ResourceFlavor::KIND {
            self.on_flavor(event)
        } else if kind == AdmissionCheck::KIND {
            self.on_admission_check(event)
        } else {
            debug!(kind, "Ignoring event");
            Ok(())
        }
    }

    async fn resync(&self) -> Result<()> {
        let _cycle = match &self.cycle_gate {
            Some(gate) => Some(gate.lock().await),
            None => None,
        };
        self.cache.reset();
        self.queues.reset();
        self.sync_all()
    }

    async fn tick(&self) -> Result<()> {
        if self.cache.take_resync_request() {
            info!("Cache asked for a resync");
            self.resync().await?;
        }
        Ok(())
    }
}
