use crate::flavor::assign_flavors;
use crate::ordering::{ordering_by_name, EntryOrdering, FairnessTracker};
use crate::preemption::{find_victims, PreemptionOutcome};
use crate::types::{AssignmentMode, CycleReport, Entry, FlavorAssignment};
use crate::{Result, SchedulerError};
use chrono::Utc;
use rampart_cache::{Cache, CachedWorkload, Snapshot};
use rampart_core::config::SchedulerSettings;
use rampart_core::{Admission, WorkloadKey};
use rampart_queue::{QueueManager, RequeueReason, WorkloadInfo};
use rampart_storage::{StorageError, WorkloadWriter};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Eviction reason written on preempted workloads
pub const REASON_PREEMPTED: &str = "Preempted";

/// Configuration for the scheduler
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Quiet period after a queue change before a cycle starts
    pub debounce: Duration,
    /// Fallback interval between cycles
    pub interval: Duration,
    /// Cycles a queue may be passed over before it goes first
    pub starvation_threshold: u32,
    /// Name of the cross-queue ordering policy
    pub ordering: String,
    /// Attempts per commit write
    pub commit_retries: u32,
    /// First retry delay; doubles per attempt
    pub commit_retry_base: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from_settings(&SchedulerSettings::default())
    }
}

impl SchedulerConfig {
    pub fn from_settings(settings: &SchedulerSettings) -> Self {
        Self {
            debounce: Duration::from_millis(settings.debounce_millis),
            interval: Duration::from_millis(settings.interval_millis),
            starvation_threshold: settings.starvation_threshold,
            ordering: settings.ordering.clone(),
            commit_retries: settings.commit_retries.max(1),
            commit_retry_base: Duration::from_millis(settings.commit_retry_base_millis),
        }
    }
}

/// A head decided to be admitted, waiting for its commit
struct PendingAdmission {
    info: WorkloadInfo,
    admission: Admission,
}

/// A victim chosen for a preemptor
struct PendingEviction {
    victim: CachedWorkload,
    preemptor: WorkloadKey,
}

/// Cyclic admission scheduler
pub struct Scheduler {
    cache: Arc<Cache>,
    queues: Arc<QueueManager>,
    writer: Arc<dyn WorkloadWriter>,
    config: SchedulerConfig,
    ordering: Box<dyn EntryOrdering>,
    /// Held for the whole cycle; one cycle at a time
    cycle_lock: Mutex<FairnessTracker>,
    /// Shared with whoever rebuilds the cache and queues
    cycle_gate: Arc<Mutex<()>>,
}

impl Scheduler {
    /// Create a new scheduler
    pub fn new(
        cache: Arc<Cache>,
        queues: Arc<QueueManager>,
        writer: Arc<dyn WorkloadWriter>,
        config: SchedulerConfig,
    ) -> Result<Self> {
        let ordering = ordering_by_name(&config.ordering, config.starvation_threshold)?;
        Ok(Self {
            cache,
            queues,
            writer,
            config,
            ordering,
            cycle_lock: Mutex::new(FairnessTracker::default()),
            cycle_gate: Arc::new(Mutex::new(())),
        })
    }

    /// Lock held across every cycle. A resync holds it while it resets
    /// and reloads the cache and queues.
    pub fn cycle_gate(&self) -> Arc<Mutex<()>> {
        self.cycle_gate.clone()
    }

    /// Run the scheduler loop until `token` is cancelled
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        info!(ordering = self.ordering.name(), "Starting scheduler");

        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        interval.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Scheduler shutting down");
                    return Ok(());
                }
                _ = self.queues.notified() => {
                    tokio::select! {
                        _ = token.cancelled() => {
                            info!("Scheduler shutting down");
                            return Ok(());
                        }
                        _ = sleep(self.config.debounce) => {}
                    }
                }
                _ = interval.tick() => {}
            }

            match self.schedule_cycle(&token).await {
                Ok(report) if !report.is_empty() => {
                    info!(
                        admitted = report.admitted.len(),
                        evicted = report.evicted.len(),
                        requeued = report.requeued.len(),
                        "Scheduling cycle completed"
                    );
                }
                Ok(_) => debug!("Scheduling cycle had nothing to do"),
                Err(e) => error!("Scheduling cycle failed: {}", e),
            }
        }
    }

    /// Run a single scheduling cycle
    pub async fn schedule_cycle(&self, token: &CancellationToken) -> Result<CycleReport> {
        let _gate = self.cycle_gate.lock().await;
        let mut fairness = self.cycle_lock.lock().await;
        let mut report = CycleReport::default();

        let snapshot = self.cache.snapshot();
        if let Err(e) = snapshot.verify() {
            error!("Cache accounting is inconsistent, aborting cycle: {}", e);
            self.cache.request_resync();
            return Err(e.into());
        }
        for (cq, fr) in snapshot.overcommitted() {
            warn!(
                cluster_queue = %cq,
                flavor = %fr.flavor,
                resource = %fr.resource,
                "ClusterQueue uses more than its quota allows"
            );
        }

        let heads = self.queues.heads(Utc::now());
        if heads.is_empty() {
            return Ok(report);
        }
        debug!(heads = heads.len(), "Running scheduling cycle");

        let mut entries = Vec::with_capacity(heads.len());
        for info in heads {
            let active = snapshot
                .cluster_queue(&info.cluster_queue)
                .is_some_and(|cq| cq.status.is_active());
            if !active {
                debug!(
                    workload = %info.key,
                    cluster_queue = %info.cluster_queue,
                    "ClusterQueue is missing or inactive"
                );
                self.requeue(&info, RequeueReason::CycleAborted, &mut report);
                continue;
            }
            match self.assign(&snapshot, &info) {
                Ok(assignment) => entries.push(Entry { info, assignment }),
                Err(e) => {
                    warn!(workload = %info.key, "Flavor assignment failed: {}", e);
                    self.requeue(&info, RequeueReason::Infeasible, &mut report);
                }
            }
        }
        self.ordering.order(&mut entries, &fairness);
        let proposed: Vec<String> = entries.iter().map(|e| e.cluster_queue().to_string()).collect();

        if token.is_cancelled() {
            for entry in &entries {
                self.requeue(&entry.info, RequeueReason::CycleAborted, &mut report);
            }
            return Ok(report);
        }

        let (admissions, evictions) = self.decide(snapshot, entries, &mut report);

        self.commit_evictions(evictions, token, &mut report).await;
        let admitted = self.commit_admissions(admissions, token, &mut report).await;

        fairness.record_cycle(proposed.iter().map(String::as_str), &admitted);
        Ok(report)
    }

    fn assign(&self, snapshot: &Snapshot, info: &WorkloadInfo) -> Result<FlavorAssignment> {
        let cq = snapshot.cluster_queue(&info.cluster_queue).ok_or_else(|| {
            SchedulerError::internal_error(format!("ClusterQueue {} vanished", info.cluster_queue))
        })?;
        assign_flavors(snapshot, cq, &info.workload)
    }

    /// Walk the ordered entries against a working copy of the snapshot
    fn decide(
        &self,
        snapshot: Snapshot,
        entries: Vec<Entry>,
        report: &mut CycleReport,
    ) -> (Vec<PendingAdmission>, Vec<PendingEviction>) {
        let mut working = snapshot;
        let mut admissions = Vec::new();
        let mut evictions = Vec::new();
        let now = Utc::now();

        for entry in entries {
            let info = entry.info;
            // Earlier decisions of this cycle are already in the working copy
            let assignment = match self.assign(&working, &info) {
                Ok(assignment) => assignment,
                Err(e) => {
                    warn!(workload = %info.key, "Flavor assignment failed: {}", e);
                    self.requeue(&info, RequeueReason::Infeasible, report);
                    continue;
                }
            };
            let admission = assignment.to_admission(&info.cluster_queue);

            match assignment.mode {
                AssignmentMode::Fit => {
                    if let Err(e) = self.cache.assume_workload(&info.workload, &admission) {
                        warn!(workload = %info.key, "Could not assume workload: {}", e);
                        self.requeue(&info, RequeueReason::CycleAborted, report);
                        continue;
                    }
                    if let Err(e) = reserve_in(&mut working, &info, &admission, now) {
                        warn!(workload = %info.key, "Working snapshot rejected workload: {}", e);
                    }
                    debug!(
                        workload = %info.key,
                        cluster_queue = %info.cluster_queue,
                        borrows = assignment.borrows,
                        "Workload fits"
                    );
                    admissions.push(PendingAdmission { info, admission });
                }
                AssignmentMode::Preempt => {
                    match find_victims(&working, &info.cluster_queue, &info, &assignment.usage) {
                        PreemptionOutcome::Victims(victims) => {
                            for victim in victims {
                                working.remove_workload(&victim.key);
                                evictions.push(PendingEviction {
                                    victim,
                                    preemptor: info.key.clone(),
                                });
                            }
                            // Later entries must not take the freed capacity
                            if let Err(e) = reserve_in(&mut working, &info, &admission, now) {
                                warn!(
                                    workload = %info.key,
                                    "Working snapshot rejected preemptor: {}", e
                                );
                            }
                            self.requeue(&info, RequeueReason::PreemptionPending, report);
                        }
                        PreemptionOutcome::WaitForEvictions => {
                            debug!(workload = %info.key, "Waiting for evictions in progress");
                            if let Err(e) = reserve_in(&mut working, &info, &admission, now) {
                                warn!(
                                    workload = %info.key,
                                    "Working snapshot rejected preemptor: {}", e
                                );
                            }
                            self.requeue(&info, RequeueReason::PreemptionPending, report);
                        }
                        PreemptionOutcome::Infeasible => {
                            debug!(
                                workload = %info.key,
                                reason = assignment.reason.as_deref().unwrap_or_default(),
                                "No preemption victims"
                            );
                            self.requeue(&info, RequeueReason::Infeasible, report);
                        }
                    }
                }
                AssignmentMode::NoFit => {
                    debug!(
                        workload = %info.key,
                        reason = assignment.reason.as_deref().unwrap_or_default(),
                        "Workload does not fit"
                    );
                    self.requeue(&info, RequeueReason::Infeasible, report);
                }
            }
        }

        (admissions, evictions)
    }

    async fn commit_evictions(
        &self,
        evictions: Vec<PendingEviction>,
        token: &CancellationToken,
        report: &mut CycleReport,
    ) {
        for eviction in evictions {
            if token.is_cancelled() {
                debug!(workload = %eviction.victim.key, "Eviction skipped, cycle cancelled");
                continue;
            }
            let key = eviction.victim.key.clone();
            let message = format!(
                "Preempted to accommodate {} in ClusterQueue {}",
                eviction.preemptor, eviction.victim.cluster_queue
            );
            let result = self
                .with_retries(
                    || self.writer.evict_workload(&key, REASON_PREEMPTED, &message),
                    |e| e.is_transient() || e.is_conflict(),
                )
                .await;
            match result {
                Ok(evicted) => {
                    self.cache.mark_evicting(&key);
                    if evicted {
                        info!(
                            workload = %key,
                            cluster_queue = %eviction.victim.cluster_queue,
                            preemptor = %eviction.preemptor,
                            "Workload preempted"
                        );
                        report.evicted.push(key);
                    }
                }
                Err(e) => warn!(workload = %key, "Eviction failed: {}", e),
            }
        }
    }

    /// Write the reservations. Returns the ClusterQueues that admitted.
    async fn commit_admissions(
        &self,
        admissions: Vec<PendingAdmission>,
        token: &CancellationToken,
        report: &mut CycleReport,
    ) -> HashSet<String> {
        let mut admitted = HashSet::new();
        for pending in admissions {
            let key = pending.info.key.clone();
            if token.is_cancelled() {
                self.cache.forget_workload(&key);
                self.requeue(&pending.info, RequeueReason::CycleAborted, report);
                continue;
            }

            let result = self
                .with_retries(
                    || self.writer.reserve_quota(&pending.info.workload, &pending.admission),
                    StorageError::is_transient,
                )
                .await;
            match result {
                Ok(written) => {
                    self.queues.workload_admitted(&key);
                    if let Err(e) = self.cache.add_or_update_workload(&written) {
                        warn!(workload = %key, "Could not confirm reservation in cache: {}", e);
                        self.cache.request_resync();
                    }
                    info!(
                        workload = %key,
                        cluster_queue = %pending.admission.cluster_queue,
                        "Quota reserved"
                    );
                    admitted.insert(pending.admission.cluster_queue.clone());
                    report.admitted.push(key);
                }
                Err(e) if e.is_conflict() => {
                    debug!(workload = %key, "Reservation lost against a newer version");
                    self.cache.forget_workload(&key);
                    self.requeue(&pending.info, RequeueReason::Conflict, report);
                }
                Err(e) => {
                    warn!(workload = %key, "Reservation failed, rolling back: {}", e);
                    self.cache.forget_workload(&key);
                    self.requeue(&pending.info, RequeueReason::CycleAborted, report);
                }
            }
        }
        admitted
    }

    /// Retry `op` with exponential backoff while `retryable` says so
    async fn with_retries<T, F, Fut>(
        &self,
        mut op: F,
        retryable: impl Fn(&StorageError) -> bool,
    ) -> std::result::Result<T, StorageError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, StorageError>>,
    {
        let mut delay = self.config.commit_retry_base;
        let mut attempt = 1;
        loop {
            match op().await {
                Err(e) if attempt < self.config.commit_retries && retryable(&e) => {
                    debug!(attempt, "Store write failed, retrying: {}", e);
                    sleep(delay).await;
                    delay = delay.saturating_mul(2);
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    fn requeue(&self, info: &WorkloadInfo, reason: RequeueReason, report: &mut CycleReport) {
        if self.queues.requeue_workload(info, reason) {
            report.requeued.push((info.key.clone(), reason));
        }
    }
}

/// Account `info` under `admission` in the working copy
fn reserve_in(
    working: &mut Snapshot,
    info: &WorkloadInfo,
    admission: &Admission,
    now: chrono::DateTime<Utc>,
) -> Result<()> {
    let mut cached = CachedWorkload::new(&info.workload, admission, now)?;
    cached.assumed = true;
    working.add_workload(cached)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rampart_core::{
        ClusterQueue, FlavorQuotas, LocalQueue, PodSet, PreemptionPolicy, QueueingStrategy,
        ResourceFlavor, ResourceGroup, ResourceQuota, WithinClusterQueuePolicy, Workload,
    };
    use rampart_queue::QueueConfig;
    use rampart_storage::testing::{Fault, FaultyWriter};
    use rampart_storage::ObjectStore;

    struct Harness {
        store: Arc<ObjectStore>,
        writer: Arc<FaultyWriter>,
        cache: Arc<Cache>,
        queues: Arc<QueueManager>,
        scheduler: Scheduler,
    }

    impl Harness {
        fn new(cq: ClusterQueue) -> Self {
            let store = Arc::new(ObjectStore::in_memory());
            let writer = Arc::new(FaultyWriter::new(store.clone()));
            let cache = Arc::new(Cache::new());
            let queues = Arc::new(QueueManager::new(QueueConfig::default()));

            cache.upsert_flavor(&ResourceFlavor::new("default"));
            let status = cache.upsert_cluster_queue(&cq);
            queues.add_or_update_cluster_queue(&cq, status.is_active());
            let cq_name = cq.metadata.name.clone().unwrap_or_default();
            queues.add_or_update_local_queue(&LocalQueue::new("ns", "main", cq_name));

            let config = SchedulerConfig {
                commit_retry_base: Duration::from_millis(1),
                ..Default::default()
            };
            let scheduler =
                Scheduler::new(cache.clone(), queues.clone(), writer.clone(), config).unwrap();
            Self {
                store,
                writer,
                cache,
                queues,
                scheduler,
            }
        }

        /// Store a workload and deliver it the way the informer would
        fn submit(&self, name: &str, priority: i32, cpu: &str) -> Workload {
            let wl = self
                .store
                .create(
                    Workload::new("ns", name, "main")
                        .with_priority(priority)
                        .with_pod_set(PodSet::new("main", 1).with_request("cpu", cpu)),
                )
                .unwrap();
            self.observe(&wl);
            wl
        }

        fn observe(&self, wl: &Workload) {
            self.cache.add_or_update_workload(wl).unwrap();
            self.queues.add_or_update_workload(wl);
        }

        /// Re-deliver the stored copy of a workload
        fn refresh(&self, name: &str) -> Workload {
            let wl: Workload = self.store.get("ns", name).unwrap();
            self.observe(&wl);
            wl
        }

        async fn cycle(&self) -> CycleReport {
            self.scheduler
                .schedule_cycle(&CancellationToken::new())
                .await
                .unwrap()
        }

        fn used(&self) -> i64 {
            self.cache
                .snapshot()
                .used("cq", &rampart_core::FlavorResource::new("default", "cpu"))
        }
    }

    fn cluster_queue(strategy: QueueingStrategy, preemption: PreemptionPolicy) -> ClusterQueue {
        let mut cq = ClusterQueue::new("cq");
        cq.spec.queueing_strategy = strategy;
        cq.spec.preemption = preemption;
        cq.spec.resource_groups = vec![ResourceGroup {
            covered_resources: vec!["cpu".to_string()],
            flavors: vec![FlavorQuotas {
                name: "default".to_string(),
                resources: vec![ResourceQuota::new("cpu", "4")],
            }],
        }];
        cq
    }

    fn harness() -> Harness {
        Harness::new(cluster_queue(QueueingStrategy::BestEffortFIFO, PreemptionPolicy::default()))
    }

    #[tokio::test]
    async fn test_admits_what_fits() {
        let h = harness();
        h.submit("big", 0, "3");
        h.submit("small", 0, "2");

        let report = h.cycle().await;
        assert_eq!(report.admitted.len(), 1);
        assert_eq!(h.used(), 3000);

        let stored: Workload = h.store.get("ns", "big").unwrap();
        assert!(stored.has_quota_reservation());
        assert_eq!(
            stored.status.admission.as_ref().map(|a| a.cluster_queue.as_str()),
            Some("cq")
        );
    }

    #[tokio::test]
    async fn test_repeated_cycles_are_idempotent() {
        let h = harness();
        h.submit("w1", 0, "3");
        h.submit("w2", 0, "3");

        let first = h.cycle().await;
        assert_eq!(first.admitted.len(), 1);
        h.refresh(&first.admitted[0].name);
        let used = h.used();

        for _ in 0..3 {
            let report = h.cycle().await;
            assert!(report.admitted.is_empty());
            assert_eq!(h.used(), used);
        }
        assert_eq!(h.writer.reserve_calls(), 1);
    }

    #[tokio::test]
    async fn test_conflict_rolls_back_assumption() {
        let h = harness();
        h.submit("w1", 0, "2");
        h.writer.fail_next_reserve(Fault::Conflict);

        let report = h.cycle().await;
        assert!(report.admitted.is_empty());
        assert_eq!(
            report.requeued,
            vec![(WorkloadKey::new("ns", "w1"), RequeueReason::Conflict)]
        );
        assert_eq!(h.used(), 0);
        assert!(h.cache.snapshot().workload(&WorkloadKey::new("ns", "w1")).is_none());

        // The next cycle retries and succeeds
        let report = h.cycle().await;
        assert_eq!(report.admitted, vec![WorkloadKey::new("ns", "w1")]);
        assert_eq!(h.used(), 2000);
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let h = harness();
        h.submit("w1", 0, "2");
        h.writer.fail_next_reserve(Fault::Transient);

        let report = h.cycle().await;
        assert_eq!(report.admitted.len(), 1);
        assert_eq!(h.writer.reserve_calls(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_cycle_leaves_cache_untouched() {
        let h = harness();
        h.submit("w1", 0, "2");
        let token = CancellationToken::new();
        token.cancel();

        let report = h.scheduler.schedule_cycle(&token).await.unwrap();
        assert!(report.admitted.is_empty());
        assert_eq!(report.requeued.len(), 1);
        assert_eq!(h.used(), 0);
        assert_eq!(h.writer.reserve_calls(), 0);
        assert_eq!(h.queues.pending_counts()["cq"].total(), 1);
    }

    #[tokio::test]
    async fn test_strict_fifo_head_blocks_queue() {
        let h = Harness::new(cluster_queue(
            QueueingStrategy::StrictFIFO,
            PreemptionPolicy::default(),
        ));
        h.submit("huge", 10, "5");
        h.submit("tiny", 0, "1");

        let report = h.cycle().await;
        assert!(report.admitted.is_empty());
        let report = h.cycle().await;
        assert!(report.admitted.is_empty());
        assert_eq!(h.used(), 0);
    }

    #[tokio::test]
    async fn test_best_effort_skips_infeasible_head() {
        let h = harness();
        h.submit("huge", 10, "5");
        h.submit("tiny", 0, "1");

        let first = h.cycle().await;
        assert!(first.admitted.is_empty());
        let second = h.cycle().await;
        assert_eq!(second.admitted, vec![WorkloadKey::new("ns", "tiny")]);
    }

    #[tokio::test]
    async fn test_preemption_evicts_lower_priority() {
        let h = Harness::new(cluster_queue(
            QueueingStrategy::BestEffortFIFO,
            PreemptionPolicy {
                within_cluster_queue: WithinClusterQueuePolicy::LowerPriority,
                ..Default::default()
            },
        ));
        h.submit("low", 0, "3");
        assert_eq!(h.cycle().await.admitted.len(), 1);
        h.refresh("low");

        h.submit("high", 10, "2");
        let report = h.cycle().await;
        assert_eq!(report.evicted, vec![WorkloadKey::new("ns", "low")]);
        assert!(report.admitted.is_empty());

        // Until the eviction is observed the preemptor waits
        let report = h.cycle().await;
        assert!(report.evicted.is_empty());
        assert!(report.admitted.is_empty());
        assert_eq!(h.writer.evict_calls(), 1);

        let evicted = h.refresh("low");
        assert!(!evicted.has_quota_reservation());
        let report = h.cycle().await;
        assert_eq!(report.admitted, vec![WorkloadKey::new("ns", "high")]);
    }

    #[tokio::test]
    async fn test_cycle_waits_for_gate() {
        let h = Harness::new(cluster_queue(
            QueueingStrategy::BestEffortFIFO,
            PreemptionPolicy::default(),
        ));
        h.submit("w", 0, "1");

        let gate = h.scheduler.cycle_gate();
        let held = gate.lock().await;
        let blocked = tokio::time::timeout(Duration::from_millis(20), h.cycle()).await;
        assert!(blocked.is_err());
        assert_eq!(h.used(), 0);

        drop(held);
        assert_eq!(h.cycle().await.admitted, vec![WorkloadKey::new("ns", "w")]);
    }
}
