use crate::cluster_queue::{ParkReason, PendingQueue};
use crate::types::{PendingCounts, RequeueReason, WorkloadInfo};
use crate::{Backoff, QueueError, Result};
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use rampart_core::config::QueueingSettings;
use rampart_core::{ClusterQueue, LocalQueue, QueueingStrategy, Resource, Workload, WorkloadKey};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tracing::{debug, info};

/// Queue manager configuration
#[derive(Debug, Clone, Default)]
pub struct QueueConfig {
    /// Delay policy for infeasible workloads
    pub backoff: Backoff,
}

impl QueueConfig {
    pub fn from_settings(settings: &QueueingSettings) -> Result<Self> {
        Ok(Self {
            backoff: Backoff::new(
                Duration::from_millis(settings.backoff_base_millis),
                Duration::from_millis(settings.backoff_max_millis),
                settings.backoff_jitter,
            )?,
        })
    }
}

#[derive(Debug, Default)]
struct State {
    /// "namespace/name" → ClusterQueue
    local_queues: HashMap<String, String>,
    cluster_queues: BTreeMap<String, PendingQueue>,
    /// Pending workloads without a live route to a ClusterQueue
    unresolved: HashMap<WorkloadKey, Workload>,
    /// Heads handed to the scheduler, with their latest observed state
    in_flight: HashMap<WorkloadKey, WorkloadInfo>,
    /// ClusterQueue and eligible-since per workload, kept across admission
    eligible_since: HashMap<WorkloadKey, (String, DateTime<Utc>)>,
    /// ClusterQueue whose pending queue holds each queued workload
    queued: HashMap<WorkloadKey, String>,
}

impl State {
    fn route(&self, workload: &Workload) -> Option<String> {
        let local = format!("{}/{}", workload.namespace(), workload.spec.queue_name);
        let cq = self.local_queues.get(&local)?;
        self.cluster_queues.contains_key(cq).then(|| cq.clone())
    }

    /// Forget every queued copy of `key`, leaving eligible-since alone
    fn detach(&mut self, key: &WorkloadKey) -> Option<WorkloadInfo> {
        self.unresolved.remove(key);
        if let Some(info) = self.in_flight.remove(key) {
            return Some(info);
        }
        let cq = self.queued.remove(key)?;
        self.cluster_queues.get_mut(&cq)?.remove(key)
    }

    /// Place a pending workload into its ClusterQueue, or the unresolved set
    fn enqueue(&mut self, workload: Workload, previous: Option<WorkloadInfo>, now: DateTime<Utc>) {
        let key = workload.key();
        let Some(cq) = self.route(&workload) else {
            debug!(
                workload = %key,
                queue = %workload.spec.queue_name,
                "Workload waits for its queue"
            );
            self.unresolved.insert(key, workload);
            return;
        };

        let eligible_since = match self.eligible_since.get(&key) {
            Some((recorded_cq, since)) if *recorded_cq == cq => *since,
            _ => now,
        };
        self.eligible_since
            .insert(key.clone(), (cq.clone(), eligible_since));

        let requeue_at = workload
            .status
            .requeue_state
            .as_ref()
            .and_then(|r| r.requeue_at)
            .filter(|at| *at > now);

        let mut info = WorkloadInfo::new(workload, cq.clone(), now);
        info.eligible_since = eligible_since;
        if let Some(previous) = previous.filter(|p| p.cluster_queue == cq) {
            info.attempts = previous.attempts;
            info.not_before = previous.not_before;
        }

        let Some(queue) = self.cluster_queues.get_mut(&cq) else {
            return;
        };
        self.queued.insert(key, cq);
        if let Some(at) = requeue_at {
            info.not_before = Some(at);
            queue.park(info, ParkReason::CheckRetry);
        } else if previous_parked(&info, queue.strategy, now) {
            queue.park(info, ParkReason::Backoff);
        } else {
            queue.push(info);
        }
    }

    /// Re-route every unresolved workload
    fn resolve(&mut self, now: DateTime<Utc>) -> usize {
        let ready: Vec<WorkloadKey> = self
            .unresolved
            .iter()
            .filter(|(_, workload)| self.route(workload).is_some())
            .map(|(key, _)| key.clone())
            .collect();
        for key in &ready {
            if let Some(workload) = self.unresolved.remove(key) {
                self.enqueue(workload, None, now);
            }
        }
        ready.len()
    }
}

/// A BestEffortFIFO entry still backing off stays parked across updates
fn previous_parked(info: &WorkloadInfo, strategy: QueueingStrategy, now: DateTime<Utc>) -> bool {
    strategy == QueueingStrategy::BestEffortFIFO && info.is_backing_off(now)
}

/// Holds pending workloads per ClusterQueue and proposes heads.
///
/// Every operation is synchronous; the scheduler waits on
/// [`QueueManager::notified`] for changes that may produce new heads.
pub struct QueueManager {
    config: QueueConfig,
    state: Mutex<State>,
    notify: Notify,
}

impl QueueManager {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State::default()),
            notify: Notify::new(),
        }
    }

    /// Resolves once something changed since the last wake-up
    pub fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }

    fn wake(&self) {
        self.notify.notify_one();
    }

    pub fn add_or_update_local_queue(&self, lq: &LocalQueue) {
        let now = Utc::now();
        let namespace = lq.namespace().to_string();
        let name = lq.name().to_string();
        let target = lq.spec.cluster_queue.clone();
        let mut state = self.state.lock();

        let previous = state
            .local_queues
            .insert(format!("{}/{}", namespace, name), target.clone());
        if previous.as_deref() != Some(target.as_str()) {
            // Move workloads already queued through this LocalQueue
            if let Some(old) = previous {
                let moved: Vec<WorkloadKey> = state
                    .cluster_queues
                    .get(&old)
                    .map(|queue| {
                        queue.keys_where(|info| {
                            info.key.namespace == namespace && info.workload.spec.queue_name == name
                        })
                    })
                    .unwrap_or_default();
                for key in moved {
                    if let Some(info) = state.detach(&key) {
                        state.enqueue(info.workload, None, now);
                    }
                }
            }
        }
        let resolved = state.resolve(now);
        drop(state);

        debug!(
            local_queue = %format!("{}/{}", namespace, name),
            cluster_queue = %target,
            resolved,
            "LocalQueue updated"
        );
        self.wake();
    }

    pub fn delete_local_queue(&self, namespace: &str, name: &str) {
        let mut state = self.state.lock();
        let Some(cq) = state.local_queues.remove(&format!("{}/{}", namespace, name)) else {
            return;
        };
        let orphaned: Vec<WorkloadKey> = state
            .cluster_queues
            .get(&cq)
            .map(|queue| {
                queue.keys_where(|info| {
                    info.key.namespace == namespace && info.workload.spec.queue_name == name
                })
            })
            .unwrap_or_default();
        for key in &orphaned {
            if let Some(info) = state.detach(key) {
                state.unresolved.insert(key.clone(), info.workload);
            }
        }
        debug!(
            local_queue = %format!("{}/{}", namespace, name),
            orphaned = orphaned.len(),
            "LocalQueue deleted"
        );
    }

    /// Add a ClusterQueue or update its strategy, cohort and active flag
    pub fn add_or_update_cluster_queue(&self, cq: &ClusterQueue, active: bool) {
        let now = Utc::now();
        let name = cq.name().to_string();
        let mut state = self.state.lock();
        match state.cluster_queues.get_mut(&name) {
            Some(queue) => {
                queue.active = active;
                queue.cohort = cq.cohort().map(str::to_string);
                if queue.strategy != cq.spec.queueing_strategy {
                    queue.strategy = cq.spec.queueing_strategy;
                    // Re-place entries under the new strategy
                    let entries = queue.drain();
                    for info in entries {
                        queue.push(info);
                    }
                }
            }
            None => {
                state.cluster_queues.insert(
                    name.clone(),
                    PendingQueue::new(
                        cq.spec.queueing_strategy,
                        cq.cohort().map(str::to_string),
                        active,
                    ),
                );
            }
        }
        let resolved = state.resolve(now);
        drop(state);

        debug!(cluster_queue = %name, active, resolved, "ClusterQueue queue updated");
        self.wake();
    }

    /// Flip whether a ClusterQueue proposes heads
    pub fn set_cluster_queue_active(&self, name: &str, active: bool) -> Result<()> {
        let mut state = self.state.lock();
        let queue = state
            .cluster_queues
            .get_mut(name)
            .ok_or_else(|| QueueError::cluster_queue_not_found(name))?;
        let changed = queue.active != active;
        queue.active = active;
        drop(state);
        if changed {
            info!(cluster_queue = %name, active, "ClusterQueue activity changed");
            self.wake();
        }
        Ok(())
    }

    /// Drop a ClusterQueue; its pending workloads wait for a new route
    pub fn delete_cluster_queue(&self, name: &str) {
        let mut state = self.state.lock();
        let Some(mut queue) = state.cluster_queues.remove(name) else {
            return;
        };
        for info in queue.drain() {
            state.queued.remove(&info.key);
            state.unresolved.insert(info.key.clone(), info.workload);
        }
        let in_flight: Vec<WorkloadKey> = state
            .in_flight
            .iter()
            .filter(|(_, info)| info.cluster_queue == name)
            .map(|(key, _)| key.clone())
            .collect();
        for key in in_flight {
            if let Some(info) = state.in_flight.remove(&key) {
                state.unresolved.insert(key, info.workload);
            }
        }
        debug!(cluster_queue = %name, "ClusterQueue queue deleted");
    }

    /// Reconcile with an observed workload. Pending, active workloads are
    /// queued; anything else leaves the queues.
    pub fn add_or_update_workload(&self, workload: &Workload) {
        let key = workload.key();
        let now = Utc::now();
        let pending =
            workload.is_active() && !workload.is_finished() && !workload.has_quota_reservation();
        let mut state = self.state.lock();

        if !pending {
            state.detach(&key);
            if workload.is_finished() || !workload.is_active() {
                state.eligible_since.remove(&key);
            }
            return;
        }

        if let Some(in_flight) = state.in_flight.get_mut(&key) {
            // The scheduler decides; keep the newest object for the requeue
            in_flight.priority = workload.spec.priority;
            in_flight.workload = workload.clone();
            return;
        }

        let previous = state.detach(&key);
        state.enqueue(workload.clone(), previous, now);
        drop(state);
        self.wake();
    }

    /// Remove every trace of a workload
    pub fn delete_workload(&self, key: &WorkloadKey) {
        let mut state = self.state.lock();
        state.detach(key);
        state.eligible_since.remove(key);
    }

    /// Pop at most one head per active ClusterQueue
    pub fn heads(&self, now: DateTime<Utc>) -> Vec<WorkloadInfo> {
        let mut state = self.state.lock();
        let mut heads = Vec::new();
        for queue in state.cluster_queues.values_mut() {
            queue.unpark_due(now);
            if !queue.active {
                continue;
            }
            if let Some(head) = queue.pop_head(now) {
                heads.push(head);
            }
        }
        for head in &heads {
            state.queued.remove(&head.key);
            state.in_flight.insert(head.key.clone(), head.clone());
        }
        heads
    }

    /// Return a popped head to its queue. Returns `false` when the workload
    /// was deleted, reserved or otherwise resolved while it was in flight.
    pub fn requeue_workload(&self, info: &WorkloadInfo, reason: RequeueReason) -> bool {
        let now = Utc::now();
        let mut state = self.state.lock();
        let Some(mut latest) = state.in_flight.remove(&info.key) else {
            return false;
        };

        let Some(cq) = state.route(&latest.workload) else {
            state.unresolved.insert(latest.key.clone(), latest.workload);
            return false;
        };
        if cq != latest.cluster_queue {
            state.enqueue(latest.workload, None, now);
            drop(state);
            self.wake();
            return true;
        }

        state.queued.insert(latest.key.clone(), cq.clone());
        let Some(queue) = state.cluster_queues.get_mut(&cq) else {
            return false;
        };
        match reason {
            RequeueReason::Infeasible => {
                latest.attempts = latest.attempts.saturating_add(1);
                let delay = self.config.backoff.delay(latest.attempts);
                latest.not_before = Some(now + to_time_delta(delay));
                debug!(
                    workload = %latest.key,
                    attempts = latest.attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Workload backing off"
                );
                match queue.strategy {
                    QueueingStrategy::StrictFIFO => queue.push(latest),
                    QueueingStrategy::BestEffortFIFO => queue.park(latest, ParkReason::Backoff),
                }
            }
            RequeueReason::CheckRetry { delay } => {
                latest.not_before = Some(now + to_time_delta(delay));
                queue.park(latest, ParkReason::CheckRetry);
            }
            _ => {
                latest.not_before = None;
                queue.push(latest);
            }
        }
        drop(state);
        if reason.is_immediate() {
            self.wake();
        }
        true
    }

    /// The head was reserved; drop it from the in-flight set
    pub fn workload_admitted(&self, key: &WorkloadKey) {
        self.state.lock().in_flight.remove(key);
    }

    /// Capacity changed around `cluster_queues`: retry every parked
    /// workload in their cohorts now
    pub fn queue_inadmissible_workloads(&self, cluster_queues: &[String]) {
        let mut state = self.state.lock();
        let cohorts: BTreeSet<String> = cluster_queues
            .iter()
            .filter_map(|name| state.cluster_queues.get(name))
            .filter_map(|queue| queue.cohort.clone())
            .collect();

        let mut released = 0;
        for (name, queue) in state.cluster_queues.iter_mut() {
            let affected = cluster_queues.contains(name)
                || queue.cohort.as_ref().is_some_and(|c| cohorts.contains(c));
            if affected {
                released += queue.clear_backoff();
            }
        }
        drop(state);

        if released > 0 {
            debug!(released, "Requeued inadmissible workloads");
            self.wake();
        }
    }

    /// Pending workloads per ClusterQueue
    pub fn pending_counts(&self) -> BTreeMap<String, PendingCounts> {
        let now = Utc::now();
        let state = self.state.lock();
        let mut counts: BTreeMap<String, PendingCounts> = state
            .cluster_queues
            .iter()
            .map(|(name, queue)| (name.clone(), queue.counts(now)))
            .collect();
        for info in state.in_flight.values() {
            if let Some(entry) = counts.get_mut(&info.cluster_queue) {
                entry.active += 1;
            }
        }
        counts
    }

    /// Pending workloads without a route to a ClusterQueue
    pub fn unresolved_count(&self) -> usize {
        self.state.lock().unresolved.len()
    }

    /// ClusterQueue a LocalQueue routes to
    pub fn cluster_queue_for(&self, namespace: &str, local_queue: &str) -> Option<String> {
        self.state
            .lock()
            .local_queues
            .get(&format!("{}/{}", namespace, local_queue))
            .cloned()
    }

    /// Drop everything ahead of a full re-listing
    pub fn reset(&self) {
        *self.state.lock() = State::default();
        info!("Queue manager reset");
    }
}

fn to_time_delta(delay: Duration) -> TimeDelta {
    TimeDelta::from_std(delay).unwrap_or(TimeDelta::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rampart_core::{Admission, ConditionType, PodSet, RequeueState};

    fn manager() -> QueueManager {
        let backoff = Backoff::new(Duration::from_secs(10), Duration::from_secs(60), 0.0).unwrap();
        QueueManager::new(QueueConfig { backoff })
    }

    fn cluster_queue(name: &str, strategy: QueueingStrategy) -> ClusterQueue {
        let mut cq = ClusterQueue::new(name);
        cq.spec.queueing_strategy = strategy;
        cq
    }

    fn workload(name: &str, priority: i32) -> Workload {
        Workload::new("team-a", name, "main")
            .with_priority(priority)
            .with_pod_set(PodSet::new("main", 1).with_request("cpu", "1"))
    }

    fn seeded(strategy: QueueingStrategy) -> QueueManager {
        let manager = manager();
        manager.add_or_update_cluster_queue(&cluster_queue("cq", strategy), true);
        manager.add_or_update_local_queue(&LocalQueue::new("team-a", "main", "cq"));
        manager
    }

    fn names(heads: &[WorkloadInfo]) -> Vec<&str> {
        heads.iter().map(|h| h.key.name.as_str()).collect()
    }

    #[test]
    fn test_unresolved_until_route_exists() {
        let manager = manager();
        manager.add_or_update_workload(&workload("w1", 0));
        assert_eq!(manager.unresolved_count(), 1);

        manager.add_or_update_local_queue(&LocalQueue::new("team-a", "main", "cq"));
        assert_eq!(manager.unresolved_count(), 1);

        let cq = cluster_queue("cq", QueueingStrategy::BestEffortFIFO);
        manager.add_or_update_cluster_queue(&cq, true);
        assert_eq!(manager.unresolved_count(), 0);
        assert_eq!(names(&manager.heads(Utc::now())), vec!["w1"]);
    }

    #[test]
    fn test_one_head_per_queue_by_priority() {
        let manager = seeded(QueueingStrategy::BestEffortFIFO);
        manager.add_or_update_workload(&workload("low", 1));
        manager.add_or_update_workload(&workload("high", 9));

        let now = Utc::now();
        assert_eq!(names(&manager.heads(now)), vec!["high"]);
        assert_eq!(names(&manager.heads(now)), vec!["low"]);
        assert!(manager.heads(now).is_empty());
    }

    #[test]
    fn test_inactive_queue_has_no_heads() {
        let manager = seeded(QueueingStrategy::BestEffortFIFO);
        manager.add_or_update_workload(&workload("w1", 0));
        manager.set_cluster_queue_active("cq", false).unwrap();
        assert!(manager.heads(Utc::now()).is_empty());
        manager.set_cluster_queue_active("cq", true).unwrap();
        assert_eq!(manager.heads(Utc::now()).len(), 1);
        assert!(manager.set_cluster_queue_active("missing", true).is_err());
    }

    #[test]
    fn test_strict_fifo_infeasible_head_blocks() {
        let manager = seeded(QueueingStrategy::StrictFIFO);
        manager.add_or_update_workload(&workload("big", 5));
        manager.add_or_update_workload(&workload("small", 1));

        let now = Utc::now();
        let heads = manager.heads(now);
        assert_eq!(names(&heads), vec!["big"]);
        assert!(manager.requeue_workload(&heads[0], RequeueReason::Infeasible));

        assert!(manager.heads(Utc::now()).is_empty());
        let later = Utc::now() + TimeDelta::seconds(11);
        assert_eq!(names(&manager.heads(later)), vec!["big"]);
    }

    #[test]
    fn test_best_effort_infeasible_head_steps_aside() {
        let manager = seeded(QueueingStrategy::BestEffortFIFO);
        manager.add_or_update_workload(&workload("big", 5));
        manager.add_or_update_workload(&workload("small", 1));

        let heads = manager.heads(Utc::now());
        assert!(manager.requeue_workload(&heads[0], RequeueReason::Infeasible));
        assert_eq!(names(&manager.heads(Utc::now())), vec!["small"]);

        let counts = manager.pending_counts();
        assert_eq!(counts["cq"].inadmissible, 1);
        assert_eq!(counts["cq"].active, 1);
    }

    #[test]
    fn test_capacity_change_clears_backoff() {
        let manager = seeded(QueueingStrategy::BestEffortFIFO);
        manager.add_or_update_workload(&workload("big", 5));
        let heads = manager.heads(Utc::now());
        manager.requeue_workload(&heads[0], RequeueReason::Infeasible);
        assert!(manager.heads(Utc::now()).is_empty());

        manager.queue_inadmissible_workloads(&["cq".to_string()]);
        assert_eq!(names(&manager.heads(Utc::now())), vec!["big"]);
    }

    #[test]
    fn test_immediate_requeue_keeps_eligible_since() {
        let manager = seeded(QueueingStrategy::StrictFIFO);
        manager.add_or_update_workload(&workload("first", 0));
        manager.add_or_update_workload(&workload("second", 0));

        let heads = manager.heads(Utc::now());
        let eligible = heads[0].eligible_since;
        assert!(manager.requeue_workload(&heads[0], RequeueReason::Conflict));

        let heads = manager.heads(Utc::now());
        assert_eq!(names(&heads), vec!["first"]);
        assert_eq!(heads[0].eligible_since, eligible);
    }

    #[test]
    fn test_reserved_while_in_flight_is_not_requeued() {
        let manager = seeded(QueueingStrategy::BestEffortFIFO);
        let wl = workload("w1", 0);
        manager.add_or_update_workload(&wl);
        let heads = manager.heads(Utc::now());

        let mut reserved = wl.clone();
        reserved.set_quota_reservation(
            Admission {
                cluster_queue: "cq".to_string(),
                pod_set_assignments: vec![],
            },
            Utc::now(),
        );
        manager.add_or_update_workload(&reserved);
        assert!(!manager.requeue_workload(&heads[0], RequeueReason::CycleAborted));
        assert!(manager.heads(Utc::now()).is_empty());
    }

    #[test]
    fn test_eligible_since_survives_admission_and_eviction() {
        let manager = seeded(QueueingStrategy::BestEffortFIFO);
        let wl = workload("w1", 0);
        manager.add_or_update_workload(&wl);
        let heads = manager.heads(Utc::now());
        let eligible = heads[0].eligible_since;
        manager.workload_admitted(&wl.key());

        let mut evicted = wl.clone();
        evicted.set_condition(ConditionType::Evicted, true, "Preempted", "", Utc::now());
        manager.add_or_update_workload(&evicted);
        let heads = manager.heads(Utc::now());
        assert_eq!(heads[0].eligible_since, eligible);
    }

    #[test]
    fn test_requeue_at_parks_workload() {
        let manager = seeded(QueueingStrategy::StrictFIFO);
        let mut wl = workload("retry", 0);
        wl.status.requeue_state = Some(RequeueState {
            count: 1,
            requeue_at: Some(Utc::now() + TimeDelta::seconds(30)),
        });
        manager.add_or_update_workload(&wl);
        manager.add_or_update_workload(&workload("other", 0));

        // A check-retry park does not block a StrictFIFO queue
        assert_eq!(names(&manager.heads(Utc::now())), vec!["other"]);
        let later = Utc::now() + TimeDelta::seconds(31);
        assert_eq!(names(&manager.heads(later)), vec!["retry"]);
    }

    #[test]
    fn test_check_retry_requeue_waits() {
        let manager = seeded(QueueingStrategy::BestEffortFIFO);
        manager.add_or_update_workload(&workload("w1", 0));
        let heads = manager.heads(Utc::now());
        manager.requeue_workload(
            &heads[0],
            RequeueReason::CheckRetry {
                delay: Duration::from_secs(20),
            },
        );
        manager.queue_inadmissible_workloads(&["cq".to_string()]);
        assert!(manager.heads(Utc::now()).is_empty());
        assert_eq!(manager.heads(Utc::now() + TimeDelta::seconds(21)).len(), 1);
    }

    #[test]
    fn test_finished_and_deleted_workloads_leave() {
        let manager = seeded(QueueingStrategy::BestEffortFIFO);
        let mut wl = workload("done", 0);
        manager.add_or_update_workload(&wl);
        wl.set_condition(ConditionType::Finished, true, "Succeeded", "", Utc::now());
        manager.add_or_update_workload(&wl);
        assert!(manager.heads(Utc::now()).is_empty());

        manager.add_or_update_workload(&workload("gone", 0));
        manager.delete_workload(&WorkloadKey::new("team-a", "gone"));
        assert!(manager.heads(Utc::now()).is_empty());
    }

    #[test]
    fn test_local_queue_retarget_moves_workloads() {
        let manager = seeded(QueueingStrategy::BestEffortFIFO);
        let other = cluster_queue("other", QueueingStrategy::BestEffortFIFO);
        manager.add_or_update_cluster_queue(&other, true);
        manager.add_or_update_workload(&workload("w1", 0));

        manager.add_or_update_local_queue(&LocalQueue::new("team-a", "main", "other"));
        let heads = manager.heads(Utc::now());
        assert_eq!(heads[0].cluster_queue, "other");

        manager.requeue_workload(&heads[0], RequeueReason::CycleAborted);
        manager.delete_local_queue("team-a", "main");
        assert_eq!(manager.unresolved_count(), 1);
        assert_eq!(manager.cluster_queue_for("team-a", "main"), None);
    }

    #[tokio::test]
    async fn test_notified_after_enqueue() {
        let manager = seeded(QueueingStrategy::BestEffortFIFO);
        manager.add_or_update_workload(&workload("w1", 0));
        tokio::time::timeout(Duration::from_secs(1), manager.notified())
            .await
            .unwrap();
    }

    #[test]
    fn test_queued_index_follows_workload() {
        let manager = seeded(QueueingStrategy::BestEffortFIFO);
        let other = cluster_queue("other", QueueingStrategy::BestEffortFIFO);
        manager.add_or_update_cluster_queue(&other, true);
        manager.add_or_update_workload(&workload("w1", 5));
        manager.add_or_update_workload(&workload("w2", 0));
        let key = WorkloadKey::new("team-a", "w1");
        let located = |manager: &QueueManager| manager.state.lock().queued.get(&key).cloned();
        assert_eq!(located(&manager).as_deref(), Some("cq"));

        // Retargeting the LocalQueue moves its workloads
        manager.add_or_update_local_queue(&LocalQueue::new("team-a", "main", "other"));
        assert_eq!(located(&manager).as_deref(), Some("other"));

        // In flight it is indexed nowhere, and back once requeued
        let heads = manager.heads(Utc::now());
        assert_eq!(names(&heads), vec!["w1"]);
        let head = &heads[0];
        assert_eq!(located(&manager), None);
        assert!(manager.requeue_workload(head, RequeueReason::Infeasible));
        assert_eq!(located(&manager).as_deref(), Some("other"));

        manager.delete_workload(&key);
        assert_eq!(located(&manager), None);
        assert_eq!(manager.pending_counts().get("other").map(|c| c.total()), Some(1));

        manager.delete_cluster_queue("other");
        assert!(manager.state.lock().queued.is_empty());
        assert_eq!(manager.unresolved_count(), 1);
    }
}
