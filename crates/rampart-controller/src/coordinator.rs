use crate::watch::EventHandler;
use crate::Result;
use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use rampart_cache::{CachedAdmissionCheck, Cache};
use rampart_core::config::AdmissionCheckSettings;
use rampart_core::{
    CheckRetryPolicy, CheckState, ConditionType, RequeueState, Resource, ResourceEvent, Workload,
};
use rampart_queue::QueueManager;
use rampart_storage::{ObjectStore, WorkloadWriter};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

pub const REASON_CHECK_REJECTED: &str = "AdmissionCheckRejected";
pub const REASON_CHECK_RETRY: &str = "AdmissionCheckRetry";

/// When an evicted workload may be scheduled again
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    After(Duration),
    /// The workload is deactivated
    Never,
}

/// What the admission checks of one workload call for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckDecision {
    /// Not reserved, finished, or already consistent
    Nothing,
    /// Add these checks as Pending
    InitializeChecks { missing: Vec<String> },
    /// Some check is still Pending
    Wait,
    /// Every check is Ready
    Admit,
    /// A check asked to give the quota back
    Evict {
        check: String,
        state: CheckState,
        requeue: Requeue,
    },
}

/// Aggregate a reserved workload's check states against the checks its
/// ClusterQueue requires.
pub fn decide(
    workload: &Workload,
    required: &[String],
    checks: &HashMap<String, CachedAdmissionCheck>,
) -> CheckDecision {
    if !workload.has_quota_reservation() || workload.is_finished() {
        return CheckDecision::Nothing;
    }

    let missing: Vec<String> = required
        .iter()
        .filter(|name| workload.check_state(name).is_none())
        .cloned()
        .collect();
    if !missing.is_empty() {
        return CheckDecision::InitializeChecks { missing };
    }

    let attempt = workload
        .status
        .requeue_state
        .as_ref()
        .map(|r| r.count)
        .unwrap_or(0)
        .saturating_add(1);
    let mut eviction: Option<(String, CheckState, Duration)> = None;
    for name in required {
        let Some(state) = workload.check_state(name).map(|s| s.state) else {
            continue;
        };
        if !matches!(state, CheckState::Rejected | CheckState::Retry) {
            continue;
        }
        let default_policy = CheckRetryPolicy::default();
        let policy = checks
            .get(name)
            .map(|c| &c.retry_policy)
            .unwrap_or(&default_policy);
        if state == CheckState::Rejected && !policy.retryable {
            return CheckDecision::Evict {
                check: name.clone(),
                state,
                requeue: Requeue::Never,
            };
        }
        let delay = policy.delay_for(attempt);
        if eviction.as_ref().is_none_or(|(_, _, d)| delay > *d) {
            eviction = Some((name.clone(), state, delay));
        }
    }
    if let Some((check, state, delay)) = eviction {
        return CheckDecision::Evict {
            check,
            state,
            requeue: Requeue::After(delay),
        };
    }

    let all_ready = required
        .iter()
        .all(|name| workload.check_state(name).is_some_and(|s| s.state == CheckState::Ready));
    if !all_ready {
        return CheckDecision::Wait;
    }
    let complete = workload.is_admitted()
        && (required.is_empty()
            || workload.is_condition_true(ConditionType::AdmissionChecksComplete));
    if complete {
        CheckDecision::Nothing
    } else {
        CheckDecision::Admit
    }
}

/// Configuration for the admission-check coordinator
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Attempts per status write
    pub write_retries: u32,
    /// First retry delay; doubles per attempt
    pub write_retry_base: Duration,
    /// Interval of the full re-reconcile pass
    pub resync_interval: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self::from_settings(&AdmissionCheckSettings::default())
    }
}

impl CoordinatorConfig {
    pub fn from_settings(settings: &AdmissionCheckSettings) -> Self {
        Self {
            write_retries: settings.write_retries.max(1),
            write_retry_base: Duration::from_millis(50),
            resync_interval: Duration::from_secs(settings.resync_seconds.max(1)),
        }
    }
}

/// Turns check states of reserved workloads into admission or eviction.
///
/// It never evaluates a check itself; check controllers write the states.
pub struct AdmissionCheckCoordinator {
    store: Arc<ObjectStore>,
    cache: Arc<Cache>,
    queues: Arc<QueueManager>,
    writer: Arc<dyn WorkloadWriter>,
    config: CoordinatorConfig,
}

impl AdmissionCheckCoordinator {
    pub fn new(
        store: Arc<ObjectStore>,
        cache: Arc<Cache>,
        queues: Arc<QueueManager>,
        writer: Arc<dyn WorkloadWriter>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            store,
            cache,
            queues,
            writer,
            config,
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Decide what `workload`'s checks call for, using the checks its
    /// ClusterQueue currently requires
    pub fn reconcile(&self, workload: &Workload) -> CheckDecision {
        let Some(cq) = workload.admitted_cluster_queue() else {
            return CheckDecision::Nothing;
        };
        let required = self.cache.cluster_queue_checks(cq).unwrap_or_default();
        let checks: HashMap<String, CachedAdmissionCheck> = required
            .iter()
            .filter_map(|name| self.cache.admission_check(name))
            .map(|check| (check.name.clone(), check))
            .collect();
        decide(workload, &required, &checks)
    }

    /// Write `decision` for `workload`. Returns the stored workload when
    /// something was written.
    pub async fn apply(
        &self,
        workload: &Workload,
        decision: CheckDecision,
    ) -> Result<Option<Workload>> {
        let key = workload.key();
        let now = Utc::now();
        match decision {
            CheckDecision::Nothing | CheckDecision::Wait => Ok(None),
            CheckDecision::InitializeChecks { missing } => {
                let mut updated = workload.clone();
                for name in &missing {
                    updated.set_check_state(name, CheckState::Pending, "", now);
                }
                debug!(workload = %key, checks = ?missing, "Initialized admission checks");
                self.write(&updated).await
            }
            CheckDecision::Admit => {
                let mut updated = workload.clone();
                if !updated.status.admission_checks.is_empty() {
                    updated.set_condition(
                        ConditionType::AdmissionChecksComplete,
                        true,
                        "AdmissionChecksReady",
                        "",
                        now,
                    );
                }
                updated.set_condition(
                    ConditionType::Admitted,
                    true,
                    "Admitted",
                    "The workload is admitted",
                    now,
                );
                let written = self.write(&updated).await?;
                if written.is_some() {
                    info!(workload = %key, "Workload admitted");
                }
                Ok(written)
            }
            CheckDecision::Evict {
                check,
                state,
                requeue,
            } => self.evict(workload, &check, state, requeue).await,
        }
    }

    async fn evict(
        &self,
        workload: &Workload,
        check: &str,
        state: CheckState,
        requeue: Requeue,
    ) -> Result<Option<Workload>> {
        let key = workload.key();
        let now = Utc::now();
        let cluster_queue = workload.admitted_cluster_queue().map(str::to_string);
        let reason = match state {
            CheckState::Rejected => REASON_CHECK_REJECTED,
            _ => REASON_CHECK_RETRY,
        };

        let mut updated = workload.clone();
        updated.clear_reservation(reason, format!("AdmissionCheck {} is {:?}", check, state), now);
        match requeue {
            Requeue::After(delay) => {
                let count = workload
                    .status
                    .requeue_state
                    .as_ref()
                    .map(|r| r.count)
                    .unwrap_or(0)
                    .saturating_add(1);
                let delay = TimeDelta::from_std(delay).unwrap_or(TimeDelta::MAX);
                updated.status.requeue_state = Some(RequeueState {
                    count,
                    requeue_at: now.checked_add_signed(delay),
                });
            }
            Requeue::Never => updated.spec.active = false,
        }

        let Some(written) = self.write(&updated).await? else {
            return Ok(None);
        };
        info!(
            workload = %key,
            check,
            state = ?state,
            requeue = ?requeue,
            "Workload evicted by admission check"
        );

        // Release the quota now rather than on the watch event
        self.cache.add_or_update_workload(&written)?;
        self.queues.add_or_update_workload(&written);
        if let Some(cq) = cluster_queue {
            self.queues.queue_inadmissible_workloads(&self.cache.cohort_members_of(&cq));
        }
        Ok(Some(written))
    }

    /// Conditional write with bounded retries. A conflict means a newer
    /// version exists, which is reconciled on its own event.
    async fn write(&self, workload: &Workload) -> Result<Option<Workload>> {
        let mut delay = self.config.write_retry_base;
        let mut attempt = 1;
        loop {
            match self.writer.update_workload(workload).await {
                Ok(written) => return Ok(Some(written)),
                Err(e) if e.is_conflict() => {
                    debug!(workload = %workload.key(), "Dropped stale write");
                    return Ok(None);
                }
                Err(e) if e.is_transient() && attempt < self.config.write_retries => {
                    debug!(workload = %workload.key(), attempt, "Write failed, retrying: {}", e);
                    sleep(delay).await;
                    delay = delay.saturating_mul(2);
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn reconcile_and_apply(&self, workload: &Workload) -> Result<()> {
        let decision = self.reconcile(workload);
        if decision != CheckDecision::Nothing {
            debug!(workload = %workload.key(), decision = ?decision, "Reconciled admission checks");
        }
        self.apply(workload, decision).await?;
        Ok(())
    }
}

#[async_trait]
impl EventHandler for AdmissionCheckCoordinator {
    fn name(&self) -> &str {
        "admission-check-coordinator"
    }

    async fn handle_event(&self, event: &ResourceEvent) -> Result<()> {
        if event.gvk.kind != Workload::KIND || event.is_delete() {
            return Ok(());
        }
        let workload: Workload = event.decode()?;
        self.reconcile_and_apply(&workload).await
    }

    async fn resync(&self) -> Result<()> {
        let workloads = self.store.list::<Workload>(None)?;
        for workload in workloads.iter().filter(|w| w.has_quota_reservation()) {
            if let Err(e) = self.reconcile_and_apply(workload).await {
                warn!(workload = %workload.key(), "Reconcile failed: {}", e);
            }
        }
        Ok(())
    }
}
