use crate::registry::CheckControllerRegistry;
use crate::watch::EventHandler;
use crate::Result;
use async_trait::async_trait;
use chrono::Utc;
use rampart_cache::Cache;
use rampart_core::{CheckState, Resource, ResourceEvent, Workload};
use rampart_storage::{ObjectStore, WorkloadWriter};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Runs the in-process check controllers over reserved workloads and
/// writes their verdicts like an external controller would
pub struct CheckRunner {
    store: Arc<ObjectStore>,
    cache: Arc<Cache>,
    writer: Arc<dyn WorkloadWriter>,
    registry: Arc<CheckControllerRegistry>,
}

impl CheckRunner {
    pub fn new(
        store: Arc<ObjectStore>,
        cache: Arc<Cache>,
        writer: Arc<dyn WorkloadWriter>,
        registry: Arc<CheckControllerRegistry>,
    ) -> Self {
        Self {
            store,
            cache,
            writer,
            registry,
        }
    }

    /// Evaluate every Pending check of `workload` owned by a registered
    /// controller. Returns whether a new state was written.
    pub async fn evaluate(&self, workload: &Workload) -> Result<bool> {
        if !workload.has_quota_reservation() || workload.is_finished() {
            return Ok(false);
        }

        let now = Utc::now();
        let mut updated = workload.clone();
        let mut changed = false;
        for state in &workload.status.admission_checks {
            if state.state != CheckState::Pending {
                continue;
            }
            let Some(check) = self.cache.admission_check(&state.name) else {
                continue;
            };
            let Some(controller) = self.registry.get(&check.controller_name) else {
                continue;
            };
            let Some(verdict) = controller.evaluate(&state.name, workload).await? else {
                continue;
            };
            if updated.set_check_state(&state.name, verdict.state, verdict.message, now) {
                debug!(
                    workload = %workload.key(),
                    check = %state.name,
                    state = ?verdict.state,
                    "Check evaluated"
                );
                changed = true;
            }
        }
        if !changed {
            return Ok(false);
        }

        match self.writer.update_workload(&updated).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_conflict() => {
                debug!(workload = %workload.key(), "Dropped stale check states");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl EventHandler for CheckRunner {
    fn name(&self) -> &str {
        "check-runner"
    }

    async fn handle_event(&self, event: &ResourceEvent) -> Result<()> {
        if event.gvk.kind != Workload::KIND || event.is_delete() {
            return Ok(());
        }
        let workload: Workload = event.decode()?;
        self.evaluate(&workload).await?;
        Ok(())
    }

    async fn resync(&self) -> Result<()> {
        let mut written = 0;
        for workload in self.store.list::<Workload>(None)? {
            match self.evaluate(&workload).await {
                Ok(true) => written += 1,
                Ok(false) => {}
                Err(e) => warn!(workload = %workload.key(), "Check evaluation failed: {}", e),
            }
        }
        if written > 0 {
            info!(written, "Check runner resynced");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ALWAYS_READY_CONTROLLER;
    use rampart_core::{Admission, AdmissionCheck, PodSetAssignment};
    use std::collections::BTreeMap;

    fn runner() -> (Arc<ObjectStore>, Arc<Cache>, CheckRunner) {
        let store = Arc::new(ObjectStore::in_memory());
        let cache = Arc::new(Cache::new());
        cache.upsert_admission_check(&AdmissionCheck::new("auto", ALWAYS_READY_CONTROLLER));
        cache.upsert_admission_check(&AdmissionCheck::new("manual", "example.com/manual"));
        let runner = CheckRunner::new(
            store.clone(),
            cache.clone(),
            store.clone(),
            Arc::new(CheckControllerRegistry::with_builtin()),
        );
        (store, cache, runner)
    }

    fn reserved(store: &ObjectStore) -> Workload {
        let mut wl = Workload::new("ns", "w", "main");
        wl.set_quota_reservation(
            Admission {
                cluster_queue: "cq".to_string(),
                pod_set_assignments: vec![PodSetAssignment::new(
                    "main",
                    1,
                    BTreeMap::from([("cpu".to_string(), "default".to_string())]),
                    &BTreeMap::from([("cpu".to_string(), 1000)]),
                )],
            },
            Utc::now(),
        );
        wl.set_check_state("auto", CheckState::Pending, "", Utc::now());
        wl.set_check_state("manual", CheckState::Pending, "", Utc::now());
        store.create(wl).unwrap()
    }

    #[tokio::test]
    async fn test_only_registered_controllers_decide() {
        let (store, _cache, runner) = runner();
        let wl = reserved(&store);

        assert!(runner.evaluate(&wl).await.unwrap());
        let stored: Workload = store.get("ns", "w").unwrap();
        assert_eq!(stored.check_state("auto").map(|s| s.state), Some(CheckState::Ready));
        assert_eq!(stored.check_state("manual").map(|s| s.state), Some(CheckState::Pending));

        // Nothing left to decide
        assert!(!runner.evaluate(&stored).await.unwrap());
    }

    #[tokio::test]
    async fn test_stale_copy_is_dropped() {
        let (store, _cache, runner) = runner();
        let wl = reserved(&store);
        let mut bumped = wl.clone();
        bumped.spec.priority = 1;
        store.update(bumped).unwrap();

        assert!(!runner.evaluate(&wl).await.unwrap());
    }
}
