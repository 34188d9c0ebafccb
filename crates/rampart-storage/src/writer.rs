use crate::{ObjectStore, Result};
use async_trait::async_trait;
use chrono::Utc;
use rampart_core::{Admission, Workload, WorkloadKey};
use tracing::{debug, info};

/// Status writes the scheduler and the admission-check coordinator make.
///
/// Every write is conditional on the workload's last-observed
/// resourceVersion and fails with a conflict when the stored object moved on.
#[async_trait]
pub trait WorkloadWriter: Send + Sync {
    /// Read the current stored workload
    async fn get_workload(&self, key: &WorkloadKey) -> Result<Option<Workload>>;

    /// Record a quota reservation against `workload`'s resourceVersion
    async fn reserve_quota(&self, workload: &Workload, admission: &Admission) -> Result<Workload>;

    /// Drop the reservation of the stored workload and mark it evicted.
    /// Returns `false` when it held no reservation.
    async fn evict_workload(&self, key: &WorkloadKey, reason: &str, message: &str)
        -> Result<bool>;

    /// Write the whole workload back, conditional on its resourceVersion
    async fn update_workload(&self, workload: &Workload) -> Result<Workload>;
}

#[async_trait]
impl WorkloadWriter for ObjectStore {
    async fn get_workload(&self, key: &WorkloadKey) -> Result<Option<Workload>> {
        self.try_get(&key.namespace, &key.name)
    }

    async fn reserve_quota(&self, workload: &Workload, admission: &Admission) -> Result<Workload> {
        let mut updated = workload.clone();
        updated.set_quota_reservation(admission.clone(), Utc::now());
        let written = self.update(updated)?;
        info!(
            workload = %workload.key(),
            cluster_queue = %admission.cluster_queue,
            "Quota reserved"
        );
        Ok(written)
    }

    async fn evict_workload(
        &self,
        key: &WorkloadKey,
        reason: &str,
        message: &str,
    ) -> Result<bool> {
        let Some(mut current) = self.try_get::<Workload>(&key.namespace, &key.name)? else {
            debug!(workload = %key, "Eviction target is gone");
            return Ok(false);
        };
        if !current.has_quota_reservation() {
            return Ok(false);
        }

        current.clear_reservation(reason, message, Utc::now());
        self.update(current)?;
        info!(workload = %key, reason, message, "Workload evicted");
        Ok(true)
    }

    async fn update_workload(&self, workload: &Workload) -> Result<Workload> {
        self.update(workload.clone())
    }
}
