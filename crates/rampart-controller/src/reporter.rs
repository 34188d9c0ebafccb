use crate::Result;
use rampart_cache::{Cache, UsageReport};
use rampart_queue::QueueManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Configuration for the usage reporter
#[derive(Debug, Clone)]
pub struct ReporterConfig {
    pub interval: Duration,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
        }
    }
}

/// Periodically logs quota usage and pending counts per ClusterQueue
pub struct Reporter {
    cache: Arc<Cache>,
    queues: Arc<QueueManager>,
    config: ReporterConfig,
}

impl Reporter {
    pub fn new(cache: Arc<Cache>, queues: Arc<QueueManager>, config: ReporterConfig) -> Self {
        Self {
            cache,
            queues,
            config,
        }
    }

    /// Log one report and return the usage it was built from
    pub fn report(&self) -> UsageReport {
        let usage = self.cache.usage_report();
        let pending = self.queues.pending_counts();

        for cq in &usage.cluster_queues {
            let counts = pending.get(&cq.name).copied().unwrap_or_default();
            info!(
                cluster_queue = %cq.name,
                cohort = cq.cohort.as_deref().unwrap_or("-"),
                status = %cq.status,
                reserved = cq.reserved_workloads,
                pending = counts.active,
                inadmissible = counts.inadmissible,
                "ClusterQueue usage"
            );
            for resource in &cq.resources {
                info!(
                    cluster_queue = %cq.name,
                    flavor = %resource.flavor,
                    resource = %resource.resource,
                    nominal = resource.nominal,
                    used = resource.used,
                    borrowed = resource.borrowed,
                    "Resource usage"
                );
            }
        }
        for cohort in &usage.cohorts {
            for resource in &cohort.resources {
                info!(
                    cohort = %cohort.name,
                    flavor = %resource.flavor,
                    resource = %resource.resource,
                    requestable = resource.requestable,
                    used = resource.used,
                    "Cohort usage"
                );
            }
        }
        let unresolved = self.queues.unresolved_count();
        if unresolved > 0 {
            info!(unresolved, "Workloads waiting for a LocalQueue or ClusterQueue");
        }
        usage
    }

    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        let mut ticks = tokio::time::interval(self.config.interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticks.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Reporter shutting down");
                    return Ok(());
                }
                _ = ticks.tick() => {
                    self.report();
                }
            }
        }
    }
}
