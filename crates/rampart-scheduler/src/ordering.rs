use crate::types::Entry;
use crate::{Result, SchedulerError};
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};

/// Orders the heads of one cycle before decisions are made
pub trait EntryOrdering: Send + Sync {
    /// Sort `entries` into decision order
    fn order(&self, entries: &mut Vec<Entry>, fairness: &FairnessTracker);

    /// Name of the policy
    fn name(&self) -> &str;
}

/// Counts consecutive cycles each ClusterQueue proposed a head and got
/// nothing admitted
#[derive(Debug, Clone, Default)]
pub struct FairnessTracker {
    waiting: HashMap<String, u32>,
}

impl FairnessTracker {
    pub fn cycles_waiting(&self, cluster_queue: &str) -> u32 {
        self.waiting.get(cluster_queue).copied().unwrap_or(0)
    }

    /// Record one cycle's outcome
    pub fn record_cycle<'a>(
        &mut self,
        proposed: impl IntoIterator<Item = &'a str>,
        admitted: &HashSet<String>,
    ) {
        for cq in proposed {
            if admitted.contains(cq) {
                self.waiting.remove(cq);
            } else {
                *self.waiting.entry(cq.to_string()).or_default() += 1;
            }
        }
    }
}

/// Starving queues first, then entries that fit without borrowing, then
/// priority, then how long the queue has been passed over, then age.
pub struct PriorityThenFairness {
    pub starvation_threshold: u32,
}

impl EntryOrdering for PriorityThenFairness {
    fn order(&self, entries: &mut Vec<Entry>, fairness: &FairnessTracker) {
        entries.sort_by_cached_key(|entry| {
            let waiting = fairness.cycles_waiting(entry.cluster_queue());
            let starving = self.starvation_threshold > 0 && waiting >= self.starvation_threshold;
            (
                !starving,
                !entry.fits_without_borrowing(),
                Reverse(entry.info.priority),
                Reverse(waiting),
                entry.info.eligible_since,
                entry.info.key.clone(),
            )
        });
    }

    fn name(&self) -> &str {
        "PriorityThenFairness"
    }
}

/// Rotates which ClusterQueue goes first, ignoring priority across queues
#[derive(Default)]
pub struct RoundRobin {
    last_leader: Mutex<Option<String>>,
}

impl EntryOrdering for RoundRobin {
    fn order(&self, entries: &mut Vec<Entry>, _fairness: &FairnessTracker) {
        let mut last_leader = self.last_leader.lock();
        entries.sort_by(|a, b| {
            a.cluster_queue()
                .cmp(b.cluster_queue())
                .then_with(|| a.info.key.cmp(&b.info.key))
        });
        if let Some(last) = last_leader.as_deref() {
            let start = entries
                .iter()
                .position(|e| e.cluster_queue() > last)
                .unwrap_or(0);
            entries.rotate_left(start);
        }
        if let Some(first) = entries.first() {
            *last_leader = Some(first.cluster_queue().to_string());
        }
    }

    fn name(&self) -> &str {
        "RoundRobin"
    }
}

/// Build the ordering policy configured under `name`
pub fn ordering_by_name(name: &str, starvation_threshold: u32) -> Result<Box<dyn EntryOrdering>> {
    match name {
        "PriorityThenFairness" => Ok(Box::new(PriorityThenFairness {
            starvation_threshold,
        })),
        "RoundRobin" => Ok(Box::new(RoundRobin::default())),
        other => Err(SchedulerError::unknown_ordering(other)),
    }
}
