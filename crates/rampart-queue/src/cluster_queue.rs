use crate::types::{OrderKey, PendingCounts, WorkloadInfo};
use chrono::{DateTime, Utc};
use rampart_core::{QueueingStrategy, WorkloadKey};
use std::collections::{BTreeMap, HashMap};

/// Why an entry sits outside the ordered queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ParkReason {
    /// Infeasible; cleared early by capacity changes
    Backoff,
    /// Waiting out an admission check's retry delay
    CheckRetry,
}

/// Ordered pending workloads of one ClusterQueue
#[derive(Debug)]
pub(crate) struct PendingQueue {
    pub(crate) strategy: QueueingStrategy,
    pub(crate) cohort: Option<String>,
    pub(crate) active: bool,
    items: BTreeMap<OrderKey, WorkloadInfo>,
    positions: HashMap<WorkloadKey, OrderKey>,
    parked: HashMap<WorkloadKey, (WorkloadInfo, ParkReason)>,
}

impl PendingQueue {
    pub(crate) fn new(strategy: QueueingStrategy, cohort: Option<String>, active: bool) -> Self {
        Self {
            strategy,
            cohort,
            active,
            items: BTreeMap::new(),
            positions: HashMap::new(),
            parked: HashMap::new(),
        }
    }

    /// Insert or reposition `info` in the ordered queue
    pub(crate) fn push(&mut self, info: WorkloadInfo) {
        self.remove(&info.key);
        let order = info.order_key();
        self.positions.insert(info.key.clone(), order.clone());
        self.items.insert(order, info);
    }

    pub(crate) fn park(&mut self, info: WorkloadInfo, reason: ParkReason) {
        self.remove(&info.key);
        self.parked.insert(info.key.clone(), (info, reason));
    }

    pub(crate) fn remove(&mut self, key: &WorkloadKey) -> Option<WorkloadInfo> {
        if let Some(order) = self.positions.remove(key) {
            return self.items.remove(&order);
        }
        self.parked.remove(key).map(|(info, _)| info)
    }

    pub(crate) fn get(&self, key: &WorkloadKey) -> Option<&WorkloadInfo> {
        match self.positions.get(key) {
            Some(order) => self.items.get(order),
            None => self.parked.get(key).map(|(info, _)| info),
        }
    }

    pub(crate) fn is_parked(&self, key: &WorkloadKey) -> bool {
        self.parked.contains_key(key)
    }

    /// Return parked entries whose delay has elapsed to the ordered queue
    pub(crate) fn unpark_due(&mut self, now: DateTime<Utc>) {
        let due: Vec<WorkloadKey> = self
            .parked
            .iter()
            .filter(|(_, (info, _))| !info.is_backing_off(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in due {
            if let Some((mut info, _)) = self.parked.remove(&key) {
                info.not_before = None;
                self.push(info);
            }
        }
    }

    /// Drop infeasibility backoff so every entry is retried. Check retry
    /// delays are kept. Returns how many entries were released.
    pub(crate) fn clear_backoff(&mut self) -> usize {
        let mut released = 0;
        let backing_off: Vec<WorkloadKey> = self
            .parked
            .iter()
            .filter(|(_, (_, reason))| *reason == ParkReason::Backoff)
            .map(|(key, _)| key.clone())
            .collect();
        for key in backing_off {
            if let Some((mut info, _)) = self.parked.remove(&key) {
                info.not_before = None;
                self.push(info);
                released += 1;
            }
        }
        for info in self.items.values_mut() {
            if info.not_before.take().is_some() {
                released += 1;
            }
        }
        released
    }

    /// Pop the workload this queue proposes at `now`, if any.
    ///
    /// StrictFIFO only ever proposes the literal head; a head that is
    /// backing off blocks the queue.
    pub(crate) fn pop_head(&mut self, now: DateTime<Utc>) -> Option<WorkloadInfo> {
        let order = match self.strategy {
            QueueingStrategy::StrictFIFO => {
                let (order, head) = self.items.iter().next()?;
                if head.is_backing_off(now) {
                    return None;
                }
                order.clone()
            }
            QueueingStrategy::BestEffortFIFO => self
                .items
                .iter()
                .find(|(_, info)| !info.is_backing_off(now))
                .map(|(order, _)| order.clone())?,
        };
        let info = self.items.remove(&order)?;
        self.positions.remove(&info.key);
        Some(info)
    }

    pub(crate) fn counts(&self, now: DateTime<Utc>) -> PendingCounts {
        let backing_off = self
            .items
            .values()
            .filter(|info| info.is_backing_off(now))
            .count();
        PendingCounts {
            active: self.items.len() - backing_off,
            inadmissible: backing_off + self.parked.len(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len() + self.parked.len()
    }

    /// Remove and return every entry
    pub(crate) fn drain(&mut self) -> Vec<WorkloadInfo> {
        self.positions.clear();
        let mut drained: Vec<WorkloadInfo> =
            std::mem::take(&mut self.items).into_values().collect();
        drained.extend(self.parked.drain().map(|(_, (info, _))| info));
        drained
    }

    /// Keys of entries matching `predicate`
    pub(crate) fn keys_where(&self, predicate: impl Fn(&WorkloadInfo) -> bool) -> Vec<WorkloadKey> {
        self.items
            .values()
            .chain(self.parked.values().map(|(info, _)| info))
            .filter(|info| predicate(info))
            .map(|info| info.key.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rampart_core::Workload;

    fn info(name: &str, priority: i32, eligible_offset: i64) -> WorkloadInfo {
        let base = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap_or_default();
        let mut info = WorkloadInfo::new(
            Workload::new("ns", name, "main").with_priority(priority),
            "cq".to_string(),
            base + Duration::seconds(eligible_offset),
        );
        info.created_at = base;
        info
    }

    #[test]
    fn test_order_priority_then_eligible_since() {
        let mut queue = PendingQueue::new(QueueingStrategy::BestEffortFIFO, None, true);
        queue.push(info("late-low", 0, 10));
        queue.push(info("early-low", 0, 0));
        queue.push(info("high", 5, 20));

        let now = Utc::now();
        let order: Vec<String> = std::iter::from_fn(|| queue.pop_head(now))
            .map(|i| i.key.name)
            .collect();
        assert_eq!(order, vec!["high", "early-low", "late-low"]);
    }

    #[test]
    fn test_strict_fifo_head_blocks_while_backing_off() {
        let now = Utc::now();
        let mut queue = PendingQueue::new(QueueingStrategy::StrictFIFO, None, true);
        let mut head = info("head", 5, 0);
        head.not_before = Some(now + Duration::seconds(30));
        queue.push(head);
        queue.push(info("next", 0, 1));

        assert!(queue.pop_head(now).is_none());
        assert_eq!(queue.counts(now).inadmissible, 1);

        let later = now + Duration::seconds(31);
        assert_eq!(queue.pop_head(later).unwrap().key.name, "head");
    }

    #[test]
    fn test_best_effort_skips_backing_off_entries() {
        let now = Utc::now();
        let mut queue = PendingQueue::new(QueueingStrategy::BestEffortFIFO, None, true);
        let mut head = info("head", 5, 0);
        head.not_before = Some(now + Duration::seconds(30));
        queue.park(head, ParkReason::Backoff);
        queue.push(info("next", 0, 1));

        assert_eq!(queue.pop_head(now).unwrap().key.name, "next");
        assert!(queue.pop_head(now).is_none());

        assert_eq!(queue.clear_backoff(), 1);
        assert_eq!(queue.pop_head(now).unwrap().key.name, "head");
    }

    #[test]
    fn test_check_retry_survives_backoff_reset() {
        let now = Utc::now();
        let mut queue = PendingQueue::new(QueueingStrategy::BestEffortFIFO, None, true);
        let mut retry = info("retry", 0, 0);
        retry.not_before = Some(now + Duration::seconds(30));
        queue.park(retry, ParkReason::CheckRetry);

        assert_eq!(queue.clear_backoff(), 0);
        queue.unpark_due(now);
        assert!(queue.is_parked(&WorkloadKey::new("ns", "retry")));
        queue.unpark_due(now + Duration::seconds(30));
        assert!(!queue.is_parked(&WorkloadKey::new("ns", "retry")));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_push_repositions_on_priority_change() {
        let mut queue = PendingQueue::new(QueueingStrategy::StrictFIFO, None, true);
        queue.push(info("a", 0, 0));
        queue.push(info("b", 0, 1));
        queue.push(info("b", 10, 1));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop_head(Utc::now()).unwrap().key.name, "b");
    }
}
