//! Test doubles for code that writes through [`WorkloadWriter`].

use crate::{Result, StorageError, WorkloadWriter};
use async_trait::async_trait;
use parking_lot::Mutex;
use rampart_core::{Admission, Workload, WorkloadKey};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// A failure to inject into the next matching call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// The conditional write lost against a newer version
    Conflict,
    /// The store was briefly unavailable
    Transient,
}

impl Fault {
    fn into_error(self, key: &WorkloadKey) -> StorageError {
        match self {
            Fault::Conflict => StorageError::conflict(key.to_string(), "observed", "newer"),
            Fault::Transient => StorageError::io_error("injected transient failure", None),
        }
    }
}

/// Wraps a writer and fails queued calls before delegating
pub struct FaultyWriter {
    inner: Arc<dyn WorkloadWriter>,
    reserve_faults: Mutex<VecDeque<Fault>>,
    evict_faults: Mutex<VecDeque<Fault>>,
    update_faults: Mutex<VecDeque<Fault>>,
    reserve_calls: AtomicUsize,
    evict_calls: AtomicUsize,
    update_calls: AtomicUsize,
}

impl FaultyWriter {
    pub fn new(inner: Arc<dyn WorkloadWriter>) -> Self {
        Self {
            inner,
            reserve_faults: Mutex::new(VecDeque::new()),
            evict_faults: Mutex::new(VecDeque::new()),
            update_faults: Mutex::new(VecDeque::new()),
            reserve_calls: AtomicUsize::new(0),
            evict_calls: AtomicUsize::new(0),
            update_calls: AtomicUsize::new(0),
        }
    }

    /// Fail the next `reserve_quota` call
    pub fn fail_next_reserve(&self, fault: Fault) {
        self.reserve_faults.lock().push_back(fault);
    }

    /// Fail the next `evict_workload` call
    pub fn fail_next_evict(&self, fault: Fault) {
        self.evict_faults.lock().push_back(fault);
    }

    /// Fail the next `update_workload` call
    pub fn fail_next_update(&self, fault: Fault) {
        self.update_faults.lock().push_back(fault);
    }

    pub fn reserve_calls(&self) -> usize {
        self.reserve_calls.load(Ordering::SeqCst)
    }

    pub fn evict_calls(&self) -> usize {
        self.evict_calls.load(Ordering::SeqCst)
    }

    pub fn update_calls(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkloadWriter for FaultyWriter {
    async fn get_workload(&self, key: &WorkloadKey) -> Result<Option<Workload>> {
        self.inner.get_workload(key).await
    }

    async fn reserve_quota(&self, workload: &Workload, admission: &Admission) -> Result<Workload> {
        self.reserve_calls.fetch_add(1, Ordering::SeqCst);
        let fault = self.reserve_faults.lock().pop_front();
        if let Some(fault) = fault {
            return Err(fault.into_error(&workload.key()));
        }
        self.inner.reserve_quota(workload, admission).await
    }

    async fn evict_workload(
        &self,
        key: &WorkloadKey,
        reason: &str,
        message: &str,
    ) -> Result<bool> {
        self.evict_calls.fetch_add(1, Ordering::SeqCst);
        let fault = self.evict_faults.lock().pop_front();
        if let Some(fault) = fault {
            return Err(fault.into_error(key));
        }
        self.inner.evict_workload(key, reason, message).await
    }

    async fn update_workload(&self, workload: &Workload) -> Result<Workload> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        let fault = self.update_faults.lock().pop_front();
        if let Some(fault) = fault {
            return Err(fault.into_error(&workload.key()));
        }
        self.inner.update_workload(workload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ObjectStore;
    use rampart_core::PodSet;

    #[tokio::test]
    async fn test_faults_are_consumed_in_order() {
        let store = Arc::new(ObjectStore::in_memory());
        let wl = store
            .create(Workload::new("ns", "w", "q").with_pod_set(PodSet::new("main", 1)))
            .unwrap();
        let writer = FaultyWriter::new(store);
        writer.fail_next_update(Fault::Transient);
        writer.fail_next_update(Fault::Conflict);

        let first = writer.update_workload(&wl).await.unwrap_err();
        assert!(first.is_transient());
        let second = writer.update_workload(&wl).await.unwrap_err();
        assert!(second.is_conflict());
        assert!(writer.update_workload(&wl).await.is_ok());
        assert_eq!(writer.update_calls(), 3);
    }
}
