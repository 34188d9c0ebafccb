use crate::encoding::REVISION_KEY;
use crate::event_bus::{EventBusConfig, ResourceEvent};
use crate::{KVStore, KeyEncoder, MemoryBackend, Result, StorageError, Transaction};
use chrono::Utc;
use parking_lot::Mutex;
use rampart_core::k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use rampart_core::{ApiObject, Resource, ResourceKey, ResourceVersion};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteMode {
    /// Fail if the object exists
    Create,
    /// Fail if the object is missing; conditional when a version is set
    Update,
    /// Create or overwrite unconditionally
    Apply,
}

/// Versioned object store over a [`KVStore`].
///
/// Every write bumps a store-wide revision that becomes the object's
/// `resourceVersion`, and publishes a [`ResourceEvent`] on the watch bus.
/// Writes are serialized so events leave in revision order.
pub struct ObjectStore {
    kv: Arc<dyn KVStore>,
    write_lock: Mutex<()>,
    event_tx: broadcast::Sender<ResourceEvent>,
}

impl ObjectStore {
    /// Create a store with the default event bus config
    pub fn new(kv: Arc<dyn KVStore>) -> Self {
        Self::with_event_bus_config(kv, EventBusConfig::default())
    }

    /// Create a store with a custom event bus config
    pub fn with_event_bus_config(kv: Arc<dyn KVStore>, config: EventBusConfig) -> Self {
        let (event_tx, _) = broadcast::channel(config.capacity);
        Self {
            kv,
            write_lock: Mutex::new(()),
            event_tx,
        }
    }

    /// A store backed by a fresh in-memory backend
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    /// Subscribe to resource events
    pub fn subscribe(&self) -> broadcast::Receiver<ResourceEvent> {
        self.event_tx.subscribe()
    }

    /// Latest committed revision
    pub fn revision(&self) -> Result<u64> {
        read_revision(self.kv.get(REVISION_KEY.as_bytes())?)
    }

    /// Get an object by namespace and name
    pub fn get<T: Resource>(&self, namespace: &str, name: &str) -> Result<T> {
        let key = T::key_for(namespace, name);
        self.try_get_key(&key)?
            .ok_or_else(|| StorageError::key_not_found(key.storage_key()))
    }

    /// Get an object if it exists
    pub fn try_get<T: Resource>(&self, namespace: &str, name: &str) -> Result<Option<T>> {
        self.try_get_key(&T::key_for(namespace, name))
    }

    fn try_get_key<T: Resource>(&self, key: &ResourceKey) -> Result<Option<T>> {
        let storage_key = KeyEncoder::encode_resource_key(key);
        match self.kv.get(storage_key.as_bytes())? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    /// List objects of a kind, optionally within one namespace, in key order
    pub fn list<T: Resource>(&self, namespace: Option<&str>) -> Result<Vec<T>> {
        let prefix = KeyEncoder::encode_prefix(T::KIND, namespace.filter(|_| T::NAMESPACED));
        self.kv
            .scan(prefix.as_bytes())?
            .into_iter()
            .map(|(_, data)| serde_json::from_slice(&data).map_err(StorageError::from))
            .collect()
    }

    /// Create a new object; fails if it already exists
    pub fn create<T: Resource>(&self, object: T) -> Result<T> {
        self.write(object, WriteMode::Create)
    }

    /// Replace an existing object. When the object carries a resourceVersion
    /// the write only succeeds if it still matches the stored one.
    pub fn update<T: Resource>(&self, object: T) -> Result<T> {
        self.write(object, WriteMode::Update)
    }

    /// Create or overwrite an object regardless of its stored version
    pub fn apply<T: Resource>(&self, object: T) -> Result<T> {
        self.write(object, WriteMode::Apply)
    }

    /// Apply any API object, as read from a manifest
    pub fn apply_object(&self, object: ApiObject) -> Result<ResourceKey> {
        let key = match object {
            ApiObject::ResourceFlavor(o) => self.apply(o)?.resource_key(),
            ApiObject::ClusterQueue(o) => self.apply(o)?.resource_key(),
            ApiObject::Cohort(o) => self.apply(o)?.resource_key(),
            ApiObject::LocalQueue(o) => self.apply(o)?.resource_key(),
            ApiObject::Workload(o) => self.apply(o)?.resource_key(),
            ApiObject::AdmissionCheck(o) => self.apply(o)?.resource_key(),
        };
        key.map_err(|e| StorageError::invalid_object("manifest", e.to_string()))
    }

    /// Delete an object, returning its last state
    pub fn delete<T: Resource>(&self, namespace: &str, name: &str) -> Result<T> {
        let key = T::key_for(namespace, name);
        let storage_key = KeyEncoder::encode_resource_key(&key);

        let _guard = self.write_lock.lock();
        let mut txn = self.kv.transaction()?;

        let previous = txn
            .get(storage_key.as_bytes())?
            .ok_or_else(|| StorageError::key_not_found(storage_key.clone()))?;
        let object: T = serde_json::from_slice(&previous)?;

        let revision = bump_revision(txn.as_mut())?;
        txn.delete(storage_key.as_bytes())?;
        txn.commit()?;

        info!("Deleted {} at revision {}", key, revision);

        // Publish DELETED event with last-known state (best-effort)
        if let Ok(value) = serde_json::from_slice::<serde_json::Value>(&previous) {
            let _ = self
                .event_tx
                .send(ResourceEvent::deleted(key, value, revision.to_string()));
        }

        Ok(object)
    }

    fn write<T: Resource>(&self, mut object: T, mode: WriteMode) -> Result<T> {
        let key = object
            .resource_key()
            .map_err(|e| StorageError::invalid_object(T::KIND, e.to_string()))?;
        object
            .validate()
            .map_err(|e| StorageError::invalid_object(key.to_string(), e.to_string()))?;
        let storage_key = KeyEncoder::encode_resource_key(&key);

        let _guard = self.write_lock.lock();
        let mut txn = self.kv.transaction()?;

        let existing: Option<T> = match txn.get(storage_key.as_bytes())? {
            Some(data) => Some(serde_json::from_slice(&data)?),
            None => None,
        };

        match (&existing, mode) {
            (Some(_), WriteMode::Create) => {
                return Err(StorageError::already_exists(storage_key));
            }
            (None, WriteMode::Update) => {
                return Err(StorageError::key_not_found(storage_key));
            }
            (Some(current), WriteMode::Update) => {
                if let Some(expected) = object.resource_version() {
                    let actual = current.resource_version();
                    if actual.as_ref() != Some(&expected) {
                        return Err(StorageError::conflict(
                            storage_key,
                            expected.to_string(),
                            actual.map(|v| v.to_string()).unwrap_or_default(),
                        ));
                    }
                }
            }
            _ => {}
        }

        // Identity fields are owned by the store
        match &existing {
            Some(current) => {
                let uid = current.metadata().uid.clone();
                let created = current.metadata().creation_timestamp.clone();
                let metadata = object.metadata_mut();
                metadata.uid = uid;
                metadata.creation_timestamp = created;
            }
            None => {
                object.set_uid(Uuid::new_v4().to_string());
                let metadata = object.metadata_mut();
                if metadata.creation_timestamp.is_none() {
                    metadata.creation_timestamp = Some(Time(Utc::now()));
                }
            }
        }

        let revision = bump_revision(txn.as_mut())?;
        object.set_resource_version(ResourceVersion::from_revision(revision));

        let value = serde_json::to_value(&object)?;
        let data = serde_json::to_vec(&value)?;
        txn.put(storage_key.as_bytes(), &data)?;
        txn.commit()?;

        debug!("Wrote {} at revision {}", key, revision);

        let event = if existing.is_some() {
            ResourceEvent::modified(key, value, revision.to_string())
        } else {
            ResourceEvent::added(key, value, revision.to_string())
        };
        // No subscribers is not an error
        let _ = self.event_tx.send(event);

        Ok(object)
    }
}

fn read_revision(data: Option<bytes::Bytes>) -> Result<u64> {
    match data {
        Some(bytes) => String::from_utf8_lossy(&bytes).parse().map_err(|e| {
            StorageError::serialization_error(
                format!("Corrupt revision counter: {}", e),
                Some(Box::new(e)),
            )
        }),
        None => Ok(0),
    }
}

fn bump_revision(txn: &mut dyn Transaction) -> Result<u64> {
    let next = read_revision(txn.get(REVISION_KEY.as_bytes())?)? + 1;
    txn.put(REVISION_KEY.as_bytes(), next.to_string().as_bytes())?;
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RedbBackend;
    use rampart_core::{
        ClusterQueue, LocalQueue, PodSet, ResourceFlavor, WatchEventType, Workload,
    };
    use tempfile::tempdir;

    fn workload(name: &str) -> Workload {
        Workload::new("team-a", name, "main")
            .with_pod_set(PodSet::new("main", 1).with_request("cpu", "1"))
    }

    #[test]
    fn test_create_assigns_identity() {
        let store = ObjectStore::in_memory();
        let created = store.create(workload("job-1")).unwrap();

        assert!(created.uid().is_some());
        assert!(created.metadata.creation_timestamp.is_some());
        assert_eq!(created.resource_version(), Some(ResourceVersion::from_revision(1)));
        assert_eq!(store.revision().unwrap(), 1);

        assert!(matches!(
            store.create(workload("job-1")),
            Err(StorageError::AlreadyExists { .. })
        ));
    }

    #[test]
    fn test_update_is_conditional_on_version() {
        let store = ObjectStore::in_memory();
        let created = store.create(workload("job-1")).unwrap();

        let mut first = created.clone();
        first.spec.priority = 5;
        let updated = store.update(first).unwrap();
        assert_eq!(updated.resource_version(), Some(ResourceVersion::from_revision(2)));
        assert_eq!(updated.uid(), created.uid());

        // Writing against the stale version loses
        let mut stale = created;
        stale.spec.priority = 7;
        let err = store.update(stale).unwrap_err();
        assert!(err.is_conflict());

        let stored: Workload = store.get("team-a", "job-1").unwrap();
        assert_eq!(stored.spec.priority, 5);
    }

    #[test]
    fn test_update_missing_and_invalid() {
        let store = ObjectStore::in_memory();
        assert!(store.update(workload("ghost")).unwrap_err().is_not_found());

        let bad = Workload::new("team-a", "Bad_Name", "main");
        assert!(matches!(
            store.create(bad),
            Err(StorageError::InvalidObject { .. })
        ));
    }

    #[test]
    fn test_list_by_kind_and_namespace() {
        let store = ObjectStore::in_memory();
        store.create(workload("job-1")).unwrap();
        store.create(workload("job-2")).unwrap();
        store
            .create(
                Workload::new("team-b", "job-3", "main")
                    .with_pod_set(PodSet::new("main", 1)),
            )
            .unwrap();
        store.create(LocalQueue::new("team-a", "main", "cq")).unwrap();

        assert_eq!(store.list::<Workload>(None).unwrap().len(), 3);
        assert_eq!(store.list::<Workload>(Some("team-a")).unwrap().len(), 2);
        assert_eq!(store.list::<LocalQueue>(None).unwrap().len(), 1);
        assert!(store.list::<ClusterQueue>(None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_events_follow_writes() {
        let store = ObjectStore::in_memory();
        let mut rx = store.subscribe();

        let created = store.create(ResourceFlavor::new("default")).unwrap();
        store.apply(created).unwrap();
        store.delete::<ResourceFlavor>("", "default").unwrap();

        let added = rx.recv().await.unwrap();
        assert_eq!(added.event_type, WatchEventType::Added);
        assert_eq!(added.resource_version, "1");

        let modified = rx.recv().await.unwrap();
        assert_eq!(modified.event_type, WatchEventType::Modified);

        let deleted = rx.recv().await.unwrap();
        assert_eq!(deleted.event_type, WatchEventType::Deleted);
        assert_eq!(deleted.resource_key.name, "default");
        assert_eq!(deleted.resource_version, "3");
        let flavor: ResourceFlavor = deleted.decode().unwrap();
        assert_eq!(flavor.resource_version(), Some(ResourceVersion::from_revision(2)));
    }

    #[test]
    fn test_apply_object_from_manifest() {
        let store = ObjectStore::in_memory();
        let objects = rampart_core::parse_manifests(
            r#"
kind: ResourceFlavor
metadata:
  name: spot
---
kind: LocalQueue
metadata:
  name: main
  namespace: team-a
spec:
  clusterQueue: cq
"#,
        )
        .unwrap();
        for object in objects {
            store.apply_object(object).unwrap();
        }
        assert!(store.try_get::<ResourceFlavor>("", "spot").unwrap().is_some());
        assert!(store.try_get::<LocalQueue>("team-a", "main").unwrap().is_some());
    }

    #[test]
    fn test_redb_backed_store_keeps_revision() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.redb");
        {
            let store = ObjectStore::new(Arc::new(RedbBackend::new(&path).unwrap()));
            store.create(ResourceFlavor::new("a")).unwrap();
            store.create(ResourceFlavor::new("b")).unwrap();
        }
        let store = ObjectStore::new(Arc::new(RedbBackend::new(&path).unwrap()));
        assert_eq!(store.revision().unwrap(), 2);
        let c = store.create(ResourceFlavor::new("c")).unwrap();
        assert_eq!(c.resource_version(), Some(ResourceVersion::from_revision(3)));
    }
}
