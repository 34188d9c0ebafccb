use crate::types::{GroupVersionKind, ResourceKey};
use crate::{RampartError, Result};
use serde::{Deserialize, Serialize};

/// Watch event type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WatchEventType {
    Added,
    Modified,
    Deleted,
}

/// A resource event emitted by the object store on every mutation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceEvent {
    /// Type of watch event (ADDED, MODIFIED, DELETED)
    pub event_type: WatchEventType,
    /// GroupVersionKind of the resource
    pub gvk: GroupVersionKind,
    /// Full resource key (gvk + namespace + name)
    pub resource_key: ResourceKey,
    /// The serialized resource object (last state for deletions)
    pub object: serde_json::Value,
    /// Resource version at the time of the event
    pub resource_version: String,
}

impl ResourceEvent {
    fn new(
        event_type: WatchEventType,
        resource_key: ResourceKey,
        object: serde_json::Value,
        resource_version: String,
    ) -> Self {
        Self {
            event_type,
            gvk: resource_key.gvk.clone(),
            resource_key,
            object,
            resource_version,
        }
    }

    /// Create an ADDED event
    pub fn added(
        resource_key: ResourceKey,
        object: serde_json::Value,
        resource_version: String,
    ) -> Self {
        Self::new(WatchEventType::Added, resource_key, object, resource_version)
    }

    /// Create a MODIFIED event
    pub fn modified(
        resource_key: ResourceKey,
        object: serde_json::Value,
        resource_version: String,
    ) -> Self {
        Self::new(WatchEventType::Modified, resource_key, object, resource_version)
    }

    /// Create a DELETED event
    pub fn deleted(
        resource_key: ResourceKey,
        object: serde_json::Value,
        resource_version: String,
    ) -> Self {
        Self::new(WatchEventType::Deleted, resource_key, object, resource_version)
    }

    /// Whether this event removes the object
    pub fn is_delete(&self) -> bool {
        self.event_type == WatchEventType::Deleted
    }

    /// Decode the carried object into a typed resource
    pub fn decode<T: for<'de> Deserialize<'de>>(&self) -> Result<T> {
        serde_json::from_value(self.object.clone()).map_err(|e| {
            RampartError::serialization_error(
                format!("Failed to decode {} from event: {}", self.resource_key, e),
                Some(Box::new(e)),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Resource, ResourceFlavor};

    #[test]
    fn test_resource_event_serde_roundtrip() {
        let key = ResourceKey::cluster_scoped(GroupVersionKind::rampart("ResourceFlavor"), "spot");
        let object = serde_json::json!({"metadata": {"name": "spot"}});

        let event = ResourceEvent::added(key, object.clone(), "12".to_string());

        let serialized = serde_json::to_string(&event).unwrap();
        let deserialized: ResourceEvent = serde_json::from_str(&serialized).unwrap();

        assert_eq!(deserialized.event_type, WatchEventType::Added);
        assert_eq!(deserialized.resource_key.name, "spot");
        assert_eq!(deserialized.gvk.kind, "ResourceFlavor");
        assert_eq!(deserialized.object, object);
        assert_eq!(deserialized.resource_version, "12");
    }

    #[test]
    fn test_decode_typed_object() {
        let key = ResourceKey::cluster_scoped(GroupVersionKind::rampart("ResourceFlavor"), "spot");
        let event = ResourceEvent::deleted(
            key,
            serde_json::json!({
                "metadata": {"name": "spot"},
                "spec": {"nodeLabels": {"tier": "spot"}}
            }),
            "13".to_string(),
        );

        assert!(event.is_delete());
        let flavor: ResourceFlavor = event.decode().unwrap();
        assert_eq!(flavor.name(), "spot");
        assert_eq!(flavor.spec.node_labels.get("tier").map(String::as_str), Some("spot"));
    }
}
