use super::{validate_base, Resource, ResourceError};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};

/// Namespace-scoped alias that routes Workloads to one ClusterQueue
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocalQueue {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: LocalQueueSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalQueueSpec {
    pub cluster_queue: String,
}

impl LocalQueue {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        cluster_queue: impl Into<String>,
    ) -> Self {
        Self {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some(namespace.into()),
                ..Default::default()
            },
            spec: LocalQueueSpec {
                cluster_queue: cluster_queue.into(),
            },
        }
    }
}

impl Resource for LocalQueue {
    const KIND: &'static str = "LocalQueue";
    const NAMESPACED: bool = true;

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn validate(&self) -> Result<(), ResourceError> {
        validate_base(&self.metadata, Self::NAMESPACED)?;
        if self.spec.cluster_queue.is_empty() {
            return Err(ResourceError::MissingField("spec.clusterQueue".to_string()));
        }
        Ok(())
    }
}
