pub mod admission_check;
pub mod cluster_queue;
pub mod cohort;
pub mod flavor;
pub mod local_queue;
pub mod quantities;
pub mod workload;

pub use admission_check::{
    AdmissionCheck, AdmissionCheckSpec, AdmissionCheckStatus, CheckRetryPolicy,
};
pub use cluster_queue::{
    ClusterQueue, ClusterQueueSpec, ClusterQueueStatus, FlavorFungibility, FlavorQuotas,
    PreemptionPolicy, QueueingStrategy, ReclaimPolicy, ResourceGroup, ResourceQuota,
    WhenCanBorrow, WhenCanPreempt, WithinClusterQueuePolicy,
};
pub use cohort::{Cohort, CohortSpec};
pub use flavor::{ResourceFlavor, ResourceFlavorSpec};
pub use local_queue::{LocalQueue, LocalQueueSpec};
pub use quantities::{format_quantity, parse_quantity, parse_quantity_str};
pub use workload::{
    Admission, AdmissionCheckState, CheckState, ConditionType, PodSet, PodSetAssignment,
    RequeueState, Workload, WorkloadCondition, WorkloadSpec, WorkloadStatus,
};

use crate::types::API_GROUP;
use crate::{GroupVersionKind, RampartError, ResourceKey, ResourceVersion};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};

/// Base validation for all resources
pub fn validate_base(metadata: &ObjectMeta, namespaced: bool) -> Result<(), ResourceError> {
    let name = metadata
        .name
        .as_ref()
        .ok_or_else(|| ResourceError::MissingField("metadata.name".to_string()))?;

    if !is_valid_name(name) {
        return Err(ResourceError::InvalidName(name.clone()));
    }

    match (&metadata.namespace, namespaced) {
        (Some(ns), true) if !is_valid_name(ns) => {
            Err(ResourceError::InvalidNamespace(ns.clone()))
        }
        (None, true) => Err(ResourceError::MissingField("metadata.namespace".to_string())),
        (Some(ns), false) => Err(ResourceError::InvalidNamespace(format!(
            "{} is cluster-scoped but has namespace {}",
            name, ns
        ))),
        _ => Ok(()),
    }
}

/// Trait implemented by every Rampart API object
pub trait Resource: Serialize + for<'de> Deserialize<'de> + Clone + Send + Sync + 'static {
    /// Kind of this resource
    const KIND: &'static str;

    /// Whether objects of this kind live in a namespace
    const NAMESPACED: bool;

    /// Get the metadata of this resource
    fn metadata(&self) -> &ObjectMeta;

    /// Get mutable metadata
    fn metadata_mut(&mut self) -> &mut ObjectMeta;

    /// GroupVersionKind shared by every object of this kind
    fn type_gvk() -> GroupVersionKind {
        GroupVersionKind::rampart(Self::KIND)
    }

    /// Key of the object of this kind with the given namespace and name
    fn key_for(namespace: &str, name: &str) -> ResourceKey {
        if Self::NAMESPACED {
            ResourceKey::new(Self::type_gvk(), namespace, name)
        } else {
            ResourceKey::cluster_scoped(Self::type_gvk(), name)
        }
    }

    /// Get the API version of this resource
    fn api_version(&self) -> String {
        Self::type_gvk().api_version()
    }

    /// Get the kind of this resource
    fn kind(&self) -> String {
        Self::KIND.to_string()
    }

    /// Object name, empty when unset
    fn name(&self) -> &str {
        self.metadata().name.as_deref().unwrap_or_default()
    }

    /// Object namespace, empty for cluster-scoped objects
    fn namespace(&self) -> &str {
        self.metadata().namespace.as_deref().unwrap_or_default()
    }

    /// Get the ResourceKey
    fn resource_key(&self) -> Result<ResourceKey, ResourceError> {
        let name = self
            .metadata()
            .name
            .as_ref()
            .ok_or_else(|| ResourceError::MissingField("metadata.name".to_string()))?;
        Ok(Self::key_for(self.namespace(), name))
    }

    /// Get the resource version
    fn resource_version(&self) -> Option<ResourceVersion> {
        self.metadata()
            .resource_version
            .as_ref()
            .map(ResourceVersion::new)
    }

    /// Set the resource version
    fn set_resource_version(&mut self, version: ResourceVersion) {
        self.metadata_mut().resource_version = Some(version.0);
    }

    /// Get the UID
    fn uid(&self) -> Option<String> {
        self.metadata().uid.clone()
    }

    /// Set the UID
    fn set_uid(&mut self, uid: String) {
        self.metadata_mut().uid = Some(uid);
    }

    /// Validate the resource
    fn validate(&self) -> Result<(), ResourceError> {
        validate_base(self.metadata(), Self::NAMESPACED)
    }
}

/// Resource-related errors
#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid resource name: {0}")]
    InvalidName(String),

    #[error("Invalid namespace: {0}")]
    InvalidNamespace(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),
}

impl ResourceError {
    /// Lift into the crate error for the given kind
    pub fn into_rampart(self, kind: &str) -> RampartError {
        RampartError::validation_failed(
            kind,
            self.to_string(),
            format!("Fix the {} manifest and apply it again", kind),
        )
    }
}

/// Validate a Kubernetes resource name (DNS-1123 subdomain)
pub fn is_valid_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 253 {
        return false;
    }

    // Must contain only lowercase alphanumeric, '-', or '.'
    // Must start and end with alphanumeric
    let chars: Vec<char> = name.chars().collect();

    if !chars[0].is_ascii_lowercase() && !chars[0].is_ascii_digit() {
        return false;
    }

    if !chars[chars.len() - 1].is_ascii_lowercase() && !chars[chars.len() - 1].is_ascii_digit() {
        return false;
    }

    chars
        .iter()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-' || *c == '.')
}

/// Any Rampart API object, tagged by its `kind` field in manifests
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ApiObject {
    ResourceFlavor(ResourceFlavor),
    ClusterQueue(ClusterQueue),
    Cohort(Cohort),
    LocalQueue(LocalQueue),
    Workload(Workload),
    AdmissionCheck(AdmissionCheck),
}

impl ApiObject {
    /// Kind of the wrapped object
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ResourceFlavor(_) => ResourceFlavor::KIND,
            Self::ClusterQueue(_) => ClusterQueue::KIND,
            Self::Cohort(_) => Cohort::KIND,
            Self::LocalQueue(_) => LocalQueue::KIND,
            Self::Workload(_) => Workload::KIND,
            Self::AdmissionCheck(_) => AdmissionCheck::KIND,
        }
    }

    /// Key of the wrapped object
    pub fn resource_key(&self) -> Result<ResourceKey, ResourceError> {
        match self {
            Self::ResourceFlavor(o) => o.resource_key(),
            Self::ClusterQueue(o) => o.resource_key(),
            Self::Cohort(o) => o.resource_key(),
            Self::LocalQueue(o) => o.resource_key(),
            Self::Workload(o) => o.resource_key(),
            Self::AdmissionCheck(o) => o.resource_key(),
        }
    }

    /// Validate the wrapped object
    pub fn validate(&self) -> Result<(), ResourceError> {
        match self {
            Self::ResourceFlavor(o) => o.validate(),
            Self::ClusterQueue(o) => o.validate(),
            Self::Cohort(o) => o.validate(),
            Self::LocalQueue(o) => o.validate(),
            Self::Workload(o) => o.validate(),
            Self::AdmissionCheck(o) => o.validate(),
        }
    }

    /// Whether the kind belongs to the Rampart API group
    pub fn is_rampart_kind(gvk: &GroupVersionKind) -> bool {
        const KINDS: [&str; 6] = [
            ResourceFlavor::KIND,
            ClusterQueue::KIND,
            Cohort::KIND,
            LocalQueue::KIND,
            Workload::KIND,
            AdmissionCheck::KIND,
        ];
        gvk.group == API_GROUP && KINDS.contains(&gvk.kind.as_str())
    }
}
