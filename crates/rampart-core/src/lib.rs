//! Rampart Core - API objects and shared types for the Rampart admission controller
//!
//! This crate provides:
//! - The queueing API objects (ResourceFlavor, ClusterQueue, Cohort, LocalQueue,
//!   Workload, AdmissionCheck)
//! - Resource quantity parsing into canonical integer units
//! - Error types with miette diagnostics
//! - Type-safe resource keys, workload keys and watch events
//! - The YAML configuration file model

pub mod config;
pub mod error;
pub mod events;
pub mod resources;
pub mod types;

// Re-export commonly used types
pub use config::Configuration;
pub use error::{RampartError, Result};
pub use events::{ResourceEvent, WatchEventType};
pub use resources::{
    format_quantity, is_valid_name, parse_quantity, parse_quantity_str, Admission,
    AdmissionCheck, AdmissionCheckSpec, AdmissionCheckState, AdmissionCheckStatus, ApiObject,
    CheckRetryPolicy, CheckState, ClusterQueue, ClusterQueueSpec, ClusterQueueStatus, Cohort,
    CohortSpec, ConditionType, FlavorFungibility, FlavorQuotas, LocalQueue, LocalQueueSpec,
    PodSet, PodSetAssignment, PreemptionPolicy, QueueingStrategy, ReclaimPolicy, RequeueState,
    Resource, ResourceError, ResourceFlavor, ResourceFlavorSpec, ResourceGroup, ResourceQuota,
    WhenCanBorrow, WhenCanPreempt, WithinClusterQueuePolicy, Workload, WorkloadCondition,
    WorkloadSpec, WorkloadStatus,
};
pub use types::{FlavorResource, GroupVersionKind, ResourceKey, ResourceVersion, WorkloadKey};

// Re-export k8s-openapi types for convenience
pub use k8s_openapi;
pub use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
pub use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use serde::Deserialize;

/// Parse a multi-document YAML manifest into API objects.
///
/// Documents are separated by `---`; empty documents are skipped.
pub fn parse_manifests(data: &str) -> Result<Vec<ApiObject>> {
    let mut objects = Vec::new();
    for document in serde_yaml::Deserializer::from_str(data) {
        let value = serde_yaml::Value::deserialize(document).map_err(|e| {
            RampartError::serialization_error(
                format!("Failed to parse manifest document: {}", e),
                Some(Box::new(e)),
            )
        })?;
        if value.is_null() {
            continue;
        }
        let object: ApiObject = serde_yaml::from_value(value).map_err(|e| {
            RampartError::serialization_error(
                format!("Failed to decode manifest object: {}", e),
                Some(Box::new(e)),
            )
        })?;
        objects.push(object);
    }
    Ok(objects)
}
