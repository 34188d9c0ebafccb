use super::{validate_base, Resource, ResourceError};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Named quota container for one or more resource flavors
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterQueue {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: ClusterQueueSpec,
    #[serde(default)]
    pub status: ClusterQueueStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterQueueSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cohort: Option<String>,
    #[serde(default)]
    pub resource_groups: Vec<ResourceGroup>,
    #[serde(default)]
    pub queueing_strategy: QueueingStrategy,
    #[serde(default)]
    pub preemption: PreemptionPolicy,
    #[serde(default)]
    pub flavor_fungibility: FlavorFungibility,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub admission_checks: Vec<String>,
}

/// A set of resources whose quotas are defined together, per flavor.
/// Flavor order is the preference order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceGroup {
    pub covered_resources: Vec<String>,
    pub flavors: Vec<FlavorQuotas>,
}

impl ResourceGroup {
    /// Structural checks that do not depend on other objects
    pub fn validate(&self) -> Result<(), ResourceError> {
        if self.covered_resources.is_empty() {
            return Err(ResourceError::ValidationFailed(
                "resource group must cover at least one resource".to_string(),
            ));
        }
        let covered: HashSet<&str> = self.covered_resources.iter().map(String::as_str).collect();
        for flavor in &self.flavors {
            for quota in &flavor.resources {
                if !covered.contains(quota.name.as_str()) {
                    return Err(ResourceError::ValidationFailed(format!(
                        "flavor {} sets quota for {} which the group does not cover",
                        flavor.name, quota.name
                    )));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlavorQuotas {
    pub name: String,
    pub resources: Vec<ResourceQuota>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceQuota {
    pub name: String,
    pub nominal_quota: Quantity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub borrowing_limit: Option<Quantity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lending_limit: Option<Quantity>,
}

impl ResourceQuota {
    pub fn new(name: impl Into<String>, nominal: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nominal_quota: Quantity(nominal.into()),
            borrowing_limit: None,
            lending_limit: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueingStrategy {
    /// The head blocks the queue until it is admitted
    StrictFIFO,
    /// Infeasible heads step aside so later workloads can be tried
    #[default]
    BestEffortFIFO,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreemptionPolicy {
    #[serde(default)]
    pub reclaim_within_cohort: ReclaimPolicy,
    #[serde(default)]
    pub within_cluster_queue: WithinClusterQueuePolicy,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReclaimPolicy {
    #[default]
    Never,
    LowerPriority,
    Any,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum WithinClusterQueuePolicy {
    #[default]
    Never,
    LowerPriority,
    LowerOrNewerEqualPriority,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlavorFungibility {
    #[serde(default)]
    pub when_can_borrow: WhenCanBorrow,
    #[serde(default)]
    pub when_can_preempt: WhenCanPreempt,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum WhenCanBorrow {
    #[default]
    Borrow,
    TryNextFlavor,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum WhenCanPreempt {
    Preempt,
    #[default]
    TryNextFlavor,
}

/// Observed state written back by the controller
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterQueueStatus {
    #[serde(default)]
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ClusterQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            metadata: ObjectMeta {
                name: Some(name.into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Cohort name, treating an empty string as no cohort
    pub fn cohort(&self) -> Option<&str> {
        self.spec.cohort.as_deref().filter(|c| !c.is_empty())
    }

    /// Every flavor name referenced by the resource groups
    pub fn flavor_names(&self) -> impl Iterator<Item = &str> {
        self.spec
            .resource_groups
            .iter()
            .flat_map(|g| g.flavors.iter().map(|f| f.name.as_str()))
    }
}

impl Resource for ClusterQueue {
    const KIND: &'static str = "ClusterQueue";
    const NAMESPACED: bool = false;

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn validate(&self) -> Result<(), ResourceError> {
        validate_base(&self.metadata, Self::NAMESPACED)?;
        for group in &self.spec.resource_groups {
            group.validate()?;
        }
        Ok(())
    }
}
