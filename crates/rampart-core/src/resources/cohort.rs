use super::{validate_base, Resource, ResourceError, ResourceGroup};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};

/// A borrow/lend pool shared by ClusterQueues.
///
/// A cohort exists implicitly as soon as a ClusterQueue names it. An explicit
/// Cohort object only contributes its own quota to the pool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cohort {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: CohortSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CohortSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource_groups: Vec<ResourceGroup>,
}

impl Cohort {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            metadata: ObjectMeta {
                name: Some(name.into()),
                ..Default::default()
            },
            spec: CohortSpec::default(),
        }
    }
}

impl Resource for Cohort {
    const KIND: &'static str = "Cohort";
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
