use super::{validate_base, Resource, ResourceError};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// An external gating condition required before admission
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdmissionCheck {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: AdmissionCheckSpec,
    #[serde(default)]
    pub status: AdmissionCheckStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionCheckSpec {
    /// Name of the controller that evaluates this check
    pub controller_name: String,
    #[serde(default)]
    pub retry_policy: CheckRetryPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CheckRetryPolicy {
    /// Whether a Rejected state requeues the workload instead of deactivating it
    pub retryable: bool,
    pub base_delay_seconds: u64,
    pub max_delay_seconds: u64,
}

impl Default for CheckRetryPolicy {
    fn default() -> Self {
        Self {
            retryable: false,
            base_delay_seconds: 10,
            max_delay_seconds: 600,
        }
    }
}

impl CheckRetryPolicy {
    /// Delay before requeue attempt `attempt` (1-based):
    /// base·2^(attempt−1), capped at the max delay
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let delay = self
            .base_delay_seconds
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_seconds);
        Duration::from_secs(delay)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionCheckStatus {
    #[serde(default)]
    pub active: bool,
}

impl AdmissionCheck {
    pub fn new(name: impl Into<String>, controller_name: impl Into<String>) -> Self {
        Self {
            metadata: ObjectMeta {
                name: Some(name.into()),
                ..Default::default()
            },
            spec: AdmissionCheckSpec {
                controller_name: controller_name.into(),
                retry_policy: CheckRetryPolicy::default(),
            },
            status: AdmissionCheckStatus::default(),
        }
    }
}

impl Resource for AdmissionCheck {
    const KIND: &'static str = "AdmissionCheck";
    const NAMESPACED: bool = false;

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn validate(&self) -> Result<(), ResourceError> {
        validate_base(&self.metadata, Self::NAMESPACED)?;
        if self.spec.controller_name.is_empty() {
            return Err(ResourceError::MissingField("spec.controllerName".to_string()));
        }
        Ok(())
    }
}
