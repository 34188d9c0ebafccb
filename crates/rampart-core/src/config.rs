//! YAML configuration file model.
//!
//! Every field has a default, so an empty file (or no file) is valid. The
//! binary maps these settings onto the per-component config structs.

use crate::{RampartError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Configuration {
    pub scheduler: SchedulerSettings,
    pub queueing: QueueingSettings,
    pub admission_checks: AdmissionCheckSettings,
    /// Capacity of the watch broadcast channel
    pub event_bus_capacity: usize,
    /// Seconds between usage/pending reports; 0 disables the reporter
    pub report_interval_seconds: u64,
    /// Seconds to wait for tasks to stop after shutdown is requested
    pub shutdown_timeout_seconds: u64,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            scheduler: SchedulerSettings::default(),
            queueing: QueueingSettings::default(),
            admission_checks: AdmissionCheckSettings::default(),
            event_bus_capacity: 4096,
            report_interval_seconds: 30,
            shutdown_timeout_seconds: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SchedulerSettings {
    /// Quiet period after a queue change before a cycle starts
    pub debounce_millis: u64,
    /// Fallback cycle interval
    pub interval_millis: u64,
    /// Cycles a queue may be passed over before it jumps the line
    pub starvation_threshold: u32,
    /// Name of the cross-queue ordering policy
    pub ordering: String,
    /// Attempts per commit write before rolling back
    pub commit_retries: u32,
    pub commit_retry_base_millis: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            debounce_millis: 20,
            interval_millis: 1000,
            starvation_threshold: 8,
            ordering: "PriorityThenFairness".to_string(),
            commit_retries: 3,
            commit_retry_base_millis: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueingSettings {
    pub backoff_base_millis: u64,
    pub backoff_max_millis: u64,
    /// Fraction of the delay added as random jitter
    pub backoff_jitter: f64,
}

impl Default for QueueingSettings {
    fn default() -> Self {
        Self {
            backoff_base_millis: 1000,
            backoff_max_millis: 60_000,
            backoff_jitter: 0.1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AdmissionCheckSettings {
    /// Whether the built-in always-ready controller is registered
    pub enable_always_ready: bool,
    /// Attempts per status write before giving up
    pub write_retries: u32,
    /// Fallback re-reconcile interval for reserved workloads
    pub resync_seconds: u64,
}

impl Default for AdmissionCheckSettings {
    fn default() -> Self {
        Self {
            enable_always_ready: true,
            write_retries: 3,
            resync_seconds: 30,
        }
    }
}

impl Configuration {
    /// Parse a configuration document
    pub fn from_yaml_str(data: &str) -> Result<Self> {
        if data.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(data)
            .map_err(|e| RampartError::config_error(format!("Invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|e| {
            RampartError::config_error(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&data)
    }

    fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.queueing.backoff_jitter) {
            return Err(RampartError::config_error(format!(
                "queueing.backoffJitter must be within [0, 1], got {}",
                self.queueing.backoff_jitter
            )));
        }
        if self.queueing.backoff_base_millis > self.queueing.backoff_max_millis {
            return Err(RampartError::config_error(
                "queueing.backoffBaseMillis must not exceed queueing.backoffMaxMillis",
            ));
        }
        if self.event_bus_capacity == 0 {
            return Err(RampartError::config_error(
                "eventBusCapacity must be greater than zero",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_empty_is_default() {
        assert_eq!(Configuration::from_yaml_str("").unwrap(), Configuration::default());
    }

    #[test]
    fn test_partial_override() {
        let config = Configuration::from_yaml_str(
            "scheduler:\n  ordering: RoundRobin\n  starvationThreshold: 3\neventBusCapacity: 128\n",
        )
        .unwrap();
        assert_eq!(config.scheduler.ordering, "RoundRobin");
        assert_eq!(config.scheduler.starvation_threshold, 3);
        assert_eq!(config.scheduler.commit_retries, 3);
        assert_eq!(config.event_bus_capacity, 128);
        assert_eq!(config.queueing, QueueingSettings::default());
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(Configuration::from_yaml_str("queueing:\n  backoffJitter: 2.0\n").is_err());
        assert!(Configuration::from_yaml_str("eventBusCapacity: 0\n").is_err());
        assert!(Configuration::from_yaml_str("scheduler: [1, 2]\n").is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "reportIntervalSeconds: 5").unwrap();
        let config = Configuration::from_yaml_file(file.path()).unwrap();
        assert_eq!(config.report_interval_seconds, 5);

        assert!(Configuration::from_yaml_file("/nonexistent/rampart.yaml").is_err());
    }
}
