use crate::{ControllerError, Result};
use async_trait::async_trait;
use rampart_core::{CheckState, Workload};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

/// Controller name of the built-in check that is always satisfied
pub const ALWAYS_READY_CONTROLLER: &str = "rampart.dev/always-ready";

/// What a check controller concluded for one workload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckVerdict {
    pub state: CheckState,
    pub message: String,
}

impl CheckVerdict {
    pub fn new(state: CheckState, message: impl Into<String>) -> Self {
        Self {
            state,
            message: message.into(),
        }
    }
}

/// Logic behind the AdmissionChecks naming one controller
#[async_trait]
pub trait CheckController: Send + Sync {
    /// Controller name AdmissionChecks refer to
    fn name(&self) -> &str;

    /// Evaluate check `check` for a reserved workload. `None` leaves the
    /// current state in place.
    async fn evaluate(&self, check: &str, workload: &Workload) -> Result<Option<CheckVerdict>>;
}

/// Marks every check it owns Ready
pub struct AlwaysReadyController;

#[async_trait]
impl CheckController for AlwaysReadyController {
    fn name(&self) -> &str {
        ALWAYS_READY_CONTROLLER
    }

    async fn evaluate(&self, _check: &str, _workload: &Workload) -> Result<Option<CheckVerdict>> {
        Ok(Some(CheckVerdict::new(CheckState::Ready, "Always ready")))
    }
}

/// In-process check controllers, keyed by controller name
#[derive(Default)]
pub struct CheckControllerRegistry {
    controllers: BTreeMap<String, Arc<dyn CheckController>>,
}

impl CheckControllerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in controllers
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.controllers.insert(
            ALWAYS_READY_CONTROLLER.to_string(),
            Arc::new(AlwaysReadyController),
        );
        registry
    }

    pub fn register(&mut self, controller: Arc<dyn CheckController>) -> Result<()> {
        let name = controller.name().to_string();
        if self.controllers.contains_key(&name) {
            return Err(ControllerError::duplicate_check_controller(name));
        }
        info!(controller = %name, "Registered check controller");
        self.controllers.insert(name, controller);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn CheckController>> {
        self.controllers.get(name).cloned()
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.controllers.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.controllers.keys().map(String::as_str)
    }
}
