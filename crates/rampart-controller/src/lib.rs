//! Rampart Controller - watch-driven reconcilers around the scheduler
//!
//! This crate provides:
//! - The [`Informer`] feeding store events into the cache and queue manager
//! - The [`AdmissionCheckCoordinator`] turning check states into admission
//!   or eviction
//! - A registry of in-process check controllers and the [`CheckRunner`]
//!   that drives them
//! - A periodic usage [`Reporter`]

pub mod check_runner;
pub mod coordinator;
pub mod error;
pub mod informer;
pub mod registry;
pub mod reporter;
pub mod watch;

// Re-export commonly used types
pub use check_runner::CheckRunner;
pub use coordinator::{decide, AdmissionCheckCoordinator, CheckDecision, CoordinatorConfig, Requeue};
pub use error::{ControllerError, Result};
pub use informer::Informer;
pub use registry::{
    AlwaysReadyController, CheckController, CheckControllerRegistry, CheckVerdict,
    ALWAYS_READY_CONTROLLER,
};
pub use reporter::{Reporter, ReporterConfig};
pub use watch::{run_watch, EventHandler};
