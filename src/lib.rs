//! Shepherd supervises fleets of coding-agent workers.
//!
//! Each feature gets a detached worker session, a git snapshot branch for
//! rollback, policy enforcement before and during execution, and
//! heartbeat/health scoring while it runs. The [`supervisor::WorkerSupervisor`]
//! ties the pieces together.

pub mod config;
pub mod conflict;
pub mod enforcement;
pub mod error;
pub mod health;
pub mod logging;
pub mod registry;
pub mod snapshot;
pub mod supervisor;

pub use config::SupervisorConfig;
pub use error::{RollbackError, SpawnError};
pub use registry::{Feature, FeatureRegistry, FeatureStatus, StateStore};
pub use supervisor::{SpawnResult, WorkerStatus, WorkerSupervisor};
