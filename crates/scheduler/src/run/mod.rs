//! Execution lifecycle of a single benchmark attempt
//!
//! This module provides:
//! - [`Run`] - state machine driving one attempt from record creation to a
//!   terminal status
//! - [`RunConfig`] - configuration file bound to a run
//! - [`RunExecutor`] / [`LifecycleExecutor`] - one complete attempt, as the
//!   scheduler invokes it
//!
//! # State Machine
//!
//! ```text
//! ┌─────────┐  prepare   ┌──────────┐  execute  ┌─────────┐  ok    ┌──────────┐
//! │ Created │ ─────────► │ Prepared │ ────────► │ Started │ ─────► │ Finished │
//! └─────────┘            └──────────┘           └─────────┘        └──────────┘
//!                                                    │ error / timeout / panic
//!                                                    ▼
//!                                               ┌────────┐
//!                                               │ Failed │
//!                                               └────────┘
//! ```

mod config;
mod executor;
mod lifecycle;

use std::path::PathBuf;
use std::time::Duration;

pub use config::RunConfig;
pub use executor::{LifecycleExecutor, RunExecutor};
pub use lifecycle::{Run, STDERR_FILE, STDOUT_FILE};

use crate::infra::InfraError;
use crate::persistence::StoreError;

/// Default wall-clock budget of [`Run::execute`]
pub const DEFAULT_EXECUTION_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);

/// Lifecycle errors
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    /// Configuration could not be read or parsed
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Run record store failure
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Operation invoked before `prepare`
    #[error("run is not prepared")]
    NotPrepared,

    /// Working directory could not be created
    #[error("failed to create run directory {}: {source}", .path.display())]
    DirectoryCreateFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Infrastructure preparation failed
    #[error("infrastructure prepare failed: {0}")]
    InfraPrepareFailed(#[source] InfraError),

    /// Resource provisioning failed
    #[error("provisioning failed: {0}")]
    ProvisionFailed(#[source] InfraError),

    /// The workflow run failed or panicked
    #[error("run failed: {0}")]
    RunFailed(String),

    /// Execution exceeded its deadline
    #[error("execution timed out after {0:?}")]
    Timeout(Duration),

    /// Infrastructure clean up failed
    #[error("clean up failed: {0}")]
    CleanUpFailed(#[source] InfraError),

    /// I/O error on run outputs
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Error annotated with the lifecycle step it came from
    #[error("{step} step error: {source}")]
    Step {
        step: &'static str,
        #[source]
        source: Box<RunError>,
    },
}

impl RunError {
    /// Wrap this error with the step it happened in
    pub fn in_step(self, step: &'static str) -> Self {
        Self::Step {
            step,
            source: Box::new(self),
        }
    }

    /// Innermost error, skipping step annotations
    pub fn root(&self) -> &RunError {
        match self {
            Self::Step { source, .. } => source.root(),
            other => other,
        }
    }
}
