//! One complete execution attempt

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use super::{Run, RunError, DEFAULT_EXECUTION_TIMEOUT};
use crate::identifier::RunIdentifier;
use crate::infra::{DefaultInfraFactory, InfraFactory};
use crate::persistence::RunStore;

/// Executes a single attempt for an identifier
///
/// The scheduler calls this once per attempt; retries are the scheduler's
/// concern.
#[async_trait]
pub trait RunExecutor: Send + Sync + 'static {
    async fn execute(&self, identifier: &RunIdentifier, config_path: &Path)
        -> Result<(), RunError>;
}

/// Executor driving a [`Run`] through its whole lifecycle
///
/// create -> prepare -> outputs -> execute -> clean up, then `success` on
/// every path where the run was created.
pub struct LifecycleExecutor {
    store: Arc<dyn RunStore>,
    infra_factory: Arc<dyn InfraFactory>,
    deadline: Duration,
}

impl LifecycleExecutor {
    pub fn new(store: Arc<dyn RunStore>) -> Self {
        Self {
            store,
            infra_factory: Arc::new(DefaultInfraFactory),
            deadline: DEFAULT_EXECUTION_TIMEOUT,
        }
    }

    /// Set the provider factory
    pub fn with_infra_factory(mut self, factory: Arc<dyn InfraFactory>) -> Self {
        self.infra_factory = factory;
        self
    }

    /// Set the execution deadline
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    async fn drive(&self, run: &mut Run) -> Result<(), RunError> {
        run.prepare().await.map_err(|e| e.in_step("prepare"))?;
        run.set_output_to_default_path()
            .await
            .map_err(|e| e.in_step("prepare"))?;

        let executed = run
            .execute(self.deadline)
            .await
            .map_err(|e| e.in_step("execution"));
        let cleaned = run.clean_up().await.map_err(|e| e.in_step("clean up"));

        executed?;
        cleaned
    }
}

#[async_trait]
impl RunExecutor for LifecycleExecutor {
    async fn execute(
        &self,
        identifier: &RunIdentifier,
        config_path: &Path,
    ) -> Result<(), RunError> {
        let mut run = Run::create(
            identifier.clone(),
            config_path,
            self.store.clone(),
            self.infra_factory.as_ref(),
        )
        .await
        .map_err(|e| e.in_step("create"))?;

        let result = self.drive(&mut run).await;

        if let Err(e) = run.success().await {
            warn!(run_id = %run.id(), error = %e, "Failed to finalize run");
        }

        match &result {
            Ok(()) => info!(run_id = %run.id(), identifier = %identifier, "Run succeeded"),
            Err(e) => warn!(run_id = %run.id(), identifier = %identifier, error = %e, "Run failed"),
        }
        result
    }
}
