//! Run state machine

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::task::{AbortHandle, JoinError};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::{RunConfig, RunError};
use crate::identifier::{RunIdentifier, RunStatus};
use crate::infra::{Infra, InfraError, InfraFactory, WorkflowConfig};
use crate::persistence::{RunRecord, RunStore};

/// Standard output of the workflow, inside the run directory
pub const STDOUT_FILE: &str = "exec-stdout.log";
/// Standard error of the workflow, inside the run directory
pub const STDERR_FILE: &str = "exec-stderr.log";

/// Configuration file written to the run directory when the run was
/// created from an in-memory configuration
const RESOLVED_CONFIG_FILE: &str = "run-config.toml";

// Workflow variables identifying the run
const KEY_EXEC_UUID: &str = "benchrun_exec_uuid";
const KEY_SOURCE: &str = "benchrun_source";
const KEY_GIT_REF: &str = "benchrun_git_ref";
const KEY_PLANNER_VERSION: &str = "benchrun_planner_version";
const KEY_PULL_NB: &str = "benchrun_pull_nb";
const KEY_HOSTS: &str = "benchrun_hosts";
const KEY_CONFIG_PATH: &str = "benchrun_config_path";

/// One attempt to execute a benchmark
///
/// A `Run` is owned by the task driving it. The record store is updated as
/// a side channel at every status change.
///
/// # Example
///
/// ```ignore
/// let mut run = Run::create(identifier, &config_path, store, &DefaultInfraFactory).await?;
/// run.prepare().await?;
/// run.set_output_to_default_path().await?;
/// let result = run.execute(DEFAULT_EXECUTION_TIMEOUT).await;
/// run.clean_up().await?;
/// run.success().await?;
/// ```
pub struct Run {
    id: Uuid,
    identifier: RunIdentifier,
    status: RunStatus,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    config: RunConfig,
    config_path: Option<PathBuf>,
    dir_path: Option<PathBuf>,
    stdout: Option<File>,
    stderr: Option<File>,
    workflow: WorkflowConfig,
    infra: Arc<Mutex<Box<dyn Infra>>>,
    store: Arc<dyn RunStore>,
    prepared: bool,
}

impl std::fmt::Debug for Run {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Run")
            .field("id", &self.id)
            .field("identifier", &self.identifier)
            .field("status", &self.status)
            .field("dir_path", &self.dir_path)
            .field("prepared", &self.prepared)
            .finish_non_exhaustive()
    }
}

impl Run {
    /// Create a run from the configuration file at `config_path`
    pub async fn create(
        identifier: RunIdentifier,
        config_path: &Path,
        store: Arc<dyn RunStore>,
        infra_factory: &dyn InfraFactory,
    ) -> Result<Self, RunError> {
        let config = RunConfig::from_file(config_path)?;
        let mut run = Self::create_with_config(identifier, config, store, infra_factory).await?;
        run.config_path = Some(config_path.to_path_buf());
        Ok(run)
    }

    /// Create a run from an already loaded configuration
    ///
    /// Binds a fresh infrastructure provider, inserts the record with
    /// status [`RunStatus::Created`] and tags the provider.
    #[instrument(skip_all, fields(identifier = %identifier))]
    pub async fn create_with_config(
        identifier: RunIdentifier,
        config: RunConfig,
        store: Arc<dyn RunStore>,
        infra_factory: &dyn InfraFactory,
    ) -> Result<Self, RunError> {
        let id = Uuid::now_v7();

        let mut infra = infra_factory
            .create(&config.infra)
            .map_err(|e| RunError::ConfigInvalid(e.to_string()))?;
        infra.set_config(config.infra.clone());
        infra.set_exec_uuid(id);

        let record = RunRecord::created(id, &identifier);
        store.insert(&record).await?;

        infra.set_tags(HashMap::from([
            (
                "execution_git_ref".to_string(),
                identifier.short_ref().to_string(),
            ),
            ("execution_source".to_string(), identifier.source.clone()),
        ]));

        debug!(run_id = %id, infra = infra.name(), "created run");

        Ok(Self {
            id,
            identifier,
            status: RunStatus::Created,
            created_at: record.created_at,
            started_at: None,
            finished_at: None,
            workflow: config.workflow.clone(),
            config,
            config_path: None,
            dir_path: None,
            stdout: None,
            stderr: None,
            infra: Arc::new(Mutex::new(infra)),
            store,
            prepared: false,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn identifier(&self) -> &RunIdentifier {
        &self.identifier
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared
    }

    /// Unique directory holding the run's logs and artifacts
    pub fn dir_path(&self) -> Option<&Path> {
        self.dir_path.as_deref()
    }

    /// Configuration file the workflow receives
    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// Workflow as it will be handed to the provider
    pub fn workflow(&self) -> &WorkflowConfig {
        &self.workflow
    }

    /// Prepare the run for execution
    ///
    /// Idempotent. Creates the run directory, prepares the provider and
    /// resolves the configuration path if unset.
    #[instrument(skip(self), fields(run_id = %self.id))]
    pub async fn prepare(&mut self) -> Result<(), RunError> {
        if self.prepared {
            return Ok(());
        }

        let dir = self.config.root_dir.join(self.id.to_string());
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| RunError::DirectoryCreateFailed {
                path: dir.clone(),
                source,
            })?;
        self.dir_path = Some(dir.clone());

        self.infra
            .lock()
            .await
            .prepare()
            .await
            .map_err(RunError::InfraPrepareFailed)?;

        if self.config_path.is_none() {
            let path = dir.join(RESOLVED_CONFIG_FILE);
            tokio::fs::write(&path, self.config.to_toml_string()?).await?;
            self.config_path = Some(path);
        }

        self.workflow.extra_vars = self.config.workflow.extra_vars.clone();
        self.prepared = true;
        debug!(dir = %dir.display(), "prepared run");
        Ok(())
    }

    /// Route workflow output to `exec-stdout.log` / `exec-stderr.log`
    /// inside the run directory, creating them if needed
    pub async fn set_output_to_default_path(&mut self) -> Result<(), RunError> {
        let dir = match (&self.dir_path, self.prepared) {
            (Some(dir), true) => dir.clone(),
            _ => return Err(RunError::NotPrepared),
        };

        let stdout_path = dir.join(STDOUT_FILE);
        let stderr_path = dir.join(STDERR_FILE);
        self.stdout = Some(open_log(&stdout_path).await?);
        self.stderr = Some(open_log(&stderr_path).await?);
        self.workflow.stdout_path = Some(stdout_path);
        self.workflow.stderr_path = Some(stderr_path);
        Ok(())
    }

    /// Provision resources and run the workflow under `deadline`
    ///
    /// Requires [`Run::prepare`]. Once the status moved to Started, the
    /// terminal status (Finished or Failed) is recorded on every exit path,
    /// including timeouts and a panicking workflow.
    #[instrument(skip(self), fields(run_id = %self.id, git_ref = %self.identifier.git_ref))]
    pub async fn execute(&mut self, deadline: Duration) -> Result<(), RunError> {
        if !self.prepared {
            return Err(RunError::NotPrepared);
        }

        self.transition(RunStatus::Started).await?;
        self.log_line(&format!(
            "[benchrun] run {} started for {}",
            self.id, self.identifier
        ))
        .await;

        let result = match tokio::time::timeout(deadline, self.provision_and_run()).await {
            Ok(result) => result,
            Err(_) => Err(RunError::Timeout(deadline)),
        };

        let terminal = if result.is_ok() {
            RunStatus::Finished
        } else {
            RunStatus::Failed
        };
        let recorded = self.transition(terminal).await;

        match (result, recorded) {
            (Ok(()), recorded) => recorded,
            (Err(e), Ok(())) => {
                self.log_line(&format!("[benchrun] run {} failed: {e}", self.id))
                    .await;
                Err(e)
            }
            (Err(e), Err(store_err)) => {
                error!(error = %store_err, "Failed to record terminal status");
                Err(e)
            }
        }
    }

    /// Release resources held only during execution
    pub async fn clean_up(&mut self) -> Result<(), RunError> {
        self.infra
            .lock()
            .await
            .clean_up()
            .await
            .map_err(RunError::CleanUpFailed)
    }

    /// Finalize the attempt: flush outputs and log the final state
    ///
    /// Called regardless of the execution outcome.
    pub async fn success(&mut self) -> Result<(), RunError> {
        for file in [self.stdout.as_mut(), self.stderr.as_mut()]
            .into_iter()
            .flatten()
        {
            file.flush().await?;
            file.sync_all().await?;
        }

        if self.status.is_terminal() {
            info!(
                run_id = %self.id,
                status = %self.status,
                git_ref = %self.identifier.git_ref,
                benchmark_type = %self.identifier.benchmark_type,
                "Run finalized"
            );
        } else {
            warn!(run_id = %self.id, status = %self.status, "Run finalized before completion");
        }
        Ok(())
    }

    async fn provision_and_run(&mut self) -> Result<(), RunError> {
        // Provider calls run on their own tasks so a panicking provider fails
        // the run instead of unwinding through the caller.
        let infra = Arc::clone(&self.infra);
        let handle = tokio::spawn(async move { infra.lock().await.provision().await });
        let _provision_guard = AbortOnDrop(handle.abort_handle());
        let hosts = handle
            .await
            .map_err(|e| {
                RunError::ProvisionFailed(InfraError::Provision(join_failure("provisioning", e)))
            })?
            .map_err(RunError::ProvisionFailed)?;

        self.workflow.set_var(KEY_EXEC_UUID, self.id.to_string());
        self.workflow.set_var(KEY_SOURCE, self.identifier.source.clone());
        self.workflow.set_var(KEY_GIT_REF, self.identifier.git_ref.clone());
        self.workflow
            .set_var(KEY_PLANNER_VERSION, self.identifier.planner_version.clone());
        self.workflow.set_var(KEY_PULL_NB, self.identifier.pull_nb);
        self.workflow.set_var(KEY_HOSTS, hosts);
        if let Some(path) = &self.config_path {
            self.workflow
                .set_var(KEY_CONFIG_PATH, path.display().to_string());
        }

        let infra = Arc::clone(&self.infra);
        let workflow = self.workflow.clone();
        let handle = tokio::spawn(async move { infra.lock().await.run(&workflow).await });
        let _run_guard = AbortOnDrop(handle.abort_handle());
        handle
            .await
            .map_err(|e| RunError::RunFailed(join_failure("workflow", e)))?
            .map_err(|e| RunError::RunFailed(e.to_string()))
    }

    async fn transition(&mut self, status: RunStatus) -> Result<(), RunError> {
        let now = Utc::now();
        self.store.update_status(self.id, status, now).await?;
        self.status = status;
        match status {
            RunStatus::Started => self.started_at = Some(now),
            RunStatus::Finished | RunStatus::Failed => self.finished_at = Some(now),
            RunStatus::Created => {}
        }
        Ok(())
    }

    async fn log_line(&mut self, line: &str) {
        if let Some(stdout) = self.stdout.as_mut() {
            if let Err(e) = stdout.write_all(format!("{line}\n").as_bytes()).await {
                warn!(error = %e, "Failed to write run log");
            }
        }
    }
}

/// Aborts a provider task if the execution future is dropped (deadline)
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn join_failure(step: &str, err: JoinError) -> String {
    if err.is_panic() {
        format!("{step} panicked")
    } else {
        err.to_string()
    }
}

async fn open_log(path: &Path) -> Result<File, RunError> {
    Ok(OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?)
}
