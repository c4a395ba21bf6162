//! Local host provider
//!
//! Runs the workflow program directly on the machine hosting the worker.
//! Provisioning returns the configured `hosts` (default `127.0.0.1`).

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::fs::OpenOptions;
use tokio::process::Command;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::{Infra, InfraConfig, InfraError, WorkflowConfig};

/// Provider executing the workflow on the local host
#[derive(Debug, Default)]
pub struct LocalInfra {
    config: InfraConfig,
    exec_uuid: Option<Uuid>,
    tags: HashMap<String, String>,
    prepared: bool,
}

impl LocalInfra {
    pub const NAME: &'static str = "local";

    pub fn new() -> Self {
        Self::default()
    }

    /// Tags attached by the owning run
    pub fn tags(&self) -> &HashMap<String, String> {
        &self.tags
    }

    async fn output(path: Option<&Path>) -> Result<Stdio, InfraError> {
        match path {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .await?;
                Ok(Stdio::from(file.into_std().await))
            }
            None => Ok(Stdio::inherit()),
        }
    }
}

#[async_trait]
impl Infra for LocalInfra {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn set_config(&mut self, config: InfraConfig) {
        self.config = config;
    }

    fn set_exec_uuid(&mut self, id: Uuid) {
        self.exec_uuid = Some(id);
    }

    fn set_tags(&mut self, tags: HashMap<String, String>) {
        self.tags = tags;
    }

    async fn prepare(&mut self) -> Result<(), InfraError> {
        if self.exec_uuid.is_none() {
            return Err(InfraError::Prepare("exec uuid is not set".to_string()));
        }
        self.prepared = true;
        Ok(())
    }

    async fn provision(&mut self) -> Result<Vec<String>, InfraError> {
        if !self.prepared {
            return Err(InfraError::Provision("infra is not prepared".to_string()));
        }
        let hosts = self
            .config
            .string_list("hosts")
            .filter(|hosts| !hosts.is_empty())
            .unwrap_or_else(|| vec!["127.0.0.1".to_string()]);
        debug!(?hosts, "provisioned local hosts");
        Ok(hosts)
    }

    #[instrument(skip(self, workflow), fields(exec_uuid = ?self.exec_uuid))]
    async fn run(&mut self, workflow: &WorkflowConfig) -> Result<(), InfraError> {
        let extra_vars = serde_json::to_string(&workflow.extra_vars)
            .map_err(|e| InfraError::Run(format!("invalid extra vars: {e}")))?;

        let mut command = Command::new(&workflow.command);
        if let Some(inventory) = &workflow.inventory {
            command.arg("-i").arg(inventory);
        }
        command.arg("--extra-vars").arg(extra_vars);
        command.args(&workflow.playbooks);
        if let Some(dir) = &workflow.working_dir {
            command.current_dir(dir);
        }
        command
            .stdin(Stdio::null())
            .stdout(Self::output(workflow.stdout_path.as_deref()).await?)
            .stderr(Self::output(workflow.stderr_path.as_deref()).await?)
            .kill_on_drop(true);

        info!(command = %workflow.command, playbooks = ?workflow.playbooks, "Running workflow");

        let status = command
            .status()
            .await
            .map_err(|e| InfraError::Run(format!("failed to spawn {}: {e}", workflow.command)))?;

        if !status.success() {
            return Err(InfraError::Run(format!(
                "{} exited with {status}",
                workflow.command
            )));
        }
        Ok(())
    }

    async fn clean_up(&mut self) -> Result<(), InfraError> {
        self.prepared = false;
        Ok(())
    }
}
