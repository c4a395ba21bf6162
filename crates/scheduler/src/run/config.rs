//! Run configuration file

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::RunError;
use crate::infra::{InfraConfig, WorkflowConfig};

/// Configuration bound to a run, loaded from a TOML file
///
/// ```toml
/// root_dir = "/var/lib/benchrun/runs"
///
/// [infra]
/// kind = "local"
///
/// [workflow]
/// command = "ansible-playbook"
/// playbooks = ["full.yml"]
/// inventory = "inventory.yml"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Parent directory of the per-run directories
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,

    /// Infrastructure provider settings
    #[serde(default)]
    pub infra: InfraConfig,

    /// Workflow executed by the provider
    #[serde(default)]
    pub workflow: WorkflowConfig,
}

fn default_root_dir() -> PathBuf {
    std::env::temp_dir().join("benchrun")
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            infra: InfraConfig::default(),
            workflow: WorkflowConfig::default(),
        }
    }
}

impl RunConfig {
    /// Load the configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, RunError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            RunError::ConfigInvalid(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
            .map_err(|e| RunError::ConfigInvalid(format!("{}: {e}", path.display())))
    }

    /// Parse the configuration from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self, RunError> {
        toml::from_str(content).map_err(|e| RunError::ConfigInvalid(e.to_string()))
    }

    /// Render the configuration back to TOML
    pub fn to_toml_string(&self) -> Result<String, RunError> {
        toml::to_string(self).map_err(|e| RunError::ConfigInvalid(e.to_string()))
    }

    /// Set the root directory
    pub fn with_root_dir(mut self, root_dir: impl Into<PathBuf>) -> Self {
        self.root_dir = root_dir.into();
        self
    }

    /// Set the workflow
    pub fn with_workflow(mut self, workflow: WorkflowConfig) -> Self {
        self.workflow = workflow;
        self
    }

    /// Set the infrastructure settings
    pub fn with_infra(mut self, infra: InfraConfig) -> Self {
        self.infra = infra;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let config = RunConfig::from_toml_str(
            r#"
            root_dir = "/tmp/runs"

            [infra]
            kind = "local"

            [workflow]
            command = "ansible-playbook"
            playbooks = ["full.yml", "report.yml"]
            inventory = "inventory.yml"

            [workflow.extra_vars]
            vitess_branch = "main"
            "#,
        )
        .unwrap();

        assert_eq!(config.root_dir, PathBuf::from("/tmp/runs"));
        assert_eq!(config.infra.kind, "local");
        assert_eq!(config.workflow.playbooks.len(), 2);
        assert_eq!(config.workflow.inventory.as_deref(), Some("inventory.yml"));
        assert_eq!(config.workflow.extra_vars["vitess_branch"], "main");
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = RunConfig::from_toml_str("").unwrap();
        assert_eq!(config, RunConfig::default());
    }

    #[test]
    fn test_invalid_config() {
        let result = RunConfig::from_toml_str("root_dir = [1, 2");
        assert!(matches!(result, Err(RunError::ConfigInvalid(_))));

        let result = RunConfig::from_file(Path::new("/nonexistent/benchrun.toml"));
        assert!(matches!(result, Err(RunError::ConfigInvalid(_))));
    }

    #[test]
    fn test_round_trip_through_toml() {
        let config = RunConfig::default().with_root_dir("/srv/runs");
        let rendered = config.to_toml_string().unwrap();
        assert_eq!(RunConfig::from_toml_str(&rendered).unwrap(), config);
    }
}
