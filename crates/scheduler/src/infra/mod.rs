//! Infrastructure provider abstraction
//!
//! A provider prepares and provisions compute resources and runs the
//! benchmark workflow on them. Each run binds its own provider instance at
//! creation time through an [`InfraFactory`]; providers are never shared
//! across concurrent runs.
//!
//! This module provides:
//! - [`Infra`] - capability set every provider implements
//! - [`InfraFactory`] / [`DefaultInfraFactory`] - binds a provider to a run
//! - [`LocalInfra`] - runs the workflow on the local host

mod local;

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use local::LocalInfra;

/// Infrastructure errors
#[derive(Debug, thiserror::Error)]
pub enum InfraError {
    /// No provider registered for the configured kind
    #[error("unsupported infrastructure provider: {0}")]
    Unsupported(String),

    /// Preparation step failed
    #[error("prepare failed: {0}")]
    Prepare(String),

    /// Resource provisioning failed
    #[error("provision failed: {0}")]
    Provision(String),

    /// The workflow run failed
    #[error("run failed: {0}")]
    Run(String),

    /// Resource release failed
    #[error("clean up failed: {0}")]
    CleanUp(String),

    /// I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Provider configuration, as read from the run configuration file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfraConfig {
    /// Provider kind (e.g. "local")
    #[serde(default = "default_kind")]
    pub kind: String,

    /// Provider-specific settings
    #[serde(default, flatten)]
    pub settings: HashMap<String, serde_json::Value>,
}

fn default_kind() -> String {
    LocalInfra::NAME.to_string()
}

impl Default for InfraConfig {
    fn default() -> Self {
        Self {
            kind: default_kind(),
            settings: HashMap::new(),
        }
    }
}

impl InfraConfig {
    /// Read a string list setting
    pub fn string_list(&self, key: &str) -> Option<Vec<String>> {
        self.settings.get(key)?.as_array().map(|values| {
            values
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
    }
}

/// Workflow the provider runs once resources are provisioned
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Program executing the workflow
    #[serde(default = "default_command")]
    pub command: String,

    /// Playbooks passed to the program, in order
    #[serde(default)]
    pub playbooks: Vec<String>,

    /// Inventory file
    #[serde(default)]
    pub inventory: Option<String>,

    /// Directory the program runs in
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// Variables handed to the workflow
    #[serde(default)]
    pub extra_vars: serde_json::Map<String, serde_json::Value>,

    /// File receiving the workflow's standard output
    #[serde(skip)]
    pub stdout_path: Option<PathBuf>,

    /// File receiving the workflow's standard error
    #[serde(skip)]
    pub stderr_path: Option<PathBuf>,
}

fn default_command() -> String {
    "ansible-playbook".to_string()
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            command: default_command(),
            playbooks: vec![],
            inventory: None,
            working_dir: None,
            extra_vars: serde_json::Map::new(),
            stdout_path: None,
            stderr_path: None,
        }
    }
}

impl WorkflowConfig {
    /// Set the command
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = command.into();
        self
    }

    /// Add a playbook
    pub fn with_playbook(mut self, playbook: impl Into<String>) -> Self {
        self.playbooks.push(playbook.into());
        self
    }

    /// Set a workflow variable
    pub fn set_var(&mut self, key: &str, value: impl Into<serde_json::Value>) {
        self.extra_vars.insert(key.to_string(), value.into());
    }
}

/// Capability set of an infrastructure provider
///
/// The provider is owned by a single run; methods take `&mut self`.
#[async_trait]
pub trait Infra: Send + Sync {
    /// Provider name
    fn name(&self) -> &str;

    /// Apply provider configuration
    fn set_config(&mut self, config: InfraConfig);

    /// Bind the run id the provider works for
    fn set_exec_uuid(&mut self, id: Uuid);

    /// Attach tags to provisioned resources
    fn set_tags(&mut self, tags: HashMap<String, String>);

    /// Prepare the provider (credentials, local tooling)
    async fn prepare(&mut self) -> Result<(), InfraError>;

    /// Provision compute resources, returning the addresses of the hosts
    async fn provision(&mut self) -> Result<Vec<String>, InfraError>;

    /// Run the workflow on the provisioned resources
    async fn run(&mut self, workflow: &WorkflowConfig) -> Result<(), InfraError>;

    /// Release resources held only during execution. Safe to call repeatedly.
    async fn clean_up(&mut self) -> Result<(), InfraError>;
}

/// Builds a provider for a run
pub trait InfraFactory: Send + Sync {
    fn create(&self, config: &InfraConfig) -> Result<Box<dyn Infra>, InfraError>;
}

/// Factory resolving the built-in providers by kind
#[derive(Debug, Clone, Default)]
pub struct DefaultInfraFactory;

impl InfraFactory for DefaultInfraFactory {
    fn create(&self, config: &InfraConfig) -> Result<Box<dyn Infra>, InfraError> {
        match config.kind.as_str() {
            LocalInfra::NAME => Ok(Box::new(LocalInfra::new())),
            other => Err(InfraError::Unsupported(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_factory() {
        let factory = DefaultInfraFactory;
        let infra = factory.create(&InfraConfig::default()).unwrap();
        assert_eq!(infra.name(), "local");

        let config = InfraConfig {
            kind: "equinix".to_string(),
            settings: HashMap::new(),
        };
        assert!(matches!(
            factory.create(&config),
            Err(InfraError::Unsupported(kind)) if kind == "equinix"
        ));
    }

    #[test]
    fn test_infra_config_from_toml() {
        let config: InfraConfig = toml::from_str(
            r#"
            kind = "local"
            hosts = ["10.0.0.1", "10.0.0.2"]
            "#,
        )
        .unwrap();
        assert_eq!(config.kind, "local");
        assert_eq!(
            config.string_list("hosts"),
            Some(vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()])
        );
        assert_eq!(config.string_list("missing"), None);
    }

    #[test]
    fn test_workflow_defaults() {
        let workflow: WorkflowConfig = toml::from_str("playbooks = [\"full.yml\"]").unwrap();
        assert_eq!(workflow.command, "ansible-playbook");
        assert_eq!(workflow.playbooks, vec!["full.yml"]);
        assert!(workflow.extra_vars.is_empty());
    }
}
