//! Environment files and engine settings.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::descriptor::ResourceDescriptor;
use crate::error::OrchestratorError;
use crate::registry::Registry;
use crate::retry::RetryPolicy;

/// Default number of resources processed concurrently.
pub const DEFAULT_MAX_PARALLEL: usize = 4;

/// Default number of consecutive transient probe errors tolerated.
pub const DEFAULT_PROBE_FAILURE_TOLERANCE: u32 = 3;

/// Knobs shared by every orchestrator in a run.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    /// Retry policy for create and delete calls.
    pub retry: RetryPolicy,
    /// Upper bound on concurrently processed resources.
    pub max_parallel: usize,
    /// Consecutive transient probe errors tolerated while polling.
    pub probe_failure_tolerance: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            max_parallel: DEFAULT_MAX_PARALLEL,
            probe_failure_tolerance: DEFAULT_PROBE_FAILURE_TOLERANCE,
        }
    }
}

fn default_max_parallel() -> usize {
    DEFAULT_MAX_PARALLEL
}

fn default_probe_failure_tolerance() -> u32 {
    DEFAULT_PROBE_FAILURE_TOLERANCE
}

/// A declared test environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Environment {
    /// Environment name; also names the state file.
    pub name: String,
    /// Upper bound on concurrently processed resources.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// Consecutive transient probe errors tolerated while polling.
    #[serde(default = "default_probe_failure_tolerance")]
    pub probe_failure_tolerance: u32,
    /// Retry policy for create and delete calls.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Managed resources, in declaration order.
    #[serde(default)]
    pub resources: Vec<ResourceDescriptor>,
}

impl Environment {
    /// Load an environment file. `.json` files are parsed as JSON, anything
    /// else as YAML.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, does not parse, or has an
    /// unusable name.
    pub fn load(path: &Path) -> Result<Self, OrchestratorError> {
        let content = std::fs::read_to_string(path).map_err(|source| OrchestratorError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));

        let environment: Self = if is_json {
            serde_json::from_str(&content).map_err(|e| OrchestratorError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?
        } else {
            serde_yaml::from_str(&content).map_err(|e| OrchestratorError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?
        };

        if !is_valid_name(&environment.name) {
            return Err(OrchestratorError::Parse {
                path: path.to_path_buf(),
                message: format!(
                    "invalid environment name '{}': use letters, digits, '-', '_' or '.'",
                    environment.name
                ),
            });
        }

        debug!(
            path = %path.display(),
            environment = %environment.name,
            resources = environment.resources.len(),
            "Loaded environment file"
        );
        Ok(environment)
    }

    /// Validate the resources and build their registry.
    ///
    /// # Errors
    ///
    /// Returns an error for an empty environment, duplicate ids, unknown
    /// dependencies, or a dependency cycle.
    pub fn registry(&self) -> Result<Registry, OrchestratorError> {
        if self.resources.is_empty() {
            return Err(OrchestratorError::EmptyEnvironment(self.name.clone()));
        }
        Registry::new(self.resources.clone())
    }

    /// Engine settings for this environment.
    #[must_use]
    pub fn settings(&self) -> EngineSettings {
        EngineSettings {
            retry: self.retry.clone(),
            max_parallel: self.max_parallel.max(1),
            probe_failure_tolerance: self.probe_failure_tolerance,
        }
    }
}

/// Names end up in file names, so keep them to a portable character set.
fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}
