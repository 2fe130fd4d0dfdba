//! Error taxonomy for lifecycle orchestration.
//!
//! Controller failures are classified as transient or permanent so the
//! retrier can tell "not ready yet" apart from "will never succeed".
//! Descriptor-set validation failures ([`OrchestratorError`]) are raised
//! before any resource is touched.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Retry eligibility of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Worth retrying: rate limiting, network blips, dependencies not ready.
    Transient,
    /// Deterministic: invalid configuration, quota, authorization.
    Permanent,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Permanent => write!(f, "permanent"),
        }
    }
}

/// Errors that know whether they are worth retrying.
pub trait Classify {
    /// Classify this error.
    fn class(&self) -> ErrorClass;

    /// Shorthand for `self.class() == ErrorClass::Transient`.
    fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

/// Errors returned by a [`ResourceController`](crate::controller::ResourceController).
#[derive(Error, Debug)]
pub enum ControllerError {
    /// API returned an error response.
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    /// Request was throttled by the provider.
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Connection refused, reset, or otherwise interrupted.
    #[error("Network error: {0}")]
    Network(String),

    /// Call did not complete in time.
    #[error("Operation timed out after {0} seconds")]
    Timeout(u64),

    /// A prerequisite exists but is not usable yet.
    #[error("Dependency not ready: {0}")]
    NotReady(String),

    /// Resource not found.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Authentication or authorization error.
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Quota exceeded.
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    /// External command exited unsuccessfully for an unrecognised reason.
    #[error("Command `{operation}` exited with {code}: {stderr}")]
    Command {
        operation: String,
        code: String,
        stderr: String,
    },

    /// Local I/O failure (e.g. the command could not be spawned).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ControllerError {
    /// Whether this error means the resource does not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl Classify for ControllerError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::Api { status, .. } if *status == 429 || *status >= 500 => ErrorClass::Transient,
            Self::RateLimited(_) | Self::Network(_) | Self::Timeout(_) | Self::NotReady(_) => {
                ErrorClass::Transient
            }
            Self::Api { .. }
            | Self::NotFound(_)
            | Self::Config(_)
            | Self::Auth(_)
            | Self::QuotaExceeded(_)
            | Self::Command { .. }
            | Self::Io(_) => ErrorClass::Permanent,
        }
    }
}

/// Errors that prevent an orchestration run from starting.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// The `depends_on` relation is not acyclic.
    #[error("Dependency cycle detected: {}", cycle.join(" -> "))]
    CycleDetected { cycle: Vec<String> },

    /// A resource depends on an id that is not declared.
    #[error("Resource '{id}' depends on undeclared resource '{dependency}'")]
    UnknownDependency { id: String, dependency: String },

    /// Two descriptors share an id.
    #[error("Resource '{0}' is declared more than once")]
    DuplicateId(String),

    /// The environment declares no resources.
    #[error("Environment '{0}' declares no resources")]
    EmptyEnvironment(String),

    /// Reading or writing a file failed.
    #[error("Failed to access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// An environment or state file could not be parsed.
    #[error("Failed to parse {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },

    /// A previous teardown left resources behind; provisioning again would
    /// orphan them.
    #[error(
        "Resources left behind by an earlier teardown: {}; decommission first",
        resources.join(", ")
    )]
    ResourcesLeftBehind { resources: Vec<String> },

    /// The run state could not be serialized.
    #[error("State serialization error: {0}")]
    State(#[from] serde_json::Error),
}
