//! The resource controller capability the orchestrators drive.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::descriptor::ResourceDescriptor;
use crate::error::ControllerError;

/// Observed status of an externally managed resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    /// Exists but is not usable yet (creating, updating, deleting).
    Pending,
    /// Usable by dependents.
    Ready,
    /// Terminal failure reported by the provider.
    Failed,
    /// Does not exist.
    Absent,
}

impl ResourceStatus {
    /// Map a provider status string onto a [`ResourceStatus`].
    ///
    /// Recognises the status vocabulary of managed Kubernetes, managed
    /// database, and chart-release APIs. Unknown values are treated as
    /// `Pending` so an unfamiliar transitional state never counts as done.
    #[must_use]
    pub fn from_provider_status(raw: &str) -> Self {
        let normalized = raw.trim().to_lowercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "ready" | "active" | "available" | "running" | "deployed" | "succeeded"
            | "in_use" | "complete" => Self::Ready,
            "failed" | "error" | "create_failed" | "delete_failed" | "degraded"
            | "incompatible_parameters" | "incompatible_network" | "inaccessible_encryption_credentials" => {
                Self::Failed
            }
            "" | "absent" | "deleted" | "not_found" | "notfound" | "none" | "null" => Self::Absent,
            _ => Self::Pending,
        }
    }
}

impl std::fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Ready => write!(f, "ready"),
            Self::Failed => write!(f, "failed"),
            Self::Absent => write!(f, "absent"),
        }
    }
}

/// Opaque provider handle for a created resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Handle(String);

impl Handle {
    /// Wrap a provider identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Capability for creating, deleting, and describing cloud resources.
///
/// Implementations must make `create` and `delete` safe to repeat: the
/// orchestrators retry them verbatim on transient failure. `delete` and
/// `describe` may return [`ControllerError::NotFound`] for a resource that
/// no longer exists; the orchestrators treat that as success and
/// [`ResourceStatus::Absent`] respectively.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResourceController: Send + Sync {
    /// Start creating the resource and return its handle.
    async fn create(&self, descriptor: &ResourceDescriptor) -> Result<Handle, ControllerError>;

    /// Start deleting the resource.
    async fn delete(
        &self,
        descriptor: &ResourceDescriptor,
        handle: &Handle,
    ) -> Result<(), ControllerError>;

    /// Report the resource's current status.
    async fn describe(
        &self,
        descriptor: &ResourceDescriptor,
        handle: &Handle,
    ) -> Result<ResourceStatus, ControllerError>;
}

/// `describe`, with "not found" reported as [`ResourceStatus::Absent`].
pub(crate) async fn describe_status(
    controller: &dyn ResourceController,
    descriptor: &ResourceDescriptor,
    handle: &Handle,
) -> Result<ResourceStatus, ControllerError> {
    match controller.describe(descriptor, handle).await {
        Err(e) if e.is_not_found() => Ok(ResourceStatus::Absent),
        other => other,
    }
}

/// `delete`, with "not found" treated as already deleted.
pub(crate) async fn delete_idempotent(
    controller: &dyn ResourceController,
    descriptor: &ResourceDescriptor,
    handle: &Handle,
) -> Result<(), ControllerError> {
    match controller.delete(descriptor, handle).await {
        Err(e) if e.is_not_found() => {
            debug!(resource = %descriptor.id, handle = %handle, "Resource already gone");
            Ok(())
        }
        other => other,
    }
}
