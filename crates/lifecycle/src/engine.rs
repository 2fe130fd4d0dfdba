//! Entry point tying the orchestrators together.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::EngineSettings;
use crate::controller::ResourceController;
use crate::decommission::Decommissioner;
use crate::error::OrchestratorError;
use crate::provision::Provisioner;
use crate::recovery::RecoveryController;
use crate::registry::Registry;
use crate::state::{Phase, RunState};

/// Provisions with automatic rollback, and decommissions.
#[derive(Clone)]
pub struct Engine {
    provisioner: Provisioner,
    decommissioner: Decommissioner,
    recovery: RecoveryController,
}

impl Engine {
    #[must_use]
    pub fn new(controller: Arc<dyn ResourceController>, settings: EngineSettings) -> Self {
        let decommissioner = Decommissioner::new(Arc::clone(&controller), settings.clone());
        Self {
            provisioner: Provisioner::new(controller, settings),
            recovery: RecoveryController::new(decommissioner.clone()),
            decommissioner,
        }
    }

    /// Stop provisioning when `cancel` fires. Rollback and teardown ignore it.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.provisioner = self.provisioner.with_cancellation(cancel);
        self
    }

    /// Provision `registry`; if that aborts, roll back what was created.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::ResourcesLeftBehind`], before any
    /// controller call, if `state` still holds resources an earlier rollback
    /// or teardown could not remove.
    pub async fn provision(
        &self,
        registry: &Registry,
        state: RunState,
    ) -> Result<RunState, OrchestratorError> {
        let state = self.provisioner.provision_registry(registry, state).await?;
        if state.phase == Phase::Aborted {
            info!(environment = %state.environment, "Provisioning aborted, starting rollback");
            Ok(self.recovery.recover(state, registry).await)
        } else {
            Ok(state)
        }
    }

    /// Tear down every resource of `registry` that `state` says may exist.
    pub async fn decommission(&self, registry: &Registry, state: RunState) -> RunState {
        self.decommissioner.decommission_registry(registry, state).await
    }
}
