//! Rollback of an aborted provisioning run.

use std::collections::HashSet;

use tracing::{error, info, warn};

use crate::decommission::Decommissioner;
use crate::registry::Registry;
use crate::state::{Phase, RunState};

/// Deletes whatever an aborted provisioning run managed to create.
#[derive(Clone)]
pub struct RecoveryController {
    decommissioner: Decommissioner,
}

impl RecoveryController {
    #[must_use]
    pub fn new(decommissioner: Decommissioner) -> Self {
        Self { decommissioner }
    }

    /// Decommission the resources of `state` that may exist.
    ///
    /// Only resources whose create call succeeded are touched. The returned
    /// state stays `Aborted` with its original `abort_reason`; the rollback
    /// outcome is attached as `recovery`.
    pub async fn recover(&self, mut state: RunState, registry: &Registry) -> RunState {
        if state.phase != Phase::Aborted {
            warn!(phase = %state.phase, "Recovering a run that did not abort");
        }

        let existing: HashSet<String> = state.existing().into_iter().collect();
        info!(
            environment = %state.environment,
            resources = existing.len(),
            reason = state.abort_reason.as_deref().unwrap_or("unknown"),
            "Rolling back partially provisioned environment"
        );

        let subset = registry.subset(&existing);
        let cleanup = self
            .decommissioner
            .decommission_registry(&subset, state.seeded(&existing))
            .await;

        let left_behind = cleanup.left_behind();
        if left_behind.is_empty() {
            info!(environment = %state.environment, "Rollback complete");
        } else {
            error!(
                environment = %state.environment,
                resources = ?left_behind,
                "Rollback left resources behind"
            );
        }

        state.recovery = Some(Box::new(cleanup));
        state.phase = Phase::Aborted;
        state.checkpoint();
        state
    }
}
