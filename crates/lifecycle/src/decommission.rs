//! Decommission orchestrator.
//!
//! Deletes in reverse dependency order and never stops early: a resource
//! that cannot be deleted is recorded and the walk carries on, so one stuck
//! resource does not leave the rest of the environment running.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::EngineSettings;
use crate::controller::{delete_idempotent, describe_status, Handle, ResourceController};
use crate::descriptor::ResourceDescriptor;
use crate::error::OrchestratorError;
use crate::poll::{await_state, PollOutcome, PollSpec};
use crate::pool::{WorkerContext, WorkerPool};
use crate::registry::Registry;
use crate::retry::retry;
use crate::state::{FailureClass, Outcome, Phase, ResourceRecord, RunState, Stage};

/// Reason recorded for resources that never existed.
pub const NEVER_CREATED_REASON: &str = "never created; nothing to delete";

/// Tears down an environment's resources.
///
/// Teardown is not cancellable: once started it runs until every resource
/// has been handled.
#[derive(Clone)]
pub struct Decommissioner {
    controller: Arc<dyn ResourceController>,
    settings: EngineSettings,
}

impl Decommissioner {
    #[must_use]
    pub fn new(controller: Arc<dyn ResourceController>, settings: EngineSettings) -> Self {
        Self {
            controller,
            settings,
        }
    }

    /// Validate `descriptors` and decommission them.
    ///
    /// # Errors
    ///
    /// Returns an error, before any controller call, if the descriptors
    /// contain duplicates, unknown dependencies, or a cycle.
    pub async fn decommission(
        &self,
        descriptors: &[ResourceDescriptor],
        state: RunState,
    ) -> Result<RunState, OrchestratorError> {
        let registry = Registry::new(descriptors.to_vec())?;
        Ok(self.decommission_registry(&registry, state).await)
    }

    /// Decommission every resource in `registry` that `state` says was
    /// created. Resources already deleted are deleted again, which the
    /// controller treats as a no-op. A rollback nested in `state` is
    /// dropped; anything it left behind is deleted again.
    ///
    /// Always returns with `phase = Completed`; check
    /// [`RunState::left_behind`] for resources that could not be removed.
    pub async fn decommission_registry(&self, registry: &Registry, mut state: RunState) -> RunState {
        if let Some(rollback) = state.take_recovery() {
            info!(
                environment = %state.environment,
                left_behind = ?rollback.left_behind(),
                "Setting aside the rollback of an earlier provisioning run"
            );
        }
        let previous: BTreeMap<String, ResourceRecord> = state.outcomes.clone();
        for id in previous.keys().filter(|id| !registry.contains(id)) {
            warn!(resource = %id, "Resource in run state is no longer declared, leaving it alone");
        }

        state.phase = Phase::Decommissioning;
        state.attempted.clear();
        state.checkpoint();

        info!(
            environment = %state.environment,
            resources = registry.len(),
            "Decommissioning environment"
        );

        let ctx = WorkerContext {
            controller: Arc::clone(&self.controller),
            retry: self.settings.retry.clone(),
            probe_failure_tolerance: self.settings.probe_failure_tolerance,
            cancel: CancellationToken::new(),
            clock: Instant::now(),
        };
        let mut pool = WorkerPool::new(self.settings.max_parallel);
        let mut pending = registry.reverse_order();
        let mut finished: HashSet<String> = HashSet::with_capacity(pending.len());

        loop {
            Self::start_ready(
                registry,
                &previous,
                &mut state,
                &mut pending,
                &mut finished,
                &mut pool,
                &ctx,
            );

            let Some(record) = pool.next().await else {
                break;
            };
            finished.insert(record.id.clone());
            state.record(record);
            state.checkpoint();
        }

        state.phase = Phase::Completed;
        let left_behind = state.left_behind();
        if left_behind.is_empty() {
            info!(
                environment = %state.environment,
                elapsed_secs = ctx.clock.elapsed().as_secs(),
                "Environment decommissioned"
            );
        } else {
            error!(
                environment = %state.environment,
                resources = ?left_behind,
                "Decommission left resources behind, manual cleanup required"
            );
        }
        state.checkpoint();
        state
    }

    /// Start every pending resource whose dependents have all finished.
    fn start_ready(
        registry: &Registry,
        previous: &BTreeMap<String, ResourceRecord>,
        state: &mut RunState,
        pending: &mut Vec<String>,
        finished: &mut HashSet<String>,
        pool: &mut WorkerPool,
        ctx: &WorkerContext,
    ) {
        let mut index = 0;
        while index < pending.len() && pool.has_capacity() {
            let Some(descriptor) = registry.get(&pending[index]) else {
                pending.remove(index);
                continue;
            };
            if !registry
                .dependents(&descriptor.id)
                .iter()
                .all(|dependent| finished.contains(*dependent))
            {
                index += 1;
                continue;
            }

            pending.remove(index);
            state.mark_attempted(&descriptor.id);

            let Some(existing) = previous.get(&descriptor.id).filter(|r| r.was_created()) else {
                info!(resource = %descriptor.id, "Never created, nothing to delete");
                let mut record = ResourceRecord::skipped(descriptor, NEVER_CREATED_REASON);
                record.handle = previous.get(&descriptor.id).and_then(|r| r.handle.clone());
                state.record(record);
                finished.insert(descriptor.id.clone());
                continue;
            };

            let handle = existing
                .handle
                .clone()
                .unwrap_or_else(|| Handle::new(descriptor.id.clone()));
            info!(resource = %descriptor.id, kind = %descriptor.kind, handle = %handle, "Deleting resource");
            pool.spawn(
                descriptor,
                Stage::Delete,
                delete_resource(ctx.clone(), descriptor.clone(), handle),
            );
        }
    }
}

/// Delete one resource and wait for it to disappear.
async fn delete_resource(
    ctx: WorkerContext,
    descriptor: ResourceDescriptor,
    handle: Handle,
) -> ResourceRecord {
    let started = Instant::now();
    let controller = ctx.controller.as_ref();
    let d = &descriptor;
    let h = &handle;

    let mut record = ResourceRecord::new(d, Outcome::Failed, Stage::Delete);
    record.handle = Some(handle.clone());
    record.started_at_ms = Some(ctx.offset_ms());

    let operation = format!("delete {}", d.id);
    match retry(&ctx.retry, &operation, &ctx.cancel, move || {
        delete_idempotent(controller, d, h)
    })
    .await
    {
        Ok(deleted) => record.attempts = deleted.attempts,
        Err(e) => {
            warn!(resource = %d.id, error = %e, "Delete failed, continuing with the rest");
            record.attempts = e.attempts();
            record.class = Some(FailureClass::from(&e));
            record.reason = Some(e.to_string());
            record.elapsed = started.elapsed();
            return record;
        }
    }

    record.stage = Stage::Removal;
    let spec = PollSpec::absent(
        d.deletion_timeout(),
        d.poll_interval(),
        ctx.probe_failure_tolerance,
    );
    let outcome = await_state(&d.id, &spec, &ctx.cancel, move || describe_status(controller, d, h)).await;
    record.polls = outcome.polls();

    match outcome {
        PollOutcome::Reached { .. } => {
            record.outcome = Outcome::Deleted;
        }
        PollOutcome::Failed { status, .. } => {
            record.class = Some(FailureClass::Permanent);
            record.reason = Some(format!("resource reported status '{status}' while being deleted"));
        }
        PollOutcome::TimedOut {
            last_status,
            elapsed,
            ..
        } => {
            record.outcome = Outcome::StillPresent;
            record.class = Some(FailureClass::TimedOut);
            record.reason = Some(format!(
                "still present after {}s (last status: {}); manual cleanup required",
                elapsed.as_secs(),
                last_status.map_or_else(|| "unknown".to_string(), |s| s.to_string())
            ));
        }
        PollOutcome::ProbeFailed { error, .. } => {
            record.class = Some(FailureClass::Probe);
            record.reason = Some(format!("could not confirm removal: {error}"));
        }
        PollOutcome::Cancelled { .. } => {
            record.outcome = Outcome::StillPresent;
            record.class = Some(FailureClass::Cancelled);
            record.reason = Some("cancelled while waiting for removal".to_string());
        }
    }

    record.elapsed = started.elapsed();
    record
}
