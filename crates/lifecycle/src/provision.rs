//! Provisioning orchestrator.
//!
//! Walks the dependency graph forward. A resource is started as soon as all
//! of its dependencies are `Ready` and the worker pool has room, so
//! independent siblings are created concurrently while every `depends_on`
//! edge stays strictly sequenced.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::EngineSettings;
use crate::controller::{describe_status, Handle, ResourceController};
use crate::descriptor::ResourceDescriptor;
use crate::error::OrchestratorError;
use crate::poll::{await_state, PollOutcome, PollSpec};
use crate::pool::{WorkerContext, WorkerPool};
use crate::registry::Registry;
use crate::retry::retry;
use crate::state::{FailureClass, Outcome, Phase, ResourceRecord, RunState, Stage};

/// Reason recorded when the operator interrupts a run.
pub const CANCELLED_REASON: &str = "cancelled by operator";

/// Creates an environment's resources in dependency order.
#[derive(Clone)]
pub struct Provisioner {
    controller: Arc<dyn ResourceController>,
    settings: EngineSettings,
    cancel: CancellationToken,
}

enum Gate {
    /// Every dependency is ready.
    Open,
    /// A dependency has not finished yet.
    Blocked,
    /// A dependency finished without becoming ready.
    Unsatisfied { dependency: String, outcome: Outcome },
}

fn dependency_gate(descriptor: &ResourceDescriptor, state: &RunState) -> Gate {
    for dependency in &descriptor.depends_on {
        match state.outcome(dependency) {
            Some(Outcome::Ready) => {}
            Some(outcome) => {
                return Gate::Unsatisfied {
                    dependency: dependency.clone(),
                    outcome,
                }
            }
            None => return Gate::Blocked,
        }
    }
    Gate::Open
}

/// Record a resource this run will not start.
///
/// A resource carried over from an earlier run keeps its old record, so the
/// rollback still knows it exists.
fn record_not_started(
    state: &mut RunState,
    descriptor: &ResourceDescriptor,
    reason: String,
    carried_over: &mut BTreeMap<String, ResourceRecord>,
) {
    match carried_over.remove(&descriptor.id) {
        Some(previous) => {
            state.mark_attempted(&descriptor.id);
            state.record(previous);
        }
        None => state.record(ResourceRecord::skipped(descriptor, reason)),
    }
}

impl Provisioner {
    #[must_use]
    pub fn new(controller: Arc<dyn ResourceController>, settings: EngineSettings) -> Self {
        Self {
            controller,
            settings,
            cancel: CancellationToken::new(),
        }
    }

    /// Observe `cancel`: once it fires no new resource is started and
    /// in-flight work stops at its next wait.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Validate `descriptors` and provision them.
    ///
    /// # Errors
    ///
    /// Returns an error, before any controller call, if the descriptors
    /// contain duplicates, unknown dependencies, or a cycle, or if `state`
    /// holds resources an earlier teardown could not remove.
    pub async fn provision(
        &self,
        descriptors: &[ResourceDescriptor],
        state: RunState,
    ) -> Result<RunState, OrchestratorError> {
        let registry = Registry::new(descriptors.to_vec())?;
        self.provision_registry(&registry, state).await
    }

    /// Provision every resource in `registry`.
    ///
    /// Resources already `Ready` in `state` are kept as they are; ones an
    /// earlier run created but never saw become ready are re-checked by
    /// handle rather than created again. The returned state is `Completed`
    /// when everything is ready, `Aborted` otherwise; recovery is left to
    /// the caller.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::ResourcesLeftBehind`], before any
    /// controller call, if `state` records resources that an earlier
    /// rollback or teardown could not remove.
    pub async fn provision_registry(
        &self,
        registry: &Registry,
        mut state: RunState,
    ) -> Result<RunState, OrchestratorError> {
        let mut carried_over = state.prepare_resume()?;
        for (id, previous) in carried_over.iter().filter(|(id, _)| !registry.contains(id)) {
            warn!(resource = %id, "Resource from an earlier run is no longer declared, leaving it alone");
            state.mark_attempted(id);
            state.record(previous.clone());
        }
        carried_over.retain(|id, _| registry.contains(id));

        state.phase = Phase::Provisioning;
        state.checkpoint();

        let mut pending = Vec::with_capacity(registry.len());
        for id in registry.topological_order() {
            if state.is_ready(id) {
                info!(resource = %id, "Already ready, not re-creating");
            } else {
                pending.push(id.clone());
            }
        }

        info!(
            environment = %state.environment,
            resources = registry.len(),
            pending = pending.len(),
            max_parallel = self.settings.max_parallel,
            "Provisioning environment"
        );

        // Fires on operator cancellation and on abort, so in-flight siblings
        // stop waiting and the rollback can start.
        let stop = self.cancel.child_token();
        let ctx = WorkerContext {
            controller: Arc::clone(&self.controller),
            retry: self.settings.retry.clone(),
            probe_failure_tolerance: self.settings.probe_failure_tolerance,
            cancel: stop.clone(),
            clock: Instant::now(),
        };
        let mut pool = WorkerPool::new(self.settings.max_parallel);
        let mut abort: Option<String> = None;

        loop {
            if abort.is_none() && self.cancel.is_cancelled() {
                warn!("Cancellation requested, no new resources will be started");
                abort = Some(CANCELLED_REASON.to_string());
            }
            if abort.is_none() {
                Self::start_ready(
                    registry,
                    &mut state,
                    &mut pending,
                    &mut carried_over,
                    &mut pool,
                    &ctx,
                );
            }

            let Some(record) = pool.next().await else {
                break;
            };

            if record.aborts_provisioning() && abort.is_none() {
                let reason = if record.class == Some(FailureClass::Cancelled) {
                    CANCELLED_REASON.to_string()
                } else {
                    format!(
                        "{}: {}",
                        record.id,
                        record.reason.as_deref().unwrap_or("failed")
                    )
                };
                error!(resource = %record.id, outcome = %record.outcome, reason = %reason, "Aborting provisioning");
                abort = Some(reason);
                stop.cancel();
            }
            state.record(record);
            state.checkpoint();
        }

        for id in pending {
            let Some(descriptor) = registry.get(&id) else {
                continue;
            };
            let reason = match dependency_gate(descriptor, &state) {
                Gate::Unsatisfied {
                    dependency,
                    outcome,
                } => format!("dependency '{dependency}' is {outcome}"),
                Gate::Open | Gate::Blocked => "not started: provisioning aborted".to_string(),
            };
            record_not_started(&mut state, descriptor, reason, &mut carried_over);
        }

        if let Some(reason) = abort {
            state.phase = Phase::Aborted;
            error!(environment = %state.environment, reason = %reason, "Provisioning aborted");
            state.abort_reason = Some(reason);
        } else {
            state.phase = Phase::Completed;
            info!(
                environment = %state.environment,
                elapsed_secs = ctx.clock.elapsed().as_secs(),
                "Environment provisioned"
            );
        }
        state.checkpoint();
        Ok(state)
    }

    /// Start every pending resource whose dependencies are ready, up to the
    /// pool limit, in topological order.
    fn start_ready(
        registry: &Registry,
        state: &mut RunState,
        pending: &mut Vec<String>,
        carried_over: &mut BTreeMap<String, ResourceRecord>,
        pool: &mut WorkerPool,
        ctx: &WorkerContext,
    ) {
        let mut index = 0;
        while index < pending.len() && pool.has_capacity() {
            let Some(descriptor) = registry.get(&pending[index]) else {
                pending.remove(index);
                continue;
            };

            match dependency_gate(descriptor, state) {
                Gate::Blocked => index += 1,
                Gate::Unsatisfied {
                    dependency,
                    outcome,
                } => {
                    pending.remove(index);
                    info!(resource = %descriptor.id, dependency = %dependency, "Skipping, dependency not ready");
                    record_not_started(
                        state,
                        descriptor,
                        format!("dependency '{dependency}' is {outcome}"),
                        carried_over,
                    );
                }
                Gate::Open => {
                    pending.remove(index);
                    state.mark_attempted(&descriptor.id);
                    let existing = carried_over.remove(&descriptor.id).map(|previous| {
                        previous
                            .handle
                            .unwrap_or_else(|| Handle::new(descriptor.id.clone()))
                    });
                    match &existing {
                        Some(handle) => {
                            info!(resource = %descriptor.id, handle = %handle, "Created by an earlier run, re-checking readiness");
                        }
                        None => {
                            info!(resource = %descriptor.id, kind = %descriptor.kind, "Creating resource");
                        }
                    }
                    pool.spawn(
                        descriptor,
                        Stage::Readiness,
                        create_resource(ctx.clone(), descriptor.clone(), existing),
                    );
                }
            }
        }
    }
}

/// Create one resource, or pick up `existing` from an earlier run, and wait
/// for it to become ready.
async fn create_resource(
    ctx: WorkerContext,
    descriptor: ResourceDescriptor,
    existing: Option<Handle>,
) -> ResourceRecord {
    let started = Instant::now();
    let started_at_ms = ctx.offset_ms();
    let controller = ctx.controller.as_ref();
    let d = &descriptor;

    let mut record = ResourceRecord::new(d, Outcome::Failed, Stage::Create);
    record.started_at_ms = Some(started_at_ms);

    let handle = if let Some(handle) = existing {
        handle
    } else {
        let operation = format!("create {}", d.id);
        match retry(&ctx.retry, &operation, &ctx.cancel, move || controller.create(d)).await {
            Ok(created) => {
                record.attempts = created.attempts;
                info!(resource = %d.id, handle = %created.value, attempts = created.attempts, "Create call accepted");
                created.value
            }
            Err(e) => {
                record.attempts = e.attempts();
                record.class = Some(FailureClass::from(&e));
                record.reason = Some(e.to_string());
                record.elapsed = started.elapsed();
                return record;
            }
        }
    };

    record.handle = Some(handle.clone());
    record.stage = Stage::Readiness;

    let spec = PollSpec::ready(
        d.creation_timeout(),
        d.poll_interval(),
        ctx.probe_failure_tolerance,
    );
    let h = &handle;
    let outcome = await_state(&d.id, &spec, &ctx.cancel, move || describe_status(controller, d, h)).await;
    record.polls = outcome.polls();

    match outcome {
        PollOutcome::Reached { .. } => {
            record.outcome = Outcome::Ready;
            record.ready_at_ms = Some(ctx.offset_ms());
        }
        PollOutcome::Failed { status, .. } => {
            record.class = Some(FailureClass::Permanent);
            record.reason = Some(format!("resource reported status '{status}' while becoming ready"));
        }
        PollOutcome::TimedOut {
            last_status,
            elapsed,
            ..
        } => {
            record.outcome = Outcome::TimedOut;
            record.class = Some(FailureClass::TimedOut);
            record.reason = Some(format!(
                "not ready after {}s (last status: {})",
                elapsed.as_secs(),
                last_status.map_or_else(|| "unknown".to_string(), |s| s.to_string())
            ));
        }
        PollOutcome::ProbeFailed { error, .. } => {
            record.class = Some(FailureClass::Probe);
            record.reason = Some(format!("status probe failed: {error}"));
        }
        PollOutcome::Cancelled { .. } => {
            record.outcome = Outcome::Created;
            record.class = Some(FailureClass::Cancelled);
            record.reason = Some("stopped while waiting for readiness".to_string());
        }
    }

    record.elapsed = started.elapsed();
    record
}
