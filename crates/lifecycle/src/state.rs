//! Run state: the single mutable record of one orchestration execution.
//!
//! A [`RunState`] is written only by the orchestrator driving the run. It
//! is persisted as pretty JSON after every update so an interrupted run can
//! be resumed, inspected, or torn down later.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::controller::Handle;
use crate::descriptor::{ResourceDescriptor, ResourceKind};
use crate::error::OrchestratorError;
use crate::registry::Registry;
use crate::retry::{millis, RetryError};

/// Lifecycle phase of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Creating resources.
    Provisioning,
    /// Deleting resources.
    Decommissioning,
    /// Finished; inspect outcomes for per-resource results.
    Completed,
    /// Provisioning stopped on an unrecoverable failure or cancellation.
    Aborted,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Provisioning => write!(f, "provisioning"),
            Self::Decommissioning => write!(f, "decommissioning"),
            Self::Completed => write!(f, "completed"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// Per-resource outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Create call succeeded; readiness not (yet) confirmed.
    Created,
    /// Ready for dependents.
    Ready,
    /// A call failed or the resource entered a failed state.
    Failed,
    /// Readiness was not reached within the creation budget.
    TimedOut,
    /// Not attempted.
    Skipped,
    /// Confirmed absent after deletion.
    Deleted,
    /// Still exists after the deletion budget ran out.
    StillPresent,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Ready => write!(f, "ready"),
            Self::Failed => write!(f, "failed"),
            Self::TimedOut => write!(f, "timed out"),
            Self::Skipped => write!(f, "skipped"),
            Self::Deleted => write!(f, "deleted"),
            Self::StillPresent => write!(f, "still present"),
        }
    }
}

/// Which step produced an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// The create call.
    Create,
    /// Waiting for the resource to become ready.
    Readiness,
    /// The delete call.
    Delete,
    /// Waiting for the resource to disappear.
    Removal,
    /// Not started (dependency not ready, run aborted, never created).
    NotStarted,
}

/// Failure classification shown in the run report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Transient errors until the retry budget ran out.
    Transient,
    /// Deterministic failure, or the resource entered a failed state.
    Permanent,
    /// Readiness or removal budget exceeded.
    TimedOut,
    /// The status probe itself kept failing.
    Probe,
    /// Interrupted by a cancellation request.
    Cancelled,
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient => write!(f, "transient (retries exhausted)"),
            Self::Permanent => write!(f, "permanent"),
            Self::TimedOut => write!(f, "timed out"),
            Self::Probe => write!(f, "probe error"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl<E> From<&RetryError<E>> for FailureClass {
    fn from(error: &RetryError<E>) -> Self {
        match error {
            RetryError::Permanent { .. } => Self::Permanent,
            RetryError::Exhausted { .. } => Self::Transient,
            RetryError::Cancelled { .. } => Self::Cancelled,
        }
    }
}

/// Everything known about one resource within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    /// Resource id.
    pub id: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Outcome.
    pub outcome: Outcome,
    /// Step that produced the outcome.
    pub stage: Stage,
    /// Provider handle, once the create call has succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<Handle>,
    /// Failure classification, if the outcome is a failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<FailureClass>,
    /// Human-readable reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Controller call attempts made.
    #[serde(default)]
    pub attempts: u32,
    /// Status probes made.
    #[serde(default)]
    pub polls: u32,
    /// Total time spent on this resource, including backoff and polling.
    #[serde(rename = "elapsed_ms", with = "millis", default)]
    pub elapsed: Duration,
    /// Run-relative time at which the create or delete call started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at_ms: Option<u64>,
    /// Run-relative time at which readiness was observed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_at_ms: Option<u64>,
}

impl ResourceRecord {
    /// A record with the given outcome and no timing information.
    #[must_use]
    pub fn new(descriptor: &ResourceDescriptor, outcome: Outcome, stage: Stage) -> Self {
        Self {
            id: descriptor.id.clone(),
            kind: descriptor.kind,
            outcome,
            stage,
            handle: None,
            class: None,
            reason: None,
            attempts: 0,
            polls: 0,
            elapsed: Duration::ZERO,
            started_at_ms: None,
            ready_at_ms: None,
        }
    }

    /// A resource that was not started.
    #[must_use]
    pub fn skipped(descriptor: &ResourceDescriptor, reason: impl Into<String>) -> Self {
        Self::new(descriptor, Outcome::Skipped, Stage::NotStarted).with_reason(reason)
    }

    /// Attach a reason.
    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Attach a failure classification.
    #[must_use]
    pub fn with_class(mut self, class: FailureClass) -> Self {
        self.class = Some(class);
        self
    }

    /// Whether the resource may exist at the provider.
    ///
    /// True once a create call has succeeded and no deletion has confirmed
    /// its absence: `Created`, `Ready`, readiness-stage `Failed`/`TimedOut`,
    /// delete-stage `Failed`, and `StillPresent`.
    #[must_use]
    pub fn exists(&self) -> bool {
        match self.outcome {
            Outcome::Created | Outcome::Ready | Outcome::StillPresent => true,
            Outcome::Failed | Outcome::TimedOut => {
                matches!(self.stage, Stage::Readiness | Stage::Delete | Stage::Removal)
            }
            Outcome::Skipped | Outcome::Deleted => false,
        }
    }

    /// Whether a create call for the resource ever succeeded.
    ///
    /// Unlike [`ResourceRecord::exists`] this stays true after deletion, so a
    /// repeated teardown re-issues its (idempotent) delete.
    #[must_use]
    pub fn was_created(&self) -> bool {
        match self.outcome {
            Outcome::Skipped => false,
            Outcome::Failed | Outcome::TimedOut => self.stage != Stage::Create,
            _ => true,
        }
    }

    /// Whether the resource was left behind by a decommission.
    #[must_use]
    pub fn still_present(&self) -> bool {
        match self.outcome {
            Outcome::StillPresent => true,
            Outcome::Failed => matches!(self.stage, Stage::Delete | Stage::Removal),
            _ => false,
        }
    }

    /// Whether this outcome stops a provisioning run.
    #[must_use]
    pub fn aborts_provisioning(&self) -> bool {
        matches!(self.outcome, Outcome::Failed | Outcome::TimedOut)
            || self.class == Some(FailureClass::Cancelled)
    }
}

/// State of one orchestration execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    /// Environment name.
    pub environment: String,
    /// Current phase.
    pub phase: Phase,
    /// Resource ids in the order they were started.
    #[serde(default)]
    pub attempted: Vec<String>,
    /// Outcome per resource id.
    #[serde(default)]
    pub outcomes: BTreeMap<String, ResourceRecord>,
    /// The failure that aborted provisioning, kept through recovery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<String>,
    /// Rollback performed after an aborted provisioning run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery: Option<Box<RunState>>,
    /// When the run state was created (RFC 3339).
    pub started_at: String,
    /// When the run state was last changed (RFC 3339).
    pub updated_at: String,
    /// Where [`RunState::save`] writes, if persistence is enabled.
    #[serde(skip)]
    state_file: Option<PathBuf>,
}

impl RunState {
    /// Create an empty run state.
    #[must_use]
    pub fn new(environment: impl Into<String>) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            environment: environment.into(),
            phase: Phase::Provisioning,
            attempted: Vec::new(),
            outcomes: BTreeMap::new(),
            abort_reason: None,
            recovery: None,
            started_at: now.clone(),
            updated_at: now,
            state_file: None,
        }
    }

    /// A run state in which every declared resource is assumed to exist.
    ///
    /// Used to tear down an environment whose state file was lost; each
    /// resource's handle is its id.
    #[must_use]
    pub fn adopt(environment: impl Into<String>, registry: &Registry) -> Self {
        let mut state = Self::new(environment);
        for id in registry.topological_order() {
            if let Some(descriptor) = registry.get(id) {
                let mut record = ResourceRecord::new(descriptor, Outcome::Ready, Stage::Readiness)
                    .with_reason("adopted without provisioning history");
                record.handle = Some(Handle::new(id.clone()));
                state.attempted.push(id.clone());
                state.outcomes.insert(id.clone(), record);
            }
        }
        state
    }

    /// Persist to `path` on every [`RunState::save`].
    #[must_use]
    pub fn with_state_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_file = Some(path.into());
        self
    }

    /// The state file path, if persistence is enabled.
    #[must_use]
    pub fn state_file(&self) -> Option<&Path> {
        self.state_file.as_deref()
    }

    /// Conventional state file location for an environment.
    #[must_use]
    pub fn default_path(state_dir: &Path, environment: &str) -> PathBuf {
        state_dir.join(format!("{environment}-state.json"))
    }

    /// Load a persisted run state, if the file exists.
    ///
    /// The loaded state keeps persisting to `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Option<Self>, OrchestratorError> {
        if !path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(path).map_err(|source| OrchestratorError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let state: Self =
            serde_json::from_str(&content).map_err(|e| OrchestratorError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;

        info!(
            environment = %state.environment,
            phase = %state.phase,
            resources = state.outcomes.len(),
            "Loaded run state"
        );
        Ok(Some(state.with_state_file(path)))
    }

    /// Write the state file, if persistence is enabled.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&mut self) -> Result<(), OrchestratorError> {
        self.updated_at = chrono::Utc::now().to_rfc3339();

        let Some(path) = self.state_file.clone() else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| OrchestratorError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, content).map_err(|source| OrchestratorError::Io {
            path: path.clone(),
            source,
        })?;

        debug!(path = %path.display(), "Saved run state");
        Ok(())
    }

    /// Save, logging instead of failing: a state file that cannot be written
    /// must not interrupt a run that is mutating real resources.
    pub fn checkpoint(&mut self) {
        if let Err(e) = self.save() {
            warn!(error = %e, "Failed to save run state");
        }
    }

    /// Record that processing of `id` has started.
    pub fn mark_attempted(&mut self, id: &str) {
        if !self.attempted.iter().any(|a| a == id) {
            self.attempted.push(id.to_string());
        }
    }

    /// Store (or replace) a resource's record.
    pub fn record(&mut self, record: ResourceRecord) {
        debug!(resource = %record.id, outcome = %record.outcome, "Recording outcome");
        self.outcomes.insert(record.id.clone(), record);
    }

    /// Record for `id`, if any.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&ResourceRecord> {
        self.outcomes.get(id)
    }

    /// Outcome for `id`, if any.
    #[must_use]
    pub fn outcome(&self, id: &str) -> Option<Outcome> {
        self.outcomes.get(id).map(|r| r.outcome)
    }

    /// Whether `id` is ready.
    #[must_use]
    pub fn is_ready(&self, id: &str) -> bool {
        self.outcome(id) == Some(Outcome::Ready)
    }

    /// Drop every record except `Ready` ones, ahead of a resumed provisioning run.
    pub fn retain_ready(&mut self) {
        self.outcomes.retain(|_, r| r.outcome == Outcome::Ready);
        let outcomes = &self.outcomes;
        self.attempted.retain(|id| outcomes.contains_key(id));
    }

    /// Prepare a previously persisted state for another provisioning run.
    ///
    /// `Ready` records are kept. Records of resources whose create call went
    /// through but which never became ready are moved out of the outcomes
    /// and returned, so the next run re-checks them by handle instead of
    /// creating them twice. Whatever a rollback deleted is forgotten.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::ResourcesLeftBehind`] if this state, or
    /// the rollback nested in it, could not remove some resources.
    pub fn prepare_resume(
        &mut self,
    ) -> Result<BTreeMap<String, ResourceRecord>, OrchestratorError> {
        let mut stuck = self.left_behind();
        if let Some(recovery) = &self.recovery {
            for id in recovery.left_behind() {
                if !stuck.contains(&id) {
                    stuck.push(id);
                }
            }
        }
        if !stuck.is_empty() {
            return Err(OrchestratorError::ResourcesLeftBehind { resources: stuck });
        }

        if let Some(recovery) = self.recovery.take() {
            for id in recovery.outcomes.keys() {
                self.outcomes.remove(id);
            }
        }
        self.abort_reason = None;

        let resumable = self
            .outcomes
            .values()
            .filter(|r| r.outcome != Outcome::Ready && r.exists())
            .map(|r| (r.id.clone(), r.clone()))
            .collect();
        self.retain_ready();
        Ok(resumable)
    }

    /// Set aside the rollback and abort reason of an earlier provisioning
    /// run ahead of a teardown, returning the rollback.
    ///
    /// Records the rollback could not remove are folded back into the
    /// outcomes so the teardown deletes them again.
    pub fn take_recovery(&mut self) -> Option<RunState> {
        self.abort_reason = None;
        let recovery = *self.recovery.take()?;
        for id in recovery.left_behind() {
            if let Some(record) = recovery.get(&id) {
                let mut record = record.clone();
                if record.handle.is_none() {
                    record.handle = self.get(&id).and_then(|r| r.handle.clone());
                }
                self.outcomes.insert(id.clone(), record);
            }
        }
        Some(recovery)
    }

    /// Ids that were started and may still exist, in start order.
    #[must_use]
    pub fn existing(&self) -> Vec<String> {
        self.attempted
            .iter()
            .filter(|id| self.get(id).is_some_and(ResourceRecord::exists))
            .cloned()
            .collect()
    }

    /// Ids left behind by a decommission, in start order.
    #[must_use]
    pub fn left_behind(&self) -> Vec<String> {
        self.attempted
            .iter()
            .filter(|id| self.get(id).is_some_and(ResourceRecord::still_present))
            .cloned()
            .collect()
    }

    /// A fresh run state seeded with copies of the records for `ids`.
    #[must_use]
    pub fn seeded(&self, ids: &HashSet<String>) -> Self {
        let mut state = Self::new(self.environment.clone());
        for id in self.attempted.iter().filter(|id| ids.contains(*id)) {
            if let Some(record) = self.get(id) {
                state.attempted.push(id.clone());
                state.outcomes.insert(id.clone(), record.clone());
            }
        }
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, outcome: Outcome, stage: Stage) -> ResourceRecord {
        ResourceRecord::new(&ResourceDescriptor::new(id, ResourceKind::Cluster), outcome, stage)
    }

    #[test]
    fn test_exists_tracks_successful_create_calls() {
        assert!(record("a", Outcome::Created, Stage::Readiness).exists());
        assert!(record("a", Outcome::Ready, Stage::Readiness).exists());
        assert!(record("a", Outcome::TimedOut, Stage::Readiness).exists());
        assert!(record("a", Outcome::Failed, Stage::Readiness).exists());
        assert!(record("a", Outcome::Failed, Stage::Delete).exists());
        assert!(record("a", Outcome::StillPresent, Stage::Removal).exists());

        assert!(!record("a", Outcome::Failed, Stage::Create).exists());
        assert!(!record("a", Outcome::Skipped, Stage::NotStarted).exists());
        assert!(!record("a", Outcome::Deleted, Stage::Removal).exists());
    }

    #[test]
    fn test_retain_ready_keeps_attempt_order() {
        let mut state = RunState::new("test");
        for (id, outcome) in [
            ("cluster", Outcome::Ready),
            ("database", Outcome::Failed),
            ("subnet-group", Outcome::Ready),
        ] {
            state.mark_attempted(id);
            state.record(record(id, outcome, Stage::Readiness));
        }

        state.retain_ready();
        assert_eq!(state.attempted, vec!["cluster", "subnet-group"]);
        assert!(state.get("database").is_none());
    }

    fn aborted_with_rollback(cluster_removal: Outcome) -> RunState {
        let mut state = RunState::new("test");
        for id in ["cluster", "subnet-group"] {
            state.mark_attempted(id);
            let mut ready = record(id, Outcome::Ready, Stage::Readiness);
            ready.handle = Some(Handle::new(format!("h-{id}")));
            state.record(ready);
        }
        state.mark_attempted("database");
        state.record(record("database", Outcome::Failed, Stage::Create));
        state.phase = Phase::Aborted;
        state.abort_reason = Some("database: quota".into());

        let mut recovery = RunState::new("test");
        recovery.mark_attempted("subnet-group");
        recovery.record(record("subnet-group", Outcome::Deleted, Stage::Removal));
        recovery.mark_attempted("cluster");
        recovery.record(record("cluster", cluster_removal, Stage::Removal));
        state.recovery = Some(Box::new(recovery));
        state
    }

    #[test]
    fn test_prepare_resume_forgets_rolled_back_resources() {
        let mut state = aborted_with_rollback(Outcome::Deleted);

        let resumable = state.prepare_resume().unwrap();
        assert!(resumable.is_empty());
        assert!(state.attempted.is_empty());
        assert!(state.outcomes.is_empty());
        assert!(state.recovery.is_none());
        assert!(state.abort_reason.is_none());
    }

    #[test]
    fn test_prepare_resume_refuses_when_rollback_left_resources() {
        let mut state = aborted_with_rollback(Outcome::StillPresent);

        match state.prepare_resume() {
            Err(OrchestratorError::ResourcesLeftBehind { resources }) => {
                assert_eq!(resources, vec!["cluster"]);
            }
            other => panic!("expected left-behind error, got {other:?}"),
        }
        // Nothing is forgotten when resuming is refused.
        assert!(state.recovery.is_some());
        assert_eq!(
            state.get("cluster").unwrap().handle,
            Some(Handle::new("h-cluster"))
        );
    }

    #[test]
    fn test_prepare_resume_returns_handles_of_unready_resources() {
        let mut state = RunState::new("test");
        state.mark_attempted("cluster");
        state.record(record("cluster", Outcome::Ready, Stage::Readiness));
        state.mark_attempted("database");
        let mut created = record("database", Outcome::Created, Stage::Readiness)
            .with_class(FailureClass::Cancelled);
        created.handle = Some(Handle::new("db-1"));
        state.record(created);

        let resumable = state.prepare_resume().unwrap();
        let database = resumable.get("database").unwrap();
        assert_eq!(database.handle, Some(Handle::new("db-1")));
        assert_eq!(state.attempted, vec!["cluster"]);
        assert!(state.get("database").is_none());
    }

    #[test]
    fn test_take_recovery_keeps_what_the_rollback_left() {
        let mut state = aborted_with_rollback(Outcome::StillPresent);

        let recovery = state.take_recovery().unwrap();
        assert_eq!(recovery.left_behind(), vec!["cluster"]);
        assert!(state.recovery.is_none());
        assert!(state.abort_reason.is_none());
        let cluster = state.get("cluster").unwrap();
        assert_eq!(cluster.outcome, Outcome::StillPresent);
        assert_eq!(cluster.handle, Some(Handle::new("h-cluster")));
        assert_eq!(state.outcome("subnet-group"), Some(Outcome::Ready));
    }

    #[test]
    fn test_mark_attempted_is_idempotent() {
        let mut state = RunState::new("test");
        state.mark_attempted("cluster");
        state.mark_attempted("cluster");
        assert_eq!(state.attempted, vec!["cluster"]);
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = RunState::default_path(dir.path(), "policy-test");

        let mut state = RunState::new("policy-test").with_state_file(&path);
        state.mark_attempted("cluster");
        let mut ready = record("cluster", Outcome::Ready, Stage::Readiness);
        ready.handle = Some(Handle::new("eks-123"));
        ready.elapsed = Duration::from_millis(1500);
        state.record(ready);
        state.save().unwrap();

        let loaded = RunState::load(&path).unwrap().unwrap();
        assert_eq!(loaded.environment, "policy-test");
        assert_eq!(loaded.state_file(), Some(path.as_path()));
        let cluster = loaded.get("cluster").unwrap();
        assert_eq!(cluster.handle, Some(Handle::new("eks-123")));
        assert_eq!(cluster.elapsed, Duration::from_millis(1500));
    }

    #[test]
    fn test_load_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(RunState::load(&dir.path().join("missing.json"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_adopt_marks_everything_present() {
        let registry = Registry::new(vec![
            ResourceDescriptor::new("cluster", ResourceKind::Cluster),
            ResourceDescriptor::new("monitoring", ResourceKind::ChartRelease)
                .depends_on(["cluster"]),
        ])
        .unwrap();

        let state = RunState::adopt("test", &registry);
        assert_eq!(state.existing(), vec!["cluster", "monitoring"]);
        assert_eq!(
            state.get("monitoring").unwrap().handle,
            Some(Handle::new("monitoring"))
        );
    }
}
