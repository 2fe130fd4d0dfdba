//! Run report: what happened to each resource, as data for the CLI to
//! render and for scripts to read as JSON.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::descriptor::ResourceKind;
use crate::state::{FailureClass, Outcome, Phase, ResourceRecord, RunState, Stage};

/// One resource's line in the report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportEntry {
    pub id: String,
    pub kind: ResourceKind,
    pub outcome: Outcome,
    pub stage: Stage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class: Option<FailureClass>,
    pub attempts: u32,
    pub polls: u32,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// The resource may still exist and needs manual cleanup.
    pub still_present: bool,
}

impl From<&ResourceRecord> for ReportEntry {
    fn from(record: &ResourceRecord) -> Self {
        Self {
            id: record.id.clone(),
            kind: record.kind,
            outcome: record.outcome,
            stage: record.stage,
            class: record.class,
            attempts: record.attempts,
            polls: record.polls,
            elapsed_ms: u64::try_from(record.elapsed.as_millis()).unwrap_or(u64::MAX),
            reason: record.reason.clone(),
            still_present: record.still_present(),
        }
    }
}

/// How a run ended, as far as the caller's exit status is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunVerdict {
    /// Every resource reached its terminal success state.
    Success,
    /// Provisioning aborted; a rollback was attempted.
    ProvisionAborted,
    /// Teardown could not remove everything.
    ResourcesLeftBehind,
}

impl RunVerdict {
    /// Process exit code for this verdict.
    #[must_use]
    pub fn exit_code(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::ProvisionAborted => 2,
            Self::ResourcesLeftBehind => 3,
        }
    }
}

/// Summary of a [`RunState`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub environment: String,
    pub phase: Phase,
    pub verdict: RunVerdict,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<String>,
    pub entries: Vec<ReportEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recovery: Option<Box<RunReport>>,
    /// Ids that may still exist at the provider, including any the rollback
    /// could not remove.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub manual_cleanup: Vec<String>,
    pub started_at: String,
    pub updated_at: String,
}

impl RunReport {
    /// Build a report. Entries follow start order; resources that were
    /// never started come last, by id.
    #[must_use]
    pub fn from_state(state: &RunState) -> Self {
        let mut entries: Vec<ReportEntry> = state
            .attempted
            .iter()
            .filter_map(|id| state.get(id))
            .map(ReportEntry::from)
            .collect();
        entries.extend(
            state
                .outcomes
                .values()
                .filter(|r| !state.attempted.contains(&r.id))
                .map(ReportEntry::from),
        );

        let recovery = state
            .recovery
            .as_deref()
            .map(|r| Box::new(Self::from_state(r)));

        let mut manual_cleanup = state.left_behind();
        if let Some(recovery) = &recovery {
            for id in &recovery.manual_cleanup {
                if !manual_cleanup.contains(id) {
                    manual_cleanup.push(id.clone());
                }
            }
        }

        let verdict = if state.phase == Phase::Aborted {
            RunVerdict::ProvisionAborted
        } else if !manual_cleanup.is_empty() {
            RunVerdict::ResourcesLeftBehind
        } else {
            RunVerdict::Success
        };

        Self {
            environment: state.environment.clone(),
            phase: state.phase,
            verdict,
            abort_reason: state.abort_reason.clone(),
            entries,
            recovery,
            manual_cleanup,
            started_at: state.started_at.clone(),
            updated_at: state.updated_at.clone(),
        }
    }

    /// Whether the run fully succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.verdict == RunVerdict::Success
    }

    /// Pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// `42s`, `3m05s`, `1h02m`.
#[must_use]
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60)
    }
}
