//! Subcommands and the plumbing they share.

pub mod decommission;
pub mod plan;
pub mod provision;
pub mod status;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use testbed_lifecycle::{
    CommandController, Environment, Registry, ResourceController, RunReport, RunState, RunVerdict,
};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::{ui, GlobalOptions, OutputFormat};

/// Load and validate an environment file.
pub fn load_environment(path: &Path) -> Result<(Environment, Registry)> {
    let environment = Environment::load(path)
        .with_context(|| format!("Failed to load environment file {}", path.display()))?;
    let registry = environment
        .registry()
        .with_context(|| format!("Invalid environment '{}'", environment.name))?;
    Ok((environment, registry))
}

/// Controller running the commands declared in the environment file,
/// relative to the file's directory.
pub fn controller_for(environment_file: &Path) -> Arc<dyn ResourceController> {
    let mut controller = CommandController::new();
    if let Some(dir) = environment_file.parent().filter(|d| !d.as_os_str().is_empty()) {
        controller = controller.with_working_dir(dir);
    }
    Arc::new(controller)
}

impl GlobalOptions {
    /// State file for an environment.
    pub fn state_path(&self, environment: &str) -> PathBuf {
        RunState::default_path(&self.state_dir, environment)
    }
}

/// Cancel the returned token on Ctrl-C.
pub fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after in-flight steps and rolling back");
            token.cancel();
        }
    });
    cancel
}

/// Report the outcome of a run and turn it into a verdict.
pub fn finish(state: &RunState, options: &GlobalOptions) -> Result<RunVerdict> {
    let report = RunReport::from_state(state);

    if let Some(path) = &options.report {
        let json = report.to_json().context("Failed to serialize run report")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write report to {}", path.display()))?;
    }

    match options.output {
        OutputFormat::Text => ui::print_report(&report),
        OutputFormat::Json => println!(
            "{}",
            report.to_json().context("Failed to serialize run report")?
        ),
    }

    Ok(report.verdict)
}
