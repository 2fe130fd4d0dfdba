use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use testbed_lifecycle::{RunState, RunVerdict};

use super::{finish, load_environment};
use crate::{ui, GlobalOptions};

/// Show the saved state of an environment
#[derive(Args)]
pub struct StatusCommand {
    /// Environment file (YAML, or JSON with a .json extension)
    #[arg(value_name = "FILE")]
    pub file: PathBuf,
}

impl StatusCommand {
    pub fn run(&self, options: &GlobalOptions) -> Result<RunVerdict> {
        let (environment, _) = load_environment(&self.file)?;
        let state_path = options.state_path(&environment.name);

        let Some(state) = RunState::load(&state_path)
            .with_context(|| format!("Failed to read saved state {}", state_path.display()))?
        else {
            ui::print_info(&format!(
                "No runs recorded for '{}' (looked in {})",
                environment.name,
                state_path.display()
            ));
            return Ok(RunVerdict::Success);
        };

        finish(&state, options)
    }
}
