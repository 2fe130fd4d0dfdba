use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use testbed_lifecycle::{Engine, RunState, RunVerdict};

use super::{cancel_on_ctrl_c, controller_for, finish, load_environment};
use crate::{ui, GlobalOptions, OutputFormat};

/// Provision an environment
#[derive(Args)]
pub struct ProvisionCommand {
    /// Environment file (YAML, or JSON with a .json extension)
    #[arg(value_name = "FILE")]
    pub file: PathBuf,
}

impl ProvisionCommand {
    pub async fn run(&self, options: &GlobalOptions) -> Result<RunVerdict> {
        let (environment, registry) = load_environment(&self.file)?;
        let state_path = options.state_path(&environment.name);
        let text = options.output == OutputFormat::Text;

        let state = match RunState::load(&state_path)
            .with_context(|| format!("Failed to read saved state {}", state_path.display()))?
        {
            Some(state) => {
                if text {
                    ui::print_info(&format!(
                        "Resuming from {} ({} resource(s) recorded)",
                        state_path.display(),
                        state.outcomes.len()
                    ));
                }
                state
            }
            None => RunState::new(environment.name.clone()).with_state_file(&state_path),
        };

        if text {
            ui::print_section(&format!("Provisioning {}", environment.name));
            ui::print_kv("Resources", &registry.len().to_string());
            ui::print_kv("Max parallel", &environment.max_parallel.to_string());
            ui::print_kv("State file", &state_path.display().to_string());
            println!();
        }

        let engine = Engine::new(controller_for(&self.file), environment.settings())
            .with_cancellation(cancel_on_ctrl_c());
        let state = engine
            .provision(&registry, state)
            .await
            .with_context(|| format!("Cannot provision '{}'", environment.name))?;

        finish(&state, options)
    }
}
