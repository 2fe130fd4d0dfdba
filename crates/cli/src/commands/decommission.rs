use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Args;
use colored::Colorize;
use dialoguer::{theme::ColorfulTheme, Confirm};
use testbed_lifecycle::{Engine, RunState, RunVerdict};

use super::{controller_for, finish, load_environment};
use crate::{ui, GlobalOptions, OutputFormat};

/// Decommission an environment
#[derive(Args)]
pub struct DecommissionCommand {
    /// Environment file (YAML, or JSON with a .json extension)
    #[arg(value_name = "FILE")]
    pub file: PathBuf,

    /// Treat every declared resource as existing (use when the state file is lost)
    #[arg(long)]
    pub adopt: bool,

    /// Skip the confirmation prompt
    #[arg(short, long)]
    pub yes: bool,
}

impl DecommissionCommand {
    pub async fn run(&self, options: &GlobalOptions) -> Result<RunVerdict> {
        let (environment, registry) = load_environment(&self.file)?;
        let state_path = options.state_path(&environment.name);

        let state = if self.adopt {
            RunState::adopt(environment.name.clone(), &registry).with_state_file(&state_path)
        } else {
            match RunState::load(&state_path)
                .with_context(|| format!("Failed to read saved state {}", state_path.display()))?
            {
                Some(state) => state,
                None => bail!(
                    "No saved state at {}; pass --adopt to tear down every declared resource",
                    state_path.display()
                ),
            }
        };

        let targets: Vec<String> = registry
            .reverse_order()
            .into_iter()
            .filter(|id| state.get(id).is_some_and(|r| r.was_created()))
            .collect();

        if options.output == OutputFormat::Text {
            ui::print_section(&format!("Decommissioning {}", environment.name));
            if targets.is_empty() {
                ui::print_info("Nothing recorded as created; resources will only be checked off");
            } else {
                println!("{}", "Resources to delete, in order:".bold());
                for id in &targets {
                    ui::print_list_item(id);
                }
            }
            println!();
        }

        if !self.yes {
            let proceed = Confirm::with_theme(&ColorfulTheme::default())
                .with_prompt(format!("Delete {} resource(s)?", targets.len()))
                .default(false)
                .interact()?;

            if !proceed {
                println!("{}", "Decommission cancelled.".yellow());
                return Ok(RunVerdict::Success);
            }
        }

        let engine = Engine::new(controller_for(&self.file), environment.settings());
        let state = engine.decommission(&registry, state).await;

        finish(&state, options)
    }
}
