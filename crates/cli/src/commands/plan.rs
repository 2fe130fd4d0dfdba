use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use colored::Colorize;
use testbed_lifecycle::RunVerdict;

use super::load_environment;
use crate::{ui, GlobalOptions, OutputFormat};

/// Validate an environment file and print its plan
#[derive(Args)]
pub struct PlanCommand {
    /// Environment file (YAML, or JSON with a .json extension)
    #[arg(value_name = "FILE")]
    pub file: PathBuf,
}

impl PlanCommand {
    pub fn run(&self, options: &GlobalOptions) -> Result<RunVerdict> {
        let (environment, registry) = load_environment(&self.file)?;
        let waves = registry.waves();

        if options.output == OutputFormat::Json {
            let plan = serde_json::json!({
                "environment": environment.name,
                "max_parallel": environment.max_parallel,
                "creation_order": registry.topological_order(),
                "deletion_order": registry.reverse_order(),
                "waves": waves,
            });
            println!("{}", serde_json::to_string_pretty(&plan)?);
            return Ok(RunVerdict::Success);
        }

        ui::print_section(&format!("Plan: {}", environment.name));
        ui::print_kv("Resources", &registry.len().to_string());
        ui::print_kv("Max parallel", &environment.max_parallel.to_string());
        ui::print_kv(
            "State file",
            &options.state_path(&environment.name).display().to_string(),
        );

        println!();
        println!("{}", "Creation order".bold());
        for (i, wave) in waves.iter().enumerate() {
            println!("  {} {}", format!("[{}]", i + 1).bright_black(), wave.join(", "));
        }

        println!();
        println!("{}", "Deletion order".bold());
        for id in registry.reverse_order() {
            let kind = registry
                .get(&id)
                .map(|d| d.kind.to_string())
                .unwrap_or_default();
            ui::print_list_item(&format!("{id} {}", format!("({kind})").bright_black()));
        }

        println!();
        ui::print_success("Environment file is valid");
        Ok(RunVerdict::Success)
    }
}
