//! testbed - disposable test environment lifecycle CLI.
//!
//! Provisions an environment's resources in dependency order, rolls back
//! automatically when provisioning fails, and tears everything down again.

#![allow(clippy::doc_markdown)]

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use testbed_lifecycle::RunVerdict;
use tracing_subscriber::EnvFilter;

mod commands;
mod ui;

use commands::decommission::DecommissionCommand;
use commands::plan::PlanCommand;
use commands::provision::ProvisionCommand;
use commands::status::StatusCommand;

/// Exit status for invalid input or an internal error.
const EXIT_ERROR: u8 = 1;

/// Log line format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Format of the run summary printed on stdout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Disposable test environment lifecycle.
#[derive(Parser)]
#[command(
    name = "testbed",
    version,
    about = "Provision and decommission disposable test environments",
    long_about = "Provision and decommission disposable test environments.\n\n\
                  Resources are created in dependency order and torn down in\n\
                  reverse. A failed or interrupted provisioning run is rolled back\n\
                  automatically. Progress is saved after every step, so re-running\n\
                  provision resumes where it left off.\n\n\
                  Exit codes: 0 success, 1 invalid input or error,\n\
                  2 provisioning aborted, 3 resources left behind."
)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log line format (logs go to stderr).
    #[arg(long, global = true, value_enum, default_value = "text")]
    log_format: LogFormat,

    /// Directory holding run state files.
    #[arg(
        long,
        global = true,
        env = "TESTBED_STATE_DIR",
        default_value = ".testbed",
        value_name = "DIR"
    )]
    state_dir: PathBuf,

    /// Also write the run report as JSON to this file.
    #[arg(long, global = true, value_name = "PATH")]
    report: Option<PathBuf>,

    /// Summary format on stdout.
    #[arg(long, global = true, value_enum, default_value = "text")]
    output: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate an environment file and show creation and deletion order.
    Plan(PlanCommand),

    /// Create every resource, rolling back on failure.
    Provision(ProvisionCommand),

    /// Delete every resource that was created.
    Decommission(DecommissionCommand),

    /// Show the last saved run state.
    Status(StatusCommand),
}

/// Options shared by every command.
pub struct GlobalOptions {
    pub state_dir: PathBuf,
    pub report: Option<PathBuf>,
    pub output: OutputFormat,
}

fn init_tracing(verbose: bool, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("info,testbed_lifecycle=debug,testbed=debug")
        } else {
            EnvFilter::new("warn,testbed_lifecycle=info,testbed=info")
        }
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn run(cli: Cli) -> Result<RunVerdict> {
    let options = GlobalOptions {
        state_dir: cli.state_dir,
        report: cli.report,
        output: cli.output,
    };

    match cli.command {
        Commands::Plan(cmd) => cmd.run(&options),
        Commands::Provision(cmd) => cmd.run(&options).await,
        Commands::Decommission(cmd) => cmd.run(&options).await,
        Commands::Status(cmd) => cmd.run(&options),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_format);

    match run(cli).await {
        Ok(verdict) => ExitCode::from(verdict.exit_code()),
        Err(e) => {
            ui::print_error(&format!("{e:#}"));
            ExitCode::from(EXIT_ERROR)
        }
    }
}
