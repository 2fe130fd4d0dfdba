//! Console output for the testbed CLI.
//!
//! Human-facing output only; diagnostics go through `tracing` to stderr.

use colored::{ColoredString, Colorize};
use testbed_lifecycle::report::format_elapsed;
use testbed_lifecycle::{Outcome, ReportEntry, RunReport, RunVerdict};

/// Print a section header.
pub fn print_section(title: &str) {
    println!();
    println!("{}", "═".repeat(70).bright_black());
    println!("{}", title.cyan().bold());
    println!("{}", "═".repeat(70).bright_black());
    println!();
}

/// Print a success message.
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message.green());
}

/// Print a warning message.
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message.yellow());
}

/// Print an error message.
pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message.red());
}

/// Print an info message.
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// Print a key-value pair.
pub fn print_kv(key: &str, value: &str) {
    println!("  {}: {}", key.bright_black(), value);
}

/// Print a list item.
pub fn print_list_item(item: &str) {
    println!("  {} {}", "•".cyan(), item);
}

fn outcome_label(outcome: Outcome) -> ColoredString {
    let label = format!("{:<13}", outcome.to_string());
    match outcome {
        Outcome::Ready | Outcome::Deleted => label.green(),
        Outcome::Created | Outcome::Skipped => label.bright_black(),
        Outcome::Failed | Outcome::TimedOut | Outcome::StillPresent => label.red(),
    }
}

fn print_entries(entries: &[ReportEntry]) {
    let width = entries.iter().map(|e| e.id.len()).max().unwrap_or(0);
    for entry in entries {
        let mut line = format!(
            "  {:<width$}  {}  {:>3} attempt(s)  {:>7}",
            entry.id,
            outcome_label(entry.outcome),
            entry.attempts,
            format_elapsed(std::time::Duration::from_millis(entry.elapsed_ms)),
        );
        if let Some(reason) = &entry.reason {
            line.push_str("  ");
            let detail = match entry.class {
                Some(class) => format!("[{class}] {reason}"),
                None => reason.clone(),
            };
            line.push_str(&detail.bright_black().to_string());
        }
        println!("{line}");
    }
}

/// Print a run report.
pub fn print_report(report: &RunReport) {
    print_section(&format!("Run report: {}", report.environment));
    print_kv("Phase", &report.phase.to_string());
    print_kv("Started", &report.started_at);
    print_kv("Updated", &report.updated_at);
    println!();
    print_entries(&report.entries);

    if let Some(recovery) = &report.recovery {
        println!();
        println!("{}", "Rollback".cyan().bold());
        print_entries(&recovery.entries);
    }

    println!();
    match report.verdict {
        RunVerdict::Success => print_success("All resources reached their final state"),
        RunVerdict::ProvisionAborted => {
            print_warning(&format!(
                "Provisioning aborted: {}",
                report.abort_reason.as_deref().unwrap_or("unknown reason")
            ));
        }
        RunVerdict::ResourcesLeftBehind => {
            print_warning("Some resources could not be removed");
        }
    }

    if !report.manual_cleanup.is_empty() {
        println!();
        print_warning("Manual cleanup required for:");
        for id in &report.manual_cleanup {
            print_list_item(id);
        }
    }
}
