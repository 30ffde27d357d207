//! Console output helpers.
//!
//! Consistent formatting for human-facing output; structured logs go through
//! `tracing` separately.

use std::time::Duration;

use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};

use crate::report::CheckStatus;

/// Print the run header.
pub fn print_banner(title: &str, subtitle: &str) {
    println!();
    println!("{}", title.cyan().bold());
    println!("  {}", subtitle.bright_black());
    println!();
}

/// Print a section header.
pub fn print_section(title: &str) {
    println!();
    println!("{}", "═".repeat(70).bright_black());
    println!("{}", title.cyan().bold());
    println!("{}", "═".repeat(70).bright_black());
    println!();
}

/// Print a phase indicator with its position in the run.
pub fn print_progress_step(current: u8, total: u8, message: &str) {
    println!(
        "{} {} {}",
        format!("[{current}/{total}]").bright_black(),
        "▶".cyan(),
        message.bold()
    );
}

pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message.green());
}

pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message.yellow());
}

pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message.red());
}

pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// Print a key-value pair.
pub fn print_kv(key: &str, value: &str) {
    println!("  {} {}", format!("{key}:").bright_black(), value.green());
}

/// Print a single check line.
pub fn print_check_result(name: &str, status: CheckStatus, message: Option<&str>) {
    let icon = match status {
        CheckStatus::Pass => "✓".green(),
        CheckStatus::Warn => "⚠".yellow(),
        CheckStatus::Fail => "✗".red(),
    };

    let text = match message {
        Some(msg) if !msg.is_empty() => format!("{name} - {msg}"),
        _ => name.to_string(),
    };

    println!("  {icon} {text}");
}

/// Print tool output (a plan, a diff) under a heading, indented.
///
/// Added and removed lines of a diff are coloured.
pub fn print_block(title: &str, body: &str) {
    println!("  {}", format!("{title}:").bright_black());
    for line in indent_block(body) {
        let content = line.trim_start();
        let colored = if content.starts_with('+') && !content.starts_with("+++") {
            line.green()
        } else if content.starts_with('-') && !content.starts_with("---") {
            line.red()
        } else {
            line.normal()
        };
        println!("{colored}");
    }
}

fn indent_block(body: &str) -> Vec<String> {
    body.trim_end()
        .lines()
        .map(|line| format!("    {line}"))
        .collect()
}

/// Spinner shown while the health monitor polls.
#[must_use]
pub fn monitor_spinner(message: &str) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::with_template("  {spinner:.cyan} [{elapsed_precise}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    spinner.enable_steady_tick(Duration::from_millis(120));
    spinner.set_message(message.to_string());
    spinner
}

/// Spinner that draws nothing (tests, `--json`).
#[must_use]
pub fn hidden_spinner() -> ProgressBar {
    ProgressBar::hidden()
}
