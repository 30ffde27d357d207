//! Rollout CLI.
//!
//! Runs AKS cluster upgrades and platform deployments with preflight checks,
//! backups, health monitoring and automatic rollback.

// Allow product names without backticks in doc comments
#![allow(clippy::doc_markdown)]

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

mod commands;

use commands::execute::ExecuteCommand;
use commands::preflight::PreflightCommand;
use commands::rollback::RollbackCommand;
use commands::snapshot::SnapshotCommand;
use commands::teardown::TeardownCommand;
use commands::validate::ValidateCommand;
use commands::ClusterArgs;

/// Safe rollouts for AKS clusters and platform services.
#[derive(Parser)]
#[command(
    name = "rollout",
    version,
    about = "Safe rollouts for AKS cluster upgrades and platform deployments",
    long_about = "Apply cluster upgrades and platform changes with safety rails.\n\n\
                  Every change is checked before it starts, backed up, watched while it\n\
                  rolls out and validated afterwards. A degraded cluster is rolled back\n\
                  automatically from the backup."
)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON.
    #[arg(long, global = true)]
    log_json: bool,

    /// Config file (defaults to ./rollout.toml when present).
    #[arg(long, env = "ROLLOUT_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(flatten)]
    cluster: ClusterArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a change.
    ///
    /// Runs preflight checks, takes a backup, applies the change, watches
    /// cluster health and validates the result, rolling back on failure.
    Execute(ExecuteCommand),

    /// Run preflight checks for a planned change without applying it.
    Preflight(PreflightCommand),

    /// Capture a health snapshot as JSON.
    Snapshot(SnapshotCommand),

    /// Run post-change validation.
    Validate(ValidateCommand),

    /// Restore a backup by hand.
    Rollback(RollbackCommand),

    /// Destroy an environment's infrastructure.
    Teardown(TeardownCommand),
}

fn init_tracing(verbose: bool, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("info,rollout=debug,notify=debug")
        } else {
            EnvFilter::new("warn,rollout=info,notify=info")
        }
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_json);

    let config = cli.config.as_deref();
    match cli.command {
        Commands::Execute(cmd) => {
            let cancel = CancellationToken::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupt received, cancelling run");
                    on_interrupt.cancel();
                }
            });

            let code = cmd.run(config, &cli.cluster, cancel).await?;
            std::process::exit(code);
        }
        Commands::Preflight(cmd) => cmd.run(config, &cli.cluster).await,
        Commands::Snapshot(cmd) => cmd.run(config, &cli.cluster).await,
        Commands::Validate(cmd) => cmd.run(config, &cli.cluster).await,
        Commands::Rollback(cmd) => cmd.run(config, &cli.cluster).await,
        Commands::Teardown(cmd) => cmd.run(config).await,
    }
}
