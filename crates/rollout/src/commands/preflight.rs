//! Preflight command - run the pre-change checks without changing anything.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use tracing::info;

use rollout::command::tool_available;
use rollout::config::RolloutConfig;
use rollout::confirm::AutoConfirm;
use rollout::health::HealthSnapshot;
use rollout::preflight::PreflightValidator;

use super::{ChangeArgs, ClusterArgs, Platform};

/// Run preflight checks for a planned change.
#[derive(Args, Debug)]
pub struct PreflightCommand {
    #[command(flatten)]
    change: ChangeArgs,

    /// Output report as JSON.
    #[arg(long)]
    json: bool,
}

impl PreflightCommand {
    /// Run the checks.
    ///
    /// # Errors
    ///
    /// Returns an error if the cluster cannot be read or any check fails.
    pub async fn run(&self, config_path: Option<&Path>, cluster: &ClusterArgs) -> Result<()> {
        let config = RolloutConfig::load(config_path)?;
        let request = self.change.request();
        request.validate()?;
        let platform = Platform::connect(config, request.environment, cluster).await?;
        info!(cluster = %platform.cluster_name(), "Running preflight checks");

        let baseline = HealthSnapshot::capture(platform.reader.as_ref(), request.environment)
            .await
            .context("Failed to capture baseline health")?;

        let mut validator = PreflightValidator::new(platform.reader.clone(), platform.az.clone());
        if tool_available("pluto") {
            validator = validator.with_scanner(Arc::clone(&platform.runner));
        }
        // Read-only: an unhealthy baseline is reported, never accepted.
        let report = validator.run(&request, &baseline, &AutoConfirm::deny()).await?;

        if self.json {
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            report.print_summary();
        }

        if report.has_failures() {
            anyhow::bail!("Preflight failed: {}", report.failure_summary());
        }
        Ok(())
    }
}
