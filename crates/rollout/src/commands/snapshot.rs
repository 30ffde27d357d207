//! Snapshot command - capture cluster health as JSON.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;

use rollout::config::{Environment, RolloutConfig};
use rollout::health::HealthSnapshot;
use rollout::ui;

use super::{ClusterArgs, Platform};

/// Capture a health snapshot.
#[derive(Args, Debug)]
pub struct SnapshotCommand {
    /// Target environment.
    #[arg(short, long, value_enum)]
    environment: Environment,

    /// Write the snapshot to a file instead of stdout.
    #[arg(short, long)]
    output: Option<PathBuf>,
}

impl SnapshotCommand {
    /// Capture and print the snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the cluster cannot be read or the file cannot be
    /// written.
    pub async fn run(&self, config_path: Option<&Path>, cluster: &ClusterArgs) -> Result<()> {
        let config = RolloutConfig::load(config_path)?;
        let platform = Platform::connect(config, self.environment, cluster).await?;
        let snapshot = HealthSnapshot::capture(platform.reader.as_ref(), self.environment)
            .await
            .context("Failed to capture health snapshot")?;
        let json = serde_json::to_string_pretty(&snapshot)?;

        match &self.output {
            Some(path) => {
                std::fs::write(path, json)
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                ui::print_success(&format!(
                    "Snapshot written to {} ({} node(s), {} unhealthy, {} failed pod(s))",
                    path.display(),
                    snapshot.nodes.len(),
                    snapshot.unhealthy_node_count(),
                    snapshot.failed_pod_count()
                ));
            }
            None => println!("{json}"),
        }
        Ok(())
    }
}
