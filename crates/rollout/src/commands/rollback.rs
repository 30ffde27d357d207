//! Rollback command - restore a persisted backup by hand.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use tracing::{error, info};

use rollout::backup::BackupRecord;
use rollout::config::RolloutConfig;
use rollout::confirm::{self, stdin_is_terminal};
use rollout::lock::{LeaseLock, RunLock};
use rollout::rollback::RollbackController;
use rollout::ui;

use super::{ClusterArgs, Platform};

/// Restore infrastructure state and manifests from a backup directory.
#[derive(Args, Debug)]
pub struct RollbackCommand {
    /// Backup directory containing `backup.json`.
    #[arg(short, long)]
    backup: PathBuf,

    /// Answer yes to the confirmation.
    #[arg(short, long)]
    yes: bool,

    /// Print the rollback result as JSON.
    #[arg(long)]
    json: bool,
}

impl RollbackCommand {
    /// Run the rollback.
    ///
    /// # Errors
    ///
    /// Returns an error if the backup cannot be loaded, the environment lock
    /// is held, the operator declines, or any item fails to restore.
    pub async fn run(&self, config_path: Option<&Path>, cluster: &ClusterArgs) -> Result<()> {
        let config = RolloutConfig::load(config_path)?;
        let record = BackupRecord::load(&self.backup)
            .with_context(|| format!("Failed to load backup from {}", self.backup.display()))?;
        record
            .verify()
            .map_err(|e| anyhow::anyhow!("Backup {} is not usable: {e}", record.id))?;

        let platform = Platform::connect(config, record.environment, cluster).await?;
        ui::print_banner(
            &format!("Rollback {} from {}", platform.cluster_name(), record.id),
            &format!(
                "{} component, taken {}",
                record.component,
                record.created_at.format("%Y-%m-%d %H:%M:%S UTC")
            ),
        );

        let port = confirm::for_cli(self.yes, stdin_is_terminal());
        confirm::require(
            port.as_ref(),
            &format!("Restore {} from {}?", record.environment, record.directory.display()),
        )
        .await?;

        let lock = LeaseLock::new(
            platform.client.clone(),
            &platform.config.lock_namespace,
            &platform.config.lock_name(record.environment),
        );
        let holder = format!("manual-rollback-{}", record.id);
        let guard = lock.acquire(&holder).await?;

        let controller = RollbackController::new(platform.terraform.clone(), platform.kubectl.clone());
        let outcome = controller.rollback(Some(&record)).await;

        if let Err(e) = guard.release().await {
            error!(error = %e, "Failed to release environment lock");
        }

        let result = outcome?;
        if self.json {
            println!("{}", serde_json::to_string_pretty(&result)?);
        } else {
            for item in &result.items {
                ui::print_success(&format!("{}: {}", item.target, item.detail));
            }
        }
        info!(backup = %result.backup_id, items = result.items.len(), "Manual rollback complete");
        Ok(())
    }
}
