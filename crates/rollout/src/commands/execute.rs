//! Execute command - run one change through the full safety pipeline.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use clap::Args;
use notify::Notifier;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use rollout::command::tool_available;
use rollout::config::{ChangeRequest, RolloutConfig};
use rollout::confirm::{self, stdin_is_terminal, ConfirmationPort};
use rollout::lock::LeaseLock;
use rollout::orchestrator::{Collaborators, RolloutOrchestrator};

use super::{ChangeArgs, ClusterArgs, Platform};

/// Execute a change with preflight, backup, monitoring and rollback.
#[derive(Args, Debug)]
pub struct ExecuteCommand {
    #[command(flatten)]
    change: ChangeArgs,

    /// Show what would change without changing anything.
    #[arg(long)]
    dry_run: bool,

    /// Skip preflight checks.
    #[arg(long)]
    skip_preflight: bool,

    /// Skip post-change validation.
    #[arg(long)]
    skip_validation: bool,

    /// Do not back up before mutating (disables rollback).
    #[arg(long)]
    no_backup: bool,

    /// Do not roll back automatically on failure.
    #[arg(long)]
    no_rollback: bool,

    /// Answer yes to every confirmation.
    #[arg(short, long)]
    yes: bool,

    /// Print the run summary as JSON.
    #[arg(long)]
    json: bool,
}

impl ExecuteCommand {
    /// The change request described by the flags.
    #[must_use]
    pub fn request(&self) -> ChangeRequest {
        let mut request = self.change.request();
        request.dry_run = self.dry_run;
        request.skip_preflight = self.skip_preflight;
        request.skip_validation = self.skip_validation;
        request.backup_enabled = !self.no_backup;
        request.rollback_enabled = !self.no_rollback;
        request
    }

    /// Run the change and return the process exit code.
    ///
    /// # Errors
    ///
    /// Returns an error if the collaborators cannot be set up. Failures of
    /// the run itself are reported through the exit code.
    pub async fn run(
        &self,
        config_path: Option<&Path>,
        cluster: &ClusterArgs,
        cancel: CancellationToken,
    ) -> Result<i32> {
        let config = RolloutConfig::load(config_path)?;
        let request = self.request();
        info!(
            environment = %request.environment,
            component = %request.component,
            method = %request.execution_mode,
            dry_run = request.dry_run,
            "Starting rollout"
        );

        let platform = Platform::connect(config, request.environment, cluster).await?;
        let lock = LeaseLock::new(
            platform.client.clone(),
            &platform.config.lock_namespace,
            &platform.config.lock_name(request.environment),
        );
        let confirm = confirm::for_cli(self.yes, stdin_is_terminal());
        if !self.yes && !confirm.is_interactive() {
            warn!("No terminal attached and --yes not given: confirmations will be refused");
        }
        let scanner = tool_available("pluto").then(|| Arc::clone(&platform.runner));

        let deps = Collaborators {
            reader: platform.reader.clone(),
            control: platform.az.clone(),
            workloads: platform.kubectl.clone(),
            infra: platform.terraform.clone(),
            lock: Arc::new(lock),
            confirm,
            scanner,
            notifier: Arc::new(Notifier::from_url(platform.config.webhook_url.clone())),
        };

        let result = RolloutOrchestrator::new(platform.config, deps)
            .with_spinner(!self.json)
            .run(request, cancel)
            .await;

        if self.json {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Ok(result.exit_code())
    }
}
