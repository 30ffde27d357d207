//! Teardown command - destroy an environment's infrastructure.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use clap::Args;
use tracing::warn;

use rollout::command::SystemRunner;
use rollout::config::{Environment, RolloutConfig};
use rollout::confirm::{self, stdin_is_terminal, ConfirmationPort};
use rollout::infra::{InfraBackend, Terraform};
use rollout::ui;

/// Destroy all infrastructure for an environment.
#[derive(Args, Debug)]
pub struct TeardownCommand {
    /// Target environment.
    #[arg(short, long, value_enum)]
    environment: Environment,

    /// Skip the confirmation (refused for protected environments).
    #[arg(short, long)]
    yes: bool,
}

impl TeardownCommand {
    /// Run the teardown.
    ///
    /// # Errors
    ///
    /// Returns an error if the operator declines or the destroy fails.
    pub async fn run(&self, config_path: Option<&Path>) -> Result<()> {
        let config = RolloutConfig::load(config_path)?;
        let cluster = config.cluster_name(self.environment);

        ui::print_banner(
            &format!("Teardown {cluster}"),
            "Every resource managed by the infrastructure backend will be destroyed",
        );

        if self.environment.is_protected() && self.yes {
            anyhow::bail!("--yes is not accepted for {}; confirm interactively", self.environment);
        }
        let port = confirm::for_cli(self.yes, stdin_is_terminal());
        confirm_teardown(port.as_ref(), self.environment, &cluster).await?;

        warn!(environment = %self.environment, cluster = %cluster, "Destroying infrastructure");
        let terraform = Terraform::new(
            Arc::new(SystemRunner),
            config.infra_dir.clone(),
            self.environment,
        )
        .with_timeouts(config.read_timeout(), config.mutate_timeout());
        terraform.init().await?;
        terraform.destroy().await?;

        ui::print_success(&format!("{cluster} destroyed"));
        Ok(())
    }
}

/// One confirmation, plus typing the cluster name for protected environments.
async fn confirm_teardown(port: &dyn ConfirmationPort, environment: Environment, cluster: &str) -> Result<()> {
    confirm::require(port, &format!("Destroy all infrastructure for {environment}?")).await?;
    if environment.is_protected()
        && !port
            .confirm_phrase(&format!("Type the cluster name ({cluster}) to confirm"), cluster)
            .await?
    {
        anyhow::bail!("Cluster name did not match; teardown cancelled");
    }
    Ok(())
}
