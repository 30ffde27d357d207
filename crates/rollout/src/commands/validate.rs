//! Validate command - run post-change validation standalone.

use std::path::Path;

use anyhow::Result;
use clap::Args;

use rollout::config::{ChangeRequest, Component, Environment, RolloutConfig};
use rollout::report::ValidationSummary;
use rollout::validation::PostChangeValidator;
use rollout::version::KubeVersion;

use super::{ClusterArgs, Platform};

/// Validate cluster health after a change.
#[derive(Args, Debug)]
pub struct ValidateCommand {
    /// Target environment.
    #[arg(short, long, value_enum)]
    environment: Environment,

    /// Expected Kubernetes version on the control plane and every node.
    #[arg(short, long)]
    target_version: Option<KubeVersion>,

    /// Also check cluster DNS, volume claims and certificates.
    #[arg(long)]
    extended: bool,

    /// Output a JSON summary.
    #[arg(long)]
    json: bool,
}

impl ValidateCommand {
    /// Run the validation.
    ///
    /// # Errors
    ///
    /// Returns an error if validation finds failures.
    pub async fn run(&self, config_path: Option<&Path>, cluster: &ClusterArgs) -> Result<()> {
        let config = RolloutConfig::load(config_path)?;
        let platform = Platform::connect(config, self.environment, cluster).await?;

        let mut request = ChangeRequest::new(self.environment, Component::All);
        request.target_version = self.target_version;

        let validator = PostChangeValidator::new(platform.reader.clone(), platform.kubectl.clone(), &platform.config)
            .with_extended(self.extended || platform.config.extended_validation);
        let report = validator.run(&request).await;

        if self.json {
            let summary = ValidationSummary::from_report(&report, self.environment, &platform.cluster_name());
            println!("{}", serde_json::to_string_pretty(&summary)?);
        } else {
            report.print_summary();
        }

        if report.has_failures() {
            anyhow::bail!("Validation found {} failed check(s)", report.totals().failed);
        }
        Ok(())
    }
}
