//! Desired-state infra backend.
//!
//! The [`InfraBackend`] trait covers the calls the orchestrator makes against
//! the declarative backend: init, plan, apply, state pull/push and destroy.
//! [`Terraform`] implements it on top of the `terraform` CLI.

use std::path::PathBuf;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::command::{run_checked, CommandRunner, CommandSpec};
use crate::config::Environment;
use crate::error::RolloutError;
use crate::version::KubeVersion;

static PLAN_COUNTS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+) to add, (\d+) to change, (\d+) to destroy").unwrap()
});

/// Resource counts of a computed plan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSummary {
    pub add: u32,
    pub change: u32,
    pub destroy: u32,
    /// Full plan output for display.
    #[serde(skip)]
    pub raw: String,
}

impl PlanSummary {
    /// Parse the summary line of `terraform plan` output.
    ///
    /// Returns `None` when the output contains neither a summary line nor a
    /// no-changes marker.
    #[must_use]
    pub fn parse(output: &str) -> Option<Self> {
        if let Some(caps) = PLAN_COUNTS.captures(output) {
            let count = |i: usize| caps.get(i).and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
            return Some(Self {
                add: count(1),
                change: count(2),
                destroy: count(3),
                raw: output.to_string(),
            });
        }
        if output.contains("No changes.") {
            return Some(Self {
                raw: output.to_string(),
                ..Self::default()
            });
        }
        None
    }

    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.add + self.change + self.destroy > 0
    }

    /// Plans that remove resources need an explicit confirmation.
    #[must_use]
    pub fn is_destructive(&self) -> bool {
        self.destroy > 0
    }
}

impl std::fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} to add, {} to change, {} to destroy",
            self.add, self.change, self.destroy
        )
    }
}

/// Declarative infra backend.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait InfraBackend: Send + Sync {
    /// Initialise the backend for the environment.
    async fn init(&self) -> Result<(), RolloutError>;

    /// Compute and save a plan. `kubernetes_version` is passed as a variable
    /// when given.
    async fn plan(&self, kubernetes_version: Option<KubeVersion>) -> Result<PlanSummary, RolloutError>;

    /// Apply the saved plan.
    async fn apply(&self) -> Result<(), RolloutError>;

    /// Pull the current state as an opaque blob.
    async fn pull_state(&self) -> Result<String, RolloutError>;

    /// Force-push a state blob back to the backend.
    async fn push_state(&self, state: String) -> Result<(), RolloutError>;

    /// Destroy every managed resource of the environment.
    async fn destroy(&self) -> Result<(), RolloutError>;
}

/// `terraform` CLI backend for one environment.
pub struct Terraform {
    runner: Arc<dyn CommandRunner>,
    dir: PathBuf,
    environment: Environment,
    read_timeout: Duration,
    mutate_timeout: Duration,
}

impl Terraform {
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>, dir: impl Into<PathBuf>, environment: Environment) -> Self {
        Self {
            runner,
            dir: dir.into(),
            environment,
            read_timeout: Duration::from_secs(600),
            mutate_timeout: Duration::from_secs(3600),
        }
    }

    #[must_use]
    pub fn with_timeouts(mut self, read: Duration, mutate: Duration) -> Self {
        self.read_timeout = read;
        self.mutate_timeout = mutate;
        self
    }

    fn terraform(&self, subcommand: &str) -> CommandSpec {
        CommandSpec::new("terraform")
            .cwd(&self.dir)
            .args([subcommand, "-no-color"])
    }

    fn var_file(&self) -> String {
        format!("-var-file=environments/{}/terraform.tfvars", self.environment)
    }

    fn plan_file(&self) -> String {
        format!("tfplan-{}", self.environment)
    }
}

#[async_trait]
impl InfraBackend for Terraform {
    async fn init(&self) -> Result<(), RolloutError> {
        let spec = self.terraform("init")
            .arg(format!(
                "-backend-config=environments/{}/backend.conf",
                self.environment
            ))
            .args(["-reconfigure", "-input=false"])
            .timeout(self.read_timeout);
        run_checked(self.runner.as_ref(), &spec).await?;
        debug!(environment = %self.environment, "terraform initialised");
        Ok(())
    }

    async fn plan(&self, kubernetes_version: Option<KubeVersion>) -> Result<PlanSummary, RolloutError> {
        let mut spec = self.terraform("plan")
            .arg(self.var_file())
            .arg(format!("-out={}", self.plan_file()))
            .arg("-input=false");
        if let Some(version) = kubernetes_version {
            spec = spec.args(["-var".to_string(), format!("kubernetes_version={version}")]);
        }
        let output = run_checked(self.runner.as_ref(), &spec.timeout(self.read_timeout)).await?;
        let summary = PlanSummary::parse(&output.stdout).ok_or_else(|| RolloutError::Executor {
            message: "terraform plan produced no summary".into(),
            backup: None,
        })?;
        info!(environment = %self.environment, plan = %summary, "Plan computed");
        Ok(summary)
    }

    async fn apply(&self) -> Result<(), RolloutError> {
        let spec = self.terraform("apply")
            .args(["-auto-approve", "-input=false"])
            .arg(self.plan_file())
            .timeout(self.mutate_timeout);
        run_checked(self.runner.as_ref(), &spec).await?;
        Ok(())
    }

    async fn pull_state(&self) -> Result<String, RolloutError> {
        let spec = CommandSpec::new("terraform")
            .cwd(&self.dir)
            .args(["state", "pull"])
            .timeout(self.read_timeout);
        Ok(run_checked(self.runner.as_ref(), &spec).await?.stdout)
    }

    async fn push_state(&self, state: String) -> Result<(), RolloutError> {
        let spec = CommandSpec::new("terraform")
            .cwd(&self.dir)
            .args(["state", "push", "-force", "-"])
            .stdin(state)
            .timeout(self.mutate_timeout);
        run_checked(self.runner.as_ref(), &spec).await?;
        Ok(())
    }

    async fn destroy(&self) -> Result<(), RolloutError> {
        let spec = self.terraform("destroy")
            .arg(self.var_file())
            .args(["-auto-approve", "-input=false"])
            .timeout(self.mutate_timeout);
        run_checked(self.runner.as_ref(), &spec).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandOutput, MockCommandRunner};

    #[test]
    fn test_parse_plan_summary() {
        let out = "Terraform will perform the following actions:\n...\nPlan: 1 to add, 2 to change, 0 to destroy.\n";
        let plan = PlanSummary::parse(out).unwrap();
        assert_eq!((plan.add, plan.change, plan.destroy), (1, 2, 0));
        assert!(plan.has_changes());
        assert!(!plan.is_destructive());
    }

    #[test]
    fn test_parse_plan_with_imports() {
        let plan = PlanSummary::parse("Plan: 1 to import, 0 to add, 0 to change, 3 to destroy.").unwrap();
        assert_eq!(plan.destroy, 3);
        assert!(plan.is_destructive());
    }

    #[test]
    fn test_parse_no_changes() {
        let plan = PlanSummary::parse("No changes. Your infrastructure matches the configuration.").unwrap();
        assert!(!plan.has_changes());
        assert!(PlanSummary::parse("garbage").is_none());
    }

    #[tokio::test]
    async fn test_plan_passes_version_and_env_files() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|spec| {
                spec.program == "terraform"
                    && spec.args[0] == "plan"
                    && spec.args[1] == "-no-color"
                    && spec.args.contains(&"-var-file=environments/dev/terraform.tfvars".to_string())
                    && spec.args.contains(&"-out=tfplan-dev".to_string())
                    && spec.args.contains(&"kubernetes_version=1.29.0".to_string())
                    && spec.cwd.as_deref() == Some(std::path::Path::new("terraform"))
            })
            .returning(|_| Ok(CommandOutput::ok("Plan: 0 to add, 1 to change, 0 to destroy.")));
        let tf = Terraform::new(Arc::new(runner), "terraform", Environment::Dev);
        let plan = tf.plan(Some(KubeVersion::new(1, 29, 0))).await.unwrap();
        assert_eq!(plan.change, 1);
    }

    #[tokio::test]
    async fn test_push_state_uses_stdin() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|spec| {
                spec.args == ["state", "push", "-force", "-"]
                    && spec.stdin.as_deref() == Some("{\"serial\": 4}")
            })
            .times(1)
            .returning(|_| Ok(CommandOutput::ok("")));
        let tf = Terraform::new(Arc::new(runner), "terraform", Environment::Staging);
        tf.push_state("{\"serial\": 4}".into()).await.unwrap();
    }

    #[tokio::test]
    async fn test_apply_failure_is_executor_error() {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(|_| {
            Ok(CommandOutput {
                code: 1,
                stdout: String::new(),
                stderr: "Error: creating node pool".into(),
            })
        });
        let tf = Terraform::new(Arc::new(runner), "terraform", Environment::Dev);
        let err = tf.apply().await.unwrap_err();
        assert_eq!(err.kind(), "executor_error");
    }
}
