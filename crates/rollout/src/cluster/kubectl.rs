//! Manifest operations through `kubectl`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use super::WorkloadClient;
use crate::command::{run_checked, CommandError, CommandRunner, CommandSpec};
use crate::error::RolloutError;

/// Resource kinds captured per namespace for backups.
pub const BACKUP_RESOURCE_KINDS: &str =
    "deployments,statefulsets,daemonsets,services,configmaps,secrets,persistentvolumeclaims,ingresses";

/// Argo CD application resource.
const GITOPS_APPLICATIONS: &str = "applications.argoproj.io";

/// Image used for in-cluster DNS probes.
const DNS_PROBE_IMAGE: &str = "busybox:1.36";

/// `kubectl` wrapper implementing [`WorkloadClient`].
pub struct Kubectl {
    runner: Arc<dyn CommandRunner>,
    kubeconfig: Option<PathBuf>,
    context: Option<String>,
    read_timeout: Duration,
    mutate_timeout: Duration,
}

impl Kubectl {
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            kubeconfig: None,
            context: None,
            read_timeout: Duration::from_secs(60),
            mutate_timeout: Duration::from_secs(600),
        }
    }

    #[must_use]
    pub fn with_kubeconfig(mut self, kubeconfig: Option<PathBuf>) -> Self {
        self.kubeconfig = kubeconfig;
        self
    }

    /// Pin every call to a kubeconfig context.
    #[must_use]
    pub fn with_context(mut self, context: Option<String>) -> Self {
        self.context = context;
        self
    }

    #[must_use]
    pub fn with_timeouts(mut self, read: Duration, mutate: Duration) -> Self {
        self.read_timeout = read;
        self.mutate_timeout = mutate;
        self
    }

    fn kubectl(&self) -> CommandSpec {
        let mut spec = CommandSpec::new("kubectl");
        if let Some(path) = &self.kubeconfig {
            spec = spec.arg(format!("--kubeconfig={}", path.display()));
        }
        match &self.context {
            Some(ctx) => spec.args(["--context", ctx.as_str()]),
            None => spec,
        }
    }
}

fn missing_resource(stderr: &str) -> bool {
    stderr.contains("doesn't have a resource type") || stderr.contains("NotFound")
}

#[async_trait]
impl WorkloadClient for Kubectl {
    async fn export_namespace(&self, namespace: &str) -> Result<Option<String>, RolloutError> {
        let ns = self
            .runner
            .run(
                &self
                    .kubectl()
                    .args(["get", "namespace", namespace, "-o", "name"])
                    .timeout(self.read_timeout),
            )
            .await
            .map_err(|e| RolloutError::connectivity("kubectl", e))?;
        if !ns.success() {
            if missing_resource(&ns.stderr) {
                debug!(namespace, "Namespace not present, skipping export");
                return Ok(None);
            }
            return Err(RolloutError::Backup(format!(
                "failed to look up namespace {namespace}: {}",
                ns.stderr.trim()
            )));
        }

        let spec = self
            .kubectl()
            .args(["get", BACKUP_RESOURCE_KINDS, "-n", namespace, "-o", "yaml"])
            .timeout(self.read_timeout);
        let output = run_checked(self.runner.as_ref(), &spec)
            .await
            .map_err(|e| RolloutError::Backup(format!("export of {namespace} failed: {e}")))?;
        Ok(Some(output.stdout))
    }

    async fn export_gitops_applications(&self) -> Result<Option<String>, RolloutError> {
        let spec = self
            .kubectl()
            .args(["get", GITOPS_APPLICATIONS, "-A", "-o", "yaml"])
            .timeout(self.read_timeout);
        let output = self
            .runner
            .run(&spec)
            .await
            .map_err(|e| RolloutError::connectivity("kubectl", e))?;
        if output.success() {
            Ok(Some(output.stdout))
        } else if missing_resource(&output.stderr) {
            debug!("GitOps application CRD not installed");
            Ok(None)
        } else {
            Err(RolloutError::Backup(format!(
                "export of GitOps applications failed: {}",
                output.stderr.trim()
            )))
        }
    }

    async fn diff(&self, path: &Path) -> Result<String, RolloutError> {
        let spec = self
            .kubectl()
            .args(["diff", "--server-side", "-f"])
            .arg(path.display().to_string())
            .timeout(self.read_timeout);
        let output = self
            .runner
            .run(&spec)
            .await
            .map_err(|e| RolloutError::connectivity("kubectl", e))?;
        // kubectl diff exits 1 when differences exist
        match output.code {
            0 | 1 => Ok(output.stdout),
            code => Err(RolloutError::Executor {
                message: format!("kubectl diff exited with {code}: {}", output.stderr.trim()),
                backup: None,
            }),
        }
    }

    async fn apply_path(&self, path: &Path) -> Result<String, RolloutError> {
        let spec = self
            .kubectl()
            .args(["apply", "-f"])
            .arg(path.display().to_string())
            .timeout(self.mutate_timeout);
        info!(path = %path.display(), "Applying manifests");
        run_checked(self.runner.as_ref(), &spec)
            .await
            .map(|o| o.stdout)
            .map_err(|e| match e {
                CommandError::Failed { .. } => RolloutError::Executor {
                    message: e.to_string(),
                    backup: None,
                },
                other => RolloutError::connectivity("kubectl", other),
            })
    }

    async fn dns_probe(&self, hostname: &str) -> Result<bool, RolloutError> {
        let pod = format!("dns-probe-{}", chrono::Utc::now().timestamp());
        let spec = self
            .kubectl()
            .args([
                "run",
                pod.as_str(),
                "--image",
                DNS_PROBE_IMAGE,
                "--restart=Never",
                "--rm",
                "-i",
                "--quiet",
                "--command",
                "--",
                "nslookup",
                hostname,
            ])
            .timeout(self.read_timeout * 2);
        let output = self
            .runner
            .run(&spec)
            .await
            .map_err(|e| RolloutError::connectivity("kubectl", e))?;
        Ok(output.success() && output.stdout.contains("Address"))
    }
}
