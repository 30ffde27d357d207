//! Checks run before any mutation.
//!
//! [`PreflightValidator`] produces a [`CheckReport`]. Any `Fail` entry blocks
//! the run unless preflight is skipped; warnings are informational. Read
//! errors from the cluster are returned as errors, not report entries, so the
//! orchestrator can abort on lost connectivity.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::cluster::{ClusterStatusReader, ManagedClusterControl, NodePool};
use crate::command::{CommandRunner, CommandSpec};
use crate::config::{ChangeRequest, ImperativeScope};
use crate::confirm::ConfirmationPort;
use crate::error::RolloutError;
use crate::health::HealthSnapshot;
use crate::report::{CheckReport, CheckResult};
use crate::version::{check_upgrade_path, KubeVersion};

/// API group/versions no longer served, keyed by the minor that removed them.
const REMOVED_APIS: &[(u32, &str)] = &[
    (25, "batch/v1beta1"),
    (25, "discovery.k8s.io/v1beta1"),
    (25, "events.k8s.io/v1beta1"),
    (25, "autoscaling/v2beta1"),
    (25, "policy/v1beta1"),
    (25, "node.k8s.io/v1beta1"),
    (26, "flowcontrol.apiserver.k8s.io/v1beta1"),
    (26, "autoscaling/v2beta2"),
    (27, "storage.k8s.io/v1beta1"),
    (29, "flowcontrol.apiserver.k8s.io/v1beta2"),
    (32, "flowcontrol.apiserver.k8s.io/v1beta3"),
];

/// Served API versions that stop being served between `current` and `target`.
#[must_use]
pub fn removed_between(
    served: &[String],
    current: &KubeVersion,
    target: &KubeVersion,
) -> Vec<(u32, &'static str)> {
    REMOVED_APIS
        .iter()
        .filter(|(minor, _)| *minor > current.minor && *minor <= target.minor)
        .filter(|(_, api)| served.iter().any(|s| s == api))
        .copied()
        .collect()
}

#[derive(Debug, Deserialize)]
struct PlutoOutput {
    #[serde(default)]
    items: Option<Vec<PlutoItem>>,
}

#[derive(Debug, Deserialize)]
struct PlutoItem {
    name: String,
    #[serde(default)]
    namespace: Option<String>,
    api: PlutoApi,
    #[serde(default)]
    deprecated: bool,
    #[serde(default)]
    removed: bool,
}

#[derive(Debug, Deserialize)]
struct PlutoApi {
    version: String,
    kind: String,
}

impl PlutoItem {
    fn describe(&self) -> String {
        let ns = self.namespace.as_deref().unwrap_or("-");
        format!("{} {ns}/{} ({})", self.api.kind, self.name, self.api.version)
    }
}

/// Read-only checks before backup and execution.
pub struct PreflightValidator {
    reader: Arc<dyn ClusterStatusReader>,
    control: Arc<dyn ManagedClusterControl>,
    scanner: Option<Arc<dyn CommandRunner>>,
    scan_timeout: Duration,
}

impl PreflightValidator {
    #[must_use]
    pub fn new(reader: Arc<dyn ClusterStatusReader>, control: Arc<dyn ManagedClusterControl>) -> Self {
        Self {
            reader,
            control,
            scanner: None,
            scan_timeout: Duration::from_secs(300),
        }
    }

    /// Use `pluto` through `runner` for the deprecated-API scan.
    #[must_use]
    pub fn with_scanner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.scanner = Some(runner);
        self
    }

    /// Run every applicable check.
    ///
    /// # Errors
    ///
    /// Returns connectivity errors from the cluster or control API.
    pub async fn run(
        &self,
        request: &ChangeRequest,
        baseline: &HealthSnapshot,
        confirm: &dyn ConfirmationPort,
    ) -> Result<CheckReport, RolloutError> {
        let mut report = CheckReport::new("Preflight Checks");
        report.push(baseline_check(baseline, confirm).await?);

        let pools = if request.component.touches_infrastructure() {
            let pools = self.reader.node_pools().await?;
            report.push(node_pool_health(&pools));
            pools
        } else {
            Vec::new()
        };

        if let Some(target) = request.target_version.filter(|_| request.component.touches_infrastructure()) {
            let current = self.reader.control_plane_state().await?.kubernetes_version;
            report.push(self.version_check(request, &current, &target, &pools).await?);
            report.extend(self.deprecated_api_checks(&current, &target).await?);
        }

        if request.is_cluster_upgrade() {
            report.extend(surge_checks(&pools, &request.imperative_scope));
        }

        report.push(self.disruption_budget_check().await);

        let totals = report.totals();
        info!(
            passed = totals.passed,
            warnings = totals.warnings,
            failed = totals.failed,
            "Preflight complete"
        );
        Ok(report)
    }

    async fn version_check(
        &self,
        request: &ChangeRequest,
        current: &KubeVersion,
        target: &KubeVersion,
        pools: &[NodePool],
    ) -> Result<CheckResult, RolloutError> {
        const NAME: &str = "version compatibility";

        if let ImperativeScope::NodePool(name) = &request.imperative_scope {
            let Some(pool) = pools.iter().find(|p| &p.name == name) else {
                return Ok(CheckResult::fail(NAME, format!("node pool {name} not found")));
            };
            if target > current {
                return Ok(CheckResult::fail(
                    NAME,
                    format!("pool target {target} is ahead of control plane {current}"),
                ));
            }
            return Ok(match pool.orchestrator_version {
                Some(pool_version) => match pool_version.minor_distance(target) {
                    Some(d) if (0..=1).contains(&d) && *target > pool_version => CheckResult::pass(
                        NAME,
                        format!("pool {name}: {pool_version} -> {target}"),
                    ),
                    _ => CheckResult::fail(
                        NAME,
                        format!("pool {name}: {pool_version} -> {target} is not a single upgrade step"),
                    ),
                },
                None => CheckResult::warn(NAME, format!("pool {name} reports no version")),
            });
        }

        let available = self.control.available_upgrades().await?;
        debug!(%current, %target, ?available, "Checking upgrade path");
        Ok(match check_upgrade_path(current, target, &available) {
            Ok(()) => CheckResult::pass(NAME, format!("{current} -> {target}")),
            Err(e) => CheckResult::fail(NAME, format!("{current} -> {target}: {e}")),
        })
    }

    async fn deprecated_api_checks(
        &self,
        current: &KubeVersion,
        target: &KubeVersion,
    ) -> Result<Vec<CheckResult>, RolloutError> {
        const NAME: &str = "deprecated APIs";

        if let Some(runner) = &self.scanner {
            match self.pluto_scan(runner.as_ref(), target).await {
                Ok(result) => return Ok(vec![result]),
                Err(e) => warn!(error = %e, "pluto scan failed, using static removal table"),
            }
        }

        let served = self.reader.served_api_versions().await?;
        let removed = removed_between(&served, current, target);
        if removed.is_empty() {
            return Ok(vec![CheckResult::pass(
                NAME,
                format!("no served API versions removed up to {target}"),
            )]);
        }
        Ok(removed
            .into_iter()
            .map(|(minor, api)| {
                CheckResult::warn(
                    NAME,
                    format!("{api} is served but removed in 1.{minor}; migrate manifests before upgrading"),
                )
            })
            .collect())
    }

    async fn pluto_scan(&self, runner: &dyn CommandRunner, target: &KubeVersion) -> Result<CheckResult, RolloutError> {
        const NAME: &str = "deprecated APIs (pluto)";

        let spec = CommandSpec::new("pluto")
            .args(["detect-all-in-cluster", "-o", "json", "--target-versions"])
            .arg(format!("k8s=v{target}"))
            .timeout(self.scan_timeout);
        let output = runner.run(&spec).await?;
        // pluto exits 2 for deprecations and 3 for removals
        if !matches!(output.code, 0 | 2 | 3) {
            return Err(RolloutError::Validation(format!(
                "pluto exited with {}: {}",
                output.code,
                output.stderr.trim()
            )));
        }
        let parsed: PlutoOutput = if output.stdout.trim().is_empty() {
            PlutoOutput { items: None }
        } else {
            serde_json::from_str(&output.stdout)?
        };
        let items = parsed.items.unwrap_or_default();
        let removed: Vec<String> = items.iter().filter(|i| i.removed).map(PlutoItem::describe).collect();
        let deprecated: Vec<String> = items
            .iter()
            .filter(|i| i.deprecated && !i.removed)
            .map(PlutoItem::describe)
            .collect();

        Ok(if !removed.is_empty() {
            CheckResult::fail(NAME, format!("removed in {target}: {}", removed.join(", ")))
        } else if !deprecated.is_empty() {
            CheckResult::warn(NAME, format!("deprecated: {}", deprecated.join(", ")))
        } else {
            CheckResult::pass(NAME, format!("no deprecated resources for {target}"))
        })
    }

    async fn disruption_budget_check(&self) -> CheckResult {
        const NAME: &str = "disruption budgets";

        match self.reader.disruption_budgets().await {
            Ok(budgets) => {
                let blocking: Vec<String> = budgets
                    .iter()
                    .filter(|b| b.disruptions_allowed == 0)
                    .map(|b| format!("{}/{}", b.namespace, b.name))
                    .collect();
                if blocking.is_empty() {
                    CheckResult::pass(NAME, format!("{} budget(s) allow disruptions", budgets.len()))
                } else {
                    CheckResult::warn(
                        NAME,
                        format!("zero allowed disruptions: {} (node drains may stall)", blocking.join(", ")),
                    )
                }
            }
            Err(e) => CheckResult::warn(NAME, format!("could not list budgets: {e}")),
        }
    }
}

/// Unhealthy baselines fail in CI and need an explicit go-ahead otherwise.
async fn baseline_check(
    baseline: &HealthSnapshot,
    confirm: &dyn ConfirmationPort,
) -> Result<CheckResult, RolloutError> {
    const NAME: &str = "baseline health";

    let unhealthy = baseline.unhealthy_node_count();
    let failed = baseline.failed_pod_count();
    if unhealthy == 0 && failed == 0 {
        return Ok(CheckResult::pass(
            NAME,
            format!("{} node(s) ready, no failed pods", baseline.nodes.len()),
        ));
    }

    let mut detail = format!("{unhealthy} unhealthy node(s), {failed} failed pod(s)");
    if failed > 0 {
        detail.push_str(&format!(": {}", baseline.failed_pod_names(5)));
    }
    warn!(unhealthy, failed, "Baseline is not healthy");

    if !confirm.is_interactive() {
        return Ok(CheckResult::fail(NAME, format!("{detail} (non-interactive)")));
    }
    if confirm
        .confirm(&format!("Cluster baseline is unhealthy ({detail}). Continue anyway?"))
        .await?
    {
        Ok(CheckResult::warn(NAME, format!("{detail} (accepted by operator)")))
    } else {
        Ok(CheckResult::fail(NAME, format!("{detail} (declined by operator)")))
    }
}

fn node_pool_health(pools: &[NodePool]) -> CheckResult {
    const NAME: &str = "node pool health";

    if pools.is_empty() {
        return CheckResult::warn(NAME, "no node pools reported");
    }
    let failures: Vec<String> = pools
        .iter()
        .filter(|p| p.provisioning_state != "Succeeded" || p.power_state != "Running")
        .map(|p| format!("{}: {}/{}", p.name, p.provisioning_state, p.power_state))
        .collect();
    if failures.is_empty() {
        CheckResult::pass(NAME, format!("{} pool(s) Succeeded/Running", pools.len()))
    } else {
        CheckResult::fail(NAME, failures.join("; "))
    }
}

fn surge_checks(pools: &[NodePool], scope: &ImperativeScope) -> Vec<CheckResult> {
    pools
        .iter()
        .filter(|p| match scope {
            ImperativeScope::NodePool(name) => &p.name == name,
            ImperativeScope::ControlPlane => false,
            _ => true,
        })
        .map(|pool| {
            let name = format!("surge capacity ({})", pool.name);
            let required = pool.required_capacity();
            let surge = required - pool.count;
            match pool.max_count {
                Some(max) if required > max => CheckResult::warn(
                    name,
                    format!(
                        "needs {required} nodes during upgrade ({} + {surge} surge), autoscaler max is {max}",
                        pool.count
                    ),
                ),
                Some(max) => CheckResult::pass(name, format!("{required} of max {max} nodes")),
                None => CheckResult::pass(
                    name,
                    format!("{required} nodes during upgrade; no autoscaler maximum to check"),
                ),
            }
        })
        .collect()
}
