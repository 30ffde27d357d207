//! Change executors.
//!
//! [`ChangeExecutor`] is chosen once per run from the request's execution
//! mode. Both variants honour dry-run (reads and plans only) and report how
//! long the mutating calls took. Any failure of a mutating call comes back as
//! [`RolloutError::Executor`] carrying the backup location.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cluster::{ClusterStatusReader, ManagedClusterControl, UpgradeTarget, WorkloadClient};
use crate::config::{ChangeRequest, Component, ExecutionMode, ImperativeScope};
use crate::confirm::{self, ConfirmationPort};
use crate::context::RunContext;
use crate::error::RolloutError;
use crate::infra::{InfraBackend, PlanSummary};
use crate::ui;

/// Collaborators the executors mutate through.
#[derive(Clone)]
pub struct ExecutorBackends {
    pub infra: Arc<dyn InfraBackend>,
    pub control: Arc<dyn ManagedClusterControl>,
    pub workloads: Arc<dyn WorkloadClient>,
    pub reader: Arc<dyn ClusterStatusReader>,
}

/// What an executor did (or would have done).
#[derive(Debug, Clone, Default)]
pub struct ExecutionResult {
    pub dry_run: bool,
    pub plan: Option<PlanSummary>,
    /// Manifest paths with pending differences.
    pub manifest_diffs: Vec<PathBuf>,
    /// Mutating calls issued, or planned under dry-run.
    pub actions: Vec<String>,
    /// Wall time spent inside mutating calls.
    pub mutation_duration: Duration,
}

impl ExecutionResult {
    fn record(&mut self, action: impl Into<String>) {
        let action = action.into();
        if self.dry_run {
            ui::print_info(&format!("[dry-run] would {action}"));
        } else {
            info!(action = %action, "Mutation complete");
        }
        self.actions.push(action);
    }
}

/// Mutation strategy selected at run start.
pub enum ChangeExecutor {
    /// Plan-then-apply through the infra backend; manifests diffed then applied.
    Declarative(ExecutorBackends),
    /// Scoped managed-cluster commands; manifests applied directly.
    Imperative(ExecutorBackends),
}

impl ChangeExecutor {
    #[must_use]
    pub fn select(mode: ExecutionMode, backends: ExecutorBackends) -> Self {
        match mode {
            ExecutionMode::Declarative => Self::Declarative(backends),
            ExecutionMode::Imperative => Self::Imperative(backends),
        }
    }

    #[must_use]
    pub fn mode(&self) -> ExecutionMode {
        match self {
            Self::Declarative(_) => ExecutionMode::Declarative,
            Self::Imperative(_) => ExecutionMode::Imperative,
        }
    }

    /// Apply the run's change.
    ///
    /// # Errors
    ///
    /// Returns `Executor` when a mutating call fails, `Declined` when a
    /// required confirmation is refused, `Config` when manifests are missing,
    /// and read errors as returned by the collaborators.
    pub async fn apply(
        &self,
        ctx: &RunContext,
        confirm: &dyn ConfirmationPort,
    ) -> Result<ExecutionResult, RolloutError> {
        let request = ctx.request();
        let manifest_paths = manifest_paths(ctx)?;
        let mut result = ExecutionResult {
            dry_run: request.dry_run,
            ..ExecutionResult::default()
        };

        let cancel = &ctx.cancel;
        match self {
            Self::Declarative(backends) => {
                declarative(backends, request, &manifest_paths, confirm, cancel, &mut result).await
            }
            Self::Imperative(backends) => {
                imperative(backends, request, &manifest_paths, confirm, cancel, &mut result).await
            }
        }
        .map_err(|e| attach_backup(e, ctx.backup_path()))?;

        if !request.dry_run {
            info!(
                mode = %self.mode(),
                actions = result.actions.len(),
                mutation_secs = result.mutation_duration.as_secs_f64(),
                "Change applied"
            );
        }
        Ok(result)
    }
}

fn manifest_paths(ctx: &RunContext) -> Result<Vec<PathBuf>, RolloutError> {
    ctx.request()
        .component
        .manifest_dirs()
        .iter()
        .map(|dir| {
            let path = ctx.manifest_path(dir);
            if path.exists() {
                Ok(path)
            } else {
                Err(RolloutError::Config(format!(
                    "manifest directory {} not found",
                    path.display()
                )))
            }
        })
        .collect()
}

fn attach_backup(err: RolloutError, backup: Option<PathBuf>) -> RolloutError {
    match err {
        RolloutError::Executor { message, backup: None } => RolloutError::Executor { message, backup },
        other => other,
    }
}

/// Wrap a mutating call: time it and turn any failure into an executor error.
///
/// No new mutation starts once the run is cancelled; one already in flight
/// is left to finish.
async fn mutate<F, T>(
    result: &mut ExecutionResult,
    cancel: &CancellationToken,
    what: &str,
    call: F,
) -> Result<T, RolloutError>
where
    F: std::future::Future<Output = Result<T, RolloutError>>,
{
    if cancel.is_cancelled() {
        warn!(what, "Run cancelled, not starting mutation");
        return Err(RolloutError::Cancelled);
    }
    let started = Instant::now();
    let outcome = call.await;
    result.mutation_duration += started.elapsed();
    outcome.map_err(|e| match e {
        RolloutError::Executor { .. } | RolloutError::Cancelled => e,
        other => RolloutError::Executor {
            message: format!("{what}: {other}"),
            backup: None,
        },
    })
}

async fn declarative(
    backends: &ExecutorBackends,
    request: &ChangeRequest,
    manifest_paths: &[PathBuf],
    confirm: &dyn ConfirmationPort,
    cancel: &CancellationToken,
    result: &mut ExecutionResult,
) -> Result<(), RolloutError> {
    if request.component.touches_infrastructure() {
        backends.infra.init().await?;
        let plan = backends.infra.plan(request.target_version).await?;
        ui::print_kv("Plan", &plan.to_string());
        if request.dry_run {
            ui::print_block("Plan output", &plan.raw);
        }

        if !plan.has_changes() {
            ui::print_info("Infrastructure is up to date, nothing to apply");
        } else if request.dry_run {
            result.record(format!("apply infrastructure plan ({plan})"));
        } else {
            if plan.is_destructive() {
                warn!(destroy = plan.destroy, "Plan destroys resources");
                confirm::require(
                    confirm,
                    &format!(
                        "Plan destroys {} resource(s) in {}. Apply anyway?",
                        plan.destroy, request.environment
                    ),
                )
                .await?;
            }
            mutate(result, cancel, "infrastructure apply", backends.infra.apply()).await?;
            result.record(format!("apply infrastructure plan ({plan})"));
        }
        result.plan = Some(plan);
    }

    for path in manifest_paths {
        let diff = backends.workloads.diff(path).await?;
        if diff.trim().is_empty() {
            ui::print_info(&format!("{}: no differences", path.display()));
            continue;
        }
        result.manifest_diffs.push(path.clone());
        if request.dry_run {
            ui::print_block(&format!("Diff for {}", path.display()), &diff);
        } else {
            mutate(result, cancel, "manifest apply", backends.workloads.apply_path(path)).await?;
        }
        result.record(format!("apply manifests from {}", path.display()));
    }
    Ok(())
}

async fn imperative(
    backends: &ExecutorBackends,
    request: &ChangeRequest,
    manifest_paths: &[PathBuf],
    confirm: &dyn ConfirmationPort,
    cancel: &CancellationToken,
    result: &mut ExecutionResult,
) -> Result<(), RolloutError> {
    let scope = &request.imperative_scope;
    let whole_cluster = request.component.touches_infrastructure() && *scope == ImperativeScope::Full;
    if !request.dry_run && (whole_cluster || request.component == Component::All) {
        confirm::require(
            confirm,
            &format!(
                "This upgrades the entire {} environment ({}). Continue?",
                request.environment, request.component
            ),
        )
        .await?;
    }

    if request.component.touches_infrastructure() {
        if *scope == ImperativeScope::NodeImage {
            let pools = backends.reader.node_pools().await?;
            for pool in &pools {
                if !request.dry_run {
                    mutate(
                        result,
                        cancel,
                        "node image upgrade",
                        backends.control.upgrade_node_image(&pool.name),
                    )
                    .await?;
                }
                result.record(format!("start node image refresh on pool {}", pool.name));
            }
        } else {
            let target = request.target_version.ok_or_else(|| {
                RolloutError::Config(format!("scope {scope} requires a target version"))
            })?;
            let (upgrade, label) = match scope {
                ImperativeScope::ControlPlane => (UpgradeTarget::ControlPlane, "control plane".to_string()),
                ImperativeScope::NodePool(pool) => {
                    (UpgradeTarget::NodePool(pool.clone()), format!("node pool {pool}"))
                }
                _ => (UpgradeTarget::Cluster, "cluster".to_string()),
            };
            if !request.dry_run {
                mutate(result, cancel, "version upgrade", backends.control.upgrade(&target, upgrade)).await?;
            }
            result.record(format!("upgrade {label} to {target}"));
        }
    }

    for path in manifest_paths {
        if request.dry_run {
            let diff = backends.workloads.diff(path).await?;
            if !diff.trim().is_empty() {
                result.manifest_diffs.push(path.clone());
            }
        } else {
            mutate(result, cancel, "manifest apply", backends.workloads.apply_path(path)).await?;
        }
        result.record(format!("apply manifests from {}", path.display()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::BackupRecord;
    use crate::cluster::{
        MockClusterStatusReader, MockManagedClusterControl, MockWorkloadClient, NodePool,
    };
    use crate::config::{Environment, RolloutConfig};
    use crate::confirm::{AutoConfirm, MockConfirmationPort};
    use crate::infra::MockInfraBackend;
    use crate::version::KubeVersion;
    use chrono::Utc;
    use std::path::Path;
    use tokio_util::sync::CancellationToken;

    fn backends(
        infra: MockInfraBackend,
        control: MockManagedClusterControl,
        workloads: MockWorkloadClient,
        reader: MockClusterStatusReader,
    ) -> ExecutorBackends {
        ExecutorBackends {
            infra: Arc::new(infra),
            control: Arc::new(control),
            workloads: Arc::new(workloads),
            reader: Arc::new(reader),
        }
    }

    fn ctx(request: ChangeRequest, manifests: &Path) -> RunContext {
        let config = RolloutConfig {
            manifests_dir: manifests.to_path_buf(),
            ..RolloutConfig::default()
        };
        RunContext::new(request, Arc::new(config), CancellationToken::new())
    }

    fn upgrade_request() -> ChangeRequest {
        ChangeRequest::new(Environment::Dev, Component::Infrastructure)
            .with_target_version(KubeVersion::new(1, 29, 0))
    }

    fn planning_infra(plan: &'static str) -> MockInfraBackend {
        let mut infra = MockInfraBackend::new();
        infra.expect_init().returning(|| Ok(()));
        infra
            .expect_plan()
            .returning(move |_| Ok(PlanSummary::parse(plan).unwrap()));
        infra
    }

    #[tokio::test]
    async fn test_declarative_dry_run_never_applies() {
        let tmp = tempfile::tempdir().unwrap();
        let mut infra = planning_infra("Plan: 0 to add, 2 to change, 0 to destroy.");
        infra.expect_apply().never();

        let mut request = upgrade_request();
        request.dry_run = true;
        let executor = ChangeExecutor::select(
            ExecutionMode::Declarative,
            backends(
                infra,
                MockManagedClusterControl::new(),
                MockWorkloadClient::new(),
                MockClusterStatusReader::new(),
            ),
        );
        let result = executor
            .apply(&ctx(request, tmp.path()), &AutoConfirm::deny())
            .await
            .unwrap();
        assert!(result.dry_run);
        assert_eq!(result.actions.len(), 1);
        assert_eq!(result.plan.unwrap().change, 2);
    }

    #[tokio::test]
    async fn test_cancelled_run_starts_no_mutation() {
        let tmp = tempfile::tempdir().unwrap();
        let mut infra = planning_infra("Plan: 0 to add, 1 to change, 0 to destroy.");
        infra.expect_apply().never();

        let executor = ChangeExecutor::select(
            ExecutionMode::Declarative,
            backends(
                infra,
                MockManagedClusterControl::new(),
                MockWorkloadClient::new(),
                MockClusterStatusReader::new(),
            ),
        );
        let run = ctx(upgrade_request(), tmp.path());
        run.cancel.cancel();
        let err = executor.apply(&run, &AutoConfirm::approve()).await.unwrap_err();
        assert!(matches!(err, RolloutError::Cancelled));
    }

    #[tokio::test]
    async fn test_destructive_plan_needs_confirmation() {
        let tmp = tempfile::tempdir().unwrap();
        let mut infra = planning_infra("Plan: 1 to add, 0 to change, 1 to destroy.");
        infra.expect_apply().never();

        let executor = ChangeExecutor::select(
            ExecutionMode::Declarative,
            backends(
                infra,
                MockManagedClusterControl::new(),
                MockWorkloadClient::new(),
                MockClusterStatusReader::new(),
            ),
        );
        let err = executor
            .apply(&ctx(upgrade_request(), tmp.path()), &AutoConfirm::deny())
            .await
            .unwrap_err();
        assert!(matches!(err, RolloutError::Declined(_)));
    }

    #[tokio::test]
    async fn test_apply_failure_carries_backup_path() {
        let tmp = tempfile::tempdir().unwrap();
        let mut infra = planning_infra("Plan: 0 to add, 1 to change, 0 to destroy.");
        infra.expect_apply().times(1).returning(|| {
            Err(RolloutError::connectivity("terraform", "timed out after 3600s"))
        });

        let executor = ChangeExecutor::select(
            ExecutionMode::Declarative,
            backends(
                infra,
                MockManagedClusterControl::new(),
                MockWorkloadClient::new(),
                MockClusterStatusReader::new(),
            ),
        );
        let mut run = ctx(upgrade_request(), tmp.path());
        run.backup = Some(BackupRecord {
            id: "dev-20240501T100000Z".into(),
            environment: Environment::Dev,
            component: Component::Infrastructure,
            created_at: Utc::now(),
            directory: PathBuf::from("/backups/dev-20240501T100000Z"),
            infra_state: None,
            manifests: vec![],
            gitops_applications: None,
        });

        let err = executor.apply(&run, &AutoConfirm::approve()).await.unwrap_err();
        match err {
            RolloutError::Executor { message, backup } => {
                assert!(message.contains("infrastructure apply"));
                assert_eq!(backup, Some(PathBuf::from("/backups/dev-20240501T100000Z")));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_imperative_full_upgrade_requires_confirmation() {
        let tmp = tempfile::tempdir().unwrap();
        let mut control = MockManagedClusterControl::new();
        control
            .expect_upgrade()
            .withf(|v, t| *v == KubeVersion::new(1, 29, 0) && *t == UpgradeTarget::Cluster)
            .times(1)
            .returning(|_, _| Ok(()));
        let mut confirm = MockConfirmationPort::new();
        confirm.expect_confirm().times(1).returning(|_| Ok(true));

        let executor = ChangeExecutor::select(
            ExecutionMode::Imperative,
            backends(
                MockInfraBackend::new(),
                control,
                MockWorkloadClient::new(),
                MockClusterStatusReader::new(),
            ),
        );
        let request = upgrade_request().with_mode(ExecutionMode::Imperative);
        let result = executor.apply(&ctx(request, tmp.path()), &confirm).await.unwrap();
        assert_eq!(result.actions, vec!["upgrade cluster to 1.29.0".to_string()]);
    }

    #[tokio::test]
    async fn test_node_image_refresh_every_pool() {
        let tmp = tempfile::tempdir().unwrap();
        let mut reader = MockClusterStatusReader::new();
        reader.expect_node_pools().returning(|| {
            Ok(["system", "user"]
                .iter()
                .map(|name| NodePool {
                    name: (*name).into(),
                    count: 3,
                    max_count: None,
                    max_surge: None,
                    provisioning_state: "Succeeded".into(),
                    power_state: "Running".into(),
                    orchestrator_version: None,
                    node_image_version: None,
                })
                .collect())
        });
        let mut control = MockManagedClusterControl::new();
        control.expect_upgrade_node_image().times(2).returning(|_| Ok(()));

        let executor = ChangeExecutor::select(
            ExecutionMode::Imperative,
            backends(MockInfraBackend::new(), control, MockWorkloadClient::new(), reader),
        );
        let request = ChangeRequest::new(Environment::Staging, Component::Infrastructure)
            .with_mode(ExecutionMode::Imperative)
            .with_scope(ImperativeScope::NodeImage);
        let result = executor
            .apply(&ctx(request, tmp.path()), &AutoConfirm::deny())
            .await
            .unwrap();
        assert_eq!(result.actions.len(), 2);
    }

    #[tokio::test]
    async fn test_missing_manifest_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let executor = ChangeExecutor::select(
            ExecutionMode::Declarative,
            backends(
                MockInfraBackend::new(),
                MockManagedClusterControl::new(),
                MockWorkloadClient::new(),
                MockClusterStatusReader::new(),
            ),
        );
        let request = ChangeRequest::new(Environment::Dev, Component::Applications);
        let err = executor
            .apply(&ctx(request, tmp.path()), &AutoConfirm::approve())
            .await
            .unwrap_err();
        assert!(matches!(err, RolloutError::Config(_)));
    }

    #[tokio::test]
    async fn test_declarative_manifests_diff_then_apply() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("applications")).unwrap();
        let mut workloads = MockWorkloadClient::new();
        workloads
            .expect_diff()
            .returning(|_| Ok("+  replicas: 3".into()));
        workloads
            .expect_apply_path()
            .times(1)
            .returning(|_| Ok("deployment.apps/api configured".into()));

        let executor = ChangeExecutor::select(
            ExecutionMode::Declarative,
            backends(
                MockInfraBackend::new(),
                MockManagedClusterControl::new(),
                workloads,
                MockClusterStatusReader::new(),
            ),
        );
        let request = ChangeRequest::new(Environment::Dev, Component::Applications);
        let result = executor
            .apply(&ctx(request, tmp.path()), &AutoConfirm::approve())
            .await
            .unwrap();
        assert_eq!(result.manifest_diffs, vec![tmp.path().join("applications")]);
    }
}
