//! In-memory platform shared by the integration tests.
//!
//! [`FakePlatform`] plays every collaborator at once: the cluster reader, the
//! managed-cluster API, the infra backend and the workload client. Applying a
//! plan moves the cluster to the planned version and can inject failed pods.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use notify::Notifier;

use rollout::cluster::{
    CertificateStatus, ClusterStatusReader, ControlPlaneState, DisruptionBudgetStatus,
    ManagedClusterControl, NamespaceScope, NodeCondition, NodePool, NodeStatus, PodStatus,
    ServiceStatus, UpgradeTarget, VolumeClaimStatus, WorkloadClient,
};
use rollout::config::{Environment, RolloutConfig};
use rollout::confirm::AutoConfirm;
use rollout::infra::{InfraBackend, PlanSummary};
use rollout::lock::{InMemoryLock, RunLock};
use rollout::orchestrator::Collaborators;
use rollout::version::KubeVersion;
use rollout::RolloutError;

pub fn v(s: &str) -> KubeVersion {
    s.parse().unwrap()
}

/// Mutable cluster state behind the fake.
#[derive(Debug, Clone)]
pub struct ClusterState {
    pub control_plane: KubeVersion,
    pub pool_versions: Vec<(String, KubeVersion)>,
    pub available: Vec<KubeVersion>,
    pub failed_pods: usize,
    /// Failed pods that appear once the plan is applied.
    pub failed_pods_after_apply: usize,
    pub planned: Option<KubeVersion>,
    pub infra_state: String,
    pub applies: u32,
    pub control_upgrades: Vec<(KubeVersion, UpgradeTarget)>,
    pub state_pushes: Vec<String>,
    pub manifest_applies: Vec<PathBuf>,
    pub manifest_diff: String,
    /// Make every `push_state` fail.
    pub reject_state_push: bool,
    /// How long `apply` runs before it takes effect.
    pub apply_delay: Duration,
}

impl ClusterState {
    pub fn at(version: &str) -> Self {
        Self {
            control_plane: v(version),
            pool_versions: vec![("system".into(), v(version)), ("user".into(), v(version))],
            available: vec![],
            failed_pods: 0,
            failed_pods_after_apply: 0,
            planned: None,
            infra_state: r#"{"version": 4, "serial": 12, "resources": []}"#.into(),
            applies: 0,
            control_upgrades: vec![],
            state_pushes: vec![],
            manifest_applies: vec![],
            manifest_diff: String::new(),
            reject_state_push: false,
            apply_delay: Duration::ZERO,
        }
    }

    fn move_to(&mut self, version: KubeVersion) {
        self.control_plane = version;
        for (_, pool_version) in &mut self.pool_versions {
            *pool_version = version;
        }
    }
}

#[derive(Clone)]
pub struct FakePlatform {
    state: Arc<Mutex<ClusterState>>,
}

impl FakePlatform {
    pub fn new(state: ClusterState) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Collaborators wired to this fake with an auto-approving operator.
    pub fn collaborators(&self, lock: Arc<dyn RunLock>) -> Collaborators {
        let fake = Arc::new(self.clone());
        Collaborators {
            reader: fake.clone(),
            control: fake.clone(),
            workloads: fake.clone(),
            infra: fake,
            lock,
            confirm: Arc::new(AutoConfirm::approve()),
            scanner: None,
            notifier: Arc::new(Notifier::disabled()),
        }
    }

    pub fn unlocked(&self) -> Collaborators {
        self.collaborators(Arc::new(InMemoryLock::new()))
    }
}

fn node(name: &str, pool: &str, version: KubeVersion) -> NodeStatus {
    NodeStatus {
        name: name.into(),
        ready: true,
        conditions: vec![NodeCondition {
            kind: "Ready".into(),
            status: "True".into(),
        }],
        unschedulable: false,
        created_at: Some(Utc::now() - ChronoDuration::days(30)),
        kubelet_version: Some(format!("v{version}")),
        pool: Some(pool.into()),
    }
}

fn pod(namespace: &str, name: &str, status: &str) -> PodStatus {
    let running = status == "Running";
    PodStatus {
        namespace: namespace.into(),
        name: name.into(),
        phase: if running { "Running" } else { "Failed" }.into(),
        status: status.into(),
        ready: running,
        restarts: if running { 0 } else { 7 },
    }
}

fn system_pods() -> Vec<PodStatus> {
    vec![
        pod("kube-system", "coredns-5d78c9869d-abcde", "Running"),
        pod("kube-system", "coredns-5d78c9869d-fghij", "Running"),
        pod("kube-system", "metrics-server-7f9c8d5b6-xyz12", "Running"),
    ]
}

#[async_trait]
impl ClusterStatusReader for FakePlatform {
    async fn nodes(&self) -> Result<Vec<NodeStatus>, RolloutError> {
        let state = self.state();
        let nodes = state
            .pool_versions
            .iter()
            .flat_map(|(pool, version)| {
                (0..2).map(move |i| node(&format!("aks-{pool}-0000{i}"), pool, *version))
            })
            .collect();
        Ok(nodes)
    }

    async fn pods(&self, scope: NamespaceScope) -> Result<Vec<PodStatus>, RolloutError> {
        let failed = self.state().failed_pods;
        Ok(match scope {
            NamespaceScope::Namespace(ns) if ns == "kube-system" => system_pods(),
            NamespaceScope::Namespace(ns) => vec![pod(&ns, "server-0", "Running")],
            NamespaceScope::All => {
                let mut pods = system_pods();
                pods.push(pod("argocd", "argocd-server-0", "Running"));
                pods.push(pod("monitoring", "prometheus-0", "Running"));
                pods.extend((0..failed).map(|i| pod("apps", &format!("api-{i}"), "CrashLoopBackOff")));
                pods
            }
        })
    }

    async fn services(&self, _scope: NamespaceScope) -> Result<Vec<ServiceStatus>, RolloutError> {
        Ok(vec![ServiceStatus {
            namespace: "default".into(),
            name: "kubernetes".into(),
            kind: "ClusterIP".into(),
            cluster_ip: Some("10.0.0.1".into()),
        }])
    }

    async fn disruption_budgets(&self) -> Result<Vec<DisruptionBudgetStatus>, RolloutError> {
        Ok(vec![])
    }

    async fn control_plane_state(&self) -> Result<ControlPlaneState, RolloutError> {
        Ok(ControlPlaneState {
            provisioning_state: "Succeeded".into(),
            power_state: "Running".into(),
            kubernetes_version: self.state().control_plane,
        })
    }

    async fn node_pools(&self) -> Result<Vec<NodePool>, RolloutError> {
        Ok(self
            .state()
            .pool_versions
            .iter()
            .map(|(name, version)| NodePool {
                name: name.clone(),
                count: 2,
                max_count: None,
                max_surge: None,
                provisioning_state: "Succeeded".into(),
                power_state: "Running".into(),
                orchestrator_version: Some(*version),
                node_image_version: Some("AKSUbuntu-2204gen2containerd-202405.03.0".into()),
            })
            .collect())
    }

    async fn persistent_volume_claims(&self) -> Result<Vec<VolumeClaimStatus>, RolloutError> {
        Ok(vec![])
    }

    async fn certificates(&self) -> Result<Option<Vec<CertificateStatus>>, RolloutError> {
        Ok(None)
    }

    async fn served_api_versions(&self) -> Result<Vec<String>, RolloutError> {
        Ok(vec!["v1".into(), "apps/v1".into(), "policy/v1".into()])
    }
}

#[async_trait]
impl ManagedClusterControl for FakePlatform {
    async fn available_upgrades(&self) -> Result<Vec<KubeVersion>, RolloutError> {
        Ok(self.state().available.clone())
    }

    async fn upgrade(&self, version: &KubeVersion, target: UpgradeTarget) -> Result<(), RolloutError> {
        let mut state = self.state();
        state.control_upgrades.push((*version, target));
        state.move_to(*version);
        state.failed_pods = state.failed_pods_after_apply;
        Ok(())
    }

    async fn upgrade_node_image(&self, _pool: &str) -> Result<(), RolloutError> {
        Ok(())
    }
}

#[async_trait]
impl InfraBackend for FakePlatform {
    async fn init(&self) -> Result<(), RolloutError> {
        Ok(())
    }

    async fn plan(&self, kubernetes_version: Option<KubeVersion>) -> Result<PlanSummary, RolloutError> {
        let mut state = self.state();
        state.planned = kubernetes_version;
        let change = u32::from(kubernetes_version.is_some_and(|v| v != state.control_plane));
        Ok(PlanSummary {
            add: 0,
            change,
            destroy: 0,
            raw: format!("Plan: 0 to add, {change} to change, 0 to destroy."),
        })
    }

    async fn apply(&self) -> Result<(), RolloutError> {
        let delay = self.state().apply_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state();
        state.applies += 1;
        if let Some(version) = state.planned {
            state.move_to(version);
        }
        state.failed_pods = state.failed_pods_after_apply;
        Ok(())
    }

    async fn pull_state(&self) -> Result<String, RolloutError> {
        Ok(self.state().infra_state.clone())
    }

    async fn push_state(&self, pushed: String) -> Result<(), RolloutError> {
        let mut state = self.state();
        if state.reject_state_push {
            return Err(RolloutError::Executor {
                message: "state push rejected: lease held by another client".into(),
                backup: None,
            });
        }
        state.state_pushes.push(pushed);
        state.failed_pods = 0;
        Ok(())
    }

    async fn destroy(&self) -> Result<(), RolloutError> {
        Ok(())
    }
}

#[async_trait]
impl WorkloadClient for FakePlatform {
    async fn export_namespace(&self, namespace: &str) -> Result<Option<String>, RolloutError> {
        Ok(Some(format!(
            "apiVersion: v1\nkind: List\nitems:\n- apiVersion: v1\n  kind: ConfigMap\n  metadata:\n    name: settings\n    namespace: {namespace}\n    resourceVersion: \"4711\"\n  data:\n    mode: production\n"
        )))
    }

    async fn export_gitops_applications(&self) -> Result<Option<String>, RolloutError> {
        Ok(None)
    }

    async fn diff(&self, _path: &Path) -> Result<String, RolloutError> {
        Ok(self.state().manifest_diff.clone())
    }

    async fn apply_path(&self, path: &Path) -> Result<String, RolloutError> {
        let mut state = self.state();
        state.manifest_applies.push(path.to_path_buf());
        Ok(format!("configured {}", path.display()))
    }

    async fn dns_probe(&self, _hostname: &str) -> Result<bool, RolloutError> {
        Ok(true)
    }
}

/// Fast-polling config rooted in `dir`.
pub fn test_config(dir: &Path) -> RolloutConfig {
    RolloutConfig {
        backup_dir: dir.join("backups"),
        manifests_dir: dir.join("manifests"),
        poll_interval_secs: 5,
        step_timeout_secs: 120,
        watch_timeout_secs: 300,
        settle_secs: 0,
        ..RolloutConfig::default()
    }
}

/// Create the manifest directories every component may need.
pub fn seed_manifests(dir: &Path) {
    for sub in ["applications", "platform-services"] {
        let path = dir.join("manifests").join(sub);
        std::fs::create_dir_all(&path).unwrap();
        std::fs::write(path.join("deployment.yaml"), "apiVersion: apps/v1\nkind: Deployment\n").unwrap();
    }
}

pub const DEV: Environment = Environment::Dev;
