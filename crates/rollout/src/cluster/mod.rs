//! Cluster collaborators.
//!
//! - [`ClusterStatusReader`]: read-only view of the cluster and its managed
//!   control plane.
//! - [`ManagedClusterControl`]: version upgrades through the managed-cluster API.
//! - [`WorkloadClient`]: manifest export/apply/diff and in-cluster probes.
//!
//! Production implementations live in [`k8s`] (Kubernetes API), [`azure`]
//! (`az aks`) and [`kubectl`].

pub mod azure;
pub mod k8s;
pub mod kubectl;

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};

use crate::error::RolloutError;
use crate::version::KubeVersion;

pub use self::azure::AzCli;
pub use self::k8s::LiveClusterReader;
pub use self::kubectl::Kubectl;

/// Pod statuses that count as failed.
pub const FAILED_POD_STATUSES: &[&str] = &["Error", "CrashLoopBackOff", "ImagePullBackOff"];

/// Which namespaces a list call covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamespaceScope {
    All,
    Namespace(String),
}

impl NamespaceScope {
    pub fn namespace(name: impl Into<String>) -> Self {
        Self::Namespace(name.into())
    }
}

/// A node condition as reported by the kubelet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeCondition {
    #[serde(rename = "type")]
    pub kind: String,
    pub status: String,
}

/// Node readiness and scheduling state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub name: String,
    pub ready: bool,
    pub conditions: Vec<NodeCondition>,
    /// Cordoned by a rolling upgrade or an operator.
    pub unschedulable: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub kubelet_version: Option<String>,
    /// Node pool label, when present.
    pub pool: Option<String>,
}

/// Pod phase plus the kubectl-style status derived from container states.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodStatus {
    pub namespace: String,
    pub name: String,
    /// Raw pod phase (`Running`, `Pending`, `Failed` ...).
    pub phase: String,
    /// Display status (`CrashLoopBackOff`, `Error`, or the phase).
    pub status: String,
    pub ready: bool,
    pub restarts: i32,
}

impl PodStatus {
    /// Whether this pod counts toward the failed-pod threshold.
    ///
    /// Init container failures (`Init:CrashLoopBackOff`) count the same as
    /// app container failures.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        let status = self.status.strip_prefix("Init:").unwrap_or(&self.status);
        FAILED_POD_STATUSES.contains(&status)
    }

    /// Completed job pods are neither healthy nor unhealthy.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.phase == "Succeeded"
    }
}

/// Service summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub namespace: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub cluster_ip: Option<String>,
}

/// Disruption budget status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisruptionBudgetStatus {
    pub namespace: String,
    pub name: String,
    pub disruptions_allowed: i32,
    pub current_healthy: i32,
    pub desired_healthy: i32,
}

/// Managed control plane state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlPlaneState {
    pub provisioning_state: String,
    pub power_state: String,
    pub kubernetes_version: KubeVersion,
}

/// Configured max surge of a pool: absolute node count or percentage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum MaxSurge {
    Absolute(u32),
    Percent(f64),
}

impl MaxSurge {
    /// Managed-cluster default when the pool has no explicit setting.
    pub const DEFAULT: Self = Self::Percent(10.0);

    /// Extra nodes a rolling change will add for `count` nodes (minimum 1).
    #[must_use]
    pub fn surge_nodes(&self, count: u32) -> u32 {
        let raw = match *self {
            Self::Absolute(n) => n,
            Self::Percent(pct) => {
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let nodes = (f64::from(count) * pct / 100.0).ceil() as u32;
                nodes
            }
        };
        raw.max(1)
    }
}

impl std::str::FromStr for MaxSurge {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(pct) = s.strip_suffix('%') {
            pct.trim()
                .parse::<f64>()
                .ok()
                .filter(|p| *p >= 0.0)
                .map(Self::Percent)
                .ok_or_else(|| format!("Invalid max surge percentage: {s}"))
        } else {
            s.parse::<u32>()
                .map(Self::Absolute)
                .map_err(|_| format!("Invalid max surge: {s}"))
        }
    }
}

/// Managed node pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodePool {
    pub name: String,
    pub count: u32,
    /// Autoscaler maximum, when the autoscaler is enabled.
    pub max_count: Option<u32>,
    pub max_surge: Option<MaxSurge>,
    pub provisioning_state: String,
    pub power_state: String,
    pub orchestrator_version: Option<KubeVersion>,
    pub node_image_version: Option<String>,
}

impl NodePool {
    /// Node count required during a rolling change.
    #[must_use]
    pub fn required_capacity(&self) -> u32 {
        let surge = self.max_surge.unwrap_or(MaxSurge::DEFAULT);
        self.count + surge.surge_nodes(self.count)
    }
}

/// PersistentVolumeClaim phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeClaimStatus {
    pub namespace: String,
    pub name: String,
    pub phase: String,
}

/// cert-manager certificate readiness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateStatus {
    pub namespace: String,
    pub name: String,
    pub ready: bool,
}

/// Read-only queries against the cluster and its managed control plane.
///
/// Implementations never panic on transport failures; they return
/// [`RolloutError::Connectivity`] and leave retries to the caller.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterStatusReader: Send + Sync {
    async fn nodes(&self) -> Result<Vec<NodeStatus>, RolloutError>;

    async fn pods(&self, scope: NamespaceScope) -> Result<Vec<PodStatus>, RolloutError>;

    async fn services(&self, scope: NamespaceScope) -> Result<Vec<ServiceStatus>, RolloutError>;

    async fn disruption_budgets(&self) -> Result<Vec<DisruptionBudgetStatus>, RolloutError>;

    async fn control_plane_state(&self) -> Result<ControlPlaneState, RolloutError>;

    async fn node_pools(&self) -> Result<Vec<NodePool>, RolloutError>;

    async fn persistent_volume_claims(&self) -> Result<Vec<VolumeClaimStatus>, RolloutError>;

    /// `None` when cert-manager is not installed.
    async fn certificates(&self) -> Result<Option<Vec<CertificateStatus>>, RolloutError>;

    /// Served `group/version` strings (e.g. `policy/v1`).
    async fn served_api_versions(&self) -> Result<Vec<String>, RolloutError>;
}

/// Scope of a managed version upgrade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpgradeTarget {
    /// Control plane and all pools.
    Cluster,
    ControlPlane,
    NodePool(String),
}

/// Mutations and upgrade metadata from the managed-cluster API.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ManagedClusterControl: Send + Sync {
    /// Versions the control plane may upgrade to from its current version.
    async fn available_upgrades(&self) -> Result<Vec<KubeVersion>, RolloutError>;

    /// Blocking version upgrade.
    async fn upgrade(&self, version: &KubeVersion, target: UpgradeTarget)
        -> Result<(), RolloutError>;

    /// Start a node image refresh on a pool without waiting for it.
    async fn upgrade_node_image(&self, pool: &str) -> Result<(), RolloutError>;
}

/// Manifest-level operations against the cluster.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WorkloadClient: Send + Sync {
    /// Export the backup resource kinds of one namespace as YAML.
    /// Returns `None` when the namespace does not exist.
    async fn export_namespace(&self, namespace: &str) -> Result<Option<String>, RolloutError>;

    /// Export GitOps application definitions. `None` when the CRD is absent.
    async fn export_gitops_applications(&self) -> Result<Option<String>, RolloutError>;

    /// Server-side diff of a manifest path; returns the diff text.
    async fn diff(&self, path: &Path) -> Result<String, RolloutError>;

    /// Apply a manifest file or directory.
    async fn apply_path(&self, path: &Path) -> Result<String, RolloutError>;

    /// Resolve a service name from inside the cluster.
    async fn dns_probe(&self, hostname: &str) -> Result<bool, RolloutError>;
}

/// Count pods per namespace and display status.
#[must_use]
pub fn pod_phase_counts(pods: &[PodStatus]) -> BTreeMap<String, BTreeMap<String, usize>> {
    let mut counts: BTreeMap<String, BTreeMap<String, usize>> = BTreeMap::new();
    for pod in pods {
        *counts
            .entry(pod.namespace.clone())
            .or_default()
            .entry(pod.status.clone())
            .or_default() += 1;
    }
    counts
}
