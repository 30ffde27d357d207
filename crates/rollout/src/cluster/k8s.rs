//! Kubernetes API reads.
//!
//! [`LiveClusterReader`] answers the in-cluster half of
//! [`ClusterStatusReader`] through the kube client and delegates control
//! plane and node pool queries to [`AzCli`]. Every request is wrapped in a
//! hard timeout.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, PersistentVolumeClaim, Pod, Service};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::api::{Api, DynamicObject, ListParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::ApiResource;
use kube::{Client, Config};
use tracing::debug;

use super::{
    AzCli, CertificateStatus, ClusterStatusReader, ControlPlaneState, DisruptionBudgetStatus,
    NamespaceScope, NodeCondition, NodePool, NodeStatus, PodStatus, ServiceStatus,
    VolumeClaimStatus,
};
use crate::error::RolloutError;

/// Node labels carrying the node pool name.
const POOL_LABELS: &[&str] = &["kubernetes.azure.com/agentpool", "agentpool"];

/// cert-manager Certificate API resource definition.
fn certificate_api() -> ApiResource {
    ApiResource {
        group: "cert-manager.io".to_string(),
        version: "v1".to_string(),
        api_version: "cert-manager.io/v1".to_string(),
        kind: "Certificate".to_string(),
        plural: "certificates".to_string(),
    }
}

/// Build a kube client from an explicit kubeconfig, or the default chain.
///
/// # Errors
///
/// Returns a connectivity error if the kubeconfig cannot be read or the client
/// cannot be created.
pub async fn client_from(kubeconfig: Option<&Path>, context: Option<&str>) -> Result<Client, RolloutError> {
    let options = KubeConfigOptions {
        context: context.map(ToString::to_string),
        ..KubeConfigOptions::default()
    };
    let config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                RolloutError::connectivity(
                    "kubeconfig",
                    format!("failed to read {}: {e}", path.display()),
                )
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &options)
                .await
                .map_err(|e| RolloutError::connectivity("kubeconfig", e))?
        }
        None => Config::from_kubeconfig(&options)
            .await
            .or_else(|_| Config::incluster())
            .map_err(|e| RolloutError::connectivity("kubeconfig", e))?,
    };
    Client::try_from(config).map_err(|e| RolloutError::connectivity("kubernetes", e))
}

/// Production [`ClusterStatusReader`].
pub struct LiveClusterReader {
    client: Client,
    az: Arc<AzCli>,
    timeout: Duration,
}

impl LiveClusterReader {
    #[must_use]
    pub fn new(client: Client, az: Arc<AzCli>, timeout: Duration) -> Self {
        Self {
            client,
            az,
            timeout,
        }
    }

    async fn bounded<T, F>(&self, what: &str, fut: F) -> Result<T, RolloutError>
    where
        F: Future<Output = Result<T, kube::Error>> + Send,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(RolloutError::connectivity("kubernetes", format!("{what}: {e}"))),
            Err(_) => Err(RolloutError::connectivity(
                "kubernetes",
                format!("{what} timed out after {}s", self.timeout.as_secs()),
            )),
        }
    }

    fn scoped<K>(&self, scope: &NamespaceScope) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        match scope {
            NamespaceScope::All => Api::all(self.client.clone()),
            NamespaceScope::Namespace(ns) => Api::namespaced(self.client.clone(), ns),
        }
    }
}

#[async_trait]
impl ClusterStatusReader for LiveClusterReader {
    async fn nodes(&self) -> Result<Vec<NodeStatus>, RolloutError> {
        let api: Api<Node> = Api::all(self.client.clone());
        let list = self.bounded("list nodes", api.list(&ListParams::default())).await?;
        Ok(list.items.iter().map(node_status).collect())
    }

    async fn pods(&self, scope: NamespaceScope) -> Result<Vec<PodStatus>, RolloutError> {
        let api: Api<Pod> = self.scoped(&scope);
        let list = self.bounded("list pods", api.list(&ListParams::default())).await?;
        Ok(list.items.iter().map(pod_status).collect())
    }

    async fn services(&self, scope: NamespaceScope) -> Result<Vec<ServiceStatus>, RolloutError> {
        let api: Api<Service> = self.scoped(&scope);
        let list = self
            .bounded("list services", api.list(&ListParams::default()))
            .await?;
        Ok(list
            .items
            .iter()
            .map(|svc| {
                let spec = svc.spec.as_ref();
                ServiceStatus {
                    namespace: svc.metadata.namespace.clone().unwrap_or_default(),
                    name: svc.metadata.name.clone().unwrap_or_default(),
                    kind: spec
                        .and_then(|s| s.type_.clone())
                        .unwrap_or_else(|| "ClusterIP".to_string()),
                    cluster_ip: spec.and_then(|s| s.cluster_ip.clone()),
                }
            })
            .collect())
    }

    async fn disruption_budgets(&self) -> Result<Vec<DisruptionBudgetStatus>, RolloutError> {
        let api: Api<PodDisruptionBudget> = Api::all(self.client.clone());
        let list = self
            .bounded("list disruption budgets", api.list(&ListParams::default()))
            .await?;
        Ok(list
            .items
            .iter()
            .map(|pdb| {
                let status = pdb.status.as_ref();
                DisruptionBudgetStatus {
                    namespace: pdb.metadata.namespace.clone().unwrap_or_default(),
                    name: pdb.metadata.name.clone().unwrap_or_default(),
                    disruptions_allowed: status.map_or(0, |s| s.disruptions_allowed),
                    current_healthy: status.map_or(0, |s| s.current_healthy),
                    desired_healthy: status.map_or(0, |s| s.desired_healthy),
                }
            })
            .collect())
    }

    async fn control_plane_state(&self) -> Result<ControlPlaneState, RolloutError> {
        self.az.control_plane_state().await
    }

    async fn node_pools(&self) -> Result<Vec<NodePool>, RolloutError> {
        self.az.node_pools().await
    }

    async fn persistent_volume_claims(&self) -> Result<Vec<VolumeClaimStatus>, RolloutError> {
        let api: Api<PersistentVolumeClaim> = Api::all(self.client.clone());
        let list = self
            .bounded("list volume claims", api.list(&ListParams::default()))
            .await?;
        Ok(list
            .items
            .iter()
            .map(|pvc| VolumeClaimStatus {
                namespace: pvc.metadata.namespace.clone().unwrap_or_default(),
                name: pvc.metadata.name.clone().unwrap_or_default(),
                phase: pvc
                    .status
                    .as_ref()
                    .and_then(|s| s.phase.clone())
                    .unwrap_or_else(|| "Unknown".to_string()),
            })
            .collect())
    }

    async fn certificates(&self) -> Result<Option<Vec<CertificateStatus>>, RolloutError> {
        let resource = certificate_api();
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &resource);
        let list = match tokio::time::timeout(self.timeout, api.list(&ListParams::default())).await
        {
            Ok(Ok(list)) => list,
            Ok(Err(kube::Error::Api(err))) if err.code == 404 => {
                debug!("cert-manager CRDs not installed");
                return Ok(None);
            }
            Ok(Err(e)) => {
                return Err(RolloutError::connectivity(
                    "kubernetes",
                    format!("list certificates: {e}"),
                ))
            }
            Err(_) => {
                return Err(RolloutError::connectivity(
                    "kubernetes",
                    "list certificates timed out",
                ))
            }
        };

        Ok(Some(
            list.items
                .iter()
                .map(|cert| CertificateStatus {
                    namespace: cert.metadata.namespace.clone().unwrap_or_default(),
                    name: cert.metadata.name.clone().unwrap_or_default(),
                    ready: certificate_ready(&cert.data),
                })
                .collect(),
        ))
    }

    async fn served_api_versions(&self) -> Result<Vec<String>, RolloutError> {
        let core = self
            .bounded("list core API versions", self.client.list_core_api_versions())
            .await?;
        let groups = self
            .bounded("list API groups", self.client.list_api_groups())
            .await?;
        let mut versions = core.versions;
        versions.extend(
            groups
                .groups
                .into_iter()
                .flat_map(|g| g.versions.into_iter().map(|v| v.group_version)),
        );
        Ok(versions)
    }
}

fn node_status(node: &Node) -> NodeStatus {
    let conditions: Vec<NodeCondition> = node
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conds| {
            conds
                .iter()
                .map(|c| NodeCondition {
                    kind: c.type_.clone(),
                    status: c.status.clone(),
                })
                .collect()
        })
        .unwrap_or_default();
    let ready = conditions
        .iter()
        .any(|c| c.kind == "Ready" && c.status == "True");
    let pool = node.metadata.labels.as_ref().and_then(|labels| {
        POOL_LABELS
            .iter()
            .find_map(|key| labels.get(*key).cloned())
    });

    NodeStatus {
        name: node.metadata.name.clone().unwrap_or_default(),
        ready,
        conditions,
        unschedulable: node
            .spec
            .as_ref()
            .and_then(|s| s.unschedulable)
            .unwrap_or(false),
        created_at: node.metadata.creation_timestamp.as_ref().map(|t| t.0),
        kubelet_version: node
            .status
            .as_ref()
            .and_then(|s| s.node_info.as_ref())
            .map(|info| info.kubelet_version.clone()),
        pool,
    }
}

/// Derive the kubectl-style display status of a pod.
fn pod_status(pod: &Pod) -> PodStatus {
    let status = pod.status.as_ref();
    let phase = status
        .and_then(|s| s.phase.clone())
        .unwrap_or_else(|| "Unknown".to_string());
    let mut display = status
        .and_then(|s| s.reason.clone())
        .unwrap_or_else(|| phase.clone());
    let mut ready = phase == "Running";
    let mut restarts = 0;
    let mut initializing = false;

    // kubectl reports a stuck init container as `Init:<reason>` in place of
    // the app container status.
    if let Some(containers) = status.and_then(|s| s.init_container_statuses.as_ref()) {
        for container in containers {
            restarts += container.restart_count;
            if initializing {
                continue;
            }
            let state = container.state.as_ref();
            if let Some(reason) = state
                .and_then(|s| s.waiting.as_ref())
                .and_then(|w| w.reason.clone())
                .filter(|r| r != "PodInitializing")
            {
                display = format!("Init:{reason}");
                initializing = true;
            } else if let Some(terminated) = state
                .and_then(|s| s.terminated.as_ref())
                .filter(|t| t.exit_code != 0)
            {
                display = format!(
                    "Init:{}",
                    terminated.reason.clone().unwrap_or_else(|| "Error".to_string())
                );
                initializing = true;
            }
        }
    }

    if let Some(containers) = status.and_then(|s| s.container_statuses.as_ref()) {
        for container in containers {
            restarts += container.restart_count;
            ready &= container.ready;
            if initializing {
                continue;
            }
            let state = container.state.as_ref();
            if let Some(reason) = state
                .and_then(|s| s.waiting.as_ref())
                .and_then(|w| w.reason.clone())
            {
                display = reason;
            } else if let Some(terminated) = state.and_then(|s| s.terminated.as_ref()) {
                display = terminated.reason.clone().unwrap_or_else(|| {
                    if terminated.exit_code == 0 {
                        "Completed".to_string()
                    } else {
                        "Error".to_string()
                    }
                });
            }
        }
    }

    PodStatus {
        ready: ready && !initializing,
        namespace: pod.metadata.namespace.clone().unwrap_or_default(),
        name: pod.metadata.name.clone().unwrap_or_default(),
        phase,
        status: display,
        restarts,
    }
}

fn certificate_ready(data: &serde_json::Value) -> bool {
    data.get("status")
        .and_then(|s| s.get("conditions"))
        .and_then(|c| c.as_array())
        .is_some_and(|conds| {
            conds.iter().any(|c| {
                c.get("type").and_then(|t| t.as_str()) == Some("Ready")
                    && c.get("status").and_then(|s| s.as_str()) == Some("True")
            })
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod_from(json: serde_json::Value) -> Pod {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_crashloop_pod_status() {
        let pod = pod_from(serde_json::json!({
            "metadata": {"name": "api-0", "namespace": "apps"},
            "status": {
                "phase": "Running",
                "containerStatuses": [{
                    "name": "api",
                    "image": "api:1",
                    "imageID": "",
                    "ready": false,
                    "restartCount": 5,
                    "state": {"waiting": {"reason": "CrashLoopBackOff"}}
                }]
            }
        }));
        let status = pod_status(&pod);
        assert_eq!(status.status, "CrashLoopBackOff");
        assert_eq!(status.restarts, 5);
        assert!(!status.ready);
        assert!(status.is_failed());
    }

    #[test]
    fn test_init_container_crashloop_counts_as_failed() {
        let pod = pod_from(serde_json::json!({
            "metadata": {"name": "api-1", "namespace": "apps"},
            "status": {
                "phase": "Pending",
                "initContainerStatuses": [{
                    "name": "migrate",
                    "image": "migrate:1",
                    "imageID": "",
                    "ready": false,
                    "restartCount": 4,
                    "state": {"waiting": {"reason": "CrashLoopBackOff"}}
                }],
                "containerStatuses": [{
                    "name": "api",
                    "image": "api:1",
                    "imageID": "",
                    "ready": false,
                    "restartCount": 0,
                    "state": {"waiting": {"reason": "PodInitializing"}}
                }]
            }
        }));
        let status = pod_status(&pod);
        assert_eq!(status.status, "Init:CrashLoopBackOff");
        assert_eq!(status.restarts, 4);
        assert!(!status.ready);
        assert!(status.is_failed());
    }

    #[test]
    fn test_terminated_without_reason_is_error() {
        let pod = pod_from(serde_json::json!({
            "metadata": {"name": "job-1", "namespace": "apps"},
            "status": {
                "phase": "Failed",
                "containerStatuses": [{
                    "name": "job",
                    "image": "job:1",
                    "imageID": "",
                    "ready": false,
                    "restartCount": 0,
                    "state": {"terminated": {"exitCode": 2}}
                }]
            }
        }));
        assert_eq!(pod_status(&pod).status, "Error");
    }

    #[test]
    fn test_running_pod_is_ready() {
        let pod = pod_from(serde_json::json!({
            "metadata": {"name": "web", "namespace": "apps"},
            "status": {
                "phase": "Running",
                "containerStatuses": [{
                    "name": "web",
                    "image": "web:1",
                    "imageID": "",
                    "ready": true,
                    "restartCount": 0,
                    "state": {"running": {}}
                }]
            }
        }));
        let status = pod_status(&pod);
        assert_eq!(status.status, "Running");
        assert!(status.ready);
        assert!(!status.is_failed());
    }

    #[test]
    fn test_node_status() {
        let node: Node = serde_json::from_value(serde_json::json!({
            "metadata": {
                "name": "aks-user-1",
                "creationTimestamp": "2024-05-01T10:00:00Z",
                "labels": {"kubernetes.azure.com/agentpool": "user"}
            },
            "spec": {"unschedulable": true},
            "status": {
                "conditions": [
                    {"type": "MemoryPressure", "status": "False"},
                    {"type": "Ready", "status": "True"}
                ]
            }
        }))
        .unwrap();
        let status = node_status(&node);
        assert!(status.ready);
        assert!(status.unschedulable);
        assert_eq!(status.pool.as_deref(), Some("user"));
        assert!(status.created_at.is_some());
    }

    #[test]
    fn test_certificate_ready() {
        let ready = serde_json::json!({
            "status": {"conditions": [{"type": "Ready", "status": "True"}]}
        });
        let pending = serde_json::json!({
            "status": {"conditions": [{"type": "Ready", "status": "False"}]}
        });
        assert!(certificate_ready(&ready));
        assert!(!certificate_ready(&pending));
        assert!(!certificate_ready(&serde_json::json!({})));
    }
}
