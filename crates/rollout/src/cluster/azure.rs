//! Managed-cluster access through the `az aks` CLI.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use super::{ControlPlaneState, ManagedClusterControl, MaxSurge, NodePool, UpgradeTarget};
use crate::command::{run_checked, CommandError, CommandRunner, CommandSpec};
use crate::error::RolloutError;
use crate::version::KubeVersion;

/// `az aks show` subset.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AksCluster {
    provisioning_state: Option<String>,
    power_state: Option<PowerState>,
    kubernetes_version: Option<String>,
    current_kubernetes_version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PowerState {
    code: Option<String>,
}

/// `az aks nodepool list` item subset.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AksNodePool {
    name: String,
    count: Option<u32>,
    max_count: Option<u32>,
    enable_auto_scaling: Option<bool>,
    provisioning_state: Option<String>,
    power_state: Option<PowerState>,
    orchestrator_version: Option<String>,
    current_orchestrator_version: Option<String>,
    node_image_version: Option<String>,
    upgrade_settings: Option<UpgradeSettings>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpgradeSettings {
    max_surge: Option<String>,
}

/// `az aks get-upgrades` subset.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AksUpgrades {
    control_plane_profile: ControlPlaneProfile,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ControlPlaneProfile {
    #[serde(default)]
    upgrades: Option<Vec<UpgradeOption>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpgradeOption {
    kubernetes_version: String,
    #[serde(default)]
    is_preview: Option<bool>,
}

/// Client for one managed cluster.
pub struct AzCli {
    runner: Arc<dyn CommandRunner>,
    resource_group: String,
    cluster_name: String,
    read_timeout: Duration,
    mutate_timeout: Duration,
}

impl AzCli {
    #[must_use]
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        resource_group: impl Into<String>,
        cluster_name: impl Into<String>,
    ) -> Self {
        Self {
            runner,
            resource_group: resource_group.into(),
            cluster_name: cluster_name.into(),
            read_timeout: Duration::from_secs(60),
            mutate_timeout: Duration::from_secs(3600),
        }
    }

    #[must_use]
    pub fn with_timeouts(mut self, read: Duration, mutate: Duration) -> Self {
        self.read_timeout = read;
        self.mutate_timeout = mutate;
        self
    }

    fn aks(&self) -> CommandSpec {
        CommandSpec::new("az").arg("aks")
    }

    async fn read_json<T: serde::de::DeserializeOwned>(
        &self,
        spec: CommandSpec,
    ) -> Result<T, RolloutError> {
        let spec = spec.args(["-o", "json"]).timeout(self.read_timeout);
        let output = run_checked(self.runner.as_ref(), &spec)
            .await
            .map_err(|e| RolloutError::connectivity("managed-cluster API", e))?;
        serde_json::from_str(&output.stdout).map_err(|e| {
            RolloutError::connectivity(
                "managed-cluster API",
                format!("unexpected output from {}: {e}", spec.display()),
            )
        })
    }

    async fn mutate(&self, spec: CommandSpec) -> Result<(), RolloutError> {
        let spec = spec.timeout(self.mutate_timeout);
        info!(command = %spec.display(), "Issuing managed-cluster mutation");
        run_checked(self.runner.as_ref(), &spec)
            .await
            .map(|_| ())
            .map_err(|e| match e {
                CommandError::Timeout { .. } | CommandError::Spawn { .. } => {
                    RolloutError::connectivity("managed-cluster API", e)
                }
                CommandError::Failed { .. } => RolloutError::Executor {
                    message: e.to_string(),
                    backup: None,
                },
            })
    }

    /// Provisioning/power state and current version of the control plane.
    ///
    /// # Errors
    ///
    /// Returns a connectivity error if the CLI call fails or output is invalid.
    pub async fn control_plane_state(&self) -> Result<ControlPlaneState, RolloutError> {
        let cluster: AksCluster = self
            .read_json(self.aks().args([
                "show",
                "-g",
                self.resource_group.as_str(),
                "-n",
                self.cluster_name.as_str(),
            ]))
            .await?;
        control_plane_from(cluster)
    }

    /// Node pools of the cluster.
    ///
    /// # Errors
    ///
    /// Returns a connectivity error if the CLI call fails or output is invalid.
    pub async fn node_pools(&self) -> Result<Vec<NodePool>, RolloutError> {
        let pools: Vec<AksNodePool> = self
            .read_json(self.aks().args([
                "nodepool",
                "list",
                "-g",
                self.resource_group.as_str(),
                "--cluster-name",
                self.cluster_name.as_str(),
            ]))
            .await?;
        Ok(pools.into_iter().map(node_pool_from).collect())
    }
}

fn control_plane_from(cluster: AksCluster) -> Result<ControlPlaneState, RolloutError> {
    let version = cluster
        .current_kubernetes_version
        .or(cluster.kubernetes_version)
        .ok_or_else(|| RolloutError::connectivity("managed-cluster API", "cluster has no version"))?;
    let kubernetes_version = version
        .parse()
        .map_err(|e: String| RolloutError::connectivity("managed-cluster API", e))?;
    Ok(ControlPlaneState {
        provisioning_state: cluster
            .provisioning_state
            .unwrap_or_else(|| "Unknown".to_string()),
        power_state: cluster
            .power_state
            .and_then(|p| p.code)
            .unwrap_or_else(|| "Unknown".to_string()),
        kubernetes_version,
    })
}

fn node_pool_from(pool: AksNodePool) -> NodePool {
    let max_surge = pool
        .upgrade_settings
        .and_then(|u| u.max_surge)
        .filter(|s| !s.is_empty())
        .and_then(|s| match s.parse::<MaxSurge>() {
            Ok(surge) => Some(surge),
            Err(e) => {
                debug!(pool = %pool.name, error = %e, "Ignoring unparseable max surge");
                None
            }
        });
    let orchestrator_version = pool
        .current_orchestrator_version
        .or(pool.orchestrator_version)
        .and_then(|v| v.parse().ok());
    NodePool {
        max_count: if pool.enable_auto_scaling.unwrap_or(false) {
            pool.max_count
        } else {
            None
        },
        name: pool.name,
        count: pool.count.unwrap_or(0),
        max_surge,
        provisioning_state: pool
            .provisioning_state
            .unwrap_or_else(|| "Unknown".to_string()),
        power_state: pool
            .power_state
            .and_then(|p| p.code)
            .unwrap_or_else(|| "Unknown".to_string()),
        orchestrator_version,
        node_image_version: pool.node_image_version,
    }
}

fn upgrades_from(upgrades: AksUpgrades) -> Vec<KubeVersion> {
    let mut versions: Vec<KubeVersion> = upgrades
        .control_plane_profile
        .upgrades
        .unwrap_or_default()
        .into_iter()
        .filter(|u| !u.is_preview.unwrap_or(false))
        .filter_map(|u| u.kubernetes_version.parse().ok())
        .collect();
    versions.sort();
    versions
}

#[async_trait]
impl ManagedClusterControl for AzCli {
    async fn available_upgrades(&self) -> Result<Vec<KubeVersion>, RolloutError> {
        let upgrades: AksUpgrades = self
            .read_json(self.aks().args([
                "get-upgrades",
                "-g",
                self.resource_group.as_str(),
                "-n",
                self.cluster_name.as_str(),
            ]))
            .await?;
        Ok(upgrades_from(upgrades))
    }

    async fn upgrade(
        &self,
        version: &KubeVersion,
        target: UpgradeTarget,
    ) -> Result<(), RolloutError> {
        let version = version.to_string();
        let spec = match &target {
            UpgradeTarget::Cluster => self.aks().args([
                "upgrade",
                "-g",
                self.resource_group.as_str(),
                "-n",
                self.cluster_name.as_str(),
                "--kubernetes-version",
                version.as_str(),
                "--yes",
            ]),
            UpgradeTarget::ControlPlane => self.aks().args([
                "upgrade",
                "-g",
                self.resource_group.as_str(),
                "-n",
                self.cluster_name.as_str(),
                "--kubernetes-version",
                version.as_str(),
                "--control-plane-only",
                "--yes",
            ]),
            UpgradeTarget::NodePool(pool) => self.aks().args([
                "nodepool",
                "upgrade",
                "-g",
                self.resource_group.as_str(),
                "--cluster-name",
                self.cluster_name.as_str(),
                "-n",
                pool.as_str(),
                "--kubernetes-version",
                version.as_str(),
            ]),
        };
        self.mutate(spec).await
    }

    async fn upgrade_node_image(&self, pool: &str) -> Result<(), RolloutError> {
        self.mutate(self.aks().args([
            "nodepool",
            "upgrade",
            "-g",
            self.resource_group.as_str(),
            "--cluster-name",
            self.cluster_name.as_str(),
            "-n",
            pool,
            "--node-image-only",
            "--no-wait",
        ]))
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandOutput, MockCommandRunner};

    #[test]
    fn test_parse_cluster() {
        let cluster: AksCluster = serde_json::from_str(
            r#"{
                "provisioningState": "Succeeded",
                "powerState": {"code": "Running"},
                "kubernetesVersion": "1.28",
                "currentKubernetesVersion": "1.28.3"
            }"#,
        )
        .unwrap();
        let state = control_plane_from(cluster).unwrap();
        assert_eq!(state.kubernetes_version, KubeVersion::new(1, 28, 3));
        assert_eq!(state.power_state, "Running");
    }

    #[test]
    fn test_parse_node_pool() {
        let pool: AksNodePool = serde_json::from_str(
            r#"{
                "name": "user",
                "count": 3,
                "maxCount": 4,
                "enableAutoScaling": true,
                "provisioningState": "Succeeded",
                "powerState": {"code": "Running"},
                "currentOrchestratorVersion": "1.28.3",
                "upgradeSettings": {"maxSurge": "50%"}
            }"#,
        )
        .unwrap();
        let pool = node_pool_from(pool);
        assert_eq!(pool.max_count, Some(4));
        assert_eq!(pool.max_surge, Some(MaxSurge::Percent(50.0)));
        assert_eq!(pool.required_capacity(), 5);
    }

    #[test]
    fn test_max_count_ignored_without_autoscaler() {
        let pool: AksNodePool = serde_json::from_str(
            r#"{"name": "system", "count": 2, "maxCount": 5, "enableAutoScaling": false}"#,
        )
        .unwrap();
        assert_eq!(node_pool_from(pool).max_count, None);
    }

    #[test]
    fn test_parse_upgrades_skips_preview() {
        let upgrades: AksUpgrades = serde_json::from_str(
            r#"{"controlPlaneProfile": {"kubernetesVersion": "1.28.3", "upgrades": [
                {"kubernetesVersion": "1.29.1"},
                {"kubernetesVersion": "1.28.5"},
                {"kubernetesVersion": "1.30.0", "isPreview": true},
                {"kubernetesVersion": "1.29.0", "isPreview": null}
            ]}}"#,
        )
        .unwrap();
        let versions = upgrades_from(upgrades);
        assert_eq!(
            versions,
            vec![
                KubeVersion::new(1, 28, 5),
                KubeVersion::new(1, 29, 0),
                KubeVersion::new(1, 29, 1)
            ]
        );
    }

    #[tokio::test]
    async fn test_node_image_upgrade_is_fire_and_forget() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|spec| {
                spec.program == "az"
                    && spec.args.contains(&"--node-image-only".to_string())
                    && spec.args.contains(&"--no-wait".to_string())
                    && spec.args.contains(&"user".to_string())
            })
            .times(1)
            .returning(|_| Ok(CommandOutput::ok("")));

        let az = AzCli::new(Arc::new(runner), "rg-aks-platform-dev", "aks-aks-platform-dev");
        az.upgrade_node_image("user").await.unwrap();
    }

    #[tokio::test]
    async fn test_upgrade_failure_is_executor_error() {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(|_| {
            Ok(CommandOutput {
                code: 1,
                stdout: String::new(),
                stderr: "OperationNotAllowed".into(),
            })
        });

        let az = AzCli::new(Arc::new(runner), "rg", "aks");
        let err = az
            .upgrade(&KubeVersion::new(1, 29, 0), UpgradeTarget::Cluster)
            .await
            .unwrap_err();
        assert!(matches!(err, RolloutError::Executor { .. }));
    }
}
