//! Post-change validation.
//!
//! Runs after a successful monitor phase (never after a rollback) and checks
//! that the cluster ended up where the request intended. Only `Fail` entries
//! affect the exit code.

use std::sync::Arc;

use tracing::{debug, info};

use crate::cluster::{ClusterStatusReader, NamespaceScope, PodStatus, WorkloadClient};
use crate::config::{ChangeRequest, ExecutionMode, ImperativeScope, RolloutConfig};
use crate::error::RolloutError;
use crate::report::{CheckReport, CheckResult};
use crate::version::KubeVersion;

const DNS_PROBE_HOST: &str = "kubernetes.default.svc.cluster.local";

/// Which versions must match the target.
#[derive(Debug, Clone, PartialEq, Eq)]
enum VersionScope {
    ControlPlaneAndPools,
    ControlPlane,
    Pool(String),
}

impl VersionScope {
    fn for_request(request: &ChangeRequest) -> Option<Self> {
        if !request.component.touches_infrastructure() || request.target_version.is_none() {
            return None;
        }
        if request.execution_mode == ExecutionMode::Declarative {
            return Some(Self::ControlPlaneAndPools);
        }
        match &request.imperative_scope {
            ImperativeScope::Full => Some(Self::ControlPlaneAndPools),
            ImperativeScope::ControlPlane => Some(Self::ControlPlane),
            ImperativeScope::NodePool(pool) => Some(Self::Pool(pool.clone())),
            ImperativeScope::NodeImage => None,
        }
    }
}

pub struct PostChangeValidator {
    reader: Arc<dyn ClusterStatusReader>,
    workloads: Arc<dyn WorkloadClient>,
    gitops_namespace: String,
    monitoring_namespace: String,
    extended: bool,
}

impl PostChangeValidator {
    #[must_use]
    pub fn new(
        reader: Arc<dyn ClusterStatusReader>,
        workloads: Arc<dyn WorkloadClient>,
        config: &RolloutConfig,
    ) -> Self {
        Self {
            reader,
            workloads,
            gitops_namespace: config.gitops_namespace.clone(),
            monitoring_namespace: config.monitoring_namespace.clone(),
            extended: config.extended_validation,
        }
    }

    #[must_use]
    pub fn with_extended(mut self, extended: bool) -> Self {
        self.extended = extended;
        self
    }

    /// Run all checks. A check whose reads fail is reported as `Fail`.
    pub async fn run(&self, request: &ChangeRequest) -> CheckReport {
        let mut report = CheckReport::new("Post-Change Validation");

        if let (Some(scope), Some(target)) = (VersionScope::for_request(request), request.target_version) {
            report.push(settle("version convergence", self.version_check(&scope, &target).await));
        }
        report.push(settle("node readiness", self.node_readiness().await));

        match self.reader.pods(NamespaceScope::namespace("kube-system")).await {
            Ok(pods) => {
                report.push(coredns_check(&pods));
                report.push(metrics_server_check(&pods));
            }
            Err(e) => {
                report.push(CheckResult::fail("coredns", e.to_string()));
                report.push(CheckResult::fail("metrics-server", e.to_string()));
            }
        }

        for namespace in [&self.gitops_namespace, &self.monitoring_namespace] {
            let name = format!("{namespace} pods");
            let check = self
                .reader
                .pods(NamespaceScope::namespace(namespace.as_str()))
                .await
                .map(|pods| namespace_ratio(&name, &pods));
            report.push(settle(&name, check));
        }

        if self.extended {
            report.push(settle("cluster DNS", self.dns_check().await));
            report.push(settle("persistent volume claims", self.volume_claims().await));
            report.push(settle("certificates", self.certificates().await));
        }

        let totals = report.totals();
        info!(
            passed = totals.passed,
            warnings = totals.warnings,
            failed = totals.failed,
            "Post-change validation finished"
        );
        report
    }

    async fn version_check(
        &self,
        scope: &VersionScope,
        target: &KubeVersion,
    ) -> Result<CheckResult, RolloutError> {
        let mut mismatches = Vec::new();
        if matches!(scope, VersionScope::ControlPlane | VersionScope::ControlPlaneAndPools) {
            let control_plane = self.reader.control_plane_state().await?.kubernetes_version;
            if control_plane != *target {
                mismatches.push(format!("control plane at {control_plane}"));
            }
        }
        if matches!(scope, VersionScope::Pool(_) | VersionScope::ControlPlaneAndPools) {
            let pools = self.reader.node_pools().await?;
            let selected: Vec<_> = match scope {
                VersionScope::Pool(name) => pools.iter().filter(|p| &p.name == name).collect(),
                _ => pools.iter().collect(),
            };
            if let VersionScope::Pool(name) = scope {
                if selected.is_empty() {
                    return Ok(CheckResult::fail(
                        "version convergence",
                        format!("node pool {name} not found"),
                    ));
                }
            }
            for pool in selected {
                match pool.orchestrator_version {
                    Some(v) if v == *target => {}
                    Some(v) => mismatches.push(format!("pool {} at {v}", pool.name)),
                    None => mismatches.push(format!("pool {} version unknown", pool.name)),
                }
            }
        }

        debug!(target = %target, mismatches = mismatches.len(), "Version convergence checked");
        Ok(if mismatches.is_empty() {
            CheckResult::pass("version convergence", format!("all at {target}"))
        } else {
            CheckResult::fail("version convergence", mismatches.join(", "))
        })
    }

    async fn node_readiness(&self) -> Result<CheckResult, RolloutError> {
        let nodes = self.reader.nodes().await?;
        let ready = nodes.iter().filter(|n| n.ready).count();
        let details = format!("{ready}/{} ready", nodes.len());
        Ok(if !nodes.is_empty() && ready == nodes.len() {
            CheckResult::pass("node readiness", details)
        } else {
            CheckResult::fail("node readiness", details)
        })
    }

    async fn dns_check(&self) -> Result<CheckResult, RolloutError> {
        Ok(if self.workloads.dns_probe(DNS_PROBE_HOST).await? {
            CheckResult::pass("cluster DNS", format!("{DNS_PROBE_HOST} resolves"))
        } else {
            CheckResult::fail("cluster DNS", format!("{DNS_PROBE_HOST} does not resolve"))
        })
    }

    async fn volume_claims(&self) -> Result<CheckResult, RolloutError> {
        let claims = self.reader.persistent_volume_claims().await?;
        let bound = claims.iter().filter(|c| c.phase == "Bound").count();
        let details = format!("{bound}/{} bound", claims.len());
        Ok(if bound == claims.len() {
            CheckResult::pass("persistent volume claims", details)
        } else {
            CheckResult::warn("persistent volume claims", details)
        })
    }

    async fn certificates(&self) -> Result<CheckResult, RolloutError> {
        let Some(certs) = self.reader.certificates().await? else {
            return Ok(CheckResult::pass("certificates", "cert-manager not installed"));
        };
        let unready: Vec<String> = certs
            .iter()
            .filter(|c| !c.ready)
            .map(|c| format!("{}/{}", c.namespace, c.name))
            .collect();
        Ok(if unready.is_empty() {
            CheckResult::pass("certificates", format!("{} ready", certs.len()))
        } else {
            CheckResult::warn("certificates", format!("not ready: {}", unready.join(", ")))
        })
    }
}

fn settle(name: &str, check: Result<CheckResult, RolloutError>) -> CheckResult {
    check.unwrap_or_else(|e| CheckResult::fail(name, e.to_string()))
}

fn ready_ratio<'a>(pods: impl Iterator<Item = &'a PodStatus>) -> (usize, usize) {
    pods.filter(|p| !p.is_completed())
        .fold((0, 0), |(ready, total), p| (ready + usize::from(p.ready), total + 1))
}

fn coredns_check(pods: &[PodStatus]) -> CheckResult {
    let (ready, total) = ready_ratio(pods.iter().filter(|p| p.name.starts_with("coredns")));
    match (ready, total) {
        (_, 0) => CheckResult::fail("coredns", "no CoreDNS pods found"),
        (r, t) if r == t => CheckResult::pass("coredns", format!("{r}/{t} ready")),
        (r, t) => CheckResult::fail("coredns", format!("{r}/{t} ready")),
    }
}

fn metrics_server_check(pods: &[PodStatus]) -> CheckResult {
    let (ready, total) = ready_ratio(pods.iter().filter(|p| p.name.starts_with("metrics-server")));
    match (ready, total) {
        (_, 0) => CheckResult::warn("metrics-server", "not installed"),
        (r, t) if r == t => CheckResult::pass("metrics-server", format!("{r}/{t} ready")),
        (r, t) => CheckResult::fail("metrics-server", format!("{r}/{t} ready")),
    }
}

fn namespace_ratio(name: &str, pods: &[PodStatus]) -> CheckResult {
    match ready_ratio(pods.iter()) {
        (_, 0) => CheckResult::warn(name, "no pods"),
        (r, t) if r == t => CheckResult::pass(name, format!("{r}/{t} ready")),
        (0, t) => CheckResult::fail(name, format!("0/{t} ready")),
        (r, t) => CheckResult::warn(name, format!("{r}/{t} ready")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{
        CertificateStatus, ControlPlaneState, MockClusterStatusReader, MockWorkloadClient, NodePool,
        VolumeClaimStatus,
    };
    use crate::config::{Component, Environment};
    use crate::health::tests::{node, pod};
    use crate::report::CheckStatus;

    fn pool(name: &str, version: KubeVersion) -> NodePool {
        NodePool {
            name: name.into(),
            count: 3,
            max_count: None,
            max_surge: None,
            provisioning_state: "Succeeded".into(),
            power_state: "Running".into(),
            orchestrator_version: Some(version),
            node_image_version: None,
        }
    }

    fn healthy_reader(control_plane: KubeVersion, pools: Vec<NodePool>) -> MockClusterStatusReader {
        let mut reader = MockClusterStatusReader::new();
        reader
            .expect_nodes()
            .returning(|| Ok(vec![node("n1", true), node("n2", true)]));
        reader.expect_pods().returning(|scope| {
            Ok(match scope {
                NamespaceScope::Namespace(ns) if ns == "kube-system" => vec![
                    pod("kube-system", "coredns-5d78c9869d-abcde", "Running"),
                    pod("kube-system", "coredns-5d78c9869d-fghij", "Running"),
                    pod("kube-system", "metrics-server-7f9c8d5b6-xyz12", "Running"),
                ],
                NamespaceScope::Namespace(ns) => vec![
                    pod(&ns, "server-0", "Running"),
                    pod(&ns, "migrate-1", "Completed"),
                ],
                NamespaceScope::All => vec![],
            })
        });
        reader.expect_control_plane_state().returning(move || {
            Ok(ControlPlaneState {
                provisioning_state: "Succeeded".into(),
                power_state: "Running".into(),
                kubernetes_version: control_plane,
            })
        });
        reader.expect_node_pools().returning(move || Ok(pools.clone()));
        reader
    }

    fn validator(reader: MockClusterStatusReader, workloads: MockWorkloadClient) -> PostChangeValidator {
        PostChangeValidator::new(Arc::new(reader), Arc::new(workloads), &RolloutConfig::default())
    }

    fn upgrade(target: KubeVersion) -> ChangeRequest {
        ChangeRequest::new(Environment::Dev, Component::Infrastructure).with_target_version(target)
    }

    fn status_of(report: &CheckReport, name: &str) -> CheckStatus {
        report
            .checks
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.status)
            .unwrap_or_else(|| panic!("no check named {name}"))
    }

    #[tokio::test]
    async fn test_converged_cluster_passes() {
        let target = KubeVersion::new(1, 29, 0);
        let reader = healthy_reader(target, vec![pool("system", target), pool("user", target)]);
        let report = validator(reader, MockWorkloadClient::new()).run(&upgrade(target)).await;

        assert!(!report.has_failures(), "{}", report.failure_summary());
        assert_eq!(status_of(&report, "version convergence"), CheckStatus::Pass);
        assert_eq!(status_of(&report, "argocd pods"), CheckStatus::Pass);
        assert_eq!(report.checks.len(), 6);
    }

    #[tokio::test]
    async fn test_lagging_pool_fails_convergence() {
        let target = KubeVersion::new(1, 29, 0);
        let reader = healthy_reader(
            target,
            vec![pool("system", target), pool("user", KubeVersion::new(1, 28, 3))],
        );
        let report = validator(reader, MockWorkloadClient::new()).run(&upgrade(target)).await;

        assert_eq!(status_of(&report, "version convergence"), CheckStatus::Fail);
        assert!(report.failure_summary().contains("pool user at 1.28.3"));
    }

    #[tokio::test]
    async fn test_control_plane_scope_ignores_pools() {
        let target = KubeVersion::new(1, 29, 0);
        let reader = healthy_reader(target, vec![pool("user", KubeVersion::new(1, 28, 3))]);
        let request = upgrade(target)
            .with_mode(ExecutionMode::Imperative)
            .with_scope(ImperativeScope::ControlPlane);
        let report = validator(reader, MockWorkloadClient::new()).run(&request).await;
        assert_eq!(status_of(&report, "version convergence"), CheckStatus::Pass);
    }

    #[tokio::test]
    async fn test_unreadable_nodes_become_failure() {
        let mut reader = MockClusterStatusReader::new();
        reader
            .expect_nodes()
            .returning(|| Err(RolloutError::connectivity("kubernetes", "connection refused")));
        reader.expect_pods().returning(|_| Ok(vec![]));

        let request = ChangeRequest::new(Environment::Dev, Component::Applications);
        let report = validator(reader, MockWorkloadClient::new()).run(&request).await;
        assert_eq!(status_of(&report, "node readiness"), CheckStatus::Fail);
        assert_eq!(status_of(&report, "coredns"), CheckStatus::Fail);
        assert_eq!(status_of(&report, "metrics-server"), CheckStatus::Warn);
        assert_eq!(status_of(&report, "monitoring pods"), CheckStatus::Warn);
    }

    #[tokio::test]
    async fn test_extended_checks() {
        let target = KubeVersion::new(1, 29, 0);
        let mut reader = healthy_reader(target, vec![]);
        reader.expect_persistent_volume_claims().returning(|| {
            Ok(vec![
                VolumeClaimStatus {
                    namespace: "monitoring".into(),
                    name: "prometheus-db".into(),
                    phase: "Bound".into(),
                },
                VolumeClaimStatus {
                    namespace: "monitoring".into(),
                    name: "grafana".into(),
                    phase: "Pending".into(),
                },
            ])
        });
        reader.expect_certificates().returning(|| {
            Ok(Some(vec![CertificateStatus {
                namespace: "ingress-nginx".into(),
                name: "wildcard-tls".into(),
                ready: true,
            }]))
        });
        let mut workloads = MockWorkloadClient::new();
        workloads
            .expect_dns_probe()
            .withf(|host| host == DNS_PROBE_HOST)
            .returning(|_| Ok(true));

        let request = ChangeRequest::new(Environment::Dev, Component::PlatformServices);
        let report = validator(reader, workloads).with_extended(true).run(&request).await;

        assert_eq!(status_of(&report, "cluster DNS"), CheckStatus::Pass);
        assert_eq!(status_of(&report, "persistent volume claims"), CheckStatus::Warn);
        assert_eq!(status_of(&report, "certificates"), CheckStatus::Pass);
        assert!(!report.has_failures());
    }

    #[test]
    fn test_namespace_ratio() {
        let running = pod("argocd", "a", "Running");
        let pending = pod("argocd", "b", "Pending");
        assert_eq!(namespace_ratio("x", &[]).status, CheckStatus::Warn);
        assert_eq!(
            namespace_ratio("x", &[running.clone(), pending.clone()]).status,
            CheckStatus::Warn
        );
        assert_eq!(namespace_ratio("x", &[pending]).status, CheckStatus::Fail);
        assert_eq!(namespace_ratio("x", &[running]).status, CheckStatus::Pass);
    }
}
