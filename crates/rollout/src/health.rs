//! Health snapshots.
//!
//! A [`HealthSnapshot`] is a point-in-time view of nodes, pods, services and
//! disruption budgets. The baseline taken before any mutation and every
//! monitor sample use the same type.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cluster::{
    pod_phase_counts, ClusterStatusReader, DisruptionBudgetStatus, NamespaceScope, NodeStatus,
    PodStatus, ServiceStatus,
};
use crate::config::Environment;
use crate::error::RolloutError;

/// Point-in-time cluster health.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub timestamp: DateTime<Utc>,
    pub environment: Environment,
    pub nodes: Vec<NodeStatus>,
    pub pods: Vec<PodStatus>,
    pub pod_phase_counts: BTreeMap<String, BTreeMap<String, usize>>,
    pub services: Vec<ServiceStatus>,
    /// `None` when the budget listing failed; budgets are advisory.
    pub disruption_budgets: Option<Vec<DisruptionBudgetStatus>>,
}

impl HealthSnapshot {
    /// Capture a snapshot.
    ///
    /// # Errors
    ///
    /// Returns the reader's error if nodes, pods or services cannot be listed.
    pub async fn capture(
        reader: &dyn ClusterStatusReader,
        environment: Environment,
    ) -> Result<Self, RolloutError> {
        let nodes = reader.nodes().await?;
        let pods = reader.pods(NamespaceScope::All).await?;
        let services = reader.services(NamespaceScope::All).await?;
        let disruption_budgets = match reader.disruption_budgets().await {
            Ok(budgets) => Some(budgets),
            Err(e) => {
                warn!(error = %e, "Could not list disruption budgets");
                None
            }
        };

        let snapshot = Self {
            timestamp: Utc::now(),
            environment,
            pod_phase_counts: pod_phase_counts(&pods),
            nodes,
            pods,
            services,
            disruption_budgets,
        };
        debug!(
            nodes = snapshot.nodes.len(),
            pods = snapshot.pods.len(),
            unhealthy_nodes = snapshot.unhealthy_node_count(),
            failed_pods = snapshot.failed_pod_count(),
            "Captured health snapshot"
        );
        Ok(snapshot)
    }

    #[must_use]
    pub fn unhealthy_node_count(&self) -> usize {
        self.nodes.iter().filter(|n| !n.ready).count()
    }

    #[must_use]
    pub fn failed_pod_count(&self) -> usize {
        self.pods.iter().filter(|p| p.is_failed()).count()
    }

    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.unhealthy_node_count() == 0 && self.failed_pod_count() == 0
    }

    #[must_use]
    pub fn unhealthy_nodes(&self) -> Vec<&NodeStatus> {
        self.nodes.iter().filter(|n| !n.ready).collect()
    }

    #[must_use]
    pub fn failed_pods(&self) -> Vec<&PodStatus> {
        self.pods.iter().filter(|p| p.is_failed()).collect()
    }

    /// Nodes created after `since` (surge provisioning).
    #[must_use]
    pub fn new_nodes_since(&self, since: DateTime<Utc>) -> Vec<&NodeStatus> {
        self.nodes
            .iter()
            .filter(|n| n.created_at.is_some_and(|t| t > since))
            .collect()
    }

    /// Unschedulable nodes (rolling upgrade in progress).
    #[must_use]
    pub fn cordoned_nodes(&self) -> Vec<&NodeStatus> {
        self.nodes.iter().filter(|n| n.unschedulable).collect()
    }

    /// Short `namespace/name` list of failing pods for messages.
    #[must_use]
    pub fn failed_pod_names(&self, limit: usize) -> String {
        let names: Vec<String> = self
            .failed_pods()
            .iter()
            .take(limit)
            .map(|p| format!("{}/{} ({})", p.namespace, p.name, p.status))
            .collect();
        names.join(", ")
    }
}
