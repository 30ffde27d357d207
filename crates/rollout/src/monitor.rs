//! Health monitoring while a change rolls out.
//!
//! [`HealthMonitor::watch`] samples the cluster on a fixed interval until the
//! change has converged, a threshold is breached, the timeout elapses or the
//! run is cancelled. Every sample is a full [`HealthSnapshot`].

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use indicatif::ProgressBar;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cluster::ClusterStatusReader;
use crate::config::{ChangeRequest, Environment, ExecutionMode, ImperativeScope, RolloutConfig};
use crate::error::{FailureKind, FailureSignal, RolloutError};
use crate::health::HealthSnapshot;
use crate::poll::{poll_until, PollError, PollStep};
use crate::version::KubeVersion;

/// When a watch is done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// The control plane (or `pool`) reports `target` and the cluster has
    /// been healthy for the settle time.
    VersionConverged {
        target: KubeVersion,
        pool: Option<String>,
    },
    /// Healthy for the settle time.
    Settled,
}

impl Completion {
    #[must_use]
    pub fn for_request(request: &ChangeRequest) -> Self {
        let imperative = request.execution_mode == ExecutionMode::Imperative;
        match request.target_version {
            Some(target)
                if request.component.touches_infrastructure()
                    && !(imperative && request.imperative_scope == ImperativeScope::NodeImage) =>
            {
                let pool = match &request.imperative_scope {
                    ImperativeScope::NodePool(pool) if imperative => Some(pool.clone()),
                    _ => None,
                };
                Self::VersionConverged { target, pool }
            }
            _ => Self::Settled,
        }
    }
}

/// What the monitor saw.
#[derive(Debug, Clone, Default)]
pub struct MonitorReport {
    pub ticks: u32,
    pub elapsed: Duration,
    pub observed_version: Option<KubeVersion>,
    /// Nodes created during the watch.
    pub surge_nodes: Vec<String>,
    /// Highest number of cordoned nodes in a single sample.
    pub max_cordoned: usize,
    /// Threshold breaches tolerated because fail-fast was off.
    pub warnings: Vec<String>,
    pub latest: Option<HealthSnapshot>,
}

#[derive(Default)]
struct TickState {
    ticks: u32,
    consecutive_failures: u32,
    healthy_since: Option<Instant>,
    observed_version: Option<KubeVersion>,
    surge_nodes: BTreeSet<String>,
    max_cordoned: usize,
    warnings: Vec<String>,
    latest: Option<HealthSnapshot>,
}

fn lock(state: &Mutex<TickState>) -> MutexGuard<'_, TickState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Bounded polling health monitor.
pub struct HealthMonitor {
    reader: Arc<dyn ClusterStatusReader>,
    interval: Duration,
    timeout: Duration,
    settle: Duration,
    max_connectivity_failures: u32,
}

impl HealthMonitor {
    #[must_use]
    pub fn new(reader: Arc<dyn ClusterStatusReader>, interval: Duration, timeout: Duration) -> Self {
        Self {
            reader,
            interval,
            timeout,
            settle: Duration::from_secs(60),
            max_connectivity_failures: 3,
        }
    }

    /// Monitor with the configured interval, settle time and the timeout
    /// appropriate for `request`.
    #[must_use]
    pub fn from_config(
        reader: Arc<dyn ClusterStatusReader>,
        config: &RolloutConfig,
        request: &ChangeRequest,
    ) -> Self {
        Self::new(reader, config.poll_interval(), config.monitor_timeout(request))
            .with_settle_time(config.settle_time())
            .with_connectivity_budget(config.connectivity_retries)
    }

    #[must_use]
    pub fn with_settle_time(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Consecutive connectivity failures tolerated before giving up.
    #[must_use]
    pub fn with_connectivity_budget(mut self, failures: u32) -> Self {
        self.max_connectivity_failures = failures;
        self
    }

    /// Watch until `completion` holds.
    ///
    /// With `fail_fast`, the first sample with an unready node or a failed pod
    /// ends the watch; otherwise such samples are recorded as warnings.
    ///
    /// # Errors
    ///
    /// Returns [`RolloutError::HealthCheck`] on a threshold breach, timeout or
    /// an unreachable cluster, [`RolloutError::Cancelled`] when `cancel`
    /// fires, and non-retryable reader errors as-is.
    pub async fn watch(
        &self,
        environment: Environment,
        completion: &Completion,
        fail_fast: bool,
        cancel: &CancellationToken,
        progress: &ProgressBar,
    ) -> Result<MonitorReport, RolloutError> {
        let started = Instant::now();
        let window_start = Utc::now();
        let state = Arc::new(Mutex::new(TickState::default()));
        info!(
            interval_secs = self.interval.as_secs(),
            timeout_secs = self.timeout.as_secs(),
            settle_secs = self.settle.as_secs(),
            completion = ?completion,
            "Monitoring cluster health"
        );

        let outcome = poll_until(self.interval, self.timeout, cancel, || {
            let state = Arc::clone(&state);
            async move {
                self.tick(environment, completion, fail_fast, window_start, &state, progress)
                    .await
            }
        })
        .await;

        let mut st = lock(&state);
        match outcome {
            Ok(()) => {
                let report = MonitorReport {
                    ticks: st.ticks,
                    elapsed: started.elapsed(),
                    observed_version: st.observed_version,
                    surge_nodes: st.surge_nodes.iter().cloned().collect(),
                    max_cordoned: st.max_cordoned,
                    warnings: std::mem::take(&mut st.warnings),
                    latest: st.latest.take(),
                };
                info!(
                    ticks = report.ticks,
                    elapsed_secs = report.elapsed.as_secs(),
                    surge_nodes = report.surge_nodes.len(),
                    "Cluster converged and healthy"
                );
                Ok(report)
            }
            Err(PollError::Timeout { elapsed }) => {
                let observed = st
                    .observed_version
                    .map_or_else(|| "unknown".to_string(), |v| v.to_string());
                Err(RolloutError::HealthCheck(FailureSignal::new(
                    FailureKind::Timeout,
                    0,
                    format!(
                        "not converged after {}s (last observed version {observed})",
                        elapsed.as_secs()
                    ),
                )))
            }
            Err(PollError::Cancelled) => Err(RolloutError::Cancelled),
            Err(PollError::Failed(e)) => Err(e),
        }
    }

    async fn observe(
        &self,
        environment: Environment,
        completion: &Completion,
    ) -> Result<(HealthSnapshot, Option<KubeVersion>), RolloutError> {
        let snapshot = HealthSnapshot::capture(self.reader.as_ref(), environment).await?;
        let version = match completion {
            Completion::Settled => None,
            Completion::VersionConverged { pool: None, .. } => {
                Some(self.reader.control_plane_state().await?.kubernetes_version)
            }
            Completion::VersionConverged { pool: Some(name), .. } => self
                .reader
                .node_pools()
                .await?
                .into_iter()
                .find(|p| &p.name == name)
                .and_then(|p| p.orchestrator_version),
        };
        Ok((snapshot, version))
    }

    async fn tick(
        &self,
        environment: Environment,
        completion: &Completion,
        fail_fast: bool,
        window_start: DateTime<Utc>,
        state: &Mutex<TickState>,
        progress: &ProgressBar,
    ) -> Result<PollStep<()>, RolloutError> {
        let observed = self.observe(environment, completion).await;
        let mut st = lock(state);
        st.ticks += 1;

        let (snapshot, version) = match observed {
            Ok(observed) => observed,
            Err(e) if e.is_retryable() => {
                st.consecutive_failures += 1;
                st.healthy_since = None;
                warn!(
                    failures = st.consecutive_failures,
                    budget = self.max_connectivity_failures,
                    error = %e,
                    "Health sample failed"
                );
                if st.consecutive_failures > self.max_connectivity_failures {
                    let count = usize::try_from(st.consecutive_failures).unwrap_or(usize::MAX);
                    return Err(RolloutError::HealthCheck(FailureSignal::new(
                        FailureKind::ClusterUnreachable,
                        count,
                        e.to_string(),
                    )));
                }
                return Ok(PollStep::Pending);
            }
            Err(e) => return Err(e),
        };
        st.consecutive_failures = 0;

        for node in snapshot.new_nodes_since(window_start) {
            if st.surge_nodes.insert(node.name.clone()) {
                info!(node = %node.name, pool = ?node.pool, "Surge node provisioned");
            }
        }
        let cordoned = snapshot.cordoned_nodes().len();
        if cordoned > 0 {
            debug!(cordoned, "Rolling upgrade in progress");
        }
        st.max_cordoned = st.max_cordoned.max(cordoned);
        if version.is_some() {
            st.observed_version = version;
        }

        let unhealthy = snapshot.unhealthy_node_count();
        let failed = snapshot.failed_pod_count();
        progress.set_message(format!(
            "sample {}: {} nodes, {unhealthy} not ready, {failed} failed pods, {cordoned} cordoned{}",
            st.ticks,
            snapshot.nodes.len(),
            version.map(|v| format!(", version {v}")).unwrap_or_default()
        ));

        if unhealthy > 0 || failed > 0 {
            st.healthy_since = None;
            let signal = if failed > 0 {
                FailureSignal::new(FailureKind::FailedPods, failed, snapshot.failed_pod_names(5))
            } else {
                let names: Vec<&str> = snapshot
                    .unhealthy_nodes()
                    .iter()
                    .map(|n| n.name.as_str())
                    .collect();
                FailureSignal::new(FailureKind::UnhealthyNodes, unhealthy, names.join(", "))
            };
            st.latest = Some(snapshot);
            if fail_fast {
                warn!(signal = %signal, "Health threshold breached");
                return Err(RolloutError::HealthCheck(signal));
            }
            warn!(signal = %signal, "Health threshold breached, rollback disabled so continuing");
            st.warnings.push(signal.to_string());
            return Ok(PollStep::Pending);
        }
        st.latest = Some(snapshot);

        let now = Instant::now();
        let healthy_for = now - *st.healthy_since.get_or_insert(now);
        let converged = match completion {
            Completion::Settled => true,
            Completion::VersionConverged { target, .. } => version == Some(*target),
        };
        if converged && healthy_for >= self.settle {
            Ok(PollStep::Ready(()))
        } else {
            Ok(PollStep::Pending)
        }
    }
}
