//! Per-run state threaded through every phase.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::backup::BackupRecord;
use crate::config::{ChangeRequest, RolloutConfig};
use crate::executor::ExecutionResult;
use crate::health::HealthSnapshot;
use crate::monitor::MonitorReport;
use crate::report::{CheckReport, CheckTotals};
use crate::state::RunPhase;

/// Everything a run has learned so far. Owned by the orchestrator; phases
/// read it and the orchestrator records their results.
pub struct RunContext {
    pub run_id: String,
    request: ChangeRequest,
    pub config: Arc<RolloutConfig>,
    pub cluster: String,
    pub started_at: DateTime<Utc>,
    pub cancel: CancellationToken,
    phase: RunPhase,
    pub baseline: Option<HealthSnapshot>,
    pub latest: Option<HealthSnapshot>,
    pub preflight: Option<CheckReport>,
    pub backup: Option<BackupRecord>,
    pub execution: Option<ExecutionResult>,
    pub monitor: Option<MonitorReport>,
    pub validation: Option<CheckReport>,
}

impl RunContext {
    #[must_use]
    pub fn new(request: ChangeRequest, config: Arc<RolloutConfig>, cancel: CancellationToken) -> Self {
        let cluster = config.cluster_name(request.environment);
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            request,
            config,
            cluster,
            started_at: Utc::now(),
            cancel,
            phase: RunPhase::Idle,
            baseline: None,
            latest: None,
            preflight: None,
            backup: None,
            execution: None,
            monitor: None,
            validation: None,
        }
    }

    /// The request is frozen for the lifetime of the run.
    #[must_use]
    pub fn request(&self) -> &ChangeRequest {
        &self.request
    }

    #[must_use]
    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    pub fn advance(&mut self, to: RunPhase) {
        info!(run_id = %self.run_id, from = ?self.phase, to = ?to, "Phase transition");
        self.phase = to;
    }

    /// Rollback needs both the flag and a backup of this run.
    #[must_use]
    pub fn can_roll_back(&self) -> bool {
        self.request.effective_rollback() && self.backup.is_some()
    }

    #[must_use]
    pub fn backup_path(&self) -> Option<PathBuf> {
        self.backup.as_ref().map(|b| b.directory.clone())
    }

    #[must_use]
    pub fn check_totals(&self) -> CheckTotals {
        let totals = |r: &Option<CheckReport>| r.as_ref().map(CheckReport::totals).unwrap_or_default();
        totals(&self.preflight).merge(totals(&self.validation))
    }

    #[must_use]
    pub fn manifest_path(&self, dir: &str) -> PathBuf {
        self.config.manifests_dir.join(dir)
    }
}
