//! Run phases, terminal outcomes and persisted run summaries.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{Component, Environment};
use crate::error::{FailureSignal, RolloutError};
use crate::infra::PlanSummary;
use crate::report::CheckTotals;
use crate::rollback::RollbackResult;

/// Phases of a rollout run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    /// Nothing has happened yet.
    Idle,
    /// Health baseline captured.
    BaselineCaptured,
    /// Preflight checks passed or were skipped.
    Preflighted,
    /// Backup taken (or disabled).
    BackedUp,
    /// Change being applied.
    Executing,
    /// Watching cluster health after the change.
    Monitoring,

    // Terminal phases
    /// Change applied and validation ran.
    Validated,
    /// Change reverted from the backup.
    RolledBack,
    /// Run stopped without rollback.
    Aborted,
}

impl RunPhase {
    /// Next phase on the success path.
    #[must_use]
    pub fn next(self) -> Self {
        match self {
            Self::Idle => Self::BaselineCaptured,
            Self::BaselineCaptured => Self::Preflighted,
            Self::Preflighted => Self::BackedUp,
            Self::BackedUp => Self::Executing,
            Self::Executing => Self::Monitoring,
            Self::Monitoring | Self::Validated => Self::Validated,
            Self::RolledBack => Self::RolledBack,
            Self::Aborted => Self::Aborted,
        }
    }

    /// Description of the work that leads into this phase.
    #[must_use]
    pub fn description(self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::BaselineCaptured => "Capturing health baseline",
            Self::Preflighted => "Running preflight checks",
            Self::BackedUp => "Backing up state",
            Self::Executing => "Applying change",
            Self::Monitoring => "Monitoring cluster health",
            Self::Validated => "Validating",
            Self::RolledBack => "Rolled back",
            Self::Aborted => "Aborted",
        }
    }

    /// Step number for progress display.
    #[must_use]
    pub fn step_number(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::BaselineCaptured => 1,
            Self::Preflighted => 2,
            Self::BackedUp => 3,
            Self::Executing => 4,
            Self::Monitoring => 5,
            Self::Validated | Self::RolledBack | Self::Aborted => 6,
        }
    }

    /// Total number of steps.
    pub const TOTAL_STEPS: u8 = 6;

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Validated | Self::RolledBack | Self::Aborted)
    }
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Terminal status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunOutcome {
    Success,
    Failed,
    RolledBack,
    Aborted,
}

impl RunOutcome {
    #[must_use]
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::Failed | Self::RolledBack => 1,
            Self::Aborted => 2,
        }
    }
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
            Self::RolledBack => write!(f, "rolled back"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// Exit code used when a rollback failed and an operator must recover by hand.
pub const EXIT_MANUAL_RECOVERY: i32 = 3;

/// Machine-readable summary of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: String,
    pub environment: Environment,
    pub component: Component,
    pub dry_run: bool,
    pub phase: RunPhase,
    pub outcome: RunOutcome,
    pub failure_reason: Option<String>,
    /// Classification of the error that ended the run.
    pub error_kind: Option<String>,
    pub failure_signal: Option<FailureSignal>,
    pub backup: Option<PathBuf>,
    pub plan: Option<PlanSummary>,
    /// Mutating calls issued by the executor (planned ones under dry-run).
    #[serde(default)]
    pub actions: Vec<String>,
    pub mutation_secs: Option<f64>,
    pub rollback: Option<RollbackResult>,
    pub manual_recovery_required: bool,
    pub checks: CheckTotals,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_secs: f64,
}

impl RunResult {
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        if self.manual_recovery_required {
            EXIT_MANUAL_RECOVERY
        } else {
            self.outcome.exit_code()
        }
    }

    /// Persist as `{dir}/{env}-{timestamp}-{id}.json`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or file cannot be written.
    pub fn save(&self, dir: &Path) -> Result<PathBuf, RolloutError> {
        std::fs::create_dir_all(dir)?;
        let short_id: String = self.run_id.chars().take(8).collect();
        let path = dir.join(format!(
            "{}-{}-{short_id}.json",
            self.environment,
            self.started_at.format("%Y%m%dT%H%M%SZ")
        ));
        std::fs::write(&path, serde_json::to_string_pretty(self)?)?;
        info!(path = %path.display(), "Saved run summary");
        Ok(path)
    }
}

/// Retry policy for connectivity errors.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, the first one included.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    #[must_use]
    pub fn with_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (0-based).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt.min(10)).unwrap_or(10);
        let multiplier = self.backoff_multiplier.powi(exp);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        let capped = delay_secs.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Whether another attempt is allowed after `attempt` attempts.
    #[must_use]
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Run `op`, retrying retryable errors with backoff.
    ///
    /// # Errors
    ///
    /// Returns the last error once attempts are exhausted, any non-retryable
    /// error immediately, or `Cancelled` when the token fires while waiting.
    pub async fn run<T, F, Fut>(
        &self,
        what: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, RolloutError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RolloutError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && self.should_retry(attempt) => {
                    let delay = self.delay_for_attempt(attempt - 1);
                    warn!(
                        operation = what,
                        attempt,
                        delay_secs = delay.as_secs(),
                        error = %e,
                        "Transient error, retrying"
                    );
                    tokio::select! {
                        () = cancel.cancelled() => return Err(RolloutError::Cancelled),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}
