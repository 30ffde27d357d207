//! Rollout lifecycle events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Severity levels for notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Normal progress
    Info,
    /// The run did not reach its goal but the environment is consistent
    Warning,
    /// An operator must step in
    Critical,
}

impl Severity {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

/// Events that can trigger notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotifyEvent {
    /// A run acquired its lock and is about to start.
    RunStarted {
        run_id: String,
        environment: String,
        component: String,
        #[serde(default)]
        target_version: Option<String>,
        dry_run: bool,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },

    /// A failure triggered an automatic rollback.
    RollbackStarted {
        run_id: String,
        environment: String,
        reason: String,
        backup: String,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },

    /// A run reached its terminal state.
    RunFinished {
        run_id: String,
        environment: String,
        component: String,
        outcome: String,
        success: bool,
        manual_recovery: bool,
        duration_secs: u64,
        #[serde(default)]
        detail: Option<String>,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },
}

impl NotifyEvent {
    /// One-line human-readable message.
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Self::RunStarted {
                run_id,
                environment,
                component,
                target_version,
                dry_run,
                ..
            } => {
                let target = target_version
                    .as_deref()
                    .map(|v| format!(" to {v}"))
                    .unwrap_or_default();
                let mode = if *dry_run { " (dry-run)" } else { "" };
                format!("[{environment}] Rollout of {component}{target} started{mode}, run {}", short(run_id))
            }
            Self::RollbackStarted {
                run_id,
                environment,
                reason,
                backup,
                ..
            } => format!(
                "[{environment}] Rolling back run {} from {backup}: {reason}",
                short(run_id)
            ),
            Self::RunFinished {
                run_id,
                environment,
                component,
                outcome,
                duration_secs,
                detail,
                manual_recovery,
                ..
            } => {
                let mut message = format!(
                    "[{environment}] Rollout of {component} {outcome} after {}, run {}",
                    format_duration(*duration_secs),
                    short(run_id)
                );
                if let Some(detail) = detail {
                    message.push_str(": ");
                    message.push_str(detail);
                }
                if *manual_recovery {
                    message.push_str(". Manual recovery required");
                }
                message
            }
        }
    }

    #[must_use]
    pub const fn severity(&self) -> Severity {
        match self {
            Self::RunStarted { .. } => Severity::Info,
            Self::RollbackStarted { .. } => Severity::Warning,
            Self::RunFinished {
                success,
                manual_recovery,
                ..
            } => {
                if *manual_recovery {
                    Severity::Critical
                } else if *success {
                    Severity::Info
                } else {
                    Severity::Warning
                }
            }
        }
    }

    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::RunStarted { timestamp, .. }
            | Self::RollbackStarted { timestamp, .. }
            | Self::RunFinished { timestamp, .. } => *timestamp,
        }
    }
}

fn short(run_id: &str) -> &str {
    run_id.get(..8).unwrap_or(run_id)
}

/// Format seconds into a human-readable duration.
fn format_duration(secs: u64) -> String {
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        let mins = secs / 60;
        let remaining_secs = secs % 60;
        if remaining_secs == 0 {
            format!("{mins}m")
        } else {
            format!("{mins}m {remaining_secs}s")
        }
    } else {
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        if mins == 0 {
            format!("{hours}h")
        } else {
            format!("{hours}h {mins}m")
        }
    }
}
