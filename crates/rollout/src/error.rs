//! Error taxonomy for rollout runs.
//!
//! Every phase returns one of these typed errors; the orchestrator is the only
//! place that turns them into a rollback, an abort, or a plain failure.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::command::CommandError;

/// Errors that can occur during a rollout run.
#[derive(Error, Debug)]
pub enum RolloutError {
    /// The cluster or the managed-cluster API could not be reached.
    #[error("Connectivity error ({target}): {message}")]
    Connectivity { target: String, message: String },

    /// A preflight or post-change check failed.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The health monitor observed a threshold breach.
    #[error("Health check failed: {0}")]
    HealthCheck(FailureSignal),

    /// The mutating call itself failed.
    #[error("Executor error: {message}")]
    Executor {
        message: String,
        /// Backup to use for manual recovery, if one was taken.
        backup: Option<PathBuf>,
    },

    /// The backup step failed; no mutation was attempted.
    #[error("Backup failed: {0}")]
    Backup(String),

    /// The rollback itself failed. Manual recovery is required.
    #[error("Rollback failed: {message} (backup: {})", display_backup(.backup))]
    Rollback {
        message: String,
        backup: Option<PathBuf>,
    },

    /// Another run holds the environment lock.
    #[error("Environment lock held by {holder}")]
    LockHeld { holder: String },

    /// The lock could not be acquired or released.
    #[error("Lock error: {0}")]
    Lock(String),

    /// The operator declined a confirmation.
    #[error("Operator declined: {0}")]
    Declined(String),

    /// The run was interrupted.
    #[error("Run cancelled")]
    Cancelled,

    /// Invalid request or configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Local artifact I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn display_backup(backup: &Option<PathBuf>) -> String {
    backup
        .as_ref()
        .map_or_else(|| "none".to_string(), |p| p.display().to_string())
}

impl RolloutError {
    /// Build a connectivity error.
    pub fn connectivity(target: impl Into<String>, message: impl ToString) -> Self {
        Self::Connectivity {
            target: target.into(),
            message: message.to_string(),
        }
    }

    /// Whether a bounded retry may help.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connectivity { .. })
    }

    /// Short machine-readable classification used in run summaries.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connectivity { .. } => "connectivity_error",
            Self::Validation(_) => "validation_failure",
            Self::HealthCheck(_) => "health_check_failure",
            Self::Executor { .. } => "executor_error",
            Self::Backup(_) => "backup_error",
            Self::Rollback { .. } => "rollback_error",
            Self::LockHeld { .. } | Self::Lock(_) => "lock_error",
            Self::Declined(_) => "declined",
            Self::Cancelled => "cancelled",
            Self::Config(_) => "config_error",
            Self::Io(_) | Self::Serialization(_) => "artifact_error",
        }
    }
}

impl From<CommandError> for RolloutError {
    fn from(err: CommandError) -> Self {
        match err {
            CommandError::Timeout { .. } | CommandError::Spawn { .. } => {
                Self::connectivity("command", err)
            }
            CommandError::Failed { .. } => Self::Executor {
                message: err.to_string(),
                backup: None,
            },
        }
    }
}

/// What kind of failure a phase observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    UnhealthyNodes,
    FailedPods,
    Timeout,
    ExecutorError,
    ValidationError,
    ClusterUnreachable,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnhealthyNodes => write!(f, "unhealthy nodes"),
            Self::FailedPods => write!(f, "failed pods"),
            Self::Timeout => write!(f, "timeout"),
            Self::ExecutorError => write!(f, "executor error"),
            Self::ValidationError => write!(f, "validation error"),
            Self::ClusterUnreachable => write!(f, "cluster unreachable"),
        }
    }
}

/// Signal raised by the monitor, preflight or executor and consumed by the
/// orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureSignal {
    pub kind: FailureKind,
    pub count: usize,
    pub detail: String,
}

impl FailureSignal {
    #[must_use]
    pub fn new(kind: FailureKind, count: usize, detail: impl Into<String>) -> Self {
        Self {
            kind,
            count,
            detail: detail.into(),
        }
    }
}

impl std::fmt::Display for FailureSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {}", self.kind, self.count, self.detail)
    }
}
