//! Restore from a [`BackupRecord`].
//!
//! Every blob in the record is restored independently so one failure does not
//! hide the others. Restoring the same record twice is safe: state pushes and
//! manifest applies are both idempotent.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::backup::BackupRecord;
use crate::cluster::WorkloadClient;
use crate::error::RolloutError;
use crate::infra::InfraBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestoreStatus {
    Restored,
    Failed,
}

/// Outcome for one blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackItem {
    pub target: String,
    pub status: RestoreStatus,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackResult {
    pub backup_id: String,
    pub directory: PathBuf,
    pub items: Vec<RollbackItem>,
    pub duration_secs: f64,
}

impl RollbackResult {
    #[must_use]
    pub fn failed_items(&self) -> Vec<&RollbackItem> {
        self.items
            .iter()
            .filter(|i| i.status == RestoreStatus::Failed)
            .collect()
    }
}

pub struct RollbackController {
    infra: Arc<dyn InfraBackend>,
    workloads: Arc<dyn WorkloadClient>,
}

impl RollbackController {
    #[must_use]
    pub fn new(infra: Arc<dyn InfraBackend>, workloads: Arc<dyn WorkloadClient>) -> Self {
        Self { infra, workloads }
    }

    /// Restore everything in `record`.
    ///
    /// # Errors
    ///
    /// Returns [`RolloutError::Rollback`] when there is no usable record or
    /// when any item fails to restore. The error names the backup directory.
    pub async fn rollback(&self, record: Option<&BackupRecord>) -> Result<RollbackResult, RolloutError> {
        let Some(record) = record else {
            return Err(RolloutError::Rollback {
                message: "no backup record for this run".into(),
                backup: None,
            });
        };
        record.verify().map_err(|message| RolloutError::Rollback {
            message,
            backup: Some(record.directory.clone()),
        })?;

        let started = Instant::now();
        warn!(backup = %record.directory.display(), "Rolling back");
        let mut items = Vec::new();

        if let Some(blob) = &record.infra_state {
            let outcome = match tokio::fs::read_to_string(record.path_of(&blob.file)).await {
                Ok(state) => self.infra.push_state(state).await,
                Err(e) => Err(RolloutError::Io(e)),
            };
            items.push(item("infrastructure state", outcome.map(|()| "state pushed".to_string())));
        }

        for manifest in &record.manifests {
            let outcome = self.workloads.apply_path(&record.path_of(&manifest.file)).await;
            items.push(item(&format!("namespace {}", manifest.namespace), outcome));
        }

        if let Some(blob) = &record.gitops_applications {
            let outcome = self.workloads.apply_path(&record.path_of(&blob.file)).await;
            items.push(item("gitops applications", outcome));
        }

        let result = RollbackResult {
            backup_id: record.id.clone(),
            directory: record.directory.clone(),
            items,
            duration_secs: started.elapsed().as_secs_f64(),
        };

        let failed = result.failed_items();
        if failed.is_empty() {
            info!(
                backup = %record.id,
                items = result.items.len(),
                duration_secs = result.duration_secs,
                "Rollback complete"
            );
            Ok(result)
        } else {
            let targets: Vec<&str> = failed.iter().map(|i| i.target.as_str()).collect();
            Err(RolloutError::Rollback {
                message: format!("failed to restore {}", targets.join(", ")),
                backup: Some(record.directory.clone()),
            })
        }
    }
}

fn item(target: &str, outcome: Result<String, RolloutError>) -> RollbackItem {
    match outcome {
        Ok(detail) => {
            info!(item = target, "Restored");
            RollbackItem {
                target: target.to_string(),
                status: RestoreStatus::Restored,
                detail: detail.trim().to_string(),
            }
        }
        Err(e) => {
            error!(item = target, error = %e, "Restore failed");
            RollbackItem {
                target: target.to_string(),
                status: RestoreStatus::Failed,
                detail: e.to_string(),
            }
        }
    }
}
