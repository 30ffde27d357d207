//! Pre-change backups.
//!
//! A backup is a directory `{root}/{env}-{timestamp}` holding:
//!
//! - `infra.tfstate`: the infra backend state blob
//! - `manifests/{namespace}.yaml`: exported workload resources
//! - `gitops-applications.yaml`: GitOps application definitions
//! - `backup.json`: the [`BackupRecord`] describing the above
//!
//! Directories are created exclusively and never reused.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cluster::WorkloadClient;
use crate::config::{ChangeRequest, Component, Environment};
use crate::error::RolloutError;
use crate::infra::InfraBackend;

pub const RECORD_FILE: &str = "backup.json";
pub const INFRA_STATE_FILE: &str = "infra.tfstate";
pub const GITOPS_FILE: &str = "gitops-applications.yaml";
pub const MANIFESTS_DIR: &str = "manifests";

/// A stored blob, relative to the backup directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobRef {
    pub file: String,
    pub size: u64,
}

/// Exported manifests of one namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestBlob {
    pub namespace: String,
    pub file: String,
    pub size: u64,
    pub objects: usize,
}

/// Description of one backup directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: String,
    pub environment: Environment,
    pub component: Component,
    pub created_at: DateTime<Utc>,
    pub directory: PathBuf,
    pub infra_state: Option<BlobRef>,
    pub manifests: Vec<ManifestBlob>,
    pub gitops_applications: Option<BlobRef>,
}

impl BackupRecord {
    /// Load `backup.json` from a backup directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the record is missing or unreadable.
    pub fn load(directory: &Path) -> Result<Self, RolloutError> {
        let path = directory.join(RECORD_FILE);
        let content = std::fs::read_to_string(&path).map_err(|e| RolloutError::Rollback {
            message: format!("cannot read {}: {e}", path.display()),
            backup: Some(directory.to_path_buf()),
        })?;
        let mut record: Self = serde_json::from_str(&content)?;
        // the directory may have been moved since it was written
        record.directory = directory.to_path_buf();
        Ok(record)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.infra_state.is_none() && self.manifests.is_empty() && self.gitops_applications.is_none()
    }

    /// Check that every referenced blob exists and is non-empty.
    ///
    /// # Errors
    ///
    /// Returns a description of the first missing or empty blob.
    pub fn verify(&self) -> Result<(), String> {
        if self.is_empty() {
            return Err(format!("backup {} contains no blobs", self.id));
        }
        let files = self
            .infra_state
            .iter()
            .chain(self.gitops_applications.iter())
            .map(|b| b.file.as_str())
            .chain(self.manifests.iter().map(|m| m.file.as_str()));
        for file in files {
            let path = self.directory.join(file);
            match std::fs::metadata(&path) {
                Ok(meta) if meta.len() > 0 => {}
                Ok(_) => return Err(format!("{} is empty", path.display())),
                Err(e) => return Err(format!("{}: {e}", path.display())),
            }
        }
        Ok(())
    }

    /// Absolute path of a blob.
    #[must_use]
    pub fn path_of(&self, file: &str) -> PathBuf {
        self.directory.join(file)
    }
}

/// Creates backups before mutations.
pub struct BackupManager {
    infra: Arc<dyn InfraBackend>,
    workloads: Arc<dyn WorkloadClient>,
    root: PathBuf,
    critical_namespaces: Vec<String>,
}

impl BackupManager {
    #[must_use]
    pub fn new(
        infra: Arc<dyn InfraBackend>,
        workloads: Arc<dyn WorkloadClient>,
        root: impl Into<PathBuf>,
        critical_namespaces: Vec<String>,
    ) -> Self {
        Self {
            infra,
            workloads,
            root: root.into(),
            critical_namespaces,
        }
    }

    /// Back up everything the request may change.
    ///
    /// A partially written backup is removed and reported as an error.
    ///
    /// # Errors
    ///
    /// Returns [`RolloutError::Backup`] on any read, write or verification
    /// failure.
    pub async fn create_backup(&self, request: &ChangeRequest) -> Result<BackupRecord, RolloutError> {
        let created_at = Utc::now();
        let id = format!("{}-{}", request.environment, created_at.format("%Y%m%dT%H%M%SZ"));
        let directory = self.root.join(&id);

        std::fs::create_dir_all(&self.root)
            .map_err(|e| backup_err(format!("cannot create {}: {e}", self.root.display())))?;
        std::fs::create_dir(&directory).map_err(|e| match e.kind() {
            ErrorKind::AlreadyExists => {
                backup_err(format!("{} already exists; refusing to overwrite", directory.display()))
            }
            _ => backup_err(format!("cannot create {}: {e}", directory.display())),
        })?;

        let mut record = BackupRecord {
            id,
            environment: request.environment,
            component: request.component,
            created_at,
            directory,
            infra_state: None,
            manifests: Vec::new(),
            gitops_applications: None,
        };

        match self.fill(&mut record, request.component).await {
            Ok(()) => {
                info!(
                    backup = %record.directory.display(),
                    manifests = record.manifests.len(),
                    infra = record.infra_state.is_some(),
                    "Backup complete"
                );
                Ok(record)
            }
            Err(e) => {
                warn!(backup = %record.directory.display(), error = %e, "Removing partial backup");
                if let Err(rm) = std::fs::remove_dir_all(&record.directory) {
                    warn!(error = %rm, "Failed to remove partial backup directory");
                }
                Err(match e {
                    RolloutError::Backup(_) => e,
                    other => backup_err(other.to_string()),
                })
            }
        }
    }

    async fn fill(&self, record: &mut BackupRecord, component: Component) -> Result<(), RolloutError> {
        if component.touches_infrastructure() {
            let state = self
                .infra
                .pull_state()
                .await
                .map_err(|e| backup_err(format!("infra state pull failed: {e}")))?;
            if state.trim().is_empty() {
                return Err(backup_err("infra state is empty"));
            }
            record.infra_state = Some(write_blob(&record.directory, INFRA_STATE_FILE, &state)?);
        }

        if component.touches_workloads() {
            std::fs::create_dir(record.directory.join(MANIFESTS_DIR))?;
            for namespace in &self.critical_namespaces {
                let Some(yaml) = self
                    .workloads
                    .export_namespace(namespace)
                    .await
                    .map_err(|e| backup_err(format!("export of {namespace} failed: {e}")))?
                else {
                    debug!(namespace, "Namespace absent, nothing to back up");
                    continue;
                };
                let (yaml, objects) = sanitize_export(&yaml)
                    .map_err(|e| backup_err(format!("export of {namespace} is unreadable: {e}")))?;
                if objects == 0 {
                    debug!(namespace, "Namespace has no exportable objects");
                    continue;
                }
                let file = format!("{MANIFESTS_DIR}/{namespace}.yaml");
                let blob = write_blob(&record.directory, &file, &yaml)?;
                record.manifests.push(ManifestBlob {
                    namespace: namespace.clone(),
                    file: blob.file,
                    size: blob.size,
                    objects,
                });
            }

            if let Some(yaml) = self
                .workloads
                .export_gitops_applications()
                .await
                .map_err(|e| backup_err(format!("GitOps export failed: {e}")))?
            {
                let (yaml, objects) = sanitize_export(&yaml)
                    .map_err(|e| backup_err(format!("GitOps export is unreadable: {e}")))?;
                if objects > 0 {
                    record.gitops_applications = Some(write_blob(&record.directory, GITOPS_FILE, &yaml)?);
                }
            }
        }

        let json = serde_json::to_string_pretty(record)?;
        std::fs::write(record.directory.join(RECORD_FILE), json)?;
        record.verify().map_err(backup_err)
    }
}

fn backup_err(message: impl Into<String>) -> RolloutError {
    RolloutError::Backup(message.into())
}

fn write_blob(dir: &Path, file: &str, content: &str) -> Result<BlobRef, RolloutError> {
    let path = dir.join(file);
    std::fs::write(&path, content)
        .map_err(|e| backup_err(format!("cannot write {}: {e}", path.display())))?;
    Ok(BlobRef {
        file: file.to_string(),
        size: content.len() as u64,
    })
}

/// Server-populated fields that make a re-apply conflict with the live object.
const SERVER_FIELDS: &[&str] = &[
    "resourceVersion",
    "uid",
    "creationTimestamp",
    "managedFields",
    "generation",
    "selfLink",
];

/// Strip status and server-populated metadata from a `kind: List` export.
/// Returns the cleaned YAML and the number of objects in it.
fn sanitize_export(yaml: &str) -> Result<(String, usize), serde_yaml::Error> {
    let mut list: serde_yaml::Value = serde_yaml::from_str(yaml)?;
    let Some(items) = list
        .get_mut("items")
        .and_then(serde_yaml::Value::as_sequence_mut)
    else {
        return Ok((String::new(), 0));
    };
    for item in items.iter_mut() {
        if let Some(object) = item.as_mapping_mut() {
            object.remove("status");
        }
        if let Some(metadata) = item
            .get_mut("metadata")
            .and_then(serde_yaml::Value::as_mapping_mut)
        {
            for field in SERVER_FIELDS {
                metadata.remove(*field);
            }
        }
    }
    let objects = items.len();
    Ok((serde_yaml::to_string(&list)?, objects))
}
