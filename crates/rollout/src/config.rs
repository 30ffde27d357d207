//! Run configuration and change-request types.
//!
//! [`RolloutConfig`] carries the operator-level settings (naming, timeouts,
//! directories) and is loaded from an optional TOML file plus environment
//! overrides. [`ChangeRequest`] describes a single run and is frozen once the
//! run starts.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::RolloutError;
use crate::version::KubeVersion;

/// Environment variable overriding the project identifier.
const ENV_PROJECT: &str = "ROLLOUT_PROJECT";
/// Environment variable overriding the notification webhook.
const ENV_WEBHOOK_URL: &str = "ROLLOUT_WEBHOOK_URL";
/// Environment variable overriding the backup root.
const ENV_BACKUP_DIR: &str = "ROLLOUT_BACKUP_DIR";

/// Default config file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "rollout.toml";

/// Deployment environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Dev,
    Staging,
    Prod,
}

impl Environment {
    /// Whether every non-dry-run change needs explicit confirmation.
    #[must_use]
    pub fn is_protected(self) -> bool {
        matches!(self, Self::Prod)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dev => "dev",
            Self::Staging => "staging",
            Self::Prod => "prod",
        }
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Environment {
    type Err = RolloutError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dev" | "development" => Ok(Self::Dev),
            "staging" | "stage" => Ok(Self::Staging),
            "prod" | "production" => Ok(Self::Prod),
            _ => Err(RolloutError::Config(format!(
                "Unknown environment: {s}. Supported: dev, staging, prod"
            ))),
        }
    }
}

/// Which part of the platform a run changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Component {
    Infrastructure,
    PlatformServices,
    Applications,
    All,
}

impl Component {
    /// Whether the infra backend state is touched.
    #[must_use]
    pub fn touches_infrastructure(self) -> bool {
        matches!(self, Self::Infrastructure | Self::All)
    }

    /// Whether in-cluster workloads are touched.
    #[must_use]
    pub fn touches_workloads(self) -> bool {
        matches!(self, Self::PlatformServices | Self::Applications | Self::All)
    }

    /// Manifest subdirectories applied for this component.
    #[must_use]
    pub fn manifest_dirs(self) -> &'static [&'static str] {
        match self {
            Self::Infrastructure => &[],
            Self::PlatformServices => &["platform-services"],
            Self::Applications => &["applications"],
            Self::All => &["platform-services", "applications"],
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Infrastructure => "infrastructure",
            Self::PlatformServices => "platform-services",
            Self::Applications => "applications",
            Self::All => "all",
        }
    }
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How the change is applied.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Plan-then-apply through the desired-state backend.
    #[default]
    Declarative,
    /// Direct scoped commands against the managed-cluster API.
    Imperative,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Declarative => write!(f, "declarative"),
            Self::Imperative => write!(f, "imperative"),
        }
    }
}

/// Sub-mode of an imperative cluster change.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "scope", content = "pool")]
pub enum ImperativeScope {
    /// Control plane and every node pool.
    #[default]
    Full,
    /// Control plane version only.
    ControlPlane,
    /// A single node pool's version.
    NodePool(String),
    /// Node image refresh on every pool, no version change.
    NodeImage,
}

impl ImperativeScope {
    /// Whether the scope changes the Kubernetes version.
    #[must_use]
    pub fn requires_version(&self) -> bool {
        !matches!(self, Self::NodeImage)
    }
}

impl std::fmt::Display for ImperativeScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full => write!(f, "full"),
            Self::ControlPlane => write!(f, "control-plane"),
            Self::NodePool(pool) => write!(f, "node-pool:{pool}"),
            Self::NodeImage => write!(f, "node-image"),
        }
    }
}

/// A single requested change. Frozen once the run starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRequest {
    pub environment: Environment,
    pub component: Component,
    pub target_version: Option<KubeVersion>,
    pub execution_mode: ExecutionMode,
    pub imperative_scope: ImperativeScope,
    pub dry_run: bool,
    pub skip_preflight: bool,
    pub skip_validation: bool,
    pub backup_enabled: bool,
    pub rollback_enabled: bool,
}

impl ChangeRequest {
    /// Request with safety features on and no target version.
    #[must_use]
    pub fn new(environment: Environment, component: Component) -> Self {
        Self {
            environment,
            component,
            target_version: None,
            execution_mode: ExecutionMode::default(),
            imperative_scope: ImperativeScope::default(),
            dry_run: false,
            skip_preflight: false,
            skip_validation: false,
            backup_enabled: true,
            rollback_enabled: true,
        }
    }

    #[must_use]
    pub fn with_target_version(mut self, version: KubeVersion) -> Self {
        self.target_version = Some(version);
        self
    }

    #[must_use]
    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.execution_mode = mode;
        self
    }

    #[must_use]
    pub fn with_scope(mut self, scope: ImperativeScope) -> Self {
        self.imperative_scope = scope;
        self
    }

    /// Rollback is only possible when a backup is taken.
    #[must_use]
    pub fn effective_rollback(&self) -> bool {
        self.rollback_enabled && self.backup_enabled
    }

    /// Whether this run changes the cluster version or node image.
    #[must_use]
    pub fn is_cluster_upgrade(&self) -> bool {
        self.component.touches_infrastructure()
            && (self.target_version.is_some()
                || (self.execution_mode == ExecutionMode::Imperative
                    && self.imperative_scope == ImperativeScope::NodeImage))
    }

    /// Reject internally inconsistent requests before anything runs.
    ///
    /// # Errors
    ///
    /// Returns a config error describing the inconsistency.
    pub fn validate(&self) -> Result<(), RolloutError> {
        if self.execution_mode == ExecutionMode::Imperative
            && self.component.touches_infrastructure()
            && self.imperative_scope.requires_version()
            && self.target_version.is_none()
        {
            return Err(RolloutError::Config(format!(
                "Imperative scope '{}' requires --target-version",
                self.imperative_scope
            )));
        }
        if let ImperativeScope::NodePool(pool) = &self.imperative_scope {
            if pool.trim().is_empty() {
                return Err(RolloutError::Config("Node pool name must not be empty".into()));
            }
        }
        Ok(())
    }
}

/// Operator-level settings shared by every run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RolloutConfig {
    /// Project identifier used in resource names.
    pub project: String,
    /// Directory holding the infra backend configuration.
    pub infra_dir: PathBuf,
    /// Directory holding per-component manifests.
    pub manifests_dir: PathBuf,
    /// Root for backup artifacts and run summaries.
    pub backup_dir: PathBuf,
    /// Namespaces whose manifests are backed up before workload changes.
    pub critical_namespaces: Vec<String>,
    /// Namespace of the GitOps controller.
    pub gitops_namespace: String,
    /// Namespace of the monitoring stack.
    pub monitoring_namespace: String,
    /// Namespace holding the environment lock lease.
    pub lock_namespace: String,
    /// Health poll interval in seconds.
    pub poll_interval_secs: u64,
    /// Monitor timeout for a single execution step.
    pub step_timeout_secs: u64,
    /// Monitor timeout for an end-to-end watch (full cluster upgrades).
    pub watch_timeout_secs: u64,
    /// Minimum healthy streak before a run without a version target settles.
    pub settle_secs: u64,
    /// Hard timeout for read calls.
    pub read_timeout_secs: u64,
    /// Hard timeout for mutating calls.
    pub mutate_timeout_secs: u64,
    /// Attempts for connectivity errors before aborting.
    pub connectivity_retries: u32,
    /// Roll back automatically when the operator interrupts a run.
    pub rollback_on_interrupt: bool,
    /// How long an interrupted mutation may take to stop on its own before
    /// its process is killed.
    pub interrupt_grace_secs: u64,
    /// Run the extended post-change checks.
    pub extended_validation: bool,
    /// Optional notification webhook.
    pub webhook_url: Option<String>,
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            project: "aks-platform".into(),
            infra_dir: PathBuf::from("terraform"),
            manifests_dir: PathBuf::from("manifests"),
            backup_dir: PathBuf::from("backups"),
            critical_namespaces: vec![
                "argocd".into(),
                "monitoring".into(),
                "cert-manager".into(),
                "ingress-nginx".into(),
            ],
            gitops_namespace: "argocd".into(),
            monitoring_namespace: "monitoring".into(),
            lock_namespace: "default".into(),
            poll_interval_secs: 30,
            step_timeout_secs: 1800,
            watch_timeout_secs: 7200,
            settle_secs: 60,
            read_timeout_secs: 60,
            mutate_timeout_secs: 3600,
            connectivity_retries: 3,
            rollback_on_interrupt: false,
            interrupt_grace_secs: 120,
            extended_validation: false,
            webhook_url: None,
        }
    }
}

impl RolloutConfig {
    /// Load configuration.
    ///
    /// Reads `path` when given (must exist), otherwise `rollout.toml` in the
    /// working directory if present, otherwise defaults. Environment
    /// overrides are applied last.
    ///
    /// # Errors
    ///
    /// Returns an error if an explicit file is missing or any file fails to
    /// parse.
    pub fn load(path: Option<&Path>) -> Result<Self, RolloutError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => {
                debug!("No config file found, using defaults");
                Self::default()
            }
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse a TOML config file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, RolloutError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            RolloutError::Config(format!("Failed to read {}: {e}", path.display()))
        })?;
        let config: Self = toml::from_str(&content).map_err(|e| {
            RolloutError::Config(format!("Failed to parse {}: {e}", path.display()))
        })?;
        info!(path = %path.display(), "Loaded rollout configuration");
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(project) = std::env::var(ENV_PROJECT) {
            if !project.is_empty() {
                self.project = project;
            }
        }
        if let Ok(url) = std::env::var(ENV_WEBHOOK_URL) {
            if !url.is_empty() {
                self.webhook_url = Some(url);
            }
        }
        if let Ok(dir) = std::env::var(ENV_BACKUP_DIR) {
            if !dir.is_empty() {
                self.backup_dir = PathBuf::from(dir);
            }
        }
    }

    /// Resource group holding the environment's managed cluster.
    #[must_use]
    pub fn resource_group(&self, env: Environment) -> String {
        format!("rg-{}-{env}", self.project)
    }

    /// Managed cluster name for the environment.
    #[must_use]
    pub fn cluster_name(&self, env: Environment) -> String {
        format!("aks-{}-{env}", self.project)
    }

    /// Lease name used as the per-environment run lock.
    #[must_use]
    pub fn lock_name(&self, env: Environment) -> String {
        format!("rollout-{}-{env}", self.project)
    }

    /// Directory for persisted run summaries.
    #[must_use]
    pub fn runs_dir(&self) -> PathBuf {
        self.backup_dir.join("runs")
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    #[must_use]
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    #[must_use]
    pub fn mutate_timeout(&self) -> Duration {
        Duration::from_secs(self.mutate_timeout_secs)
    }

    #[must_use]
    pub fn interrupt_grace(&self) -> Duration {
        Duration::from_secs(self.interrupt_grace_secs)
    }

    #[must_use]
    pub fn settle_time(&self) -> Duration {
        Duration::from_secs(self.settle_secs)
    }

    /// Monitor timeout for a request: full-cluster upgrades get the long
    /// end-to-end watch, everything else a single step.
    #[must_use]
    pub fn monitor_timeout(&self, request: &ChangeRequest) -> Duration {
        let full_upgrade = request.component.touches_infrastructure()
            && request.target_version.is_some()
            && request.imperative_scope == ImperativeScope::Full;
        if full_upgrade {
            Duration::from_secs(self.watch_timeout_secs)
        } else {
            Duration::from_secs(self.step_timeout_secs)
        }
    }
}
