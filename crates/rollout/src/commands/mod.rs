//! CLI subcommands.
//!
//! Every command resolves the same set of live collaborators for one
//! environment through [`Platform`].

pub mod execute;
pub mod preflight;
pub mod rollback;
pub mod snapshot;
pub mod teardown;
pub mod validate;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, ValueEnum};
use kube::Client;
use tracing::debug;

use rollout::cluster::azure::AzCli;
use rollout::cluster::k8s::{self, LiveClusterReader};
use rollout::cluster::kubectl::Kubectl;
use rollout::command::{CommandRunner, SystemRunner};
use rollout::config::{
    ChangeRequest, Component, Environment, ExecutionMode, ImperativeScope, RolloutConfig,
};
use rollout::infra::Terraform;
use rollout::version::KubeVersion;

/// Cluster connection flags shared by every subcommand.
#[derive(Args, Debug, Clone, Default)]
pub struct ClusterArgs {
    /// Path to kubeconfig file.
    #[arg(long, env = "KUBECONFIG", global = true)]
    pub kubeconfig: Option<PathBuf>,

    /// Kubeconfig context (defaults to the current context).
    #[arg(long, global = true)]
    pub context: Option<String>,
}

/// Scope of an imperative cluster change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ScopeArg {
    #[default]
    Full,
    ControlPlane,
    NodePool,
    NodeImage,
}

/// Flags describing the change itself.
#[derive(Args, Debug, Clone)]
pub struct ChangeArgs {
    /// Target environment.
    #[arg(short, long, value_enum)]
    pub environment: Environment,

    /// Component to change.
    #[arg(short, long, value_enum)]
    pub component: Component,

    /// Target Kubernetes version (e.g. 1.29.0).
    #[arg(short, long)]
    pub target_version: Option<KubeVersion>,

    /// How the change is applied.
    #[arg(long, value_enum, default_value_t = ExecutionMode::Declarative)]
    pub method: ExecutionMode,

    /// Scope of an imperative cluster change.
    #[arg(long, value_enum, default_value_t = ScopeArg::Full)]
    pub scope: ScopeArg,

    /// Node pool for `--scope node-pool`.
    #[arg(long, required_if_eq("scope", "node-pool"))]
    pub node_pool: Option<String>,
}

impl ChangeArgs {
    fn scope(&self) -> ImperativeScope {
        match self.scope {
            ScopeArg::Full => ImperativeScope::Full,
            ScopeArg::ControlPlane => ImperativeScope::ControlPlane,
            ScopeArg::NodePool => ImperativeScope::NodePool(self.node_pool.clone().unwrap_or_default()),
            ScopeArg::NodeImage => ImperativeScope::NodeImage,
        }
    }

    /// Request with safety features on.
    #[must_use]
    pub fn request(&self) -> ChangeRequest {
        let mut request = ChangeRequest::new(self.environment, self.component)
            .with_mode(self.method)
            .with_scope(self.scope());
        request.target_version = self.target_version;
        request
    }
}

/// Live collaborators for one environment.
pub struct Platform {
    pub config: RolloutConfig,
    pub environment: Environment,
    pub client: Client,
    pub runner: Arc<dyn CommandRunner>,
    pub az: Arc<AzCli>,
    pub reader: Arc<LiveClusterReader>,
    pub kubectl: Arc<Kubectl>,
    pub terraform: Arc<Terraform>,
}

impl Platform {
    /// Connect to the environment's cluster.
    ///
    /// # Errors
    ///
    /// Returns an error if the kube client cannot be built.
    pub async fn connect(config: RolloutConfig, environment: Environment, cluster: &ClusterArgs) -> Result<Self> {
        let client = k8s::client_from(cluster.kubeconfig.as_deref(), cluster.context.as_deref())
            .await
            .context("Failed to create Kubernetes client")?;

        let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);
        let az = Arc::new(
            AzCli::new(
                Arc::clone(&runner),
                config.resource_group(environment),
                config.cluster_name(environment),
            )
            .with_timeouts(config.read_timeout(), config.mutate_timeout()),
        );
        let reader = Arc::new(LiveClusterReader::new(
            client.clone(),
            Arc::clone(&az),
            config.read_timeout(),
        ));
        let kubectl = Arc::new(
            Kubectl::new(Arc::clone(&runner))
                .with_kubeconfig(cluster.kubeconfig.clone())
                .with_context(cluster.context.clone())
                .with_timeouts(config.read_timeout(), config.mutate_timeout()),
        );
        let terraform = Arc::new(
            Terraform::new(Arc::clone(&runner), config.infra_dir.clone(), environment)
                .with_timeouts(config.read_timeout(), config.mutate_timeout()),
        );

        debug!(
            environment = %environment,
            cluster = %config.cluster_name(environment),
            "Connected collaborators"
        );

        Ok(Self {
            config,
            environment,
            client,
            runner,
            az,
            reader,
            kubectl,
            terraform,
        })
    }

    #[must_use]
    pub fn cluster_name(&self) -> String {
        self.config.cluster_name(self.environment)
    }
}
