//! Safe rollouts for managed Kubernetes environments.
//!
//! A run takes one [`config::ChangeRequest`] through baseline capture,
//! preflight checks, backup, execution, health monitoring and post-change
//! validation, rolling back automatically when the cluster degrades.
//!
//! # Example
//!
//! ```ignore
//! use rollout::config::{ChangeRequest, Component, Environment, RolloutConfig};
//! use rollout::orchestrator::RolloutOrchestrator;
//!
//! let request = ChangeRequest::new(Environment::Dev, Component::Infrastructure)
//!     .with_target_version("1.29.0".parse()?);
//! let result = RolloutOrchestrator::new(RolloutConfig::load(None)?, collaborators)
//!     .run(request, CancellationToken::new())
//!     .await;
//! std::process::exit(result.exit_code());
//! ```

// Allow product names without backticks in doc comments
#![allow(clippy::doc_markdown)]
// Allow imports after statements in functions
#![allow(clippy::items_after_statements)]

pub mod backup;
pub mod cluster;
pub mod command;
pub mod config;
pub mod confirm;
pub mod context;
pub mod error;
pub mod executor;
pub mod health;
pub mod infra;
pub mod lock;
pub mod monitor;
pub mod orchestrator;
pub mod poll;
pub mod preflight;
pub mod report;
pub mod rollback;
pub mod state;
pub mod ui;
pub mod validation;
pub mod version;

pub use config::{ChangeRequest, RolloutConfig};
pub use error::RolloutError;
pub use orchestrator::{Collaborators, RolloutOrchestrator};
pub use state::{RunOutcome, RunResult};
