//! Rollout orchestration.
//!
//! [`RolloutOrchestrator::run`] drives one change request through
//! baseline, preflight, backup, execution, monitoring and validation, and is
//! the only place that decides between rollback, abort and plain failure.
//! Every run ends in a [`RunResult`], whatever happened.

use std::sync::Arc;

use chrono::Utc;
use notify::{Notifier, NotifyEvent};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::backup::BackupManager;
use crate::cluster::{ClusterStatusReader, ManagedClusterControl, WorkloadClient};
use crate::command::CommandRunner;
use crate::config::{ChangeRequest, RolloutConfig};
use crate::confirm::{self, ConfirmationPort};
use crate::context::RunContext;
use crate::error::{FailureKind, FailureSignal, RolloutError};
use crate::executor::{ChangeExecutor, ExecutionResult, ExecutorBackends};
use crate::health::HealthSnapshot;
use crate::infra::InfraBackend;
use crate::lock::RunLock;
use crate::monitor::{Completion, HealthMonitor};
use crate::preflight::PreflightValidator;
use crate::rollback::{RollbackController, RollbackResult};
use crate::state::{RetryConfig, RunOutcome, RunPhase, RunResult};
use crate::ui;
use crate::validation::PostChangeValidator;

/// External systems a run talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub reader: Arc<dyn ClusterStatusReader>,
    pub control: Arc<dyn ManagedClusterControl>,
    pub workloads: Arc<dyn WorkloadClient>,
    pub infra: Arc<dyn InfraBackend>,
    pub lock: Arc<dyn RunLock>,
    pub confirm: Arc<dyn ConfirmationPort>,
    /// Runner for optional scanners such as `pluto`.
    pub scanner: Option<Arc<dyn CommandRunner>>,
    pub notifier: Arc<Notifier>,
}

/// What became of the executor call.
enum Applied {
    Finished(Result<ExecutionResult, RolloutError>),
    /// Cancelled mid-call; `None` when the call outlived the grace period.
    Interrupted(Option<Result<ExecutionResult, RolloutError>>),
}

/// How a run ended, before it is turned into a [`RunResult`].
struct Ending {
    outcome: RunOutcome,
    error: Option<RolloutError>,
    rollback: Option<RollbackResult>,
    manual_recovery: bool,
}

impl Ending {
    fn new(outcome: RunOutcome, error: Option<RolloutError>) -> Self {
        Self {
            outcome,
            error,
            rollback: None,
            manual_recovery: false,
        }
    }
}

pub struct RolloutOrchestrator {
    config: Arc<RolloutConfig>,
    deps: Collaborators,
    spinner: bool,
}

impl RolloutOrchestrator {
    #[must_use]
    pub fn new(config: RolloutConfig, deps: Collaborators) -> Self {
        Self {
            config: Arc::new(config),
            deps,
            spinner: true,
        }
    }

    /// Show the monitor spinner (off for tests and JSON output).
    #[must_use]
    pub fn with_spinner(mut self, spinner: bool) -> Self {
        self.spinner = spinner;
        self
    }

    /// Run one change request to a terminal state.
    ///
    /// The summary is persisted under the configured runs directory; a
    /// failure to persist it is logged, not returned.
    pub async fn run(&self, request: ChangeRequest, cancel: CancellationToken) -> RunResult {
        let mut ctx = RunContext::new(request, Arc::clone(&self.config), cancel);
        Self::print_header(&ctx);

        let ending = match ctx.request().validate() {
            Ok(()) => self.locked(&mut ctx).await,
            Err(e) => {
                ctx.advance(RunPhase::Aborted);
                Ending::new(RunOutcome::Aborted, Some(e))
            }
        };

        let result = Self::summarize(&ctx, ending);
        match result.save(&self.config.runs_dir()) {
            Ok(path) => ui::print_kv("Run summary", &path.display().to_string()),
            Err(e) => warn!(error = %e, "Could not persist run summary"),
        }
        Self::print_footer(&result);
        self.deps.notifier.notify_and_wait(finished_event(&result)).await;
        result
    }

    async fn locked(&self, ctx: &mut RunContext) -> Ending {
        let guard = match self.deps.lock.acquire(&ctx.run_id).await {
            Ok(guard) => guard,
            Err(e) => {
                error!(error = %e, environment = %ctx.request().environment, "Could not take environment lock");
                ui::print_error(&e.to_string());
                ctx.advance(RunPhase::Aborted);
                return Ending::new(RunOutcome::Aborted, Some(e));
            }
        };

        let request = ctx.request();
        self.deps.notifier.notify(NotifyEvent::RunStarted {
            run_id: ctx.run_id.clone(),
            environment: request.environment.to_string(),
            component: request.component.to_string(),
            target_version: request.target_version.map(|v| v.to_string()),
            dry_run: request.dry_run,
            timestamp: Utc::now(),
        });

        let ending = match self.phases(ctx).await {
            Ok(()) => Self::completed(ctx),
            Err(e) => self.handle_failure(ctx, e).await,
        };

        if let Err(e) = guard.release().await {
            warn!(error = %e, "Failed to release environment lock");
        }
        ending
    }

    /// The success path. Any error ends it; [`Self::handle_failure`] decides
    /// what that error means.
    async fn phases(&self, ctx: &mut RunContext) -> Result<(), RolloutError> {
        let request = ctx.request().clone();
        let env = request.environment;

        if env.is_protected() && !request.dry_run {
            ui::print_warning(&format!("Target environment is {env}"));
            confirm::require(
                self.deps.confirm.as_ref(),
                &format!("Apply {} change to {env}?", request.component),
            )
            .await?;
        }

        step(RunPhase::BaselineCaptured);
        let retry = RetryConfig::with_attempts(self.config.connectivity_retries);
        let reader = self.deps.reader.as_ref();
        let baseline = retry
            .run("baseline capture", &ctx.cancel, || HealthSnapshot::capture(reader, env))
            .await?;
        ui::print_kv(
            "Baseline",
            &format!(
                "{} nodes ({} not ready), {} pods ({} failed)",
                baseline.nodes.len(),
                baseline.unhealthy_node_count(),
                baseline.pods.len(),
                baseline.failed_pod_count()
            ),
        );
        ctx.baseline = Some(baseline);
        ctx.advance(RunPhase::BaselineCaptured);

        step(RunPhase::Preflighted);
        self.preflight(ctx).await?;
        ctx.advance(RunPhase::Preflighted);

        step(RunPhase::BackedUp);
        if request.dry_run {
            ui::print_info("Dry run: no backup taken");
        } else if !request.backup_enabled {
            ui::print_warning("Backup disabled: automatic rollback is unavailable");
        } else {
            let manager = BackupManager::new(
                Arc::clone(&self.deps.infra),
                Arc::clone(&self.deps.workloads),
                self.config.backup_dir.clone(),
                self.config.critical_namespaces.clone(),
            );
            let record = manager.create_backup(&request).await?;
            ui::print_success(&format!("Backup written to {}", record.directory.display()));
            ctx.backup = Some(record);
        }
        ctx.advance(RunPhase::BackedUp);

        step(RunPhase::Executing);
        ctx.advance(RunPhase::Executing);
        let executor = ChangeExecutor::select(
            request.execution_mode,
            ExecutorBackends {
                infra: Arc::clone(&self.deps.infra),
                control: Arc::clone(&self.deps.control),
                workloads: Arc::clone(&self.deps.workloads),
                reader: Arc::clone(&self.deps.reader),
            },
        );
        if ctx.cancel.is_cancelled() {
            return Err(RolloutError::Cancelled);
        }
        let execution = match self.apply_with_grace(&executor, ctx).await {
            Applied::Finished(result) => result?,
            Applied::Interrupted(finished) => {
                match finished {
                    Some(Ok(execution)) => {
                        ui::print_info("In-flight change finished after the interrupt");
                        ctx.execution = Some(execution);
                    }
                    Some(Err(e)) => warn!(error = %e, "In-flight change failed after the interrupt"),
                    None => {
                        error!("In-flight change did not stop within the grace period and was killed");
                        ui::print_error("In-flight change was killed; state may need manual recovery");
                    }
                }
                return Err(RolloutError::Cancelled);
            }
        };
        if request.dry_run {
            ui::print_success(&format!(
                "Dry run complete: {} change(s) would be applied",
                execution.actions.len()
            ));
            ctx.execution = Some(execution);
            return Ok(());
        }
        ui::print_success(&format!(
            "Change applied in {}s",
            execution.mutation_duration.as_secs()
        ));
        ctx.execution = Some(execution);

        step(RunPhase::Monitoring);
        ctx.advance(RunPhase::Monitoring);
        let monitor = HealthMonitor::from_config(Arc::clone(&self.deps.reader), &self.config, &request);
        let progress = if self.spinner {
            ui::monitor_spinner("Waiting for the first health sample")
        } else {
            ui::hidden_spinner()
        };
        let watched = monitor
            .watch(
                env,
                &Completion::for_request(&request),
                request.effective_rollback(),
                &ctx.cancel,
                &progress,
            )
            .await;
        progress.finish_and_clear();
        let mut report = watched?;
        for warning in &report.warnings {
            ui::print_warning(warning);
        }
        if !report.surge_nodes.is_empty() {
            ui::print_info(&format!("Surge nodes provisioned: {}", report.surge_nodes.join(", ")));
        }
        ui::print_success(&format!("Cluster healthy after {}s", report.elapsed.as_secs()));
        ctx.latest = report.latest.take();
        ctx.monitor = Some(report);

        step(RunPhase::Validated);
        if request.skip_validation {
            ui::print_warning("Post-change validation skipped");
        } else {
            let validator = PostChangeValidator::new(
                Arc::clone(&self.deps.reader),
                Arc::clone(&self.deps.workloads),
                &self.config,
            );
            let report = validator.run(&request).await;
            report.print_summary();
            ctx.validation = Some(report);
        }
        ctx.advance(RunPhase::Validated);
        Ok(())
    }

    /// Run the executor. Once cancelled, the in-flight call is not dropped:
    /// the child processes already received the interrupt and get
    /// `interrupt_grace` to stop on their own before they are killed.
    async fn apply_with_grace(&self, executor: &ChangeExecutor, ctx: &RunContext) -> Applied {
        let apply = executor.apply(ctx, self.deps.confirm.as_ref());
        tokio::pin!(apply);
        tokio::select! {
            result = &mut apply => Applied::Finished(result),
            () = ctx.cancel.cancelled() => {
                let grace = self.config.interrupt_grace();
                warn!(grace_secs = grace.as_secs(), "Interrupted during execution, waiting for the in-flight change");
                ui::print_warning(&format!(
                    "Interrupted: waiting up to {}s for the in-flight change to stop",
                    grace.as_secs()
                ));
                Applied::Interrupted(tokio::time::timeout(grace, &mut apply).await.ok())
            }
        }
    }

    async fn preflight(&self, ctx: &mut RunContext) -> Result<(), RolloutError> {
        let Some(baseline) = ctx.baseline.as_ref() else {
            return Err(RolloutError::Validation("no baseline captured".into()));
        };
        if ctx.request().skip_preflight {
            ui::print_warning("Preflight checks skipped");
            if !baseline.is_healthy() {
                ui::print_warning(&format!(
                    "Baseline is unhealthy: {} node(s) not ready, {} failed pod(s)",
                    baseline.unhealthy_node_count(),
                    baseline.failed_pod_count()
                ));
            }
            return Ok(());
        }

        let mut validator =
            PreflightValidator::new(Arc::clone(&self.deps.reader), Arc::clone(&self.deps.control));
        if let Some(runner) = &self.deps.scanner {
            validator = validator.with_scanner(Arc::clone(runner));
        }
        let report = validator
            .run(ctx.request(), baseline, self.deps.confirm.as_ref())
            .await?;
        report.print_summary();
        let failed = report.has_failures().then(|| report.failure_summary());
        ctx.preflight = Some(report);
        match failed {
            Some(summary) => Err(RolloutError::Validation(summary)),
            None => Ok(()),
        }
    }

    fn completed(ctx: &RunContext) -> Ending {
        match &ctx.validation {
            Some(report) if report.has_failures() => Ending::new(
                RunOutcome::Failed,
                Some(RolloutError::Validation(report.failure_summary())),
            ),
            _ => Ending::new(RunOutcome::Success, None),
        }
    }

    async fn handle_failure(&self, ctx: &mut RunContext, err: RolloutError) -> Ending {
        error!(run_id = %ctx.run_id, phase = ?ctx.phase(), error = %err, "Run failed");
        ui::print_error(&err.to_string());

        match err {
            RolloutError::HealthCheck(_) | RolloutError::Executor { .. } if ctx.can_roll_back() => {
                self.roll_back(ctx, err).await
            }
            RolloutError::HealthCheck(_) | RolloutError::Executor { .. } => {
                ui::print_warning("Automatic rollback unavailable (backup or rollback disabled)");
                ctx.advance(RunPhase::Aborted);
                Ending::new(RunOutcome::Aborted, Some(err))
            }
            RolloutError::Cancelled => {
                if let Some(path) = ctx.backup_path() {
                    ui::print_warning(&format!("Interrupted; backup available at {}", path.display()));
                }
                if self.config.rollback_on_interrupt
                    && ctx.can_roll_back()
                    && ctx.phase() >= RunPhase::Executing
                {
                    self.roll_back(ctx, err).await
                } else {
                    ctx.advance(RunPhase::Aborted);
                    Ending::new(RunOutcome::Aborted, Some(err))
                }
            }
            RolloutError::Validation(_) => {
                ctx.advance(RunPhase::Aborted);
                Ending::new(RunOutcome::Failed, Some(err))
            }
            other => {
                ctx.advance(RunPhase::Aborted);
                Ending::new(RunOutcome::Aborted, Some(other))
            }
        }
    }

    async fn roll_back(&self, ctx: &mut RunContext, cause: RolloutError) -> Ending {
        let backup = ctx
            .backup_path()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        ui::print_section("Rolling Back");
        self.deps.notifier.notify(NotifyEvent::RollbackStarted {
            run_id: ctx.run_id.clone(),
            environment: ctx.request().environment.to_string(),
            reason: cause.to_string(),
            backup,
            timestamp: Utc::now(),
        });

        let controller = RollbackController::new(Arc::clone(&self.deps.infra), Arc::clone(&self.deps.workloads));
        match controller.rollback(ctx.backup.as_ref()).await {
            Ok(result) => {
                for item in &result.items {
                    ui::print_success(&format!("Restored {}", item.target));
                }
                ctx.advance(RunPhase::RolledBack);
                Ending {
                    outcome: RunOutcome::RolledBack,
                    error: Some(cause),
                    rollback: Some(result),
                    manual_recovery: false,
                }
            }
            Err(rollback_err) => {
                error!(error = %rollback_err, cause = %cause, "Rollback failed, manual recovery required");
                ui::print_error(&format!("{rollback_err}. Manual recovery required."));
                ctx.advance(RunPhase::Aborted);
                let (message, backup) = match rollback_err {
                    RolloutError::Rollback { message, backup } => (message, backup),
                    other => (other.to_string(), ctx.backup_path()),
                };
                Ending {
                    outcome: RunOutcome::Failed,
                    error: Some(RolloutError::Rollback {
                        message: format!("{message} (after: {cause})"),
                        backup,
                    }),
                    rollback: None,
                    manual_recovery: true,
                }
            }
        }
    }

    fn summarize(ctx: &RunContext, ending: Ending) -> RunResult {
        let request = ctx.request();
        let finished_at = Utc::now();
        let failure_signal = ending.error.as_ref().and_then(|e| match e {
            RolloutError::HealthCheck(signal) => Some(signal.clone()),
            RolloutError::Executor { message, .. } => {
                Some(FailureSignal::new(FailureKind::ExecutorError, 1, message.clone()))
            }
            RolloutError::Validation(message) => {
                Some(FailureSignal::new(FailureKind::ValidationError, 1, message.clone()))
            }
            _ => None,
        });
        let execution = ctx.execution.as_ref();
        #[allow(clippy::cast_precision_loss)]
        let duration_secs = (finished_at - ctx.started_at).num_milliseconds() as f64 / 1000.0;

        RunResult {
            run_id: ctx.run_id.clone(),
            environment: request.environment,
            component: request.component,
            dry_run: request.dry_run,
            phase: ctx.phase(),
            outcome: ending.outcome,
            failure_reason: ending.error.as_ref().map(ToString::to_string),
            error_kind: ending.error.as_ref().map(|e| e.kind().to_string()),
            failure_signal,
            backup: ctx.backup_path(),
            plan: execution.and_then(|e| e.plan.clone()),
            actions: execution.map(|e| e.actions.clone()).unwrap_or_default(),
            mutation_secs: execution
                .filter(|e| !e.dry_run)
                .map(|e| e.mutation_duration.as_secs_f64()),
            rollback: ending.rollback,
            manual_recovery_required: ending.manual_recovery,
            checks: ctx.check_totals(),
            started_at: ctx.started_at,
            finished_at,
            duration_secs,
        }
    }

    fn print_header(ctx: &RunContext) {
        let request = ctx.request();
        let mut subtitle = format!("{} / {} on {}", request.environment, request.component, ctx.cluster);
        if let Some(target) = request.target_version {
            subtitle.push_str(&format!(" -> {target}"));
        }
        if request.dry_run {
            subtitle.push_str(" (dry run)");
        }
        ui::print_banner("Rollout", &subtitle);
        ui::print_kv("Run", &ctx.run_id);
        ui::print_kv(
            "Mode",
            &format!("{} ({})", request.execution_mode, request.imperative_scope),
        );
        info!(
            run_id = %ctx.run_id,
            environment = %request.environment,
            component = %request.component,
            dry_run = request.dry_run,
            "Starting rollout"
        );
    }

    fn print_footer(result: &RunResult) {
        ui::print_section("Result");
        ui::print_kv("Outcome", &result.outcome.to_string());
        ui::print_kv("Phase", &format!("{:?}", result.phase));
        if let Some(backup) = &result.backup {
            ui::print_kv("Backup", &backup.display().to_string());
        }
        let line = format!("Finished in {:.0}s with exit code {}", result.duration_secs, result.exit_code());
        match result.outcome {
            RunOutcome::Success => ui::print_success(&line),
            RunOutcome::RolledBack | RunOutcome::Aborted => ui::print_warning(&line),
            RunOutcome::Failed => ui::print_error(&line),
        }
        if result.manual_recovery_required {
            ui::print_error("Rollback failed. Restore manually from the backup above.");
        }
    }
}

fn step(phase: RunPhase) {
    ui::print_progress_step(phase.step_number(), RunPhase::TOTAL_STEPS, phase.description());
}

fn finished_event(result: &RunResult) -> NotifyEvent {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let duration_secs = result.duration_secs.max(0.0) as u64;
    NotifyEvent::RunFinished {
        run_id: result.run_id.clone(),
        environment: result.environment.to_string(),
        component: result.component.to_string(),
        outcome: result.outcome.to_string(),
        success: result.outcome == RunOutcome::Success,
        manual_recovery: result.manual_recovery_required,
        duration_secs,
        detail: result.failure_reason.clone(),
        timestamp: result.finished_at,
    }
}
