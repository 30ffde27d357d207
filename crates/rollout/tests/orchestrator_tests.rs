//! End-to-end runs of the orchestrator against an in-memory platform.

mod common;

use std::sync::Arc;
use std::time::Duration;

use rollout::backup::BackupRecord;
use rollout::config::{ChangeRequest, Component};
use rollout::error::FailureKind;
use rollout::lock::{InMemoryLock, RunLock};
use rollout::state::{RunPhase, EXIT_MANUAL_RECOVERY};
use rollout::{RolloutOrchestrator, RunOutcome};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use common::{seed_manifests, test_config, v, ClusterState, FakePlatform, DEV};

fn upgrade_fixture() -> ClusterState {
    let mut state = ClusterState::at("1.28.3");
    state.available = vec![v("1.28.5"), v("1.29.0"), v("1.29.1")];
    state
}

fn upgrade_request() -> ChangeRequest {
    ChangeRequest::new(DEV, Component::Infrastructure).with_target_version(v("1.29.0"))
}

#[tokio::test(start_paused = true)]
async fn test_minor_upgrade_end_to_end() {
    let tmp = tempfile::tempdir().unwrap();
    let platform = FakePlatform::new(upgrade_fixture());
    let mut config = test_config(tmp.path());
    config.settle_secs = 60;
    let orchestrator = RolloutOrchestrator::new(config, platform.unlocked()).with_spinner(false);

    let started = Instant::now();
    let result = orchestrator.run(upgrade_request(), CancellationToken::new()).await;

    assert!(started.elapsed() >= Duration::from_secs(60), "validated before the settle time");

    assert_eq!(result.outcome, RunOutcome::Success, "{:?}", result.failure_reason);
    assert_eq!(result.phase, RunPhase::Validated);
    assert_eq!(result.exit_code(), 0);
    assert_eq!(result.checks.failed, 0);
    assert!(result.rollback.is_none());
    assert_eq!(result.plan.as_ref().map(|p| p.change), Some(1));

    let state = platform.state();
    assert_eq!(state.control_plane, v("1.29.0"));
    assert_eq!(state.applies, 1);
    assert!(state.state_pushes.is_empty());
    drop(state);

    let backup = result.backup.expect("backup taken");
    let record = BackupRecord::load(&backup).unwrap();
    assert!(record.infra_state.is_some());
    assert!(record.verify().is_ok());

    let runs = std::fs::read_dir(tmp.path().join("backups").join("runs")).unwrap().count();
    assert_eq!(runs, 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_pods_trigger_exactly_one_rollback() {
    let tmp = tempfile::tempdir().unwrap();
    let mut fixture = upgrade_fixture();
    fixture.failed_pods_after_apply = 2;
    let platform = FakePlatform::new(fixture);
    let orchestrator = RolloutOrchestrator::new(test_config(tmp.path()), platform.unlocked()).with_spinner(false);

    let result = orchestrator.run(upgrade_request(), CancellationToken::new()).await;

    assert_eq!(result.outcome, RunOutcome::RolledBack);
    assert_eq!(result.phase, RunPhase::RolledBack);
    assert_eq!(result.exit_code(), 1);
    assert!(!result.manual_recovery_required);
    let signal = result.failure_signal.expect("failure signal");
    assert_eq!(signal.kind, FailureKind::FailedPods);
    assert_eq!(signal.count, 2);

    let rollback = result.rollback.expect("rollback result");
    assert!(rollback.failed_items().is_empty());

    let state = platform.state();
    assert_eq!(state.state_pushes.len(), 1);
    assert_eq!(state.state_pushes[0], state.infra_state);
}

#[tokio::test(start_paused = true)]
async fn test_health_failure_without_backup_aborts() {
    let tmp = tempfile::tempdir().unwrap();
    let mut fixture = upgrade_fixture();
    fixture.failed_pods_after_apply = 1;
    let platform = FakePlatform::new(fixture);
    let orchestrator = RolloutOrchestrator::new(test_config(tmp.path()), platform.unlocked()).with_spinner(false);

    let mut request = upgrade_request();
    request.backup_enabled = false;
    let result = orchestrator.run(request, CancellationToken::new()).await;

    assert_eq!(result.outcome, RunOutcome::Aborted);
    assert_eq!(result.phase, RunPhase::Aborted);
    assert_eq!(result.exit_code(), 2);
    assert!(result.backup.is_none());
    assert!(result.rollback.is_none());
    assert_eq!(result.error_kind.as_deref(), Some("health_check_failure"));
    assert!(platform.state().state_pushes.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_dry_run_never_mutates() {
    let tmp = tempfile::tempdir().unwrap();
    let platform = FakePlatform::new(upgrade_fixture());
    let orchestrator = RolloutOrchestrator::new(test_config(tmp.path()), platform.unlocked()).with_spinner(false);

    let mut request = upgrade_request();
    request.dry_run = true;
    let result = orchestrator.run(request, CancellationToken::new()).await;

    assert_eq!(result.outcome, RunOutcome::Success);
    assert!(result.dry_run);
    assert!(result.backup.is_none());
    assert!(result.mutation_secs.is_none());
    assert_eq!(result.actions.len(), 1);

    let state = platform.state();
    assert_eq!(state.applies, 0);
    assert_eq!(state.control_plane, v("1.28.3"));
    assert!(state.state_pushes.is_empty());
    assert!(state.manifest_applies.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_held_lock_aborts_before_anything_runs() {
    let tmp = tempfile::tempdir().unwrap();
    let platform = FakePlatform::new(upgrade_fixture());
    let lock = Arc::new(InMemoryLock::new());
    let _held = lock.acquire("another-run").await.unwrap();
    let orchestrator =
        RolloutOrchestrator::new(test_config(tmp.path()), platform.collaborators(lock.clone())).with_spinner(false);

    let result = orchestrator.run(upgrade_request(), CancellationToken::new()).await;

    assert_eq!(result.outcome, RunOutcome::Aborted);
    assert_eq!(result.error_kind.as_deref(), Some("lock_error"));
    assert_eq!(platform.state().applies, 0);
    assert_eq!(lock.holder().as_deref(), Some("another-run"));
}

#[tokio::test(start_paused = true)]
async fn test_minor_skip_rejected_by_preflight() {
    let tmp = tempfile::tempdir().unwrap();
    let platform = FakePlatform::new(upgrade_fixture());
    let orchestrator = RolloutOrchestrator::new(test_config(tmp.path()), platform.unlocked()).with_spinner(false);

    let request = ChangeRequest::new(DEV, Component::Infrastructure).with_target_version(v("1.30.0"));
    let result = orchestrator.run(request, CancellationToken::new()).await;

    assert_eq!(result.outcome, RunOutcome::Failed);
    assert_eq!(result.error_kind.as_deref(), Some("validation_failure"));
    assert!(result.backup.is_none());
    assert_eq!(platform.state().applies, 0);
}

#[tokio::test(start_paused = true)]
async fn test_application_rollout_applies_manifests() {
    let tmp = tempfile::tempdir().unwrap();
    seed_manifests(tmp.path());
    let mut fixture = ClusterState::at("1.29.0");
    fixture.manifest_diff = "-replicas: 2\n+replicas: 3\n".into();
    let platform = FakePlatform::new(fixture);
    let orchestrator = RolloutOrchestrator::new(test_config(tmp.path()), platform.unlocked()).with_spinner(false);

    let request = ChangeRequest::new(DEV, Component::Applications);
    let result = orchestrator.run(request, CancellationToken::new()).await;

    assert_eq!(result.outcome, RunOutcome::Success, "{:?}", result.failure_reason);
    let backup = BackupRecord::load(&result.backup.expect("backup taken")).unwrap();
    assert!(!backup.manifests.is_empty());

    let state = platform.state();
    assert_eq!(state.manifest_applies, vec![tmp.path().join("manifests").join("applications")]);
    assert_eq!(state.applies, 0);
}

#[tokio::test(start_paused = true)]
async fn test_failed_rollback_requires_manual_recovery() {
    let tmp = tempfile::tempdir().unwrap();
    let mut fixture = upgrade_fixture();
    fixture.failed_pods_after_apply = 3;
    fixture.reject_state_push = true;
    let platform = FakePlatform::new(fixture);
    let orchestrator = RolloutOrchestrator::new(test_config(tmp.path()), platform.unlocked()).with_spinner(false);

    let result = orchestrator.run(upgrade_request(), CancellationToken::new()).await;

    assert_eq!(result.outcome, RunOutcome::Failed);
    assert_eq!(result.phase, RunPhase::Aborted);
    assert!(result.manual_recovery_required);
    assert_eq!(result.exit_code(), EXIT_MANUAL_RECOVERY);
    assert_eq!(result.error_kind.as_deref(), Some("rollback_error"));
    let reason = result.failure_reason.unwrap();
    assert!(reason.contains("infrastructure state"), "{reason}");
    assert!(result.backup.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_before_start_aborts_without_rollback() {
    let tmp = tempfile::tempdir().unwrap();
    let platform = FakePlatform::new(upgrade_fixture());
    let orchestrator = RolloutOrchestrator::new(test_config(tmp.path()), platform.unlocked()).with_spinner(false);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let result = orchestrator.run(upgrade_request(), cancel).await;

    assert_eq!(result.outcome, RunOutcome::Aborted);
    assert_eq!(result.error_kind.as_deref(), Some("cancelled"));
    assert!(result.rollback.is_none());
    let state = platform.state();
    assert_eq!(state.applies, 0);
    assert!(state.state_pushes.is_empty());
}

/// Cancel `token` after `after` of (paused) runtime.
fn cancel_after(token: &CancellationToken, after: Duration) {
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(after).await;
        trigger.cancel();
    });
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_apply_waits_for_in_flight_change() {
    let tmp = tempfile::tempdir().unwrap();
    let mut fixture = upgrade_fixture();
    fixture.apply_delay = Duration::from_secs(30);
    let platform = FakePlatform::new(fixture);
    let orchestrator = RolloutOrchestrator::new(test_config(tmp.path()), platform.unlocked()).with_spinner(false);

    let cancel = CancellationToken::new();
    cancel_after(&cancel, Duration::from_secs(5));
    let result = orchestrator.run(upgrade_request(), cancel).await;

    assert_eq!(result.outcome, RunOutcome::Aborted);
    assert_eq!(result.phase, RunPhase::Aborted);
    assert_eq!(result.exit_code(), 2);
    assert_eq!(result.error_kind.as_deref(), Some("cancelled"));
    assert!(result.backup.is_some());
    assert!(result.rollback.is_none());
    assert!(result.mutation_secs.is_some());

    let state = platform.state();
    assert_eq!(state.applies, 1);
    assert!(state.state_pushes.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_apply_gives_up_after_grace() {
    let tmp = tempfile::tempdir().unwrap();
    let mut fixture = upgrade_fixture();
    fixture.apply_delay = Duration::from_secs(600);
    let platform = FakePlatform::new(fixture);
    let mut config = test_config(tmp.path());
    config.interrupt_grace_secs = 10;
    let orchestrator = RolloutOrchestrator::new(config, platform.unlocked()).with_spinner(false);

    let cancel = CancellationToken::new();
    cancel_after(&cancel, Duration::from_secs(5));
    let started = Instant::now();
    let result = orchestrator.run(upgrade_request(), cancel).await;

    assert!(started.elapsed() < Duration::from_secs(600));
    assert_eq!(result.outcome, RunOutcome::Aborted);
    assert_eq!(result.error_kind.as_deref(), Some("cancelled"));
    assert!(result.mutation_secs.is_none());
    assert_eq!(platform.state().applies, 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_while_monitoring_aborts_without_rollback() {
    let tmp = tempfile::tempdir().unwrap();
    let platform = FakePlatform::new(upgrade_fixture());
    let mut config = test_config(tmp.path());
    config.settle_secs = 60;
    let orchestrator = RolloutOrchestrator::new(config, platform.unlocked()).with_spinner(false);

    let cancel = CancellationToken::new();
    cancel_after(&cancel, Duration::from_secs(20));
    let result = orchestrator.run(upgrade_request(), cancel).await;

    assert_eq!(result.outcome, RunOutcome::Aborted);
    assert_eq!(result.error_kind.as_deref(), Some("cancelled"));
    assert!(result.backup.is_some());
    assert!(result.rollback.is_none());

    let state = platform.state();
    assert_eq!(state.applies, 1);
    assert!(state.state_pushes.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_while_monitoring_rolls_back_when_configured() {
    let tmp = tempfile::tempdir().unwrap();
    let platform = FakePlatform::new(upgrade_fixture());
    let mut config = test_config(tmp.path());
    config.settle_secs = 60;
    config.rollback_on_interrupt = true;
    let orchestrator = RolloutOrchestrator::new(config, platform.unlocked()).with_spinner(false);

    let cancel = CancellationToken::new();
    cancel_after(&cancel, Duration::from_secs(20));
    let result = orchestrator.run(upgrade_request(), cancel).await;

    assert_eq!(result.outcome, RunOutcome::RolledBack);
    assert_eq!(result.phase, RunPhase::RolledBack);
    assert_eq!(result.error_kind.as_deref(), Some("cancelled"));
    assert!(result.rollback.is_some());

    let state = platform.state();
    assert_eq!(state.state_pushes.len(), 1);
    assert_eq!(state.state_pushes[0], state.infra_state);
}

#[tokio::test(start_paused = true)]
async fn test_unhealthy_baseline_without_operator_fails_preflight() {
    let tmp = tempfile::tempdir().unwrap();
    seed_manifests(tmp.path());
    let mut fixture = ClusterState::at("1.29.0");
    fixture.failed_pods = 1;
    let platform = FakePlatform::new(fixture);
    let orchestrator = RolloutOrchestrator::new(test_config(tmp.path()), platform.unlocked()).with_spinner(false);

    let result = orchestrator.run(ChangeRequest::new(DEV, Component::Applications), CancellationToken::new()).await;

    assert_eq!(result.outcome, RunOutcome::Failed);
    assert_eq!(result.phase, RunPhase::Aborted);
    assert_eq!(result.exit_code(), 1);
    assert_eq!(result.error_kind.as_deref(), Some("validation_failure"));
    assert!(result.checks.failed >= 1);
    assert!(result.backup.is_none());
    assert!(platform.state().manifest_applies.is_empty());
}
