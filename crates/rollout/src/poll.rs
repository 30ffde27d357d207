//! Cancellable polling scheduler.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Outcome of one poll step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStep<T> {
    Ready(T),
    Pending,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PollError<E> {
    #[error("timed out after {}s", elapsed.as_secs())]
    Timeout { elapsed: Duration },

    #[error("cancelled")]
    Cancelled,

    /// The step itself returned an error; polling stops immediately.
    #[error("{0}")]
    Failed(E),
}

/// Run `step` every `interval` until it is ready, fails, the timeout elapses,
/// or `cancel` fires.
///
/// The first step runs immediately. The wait between steps is cut short by
/// cancellation and never overshoots the deadline.
///
/// # Errors
///
/// Returns [`PollError::Timeout`] once `timeout` has elapsed without a ready
/// step, [`PollError::Cancelled`] when the token fires, or
/// [`PollError::Failed`] with the step's own error.
pub async fn poll_until<T, E, F, Fut>(
    interval: Duration,
    timeout: Duration,
    cancel: &CancellationToken,
    mut step: F,
) -> Result<T, PollError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<PollStep<T>, E>>,
{
    let started = Instant::now();
    let deadline = started + timeout;

    loop {
        if cancel.is_cancelled() {
            return Err(PollError::Cancelled);
        }

        match step().await {
            Ok(PollStep::Ready(value)) => return Ok(value),
            Ok(PollStep::Pending) => {}
            Err(e) => return Err(PollError::Failed(e)),
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(PollError::Timeout {
                elapsed: now - started,
            });
        }

        let wait = interval.min(deadline - now);
        tokio::select! {
            () = cancel.cancelled() => return Err(PollError::Cancelled),
            () = tokio::time::sleep(wait) => {}
        }
    }
}
