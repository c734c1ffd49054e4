//! Background task handles.
//!
//! A [`Task`] owns a spawned future together with its cancellation token,
//! so callers can wait for completion or stop it and block until it has
//! actually finished. [`Task::timer`] repeats a fallible closure on an
//! interval, logging and swallowing per-tick errors, which is the shape
//! used by the periodic backup schedule.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::BoxError;

/// Handle to a spawned background task.
///
/// Dropping the handle detaches the task; use [`Task::stop`] for a
/// synchronized shutdown.
pub struct Task {
    handle: JoinHandle<Result<(), BoxError>>,
    cancel: CancellationToken,
}

impl Task {
    /// Spawns `runnable` with a child token of `ctx`.
    ///
    /// The task is cancelled when either the parent token or the handle's
    /// own token is cancelled.
    pub fn spawn<F, Fut>(ctx: &CancellationToken, runnable: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        let child = ctx.child_token();
        let handle = tokio::spawn(runnable(child.clone()));
        Self {
            handle,
            cancel: child,
        }
    }

    /// Repeats `runnable` every `interval` until cancelled.
    ///
    /// The first tick fires after one full interval. Errors returned by a
    /// tick are logged at warn level; the schedule continues.
    pub fn timer<F, Fut>(ctx: &CancellationToken, interval: Duration, runnable: F) -> Self
    where
        F: Fn(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        Self::spawn(ctx, move |token| async move {
            loop {
                tokio::select! {
                    biased;

                    _ = token.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(interval) => {}
                }
                if let Err(error) = runnable(token.clone()).await {
                    warn!(error = %error, "scheduled task attempt failed");
                }
            }
        })
    }

    /// Waits for the task to finish and returns its result.
    pub async fn wait(self) -> Result<(), BoxError> {
        match self.handle.await {
            Ok(result) => result,
            Err(join) => Err(Box::new(join)),
        }
    }

    /// Cancels the task and waits until it has finished.
    pub async fn stop(self) -> Result<(), BoxError> {
        self.cancel.cancel();
        self.wait().await
    }
}
