use crate::PipelineOutcome;
use core::{any::Any, future::Future, panic::AssertUnwindSafe};
use futures::FutureExt;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// The message carried by a panic payload.
pub(crate) fn panic_reason(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_owned())
}

/// Runs one detached job to completion.
///
/// The job first waits for a pool permit; if the pool is cancelled before a
/// permit is granted the job never starts. A panic that escapes the job is caught
/// and logged so that it cannot take down other jobs or leak the permit.
pub(crate) async fn run_job<F>(
    job_id: usize,
    label: String,
    permits: Arc<Semaphore>,
    shutdown: CancellationToken,
    job: F,
) where
    F: Future<Output = PipelineOutcome> + Send + 'static,
{
    let _permit = tokio::select! {
        permit = permits.acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => {
                tracing::error!(job_id, %label, "Worker pool semaphore closed");
                return;
            }
        },
        () = shutdown.cancelled() => {
            tracing::debug!(job_id, %label, "Job dropped before it started");
            return;
        }
    };

    tracing::trace!(job_id, %label, "Job started");
    match AssertUnwindSafe(job).catch_unwind().await {
        Ok(outcome) => {
            tracing::info!(job_id, %label, %outcome, "Job completed");
        }
        Err(panic) => {
            let reason = panic_reason(&*panic);
            tracing::error!(job_id, %label, "Job panicked: {reason}");
        }
    }
}
