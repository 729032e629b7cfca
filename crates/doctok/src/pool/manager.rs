//! Bounded pool of detached pipeline workers.
//!
//! Every bulk request becomes one job on the [`WorkerPool`]. Jobs run on the
//! tokio runtime, at most `num_workers` at a time; the rest wait for a permit.
//! Shutdown is phased: refuse new jobs, let running ones drain up to the
//! configured timeout, then cancel whatever is left and wait for it to
//! acknowledge.

use crate::{Error, PipelineOutcome, Result, pool::worker::run_job};
use core::{future::Future, time::Duration};
use portable_atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::{
    sync::Semaphore,
    time::{sleep, timeout},
};
use tokio_util::{
    sync::{CancellationToken, WaitForCancellationFuture},
    task::TaskTracker,
};

/// How long the pool waits for cancelled jobs to acknowledge.
const CANCEL_GRACE: Duration = Duration::from_secs(3);

pub struct WorkerPool {
    tracker: TaskTracker,
    permits: Arc<Semaphore>,
    shutdown_token: CancellationToken,
    shutdown_timeout: Duration,
    accepting: AtomicBool,
    next_job: AtomicUsize,
}

impl WorkerPool {
    pub fn new(num_workers: usize, shutdown_timeout: Duration) -> Self {
        Self {
            tracker: TaskTracker::new(),
            permits: Arc::new(Semaphore::new(num_workers.max(1))),
            shutdown_token: CancellationToken::new(),
            shutdown_timeout,
            accepting: AtomicBool::new(true),
            next_job: AtomicUsize::new(0),
        }
    }

    /// Spawns a detached job.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ServiceShutdown`] once [`Self::shutdown`] has begun.
    pub fn spawn<F>(&self, label: impl Into<String>, job: F) -> Result<()>
    where
        F: Future<Output = PipelineOutcome> + Send + 'static,
    {
        if !self.is_accepting() {
            return Err(Error::ServiceShutdown);
        }
        let job_id = self.next_job.fetch_add(1, Ordering::Relaxed);
        let label = label.into();
        tracing::debug!(job_id, %label, "Spawning job");
        self.tracker.spawn(run_job(
            job_id,
            label,
            Arc::clone(&self.permits),
            self.shutdown_token.clone(),
            job,
        ));
        Ok(())
    }

    /// Jobs that are queued or running.
    pub fn active(&self) -> usize {
        self.tracker.len()
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire) && !self.shutdown_token.is_cancelled()
    }

    /// Whether running jobs have been asked to stop.
    pub fn is_cancelled(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    /// Resolves once running jobs have been asked to stop.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.shutdown_token.cancelled()
    }

    /// Waits until no job is queued or running.
    ///
    /// Jobs spawned by other jobs (such as the statistics follow-up of a
    /// finished batch) are included, since they are spawned before their
    /// parent completes.
    pub async fn wait_idle(&self) {
        while !self.tracker.is_empty() {
            sleep(Duration::from_millis(5)).await;
        }
    }

    /// Gracefully shuts the pool down.
    pub async fn shutdown(&self) -> Result<()> {
        // === Phase 0: Stop accepting new jobs ===
        tracing::info!("Refusing new jobs");
        self.accepting.store(false, Ordering::Release);
        self.tracker.close();

        // === Phase 1: Let running jobs drain ===
        tracing::info!("Draining in-flight jobs ({} active)", self.active());
        match timeout(self.shutdown_timeout, self.tracker.wait()).await {
            Ok(()) => {
                tracing::debug!("All jobs drained");
                return Ok(());
            }
            Err(_) => {
                tracing::warn!(
                    "Graceful drain timed out ({} jobs still active)",
                    self.active()
                );
            }
        }

        // === Phase 2: Cancel remaining work ===
        tracing::debug!("Cancelling remaining jobs via shutdown token");
        self.shutdown_token.cancel();

        // === Phase 3: Wait for acknowledgement ===
        match timeout(CANCEL_GRACE, self.tracker.wait()).await {
            Ok(()) => {
                tracing::info!("All jobs stopped");
                Ok(())
            }
            Err(_) => {
                tracing::error!("{} jobs did not stop in time", self.active());
                Err(Error::ServiceShutdown)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    #[tokio::test(start_paused = true)]
    async fn concurrency_is_bounded_by_permits() {
        let pool = Arc::new(WorkerPool::new(2, Duration::from_secs(1)));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for i in 0..6 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            pool.spawn(format!("job-{i}"), async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                sleep(Duration::from_millis(50)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                PipelineOutcome::Finished
            })
            .unwrap();
        }

        pool.wait_idle().await;
        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(pool.active(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_refuses_new_jobs_and_cancels_stragglers() {
        let pool = WorkerPool::new(1, Duration::from_millis(100));
        let (tx, rx) = oneshot::channel();
        let token = pool.shutdown_token.clone();

        pool.spawn("stubborn", async move {
            token.cancelled().await;
            let _ = tx.send(());
            PipelineOutcome::Interrupted
        })
        .unwrap();

        pool.shutdown().await.unwrap();
        assert!(rx.await.is_ok());
        assert!(pool.is_cancelled());
        assert!(matches!(
            pool.spawn("late", async { PipelineOutcome::Finished }),
            Err(Error::ServiceShutdown)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_without_work_returns_immediately() {
        let pool = WorkerPool::new(4, Duration::from_secs(30));
        pool.shutdown().await.unwrap();
        assert!(!pool.is_cancelled());
        assert!(!pool.is_accepting());
    }
}
