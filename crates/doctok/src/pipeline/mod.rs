//! Background pipelines and the fast path.
//!
//! - [`batch`] produces blobs, for a whole project or one attribute
//! - [`statistics`] derives token counts from blobs
//! - [`single`] tokenizes one record inline
//!
//! All of them share a [`Context`] and follow the same failure discipline:
//! an error is caught at the outermost level of the worker, the session is
//! rolled back, and the task is marked `FAILED` unless the project has been
//! deleted in the meantime.

pub(crate) mod batch;
pub(crate) mod single;
pub(crate) mod statistics;

use crate::{
    Attribute, BlobSync, Database, Error, NotificationKind, PriorityRegistry, ProgressBridge,
    Project, ProjectId, Record, Result, Session, TaskPatch, TaskRef, TaskState, TokenSequence,
    Tokenizer, TokenizerProvider, TokenizedRecord, WorkerPool, encode_blob,
    task::{FailureRecord, TaskMachine},
};
use crate::pool::panic_reason;
use core::{fmt, future::Future, panic::AssertUnwindSafe, str::FromStr, time::Duration};
use futures::FutureExt;
use std::sync::Arc;

/// Everything a pipeline needs, shared by all workers.
pub(crate) struct Context {
    pub(crate) database: Arc<dyn Database>,
    pub(crate) tokenizers: TokenizerProvider,
    pub(crate) bridge: ProgressBridge,
    pub(crate) registry: Arc<dyn PriorityRegistry>,
    pub(crate) blob_sync: Arc<dyn BlobSync>,
    pub(crate) pool: WorkerPool,
    pub(crate) settings: PipelineSettings,
}

/// How the batch pipeline advances progress after a chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProgressStrategy {
    /// `chunk_size / workload` per committed chunk.
    #[default]
    FixedIncrement,
    /// `1 - remaining / workload`, recounted after every chunk.
    Remaining,
}

impl ProgressStrategy {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::FixedIncrement => "fixed",
            Self::Remaining => "remaining",
        }
    }
}

impl fmt::Display for ProgressStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProgressStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "fixed" | "fixed-increment" => Ok(Self::FixedIncrement),
            "remaining" => Ok(Self::Remaining),
            other => Err(Error::InvalidRequest {
                reason: format!("unknown progress strategy '{other}'"),
            }),
        }
    }
}

/// Tuning knobs of the pipelines.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    /// Records per batch chunk.
    pub chunk_size: usize,
    /// Push non-text data to blob storage every n-th chunk.
    pub sync_every: usize,
    /// Refresh the batch session every n-th chunk.
    pub refresh_every: usize,
    /// Records per statistics page.
    pub statistics_page_size: usize,
    /// Refresh the statistics session every n-th page.
    pub statistics_refresh_every: usize,
    /// Visibility checks before the statistics pass gives up on blobs.
    pub blob_wait_retries: u32,
    pub blob_wait_interval: Duration,
    pub batch_progress: ProgressStrategy,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            chunk_size: 500,
            sync_every: 10,
            refresh_every: 10,
            statistics_page_size: 100,
            statistics_refresh_every: 20,
            blob_wait_retries: 10,
            blob_wait_interval: Duration::from_secs(1),
            batch_progress: ProgressStrategy::FixedIncrement,
        }
    }
}

/// How a detached worker ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineOutcome {
    Finished,
    /// The task was marked `FAILED` by the worker.
    Failed,
    /// The project disappeared; the worker stopped without writing.
    Abandoned,
    /// Someone else marked the task `FAILED`; the worker stopped.
    Cancelled,
    /// Service shutdown; the task stays `IN_PROGRESS` and its committed
    /// chunks are kept.
    Interrupted,
}

impl PipelineOutcome {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Finished => "finished",
            Self::Failed => "failed",
            Self::Abandoned => "abandoned",
            Self::Cancelled => "cancelled",
            Self::Interrupted => "interrupted",
        }
    }
}

impl fmt::Display for PipelineOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a statistics request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatisticsStart {
    /// A batch task of the project is still active; its completion starts
    /// the statistics pass instead.
    Deferred,
    /// Nothing was missing. The user got a success notification.
    AlreadyComplete,
    Started(TaskRef),
}

/// A record's blob plus the token count per covered attribute.
pub(crate) struct TokenizedOutput {
    pub(crate) blob: TokenizedRecord,
    pub(crate) counts: Vec<(crate::AttributeId, u64)>,
}

/// Tokenizes every text attribute present in `record`, in the order of
/// `text_attributes`.
pub(crate) fn tokenize_record(
    tokenizer: &dyn Tokenizer,
    record: &Record,
    text_attributes: &[Attribute],
) -> TokenizedOutput {
    let covered: Vec<&Attribute> = text_attributes
        .iter()
        .filter(|a| record.data.contains_key(&a.name))
        .collect();
    let sequences: Vec<TokenSequence> = covered
        .iter()
        .map(|a| tokenizer.tokenize(&record.text_of(&a.name)))
        .collect();
    let counts = covered
        .iter()
        .zip(&sequences)
        .map(|(a, s)| (a.id, s.len() as u64))
        .collect();
    let columns = covered.iter().map(|a| a.name.clone()).collect();
    TokenizedOutput {
        blob: TokenizedRecord::new(record.project_id, record.id, encode_blob(&sequences), columns),
        counts,
    }
}

/// The project, if it exists and is not being deleted.
pub(crate) async fn live_project(
    session: &mut dyn Session,
    project_id: ProjectId,
) -> Result<Option<Project>> {
    Ok(session
        .project(project_id)
        .await?
        .filter(Project::is_live))
}

/// Exports the non-text data of every tokenized record and uploads it.
pub(crate) async fn sync_non_text(
    ctx: &Context,
    session: &mut dyn Session,
    project: &Project,
    non_text: &[Attribute],
) -> Result<()> {
    let columns: Vec<String> = non_text.iter().map(|a| a.name.clone()).collect();
    let rows = session.export_tokenizer_data(project.id, &columns).await?;
    let payload = serde_json::to_vec(&rows).map_err(|e| Error::BlobSync {
        reason: format!("cannot serialize export: {e}"),
    })?;
    ctx.blob_sync
        .upload_tokenizer_data(project.organization_id, project.id, payload.into())
        .await
}

/// Releases a session, logging instead of failing.
pub(crate) async fn release(mut session: Box<dyn Session>) {
    if let Err(e) = session.release().await {
        tracing::warn!("Failed to release session: {e}");
    }
}

/// Rounds to `decimals` places.
pub(crate) fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10_f64.powi(decimals);
    (value * factor).round() / factor
}

/// `1 - remaining / initial`, rounded to four decimals.
pub(crate) fn remaining_progress(remaining: u64, initial: u64) -> f64 {
    if initial == 0 {
        return 1.0;
    }
    round_to(1.0 - remaining as f64 / initial as f64, 4)
}

/// What the user is told when a pipeline fails.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FailureNotice {
    pub(crate) message: &'static str,
    pub(crate) kind: NotificationKind,
}

/// Spawns a worker for a freshly created task.
///
/// If the pool refuses the job the task row is moved to `FAILED` so that it
/// cannot block later statistics requests. A panic inside the job is recorded
/// on the task like any other failure.
pub(crate) async fn spawn_task<F>(
    ctx: &Arc<Context>,
    label: String,
    task: TaskRef,
    notice: FailureNotice,
    job: F,
) -> Result<TaskRef>
where
    F: Future<Output = PipelineOutcome> + Send + 'static,
{
    let guarded = {
        let ctx = Arc::clone(ctx);
        async move {
            match AssertUnwindSafe(job).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(panic) => {
                    let err = Error::Worker {
                        reason: format!("worker panicked: {}", panic_reason(&*panic)),
                    };
                    fail_after_panic(&ctx, task, &err, notice).await
                }
            }
        }
    };
    match ctx.pool.spawn(label, guarded) {
        Ok(()) => Ok(task),
        Err(err) => {
            tracing::warn!(task_id = %task.task_id, "Worker refused, failing task: {err}");
            let mut session = ctx.database.session().await?;
            let written = async {
                session
                    .update_task(task.project_id, task.task_id, TaskPatch::state(TaskState::Failed))
                    .await?;
                session.commit().await
            }
            .await;
            release(session).await;
            written?;
            Err(err)
        }
    }
}

/// The panicked job's session is gone; the failure goes through a fresh one.
async fn fail_after_panic(
    ctx: &Context,
    task: TaskRef,
    err: &Error,
    notice: FailureNotice,
) -> PipelineOutcome {
    let mut session = match ctx.database.session().await {
        Ok(session) => session,
        Err(e) => {
            tracing::error!(task_id = %task.task_id, "{err}; cannot open session: {e}");
            return PipelineOutcome::Failed;
        }
    };
    let outcome = record_failure(ctx, session.as_mut(), task, err, notice).await;
    release(session).await;
    outcome
}

/// Rolls back and records `err` on the task, unless the project is gone.
pub(crate) async fn record_failure(
    ctx: &Context,
    session: &mut dyn Session,
    task: TaskRef,
    err: &Error,
    notice: FailureNotice,
) -> PipelineOutcome {
    if let Err(e) = session.rollback().await {
        tracing::warn!(task_id = %task.task_id, "Rollback failed: {e}");
    }
    match live_project(session, task.project_id).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            tracing::debug!(task_id = %task.task_id, "Project deleted while running: {err}");
            return PipelineOutcome::Abandoned;
        }
        Err(e) => {
            tracing::error!(task_id = %task.task_id, "Task failed ({err}) and project lookup failed: {e}");
            return PipelineOutcome::Failed;
        }
    }

    tracing::error!(
        project_id = %task.project_id,
        task_id = %task.task_id,
        data_integrity = err.is_data_integrity(),
        "Task failed: {err}"
    );
    let recorded = match TaskMachine::load(session, task.project_id, task.task_id).await {
        Ok(mut machine) => machine.fail(session, &ctx.bridge, notice.message, notice.kind).await,
        Err(e) => Err(e),
    };
    match recorded {
        Ok(FailureRecord::Failed) => PipelineOutcome::Failed,
        Ok(FailureRecord::Abandoned) => PipelineOutcome::Abandoned,
        Err(e) => {
            tracing::error!(task_id = %task.task_id, "Could not record failure: {e}");
            PipelineOutcome::Failed
        }
    }
}

/// Runs a blocking closure on the blocking pool.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Worker {
            reason: e.to_string(),
        })
}
