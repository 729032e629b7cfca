//! Blob production for a whole project or a single attribute.
//!
//! The worker pulls records in chunks, tokenizes them on the blocking pool,
//! and commits each chunk on its own, so a crash loses at most one chunk and
//! the next run resumes with whatever is still missing. A final dedup sweep
//! removes the duplicates that races with the fast path can leave behind.

use super::{
    Context, FailureNotice, PipelineOutcome, ProgressStrategy, blocking, live_project, record_failure, release,
    remaining_progress, round_to, statistics, sync_non_text, tokenize_record,
};
use crate::{
    Attribute, AttributeId, AttributeState, Channel, Error, NotificationKind, Result, Session,
    TaskRef, TaskState, Tokenizer, UserId, append_to_blob, task::TOKENIZATION_FAILED_MESSAGE,
    task::TaskMachine,
};
use std::sync::Arc;

pub(crate) const FAILURE: FailureNotice = FailureNotice {
    message: TOKENIZATION_FAILED_MESSAGE,
    kind: NotificationKind::TokenCreationDone,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum BatchScope {
    /// Every record without a blob.
    Project { only_uploaded: bool },
    /// Append one attribute to every blob that lacks it.
    Attribute { attribute_id: AttributeId },
}

#[derive(Debug, Clone)]
pub(crate) struct BatchJob {
    pub(crate) task: TaskRef,
    pub(crate) user_id: UserId,
    pub(crate) scope: BatchScope,
    pub(crate) workload: u64,
    pub(crate) include_statistics: bool,
}

enum Chunk {
    Committed,
    Exhausted,
    ProjectGone,
}

pub(crate) async fn run(ctx: Arc<Context>, job: BatchJob) -> PipelineOutcome {
    let mut session = match ctx.database.session().await {
        Ok(session) => session,
        Err(e) => {
            tracing::error!(task_id = %job.task.task_id, "Cannot open session: {e}");
            return PipelineOutcome::Failed;
        }
    };

    let outcome = match execute(&ctx, session.as_mut(), &job).await {
        Ok(outcome) => outcome,
        Err(err) => {
            record_failure(
                &ctx,
                session.as_mut(),
                job.task,
                &err,
                FAILURE,
            )
            .await
        }
    };
    release(session).await;

    if outcome == PipelineOutcome::Finished && job.include_statistics {
        let (only_uploaded, attribute_id) = match job.scope {
            BatchScope::Project { only_uploaded } => (only_uploaded, None),
            BatchScope::Attribute { attribute_id } => (false, Some(attribute_id)),
        };
        match statistics::start(
            &ctx,
            job.task.project_id,
            job.user_id,
            only_uploaded,
            attribute_id,
        )
        .await
        {
            Ok(start) => tracing::debug!(project_id = %job.task.project_id, ?start, "Statistics follow-up"),
            Err(e) => tracing::warn!(project_id = %job.task.project_id, "Statistics follow-up not started: {e}"),
        }
    }
    outcome
}

async fn execute(ctx: &Context, session: &mut dyn Session, job: &BatchJob) -> Result<PipelineOutcome> {
    let project_id = job.task.project_id;
    let Some(project) = live_project(session, project_id).await? else {
        return Ok(PipelineOutcome::Abandoned);
    };
    let mut machine = TaskMachine::load(session, project_id, job.task.task_id).await?;
    let tokenizer = ctx.tokenizers.resolve_for_project(&project).await?;

    let text_attributes = match job.scope {
        BatchScope::Project { only_uploaded } => {
            session
                .text_attributes(project_id, AttributeState::text_filter(only_uploaded))
                .await?
        }
        BatchScope::Attribute { attribute_id } => {
            let attribute = session
                .attribute(project_id, attribute_id)
                .await?
                .ok_or_else(|| Error::NotFound {
                    entity: "attribute",
                    id: attribute_id.to_string(),
                })?;
            if !attribute.is_text() {
                return Err(Error::AttributeNotText {
                    name: attribute.name,
                });
            }
            vec![attribute]
        }
    };
    let only_uploaded = matches!(job.scope, BatchScope::Project { only_uploaded: true });
    let non_text = session
        .non_text_attributes(project_id, AttributeState::sync_filter(only_uploaded))
        .await?;

    machine.start(session, &ctx.bridge, job.workload).await?;
    tracing::info!(
        %project_id,
        task_id = %job.task.task_id,
        workload = job.workload,
        "Tokenization started"
    );

    let settings = &ctx.settings;
    let chunk_size = settings.chunk_size.max(1);
    let per_chunk = if job.workload == 0 {
        1.0
    } else {
        round_to(chunk_size as f64 / job.workload as f64, 3)
    };
    let mut chunk_idx = 0_usize;

    loop {
        if ctx.pool.is_cancelled() {
            tracing::info!(task_id = %job.task.task_id, chunk_idx, "Shutdown requested, leaving task resumable");
            return Ok(PipelineOutcome::Interrupted);
        }

        let chunk = match job.scope {
            BatchScope::Project { .. } => {
                tokenize_missing_records(ctx, session, job, &tokenizer, &text_attributes, chunk_size)
                    .await?
            }
            BatchScope::Attribute { .. } => {
                append_attribute(session, job, &tokenizer, &text_attributes[0], chunk_size).await?
            }
        };
        match chunk {
            Chunk::Committed => {}
            Chunk::Exhausted => break,
            Chunk::ProjectGone => return Ok(PipelineOutcome::Abandoned),
        }

        if chunk_idx % settings.sync_every.max(1) == 0 {
            sync_non_text(ctx, session, &project, &non_text).await?;
        }

        let next = match settings.batch_progress {
            ProgressStrategy::FixedIncrement => round_to(machine.progress() + per_chunk, 4),
            ProgressStrategy::Remaining => {
                let remaining = match &job.scope {
                    BatchScope::Project { .. } => {
                        session.count_records_without_tokenization(project_id).await?
                    }
                    BatchScope::Attribute { .. } => {
                        session
                            .count_records_missing_attribute(project_id, &text_attributes[0].name)
                            .await?
                    }
                };
                remaining_progress(remaining, job.workload)
            }
        };
        machine.advance_to(session, &ctx.bridge, next).await?;
        chunk_idx += 1;

        if chunk_idx % settings.refresh_every.max(1) == 0 {
            session.refresh().await?;
            if machine.reload(session).await? == TaskState::Failed {
                tracing::info!(task_id = %job.task.task_id, "Task failed externally, stopping");
                ctx.bridge
                    .state(project_id, Channel::Docbin, TaskState::Failed)
                    .await;
                return Ok(PipelineOutcome::Cancelled);
            }
        }
    }

    if live_project(session, project_id).await?.is_none() {
        return Ok(PipelineOutcome::Abandoned);
    }
    session
        .delete_duplicated_tokenized_records(project_id)
        .await?;
    session.commit().await?;
    sync_non_text(ctx, session, &project, &non_text).await?;
    machine.finish(session, &ctx.bridge, None).await?;
    tracing::info!(%project_id, task_id = %job.task.task_id, chunks = chunk_idx, "Tokenization finished");
    Ok(PipelineOutcome::Finished)
}

async fn tokenize_missing_records(
    ctx: &Context,
    session: &mut dyn Session,
    job: &BatchJob,
    tokenizer: &Arc<dyn Tokenizer>,
    text_attributes: &[Attribute],
    chunk_size: usize,
) -> Result<Chunk> {
    let project_id = job.task.project_id;
    let records = session
        .records_without_tokenization(project_id, chunk_size)
        .await?;
    if records.is_empty() {
        return Ok(Chunk::Exhausted);
    }

    let fetched = records.len();
    let records: Vec<_> = records
        .into_iter()
        .filter(|record| {
            let claimed = ctx.registry.take(project_id, record.id);
            if claimed {
                tracing::debug!(record_id = %record.id, "Record claimed by the fast path, skipping");
            }
            !claimed
        })
        .collect();
    tracing::trace!(fetched, kept = records.len(), "Tokenizing chunk");

    let tokenizer = Arc::clone(tokenizer);
    let attributes = text_attributes.to_vec();
    let blobs = blocking(move || {
        records
            .iter()
            .map(|record| tokenize_record(tokenizer.as_ref(), record, &attributes).blob)
            .collect::<Vec<_>>()
    })
    .await?;

    if live_project(session, project_id).await?.is_none() {
        session.rollback().await?;
        return Ok(Chunk::ProjectGone);
    }
    session.add_tokenized_records(blobs).await?;
    session.commit().await?;
    Ok(Chunk::Committed)
}

async fn append_attribute(
    session: &mut dyn Session,
    job: &BatchJob,
    tokenizer: &Arc<dyn Tokenizer>,
    attribute: &Attribute,
    chunk_size: usize,
) -> Result<Chunk> {
    let project_id = job.task.project_id;
    let pending = session
        .records_missing_attribute(project_id, &attribute.name, chunk_size)
        .await?;
    if pending.is_empty() {
        return Ok(Chunk::Exhausted);
    }

    let tokenizer = Arc::clone(tokenizer);
    let name = attribute.name.clone();
    let updates = blocking(move || {
        pending
            .into_iter()
            .map(|item| {
                let bytes = append_to_blob(&item.blob.bytes, tokenizer.tokenize(&item.text))?;
                let mut columns = item.blob.columns;
                columns.push(name.clone());
                Ok((item.blob.id, bytes, columns))
            })
            .collect::<Result<Vec<_>>>()
    })
    .await??;

    if live_project(session, project_id).await?.is_none() {
        session.rollback().await?;
        return Ok(Chunk::ProjectGone);
    }
    for (blob_id, bytes, columns) in updates {
        session
            .update_tokenized_record(project_id, blob_id, bytes, columns)
            .await?;
    }
    session.commit().await?;
    Ok(Chunk::Committed)
}
