//! Token statistics ("rats") derived from existing blobs.

use super::{
    Context, FailureNotice, PipelineOutcome, StatisticsStart, live_project, record_failure, release,
    remaining_progress, spawn_task,
};
use crate::{
    Attribute, AttributeId, AttributeState, Channel, Error, Notification, NotificationKind,
    NotificationLevel, ProjectId, Result, Session, TaskRef, TaskScope, TaskState, TokenStatistic,
    TokenizationTask, UserId, decode_blob,
    task::{COMPLETED_MESSAGE, STATISTICS_FAILED_MESSAGE, TaskMachine},
};
use std::{collections::HashMap, sync::Arc};
use tokio::time::sleep;

pub(crate) const FAILURE: FailureNotice = FailureNotice {
    message: STATISTICS_FAILED_MESSAGE,
    kind: NotificationKind::TokenCreationFailed,
};

#[derive(Debug, Clone)]
pub(crate) struct StatisticsJob {
    pub(crate) task: TaskRef,
    pub(crate) user_id: UserId,
    pub(crate) only_uploaded: bool,
    pub(crate) attribute_id: Option<AttributeId>,
    pub(crate) initial_count: u64,
}

enum Prepared {
    Deferred,
    AlreadyComplete,
    Task(TaskRef, u64),
}

/// Attributes the pass computes statistics for.
pub(crate) async fn targets(
    session: &mut dyn Session,
    project_id: ProjectId,
    only_uploaded: bool,
    attribute_id: Option<AttributeId>,
) -> Result<Vec<Attribute>> {
    match attribute_id {
        Some(id) => {
            let attribute = session
                .attribute(project_id, id)
                .await?
                .ok_or_else(|| Error::NotFound {
                    entity: "attribute",
                    id: id.to_string(),
                })?;
            Ok(vec![attribute])
        }
        None => {
            session
                .text_attributes(project_id, AttributeState::text_filter(only_uploaded))
                .await
        }
    }
}

/// Creates a statistics task and spawns its worker, unless a batch task is
/// still active or nothing is missing.
pub(crate) async fn start(
    ctx: &Arc<Context>,
    project_id: ProjectId,
    user_id: UserId,
    only_uploaded: bool,
    attribute_id: Option<AttributeId>,
) -> Result<StatisticsStart> {
    if !ctx.pool.is_accepting() {
        return Err(Error::ServiceShutdown);
    }

    let mut session = ctx.database.session().await?;
    let prepared = prepare(session.as_mut(), project_id, user_id, only_uploaded, attribute_id).await;
    if prepared.is_err() {
        if let Err(e) = session.rollback().await {
            tracing::warn!(%project_id, "Rollback failed: {e}");
        }
    }
    release(session).await;

    match prepared? {
        Prepared::Deferred => {
            tracing::debug!(%project_id, "Batch task active, deferring statistics");
            Ok(StatisticsStart::Deferred)
        }
        Prepared::AlreadyComplete => {
            ctx.bridge.notification_created(project_id, user_id).await;
            Ok(StatisticsStart::AlreadyComplete)
        }
        Prepared::Task(task, initial_count) => {
            let job = StatisticsJob {
                task,
                user_id,
                only_uploaded,
                attribute_id,
                initial_count,
            };
            let label = format!("statistics:{project_id}");
            let task = spawn_task(ctx, label, task, FAILURE, run(Arc::clone(ctx), job)).await?;
            Ok(StatisticsStart::Started(task))
        }
    }
}

async fn prepare(
    session: &mut dyn Session,
    project_id: ProjectId,
    user_id: UserId,
    only_uploaded: bool,
    attribute_id: Option<AttributeId>,
) -> Result<Prepared> {
    if live_project(session, project_id).await?.is_none() {
        return Err(Error::NotFound {
            entity: "project",
            id: project_id.to_string(),
        });
    }
    if session.has_active_batch_task(project_id).await? {
        return Ok(Prepared::Deferred);
    }

    let ids: Vec<_> = targets(session, project_id, only_uploaded, attribute_id)
        .await?
        .iter()
        .map(|a| a.id)
        .collect();
    let initial_count = session
        .count_records_missing_statistics(project_id, &ids)
        .await?;
    if initial_count == 0 {
        session
            .create_notification(Notification::new(
                project_id,
                user_id,
                COMPLETED_MESSAGE,
                NotificationLevel::Success,
                NotificationKind::TokenCreationDone,
            ))
            .await?;
        session.commit().await?;
        return Ok(Prepared::AlreadyComplete);
    }

    let task = TokenizationTask::new(project_id, user_id, TaskScope::TokenStatistics, None);
    let task_ref = task.task_ref();
    session.insert_task(task).await?;
    session.commit().await?;
    Ok(Prepared::Task(task_ref, initial_count))
}

pub(crate) async fn run(ctx: Arc<Context>, job: StatisticsJob) -> PipelineOutcome {
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
    outcome
}

async fn execute(
    ctx: &Context,
    session: &mut dyn Session,
    job: &StatisticsJob,
) -> Result<PipelineOutcome> {
    let project_id = job.task.project_id;
    if live_project(session, project_id).await?.is_none() {
        return Ok(PipelineOutcome::Abandoned);
    }
    let mut machine = TaskMachine::load(session, project_id, job.task.task_id).await?;
    machine
        .start(session, &ctx.bridge, job.initial_count)
        .await?;

    if !wait_for_blobs(ctx, session, project_id, job.initial_count).await? {
        return Ok(PipelineOutcome::Interrupted);
    }

    let targets = targets(session, project_id, job.only_uploaded, job.attribute_id).await?;
    let ids: Vec<AttributeId> = targets.iter().map(|a| a.id).collect();
    let names: HashMap<AttributeId, &str> =
        targets.iter().map(|a| (a.id, a.name.as_str())).collect();

    let settings = &ctx.settings;
    let page_size = settings.statistics_page_size.max(1);
    let mut page = 0_usize;
    loop {
        if ctx.pool.is_cancelled() {
            tracing::info!(task_id = %job.task.task_id, page, "Shutdown requested, leaving task resumable");
            return Ok(PipelineOutcome::Interrupted);
        }

        let missing = session
            .records_missing_statistics(project_id, &ids, page_size)
            .await?;
        if missing.is_empty() {
            break;
        }

        let mut entries = Vec::new();
        for item in &missing {
            let blob = session
                .tokenized_record(project_id, item.record_id)
                .await?
                .ok_or_else(|| Error::BlobMissing {
                    record_id: item.record_id.to_string(),
                })?;
            let sequences = decode_blob(&blob.bytes)?;
            for attribute_id in &item.attribute_ids {
                let Some(name) = names.get(attribute_id) else {
                    continue;
                };
                let sequence = blob
                    .columns
                    .iter()
                    .position(|c| c == name)
                    .and_then(|idx| sequences.get(idx))
                    .ok_or_else(|| Error::BlobColumnsMismatch {
                        record_id: item.record_id.to_string(),
                        attribute: (*name).to_owned(),
                    })?;
                entries.push(TokenStatistic::new(
                    project_id,
                    item.record_id,
                    *attribute_id,
                    sequence.len() as u64,
                ));
            }
        }
        // The same page would come back forever.
        if entries.is_empty() {
            return Err(Error::store(format!(
                "{} records reported missing statistics for attributes outside the target set",
                missing.len()
            )));
        }

        if live_project(session, project_id).await?.is_none() {
            session.rollback().await?;
            return Ok(PipelineOutcome::Abandoned);
        }
        session.add_token_statistics(entries).await?;
        session.commit().await?;

        if page % settings.statistics_refresh_every.max(1) == 0 {
            session.refresh().await?;
            if machine.reload(session).await? == TaskState::Failed {
                tracing::info!(task_id = %job.task.task_id, "Task failed externally, stopping");
                ctx.bridge
                    .state(project_id, Channel::Rats, TaskState::Failed)
                    .await;
                return Ok(PipelineOutcome::Cancelled);
            }
        }

        let remaining = session
            .count_records_missing_statistics(project_id, &ids)
            .await?;
        machine
            .advance_to(
                session,
                &ctx.bridge,
                remaining_progress(remaining, job.initial_count),
            )
            .await?;
        page += 1;
    }

    if live_project(session, project_id).await?.is_none() {
        return Ok(PipelineOutcome::Abandoned);
    }
    session
        .delete_duplicated_token_statistics(project_id)
        .await?;
    let notification = Notification::new(
        project_id,
        job.user_id,
        COMPLETED_MESSAGE,
        NotificationLevel::Success,
        NotificationKind::TokenCreationDone,
    );
    machine
        .finish(session, &ctx.bridge, Some(notification))
        .await?;
    tracing::info!(%project_id, task_id = %job.task.task_id, pages = page, "Token statistics finished");
    Ok(PipelineOutcome::Finished)
}

/// Waits until at least `expected` blobs are visible.
///
/// Returns `Ok(false)` if the pool was cancelled while waiting.
async fn wait_for_blobs(
    ctx: &Context,
    session: &mut dyn Session,
    project_id: ProjectId,
    expected: u64,
) -> Result<bool> {
    let mut checks = 0;
    loop {
        let found = session.count_tokenized_records(project_id).await?;
        if found >= expected {
            return Ok(true);
        }
        if checks >= ctx.settings.blob_wait_retries {
            return Err(Error::RequiredBlobsMissing { expected, found });
        }
        checks += 1;
        tracing::debug!(%project_id, found, expected, checks, "Waiting for blobs");
        tokio::select! {
            () = ctx.pool.cancelled() => return Ok(false),
            () = sleep(ctx.settings.blob_wait_interval) => {}
        }
        session.refresh().await?;
    }
}
