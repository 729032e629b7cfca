//! Inline tokenization of one record, used right after a record is created
//! or edited.
//!
//! The record is registered in the [`PriorityRegistry`] for the duration of
//! the call so a concurrent batch run skips it. Token statistics are written
//! in the same commit as the blob, so no statistics pass is needed.
//!
//! [`PriorityRegistry`]: crate::PriorityRegistry

use super::{Context, blocking, live_project, release, tokenize_record};
use crate::{
    AttributeState, Error, ProjectId, RecordId, RecordStatus, Result, Session, TokenStatistic,
};

pub(crate) async fn tokenize_single_record(
    ctx: &Context,
    project_id: ProjectId,
    record_id: RecordId,
) -> RecordStatus {
    let mut session = match ctx.database.session().await {
        Ok(session) => session,
        Err(e) => {
            tracing::warn!(%project_id, %record_id, "Cannot open session: {e}");
            return RecordStatus::Error;
        }
    };

    match session.has_tokenized_record(project_id, record_id).await {
        Ok(true) => {
            release(session).await;
            return RecordStatus::Ok;
        }
        Ok(false) => {}
        Err(e) => {
            tracing::warn!(%project_id, %record_id, "Blob lookup failed: {e}");
            release(session).await;
            return RecordStatus::Error;
        }
    }

    ctx.registry.register(project_id, record_id);
    let result = tokenize(ctx, session.as_mut(), project_id, record_id).await;
    ctx.registry.take(project_id, record_id);

    let status = match result {
        Ok(()) => RecordStatus::Ok,
        Err(e) => {
            if let Err(rollback) = session.rollback().await {
                tracing::warn!(%project_id, %record_id, "Rollback failed: {rollback}");
            }
            tracing::warn!(%project_id, %record_id, "Single record tokenization failed: {e}");
            RecordStatus::Error
        }
    };
    release(session).await;
    status
}

async fn tokenize(
    ctx: &Context,
    session: &mut dyn Session,
    project_id: ProjectId,
    record_id: RecordId,
) -> Result<()> {
    let project = live_project(session, project_id)
        .await?
        .ok_or_else(|| Error::NotFound {
            entity: "project",
            id: project_id.to_string(),
        })?;
    let record = session
        .record(project_id, record_id)
        .await?
        .ok_or_else(|| Error::NotFound {
            entity: "record",
            id: record_id.to_string(),
        })?;
    let text_attributes = session
        .text_attributes(project_id, AttributeState::ELIGIBLE)
        .await?;
    let tokenizer = ctx.tokenizers.resolve_for_project(&project).await?;

    let output = blocking(move || tokenize_record(tokenizer.as_ref(), &record, &text_attributes))
        .await?;
    for (attribute_id, num_token) in output.counts {
        session
            .upsert_token_statistic(TokenStatistic::new(
                project_id,
                record_id,
                attribute_id,
                num_token,
            ))
            .await?;
    }
    session.add_tokenized_records(vec![output.blob]).await?;
    session.commit().await
}
