//! Persistence seam of the orchestrator.
//!
//! A [`Session`] is a unit of work with explicit transaction control: writes
//! are staged until [`Session::commit`] and discarded by
//! [`Session::rollback`]. Reads observe committed state only. Long-running
//! pipelines periodically call [`Session::refresh`] to drop cached state and
//! observe changes committed by other sessions, such as an administrator
//! failing a task.

use crate::{
    Attribute, AttributeId, AttributeState, MissingStatistics, Notification, Project, ProjectId,
    Record, RecordId, Result, TaskId, TaskPatch, TokenStatistic, TokenizationTask, TokenizedRecord,
};
use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

/// Hands out sessions.
#[async_trait]
pub trait Database: Send + Sync {
    async fn session(&self) -> Result<Box<dyn Session>>;
}

/// An existing blob that does not cover an attribute yet, with the text to
/// tokenize for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAttribute {
    pub blob: TokenizedRecord,
    pub text: String,
}

/// One exported row of non-text record data.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenizerDataRow {
    pub record_id: RecordId,
    /// Attributes covered by the record's blob.
    pub columns: Vec<String>,
    /// Values of the requested non-text attributes.
    pub data: Map<String, Value>,
}

#[async_trait]
pub trait Session: Send {
    // ---- projects and attributes -------------------------------------------

    async fn project(&mut self, project_id: ProjectId) -> Result<Option<Project>>;

    async fn attribute(
        &mut self,
        project_id: ProjectId,
        attribute_id: AttributeId,
    ) -> Result<Option<Attribute>>;

    /// Text attributes in one of `states`, ordered by relative position.
    async fn text_attributes(
        &mut self,
        project_id: ProjectId,
        states: &[AttributeState],
    ) -> Result<Vec<Attribute>>;

    /// Non-text attributes in one of `states`, ordered by relative position.
    async fn non_text_attributes(
        &mut self,
        project_id: ProjectId,
        states: &[AttributeState],
    ) -> Result<Vec<Attribute>>;

    // ---- records -----------------------------------------------------------

    async fn record(&mut self, project_id: ProjectId, record_id: RecordId)
    -> Result<Option<Record>>;

    async fn count_records_without_tokenization(&mut self, project_id: ProjectId) -> Result<u64>;

    /// Up to `limit` records that have no blob yet, in a stable order.
    async fn records_without_tokenization(
        &mut self,
        project_id: ProjectId,
        limit: usize,
    ) -> Result<Vec<Record>>;

    /// Number of blobs whose columns do not include `attribute_name`.
    async fn count_records_missing_attribute(
        &mut self,
        project_id: ProjectId,
        attribute_name: &str,
    ) -> Result<u64>;

    /// Up to `limit` blobs whose columns do not include `attribute_name`.
    async fn records_missing_attribute(
        &mut self,
        project_id: ProjectId,
        attribute_name: &str,
        limit: usize,
    ) -> Result<Vec<PendingAttribute>>;

    // ---- tokenized blobs ---------------------------------------------------

    async fn has_tokenized_record(&mut self, project_id: ProjectId, record_id: RecordId)
    -> Result<bool>;

    /// The blob of a record. With duplicates present, the oldest one.
    async fn tokenized_record(
        &mut self,
        project_id: ProjectId,
        record_id: RecordId,
    ) -> Result<Option<TokenizedRecord>>;

    async fn count_tokenized_records(&mut self, project_id: ProjectId) -> Result<u64>;

    async fn add_tokenized_records(&mut self, records: Vec<TokenizedRecord>) -> Result<()>;

    async fn update_tokenized_record(
        &mut self,
        project_id: ProjectId,
        blob_id: Uuid,
        bytes: Bytes,
        columns: Vec<String>,
    ) -> Result<()>;

    /// Keeps one blob per record, the oldest.
    async fn delete_duplicated_tokenized_records(&mut self, project_id: ProjectId) -> Result<()>;

    /// Non-text data of every tokenized record, restricted to `columns`.
    async fn export_tokenizer_data(
        &mut self,
        project_id: ProjectId,
        columns: &[String],
    ) -> Result<Vec<TokenizerDataRow>>;

    // ---- token statistics --------------------------------------------------

    /// Number of records lacking a statistic for at least one of
    /// `attribute_ids`.
    ///
    /// A record with a blob only counts for attributes its blob covers. A
    /// record without a blob counts for every attribute.
    async fn count_records_missing_statistics(
        &mut self,
        project_id: ProjectId,
        attribute_ids: &[AttributeId],
    ) -> Result<u64>;

    /// Up to `limit` records as counted by
    /// [`Self::count_records_missing_statistics`], each with its missing
    /// attributes.
    async fn records_missing_statistics(
        &mut self,
        project_id: ProjectId,
        attribute_ids: &[AttributeId],
        limit: usize,
    ) -> Result<Vec<MissingStatistics>>;

    async fn add_token_statistics(&mut self, statistics: Vec<TokenStatistic>) -> Result<()>;

    /// Inserts the statistic or overwrites the count of an existing one for
    /// the same record and attribute.
    async fn upsert_token_statistic(&mut self, statistic: TokenStatistic) -> Result<()>;

    /// Keeps one statistic per record and attribute, the oldest.
    async fn delete_duplicated_token_statistics(&mut self, project_id: ProjectId) -> Result<()>;

    // ---- tasks -------------------------------------------------------------

    async fn insert_task(&mut self, task: TokenizationTask) -> Result<()>;

    async fn task(
        &mut self,
        project_id: ProjectId,
        task_id: TaskId,
    ) -> Result<Option<TokenizationTask>>;

    async fn update_task(
        &mut self,
        project_id: ProjectId,
        task_id: TaskId,
        patch: TaskPatch,
    ) -> Result<()>;

    /// Whether a project or attribute task is `CREATED` or `IN_PROGRESS`.
    async fn has_active_batch_task(&mut self, project_id: ProjectId) -> Result<bool>;

    // ---- notifications -----------------------------------------------------

    async fn create_notification(&mut self, notification: Notification) -> Result<()>;

    // ---- transaction control -----------------------------------------------

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;

    /// Discards uncommitted writes and cached state so that subsequent reads
    /// observe the latest committed data.
    async fn refresh(&mut self) -> Result<()>;

    /// Returns the session to its pool. The session must not be used
    /// afterwards.
    async fn release(&mut self) -> Result<()>;
}
