//! Domain types shared by the store, the pipelines and the boundary.
//!
//! Identifiers are plain [`Uuid`] aliases. Enumerations serialize in
//! `SCREAMING_SNAKE_CASE` so that they match the values persisted by the
//! surrounding platform and the strings pushed to the broadcast channel.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use core::fmt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

pub type ProjectId = Uuid;
pub type OrganizationId = Uuid;
pub type UserId = Uuid;
pub type RecordId = Uuid;
pub type AttributeId = Uuid;
pub type TaskId = Uuid;

/// Which unit of work a [`TokenizationTask`] covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskScope {
    /// Every record of a project that has no tokenized blob yet.
    Project,
    /// One (usually calculated) attribute appended to existing blobs.
    Attribute,
    /// Token counts per record and attribute.
    TokenStatistics,
}

impl TaskScope {
    /// Batch scopes are the ones that produce blobs.
    pub const fn is_batch(self) -> bool {
        matches!(self, Self::Project | Self::Attribute)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Project => "PROJECT",
            Self::Attribute => "ATTRIBUTE",
            Self::TokenStatistics => "TOKEN_STATISTICS",
        }
    }
}

impl fmt::Display for TaskScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a [`TokenizationTask`].
///
/// `CREATED -> IN_PROGRESS -> {FINISHED, FAILED}`. The two terminal states are
/// final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Created,
    InProgress,
    Finished,
    Failed,
}

impl TaskState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::InProgress => "IN_PROGRESS",
            Self::Finished => "FINISHED",
            Self::Failed => "FAILED",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed)
    }

    /// `CREATED` and `IN_PROGRESS` both count as an active (queued or
    /// running) job.
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Created | Self::InProgress)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProjectStatus {
    #[default]
    Active,
    InDeletion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataType {
    Text,
    Category,
    Integer,
    Float,
    Boolean,
    EmbeddingList,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttributeState {
    Uploaded,
    Usable,
    Running,
    AutomaticallyCreated,
    Initial,
    Failed,
}

impl AttributeState {
    /// States whose text attributes are tokenized and counted.
    pub const ELIGIBLE: &'static [Self] = &[Self::Uploaded, Self::Usable, Self::Running];

    /// Used right after an upload, before calculated attributes exist.
    pub const ONLY_UPLOADED: &'static [Self] = &[Self::Uploaded];

    /// States whose non-text columns are pushed to blob storage on a re-upload.
    pub const SYNCABLE: &'static [Self] = &[
        Self::Uploaded,
        Self::Usable,
        Self::AutomaticallyCreated,
        Self::Running,
    ];

    /// Picks the text-attribute filter for a run.
    pub const fn text_filter(only_uploaded: bool) -> &'static [Self] {
        if only_uploaded {
            Self::ONLY_UPLOADED
        } else {
            Self::ELIGIBLE
        }
    }

    /// Picks the non-text sync filter for a run.
    pub const fn sync_filter(only_uploaded: bool) -> &'static [Self] {
        if only_uploaded {
            Self::ONLY_UPLOADED
        } else {
            Self::SYNCABLE
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub organization_id: OrganizationId,
    pub name: String,
    /// Configuration identifier of the tokenizer, e.g. `en_core_web_sm`.
    pub tokenizer: String,
    #[serde(default)]
    pub status: ProjectStatus,
}

impl Project {
    /// A project scheduled for deletion is treated as already gone.
    pub fn is_live(&self) -> bool {
        self.status != ProjectStatus::InDeletion
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    pub id: AttributeId,
    pub project_id: ProjectId,
    pub name: String,
    pub data_type: DataType,
    pub state: AttributeState,
    #[serde(default)]
    pub relative_position: u32,
}

impl Attribute {
    pub fn is_text(&self) -> bool {
        self.data_type == DataType::Text
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub project_id: ProjectId,
    pub data: Map<String, Value>,
}

impl Record {
    /// Returns the text to tokenize for `attribute`.
    ///
    /// Missing and `null` values become the empty string so every text
    /// attribute still yields a (possibly empty) token sequence.
    pub fn text_of(&self, attribute: &str) -> String {
        match self.data.get(attribute) {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        }
    }
}

/// One row per background tokenization or statistics run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenizationTask {
    pub id: TaskId,
    pub project_id: ProjectId,
    pub user_id: UserId,
    pub scope: TaskScope,
    pub attribute_name: Option<String>,
    pub state: TaskState,
    pub workload: u64,
    pub progress: f64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TokenizationTask {
    pub fn new(
        project_id: ProjectId,
        user_id: UserId,
        scope: TaskScope,
        attribute_name: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id,
            user_id,
            scope,
            attribute_name,
            state: TaskState::Created,
            workload: 0,
            progress: 0.0,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn task_ref(&self) -> TaskRef {
        TaskRef {
            project_id: self.project_id,
            task_id: self.id,
        }
    }

    /// Applies a patch in place, mirroring what the store does on commit.
    pub fn apply(&mut self, patch: &TaskPatch) {
        if let Some(state) = patch.state {
            self.state = state;
        }
        if let Some(workload) = patch.workload {
            self.workload = workload;
        }
        if let Some(progress) = patch.progress {
            self.progress = progress;
        }
        if let Some(finished_at) = patch.finished_at {
            self.finished_at = Some(finished_at);
        }
    }
}

/// Column-level update of a task row.
///
/// Only the fields that are `Some` are written, so a progress update never
/// overwrites a state written concurrently by an administrator.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TaskPatch {
    pub state: Option<TaskState>,
    pub workload: Option<u64>,
    pub progress: Option<f64>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskPatch {
    pub fn progress(progress: f64) -> Self {
        Self {
            progress: Some(progress),
            ..Self::default()
        }
    }

    pub fn state(state: TaskState) -> Self {
        Self {
            state: Some(state),
            ..Self::default()
        }
    }
}

/// Handle returned to the caller once a task row exists and its worker is
/// spawned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskRef {
    pub project_id: ProjectId,
    pub task_id: TaskId,
}

/// Serialized token sequences of one record, one per covered attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenizedRecord {
    pub id: Uuid,
    pub project_id: ProjectId,
    pub record_id: RecordId,
    pub bytes: Bytes,
    /// Attribute names in the same order as the sequences inside `bytes`.
    pub columns: Vec<String>,
}

impl TokenizedRecord {
    pub fn new(project_id: ProjectId, record_id: RecordId, bytes: Bytes, columns: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id,
            record_id,
            bytes,
            columns,
        }
    }
}

/// Token count of one attribute of one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenStatistic {
    pub id: Uuid,
    pub project_id: ProjectId,
    pub record_id: RecordId,
    pub attribute_id: AttributeId,
    pub num_token: u64,
}

impl TokenStatistic {
    pub fn new(
        project_id: ProjectId,
        record_id: RecordId,
        attribute_id: AttributeId,
        num_token: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id,
            record_id,
            attribute_id,
            num_token,
        }
    }
}

/// A record that still lacks statistics for some of the requested attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingStatistics {
    pub record_id: RecordId,
    pub attribute_ids: Vec<AttributeId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationLevel {
    Info,
    Success,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationKind {
    TokenCreationStarted,
    TokenCreationDone,
    TokenCreationFailed,
}

/// A persisted, user-facing message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub project_id: ProjectId,
    pub user_id: UserId,
    pub message: String,
    pub level: NotificationLevel,
    pub kind: NotificationKind,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(
        project_id: ProjectId,
        user_id: UserId,
        message: impl Into<String>,
        level: NotificationLevel,
        kind: NotificationKind,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id,
            user_id,
            message: message.into(),
            level,
            kind,
            created_at: Utc::now(),
        }
    }
}

/// Result of a single-record tokenization request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordStatus {
    Ok,
    /// Tokenization failed; nothing was persisted.
    Error,
}
