//! Conversions between wire messages and orchestrator types.

use crate::{Error, Result, proto};
use doctok::{RecordStatus, StatisticsStart, TokenizationTask};
use uuid::Uuid;

/// Parses a UUID request field.
pub fn parse_id(field: &'static str, value: &str) -> Result<Uuid> {
    Uuid::parse_str(value.trim()).map_err(|_| Error::InvalidId {
        field,
        value: value.to_owned(),
    })
}

/// Parses an optional UUID request field; empty strings count as unset.
pub fn parse_optional_id(field: &'static str, value: Option<&str>) -> Result<Option<Uuid>> {
    match value {
        None => Ok(None),
        Some(v) if v.trim().is_empty() => Ok(None),
        Some(v) => parse_id(field, v).map(Some),
    }
}

impl From<TokenizationTask> for proto::Task {
    fn from(task: TokenizationTask) -> Self {
        Self {
            id: task.id.to_string(),
            project_id: task.project_id.to_string(),
            user_id: task.user_id.to_string(),
            scope: task.scope.as_str().to_owned(),
            attribute_name: task.attribute_name,
            state: task.state.as_str().to_owned(),
            workload: task.workload,
            progress: task.progress,
            started_at: task.started_at.to_rfc3339(),
            finished_at: task.finished_at.map(|at| at.to_rfc3339()),
        }
    }
}

impl From<StatisticsStart> for proto::StatisticsReply {
    fn from(start: StatisticsStart) -> Self {
        let (status, task_id) = match start {
            StatisticsStart::Deferred => (proto::StatisticsStatus::Deferred, None),
            StatisticsStart::AlreadyComplete => (proto::StatisticsStatus::AlreadyComplete, None),
            StatisticsStart::Started(task) => (
                proto::StatisticsStatus::Started,
                Some(task.task_id.to_string()),
            ),
        };
        Self {
            status: status.into(),
            task_id,
        }
    }
}

impl From<RecordStatus> for proto::TokenizeRecordReply {
    fn from(status: RecordStatus) -> Self {
        let status = match status {
            RecordStatus::Ok => proto::RecordStatus::Ok,
            RecordStatus::Error => proto::RecordStatus::Error,
        };
        Self {
            status: status.into(),
        }
    }
}
