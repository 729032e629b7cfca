use crate::{Error, ProjectId, Result};
use async_trait::async_trait;
use parking_lot::Mutex;

/// One message on the live event channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectEvent {
    pub project_id: ProjectId,
    pub message: String,
    /// Global events reach every connected client, not only the project's.
    pub global: bool,
}

impl ProjectEvent {
    pub fn project(project_id: ProjectId, message: impl Into<String>) -> Self {
        Self {
            project_id,
            message: message.into(),
            global: false,
        }
    }

    pub fn global(project_id: ProjectId, message: impl Into<String>) -> Self {
        Self {
            project_id,
            message: message.into(),
            global: true,
        }
    }

    /// The string as it travels on the wire, prefixed with its routing key.
    pub fn wire_message(&self) -> String {
        if self.global {
            format!("GLOBAL:{}", self.message)
        } else {
            format!("{}:{}", self.project_id, self.message)
        }
    }
}

/// The outbound live event channel.
#[async_trait]
pub trait Broadcaster: Send + Sync {
    async fn send(&self, event: ProjectEvent) -> Result<()>;
}

/// Writes every event to the log. Used when no event channel is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogBroadcaster;

#[async_trait]
impl Broadcaster for LogBroadcaster {
    async fn send(&self, event: ProjectEvent) -> Result<()> {
        tracing::info!(project_id = %event.project_id, "{}", event.wire_message());
        Ok(())
    }
}

/// Keeps every event in memory, in send order.
///
/// A recorder can be switched to failing mode, in which it rejects every
/// event but still records it.
#[derive(Debug, Default)]
pub struct RecordingBroadcaster {
    events: Mutex<Vec<ProjectEvent>>,
    failing: bool,
}

impl RecordingBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            events: Mutex::default(),
            failing: true,
        }
    }

    pub fn events(&self) -> Vec<ProjectEvent> {
        self.events.lock().clone()
    }

    /// Messages of one project's non-global events.
    pub fn messages(&self, project_id: ProjectId) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.project_id == project_id && !e.global)
            .map(|e| e.message.clone())
            .collect()
    }
}

#[async_trait]
impl Broadcaster for RecordingBroadcaster {
    async fn send(&self, event: ProjectEvent) -> Result<()> {
        self.events.lock().push(event);
        if self.failing {
            return Err(Error::Broadcast {
                reason: "channel unavailable".to_owned(),
            });
        }
        Ok(())
    }
}
