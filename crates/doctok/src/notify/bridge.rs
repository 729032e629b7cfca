//! Task lifecycle and progress events for clients.
//!
//! Messages follow `tokenization:<channel>:<kind>:<value>`, where channel is
//! `docbin` for blob production and `rats` for statistics. Progress updates
//! from inside a chunk loop go through the throttle; state changes and final
//! progress values never do, so a client always sees the terminal state.
//!
//! Send failures are logged and swallowed. A broken event channel must never
//! fail a task.

use crate::{Broadcaster, ProjectEvent, ProjectId, TaskScope, TaskState, Throttle, UserId};
use core::{fmt, time::Duration};
use std::sync::Arc;

/// Which pipeline an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Docbin,
    Rats,
}

impl Channel {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Docbin => "docbin",
            Self::Rats => "rats",
        }
    }

    pub const fn for_scope(scope: TaskScope) -> Self {
        match scope {
            TaskScope::Project | TaskScope::Attribute => Self::Docbin,
            TaskScope::TokenStatistics => Self::Rats,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Dropped if another message with the same key went out recently.
    Throttled,
    Immediate,
}

pub struct ProgressBridge {
    broadcaster: Arc<dyn Broadcaster>,
    throttle: Throttle,
}

impl ProgressBridge {
    pub fn new(broadcaster: Arc<dyn Broadcaster>, period: Duration) -> Self {
        Self {
            broadcaster,
            throttle: Throttle::new(period),
        }
    }

    pub async fn state(&self, project_id: ProjectId, channel: Channel, state: TaskState) {
        let message = format!("tokenization:{channel}:state:{state}");
        self.push(ProjectEvent::project(project_id, message), None)
            .await;
    }

    pub async fn progress(
        &self,
        project_id: ProjectId,
        channel: Channel,
        progress: f64,
        delivery: Delivery,
    ) {
        let key = format!("{project_id}:tokenization:{channel}:progress");
        let message = format!("tokenization:{channel}:progress:{}", format_progress(progress));
        let key = (delivery == Delivery::Throttled).then_some(key);
        self.push(ProjectEvent::project(project_id, message), key.as_deref())
            .await;
    }

    /// Tells every client that a new persisted notification exists for
    /// `user_id`.
    pub async fn notification_created(&self, project_id: ProjectId, user_id: UserId) {
        let message = format!("notification_created:{user_id}");
        self.push(ProjectEvent::global(project_id, message), None)
            .await;
    }

    async fn push(&self, event: ProjectEvent, throttle_key: Option<&str>) {
        if let Some(key) = throttle_key {
            if !self.throttle.try_acquire(key) {
                tracing::trace!(key, "Progress update throttled");
                return;
            }
        }
        if let Err(e) = self.broadcaster.send(event).await {
            tracing::warn!("Failed to broadcast event: {e}");
        }
    }
}

/// Progress as it appears on the wire: at most four decimals, no trailing
/// zeros.
pub fn format_progress(progress: f64) -> String {
    let rounded = (progress * 10_000.0).round() / 10_000.0;
    format!("{rounded}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RecordingBroadcaster;
    use uuid::Uuid;

    fn bridge() -> (ProgressBridge, Arc<RecordingBroadcaster>) {
        let recorder = Arc::new(RecordingBroadcaster::new());
        let bridge = ProgressBridge::new(recorder.clone(), Duration::from_secs(5));
        (bridge, recorder)
    }

    #[test]
    fn progress_is_rounded_for_the_wire() {
        assert_eq!(format_progress(0.417), "0.417");
        assert_eq!(format_progress(1.0 / 3.0), "0.3333");
        assert_eq!(format_progress(1.0), "1");
        assert_eq!(format_progress(0.0), "0");
    }

    #[tokio::test(start_paused = true)]
    async fn throttled_progress_is_dropped_but_state_is_not() {
        let (bridge, recorder) = bridge();
        let project = Uuid::new_v4();

        bridge
            .progress(project, Channel::Docbin, 0.1, Delivery::Throttled)
            .await;
        bridge
            .progress(project, Channel::Docbin, 0.2, Delivery::Throttled)
            .await;
        bridge
            .progress(project, Channel::Rats, 0.3, Delivery::Throttled)
            .await;
        bridge
            .state(project, Channel::Docbin, TaskState::InProgress)
            .await;
        bridge
            .progress(project, Channel::Docbin, 1.0, Delivery::Immediate)
            .await;

        assert_eq!(
            recorder.messages(project),
            vec![
                "tokenization:docbin:progress:0.1",
                "tokenization:rats:progress:0.3",
                "tokenization:docbin:state:IN_PROGRESS",
                "tokenization:docbin:progress:1",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_is_per_project() {
        let (bridge, recorder) = bridge();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        bridge.progress(a, Channel::Docbin, 0.5, Delivery::Throttled).await;
        bridge.progress(b, Channel::Docbin, 0.5, Delivery::Throttled).await;

        assert_eq!(recorder.messages(a).len(), 1);
        assert_eq!(recorder.messages(b).len(), 1);
    }

    #[tokio::test]
    async fn notification_created_is_global() {
        let (bridge, recorder) = bridge();
        let project = Uuid::new_v4();
        let user = Uuid::new_v4();

        bridge.notification_created(project, user).await;

        let events = recorder.events();
        assert_eq!(events.len(), 1);
        assert!(events[0].global);
        assert_eq!(events[0].wire_message(), format!("GLOBAL:notification_created:{user}"));
    }

    #[tokio::test]
    async fn send_failures_are_swallowed() {
        let recorder = Arc::new(RecordingBroadcaster::failing());
        let bridge = ProgressBridge::new(recorder.clone(), Duration::from_secs(5));
        let project = Uuid::new_v4();

        bridge.state(project, Channel::Rats, TaskState::Failed).await;

        assert_eq!(recorder.messages(project), vec!["tokenization:rats:state:FAILED"]);
    }
}
