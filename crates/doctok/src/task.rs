//! Transitions of a [`TokenizationTask`] row.
//!
//! Every transition is written through the caller's [`Session`], committed,
//! and only then broadcast. Progress is clamped to `[current, 1.0]`, so it
//! never moves backwards and never exceeds completion.

use crate::{
    Channel, Delivery, Error, Notification, NotificationKind, NotificationLevel, ProgressBridge,
    ProjectId, Result, Session, TaskId, TaskPatch, TaskState, TokenizationTask,
};
use chrono::Utc;

pub(crate) const STARTED_MESSAGE: &str = "Started tokenization.";
pub(crate) const COMPLETED_MESSAGE: &str = "Completed tokenization.";
pub(crate) const TOKENIZATION_FAILED_MESSAGE: &str =
    "The tokenization failed. Please contact the support.";
pub(crate) const STATISTICS_FAILED_MESSAGE: &str =
    "An error occured during token statistic calculation. Please contact the support.";

/// How a failure was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailureRecord {
    /// The task row is `FAILED` and the user was notified.
    Failed,
    /// The project is gone; nothing was written.
    Abandoned,
}

pub(crate) struct TaskMachine {
    task: TokenizationTask,
    channel: Channel,
}

impl TaskMachine {
    /// Reads the task row through `session`.
    pub(crate) async fn load(
        session: &mut dyn Session,
        project_id: ProjectId,
        task_id: TaskId,
    ) -> Result<Self> {
        let task = session
            .task(project_id, task_id)
            .await?
            .ok_or_else(|| Error::NotFound {
                entity: "task",
                id: task_id.to_string(),
            })?;
        Ok(Self {
            channel: Channel::for_scope(task.scope),
            task,
        })
    }

    #[cfg(test)]
    const fn task(&self) -> &TokenizationTask {
        &self.task
    }

    pub(crate) const fn progress(&self) -> f64 {
        self.task.progress
    }

    /// `CREATED -> IN_PROGRESS`, recording the workload.
    pub(crate) async fn start(
        &mut self,
        session: &mut dyn Session,
        bridge: &ProgressBridge,
        workload: u64,
    ) -> Result<()> {
        self.expect(TaskState::Created, TaskState::InProgress)?;
        let patch = TaskPatch {
            state: Some(TaskState::InProgress),
            workload: Some(workload),
            ..TaskPatch::default()
        };
        self.write(session, patch).await?;
        session.commit().await?;
        bridge
            .state(self.task.project_id, self.channel, TaskState::InProgress)
            .await;
        Ok(())
    }

    /// Moves progress to `progress` and emits a throttled update.
    pub(crate) async fn advance_to(
        &mut self,
        session: &mut dyn Session,
        bridge: &ProgressBridge,
        progress: f64,
    ) -> Result<()> {
        self.expect(TaskState::InProgress, TaskState::InProgress)?;
        let progress = clamp_progress(self.task.progress, progress);
        self.write(session, TaskPatch::progress(progress)).await?;
        session.commit().await?;
        bridge
            .progress(
                self.task.project_id,
                self.channel,
                progress,
                Delivery::Throttled,
            )
            .await;
        Ok(())
    }

    /// `IN_PROGRESS -> FINISHED` with progress 1.0.
    ///
    /// Pending writes of `session` are committed together with the
    /// transition. When `notification` is given it is persisted in the same
    /// commit and announced afterwards.
    pub(crate) async fn finish(
        &mut self,
        session: &mut dyn Session,
        bridge: &ProgressBridge,
        notification: Option<Notification>,
    ) -> Result<()> {
        self.expect(TaskState::InProgress, TaskState::Finished)?;
        let patch = TaskPatch {
            state: Some(TaskState::Finished),
            progress: Some(1.0),
            finished_at: Some(Utc::now()),
            ..TaskPatch::default()
        };
        self.write(session, patch).await?;
        let notify_user = notification.as_ref().map(|n| n.user_id);
        if let Some(notification) = notification {
            session.create_notification(notification).await?;
        }
        session.commit().await?;

        let project_id = self.task.project_id;
        bridge
            .progress(project_id, self.channel, 1.0, Delivery::Immediate)
            .await;
        bridge
            .state(project_id, self.channel, TaskState::Finished)
            .await;
        if let Some(user_id) = notify_user {
            bridge.notification_created(project_id, user_id).await;
        }
        Ok(())
    }

    /// Records a failure. The caller must have rolled back `session` first.
    ///
    /// If the project no longer exists the failure is an expected side
    /// effect of its deletion and nothing is written.
    pub(crate) async fn fail(
        &mut self,
        session: &mut dyn Session,
        bridge: &ProgressBridge,
        message: &str,
        kind: NotificationKind,
    ) -> Result<FailureRecord> {
        let project_id = self.task.project_id;
        let live = session
            .project(project_id)
            .await?
            .is_some_and(|p| p.is_live());
        if !live {
            return Ok(FailureRecord::Abandoned);
        }
        if self.task.state.is_terminal() {
            return Err(Error::InvalidTransition {
                from: self.task.state,
                to: TaskState::Failed,
            });
        }

        self.write(session, TaskPatch::state(TaskState::Failed))
            .await?;
        session
            .create_notification(Notification::new(
                project_id,
                self.task.user_id,
                message,
                NotificationLevel::Error,
                kind,
            ))
            .await?;
        session.commit().await?;

        bridge
            .notification_created(project_id, self.task.user_id)
            .await;
        bridge
            .state(project_id, self.channel, TaskState::Failed)
            .await;
        Ok(FailureRecord::Failed)
    }

    /// Re-reads the row after a session refresh and adopts its state.
    ///
    /// Returns the observed state. A row that disappeared reads as `FAILED`.
    pub(crate) async fn reload(&mut self, session: &mut dyn Session) -> Result<TaskState> {
        match session.task(self.task.project_id, self.task.id).await? {
            Some(row) => {
                self.task.state = row.state;
                Ok(row.state)
            }
            None => Ok(TaskState::Failed),
        }
    }

    async fn write(&mut self, session: &mut dyn Session, patch: TaskPatch) -> Result<()> {
        session
            .update_task(self.task.project_id, self.task.id, patch)
            .await?;
        self.task.apply(&patch);
        Ok(())
    }

    fn expect(&self, from: TaskState, to: TaskState) -> Result<()> {
        if self.task.state == from {
            Ok(())
        } else {
            Err(Error::InvalidTransition {
                from: self.task.state,
                to,
            })
        }
    }
}

/// Keeps progress monotonic and within `[0, 1]`.
pub(crate) fn clamp_progress(current: f64, next: f64) -> f64 {
    let floor = if current.is_nan() {
        0.0
    } else {
        current.clamp(0.0, 1.0)
    };
    if next.is_nan() {
        return floor;
    }
    next.clamp(floor, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        Database, MemoryDatabase, Project, ProjectStatus, RecordingBroadcaster, TaskScope,
    };
    use core::time::Duration;
    use std::sync::Arc;
    use uuid::Uuid;

    struct Fixture {
        db: MemoryDatabase,
        recorder: Arc<RecordingBroadcaster>,
        bridge: ProgressBridge,
        task: TokenizationTask,
    }

    async fn fixture(scope: TaskScope) -> Fixture {
        let db = MemoryDatabase::new();
        let project_id = Uuid::new_v4();
        db.insert_project(Project {
            id: project_id,
            organization_id: Uuid::new_v4(),
            name: "p".to_owned(),
            tokenizer: "en_core_web_sm".to_owned(),
            status: ProjectStatus::Active,
        });
        let task = TokenizationTask::new(project_id, Uuid::new_v4(), scope, None);
        let mut session = db.session().await.unwrap();
        session.insert_task(task.clone()).await.unwrap();
        session.commit().await.unwrap();

        let recorder = Arc::new(RecordingBroadcaster::new());
        let bridge = ProgressBridge::new(recorder.clone(), Duration::from_secs(5));
        Fixture {
            db,
            recorder,
            bridge,
            task,
        }
    }

    #[test]
    fn progress_never_regresses_or_overshoots() {
        assert_eq!(clamp_progress(0.5, 0.3), 0.5);
        assert_eq!(clamp_progress(0.5, 0.7), 0.7);
        assert_eq!(clamp_progress(0.9, 1.2), 1.0);
        assert_eq!(clamp_progress(0.0, f64::NAN), 0.0);
        assert_eq!(clamp_progress(0.0, -1.0), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn full_lifecycle_is_persisted_and_broadcast() {
        let f = fixture(TaskScope::Project).await;
        let mut session = f.db.session().await.unwrap();
        let mut machine = TaskMachine::load(session.as_mut(), f.task.project_id, f.task.id)
            .await
            .unwrap();

        machine.start(session.as_mut(), &f.bridge, 1_200).await.unwrap();
        machine
            .advance_to(session.as_mut(), &f.bridge, 0.417)
            .await
            .unwrap();
        machine
            .advance_to(session.as_mut(), &f.bridge, 0.2)
            .await
            .unwrap();
        assert_eq!(machine.progress(), 0.417);
        machine
            .finish(session.as_mut(), &f.bridge, None)
            .await
            .unwrap();

        let row = &f.db.tasks(f.task.project_id)[0];
        assert_eq!(row.state, TaskState::Finished);
        assert_eq!(row.workload, 1_200);
        assert_eq!(row.progress, 1.0);
        assert!(row.finished_at.is_some());
        assert_eq!(
            f.recorder.messages(f.task.project_id),
            [
                "tokenization:docbin:state:IN_PROGRESS",
                "tokenization:docbin:progress:0.417",
                "tokenization:docbin:progress:1",
                "tokenization:docbin:state:FINISHED",
            ]
        );
    }

    #[tokio::test]
    async fn terminal_states_reject_transitions() {
        let f = fixture(TaskScope::TokenStatistics).await;
        let mut session = f.db.session().await.unwrap();
        let mut machine = TaskMachine::load(session.as_mut(), f.task.project_id, f.task.id)
            .await
            .unwrap();

        assert!(matches!(
            machine.advance_to(session.as_mut(), &f.bridge, 0.5).await,
            Err(Error::InvalidTransition { .. })
        ));
        machine.start(session.as_mut(), &f.bridge, 0).await.unwrap();
        machine.finish(session.as_mut(), &f.bridge, None).await.unwrap();

        assert!(machine.start(session.as_mut(), &f.bridge, 1).await.is_err());
        assert!(machine.finish(session.as_mut(), &f.bridge, None).await.is_err());
        assert!(
            machine
                .fail(
                    session.as_mut(),
                    &f.bridge,
                    STATISTICS_FAILED_MESSAGE,
                    NotificationKind::TokenCreationFailed
                )
                .await
                .is_err()
        );
        assert_eq!(f.db.tasks(f.task.project_id)[0].state, TaskState::Finished);
    }

    #[tokio::test]
    async fn failure_notifies_the_user() {
        let f = fixture(TaskScope::TokenStatistics).await;
        let mut session = f.db.session().await.unwrap();
        let mut machine = TaskMachine::load(session.as_mut(), f.task.project_id, f.task.id)
            .await
            .unwrap();
        machine.start(session.as_mut(), &f.bridge, 3).await.unwrap();

        let record = machine
            .fail(
                session.as_mut(),
                &f.bridge,
                STATISTICS_FAILED_MESSAGE,
                NotificationKind::TokenCreationFailed,
            )
            .await
            .unwrap();

        assert_eq!(record, FailureRecord::Failed);
        assert_eq!(f.db.tasks(f.task.project_id)[0].state, TaskState::Failed);
        let notifications = f.db.notifications(f.task.project_id);
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].level, NotificationLevel::Error);
        assert_eq!(notifications[0].message, STATISTICS_FAILED_MESSAGE);

        let events = f.recorder.events();
        assert!(events[events.len() - 2].global);
        assert_eq!(events[events.len() - 1].message, "tokenization:rats:state:FAILED");
    }

    #[tokio::test]
    async fn failure_after_project_deletion_is_silent() {
        let f = fixture(TaskScope::Project).await;
        let mut session = f.db.session().await.unwrap();
        let mut machine = TaskMachine::load(session.as_mut(), f.task.project_id, f.task.id)
            .await
            .unwrap();
        machine.start(session.as_mut(), &f.bridge, 3).await.unwrap();
        f.db.set_project_status(f.task.project_id, ProjectStatus::InDeletion);

        let record = machine
            .fail(
                session.as_mut(),
                &f.bridge,
                TOKENIZATION_FAILED_MESSAGE,
                NotificationKind::TokenCreationDone,
            )
            .await
            .unwrap();

        assert_eq!(record, FailureRecord::Abandoned);
        assert!(f.db.notifications(f.task.project_id).is_empty());
        assert_eq!(f.recorder.events().len(), 1);
    }

    #[tokio::test]
    async fn reload_observes_external_failure() {
        let f = fixture(TaskScope::Project).await;
        let mut session = f.db.session().await.unwrap();
        let mut machine = TaskMachine::load(session.as_mut(), f.task.project_id, f.task.id)
            .await
            .unwrap();
        machine.start(session.as_mut(), &f.bridge, 3).await.unwrap();

        f.db.patch_task(f.task.id, TaskPatch::state(TaskState::Failed));
        session.refresh().await.unwrap();

        assert_eq!(machine.reload(session.as_mut()).await.unwrap(), TaskState::Failed);
        assert_eq!(machine.task().state, TaskState::Failed);
    }
}
