use crate::{
    AttributeId, AttributeState, BlobSync, Broadcaster, ConfigCache, ConfigSource, Database, Error,
    Notification, NotificationKind, NotificationLevel, PipelineSettings, PriorityRegistry,
    ProgressBridge, ProjectId, RecordId, RecordStatus, Result, Session, StatisticsStart, TaskId,
    TaskRef, TaskScope, THROTTLE_PERIOD, CONFIG_TTL, TokenizationTask, TokenizerLoader,
    TokenizerProvider, UserId, WorkerPool,
    pipeline::{
        Context, batch, blocking, live_project, release, single, spawn_task, statistics,
        sync_non_text,
    },
    segment_sentences,
    task::STARTED_MESSAGE,
};
use core::time::Duration;
use std::{path::PathBuf, sync::Arc};

/// External systems the orchestrator talks to.
pub struct Collaborators {
    pub database: Arc<dyn Database>,
    pub tokenizer_loader: Arc<dyn TokenizerLoader>,
    pub config_source: Arc<dyn ConfigSource>,
    pub broadcaster: Arc<dyn Broadcaster>,
    pub blob_sync: Arc<dyn BlobSync>,
    pub registry: Arc<dyn PriorityRegistry>,
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Maximum number of concurrently running background jobs.
    pub num_workers: usize,
    /// How long shutdown waits for running jobs before cancelling them.
    pub shutdown_timeout: Duration,
    /// Minimum interval between two progress events of one task kind.
    pub throttle_period: Duration,
    pub config_ttl: Duration,
    /// Root of per-project tokenizer descriptors in managed mode.
    pub inference_dir: Option<PathBuf>,
    pub pipeline: PipelineSettings,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            num_workers: 4,
            shutdown_timeout: Duration::from_secs(30),
            throttle_period: THROTTLE_PERIOD,
            config_ttl: CONFIG_TTL,
            inference_dir: None,
            pipeline: PipelineSettings::default(),
        }
    }
}

/// Entry point for every tokenization request.
///
/// Cheap to clone; all clones share the same worker pool, tokenizer cache and
/// preemption registry.
#[derive(Clone)]
pub struct Orchestrator {
    ctx: Arc<Context>,
}

impl Orchestrator {
    pub fn new(collaborators: Collaborators, config: OrchestratorConfig) -> Self {
        let config_cache = Arc::new(ConfigCache::with_ttl(
            collaborators.config_source,
            config.config_ttl,
        ));
        let mut tokenizers = TokenizerProvider::new(collaborators.tokenizer_loader, config_cache);
        if let Some(dir) = config.inference_dir {
            tokenizers = tokenizers.with_inference_dir(dir);
        }
        let ctx = Context {
            database: collaborators.database,
            tokenizers,
            bridge: ProgressBridge::new(collaborators.broadcaster, config.throttle_period),
            registry: collaborators.registry,
            blob_sync: collaborators.blob_sync,
            pool: WorkerPool::new(config.num_workers, config.shutdown_timeout),
            settings: config.pipeline,
        };
        Self { ctx: Arc::new(ctx) }
    }

    /// Tokenizes every record of the project that has no blob yet.
    ///
    /// Returns `None` when nothing is missing; with `include_statistics` the
    /// statistics pass is requested right away in that case.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] if the project does not exist
    /// - [`Error::ServiceShutdown`] if the service is shutting down
    pub async fn start_project_tokenization(
        &self,
        project_id: ProjectId,
        user_id: UserId,
        include_statistics: bool,
        only_uploaded: bool,
    ) -> Result<Option<TaskRef>> {
        self.ensure_accepting()?;
        let mut session = self.ctx.database.session().await?;
        let created: Result<Option<(TaskRef, u64)>> = async {
            require_project(session.as_mut(), project_id).await?;
            let workload = session
                .count_records_without_tokenization(project_id)
                .await?;
            if workload == 0 {
                return Ok(None);
            }
            let task =
                create_batch_task(session.as_mut(), project_id, user_id, TaskScope::Project, None)
                    .await?;
            Ok(Some((task, workload)))
        }
        .await;
        finish_session(session, created.is_err()).await;

        let Some((task, workload)) = created? else {
            tracing::debug!(%project_id, "No records to tokenize");
            if include_statistics {
                self.start_statistics(project_id, user_id, only_uploaded, None)
                    .await?;
            }
            return Ok(None);
        };

        self.ctx.bridge.notification_created(project_id, user_id).await;
        let job = batch::BatchJob {
            task,
            user_id,
            scope: batch::BatchScope::Project { only_uploaded },
            workload,
            include_statistics,
        };
        let label = format!("tokenize-project:{project_id}");
        let worker = batch::run(Arc::clone(&self.ctx), job);
        spawn_task(&self.ctx, label, task, batch::FAILURE, worker)
            .await
            .map(Some)
    }

    /// Appends one attribute to every existing blob.
    ///
    /// The attribute must exist; whether it is a text attribute is checked by
    /// the worker, which fails the task if it is not.
    pub async fn start_attribute_tokenization(
        &self,
        project_id: ProjectId,
        user_id: UserId,
        attribute_id: AttributeId,
        include_statistics: bool,
    ) -> Result<TaskRef> {
        self.ensure_accepting()?;
        let mut session = self.ctx.database.session().await?;
        let created: Result<(TaskRef, u64)> = async {
            require_project(session.as_mut(), project_id).await?;
            let attribute = session
                .attribute(project_id, attribute_id)
                .await?
                .ok_or_else(|| Error::NotFound {
                    entity: "attribute",
                    id: attribute_id.to_string(),
                })?;
            let workload = session
                .count_records_missing_attribute(project_id, &attribute.name)
                .await?;
            let task = create_batch_task(
                session.as_mut(),
                project_id,
                user_id,
                TaskScope::Attribute,
                Some(attribute.name),
            )
            .await?;
            Ok((task, workload))
        }
        .await;
        finish_session(session, created.is_err()).await;
        let (task, workload) = created?;

        self.ctx.bridge.notification_created(project_id, user_id).await;
        let job = batch::BatchJob {
            task,
            user_id,
            scope: batch::BatchScope::Attribute { attribute_id },
            workload,
            include_statistics,
        };
        let label = format!("tokenize-attribute:{attribute_id}");
        let worker = batch::run(Arc::clone(&self.ctx), job);
        spawn_task(&self.ctx, label, task, batch::FAILURE, worker).await
    }

    /// Computes token statistics for every record that lacks them.
    ///
    /// With `attribute_id` only that attribute is considered; otherwise every
    /// eligible text attribute (or only uploaded ones, with
    /// `only_uploaded`).
    pub async fn start_statistics(
        &self,
        project_id: ProjectId,
        user_id: UserId,
        only_uploaded: bool,
        attribute_id: Option<AttributeId>,
    ) -> Result<StatisticsStart> {
        statistics::start(&self.ctx, project_id, user_id, only_uploaded, attribute_id).await
    }

    /// Tokenizes one record inline. Never fails; errors are logged and
    /// reported as [`RecordStatus::Error`].
    pub async fn tokenize_single_record(
        &self,
        project_id: ProjectId,
        record_id: RecordId,
    ) -> RecordStatus {
        single::tokenize_single_record(&self.ctx, project_id, record_id).await
    }

    /// Reads a task row.
    pub async fn task(
        &self,
        project_id: ProjectId,
        task_id: TaskId,
    ) -> Result<Option<TokenizationTask>> {
        let mut session = self.ctx.database.session().await?;
        let task = session.task(project_id, task_id).await;
        release(session).await;
        task
    }

    /// Pushes the non-text data of every tokenized record to blob storage.
    pub async fn reupload_tokenizer_data(&self, project_id: ProjectId) -> Result<()> {
        let mut session = self.ctx.database.session().await?;
        let uploaded = async {
            let project = require_project(session.as_mut(), project_id).await?;
            let non_text = session
                .non_text_attributes(project_id, AttributeState::SYNCABLE)
                .await?;
            sync_non_text(&self.ctx, session.as_mut(), &project, &non_text).await
        }
        .await;
        release(session).await;
        uploaded
    }

    /// Forgets the cached service configuration.
    pub fn config_changed(&self) {
        tracing::info!("Service config changed, invalidating cache");
        self.ctx.tokenizers.config().invalidate();
    }

    /// Splits `content` into likely sentences, one per paragraph, using the
    /// tokenizer `config_id`.
    pub async fn segment_sentences(&self, config_id: &str, content: &str) -> Result<String> {
        let tokenizer = self.ctx.tokenizers.resolve(config_id).await?;
        let content = content.to_owned();
        blocking(move || segment_sentences(tokenizer.as_ref(), &content)).await
    }

    /// Background jobs that are queued or running.
    pub fn active_jobs(&self) -> usize {
        self.ctx.pool.active()
    }

    /// Waits until no background job is queued or running.
    pub async fn wait_idle(&self) {
        self.ctx.pool.wait_idle().await;
    }

    /// Stops accepting work, drains running jobs and cancels stragglers.
    pub async fn shutdown(&self) -> Result<()> {
        self.ctx.pool.shutdown().await
    }

    fn ensure_accepting(&self) -> Result<()> {
        if self.ctx.pool.is_accepting() {
            Ok(())
        } else {
            Err(Error::ServiceShutdown)
        }
    }
}

async fn require_project(
    session: &mut dyn Session,
    project_id: ProjectId,
) -> Result<crate::Project> {
    live_project(session, project_id)
        .await?
        .ok_or_else(|| Error::NotFound {
            entity: "project",
            id: project_id.to_string(),
        })
}

/// Persists the "started" notification and a `CREATED` task row.
async fn create_batch_task(
    session: &mut dyn Session,
    project_id: ProjectId,
    user_id: UserId,
    scope: TaskScope,
    attribute_name: Option<String>,
) -> Result<TaskRef> {
    session
        .create_notification(Notification::new(
            project_id,
            user_id,
            STARTED_MESSAGE,
            NotificationLevel::Info,
            NotificationKind::TokenCreationStarted,
        ))
        .await?;
    let task = TokenizationTask::new(project_id, user_id, scope, attribute_name);
    let task_ref = task.task_ref();
    session.insert_task(task).await?;
    session.commit().await?;
    Ok(task_ref)
}

async fn finish_session(mut session: Box<dyn Session>, failed: bool) {
    if failed {
        if let Err(e) = session.rollback().await {
            tracing::warn!("Rollback failed: {e}");
        }
    }
    release(session).await;
}
