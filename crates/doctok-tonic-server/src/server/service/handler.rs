//! gRPC surface of the orchestrator.
//!
//! [`TokenizationService`] implements the [`Tokenization`] service from
//! `doctok.proto`. Handlers only parse identifiers and translate results; all
//! validation beyond that happens in [`Orchestrator`]. Bulk RPCs return once
//! the task row exists and the job is queued.

use crate::server::telemetry::{
    increment_record_errors, increment_request_errors, increment_requests,
    record_request_duration,
};
use doctok_tonic_core::{
    Error, Result as CoreResult,
    doctok::{self, Orchestrator, RecordStatus},
    parse_id, parse_optional_id,
    proto::{
        ConfigChangedReply, ConfigChangedRequest, CreateStatisticsRequest, GetTaskRequest,
        ReuploadTokenizerDataReply, ReuploadTokenizerDataRequest, SegmentSentencesReply,
        SegmentSentencesRequest, StatisticsReply, Task, TaskReply, TokenizeAttributeRequest,
        TokenizeProjectRequest, TokenizeRecordReply, TokenizeRecordRequest,
        tokenization_server::Tokenization,
    },
};
use std::time::Instant;
use tonic::{Request, Response, Status};

#[derive(Clone)]
pub struct TokenizationService {
    orchestrator: Orchestrator,
}

impl TokenizationService {
    pub const fn new(orchestrator: Orchestrator) -> Self {
        Self { orchestrator }
    }

    /// Stops accepting work and drains the background jobs.
    pub async fn shutdown(&self) -> Result<(), doctok::Error> {
        self.orchestrator.shutdown().await
    }
}

/// Records the request metrics and converts the outcome into a response.
fn finish<T>(rpc: &'static str, start: Instant, result: CoreResult<T>) -> Result<Response<T>, Status> {
    record_request_duration(rpc, start.elapsed().as_secs_f64() * 1_000.0);
    result.map(Response::new).map_err(|err| {
        increment_request_errors(rpc);
        #[cfg(feature = "tracing")]
        tracing::warn!(rpc, error = %err, "Request failed");
        err.into()
    })
}

#[tonic::async_trait]
impl Tokenization for TokenizationService {
    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all, fields(project_id = %req.get_ref().project_id)))]
    async fn tokenize_project(
        &self,
        req: Request<TokenizeProjectRequest>,
    ) -> Result<Response<TaskReply>, Status> {
        const RPC: &str = "tokenize_project";
        let start = Instant::now();
        increment_requests(RPC);
        let req = req.into_inner();

        let result = async {
            let project_id = parse_id("project_id", &req.project_id)?;
            let user_id = parse_id("user_id", &req.user_id)?;
            let task = self
                .orchestrator
                .start_project_tokenization(
                    project_id,
                    user_id,
                    req.include_statistics,
                    req.only_uploaded,
                )
                .await?;
            Ok::<_, Error>(TaskReply {
                task_id: task.map(|t| t.task_id.to_string()),
            })
        }
        .await;
        finish(RPC, start, result)
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all, fields(project_id = %req.get_ref().project_id)))]
    async fn tokenize_attribute(
        &self,
        req: Request<TokenizeAttributeRequest>,
    ) -> Result<Response<TaskReply>, Status> {
        const RPC: &str = "tokenize_attribute";
        let start = Instant::now();
        increment_requests(RPC);
        let req = req.into_inner();

        let result = async {
            let project_id = parse_id("project_id", &req.project_id)?;
            let user_id = parse_id("user_id", &req.user_id)?;
            let attribute_id = parse_id("attribute_id", &req.attribute_id)?;
            let task = self
                .orchestrator
                .start_attribute_tokenization(
                    project_id,
                    user_id,
                    attribute_id,
                    req.include_statistics,
                )
                .await?;
            Ok::<_, Error>(TaskReply {
                task_id: Some(task.task_id.to_string()),
            })
        }
        .await;
        finish(RPC, start, result)
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all, fields(project_id = %req.get_ref().project_id)))]
    async fn create_statistics(
        &self,
        req: Request<CreateStatisticsRequest>,
    ) -> Result<Response<StatisticsReply>, Status> {
        const RPC: &str = "create_statistics";
        let start = Instant::now();
        increment_requests(RPC);
        let req = req.into_inner();

        let result = async {
            let project_id = parse_id("project_id", &req.project_id)?;
            let user_id = parse_id("user_id", &req.user_id)?;
            let attribute_id = parse_optional_id("attribute_id", req.attribute_id.as_deref())?;
            let started = self
                .orchestrator
                .start_statistics(project_id, user_id, req.only_uploaded, attribute_id)
                .await?;
            Ok::<_, Error>(StatisticsReply::from(started))
        }
        .await;
        finish(RPC, start, result)
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all, fields(record_id = %req.get_ref().record_id)))]
    async fn tokenize_record(
        &self,
        req: Request<TokenizeRecordRequest>,
    ) -> Result<Response<TokenizeRecordReply>, Status> {
        const RPC: &str = "tokenize_record";
        let start = Instant::now();
        increment_requests(RPC);
        let req = req.into_inner();

        let result = async {
            let project_id = parse_id("project_id", &req.project_id)?;
            let record_id = parse_id("record_id", &req.record_id)?;
            let status = self
                .orchestrator
                .tokenize_single_record(project_id, record_id)
                .await;
            if status == RecordStatus::Error {
                increment_record_errors();
            }
            Ok::<_, Error>(TokenizeRecordReply::from(status))
        }
        .await;
        finish(RPC, start, result)
    }

    async fn get_task(&self, req: Request<GetTaskRequest>) -> Result<Response<Task>, Status> {
        const RPC: &str = "get_task";
        let start = Instant::now();
        increment_requests(RPC);
        let req = req.into_inner();

        let result = async {
            let project_id = parse_id("project_id", &req.project_id)?;
            let task_id = parse_id("task_id", &req.task_id)?;
            self.orchestrator
                .task(project_id, task_id)
                .await?
                .map(Task::from)
                .ok_or_else(|| Error::TaskNotFound {
                    task_id: req.task_id.clone(),
                })
        }
        .await;
        finish(RPC, start, result)
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all, fields(project_id = %req.get_ref().project_id)))]
    async fn reupload_tokenizer_data(
        &self,
        req: Request<ReuploadTokenizerDataRequest>,
    ) -> Result<Response<ReuploadTokenizerDataReply>, Status> {
        const RPC: &str = "reupload_tokenizer_data";
        let start = Instant::now();
        increment_requests(RPC);
        let req = req.into_inner();

        let result = async {
            let project_id = parse_id("project_id", &req.project_id)?;
            self.orchestrator.reupload_tokenizer_data(project_id).await?;
            Ok::<_, Error>(ReuploadTokenizerDataReply {})
        }
        .await;
        finish(RPC, start, result)
    }

    async fn config_changed(
        &self,
        _req: Request<ConfigChangedRequest>,
    ) -> Result<Response<ConfigChangedReply>, Status> {
        const RPC: &str = "config_changed";
        let start = Instant::now();
        increment_requests(RPC);
        self.orchestrator.config_changed();
        finish(RPC, start, Ok(ConfigChangedReply {}))
    }

    async fn segment_sentences(
        &self,
        req: Request<SegmentSentencesRequest>,
    ) -> Result<Response<SegmentSentencesReply>, Status> {
        const RPC: &str = "segment_sentences";
        let start = Instant::now();
        increment_requests(RPC);
        let req = req.into_inner();

        let result = self
            .orchestrator
            .segment_sentences(&req.config_id, &req.content)
            .await
            .map(|content| SegmentSentencesReply { content })
            .map_err(Error::from);
        finish(RPC, start, result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{
        config::{CliArgs, ServerConfig},
        service::orchestrator_with,
    };
    use clap::Parser;
    use doctok_tonic_core::doctok::MemoryDatabase;
    use serde_json::json;
    use tonic::Code;
    use uuid::Uuid;

    struct Fixture {
        service: TokenizationService,
        orchestrator: Orchestrator,
        project_id: String,
        record_id: String,
    }

    fn fixture() -> Fixture {
        let project_id = Uuid::new_v4();
        let record_id = Uuid::new_v4();
        let seed = json!({
            "projects": [{
                "id": project_id,
                "organization_id": Uuid::new_v4(),
                "name": "reviews",
                "tokenizer": "en_core_web_sm",
            }],
            "attributes": [{
                "id": Uuid::new_v4(),
                "project_id": project_id,
                "name": "body",
                "data_type": "TEXT",
                "state": "UPLOADED",
                "relative_position": 1,
            }],
            "records": [
                { "id": record_id, "project_id": project_id, "data": { "body": "Works well." } },
                { "id": Uuid::new_v4(), "project_id": project_id, "data": { "body": "Broke quickly." } },
            ],
        });
        let database = MemoryDatabase::from_json(seed.to_string().as_bytes()).unwrap();

        let export_dir = std::env::temp_dir().join(format!("doctok-test-{}", Uuid::new_v4()));
        let args = CliArgs::try_parse_from([
            "doctok-tonic-server",
            "--throttle-secs",
            "0",
            "--export-dir",
            export_dir.to_str().unwrap(),
        ])
        .unwrap();
        let config = ServerConfig::try_from(args).unwrap();

        let orchestrator = orchestrator_with(database, &config);
        Fixture {
            service: TokenizationService::new(orchestrator.clone()),
            orchestrator,
            project_id: project_id.to_string(),
            record_id: record_id.to_string(),
        }
    }

    #[tokio::test]
    async fn project_task_can_be_polled_to_completion() {
        let f = fixture();
        let reply = f
            .service
            .tokenize_project(Request::new(TokenizeProjectRequest {
                project_id: f.project_id.clone(),
                user_id: Uuid::new_v4().to_string(),
                include_statistics: false,
                only_uploaded: false,
            }))
            .await
            .unwrap()
            .into_inner();
        let task_id = reply.task_id.expect("records are waiting");

        f.orchestrator.wait_idle().await;

        let task = f
            .service
            .get_task(Request::new(GetTaskRequest {
                project_id: f.project_id.clone(),
                task_id,
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(task.scope, "PROJECT");
        assert_eq!(task.state, "FINISHED");
        assert_eq!(task.workload, 2);
        assert!(task.finished_at.is_some());
    }

    #[tokio::test]
    async fn malformed_ids_are_invalid_arguments() {
        let f = fixture();
        let status = f
            .service
            .tokenize_project(Request::new(TokenizeProjectRequest {
                project_id: "not-a-uuid".to_owned(),
                user_id: Uuid::new_v4().to_string(),
                include_statistics: false,
                only_uploaded: false,
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);
        assert!(status.message().contains("project_id"));
        assert_eq!(f.orchestrator.active_jobs(), 0);
    }

    #[tokio::test]
    async fn unknown_project_and_task_are_not_found() {
        let f = fixture();
        let status = f
            .service
            .tokenize_project(Request::new(TokenizeProjectRequest {
                project_id: Uuid::new_v4().to_string(),
                user_id: Uuid::new_v4().to_string(),
                include_statistics: true,
                only_uploaded: false,
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::NotFound);

        let status = f
            .service
            .get_task(Request::new(GetTaskRequest {
                project_id: f.project_id.clone(),
                task_id: Uuid::new_v4().to_string(),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::NotFound);
    }

    #[tokio::test]
    async fn single_record_reports_its_status() {
        let f = fixture();
        let reply = f
            .service
            .tokenize_record(Request::new(TokenizeRecordRequest {
                project_id: f.project_id.clone(),
                record_id: f.record_id.clone(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(
            reply.status(),
            doctok_tonic_core::proto::RecordStatus::Ok
        );
    }

    #[tokio::test]
    async fn segmentation_respects_the_allow_list() {
        let f = fixture();
        let reply = f
            .service
            .segment_sentences(Request::new(SegmentSentencesRequest {
                config_id: "en_core_web_sm".to_owned(),
                content: "Setup is easy. Run it!".to_owned(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(reply.content, "Setup is easy.\n\nRun it!");

        let status = f
            .service
            .segment_sentences(Request::new(SegmentSentencesRequest {
                config_id: "xx_unknown".to_owned(),
                content: "Hello.".to_owned(),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::FailedPrecondition);
    }

    #[tokio::test]
    async fn shutdown_makes_bulk_requests_unavailable() {
        let f = fixture();
        f.service.shutdown().await.unwrap();
        let status = f
            .service
            .tokenize_project(Request::new(TokenizeProjectRequest {
                project_id: f.project_id.clone(),
                user_id: Uuid::new_v4().to_string(),
                include_statistics: false,
                only_uploaded: false,
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::Unavailable);
    }
}
