#![allow(dead_code)]

//! In-process mock of the `GridSubmission` service, bound to an ephemeral
//! port. Grounded on `kafka-assigner/tests/common/mod.rs::start_grpc_server`
//! and `personhog-router/tests/common/mod.rs`'s identical pattern.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Once};

use async_trait::async_trait;
use futures::Stream;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::{Request, Response, Status, Streaming};

use grid_proto::grid::v1::grid_submission_server::{GridSubmission, GridSubmissionServer};
use grid_proto::grid::v1::*;

#[derive(Debug, Clone, Default)]
pub struct StoredResult {
    pub data: Option<Vec<u8>>,
    pub status: i32,
}

#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub status: i32,
    pub default_task_options: Option<TaskOptions>,
    pub partition_ids: Vec<String>,
}

#[derive(Default)]
struct Inner {
    sessions: Mutex<HashMap<String, SessionRecord>>,
    results: Mutex<HashMap<String, StoredResult>>,
    tasks: Mutex<HashMap<String, TaskSummary>>,
    task_outputs: Mutex<HashMap<String, Vec<String>>>,
    next_id: AtomicU64,
}

/// A minimal, in-memory stand-in for the grid control plane: enough of
/// `GridSubmission`'s semantics to exercise the client's submission and
/// result-fetch pipelines end to end. Cheap to clone: every clone shares
/// the same backing state, so the test driver and the `tonic` server task
/// observe the same data.
#[derive(Clone, Default)]
pub struct MockGridService(Arc<Inner>);

impl MockGridService {
    pub fn new() -> Self {
        Self::default()
    }

    fn fresh_id(&self, prefix: &str) -> String {
        format!("{prefix}-{}", self.0.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Test helper: marks `result_id` completed with `data`, as if a worker
    /// task had finished and uploaded it.
    pub fn complete_result(&self, result_id: &str, data: Vec<u8>) {
        let mut results = self.0.results.lock().unwrap();
        let entry = results.entry(result_id.to_string()).or_default();
        entry.data = Some(data);
        entry.status = ResultStatus::Completed as i32;
    }

    /// Test helper: marks `result_id` aborted, as if its producing task had
    /// failed irrecoverably.
    pub fn abort_result(&self, result_id: &str) {
        let mut results = self.0.results.lock().unwrap();
        let entry = results.entry(result_id.to_string()).or_default();
        entry.status = ResultStatus::Aborted as i32;
    }

    /// Test helper: overrides a session's status (e.g. to simulate
    /// cancellation) without going through a dedicated RPC.
    pub fn create_session_status_override(&self, session_id: &str, status: i32) {
        if let Some(record) = self.0.sessions.lock().unwrap().get_mut(session_id) {
            record.status = status;
        }
    }

    /// Test helper: counts result ids allocated so far (via `CreateResults`
    /// or `CreateResultsMetadata`), to assert a failed submission consumed
    /// none.
    pub fn result_count(&self) -> usize {
        self.0.results.lock().unwrap().len()
    }
}

#[async_trait]
impl GridSubmission for MockGridService {
    async fn create_session(
        &self,
        request: Request<CreateSessionRequest>,
    ) -> Result<Response<CreateSessionResponse>, Status> {
        let req = request.into_inner();
        let session_id = self.fresh_id("session");
        self.0.sessions.lock().unwrap().insert(
            session_id.clone(),
            SessionRecord {
                status: SessionStatus::Running as i32,
                default_task_options: req.default_task_options,
                partition_ids: req.partition_ids,
            },
        );
        Ok(Response::new(CreateSessionResponse { session_id }))
    }

    async fn get_session(
        &self,
        request: Request<GetSessionRequest>,
    ) -> Result<Response<GetSessionResponse>, Status> {
        let req = request.into_inner();
        let sessions = self.0.sessions.lock().unwrap();
        let record = sessions
            .get(&req.session_id)
            .ok_or_else(|| Status::not_found("unknown session"))?;
        Ok(Response::new(GetSessionResponse {
            session_id: req.session_id,
            status: record.status,
            default_task_options: record.default_task_options.clone(),
            partition_ids: record.partition_ids.clone(),
        }))
    }

    async fn get_service_configuration(
        &self,
        _request: Request<GetServiceConfigurationRequest>,
    ) -> Result<Response<GetServiceConfigurationResponse>, Status> {
        Ok(Response::new(GetServiceConfigurationResponse {
            data_chunk_max_size: 4 * 1024 * 1024,
        }))
    }

    async fn create_results_metadata(
        &self,
        request: Request<CreateResultsMetadataRequest>,
    ) -> Result<Response<CreateResultsMetadataResponse>, Status> {
        let req = request.into_inner();
        let count = if req.names.is_empty() { req.count as usize } else { req.names.len() };
        let mut results = self.0.results.lock().unwrap();
        let mut out = Vec::with_capacity(count);
        for i in 0..count {
            let result_id = self.fresh_id("result");
            results.insert(result_id.clone(), StoredResult::default());
            let name = req.names.get(i).cloned().unwrap_or_default();
            out.push(ResultMetadata { name, result_id });
        }
        Ok(Response::new(CreateResultsMetadataResponse { results: out }))
    }

    async fn create_results(
        &self,
        request: Request<CreateResultsRequest>,
    ) -> Result<Response<CreateResultsResponse>, Status> {
        let req = request.into_inner();
        let mut results = self.0.results.lock().unwrap();
        let mut ids = Vec::with_capacity(req.data.len());
        for data in req.data {
            let result_id = self.fresh_id("result");
            results.insert(
                result_id.clone(),
                StoredResult {
                    data: Some(data),
                    status: ResultStatus::Completed as i32,
                },
            );
            ids.push(result_id);
        }
        Ok(Response::new(CreateResultsResponse { result_ids: ids }))
    }

    async fn upload_result_data(
        &self,
        request: Request<UploadResultDataRequest>,
    ) -> Result<Response<UploadResultDataResponse>, Status> {
        let req = request.into_inner();
        let mut results = self.0.results.lock().unwrap();
        let entry = results
            .get_mut(&req.result_id)
            .ok_or_else(|| Status::not_found("unknown result"))?;
        entry.data = Some(req.data);
        entry.status = ResultStatus::Completed as i32;
        Ok(Response::new(UploadResultDataResponse {}))
    }

    async fn submit_tasks(
        &self,
        request: Request<SubmitTasksRequest>,
    ) -> Result<Response<SubmitTasksResponse>, Status> {
        let req = request.into_inner();
        let mut tasks = self.0.tasks.lock().unwrap();
        let mut task_outputs = self.0.task_outputs.lock().unwrap();
        let mut created = Vec::with_capacity(req.task_creations.len());
        for creation in req.task_creations {
            let task_id = self.fresh_id("task");
            let output_ids: Vec<String> = creation
                .expected_output_keys
                .iter()
                .map(|_| self.fresh_id("result"))
                .collect();
            {
                let mut results = self.0.results.lock().unwrap();
                for id in &output_ids {
                    results.entry(id.clone()).or_default();
                }
            }
            tasks.insert(
                task_id.clone(),
                TaskSummary {
                    task_id: task_id.clone(),
                    status: TaskStatus::Submitted as i32,
                    session_id: req.session_id.clone(),
                },
            );
            task_outputs.insert(task_id.clone(), output_ids.clone());
            created.push(CreatedTask {
                task_id,
                expected_output_ids: output_ids,
            });
        }
        Ok(Response::new(SubmitTasksResponse { tasks: created }))
    }

    async fn get_result_ids(
        &self,
        request: Request<GetResultIdsRequest>,
    ) -> Result<Response<GetResultIdsResponse>, Status> {
        let req = request.into_inner();
        let task_outputs = self.0.task_outputs.lock().unwrap();
        let mappings = req
            .task_ids
            .into_iter()
            .map(|task_id| {
                let result_ids = task_outputs.get(&task_id).cloned().unwrap_or_default();
                TaskResultMapping { task_id, result_ids }
            })
            .collect();
        Ok(Response::new(GetResultIdsResponse { mappings }))
    }

    async fn list_results(
        &self,
        request: Request<ListResultsRequest>,
    ) -> Result<Response<ListResultsResponse>, Status> {
        let req = request.into_inner();
        let results = self.0.results.lock().unwrap();
        let summaries = req
            .result_ids
            .into_iter()
            .filter_map(|result_id| {
                results.get(&result_id).map(|r| ResultSummary {
                    result_id,
                    status: r.status,
                })
            })
            .collect();
        Ok(Response::new(ListResultsResponse { results: summaries }))
    }

    async fn wait_for_completion(
        &self,
        _request: Request<WaitForCompletionRequest>,
    ) -> Result<Response<WaitForCompletionResponse>, Status> {
        Ok(Response::new(WaitForCompletionResponse {}))
    }

    async fn wait_for_availability(
        &self,
        request: Request<WaitForAvailabilityRequest>,
    ) -> Result<Response<WaitForAvailabilityResponse>, Status> {
        let req = request.into_inner();
        let results = self.0.results.lock().unwrap();
        let outcome = match results.get(&req.result_id) {
            Some(r) if r.status == ResultStatus::Completed as i32 => {
                wait_for_availability_response::Outcome::Ok(true)
            }
            Some(r) if r.status == ResultStatus::Aborted as i32 => {
                wait_for_availability_response::Outcome::Error(ResultError {
                    result_id: req.result_id.clone(),
                    details: vec!["task aborted".to_string()],
                })
            }
            _ => wait_for_availability_response::Outcome::None(true),
        };
        Ok(Response::new(WaitForAvailabilityResponse { outcome: Some(outcome) }))
    }

    type TryGetResultStreamStream =
        Pin<Box<dyn Stream<Item = Result<TryGetResultStreamResponse, Status>> + Send + 'static>>;

    async fn try_get_result_stream(
        &self,
        request: Request<TryGetResultStreamRequest>,
    ) -> Result<Response<Self::TryGetResultStreamStream>, Status> {
        let req = request.into_inner();
        let (status, data) = {
            let results = self.0.results.lock().unwrap();
            match results.get(&req.result_id) {
                Some(r) => (r.status, r.data.clone()),
                None => (0, None),
            }
        };

        let outcome = if status == ResultStatus::Aborted as i32 {
            try_get_result_stream_response::Outcome::Error(ResultError {
                result_id: req.result_id.clone(),
                details: vec!["task aborted".to_string()],
            })
        } else if let Some(data) = data {
            try_get_result_stream_response::Outcome::Result(ResultChunk {
                data,
                data_complete: true,
            })
        } else {
            try_get_result_stream_response::Outcome::None(true)
        };

        let stream = futures::stream::once(async move {
            Ok(TryGetResultStreamResponse { outcome: Some(outcome) })
        });
        Ok(Response::new(Box::pin(stream)))
    }

    async fn get_task_status(
        &self,
        request: Request<GetTaskStatusRequest>,
    ) -> Result<Response<GetTaskStatusResponse>, Status> {
        let req = request.into_inner();
        let tasks = self.0.tasks.lock().unwrap();
        let statuses = req
            .task_ids
            .into_iter()
            .filter_map(|task_id| {
                tasks.get(&task_id).map(|t| TaskStatusEntry {
                    task_id,
                    status: t.status,
                })
            })
            .collect();
        Ok(Response::new(GetTaskStatusResponse { statuses }))
    }

    async fn try_get_task_output(
        &self,
        request: Request<TryGetTaskOutputRequest>,
    ) -> Result<Response<TryGetTaskOutputResponse>, Status> {
        let req = request.into_inner();
        let tasks = self.0.tasks.lock().unwrap();
        let outcome = match tasks.get(&req.task_id) {
            Some(t) if t.status == TaskStatus::Completed as i32 => {
                try_get_task_output_response::Outcome::Ok(true)
            }
            _ => try_get_task_output_response::Outcome::Ok(false),
        };
        Ok(Response::new(TryGetTaskOutputResponse { outcome: Some(outcome) }))
    }

    async fn list_tasks(
        &self,
        request: Request<ListTasksRequest>,
    ) -> Result<Response<ListTasksResponse>, Status> {
        let req = request.into_inner();
        let session_id = req.filter.map(|f| f.session_id).unwrap_or_default();
        let tasks = self.0.tasks.lock().unwrap();
        let summaries = tasks
            .values()
            .filter(|t| session_id.is_empty() || t.session_id == session_id)
            .cloned()
            .collect();
        Ok(Response::new(ListTasksResponse { tasks: summaries }))
    }

    async fn get_task(
        &self,
        request: Request<GetTaskRequest>,
    ) -> Result<Response<GetTaskResponse>, Status> {
        let req = request.into_inner();
        let tasks = self.0.tasks.lock().unwrap();
        Ok(Response::new(GetTaskResponse {
            task: tasks.get(&req.task_id).cloned(),
        }))
    }

    async fn create_large_tasks(
        &self,
        request: Request<Streaming<CreateLargeTaskRequest>>,
    ) -> Result<Response<CreateLargeTaskReply>, Status> {
        let mut stream = request.into_inner();
        let mut pending_header: Option<TaskCreationHeader> = None;
        let mut created = Vec::new();
        let mut session_id = String::new();

        while let Some(message) = stream.message().await? {
            match message.kind {
                Some(create_large_task_request::Kind::InitRequest(init)) => {
                    session_id = init.session_id;
                }
                Some(create_large_task_request::Kind::InitTask(init_task)) => match init_task.kind {
                    Some(init_task::Kind::Header(header)) => pending_header = Some(header),
                    Some(init_task::Kind::LastTask(_)) => break,
                    None => {}
                },
                Some(create_large_task_request::Kind::DataChunk(_chunk)) => {
                    if let Some(header) = pending_header.take() {
                        let task_id = self.fresh_id("task");
                        let output_ids: Vec<String> = header
                            .expected_output_keys
                            .iter()
                            .map(|_| self.fresh_id("result"))
                            .collect();
                        self.0.tasks.lock().unwrap().insert(
                            task_id.clone(),
                            TaskSummary {
                                task_id: task_id.clone(),
                                status: TaskStatus::Submitted as i32,
                                session_id: session_id.clone(),
                            },
                        );
                        self.0
                            .task_outputs
                            .lock()
                            .unwrap()
                            .insert(task_id.clone(), output_ids.clone());
                        created.push(CreatedTask {
                            task_id,
                            expected_output_ids: output_ids,
                        });
                    }
                }
                None => {}
            }
        }

        Ok(Response::new(CreateLargeTaskReply { tasks: created }))
    }
}

pub struct GrpcTestServer {
    pub addr: SocketAddr,
    pub service: MockGridService,
    server_task: JoinHandle<()>,
}

impl GrpcTestServer {
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }
}

static TRACING_INIT: Once = Once::new();

/// Installs a test-scoped subscriber so `tracing` output from the crate
/// under test surfaces in `cargo test`'s captured output (grounded on
/// `capture/tests/common.rs::setup_tracing`).
pub fn setup_tracing() {
    TRACING_INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_writer(tracing_subscriber::fmt::TestWriter::new())
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .init();
    });
}

pub async fn start_grpc_server() -> GrpcTestServer {
    setup_tracing();
    let service = MockGridService::new();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server_service = service.clone();
    let server_task = tokio::spawn(async move {
        tonic::transport::Server::builder()
            .add_service(GridSubmissionServer::new(server_service))
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await
            .unwrap();
    });

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    GrpcTestServer { addr, service, server_task }
}
