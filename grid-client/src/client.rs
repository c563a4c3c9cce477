//! Public caller surface (spec.md §6): the facade composing every
//! subsystem into the API an application actually calls.
//!
//! Shaped after the teacher's top-level composition pattern (`feature-flags`
//! wiring its cache, database pool, and cohort client into one struct passed
//! through request handlers): `GridClient` owns one of each subsystem and
//! every public method is a thin, typed wrapper over them.

use std::sync::Arc;

use bytes::Bytes;
use grid_proto::grid::v1::grid_submission_client::GridSubmissionClient;
use grid_proto::grid::v1::{
    try_get_task_output_response, CreateResultsMetadataRequest, GetTaskRequest,
    GetTaskStatusRequest, ListTasksRequest, TaskFilter, TaskSort, TaskStatus,
    TryGetTaskOutputRequest,
};

use crate::channel_pool::ChannelPool;
use crate::config::{Config, TaskOptions};
use crate::dispatcher::DispatcherLoop;
use crate::error::GridError;
use crate::registry::{InvocationHandler, ResultRegistry};
use crate::result_waiter::{ResultStatusCollection, ResultWaiter};
use crate::session::SessionContext;
use crate::submitter::{SubmittedTask, Submitter, TaskRequest, WorkerContext};

/// The SDK's entry point: one session, its submission pipeline, its result
/// waiter, and its background dispatcher.
pub struct GridClient {
    pool: Arc<ChannelPool>,
    session: SessionContext,
    submitter: Submitter,
    waiter: Arc<ResultWaiter>,
    registry: Arc<ResultRegistry>,
    dispatcher: Arc<DispatcherLoop>,
}

impl GridClient {
    /// Creates a new session against `config.endpoint` and starts its
    /// background dispatcher.
    pub async fn new(config: Config, default_task_options: TaskOptions) -> Result<Self, GridError> {
        let pool = Arc::new(ChannelPool::new(&config.endpoint, config.max_parallel_channels)?);
        let session = SessionContext::create(&pool, default_task_options, Vec::new()).await?;
        Ok(Self::from_session(pool, config, session, None))
    }

    /// Opens an existing session instead of creating a new one.
    pub async fn open(config: Config, session_id: impl Into<String>) -> Result<Self, GridError> {
        let pool = Arc::new(ChannelPool::new(&config.endpoint, config.max_parallel_channels)?);
        let session = SessionContext::open(&pool, session_id).await?;
        Ok(Self::from_session(pool, config, session, None))
    }

    /// Opens an existing session from inside a running task's execution
    /// (spec.md §4.3 "Worker-side submitter"): submissions on the resulting
    /// client translate task-id dependencies through `worker_context` and
    /// honor `TaskRequest::result_for_parent`.
    pub async fn open_for_worker(
        config: Config,
        session_id: impl Into<String>,
        worker_context: WorkerContext,
    ) -> Result<Self, GridError> {
        let pool = Arc::new(ChannelPool::new(&config.endpoint, config.max_parallel_channels)?);
        let session = SessionContext::open(&pool, session_id).await?;
        Ok(Self::from_session(pool, config, session, Some(worker_context)))
    }

    fn from_session(
        pool: Arc<ChannelPool>,
        config: Config,
        session: SessionContext,
        worker_context: Option<WorkerContext>,
    ) -> Self {
        let registry = Arc::new(ResultRegistry::new());
        let waiter = Arc::new(ResultWaiter::new(pool.clone()));
        let submitter = match worker_context {
            Some(ctx) => Submitter::for_worker(pool.clone(), config.clone(), ctx),
            None => Submitter::new(pool.clone(), config.clone()),
        };
        let dispatcher = Arc::new(DispatcherLoop::new(
            registry.clone(),
            pool.clone(),
            session.clone(),
            config.max_parallel_channels,
        ));
        tokio::spawn(dispatcher.clone().run());

        Self {
            pool,
            session,
            submitter,
            waiter,
            registry,
            dispatcher,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session.session_id
    }

    /// Stops the background dispatcher. Pending handlers are never invoked
    /// after this.
    pub fn shutdown(&self) {
        self.dispatcher.cancellation_token().cancel();
    }

    /// `SubmitTask(bytes) → task-id` (spec.md §6): the SDK allocates the
    /// task's single result id, since the caller supplied none.
    pub async fn submit_task(&self, payload: Bytes) -> Result<SubmittedTask, GridError> {
        self.submit_task_with_dependencies(payload, Vec::new()).await
    }

    pub async fn submit_task_with_dependencies(
        &self,
        payload: Bytes,
        dependency_task_ids: Vec<String>,
    ) -> Result<SubmittedTask, GridError> {
        let mut tasks = self
            .submit_tasks_raw(vec![TaskRequest {
                payload,
                dependency_task_ids,
                expected_output_keys: None,
                task_options: None,
                result_for_parent: false,
            }])
            .await?;
        tasks.pop().ok_or_else(|| GridError::SubmissionExhausted {
            stage: "SubmitTasks",
            message: "server returned no tasks for a single-task submission".to_string(),
        })
    }

    pub async fn submit_tasks(&self, payloads: Vec<Bytes>) -> Result<Vec<SubmittedTask>, GridError> {
        let requests = payloads
            .into_iter()
            .map(|payload| TaskRequest {
                payload,
                dependency_task_ids: Vec::new(),
                expected_output_keys: None,
                task_options: None,
                result_for_parent: false,
            })
            .collect();
        self.submit_tasks_raw(requests).await
    }

    /// `SubmitTasksWithDependencies([(bytes, [dependency-task-id])],
    /// resultForParent?) → [task-id]` (spec.md §6). `result_for_parent` is
    /// only meaningful on a client opened via
    /// [`GridClient::open_for_worker`] (spec.md §4.3).
    pub async fn submit_tasks_with_dependencies(
        &self,
        requests: Vec<(Bytes, Vec<String>)>,
        result_for_parent: bool,
    ) -> Result<Vec<SubmittedTask>, GridError> {
        let requests = requests
            .into_iter()
            .map(|(payload, dependency_task_ids)| TaskRequest {
                payload,
                dependency_task_ids,
                expected_output_keys: None,
                task_options: None,
                result_for_parent,
            })
            .collect();
        self.submit_tasks_raw(requests).await
    }

    /// Escape hatch for callers that pre-allocated their own result ids via
    /// [`GridClient::create_results_metadata`] and want to bind them as
    /// `expected_output_keys` explicitly, or that need per-task
    /// [`crate::config::TaskOptions`] overrides.
    pub async fn submit_tasks_raw(&self, requests: Vec<TaskRequest>) -> Result<Vec<SubmittedTask>, GridError> {
        self.submitter.submit_tasks(&self.session, requests).await
    }

    /// Registers `handler` to be invoked by the background dispatcher once
    /// `result_id` reaches a terminal state (spec.md §4.5).
    pub fn on_result_ready(&self, result_id: impl Into<String>, handler: Arc<dyn InvocationHandler>) {
        self.registry.register(result_id, handler);
    }

    /// Polls until every id in `result_ids` is ready or errored (spec.md
    /// §4.4), sequentially so failures are reported for the first id that
    /// isn't ready.
    pub async fn wait_for_tasks_completion(&self, result_ids: &[String]) -> Result<(), GridError> {
        let mut failing = Vec::new();
        for id in result_ids {
            if let Err(err) = self.waiter.wait_for_ready(&self.session, id).await {
                failing.push((id.clone(), err));
            }
        }
        if failing.is_empty() {
            Ok(())
        } else if failing.len() == 1 {
            Err(failing.into_iter().next().unwrap().1)
        } else {
            let primary_cause = failing[0].1.to_string();
            Err(GridError::ClientResults {
                primary_cause,
                failing_result_ids: failing.into_iter().map(|(id, _)| id).collect(),
                failing_task_ids: Vec::new(),
                total: result_ids.len(),
            })
        }
    }

    /// `GetResult(task-id) → bytes` (spec.md §6). Resolves `task_id` to its
    /// result id via `GetResultIds` before waiting and downloading (spec.md
    /// §4.4 step 1), so a caller only ever needs to hold the task id
    /// `submit_task` returned.
    pub async fn get_result(&self, task_id: &str) -> Result<Bytes, GridError> {
        let result_id = self.resolve_single_result_id(task_id).await?;
        self.waiter.get_result(&self.session, &result_id).await
    }

    /// `GetResults([task-id]) → [(task-id, bytes)]` (spec.md §6).
    pub async fn get_results(&self, task_ids: &[String]) -> Result<Vec<(String, Bytes)>, GridError> {
        let resolved = self.submitter.resolve_task_result_ids(task_ids).await?;

        let mut results = Vec::with_capacity(resolved.len());
        let mut failing_task_ids = Vec::new();
        let mut primary_cause = None;
        for (task_id, result_ids) in resolved {
            let Some(result_id) = result_ids.into_iter().next() else {
                continue;
            };
            match self.waiter.get_result(&self.session, &result_id).await {
                Ok(bytes) => results.push((task_id, bytes)),
                Err(err) => {
                    if primary_cause.is_none() {
                        primary_cause = Some(err.to_string());
                    }
                    failing_task_ids.push(task_id);
                }
            }
        }
        if failing_task_ids.is_empty() {
            Ok(results)
        } else {
            Err(GridError::ClientResults {
                primary_cause: primary_cause.unwrap_or_default(),
                total: task_ids.len(),
                failing_result_ids: Vec::new(),
                failing_task_ids,
            })
        }
    }

    /// Non-blocking variant of `get_result`: `Ok(None)` when the result
    /// isn't ready yet instead of an error (spec.md §7).
    pub async fn try_get_result(&self, task_id: &str) -> Result<Option<Bytes>, GridError> {
        let result_id = self.resolve_single_result_id(task_id).await?;
        match self.waiter.get_result(&self.session, &result_id).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(GridError::ResultNotReady(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Resolves `task_id` to the first result id in its `GetResultIds`
    /// mapping (spec.md §4.4 step 1). Tasks submitted with more than one
    /// expected output key should fetch via `expected_output_ids` and
    /// [`ResultWaiter`] directly instead of this singular-result path.
    async fn resolve_single_result_id(&self, task_id: &str) -> Result<String, GridError> {
        let task_ids = vec![task_id.to_string()];
        let mut resolved = self.submitter.resolve_task_result_ids(&task_ids).await?;
        let (_, mut result_ids) = resolved.pop().expect("resolve_task_result_ids returns one entry per input");
        result_ids
            .pop()
            .ok_or_else(|| GridError::DependencyUnknown(task_id.to_string()))
    }

    pub async fn get_result_status(&self, result_ids: &[String]) -> Result<ResultStatusCollection, GridError> {
        self.waiter.get_result_status(&self.session, result_ids).await
    }

    /// Preallocates `count` anonymous result ids (spec.md §6's caller
    /// surface names this directly, letting a caller fetch handles for
    /// results it will upload or populate itself).
    pub async fn create_results_metadata(&self, count: u32) -> Result<Vec<String>, GridError> {
        let session_id = self.session.session_id.clone();
        let response = self
            .pool
            .with_channel(|channel| async move {
                GridSubmissionClient::new(channel)
                    .create_results_metadata(CreateResultsMetadataRequest {
                        session_id,
                        names: Vec::new(),
                        count,
                    })
                    .await
                    .map_err(|status| GridError::from_status("CreateResultsMetadata", status))
                    .map(|r| r.into_inner())
            })
            .await?;

        Ok(response.results.into_iter().map(|m| m.result_id).collect())
    }

    pub async fn get_task_status(&self, task_ids: &[String]) -> Result<Vec<(String, TaskStatus)>, GridError> {
        let task_ids = task_ids.to_vec();
        let response = self
            .pool
            .with_channel(|channel| async move {
                GridSubmissionClient::new(channel)
                    .get_task_status(GetTaskStatusRequest { task_ids })
                    .await
                    .map_err(|status| GridError::from_status("GetTaskStatus", status))
                    .map(|r| r.into_inner())
            })
            .await?;

        Ok(response
            .statuses
            .into_iter()
            .map(|entry| {
                let status = TaskStatus::try_from(entry.status).unwrap_or(TaskStatus::Unspecified);
                (entry.task_id, status)
            })
            .collect())
    }

    /// Supplemented (spec.md §6 names it without detailing it, §10):
    /// `TryGetTaskOutput`, mapping the oneof outcome to `Ok(None)` for
    /// "not produced yet" and an error for a real failure.
    pub async fn get_task_output_info(&self, task_id: &str) -> Result<Option<()>, GridError> {
        let task_id_owned = task_id.to_string();
        let response = self
            .pool
            .with_channel(|channel| async move {
                GridSubmissionClient::new(channel)
                    .try_get_task_output(TryGetTaskOutputRequest { task_id: task_id_owned })
                    .await
                    .map_err(|status| GridError::from_status("TryGetTaskOutput", status))
                    .map(|r| r.into_inner())
            })
            .await?;

        match response.outcome {
            Some(try_get_task_output_response::Outcome::Ok(true)) => Ok(Some(())),
            Some(try_get_task_output_response::Outcome::Error(e)) => Err(GridError::ResultInError {
                result_id: task_id.to_string(),
                details: e.details,
            }),
            _ => Ok(None),
        }
    }

    /// Supplemented (spec.md §10): thin passthrough, no additional
    /// client-side invariant governs listing.
    pub async fn list_tasks(
        &self,
        statuses: Vec<TaskStatus>,
        ascending: bool,
    ) -> Result<Vec<(String, TaskStatus)>, GridError> {
        let session_id = self.session.session_id.clone();
        let response = self
            .pool
            .with_channel(|channel| async move {
                GridSubmissionClient::new(channel)
                    .list_tasks(ListTasksRequest {
                        filter: Some(TaskFilter {
                            session_id,
                            statuses: statuses.into_iter().map(|s| s as i32).collect(),
                        }),
                        sort: Some(TaskSort { ascending }),
                    })
                    .await
                    .map_err(|status| GridError::from_status("ListTasks", status))
                    .map(|r| r.into_inner())
            })
            .await?;

        Ok(response
            .tasks
            .into_iter()
            .map(|t| {
                let status = TaskStatus::try_from(t.status).unwrap_or(TaskStatus::Unspecified);
                (t.task_id, status)
            })
            .collect())
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Option<(String, TaskStatus)>, GridError> {
        let task_id_owned = task_id.to_string();
        let response = self
            .pool
            .with_channel(|channel| async move {
                GridSubmissionClient::new(channel)
                    .get_task(GetTaskRequest { task_id: task_id_owned })
                    .await
                    .map_err(|status| GridError::from_status("GetTask", status))
                    .map(|r| r.into_inner())
            })
            .await?;

        Ok(response.task.map(|t| {
            let status = TaskStatus::try_from(t.status).unwrap_or(TaskStatus::Unspecified);
            (t.task_id, status)
        }))
    }
}

impl Drop for GridClient {
    fn drop(&mut self) {
        self.dispatcher.cancellation_token().cancel();
    }
}
