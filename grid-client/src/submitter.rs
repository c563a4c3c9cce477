//! Chunked task submission pipeline (spec.md §4.3).
//!
//! Shape: classify payloads by size against the session's server-advertised
//! `chunk_max_size`, route small payloads through `CreateResults(data)` and
//! large payloads through `CreateResultsMetadata` + `UploadResultData`,
//! upload concurrently (bounded by `max_parallel_channels`), then submit
//! tasks in sub-chunks, translating task-level dependencies into result ids
//! via a worker-side `TaskId2OutputId` cache. `EngineType::DataSynapse`
//! sessions use the legacy client-streaming upload path instead.
//!
//! Grounded on `personhog_client.rs`'s typed async wrapper over a generated
//! client for the unary RPCs, and `kafka-assigner/tests/grpc_integration.rs`'s
//! streaming-RPC driving pattern for `CreateLargeTasks`.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use grid_proto::grid::v1::grid_submission_client::GridSubmissionClient;
use grid_proto::grid::v1::{
    create_large_task_request, init_task, CreateLargeTaskRequest, CreateResultsMetadataRequest,
    CreateResultsRequest, GetResultIdsRequest, InitRequest, InitTask, ResultChunk,
    SubmitTasksRequest, TaskCreation, TaskCreationHeader, UploadResultDataRequest,
};
use tracing::{debug, info};

use crate::channel_pool::ChannelPool;
use crate::config::{Config, EngineType, TaskOptions};
use crate::error::GridError;
use crate::retry::{retry, RetryPolicy};
use crate::session::SessionContext;

/// One task to submit: its payload, its dependencies expressed as task ids
/// (translated to result ids before the wire request is built), and the
/// output keys the worker is expected to produce.
#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub payload: Bytes,
    pub dependency_task_ids: Vec<String>,
    /// The result id(s) this task's output is bound to. `None` means the
    /// caller didn't supply one: the submitter allocates a single fresh
    /// result id via `CreateResultsMetadata` before this task is submitted
    /// (spec.md §3 "created either implicitly... or explicitly by the
    /// caller", §4.3 step 2).
    pub expected_output_keys: Option<Vec<String>>,
    pub task_options: Option<TaskOptions>,
    /// When set, one of `expected_output_keys` is also the parent task's
    /// own result, so the caller can await it directly (spec.md §4.3).
    /// Only meaningful for a worker-side [`Submitter`] built with
    /// [`Submitter::for_worker`].
    pub result_for_parent: bool,
}

#[derive(Debug, Clone)]
pub struct SubmittedTask {
    pub task_id: String,
    pub expected_output_ids: Vec<String>,
}

/// Identifies the task currently executing, for the worker-side submitter's
/// dependency translation and `result_for_parent` pattern (spec.md §4.3).
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub parent_task_id: String,
    /// The parent task's own `expected_output_keys`, reused by a child
    /// submission that sets `result_for_parent = true` so the child produces
    /// (one of) the parent's outputs instead of fresh ones.
    pub parent_expected_output_keys: Vec<String>,
}

pub struct Submitter {
    pool: Arc<ChannelPool>,
    config: Config,
    retry_policy: RetryPolicy,
    /// Worker-side cache translating a task id into the result ids it
    /// produced, so later dependents don't need a round trip for every
    /// dependency already resolved locally (spec.md §3, §4.3).
    task_id_to_output_ids: DashMap<String, Vec<String>>,
    worker_context: Option<WorkerContext>,
}

impl Submitter {
    pub fn new(pool: Arc<ChannelPool>, config: Config) -> Self {
        let retry_policy = RetryPolicy::new(config.max_retries_default, config.retry_base_delay())
            .with_whitelist(vec!["TransportTransient"])
            .with_derived_ok(true);
        Self {
            pool,
            config,
            retry_policy,
            task_id_to_output_ids: DashMap::new(),
            worker_context: None,
        }
    }

    /// Builds a submitter for use from inside a running task, enabling
    /// dependency-on-task-id translation and the `result_for_parent`
    /// pattern (spec.md §4.3 "Worker-side submitter").
    pub fn for_worker(pool: Arc<ChannelPool>, config: Config, worker_context: WorkerContext) -> Self {
        let mut submitter = Self::new(pool, config);
        submitter.worker_context = Some(worker_context);
        submitter
    }

    /// Submits every request in `requests`, partitioned into
    /// `chunk_submit_size`-sized chunks processed in order (spec.md §5:
    /// "cross-chunk output ordering preserved").
    pub async fn submit_tasks(
        &self,
        session: &SessionContext,
        requests: Vec<TaskRequest>,
    ) -> Result<Vec<SubmittedTask>, GridError> {
        metrics::counter!(crate::metrics_consts::SUBMIT_TASKS_TOTAL).increment(requests.len() as u64);
        let mut submitted = Vec::with_capacity(requests.len());
        for chunk in requests.chunks(self.config.chunk_submit_size.max(1)) {
            let chunk_results = match session.default_task_options.engine_type {
                EngineType::DataSynapse => self.submit_chunk_legacy(session, chunk).await,
                _ => self.submit_chunk(session, chunk).await,
            };
            let chunk_results = match chunk_results {
                Ok(results) => results,
                Err(err) => {
                    metrics::counter!(crate::metrics_consts::SUBMIT_TASKS_FAILED_TOTAL)
                        .increment(chunk.len() as u64);
                    return Err(err);
                }
            };
            for task in &chunk_results {
                self.task_id_to_output_ids
                    .insert(task.task_id.clone(), task.expected_output_ids.clone());
            }
            submitted.extend(chunk_results);
        }
        Ok(submitted)
    }

    async fn submit_chunk(
        &self,
        session: &SessionContext,
        chunk: &[TaskRequest],
    ) -> Result<Vec<SubmittedTask>, GridError> {
        // Dependencies are translated before any result id is allocated or
        // any payload uploaded: an unknown dependency must fail with no
        // partial state and no task-creation side effects (spec.md §8
        // invariant 2, scenario C).
        let mut data_dependencies = Vec::with_capacity(chunk.len());
        for request in chunk {
            data_dependencies.push(self.resolve_dependencies(&request.dependency_task_ids).await?);
        }

        let (payload_ids, implicit_output_ids) = self.allocate_and_upload_payloads(session, chunk).await?;

        let mut task_creations = Vec::with_capacity(chunk.len());
        for (i, (request, payload_id)) in chunk.iter().zip(payload_ids.into_iter()).enumerate() {
            task_creations.push(TaskCreation {
                payload_id,
                data_dependencies: std::mem::take(&mut data_dependencies[i]),
                expected_output_keys: self.expected_output_keys(request, implicit_output_ids[i].as_deref()),
                task_options: request.task_options.as_ref().map(Into::into),
            });
        }

        let mut submitted = Vec::with_capacity(task_creations.len());
        for sub_chunk in task_creations.chunks(crate::SUBMIT_SUB_CHUNK_SIZE) {
            let session_id = session.session_id.clone();
            let default_options: grid_proto::grid::v1::TaskOptions = (&session.default_task_options).into();
            let sub_chunk = sub_chunk.to_vec();
            let response = retry(&self.retry_policy, "SubmitTasks", move |_attempt| {
                let pool = self.pool.clone();
                let session_id = session_id.clone();
                let default_options = default_options.clone();
                let sub_chunk = sub_chunk.clone();
                async move {
                    pool.with_channel(|channel| async move {
                        GridSubmissionClient::new(channel)
                            .submit_tasks(SubmitTasksRequest {
                                session_id,
                                task_options: Some(default_options),
                                task_creations: sub_chunk,
                            })
                            .await
                            .map_err(|status| GridError::from_status("SubmitTasks", status))
                            .map(|r| r.into_inner())
                    })
                    .await
                }
            })
            .await?;

            submitted.extend(response.tasks.into_iter().map(|t| SubmittedTask {
                task_id: t.task_id,
                expected_output_ids: t.expected_output_ids,
            }));
        }

        info!(count = submitted.len(), "chunk submitted");
        Ok(submitted)
    }

    /// Resolves the `expected_output_keys` a task creation carries:
    /// the caller-supplied list if one was given, or the single
    /// freshly-allocated `implicit_id` otherwise (spec.md §3, §4.3 step 2).
    /// When `result_for_parent` is set on a worker-side submission, the
    /// parent task's own output keys are appended so a child submission can
    /// produce (one of) the parent's results directly (spec.md §4.3).
    fn expected_output_keys(&self, request: &TaskRequest, implicit_id: Option<&str>) -> Vec<String> {
        let mut keys = match &request.expected_output_keys {
            Some(keys) => keys.clone(),
            None => vec![implicit_id
                .expect("submitter allocates an implicit result id for every task without explicit output keys")
                .to_string()],
        };
        if request.result_for_parent {
            if let Some(ctx) = &self.worker_context {
                keys.extend(ctx.parent_expected_output_keys.iter().cloned());
            }
        }
        keys
    }

    /// Allocates payload-ids and uploads payload data for every request in
    /// `chunk`, preserving input order, and — in the same
    /// `CreateResultsMetadata` round trip as the large-payload containers —
    /// allocates a fresh result id for every task whose caller didn't
    /// supply `expected_output_keys` (spec.md §4.3 step 2: "Compute required
    /// new result ids = (tasks whose caller did not supply one) + (large
    /// payloads...). A single CreateResultsMetadata(count) RPC allocates
    /// them all; the returned ids are bound by position."). Small payloads
    /// (at or under `session.chunk_max_size`) go through one batched
    /// `CreateResults(data)` call; large payloads are uploaded individually
    /// via `UploadResultData`, concurrently bounded by `max_parallel_channels`
    /// (spec.md §4.3 steps 2-3, invariant 4).
    ///
    /// Returns `(payload_ids, implicit_output_ids)`: the latter is `Some` at
    /// index `i` exactly when `chunk[i].expected_output_keys` was `None`.
    async fn allocate_and_upload_payloads(
        &self,
        session: &SessionContext,
        chunk: &[TaskRequest],
    ) -> Result<(Vec<String>, Vec<Option<String>>), GridError> {
        let threshold = session.chunk_max_size as usize;
        let mut payload_ids: Vec<Option<String>> = vec![None; chunk.len()];
        let mut implicit_output_ids: Vec<Option<String>> = vec![None; chunk.len()];

        let small_indices: Vec<usize> = chunk
            .iter()
            .enumerate()
            .filter(|(_, r)| r.payload.len() <= threshold)
            .map(|(i, _)| i)
            .collect();
        let large_indices: Vec<usize> = chunk
            .iter()
            .enumerate()
            .filter(|(_, r)| r.payload.len() > threshold)
            .map(|(i, _)| i)
            .collect();
        let implicit_indices: Vec<usize> = chunk
            .iter()
            .enumerate()
            .filter(|(_, r)| r.expected_output_keys.is_none())
            .map(|(i, _)| i)
            .collect();

        if !small_indices.is_empty() {
            let data: Vec<Vec<u8>> = small_indices.iter().map(|&i| chunk[i].payload.to_vec()).collect();
            let session_id = session.session_id.clone();
            let ids = retry(&self.retry_policy, "CreateResults", move |_attempt| {
                let pool = self.pool.clone();
                let session_id = session_id.clone();
                let data = data.clone();
                async move {
                    pool.with_channel(|channel| async move {
                        GridSubmissionClient::new(channel)
                            .create_results(CreateResultsRequest { session_id, data })
                            .await
                            .map_err(|status| GridError::from_status("CreateResults", status))
                            .map(|r| r.into_inner().result_ids)
                    })
                    .await
                }
            })
            .await?;
            for (&i, id) in small_indices.iter().zip(ids.into_iter()) {
                payload_ids[i] = Some(id);
            }
        }

        // spec.md §4.3 step 2: one CreateResultsMetadata(count) call covers
        // both large-payload containers and implicit per-task output ids,
        // bound by position — large-payload slots first, then implicit
        // output-key slots.
        let new_ids_needed = large_indices.len() + implicit_indices.len();
        if new_ids_needed > 0 {
            let session_id = session.session_id.clone();
            let new_ids = retry(&self.retry_policy, "CreateResultsMetadata", move |_attempt| {
                let pool = self.pool.clone();
                let session_id = session_id.clone();
                async move {
                    pool.with_channel(|channel| async move {
                        GridSubmissionClient::new(channel)
                            .create_results_metadata(CreateResultsMetadataRequest {
                                session_id,
                                names: Vec::new(),
                                count: new_ids_needed as u32,
                            })
                            .await
                            .map_err(|status| GridError::from_status("CreateResultsMetadata", status))
                            .map(|r| r.into_inner().results.into_iter().map(|m| m.result_id).collect::<Vec<_>>())
                    })
                    .await
                }
            })
            .await?;

            let split_at = large_indices.len().min(new_ids.len());
            let (large_ids, implicit_ids) = new_ids.split_at(split_at);
            for (&i, id) in large_indices.iter().zip(large_ids.iter()) {
                payload_ids[i] = Some(id.clone());
            }
            for (&i, id) in implicit_indices.iter().zip(implicit_ids.iter()) {
                implicit_output_ids[i] = Some(id.clone());
            }

            let uploads: Vec<(usize, String, Bytes)> = large_indices
                .iter()
                .map(|&i| (i, payload_ids[i].clone().expect("just allocated above"), chunk[i].payload.clone()))
                .collect();

            let uploaded: Vec<Result<(), GridError>> = stream::iter(uploads)
                .map(|(_, result_id, payload)| {
                    let session_id = session.session_id.clone();
                    async move { self.upload_payload(session_id, result_id, payload).await }
                })
                .buffer_unordered(self.config.max_parallel_channels.max(1))
                .collect()
                .await;

            for entry in uploaded {
                entry?;
            }
        }

        let payload_ids = payload_ids
            .into_iter()
            .map(|id| id.expect("every index classified small or large"))
            .collect();
        Ok((payload_ids, implicit_output_ids))
    }

    /// Allocates one fresh result id per task lacking caller-supplied
    /// `expected_output_keys`, for the legacy streaming upload path (which
    /// has no large-payload container to combine this allocation with —
    /// spec.md §9's "Streaming-upload fallback" sends payload bytes directly
    /// in the stream regardless of size).
    async fn allocate_implicit_output_ids(
        &self,
        session: &SessionContext,
        chunk: &[TaskRequest],
    ) -> Result<Vec<Option<String>>, GridError> {
        let implicit_indices: Vec<usize> = chunk
            .iter()
            .enumerate()
            .filter(|(_, r)| r.expected_output_keys.is_none())
            .map(|(i, _)| i)
            .collect();

        let mut out = vec![None; chunk.len()];
        if implicit_indices.is_empty() {
            return Ok(out);
        }

        let session_id = session.session_id.clone();
        let count = implicit_indices.len() as u32;
        let ids = retry(&self.retry_policy, "CreateResultsMetadata", move |_attempt| {
            let pool = self.pool.clone();
            let session_id = session_id.clone();
            async move {
                pool.with_channel(|channel| async move {
                    GridSubmissionClient::new(channel)
                        .create_results_metadata(CreateResultsMetadataRequest {
                            session_id,
                            names: Vec::new(),
                            count,
                        })
                        .await
                        .map_err(|status| GridError::from_status("CreateResultsMetadata", status))
                        .map(|r| r.into_inner().results.into_iter().map(|m| m.result_id).collect::<Vec<_>>())
                })
                .await
            }
        })
        .await?;

        for (&i, id) in implicit_indices.iter().zip(ids.iter()) {
            out[i] = Some(id.clone());
        }
        Ok(out)
    }

    async fn upload_payload(&self, session_id: String, result_id: String, payload: Bytes) -> Result<(), GridError> {
        retry(&self.retry_policy, "UploadResultData", move |_attempt| {
            let pool = self.pool.clone();
            let session_id = session_id.clone();
            let result_id = result_id.clone();
            let payload = payload.clone();
            async move {
                pool.with_channel(|channel| async move {
                    GridSubmissionClient::new(channel)
                        .upload_result_data(UploadResultDataRequest {
                            session_id,
                            result_id,
                            data: payload.to_vec(),
                        })
                        .await
                        .map_err(|status| GridError::from_status("UploadResultData", status))
                        .map(|_| ())
                })
                .await
            }
        })
        .await
    }

    /// Resolves each task id in `task_ids` to its result ids: local
    /// `TaskId2OutputId` cache first, then a single `GetResultIds` round
    /// trip for whatever's missing (spec.md §4.4 "Resolve task-id →
    /// result-id via GetResultIds"). A task id the server has no record of
    /// is always fatal here — `GetResult`/`GetResults` have nothing to fall
    /// back to once a task id fails to resolve.
    pub async fn resolve_task_result_ids(
        &self,
        task_ids: &[String],
    ) -> Result<Vec<(String, Vec<String>)>, GridError> {
        let mut resolved: Vec<(String, Vec<String>)> = Vec::with_capacity(task_ids.len());
        let mut unresolved = Vec::new();

        for task_id in task_ids {
            if let Some(ids) = self.task_id_to_output_ids.get(task_id) {
                resolved.push((task_id.clone(), ids.clone()));
            } else {
                unresolved.push(task_id.clone());
            }
        }

        if !unresolved.is_empty() {
            let response = self
                .pool
                .with_channel(|channel| {
                    let unresolved = unresolved.clone();
                    async move {
                        GridSubmissionClient::new(channel)
                            .get_result_ids(GetResultIdsRequest { task_ids: unresolved })
                            .await
                            .map_err(|status| GridError::from_status("GetResultIds", status))
                            .map(|r| r.into_inner())
                    }
                })
                .await?;

            let mut by_task: std::collections::HashMap<String, Vec<String>> = response
                .mappings
                .into_iter()
                .map(|m| (m.task_id, m.result_ids))
                .collect();

            for task_id in &unresolved {
                match by_task.remove(task_id).filter(|ids| !ids.is_empty()) {
                    Some(ids) => {
                        self.task_id_to_output_ids.insert(task_id.clone(), ids.clone());
                        resolved.push((task_id.clone(), ids));
                    }
                    None => return Err(GridError::DependencyUnknown(task_id.clone())),
                }
            }
        }

        Ok(resolved)
    }

    /// Translates task-level dependencies into result ids: local cache
    /// first, then `GetResultIds` for any miss. A task id that remains
    /// unresolved after that round trip is fatal for this submission
    /// (spec.md §4.3 "a missing key is a fatal DependencyUnknown error";
    /// §8 invariant 2) — only checked when this submitter has a
    /// [`WorkerContext`], since the worker-side translation contract is the
    /// one spec.md ties this to.
    async fn resolve_dependencies(&self, dependency_task_ids: &[String]) -> Result<Vec<String>, GridError> {
        let mut resolved = Vec::with_capacity(dependency_task_ids.len());
        let mut unresolved = Vec::new();

        for task_id in dependency_task_ids {
            if let Some(ids) = self.task_id_to_output_ids.get(task_id) {
                resolved.extend(ids.clone());
            } else {
                unresolved.push(task_id.clone());
            }
        }

        if !unresolved.is_empty() {
            let response = self
                .pool
                .with_channel(|channel| {
                    let unresolved = unresolved.clone();
                    async move {
                        GridSubmissionClient::new(channel)
                            .get_result_ids(GetResultIdsRequest { task_ids: unresolved })
                            .await
                            .map_err(|status| GridError::from_status("GetResultIds", status))
                            .map(|r| r.into_inner())
                    }
                })
                .await?;

            let mut still_missing: std::collections::HashSet<String> = unresolved.iter().cloned().collect();
            for mapping in response.mappings {
                if mapping.result_ids.is_empty() {
                    continue;
                }
                still_missing.remove(&mapping.task_id);
                self.task_id_to_output_ids
                    .insert(mapping.task_id.clone(), mapping.result_ids.clone());
                resolved.extend(mapping.result_ids);
            }

            if self.worker_context.is_some() {
                if let Some(missing) = unresolved.iter().find(|id| still_missing.contains(*id)) {
                    return Err(GridError::DependencyUnknown(missing.clone()));
                }
            }
        }

        Ok(resolved)
    }

    /// Legacy client-streaming submission path for `EngineType::DataSynapse`
    /// sessions (spec.md §4.3, §9). Per spec.md §5, this path serializes on
    /// the single bidirectional stream writer: no concurrent uploads.
    async fn submit_chunk_legacy(
        &self,
        session: &SessionContext,
        chunk: &[TaskRequest],
    ) -> Result<Vec<SubmittedTask>, GridError> {
        // Same ordering as submit_chunk: resolve dependencies before any
        // result id is allocated (spec.md §8 invariant 2).
        let mut data_dependencies = Vec::with_capacity(chunk.len());
        for request in chunk {
            data_dependencies.push(self.resolve_dependencies(&request.dependency_task_ids).await?);
        }

        let implicit_output_ids = self.allocate_implicit_output_ids(session, chunk).await?;
        let mut messages = Vec::new();
        messages.push(CreateLargeTaskRequest {
            kind: Some(create_large_task_request::Kind::InitRequest(InitRequest {
                session_id: session.session_id.clone(),
                task_options: Some((&session.default_task_options).into()),
            })),
        });

        for (i, request) in chunk.iter().enumerate() {
            let data_dependencies = std::mem::take(&mut data_dependencies[i]);
            messages.push(CreateLargeTaskRequest {
                kind: Some(create_large_task_request::Kind::InitTask(InitTask {
                    kind: Some(init_task::Kind::Header(TaskCreationHeader {
                        data_dependencies,
                        expected_output_keys: self
                            .expected_output_keys(request, implicit_output_ids[i].as_deref()),
                        task_options: request.task_options.as_ref().map(Into::into),
                    })),
                })),
            });
            messages.push(CreateLargeTaskRequest {
                kind: Some(create_large_task_request::Kind::DataChunk(ResultChunk {
                    data: request.payload.to_vec(),
                    data_complete: true,
                })),
            });
            debug!(index = i, "queued legacy task creation");
        }
        messages.push(CreateLargeTaskRequest {
            kind: Some(create_large_task_request::Kind::InitTask(InitTask {
                kind: Some(init_task::Kind::LastTask(true)),
            })),
        });

        let response = self
            .pool
            .with_channel(|channel| {
                let messages = messages.clone();
                async move {
                    GridSubmissionClient::new(channel)
                        .create_large_tasks(stream::iter(messages))
                        .await
                        .map_err(|status| GridError::from_status("CreateLargeTasks", status))
                        .map(|r| r.into_inner())
                }
            })
            .await?;

        Ok(response
            .tasks
            .into_iter()
            .map(|t| SubmittedTask {
                task_id: t.task_id,
                expected_output_ids: t.expected_output_ids,
            })
            .collect())
    }
}
