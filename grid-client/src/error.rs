//! Error taxonomy for the grid client.
//!
//! Kinds mirror the propagation policy of the submission/result pipeline:
//! transient transport faults are retried by [`crate::retry`], everything
//! else surfaces to the caller as a typed, named failure.

use thiserror::Error;
use tonic::Code;

/// A result identifier, for errors that need to name one.
pub type ResultId = String;
/// A task identifier, for errors that need to name one.
pub type TaskId = String;

#[derive(Error, Debug, Clone)]
pub enum GridError {
    /// A network or RPC fault the [`crate::retry`] harness treats as
    /// retriable (gRPC `Unavailable`, `DeadlineExceeded`, `Aborted`,
    /// `ResourceExhausted`).
    #[error("transport transient error calling {rpc}: {message}")]
    TransportTransient { rpc: &'static str, message: String },

    /// Authentication, not-found-on-a-resource-we-just-created, or a schema
    /// mismatch. Never retried.
    #[error("transport fatal error calling {rpc}: {message}")]
    TransportFatal { rpc: &'static str, message: String },

    /// A dependency task id has no recorded result id in the worker-side
    /// `TaskId2OutputId` map.
    #[error("dependency task id {0} has no known result id")]
    DependencyUnknown(TaskId),

    /// The server reports the task producing this result errored.
    #[error("result {result_id} is in error: {details:?}")]
    ResultInError {
        result_id: ResultId,
        details: Vec<String>,
    },

    /// A result stream ended without a terminating `data_complete` chunk.
    #[error("result {0} stream ended without a completion marker")]
    ResultIncomplete(ResultId),

    /// Raised only from `Get*` APIs; `TryGet*` APIs instead return `None`.
    #[error("result {0} is not ready yet")]
    ResultNotReady(ResultId),

    /// The session exists but is not in the `running` state.
    #[error("session {session_id} is not openable, status = {status}")]
    SessionNotOpenable { session_id: String, status: String },

    /// All configured retries of a submission stage were exhausted.
    #[error("submission exhausted retries at stage {stage}: {message}")]
    SubmissionExhausted { stage: &'static str, message: String },

    /// Worker-side: the user method named by a task could not be dispatched.
    #[error("method dispatch failed for task {task_id}: {message}")]
    MethodDispatchError { task_id: TaskId, message: String },

    /// A batch operation with more than one partial failure. `primary_cause`
    /// names the first id to fail; `failing_result_ids`/`failing_task_ids`
    /// name every failure in the batch.
    #[error("{} of {} operations failed in batch, first failure: {primary_cause}", failing_result_ids.len() + failing_task_ids.len(), total)]
    ClientResults {
        primary_cause: String,
        failing_result_ids: Vec<ResultId>,
        failing_task_ids: Vec<TaskId>,
        total: usize,
    },
}

impl GridError {
    /// Classifies a `tonic::Status` returned by `rpc` into a transient or
    /// fatal transport error, per spec.md §7's propagation policy.
    pub fn from_status(rpc: &'static str, status: tonic::Status) -> Self {
        if is_transient_code(status.code()) {
            GridError::TransportTransient {
                rpc,
                message: status.message().to_string(),
            }
        } else {
            GridError::TransportFatal {
                rpc,
                message: status.message().to_string(),
            }
        }
    }

    /// Whether the [`crate::retry`] harness should retry this error, given a
    /// whitelist of retriable "kinds" (by discriminant name) and whether
    /// derived kinds are accepted. An empty whitelist means "retry
    /// everything transient-shaped."
    pub fn is_retriable(&self, whitelist: &[&str], derived_ok: bool) -> bool {
        match self {
            GridError::TransportTransient { .. } => {
                whitelist.is_empty() || whitelist.contains(&"TransportTransient")
            }
            GridError::ClientResults { .. } if derived_ok => {
                // (d): an aggregated error is retriable if its primary cause
                // looks like a transient transport failure.
                whitelist.is_empty() || whitelist.contains(&"TransportTransient")
            }
            _ => false,
        }
    }
}

fn is_transient_code(code: Code) -> bool {
    matches!(
        code,
        Code::Unavailable | Code::DeadlineExceeded | Code::Aborted | Code::ResourceExhausted
    )
}

pub type Result<T> = std::result::Result<T, GridError>;
