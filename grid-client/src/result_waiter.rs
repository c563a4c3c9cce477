//! Result readiness waiting and chunked download (spec.md §4.4).
//!
//! `get_result` composes `wait_for_ready` with `TryGetResultStream`'s
//! chunked reassembly; the `data_complete` invariant (spec.md §8) is
//! enforced here rather than left to callers. Streaming reassembly is
//! modeled on `kafka-assigner/tests/grpc_integration.rs`'s `Streaming<T>`
//! consumption loop.

use bytes::{Bytes, BytesMut};
use grid_proto::grid::v1::grid_submission_client::GridSubmissionClient;
use grid_proto::grid::v1::{
    try_get_result_stream_response, wait_for_availability_response, ListResultsRequest,
    ResultStatus, TryGetResultStreamRequest, WaitForAvailabilityRequest,
};
use tracing::debug;

use crate::channel_pool::ChannelPool;
use crate::error::GridError;
use crate::retry::{retry, RetryPolicy};
use crate::session::SessionContext;

/// Partitioning of a batch of result ids by observed status (spec.md §4.4).
#[derive(Debug, Clone, Default)]
pub struct ResultStatusCollection {
    pub ready: Vec<String>,
    pub not_ready: Vec<String>,
    pub errored: Vec<String>,
    /// Ids the server has no record of at all (never created, or purged).
    pub missing: Vec<String>,
}

pub struct ResultWaiter {
    pool: std::sync::Arc<ChannelPool>,
    retry_policy: RetryPolicy,
}

impl ResultWaiter {
    pub fn new(pool: std::sync::Arc<ChannelPool>) -> Self {
        Self::with_retry_policy(pool, RetryPolicy::default().with_whitelist(vec!["TransportTransient"]))
    }

    pub fn with_retry_policy(pool: std::sync::Arc<ChannelPool>, retry_policy: RetryPolicy) -> Self {
        Self { pool, retry_policy }
    }

    /// Blocks (without polling; this rides the server's streaming wait RPC)
    /// until `result_id` is ready, returning an error if it resolved to an
    /// error or aborted outcome instead. The RPC itself is wrapped in the
    /// retry harness over transport errors (spec.md §4.4).
    pub async fn wait_for_ready(&self, session: &SessionContext, result_id: &str) -> Result<(), GridError> {
        let session_id = session.session_id.clone();
        let result_id_owned = result_id.to_string();
        let response = retry(&self.retry_policy, "WaitForAvailability", move |_attempt| {
            let pool = self.pool.clone();
            let session_id = session_id.clone();
            let result_id = result_id_owned.clone();
            async move {
                pool.with_channel(|channel| async move {
                    GridSubmissionClient::new(channel)
                        .wait_for_availability(WaitForAvailabilityRequest { session_id, result_id })
                        .await
                        .map_err(|status| GridError::from_status("WaitForAvailability", status))
                        .map(|r| r.into_inner())
                })
                .await
            }
        })
        .await?;

        match response.outcome {
            Some(wait_for_availability_response::Outcome::Ok(true)) => Ok(()),
            Some(wait_for_availability_response::Outcome::Error(e)) => Err(GridError::ResultInError {
                result_id: result_id.to_string(),
                details: e.details,
            }),
            // NotCompletedTask and None both mean "not ready yet" (spec.md
            // §4.4); only Ok/Error are terminal.
            _ => Err(GridError::ResultNotReady(result_id.to_string())),
        }
    }

    /// Waits for `result_id` then downloads and reassembles it chunk by
    /// chunk, enforcing that the stream ends with a `data_complete` chunk
    /// (spec.md §8).
    pub async fn get_result(&self, session: &SessionContext, result_id: &str) -> Result<Bytes, GridError> {
        self.wait_for_ready(session, result_id).await?;

        let channel = self.pool.lease().await;
        let mut client = GridSubmissionClient::new(channel.clone());
        let mut stream = client
            .try_get_result_stream(TryGetResultStreamRequest {
                session_id: session.session_id.clone(),
                result_id: result_id.to_string(),
            })
            .await
            .map_err(|status| GridError::from_status("TryGetResultStream", status))?
            .into_inner();

        let mut buffer = BytesMut::new();
        let mut completed = false;
        while let Some(message) = futures::StreamExt::next(&mut stream).await {
            let message = message.map_err(|status| GridError::from_status("TryGetResultStream", status))?;
            match message.outcome {
                Some(try_get_result_stream_response::Outcome::Result(chunk)) => {
                    buffer.extend_from_slice(&chunk.data);
                    if chunk.data_complete {
                        completed = true;
                        break;
                    }
                }
                Some(try_get_result_stream_response::Outcome::Error(e)) => {
                    self.pool.release(channel).await;
                    return Err(GridError::ResultInError {
                        result_id: result_id.to_string(),
                        details: e.details,
                    });
                }
                Some(try_get_result_stream_response::Outcome::NotCompletedTask(_)) => {
                    self.pool.release(channel).await;
                    return Err(GridError::ResultNotReady(result_id.to_string()));
                }
                _ => {
                    self.pool.release(channel).await;
                    return Err(GridError::ResultNotReady(result_id.to_string()));
                }
            }
        }
        self.pool.release(channel).await;

        if !completed {
            return Err(GridError::ResultIncomplete(result_id.to_string()));
        }

        debug!(result_id, bytes = buffer.len(), "result downloaded");
        metrics::histogram!(crate::metrics_consts::RESULT_DOWNLOAD_BYTES).record(buffer.len() as f64);
        Ok(buffer.freeze())
    }

    /// Partitions `result_ids` into ready/not-ready/errored/missing via
    /// `ListResults` (spec.md §4.4).
    pub async fn get_result_status(
        &self,
        session: &SessionContext,
        result_ids: &[String],
    ) -> Result<ResultStatusCollection, GridError> {
        let request = ListResultsRequest {
            session_id: session.session_id.clone(),
            result_ids: result_ids.to_vec(),
        };
        let response = self
            .pool
            .with_channel(|channel| async move {
                GridSubmissionClient::new(channel)
                    .list_results(request)
                    .await
                    .map_err(|status| GridError::from_status("ListResults", status))
                    .map(|r| r.into_inner())
            })
            .await?;

        let mut seen = std::collections::HashSet::new();
        let mut collection = ResultStatusCollection::default();
        for summary in response.results {
            seen.insert(summary.result_id.clone());
            // aborted | unspecified -> result-error; ids the server has no
            // record of at all are the only "missing" case (spec.md §4.4).
            match ResultStatus::try_from(summary.status) {
                Ok(ResultStatus::Completed) => collection.ready.push(summary.result_id),
                Ok(ResultStatus::Created) => collection.not_ready.push(summary.result_id),
                Ok(ResultStatus::Aborted) | Ok(ResultStatus::Unspecified) | Err(_) => {
                    collection.errored.push(summary.result_id)
                }
            }
        }
        for id in result_ids {
            if !seen.contains(id) {
                collection.missing.push(id.clone());
            }
        }

        Ok(collection)
    }
}
