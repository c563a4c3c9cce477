//! Background loop that drains the [`ResultRegistry`], resolving every
//! pending result id and invoking its handler exactly once (spec.md §4.5).
//!
//! Shaped after `hook-worker::worker::WebhookWorker::run`'s poll-loop: a
//! single cooperative task, `tokio_util::sync::CancellationToken`-driven
//! shutdown (the same cancellation idiom `kafka-assigner` uses), and
//! fan-out bounded by `max_parallel_channels`. The idle-poll backoff
//! schedule is this crate's own (spec.md §4.5 specifies the schedule
//! directly; the teacher's worker uses a fixed interval instead).

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::channel_pool::ChannelPool;
use crate::registry::{ResultOutcome, ResultRegistry};
use crate::result_waiter::ResultWaiter;
use crate::session::SessionContext;

const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(100);
const BACKOFF_SCHEDULE: [Duration; 5] = [
    Duration::from_secs(1),
    Duration::from_secs(5),
    Duration::from_secs(10),
    Duration::from_secs(20),
    Duration::from_secs(30),
];
const MAX_BATCH: usize = 10_000;
const SUB_BATCH: usize = 100;

/// Drives the background dispatch loop for one session's registered
/// results.
pub struct DispatcherLoop {
    registry: Arc<ResultRegistry>,
    waiter: Arc<ResultWaiter>,
    session: SessionContext,
    max_parallel_channels: usize,
    cancellation: CancellationToken,
}

impl DispatcherLoop {
    pub fn new(
        registry: Arc<ResultRegistry>,
        pool: Arc<ChannelPool>,
        session: SessionContext,
        max_parallel_channels: usize,
    ) -> Self {
        Self {
            registry,
            waiter: Arc::new(ResultWaiter::new(pool)),
            session,
            max_parallel_channels: max_parallel_channels.max(1),
            cancellation: CancellationToken::new(),
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Runs until cancelled. While the registry is empty, polls every
    /// `IDLE_POLL_INTERVAL`. Once non-empty, each pass resolves whatever
    /// terminal results it can; a pass that resolves nothing new escalates
    /// through `BACKOFF_SCHEDULE`, a pass that resolves at least one result
    /// resets back to the front of the schedule (spec.md §4.5).
    pub async fn run(self: Arc<Self>) {
        let mut backoff_step: usize = 0;
        loop {
            if self.cancellation.is_cancelled() {
                debug!("dispatcher loop cancelled");
                return;
            }

            let pending = self.registry.pending_ids();
            if pending.is_empty() {
                tokio::select! {
                    _ = tokio::time::sleep(IDLE_POLL_INTERVAL) => {}
                    _ = self.cancellation.cancelled() => return,
                }
                continue;
            }

            metrics::gauge!(crate::metrics_consts::DISPATCHER_PENDING_RESULTS).set(pending.len() as f64);
            let pass_start = std::time::Instant::now();

            let batch: Vec<String> = pending.into_iter().take(MAX_BATCH).collect();
            let sub_batches: Vec<Vec<String>> = batch.chunks(SUB_BATCH).map(|s| s.to_vec()).collect();
            let resolved_counts = stream::iter(sub_batches)
                .map(|sub_batch| self.dispatch_sub_batch(sub_batch))
                .buffer_unordered(self.max_parallel_channels)
                .collect::<Vec<usize>>()
                .await;
            let resolved: usize = resolved_counts.into_iter().sum();

            metrics::histogram!(crate::metrics_consts::DISPATCHER_PASS_DURATION_SECONDS)
                .record(pass_start.elapsed().as_secs_f64());

            if resolved > 0 {
                backoff_step = 0;
                continue;
            }

            let base_delay = BACKOFF_SCHEDULE[backoff_step.min(BACKOFF_SCHEDULE.len() - 1)];
            backoff_step = (backoff_step + 1).min(BACKOFF_SCHEDULE.len() - 1);
            // a few hundred ms of jitter so many clients polling the same
            // session don't all wake in lockstep.
            let jitter = Duration::from_millis(rand::random::<u64>() % 250);
            tokio::select! {
                _ = tokio::time::sleep(base_delay + jitter) => {}
                _ = self.cancellation.cancelled() => return,
            }
        }
    }

    /// Polls and resolves one sub-batch, returning how many ids reached a
    /// terminal state this pass (used to drive the back-off schedule).
    async fn dispatch_sub_batch(self: &Arc<Self>, ids: Vec<String>) -> usize {
        let status = match self.waiter.get_result_status(&self.session, &ids).await {
            Ok(status) => status,
            Err(err) => {
                warn!(error = %err, "dispatcher failed to poll result statuses");
                return 0;
            }
        };

        let mut terminal = Vec::new();
        terminal.extend(status.ready.into_iter().map(|id| (id, true)));
        terminal.extend(status.errored.into_iter().map(|id| (id, false)));
        let count = terminal.len();

        stream::iter(terminal)
            .map(|(id, is_ready)| self.resolve_one(id, is_ready))
            .buffer_unordered(self.max_parallel_channels)
            .collect::<Vec<_>>()
            .await;

        count
    }

    async fn resolve_one(self: &Arc<Self>, result_id: String, is_ready: bool) {
        let Some(handler) = self.registry.take(&result_id) else {
            return;
        };

        let outcome = if is_ready {
            match self.waiter.get_result(&self.session, &result_id).await {
                Ok(bytes) => ResultOutcome::Ready(bytes),
                Err(err) => ResultOutcome::Error(err),
            }
        } else {
            match self.waiter.wait_for_ready(&self.session, &result_id).await {
                Err(crate::error::GridError::ResultInError { .. }) => ResultOutcome::Aborted,
                Err(err) => ResultOutcome::Error(err),
                Ok(()) => ResultOutcome::Ready(bytes::Bytes::new()),
            }
        };

        handler.handle(&result_id, outcome).await;
    }
}
