//! Metric name constants, read by call sites via the `metrics` crate's
//! macros. Carried even though spec.md's non-goals exclude a full
//! observability layer — the teacher never ships an ambient-concern-free
//! crate (see `feature-flags/src/metrics_consts.rs`).

pub const SUBMIT_TASKS_TOTAL: &str = "grid_client_submit_tasks_total";
pub const SUBMIT_TASKS_FAILED_TOTAL: &str = "grid_client_submit_tasks_failed_total";
pub const RETRY_ATTEMPTS_TOTAL: &str = "grid_client_retry_attempts_total";
pub const RETRY_EXHAUSTED_TOTAL: &str = "grid_client_retry_exhausted_total";
pub const DISPATCHER_PASS_DURATION_SECONDS: &str = "grid_client_dispatcher_pass_duration_seconds";
pub const DISPATCHER_PENDING_RESULTS: &str = "grid_client_dispatcher_pending_results";
pub const RESULT_DOWNLOAD_BYTES: &str = "grid_client_result_download_bytes";
pub const CHANNEL_POOL_LEASES_TOTAL: &str = "grid_client_channel_pool_leases_total";
