//! Client-side task submission and result retrieval core for a distributed
//! compute grid: a batched submission pipeline, a result-ready
//! waiter/fetcher, an asynchronous result dispatcher, and a retry harness,
//! sitting on top of the `GridSubmission` gRPC service defined in
//! `grid-proto`.

pub mod channel_pool;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod metrics_consts;
pub mod registry;
pub mod result_waiter;
pub mod retry;
pub mod session;
pub mod submitter;

/// Size of the sub-chunks `SubmitTasks` calls are split into within one
/// submission chunk (spec.md §4.3).
pub const SUBMIT_SUB_CHUNK_SIZE: usize = 100;

pub use client::GridClient;
pub use config::{Config, EngineType, FileStorageType, TaskOptions};
pub use error::{GridError, Result};
pub use registry::{InvocationHandler, ResultOutcome};
pub use result_waiter::ResultStatusCollection;
pub use session::SessionContext;
pub use submitter::{SubmittedTask, TaskRequest, WorkerContext};
