//! Client configuration, loaded from the environment.
//!
//! Recognizes every key in spec.md §6's "Configuration options" table.
//! Unknown environment variables are tolerated (envconfig simply never
//! reads them); file-storage keys round-trip through `Config` but are never
//! acted on here — file adapters are a named external collaborator (spec.md
//! §1's exclusions), not part of this crate.

use std::str::FromStr;
use std::time::Duration;

use envconfig::Envconfig;

/// The engine type tag on a session, selecting wire-protocol submission
/// mode (spec.md §3, §4.3, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EngineType {
    #[default]
    Symphony,
    Unified,
    DataSynapse,
}

impl FromStr for EngineType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "symphony" => Ok(EngineType::Symphony),
            "unified" => Ok(EngineType::Unified),
            "datasynapse" | "data-synapse" | "data_synapse" => Ok(EngineType::DataSynapse),
            other => Err(format!("unknown engine type: {other}")),
        }
    }
}

impl From<EngineType> for grid_proto::grid::v1::EngineType {
    fn from(value: EngineType) -> Self {
        match value {
            EngineType::Symphony => grid_proto::grid::v1::EngineType::Symphony,
            EngineType::Unified => grid_proto::grid::v1::EngineType::Unified,
            EngineType::DataSynapse => grid_proto::grid::v1::EngineType::DataSynapse,
        }
    }
}

/// File storage backend recognized (but not acted upon) by this crate; the
/// actual file adapters are an external collaborator (spec.md §1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileStorageType {
    #[default]
    Fs,
    S3,
}

impl FromStr for FileStorageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "FS" => Ok(FileStorageType::Fs),
            "S3" => Ok(FileStorageType::S3),
            other => Err(format!("unknown file storage type: {other}")),
        }
    }
}

/// A configuration record carried on session creation and optionally
/// overridden per submission (spec.md §3). Cloned on assignment so mutations
/// don't leak between submissions.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOptions {
    pub max_duration: Duration,
    pub max_retries: u32,
    pub priority: i32,
    pub engine_type: EngineType,
    pub application_name: String,
    pub application_version: String,
    pub application_namespace: String,
    pub application_service: String,
    pub partition_id: Option<String>,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            max_duration: Duration::from_secs(3600),
            max_retries: 3,
            priority: 1,
            engine_type: EngineType::default(),
            application_name: String::new(),
            application_version: String::new(),
            application_namespace: String::new(),
            application_service: String::new(),
            partition_id: None,
        }
    }
}

impl From<&TaskOptions> for grid_proto::grid::v1::TaskOptions {
    fn from(value: &TaskOptions) -> Self {
        grid_proto::grid::v1::TaskOptions {
            max_duration_seconds: value.max_duration.as_secs() as u32,
            max_retries: value.max_retries,
            priority: value.priority,
            engine_type: grid_proto::grid::v1::EngineType::from(value.engine_type) as i32,
            application_name: value.application_name.clone(),
            application_version: value.application_version.clone(),
            application_namespace: value.application_namespace.clone(),
            application_service: value.application_service.clone(),
            partition_id: value.partition_id.clone().unwrap_or_default(),
        }
    }
}

/// Client configuration. Every field maps to one of spec.md §6's recognized
/// keys; `retry_*` and `*_default` fields parameterize the retry harness per
/// spec.md §7 ("Retry budget is the caller-supplied max-retries (default 5);
/// inter-attempt delay is 2s unless a specialized waiter overrides it").
#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(from = "GRID_ENDPOINT", default = "http://127.0.0.1:5001")]
    pub endpoint: String,

    /// Bound on concurrent RPC fan-out within a chunk (payload uploads) and
    /// across the dispatcher's sub-batches. Default 4 per spec.md §5.
    #[envconfig(from = "GRID_MAX_PARALLEL_CHANNELS", default = "4")]
    pub max_parallel_channels: usize,

    /// Size of chunks the submission stream is partitioned into. Default
    /// 500 per spec.md §4.3.
    #[envconfig(from = "GRID_CHUNK_SUBMIT_SIZE", default = "500")]
    pub chunk_submit_size: usize,

    /// Buffer size hint for streaming uploads; not acted on beyond being
    /// threaded to the legacy streaming path's internal buffering.
    #[envconfig(from = "GRID_BUFFER_REQUEST_SIZE", default = "65536")]
    pub buffer_request_size: usize,

    #[envconfig(from = "GRID_MAX_CONCURRENT_BUFFERS", default = "4")]
    pub max_concurrent_buffers: usize,

    /// Recognized but not acted on: file adapters are an external
    /// collaborator (spec.md §1).
    #[envconfig(from = "GRID_FILE_STORAGE_TYPE", default = "FS")]
    pub file_storage_type: FileStorageType,

    #[envconfig(from = "GRID_S3_ACCESS_KEY_ID", default = "")]
    pub s3_access_key_id: String,

    #[envconfig(from = "GRID_S3_SECRET_ACCESS_KEY", default = "")]
    pub s3_secret_access_key: String,

    #[envconfig(from = "GRID_S3_SERVICE_URL", default = "")]
    pub s3_service_url: String,

    #[envconfig(from = "GRID_S3_BUCKET_NAME", default = "")]
    pub s3_bucket_name: String,

    /// Default `max-retries` for submissions that don't override it
    /// (spec.md §7).
    #[envconfig(from = "GRID_MAX_RETRIES_DEFAULT", default = "5")]
    pub max_retries_default: u32,

    /// Inter-attempt delay for the retry harness, milliseconds.
    #[envconfig(from = "GRID_RETRY_BASE_DELAY_MS", default = "2000")]
    pub retry_base_delay_ms: u64,

    #[envconfig(from = "GRID_ENABLE_METRICS", default = "false")]
    pub enable_metrics: bool,
}

impl Config {
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_type_parses_case_insensitively() {
        assert_eq!("Symphony".parse::<EngineType>().unwrap(), EngineType::Symphony);
        assert_eq!("UNIFIED".parse::<EngineType>().unwrap(), EngineType::Unified);
        assert_eq!(
            "data-synapse".parse::<EngineType>().unwrap(),
            EngineType::DataSynapse
        );
        assert!("bogus".parse::<EngineType>().is_err());
    }

    #[test]
    fn file_storage_type_defaults_to_fs() {
        assert_eq!(FileStorageType::default(), FileStorageType::Fs);
    }

    #[test]
    fn task_options_default_has_symphony_engine() {
        let opts = TaskOptions::default();
        assert_eq!(opts.engine_type, EngineType::Symphony);
        assert_eq!(opts.max_retries, 3);
    }
}
