//! Session lifecycle: creation and open/validate against the `running`
//! status (spec.md §4.6).
//!
//! Shaped after `personhog_client.rs`'s typed async wrapper over a generated
//! tonic client: one method per RPC, tonic errors mapped through
//! [`GridError::from_status`] rather than propagated raw.

use grid_proto::grid::v1::grid_submission_client::GridSubmissionClient;
use grid_proto::grid::v1::{
    CreateSessionRequest, GetServiceConfigurationRequest, GetSessionRequest, SessionStatus,
};
use tracing::debug;

use crate::channel_pool::ChannelPool;
use crate::config::TaskOptions;
use crate::error::GridError;

/// Fallback payload-size threshold when a server doesn't (yet) answer
/// `GetServiceConfiguration`, or answers with `0` (spec.md §3 defines the
/// small/large split purely in terms of the server-advertised value, but a
/// client still needs a sane default to classify payloads before that first
/// round trip completes).
pub const DEFAULT_CHUNK_MAX_SIZE: u64 = 64 * 1024;

/// An opened session: the id plus the default options it was created with.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub session_id: String,
    pub default_task_options: TaskOptions,
    pub partition_ids: Vec<String>,
    /// Server-advertised `dataChunkMaxSize` (spec.md §3, §6): payloads at or
    /// under this size go through `CreateResults(data)`; larger payloads
    /// through `CreateResultsMetadata` + `UploadResultData`.
    pub chunk_max_size: u64,
}

impl SessionContext {
    /// Creates a new session, deriving its default partition set from
    /// `default_task_options.partition_id` when `partition_ids` is empty
    /// (spec.md §4.6).
    pub async fn create(
        pool: &ChannelPool,
        default_task_options: TaskOptions,
        mut partition_ids: Vec<String>,
    ) -> Result<Self, GridError> {
        if partition_ids.is_empty() {
            if let Some(p) = &default_task_options.partition_id {
                partition_ids.push(p.clone());
            }
        }

        let request = CreateSessionRequest {
            default_task_options: Some((&default_task_options).into()),
            partition_ids: partition_ids.clone(),
        };
        let response = pool
            .with_channel(|channel| async move {
                GridSubmissionClient::new(channel)
                    .create_session(request)
                    .await
                    .map_err(|status| GridError::from_status("CreateSession", status))
                    .map(|r| r.into_inner())
            })
            .await?;

        debug!(session_id = %response.session_id, "session created");
        let chunk_max_size = fetch_chunk_max_size(pool).await;
        Ok(Self {
            session_id: response.session_id,
            default_task_options,
            partition_ids,
            chunk_max_size,
        })
    }

    /// Opens an existing session, failing unless its status is `running`
    /// (spec.md §4.6's open/validate contract).
    pub async fn open(pool: &ChannelPool, session_id: impl Into<String>) -> Result<Self, GridError> {
        let session_id = session_id.into();
        let lookup = session_id.clone();
        let response = pool
            .with_channel(|channel| async move {
                GridSubmissionClient::new(channel)
                    .get_session(GetSessionRequest { session_id: lookup })
                    .await
                    .map_err(|status| GridError::from_status("GetSession", status))
                    .map(|r| r.into_inner())
            })
            .await?;

        if response.status != SessionStatus::Running as i32 {
            return Err(GridError::SessionNotOpenable {
                session_id,
                status: status_name(response.status),
            });
        }

        let default_task_options = response
            .default_task_options
            .map(task_options_from_wire)
            .unwrap_or_default();
        let chunk_max_size = fetch_chunk_max_size(pool).await;

        Ok(Self {
            session_id,
            default_task_options,
            partition_ids: response.partition_ids,
            chunk_max_size,
        })
    }
}

/// Fetches `GetServiceConfiguration.dataChunkMaxSize`, falling back to
/// [`DEFAULT_CHUNK_MAX_SIZE`] if the call fails or the server advertises
/// `0`. Never fails session creation/open over this: a missing or stale
/// service-configuration RPC shouldn't block every other operation.
async fn fetch_chunk_max_size(pool: &ChannelPool) -> u64 {
    let result = pool
        .with_channel(|channel| async move {
            GridSubmissionClient::new(channel)
                .get_service_configuration(GetServiceConfigurationRequest {})
                .await
                .map_err(|status| GridError::from_status("GetServiceConfiguration", status))
                .map(|r| r.into_inner())
        })
        .await;

    match result {
        Ok(config) if config.data_chunk_max_size > 0 => config.data_chunk_max_size,
        _ => DEFAULT_CHUNK_MAX_SIZE,
    }
}

fn status_name(status: i32) -> String {
    match status {
        x if x == SessionStatus::Running as i32 => "running".to_string(),
        x if x == SessionStatus::Cancelled as i32 => "cancelled".to_string(),
        x if x == SessionStatus::Purged as i32 => "purged".to_string(),
        _ => "unspecified".to_string(),
    }
}

fn task_options_from_wire(wire: grid_proto::grid::v1::TaskOptions) -> TaskOptions {
    use crate::config::EngineType;
    use std::time::Duration;

    let engine_type = match wire.engine_type {
        x if x == grid_proto::grid::v1::EngineType::Unified as i32 => EngineType::Unified,
        x if x == grid_proto::grid::v1::EngineType::DataSynapse as i32 => EngineType::DataSynapse,
        _ => EngineType::Symphony,
    };
    TaskOptions {
        max_duration: Duration::from_secs(wire.max_duration_seconds as u64),
        max_retries: wire.max_retries,
        priority: wire.priority,
        engine_type,
        application_name: wire.application_name,
        application_version: wire.application_version,
        application_namespace: wire.application_namespace,
        application_service: wire.application_service,
        partition_id: if wire.partition_id.is_empty() {
            None
        } else {
            Some(wire.partition_id)
        },
    }
}
