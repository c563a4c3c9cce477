//! Bounded pool of [`tonic::transport::Channel`]s leased out to RPC call
//! sites so chunk-level fan-out stays within `max_parallel_channels`
//! (spec.md §4.2, §5).
//!
//! The teacher's clients (`personhog_client.rs`, `kafka-assigner`) each hold
//! one lazily-connected channel for the crate's lifetime; this pool
//! generalizes that single-channel pattern into a free-list sized to the
//! configured concurrency, since the submission pipeline needs several
//! concurrent in-flight RPCs per chunk.

use std::future::Future;

use tokio::sync::Mutex;
use tonic::transport::{Channel, Endpoint};

use crate::error::GridError;

/// A pool of pre-connected channels to the same endpoint. `lease`/`release`
/// bracket a call; a channel that faulted during use is dropped instead of
/// returned, so the pool self-heals its connection set over time.
pub struct ChannelPool {
    endpoint: Endpoint,
    free: Mutex<Vec<Channel>>,
    capacity: usize,
}

impl ChannelPool {
    /// Builds a pool lazily: no connection is attempted until the first
    /// lease, matching the teacher's `connect_lazy()` convention.
    pub fn new(endpoint: &str, capacity: usize) -> Result<Self, GridError> {
        let endpoint = Endpoint::from_shared(endpoint.to_string()).map_err(|e| {
            GridError::TransportFatal {
                rpc: "ChannelPool::new",
                message: e.to_string(),
            }
        })?;
        Ok(Self {
            endpoint,
            free: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
        })
    }

    /// Hands back a ready channel, reusing one from the free list when
    /// available and lazily connecting a fresh one otherwise.
    pub async fn lease(&self) -> Channel {
        metrics::counter!(crate::metrics_consts::CHANNEL_POOL_LEASES_TOTAL).increment(1);
        if let Some(channel) = self.free.lock().await.pop() {
            return channel;
        }
        self.endpoint.connect_lazy()
    }

    /// Returns a channel that was used successfully back to the free list,
    /// up to `capacity` entries; excess channels are simply dropped.
    pub async fn release(&self, channel: Channel) {
        let mut free = self.free.lock().await;
        if free.len() < self.capacity {
            free.push(channel);
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Leases a channel, runs `f` against it, and either returns it to the
    /// free list (on success) or drops it (on failure) — spec.md §4.2's
    /// exception-tagging contract: a channel `f` faulted on may be holding a
    /// half-closed stream and must not be reused.
    pub async fn with_channel<F, Fut, T>(&self, f: F) -> Result<T, GridError>
    where
        F: FnOnce(Channel) -> Fut,
        Fut: Future<Output = Result<T, GridError>>,
    {
        let channel = self.lease().await;
        match f(channel.clone()).await {
            Ok(value) => {
                self.release(channel).await;
                Ok(value)
            }
            Err(err) => Err(err),
        }
    }
}
