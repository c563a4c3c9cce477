//! Concurrent map from result id to the handler invoked once the dispatcher
//! observes that result reach a terminal state (spec.md §3's "Invocation
//! handler", §4.5).
//!
//! Grounded on the teacher's concurrent registry pattern in
//! `kafka-assigner` (assignment bookkeeping keyed by partition, guarded by
//! `dashmap` rather than a `Mutex<HashMap<_>>` so dispatcher passes never
//! block registration).

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

use crate::error::GridError;

/// Terminal outcome of a dispatched result, handed to its registered
/// handler exactly once (spec.md §4.5 "at-most-once handler invocation").
#[derive(Debug, Clone)]
pub enum ResultOutcome {
    Ready(Bytes),
    Error(GridError),
    Aborted,
}

/// Caller-supplied callback invoked by [`crate::dispatcher::DispatcherLoop`]
/// when a registered result id reaches a terminal state.
#[async_trait]
pub trait InvocationHandler: Send + Sync {
    async fn handle(&self, result_id: &str, outcome: ResultOutcome);
}

/// A registry entry the dispatcher polls for and resolves at most once.
#[derive(Clone)]
struct Entry {
    handler: Arc<dyn InvocationHandler>,
}

/// Concurrent `result-id -> handler` map. Registration happens at
/// submission time (spec.md §4.3); the dispatcher drains it on a background
/// cadence (§4.5).
#[derive(Default)]
pub struct ResultRegistry {
    entries: DashMap<String, Entry>,
}

impl ResultRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, result_id: impl Into<String>, handler: Arc<dyn InvocationHandler>) {
        self.entries.insert(result_id.into(), Entry { handler });
    }

    /// Removes and returns the handler for `result_id`, if one is still
    /// registered. Called by the dispatcher immediately before invoking it,
    /// so a result can never be delivered twice.
    pub fn take(&self, result_id: &str) -> Option<Arc<dyn InvocationHandler>> {
        self.entries.remove(result_id).map(|(_, entry)| entry.handler)
    }

    /// Every result id currently awaiting dispatch, for the dispatcher's
    /// poll batch (spec.md §4.5).
    pub fn pending_ids(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
