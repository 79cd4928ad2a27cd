//! Registry of live output sinks
//!
//! Shared by every viewer session (insert/remove) and the ingest path
//! (snapshot on every packet). The registry keeps only weak references: the
//! viewer session owns its sink, the registry just knows where to write.

use crate::media::PacketSink;
use futures_util::future::join_all;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Sinks are keyed by the id of the viewer session that owns them
pub type SinkId = Uuid;

pub struct SinkRegistry {
    sinks: RwLock<HashMap<SinkId, Weak<dyn PacketSink>>>,
}

impl SinkRegistry {
    pub fn new() -> Self {
        Self {
            sinks: RwLock::new(HashMap::new()),
        }
    }

    /// Register a sink. Returns `false` if the id is already registered.
    pub async fn insert(&self, id: SinkId, sink: &Arc<dyn PacketSink>) -> bool {
        let mut sinks = self.sinks.write().await;

        if sinks.get(&id).is_some_and(|existing| existing.strong_count() > 0) {
            return false;
        }

        sinks.insert(id, Arc::downgrade(sink));
        tracing::debug!("Registered sink {} ({} live)", id, sinks.len());
        true
    }

    /// Deregister a sink. Removing an absent id is a no-op and returns `false`.
    pub async fn remove(&self, id: SinkId) -> bool {
        let mut sinks = self.sinks.write().await;
        let removed = sinks.remove(&id).is_some();

        if removed {
            tracing::debug!("Deregistered sink {} ({} live)", id, sinks.len());
        }

        removed
    }

    pub async fn contains(&self, id: SinkId) -> bool {
        self.sinks.read().await.contains_key(&id)
    }

    pub async fn len(&self) -> usize {
        self.sinks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sinks.read().await.is_empty()
    }

    /// Point-in-time copy of the live members.
    ///
    /// The read lock is held only while copying, never while delivering.
    /// Sinks whose owner already dropped them are skipped.
    pub async fn snapshot(&self) -> Vec<(SinkId, Arc<dyn PacketSink>)> {
        self.sinks
            .read()
            .await
            .iter()
            .filter_map(|(id, sink)| sink.upgrade().map(|sink| (*id, sink)))
            .collect()
    }

    /// Run `f` for every member of a snapshot, all sinks concurrently
    pub async fn for_each<F, Fut>(&self, f: F)
    where
        F: Fn(SinkId, Arc<dyn PacketSink>) -> Fut,
        Fut: Future<Output = ()>,
    {
        let members = self.snapshot().await;
        join_all(members.into_iter().map(|(id, sink)| f(id, sink))).await;
    }
}

impl Default for SinkRegistry {
    fn default() -> Self {
        Self::new()
    }
}
