//! A typed registry of counters describing the activity of a topology.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

/// Counters describing the activity of a [`Client`](crate::Client)'s topology.
///
/// A registry is created per topology and shared with its monitors and pools;
/// all counters are atomic and may be read at any time without locking.
#[derive(Debug, Default)]
#[non_exhaustive]
pub struct TopologyMetrics {
    heartbeats_started: AtomicU64,
    heartbeats_succeeded: AtomicU64,
    heartbeats_failed: AtomicU64,
    server_selections: AtomicU64,
    server_selection_timeouts: AtomicU64,
    pool_clears: AtomicU64,
    connections_created: AtomicU64,
    connections_closed: AtomicU64,
}

impl TopologyMetrics {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn increment_heartbeats_started(&self) {
        self.heartbeats_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn increment_heartbeats_succeeded(&self) {
        self.heartbeats_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn increment_heartbeats_failed(&self) {
        self.heartbeats_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn increment_server_selections(&self) {
        self.server_selections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn increment_server_selection_timeouts(&self) {
        self.server_selection_timeouts
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn increment_pool_clears(&self) {
        self.pool_clears.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn increment_connections_created(&self) {
        self.connections_created.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn increment_connections_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    /// The number of heartbeats started by the topology's monitors.
    pub fn heartbeats_started(&self) -> u64 {
        self.heartbeats_started.load(Ordering::Relaxed)
    }

    /// The number of heartbeats that completed successfully.
    pub fn heartbeats_succeeded(&self) -> u64 {
        self.heartbeats_succeeded.load(Ordering::Relaxed)
    }

    /// The number of heartbeats that failed.
    pub fn heartbeats_failed(&self) -> u64 {
        self.heartbeats_failed.load(Ordering::Relaxed)
    }

    /// The number of server selection attempts.
    pub fn server_selections(&self) -> u64 {
        self.server_selections.load(Ordering::Relaxed)
    }

    /// The number of server selection attempts that timed out.
    pub fn server_selection_timeouts(&self) -> u64 {
        self.server_selection_timeouts.load(Ordering::Relaxed)
    }

    /// The number of times a connection pool was cleared.
    pub fn pool_clears(&self) -> u64 {
        self.pool_clears.load(Ordering::Relaxed)
    }

    /// The number of connections created across all pools.
    pub fn connections_created(&self) -> u64 {
        self.connections_created.load(Ordering::Relaxed)
    }

    /// The number of connections closed across all pools.
    pub fn connections_closed(&self) -> u64 {
        self.connections_closed.load(Ordering::Relaxed)
    }
}
