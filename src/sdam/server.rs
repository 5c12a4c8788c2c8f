use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

use tokio::sync::broadcast;

use crate::{
    cmap::{establish::ConnectionEstablisher, options::ConnectionPoolOptions, ConnectionPool},
    metrics::TopologyMetrics,
    options::{ClientOptions, ServerAddress},
    sdam::TopologyUpdater,
};

/// Contains the state for a given server in the topology.
#[derive(Debug)]
pub(crate) struct Server {
    pub(crate) address: ServerAddress,

    /// The connection pool for the server.
    pub(crate) pool: ConnectionPool,

    /// Number of operations currently using this server.
    operation_count: AtomicU32,

    /// Signalled to interrupt the monitor's in-progress awaitable check, e.g. after an
    /// application thread observed a network error on this server.
    monitor_cancellation: broadcast::Sender<()>,
}

impl Server {
    /// Creates a new Server given the `address` and `options`.
    pub(crate) fn new(
        address: ServerAddress,
        options: &ClientOptions,
        establisher: ConnectionEstablisher,
        topology_updater: TopologyUpdater,
        metrics: Arc<TopologyMetrics>,
    ) -> Arc<Self> {
        let (monitor_cancellation, _) = broadcast::channel(1);
        Arc::new(Self {
            pool: ConnectionPool::new(
                address.clone(),
                establisher,
                topology_updater,
                metrics,
                ConnectionPoolOptions::from_client_options(options),
            ),
            address,
            operation_count: AtomicU32::new(0),
            monitor_cancellation,
        })
    }

    /// Subscribe to requests to cancel the in-progress monitor check for this server.
    pub(crate) fn subscribe_to_cancellations(&self) -> broadcast::Receiver<()> {
        self.monitor_cancellation.subscribe()
    }

    /// Request that the monitor for this server abandon its in-progress check and start over.
    pub(crate) fn cancel_monitor_check(&self) {
        // If the monitor isn't currently listening, nothing needs to be interrupted.
        let _: std::result::Result<_, _> = self.monitor_cancellation.send(());
    }

    pub(crate) fn increment_operation_count(&self) {
        self.operation_count.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn decrement_operation_count(&self) {
        self.operation_count.fetch_sub(1, Ordering::SeqCst);
    }

    #[allow(unused)]
    pub(crate) fn operation_count(&self) -> u32 {
        self.operation_count.load(Ordering::SeqCst)
    }
}
