use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use bson::oid::ObjectId;

use super::{
    conn::PendingConnection,
    connection_requester::{
        ConnectionRequest,
        ConnectionRequestReceiver,
        ConnectionRequestResult,
    },
    establish::ConnectionEstablisher,
    manager::{ConnectionSucceeded, ManagementRequestReceiver, PoolManagementRequest, PoolManager},
    options::ConnectionPoolOptions,
    status::PoolGenerationPublisher,
    Connection,
    PoolGeneration,
    DEFAULT_MAX_POOL_SIZE,
};
use crate::{
    error::{Error, ErrorKind},
    metrics::TopologyMetrics,
    options::ServerAddress,
    runtime,
    sdam::TopologyUpdater,
    trace::CONNECTION_TRACING_EVENT_TARGET,
};

const DEFAULT_MAX_CONNECTING: u32 = 2;
const MAINTENANCE_FREQUENCY: Duration = Duration::from_millis(500);

/// A worker task that manages the shared state of the pool.
pub(crate) struct ConnectionPoolWorker {
    /// The address the pool's connections will connect to.
    address: ServerAddress,

    /// Current state of the pool. Determines if connections may be checked out
    /// and if min_pool_size connection creation should continue.
    state: PoolState,

    /// The total number of connections managed by the pool, including connections which are
    /// currently checked out of the pool or have yet to be established.
    total_connection_count: u32,

    /// The number of connections currently being established by this pool.
    pending_connection_count: u32,

    /// The ID of the next connection created by the pool.
    next_connection_id: u32,

    /// The current generation of the pool. The generation is incremented whenever the pool is
    /// cleared. Connections belonging to a previous generation are considered stale and will be
    /// closed when checked back in or when popped off of the set of available connections.
    generation: PoolGeneration,

    /// The connection count for each serviceId in load-balanced mode.
    service_connection_count: HashMap<ObjectId, u32>,

    /// The established connections that are currently checked into the pool and awaiting usage
    /// in future operations.
    available_connections: VecDeque<Connection>,

    /// Contains the logic for "establishing" a connection, including handshaking.
    establisher: ConnectionEstablisher,

    /// The time between maintenance tasks.
    maintenance_frequency: Duration,

    /// Connections that have been ready for usage in the pool for longer than `max_idle_time`
    /// will be closed either by the background task or when popped off of the set of available
    /// connections. If `max_idle_time` is `None`, then connections will not be closed due to
    /// being idle.
    max_idle_time: Option<Duration>,

    /// The minimum number of connections that the pool can have at a given time. This includes
    /// connections which are currently checked out of the pool. If fewer than `min_pool_size`
    /// connections are in the pool, the background task will create more connections and add
    /// them to the pool.
    min_pool_size: Option<u32>,

    /// The maximum number of connections that the pool can manage, including connections
    /// checked out of the pool. If a request comes in while the pool is at max size, it waits
    /// in the wait queue until a connection is returned or established.
    max_pool_size: u32,

    /// The maximum number of new connections that can be created concurrently.
    max_connecting: u32,

    /// Receiver for incoming connection check out requests.
    request_receiver: ConnectionRequestReceiver,

    /// Ordered queue of incoming requests waiting for connections.
    wait_queue: VecDeque<ConnectionRequest>,

    /// Receiver for incoming pool management requests (e.g. checking in a connection).
    management_receiver: ManagementRequestReceiver,

    /// Sender used to publish the latest generation.
    generation_publisher: PoolGenerationPublisher,

    /// A pool manager that can be cloned and attached to connections checked out of the pool.
    manager: PoolManager,

    /// A handle used to notify the topology that a connection establishment error happened.
    /// This will allow the server to transition to Unknown and clear the pool as necessary.
    server_updater: TopologyUpdater,

    metrics: Arc<TopologyMetrics>,
}

impl ConnectionPoolWorker {
    /// Starts a worker, returning the channel endpoints used to interact with it. Once all
    /// connection requesters are dropped, the worker will stop executing and close the pool.
    pub(super) fn start(
        address: ServerAddress,
        establisher: ConnectionEstablisher,
        server_updater: TopologyUpdater,
        metrics: Arc<TopologyMetrics>,
        options: &ConnectionPoolOptions,
        request_receiver: ConnectionRequestReceiver,
        manager: PoolManager,
        management_receiver: ManagementRequestReceiver,
        generation_publisher: PoolGenerationPublisher,
    ) {
        // A max idle time of zero means that connections should not be closed due to idleness.
        let mut max_idle_time = options.max_idle_time;
        if max_idle_time == Some(Duration::from_millis(0)) {
            max_idle_time = None;
        }

        let max_pool_size = options.max_pool_size.unwrap_or(DEFAULT_MAX_POOL_SIZE);
        let min_pool_size = options.min_pool_size;

        let is_load_balanced = options.load_balanced.unwrap_or(false);
        let generation = if is_load_balanced {
            PoolGeneration::load_balanced()
        } else {
            PoolGeneration::normal()
        };

        #[cfg(test)]
        let mut state = if options.ready.unwrap_or(false) {
            PoolState::Ready
        } else {
            PoolState::New
        };
        #[cfg(not(test))]
        let mut state = PoolState::New;

        if is_load_balanced {
            // Load balancer servers don't have a monitoring connection, so the associated
            // connection pool starts in the ready state.
            state = PoolState::Ready;
        }

        let worker = ConnectionPoolWorker {
            address,
            max_idle_time,
            min_pool_size,
            establisher,
            next_connection_id: 1,
            total_connection_count: 0,
            pending_connection_count: 0,
            generation,
            service_connection_count: HashMap::new(),
            available_connections: VecDeque::new(),
            max_pool_size,
            max_connecting: DEFAULT_MAX_CONNECTING,
            request_receiver,
            wait_queue: Default::default(),
            management_receiver,
            manager,
            state,
            generation_publisher,
            maintenance_frequency: MAINTENANCE_FREQUENCY,
            server_updater,
            metrics,
        };

        runtime::spawn(async move {
            worker.execute().await;
        });
    }

    /// Run the worker, listening on the various receivers until all requester handles have
    /// been dropped. Once that happens, the pool closes any available connections.
    async fn execute(mut self) {
        let mut maintenance_interval = tokio::time::interval(self.maintenance_frequency);

        loop {
            let task = tokio::select! {
                // Bias the select towards management requests so checkIn, clear, and ready
                // always take priority over checkout requests.
                biased;

                Some(request) = self.management_receiver.recv() => PoolTask::from(request),
                request = self.request_receiver.recv() => {
                    match request {
                        Some(request) => PoolTask::CheckOut(request),
                        // All requesters are gone; this pool has no more references and
                        // can shut down.
                        None => break,
                    }
                },
                _ = maintenance_interval.tick() => {
                    PoolTask::Maintenance
                },
            };

            match task {
                PoolTask::CheckOut(request) => match self.state {
                    PoolState::Ready => {
                        self.wait_queue.push_back(request);
                    }
                    PoolState::Paused(ref e) => {
                        // If the receiver doesn't listen to the error, that's ok.
                        let _ = request.fulfill(ConnectionRequestResult::PoolCleared(e.clone()));
                    }
                    PoolState::New => {
                        let _ = request.fulfill(ConnectionRequestResult::PoolCleared(
                            ErrorKind::Internal {
                                message: "check out attempted from new pool".to_string(),
                            }
                            .into(),
                        ));
                    }
                },
                PoolTask::HandleManagementRequest(request) => match *request {
                    PoolManagementRequest::CheckIn(connection) => {
                        self.check_in(*connection);
                    }
                    PoolManagementRequest::Clear { cause, service_id } => {
                        self.clear(cause, service_id);
                    }
                    PoolManagementRequest::MarkAsReady => {
                        self.mark_as_ready();
                    }
                    PoolManagementRequest::HandleConnectionSucceeded(conn) => {
                        self.handle_connection_succeeded(conn);
                    }
                    PoolManagementRequest::HandleConnectionFailed => {
                        self.handle_connection_failed();
                    }
                },
                PoolTask::Maintenance => {
                    self.perform_maintenance();
                }
            }

            while self.can_service_connection_request() {
                match self.wait_queue.pop_front() {
                    Some(request) => self.check_out(request),
                    None => break,
                }
            }
        }

        while let Some(connection) = self.available_connections.pop_front() {
            connection.close_and_drop(Some(&self.metrics));
        }

        tracing::debug!(
            target: CONNECTION_TRACING_EVENT_TARGET,
            "connection pool for {} closed",
            self.address
        );
    }

    fn below_max_connections(&self) -> bool {
        self.total_connection_count < self.max_pool_size
    }

    fn can_service_connection_request(&self) -> bool {
        if !matches!(self.state, PoolState::Ready) {
            return false;
        }

        if self.wait_queue.is_empty() {
            return false;
        }

        if !self.available_connections.is_empty() {
            return true;
        }

        self.below_max_connections() && self.pending_connection_count < self.max_connecting
    }

    fn check_out(&mut self, request: ConnectionRequest) {
        // First attempt to check out an available connection.
        while let Some(mut conn) = self.available_connections.pop_back() {
            // Close the connection if it's stale.
            if conn.generation.is_stale(&self.generation) {
                self.close_connection(conn);
                continue;
            }

            // Close the connection if it's idle.
            if conn.is_idle(self.max_idle_time) {
                self.close_connection(conn);
                continue;
            }

            conn.mark_as_in_use(self.manager.clone());
            if let Err(request) = request.fulfill(ConnectionRequestResult::Pooled(Box::new(conn))) {
                // The checking out task stopped listening, e.g. because it hit the wait
                // queue timeout, so the connection goes back into the pool.
                let mut connection = request.unwrap_pooled_connection();
                connection.mark_as_available();
                self.available_connections.push_back(connection);
            }

            return;
        }

        // Otherwise, attempt to create a connection.
        if self.below_max_connections() {
            let establisher = self.establisher.clone();
            let pending_connection = self.create_pending_connection();
            let manager = self.manager.clone();
            let server_updater = self.server_updater.clone();
            let metrics = self.metrics.clone();

            let handle = runtime::spawn(async move {
                let mut establish_result = establish_connection(
                    establisher,
                    pending_connection,
                    server_updater,
                    &manager,
                    metrics,
                )
                .await;

                if let Ok(ref mut c) = establish_result {
                    c.mark_as_in_use(manager.clone());
                    manager.handle_connection_succeeded(ConnectionSucceeded::Used {
                        service_id: c.generation.service_id(),
                    });
                }

                establish_result
            });

            // This only fails if the other end stopped listening (e.g. due to timeout), in
            // which case we just let the connection establish in the background.
            let _: std::result::Result<_, _> =
                request.fulfill(ConnectionRequestResult::Establishing(handle));
        } else {
            // Put the request at the front of the wait queue so that it will be processed
            // next time a request can be processed.
            self.wait_queue.push_front(request);
        }
    }

    fn create_pending_connection(&mut self) -> PendingConnection {
        self.total_connection_count += 1;
        self.pending_connection_count += 1;

        let pending_connection = PendingConnection {
            id: self.next_connection_id,
            address: self.address.clone(),
            generation: self.generation.clone(),
        };
        self.next_connection_id += 1;

        pending_connection
    }

    /// Process a connection establishment failure.
    fn handle_connection_failed(&mut self) {
        // Establishing a pending connection failed, so that must be reflected in the total
        // connection count.
        self.total_connection_count -= 1;
        self.pending_connection_count -= 1;
    }

    /// Process a successful connection establishment, optionally populating the pool with the
    /// resulting connection.
    fn handle_connection_succeeded(&mut self, connection: ConnectionSucceeded) {
        self.pending_connection_count -= 1;
        if let Some(sid) = connection.service_id() {
            let count = self.service_connection_count.entry(sid).or_insert(0);
            *count += 1;
        }
        if let ConnectionSucceeded::ForPool(connection) = connection {
            let mut connection = *connection;
            connection.mark_as_available();
            self.available_connections.push_back(connection);
        }
    }

    fn check_in(&mut self, mut conn: Connection) {
        conn.mark_as_available();

        if conn.has_errored() {
            self.close_connection(conn);
        } else if conn.generation.is_stale(&self.generation) {
            self.close_connection(conn);
        } else if conn.is_streaming() {
            // A connection dropped mid-exhaust cannot be reused.
            self.close_connection(conn);
        } else {
            self.available_connections.push_back(conn);
        }
    }

    fn clear(&mut self, cause: Error, service_id: Option<ObjectId>) {
        let was_ready = match (&mut self.generation, service_id) {
            (PoolGeneration::Normal(gen), None) => {
                *gen += 1;
                let prev = std::mem::replace(&mut self.state, PoolState::Paused(cause.clone()));
                matches!(prev, PoolState::Ready)
            }
            (PoolGeneration::LoadBalanced(gen_map), Some(sid)) => {
                let gen = gen_map.entry(sid).or_insert(0);
                *gen += 1;
                true
            }
            _ => {
                debug_assert!(false, "load-balanced mode mismatch");
                return;
            }
        };
        self.generation_publisher.publish(self.generation.clone());
        self.metrics.increment_pool_clears();

        if was_ready {
            tracing::debug!(
                target: CONNECTION_TRACING_EVENT_TARGET,
                "connection pool for {} cleared: {}",
                self.address,
                cause
            );

            if !matches!(self.generation, PoolGeneration::LoadBalanced(_)) {
                for request in self.wait_queue.drain(..) {
                    // An error means the other end hung up already, which is okay here.
                    let _: std::result::Result<_, _> =
                        request.fulfill(ConnectionRequestResult::PoolCleared(cause.clone()));
                }
            }
        }
    }

    fn mark_as_ready(&mut self) {
        if matches!(self.state, PoolState::Ready) {
            return;
        }

        self.state = PoolState::Ready;
    }

    /// Close a connection and decrement the total connection count.
    fn close_connection(&mut self, connection: Connection) {
        tracing::debug!(
            target: CONNECTION_TRACING_EVENT_TARGET,
            "closing connection {} to {}",
            connection.id,
            self.address
        );
        if let (PoolGeneration::LoadBalanced(gen_map), Some(sid)) =
            (&mut self.generation, connection.generation.service_id())
        {
            if let Some(count) = self.service_connection_count.get_mut(&sid) {
                *count -= 1;
                if *count == 0 {
                    gen_map.remove(&sid);
                    self.service_connection_count.remove(&sid);
                }
            }
        }
        connection.close_and_drop(Some(&self.metrics));
        self.total_connection_count -= 1;
    }

    /// Ensure all connections in the pool are valid and that the pool is managing at least
    /// min_pool_size connections.
    fn perform_maintenance(&mut self) {
        self.remove_perished_connections();
        if matches!(self.state, PoolState::Ready) {
            self.ensure_min_connections();
        }
    }

    /// Iterate over the connections and remove any that are stale or idle.
    fn remove_perished_connections(&mut self) {
        while let Some(connection) = self.available_connections.pop_front() {
            if connection.generation.is_stale(&self.generation)
                || connection.is_idle(self.max_idle_time)
            {
                self.close_connection(connection);
            } else {
                self.available_connections.push_front(connection);
                // All subsequent connections were checked into the pool later, so they are
                // neither idle nor stale either.
                break;
            };
        }
    }

    /// Populate the pool with enough connections to meet the min_pool_size requirement.
    fn ensure_min_connections(&mut self) {
        if let Some(min_pool_size) = self.min_pool_size {
            while self.total_connection_count < min_pool_size
                && self.pending_connection_count < self.max_connecting
            {
                let pending_connection = self.create_pending_connection();
                let manager = self.manager.clone();
                let establisher = self.establisher.clone();
                let updater = self.server_updater.clone();
                let metrics = self.metrics.clone();

                runtime::spawn(async move {
                    let connection = establish_connection(
                        establisher,
                        pending_connection,
                        updater,
                        &manager,
                        metrics,
                    )
                    .await;

                    if let Ok(connection) = connection {
                        manager.handle_connection_succeeded(ConnectionSucceeded::ForPool(
                            Box::new(connection),
                        ))
                    }
                });
            }
        }
    }
}

/// Helper covering the common connection establishment behavior between connections
/// established in check_out and those established as part of satisfying min_pool_size.
async fn establish_connection(
    establisher: ConnectionEstablisher,
    pending_connection: PendingConnection,
    server_updater: TopologyUpdater,
    manager: &PoolManager,
    metrics: Arc<TopologyMetrics>,
) -> crate::error::Result<Connection> {
    let address = pending_connection.address.clone();

    let establish_result = establisher.establish_connection(pending_connection).await;

    match establish_result {
        Err(e) => {
            server_updater
                .handle_application_error(
                    address.clone(),
                    e.cause.clone(),
                    e.handshake_phase.clone(),
                )
                .await;
            manager.handle_connection_failed();
            Err(e.cause)
        }
        Ok(connection) => {
            metrics.increment_connections_created();
            Ok(connection)
        }
    }
}

/// Enum modeling the possible pool states as described in the CMAP spec.
///
/// The "closed" state is omitted here because the pool is considered closed only
/// once it goes out of scope and cannot be manually closed before then.
#[derive(Debug)]
enum PoolState {
    /// Same as Paused, but for a new pool rather than one that has been cleared due to an
    /// error.
    New,

    /// Connections may not be checked out nor created in the background to satisfy
    /// minPoolSize.
    Paused(Error),

    /// Pool is operational.
    Ready,
}

/// Task to process by the worker.
#[derive(Debug)]
enum PoolTask {
    /// Handle a management request from a `PoolManager`.
    HandleManagementRequest(Box<PoolManagementRequest>),

    /// Fulfill the given connection request.
    CheckOut(ConnectionRequest),

    /// Perform pool maintenance (ensure min connections, remove stale or idle connections).
    Maintenance,
}

impl From<PoolManagementRequest> for PoolTask {
    fn from(request: PoolManagementRequest) -> Self {
        PoolTask::HandleManagementRequest(Box::new(request))
    }
}
