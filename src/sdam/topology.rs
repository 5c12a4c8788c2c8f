use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use bson::oid::ObjectId;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::{
    client::ClusterTime,
    cmap::establish::{ConnectionEstablisher, HandshakePhase},
    error::{Error, ErrorKind, Result},
    event::sdam::{
        SdamEventEmitter,
        ServerClosedEvent,
        ServerDescriptionChangedEvent,
        ServerOpeningEvent,
        TopologyClosedEvent,
        TopologyDescriptionChangedEvent,
        TopologyOpeningEvent,
    },
    metrics::TopologyMetrics,
    options::{ClientOptions, ServerAddress},
    runtime,
    sdam::{
        description::{
            server::{ServerDescription, ServerType},
            topology::server_selection::{self, SelectedServer},
        },
        public::ServerInfo,
        Monitor,
        Server,
        TopologyDescription,
        TopologyType,
    },
    selection_criteria::SelectionCriteria,
    trace::SDAM_TRACING_EVENT_TARGET,
};

pub(crate) const DEFAULT_SERVER_SELECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// A struct modeling the canonical state of a deployment: its servers, their roles, and the
/// connections to them. State is owned by a background worker task; handles communicate with
/// it over channels, and observers read `Arc`-shared immutable snapshots through a watch
/// channel, so server selection never takes a lock.
#[derive(Debug)]
pub(crate) struct Topology {
    watcher: TopologyWatcher,
    updater: TopologyUpdater,
    check_requester: TopologyCheckRequester,
    metrics: Arc<TopologyMetrics>,
    server_selection_timeout: Duration,
}

impl Topology {
    pub(crate) fn new(options: ClientOptions) -> Result<Topology> {
        let id = ObjectId::new();
        let event_emitter = options
            .sdam_event_handler
            .clone()
            .map(SdamEventEmitter::new);

        let metrics = TopologyMetrics::new();

        let server_selection_timeout = options
            .server_selection_timeout
            .unwrap_or(DEFAULT_SERVER_SELECTION_TIMEOUT);

        let mut description = TopologyDescription::default();
        description.initialize(&options);

        let state = TopologyState {
            description,
            servers: HashMap::new(),
        };
        let (publisher, watch_receiver) = watch::channel(state.clone());
        let watcher = TopologyWatcher {
            receiver: watch_receiver,
        };

        let (update_sender, update_receiver) = mpsc::unbounded_channel();
        let updater = TopologyUpdater {
            sender: update_sender,
        };

        let (check_request_sender, _) = broadcast::channel(1);
        let check_requester = TopologyCheckRequester {
            sender: check_request_sender,
        };

        let establisher =
            ConnectionEstablisher::new(crate::cmap::options::ConnectionPoolOptions::from_client_options(&options))?;

        let worker = TopologyWorker {
            id,
            update_receiver,
            publisher,
            options,
            event_emitter,
            check_requester: check_requester.clone(),
            watcher: watcher.clone(),
            updater: updater.clone(),
            establisher,
            metrics: metrics.clone(),
            state,
        };
        worker.start();

        Ok(Topology {
            watcher,
            updater,
            check_requester,
            metrics,
            server_selection_timeout,
        })
    }

    /// Whether the topology worker is still running.
    pub(crate) fn is_alive(&self) -> bool {
        self.watcher.is_alive()
    }

    #[cfg(test)]
    pub(crate) fn updater(&self) -> TopologyUpdater {
        self.updater.clone()
    }

    pub(crate) fn watch(&self) -> TopologyWatcher {
        let mut watcher = self.watcher.clone();
        // The watcher must observe the latest state even if it was published before this
        // call.
        watcher.receiver.mark_changed();
        watcher
    }

    pub(crate) fn metrics(&self) -> &Arc<TopologyMetrics> {
        &self.metrics
    }

    pub(crate) fn cluster_time(&self) -> Option<ClusterTime> {
        self.watcher
            .peek_latest()
            .description
            .cluster_time()
            .cloned()
    }

    pub(crate) async fn advance_cluster_time(&self, cluster_time: ClusterTime) {
        self.updater.advance_cluster_time(cluster_time).await;
    }

    pub(crate) fn topology_type(&self) -> TopologyType {
        self.watcher.peek_latest().description.topology_type
    }

    pub(crate) fn description(&self) -> TopologyDescription {
        self.watcher.peek_latest().description
    }

    pub(crate) fn logical_session_timeout(&self) -> Option<Duration> {
        self.watcher.peek_latest().description.logical_session_timeout
    }

    /// Signals the monitors that they should check the topology immediately.
    pub(crate) fn request_update(&self) {
        self.check_requester.request()
    }

    /// Handle an error that occurred during operation execution, updating the topology and
    /// invalidating pooled connections as necessary. Returns whether the topology changed as
    /// a result of the error.
    pub(crate) async fn handle_application_error(
        &self,
        address: ServerAddress,
        error: Error,
        phase: HandshakePhase,
    ) -> bool {
        self.updater
            .handle_application_error(address, error, phase)
            .await
    }

    /// Selects a server matching the criteria, waiting for topology updates until the server
    /// selection timeout elapses.
    pub(crate) async fn select_server(
        &self,
        criteria: &SelectionCriteria,
    ) -> Result<SelectedServer> {
        self.metrics.increment_server_selections();

        let mut watcher = self.watch();
        let start_time = Instant::now();

        loop {
            if !watcher.is_alive() {
                return Err(ErrorKind::Shutdown.into());
            }

            let state = watcher.observe_latest();

            if let Some(server) = server_selection::attempt_to_select_server(
                criteria,
                &state.description,
                &state.servers,
            )? {
                return Ok(server);
            }

            // No server matched; ask the monitors for fresh information and wait for the
            // topology to change.
            self.request_update();

            let remaining = match self
                .server_selection_timeout
                .checked_sub(start_time.elapsed())
            {
                Some(remaining) if remaining > Duration::ZERO => remaining,
                _ => {
                    self.metrics.increment_server_selection_timeouts();
                    return Err(ErrorKind::ServerSelection {
                        message: state
                            .description
                            .server_selection_timeout_error_message(criteria),
                    }
                    .into());
                }
            };

            watcher.wait_for_update(remaining).await;
        }
    }

    /// Shuts down the topology: the monitors stop, the pools close, and a topology-closed
    /// event is emitted.
    pub(crate) async fn shutdown(&self) {
        self.updater.shutdown().await;
    }
}

/// The topology state as of a given point in time: an immutable description plus the live
/// server handles.
#[derive(Debug, Clone)]
pub(crate) struct TopologyState {
    pub(crate) description: TopologyDescription,
    pub(crate) servers: HashMap<ServerAddress, Arc<Server>>,
}

/// A handle used for observing changes to the topology without interacting with the worker.
#[derive(Debug, Clone)]
pub(crate) struct TopologyWatcher {
    receiver: watch::Receiver<TopologyState>,
}

impl TopologyWatcher {
    /// Whether the topology worker is still running.
    pub(crate) fn is_alive(&self) -> bool {
        self.receiver.has_changed().is_ok()
    }

    /// Clones the latest state, marking it as seen.
    pub(crate) fn observe_latest(&mut self) -> TopologyState {
        self.receiver.borrow_and_update().clone()
    }

    /// Clones the latest state without marking it as seen.
    pub(crate) fn peek_latest(&self) -> TopologyState {
        self.receiver.borrow().clone()
    }

    pub(crate) fn server_description(&self, address: &ServerAddress) -> Option<ServerDescription> {
        self.receiver
            .borrow()
            .description
            .get_server_description(address)
            .cloned()
    }

    pub(crate) fn topology_type(&self) -> TopologyType {
        self.receiver.borrow().description.topology_type
    }

    pub(crate) fn server_exists(&self, address: &ServerAddress) -> bool {
        self.receiver.borrow().servers.contains_key(address)
    }

    /// Waits for the topology to publish a new state or for the timeout to elapse, returning
    /// whether an update was observed.
    pub(crate) async fn wait_for_update(&mut self, timeout: Duration) -> bool {
        matches!(
            tokio::time::timeout(timeout, self.receiver.changed()).await,
            Ok(Ok(()))
        )
    }
}

/// A handle used by monitors and application tasks to feed observations into the topology
/// worker.
#[derive(Debug, Clone)]
pub(crate) struct TopologyUpdater {
    sender: mpsc::UnboundedSender<AcknowledgedMessage>,
}

impl TopologyUpdater {
    async fn send(&self, message: UpdateMessage) -> bool {
        let (ack, receiver) = oneshot::channel();
        let message = AcknowledgedMessage { message, ack };
        if self.sender.send(message).is_err() {
            return false;
        }
        receiver.await.unwrap_or(false)
    }

    /// Publish a new description for a server, returning whether the topology changed.
    pub(crate) async fn update(&self, description: ServerDescription) -> bool {
        self.send(UpdateMessage::ServerUpdate(Box::new(description)))
            .await
    }

    /// Mark a server Unknown due to an error observed by its monitor.
    pub(crate) async fn handle_monitor_error(&self, address: ServerAddress, error: Error) -> bool {
        self.send(UpdateMessage::MonitorError { address, error })
            .await
    }

    /// Update the topology in response to an error observed during operation execution.
    pub(crate) async fn handle_application_error(
        &self,
        address: ServerAddress,
        error: Error,
        phase: HandshakePhase,
    ) -> bool {
        self.send(UpdateMessage::ApplicationError {
            address,
            error,
            phase,
        })
        .await
    }

    /// Replace the set of hosts in the topology, e.g. after an SRV rescan.
    pub(crate) async fn sync_hosts(&self, hosts: Vec<ServerAddress>) -> bool {
        self.send(UpdateMessage::SyncHosts(hosts)).await
    }

    pub(crate) async fn advance_cluster_time(&self, cluster_time: ClusterTime) {
        self.send(UpdateMessage::AdvanceClusterTime(cluster_time))
            .await;
    }

    pub(crate) async fn shutdown(&self) {
        self.send(UpdateMessage::Shutdown).await;
    }
}

/// A handle for waking the monitors to check their servers ahead of schedule, used when
/// server selection comes up empty or an operation observes a state-change error.
#[derive(Debug, Clone)]
pub(crate) struct TopologyCheckRequester {
    sender: broadcast::Sender<()>,
}

impl TopologyCheckRequester {
    /// Request that all monitors check their server now.
    pub(crate) fn request(&self) {
        // An error means no monitor is currently between checks, which is fine.
        let _: std::result::Result<_, _> = self.sender.send(());
    }

    pub(crate) fn subscribe(&self) -> TopologyCheckRequestReceiver {
        TopologyCheckRequestReceiver {
            receiver: self.sender.subscribe(),
        }
    }
}

pub(crate) struct TopologyCheckRequestReceiver {
    receiver: broadcast::Receiver<()>,
}

impl TopologyCheckRequestReceiver {
    /// Waits until either a check request comes in or the timeout elapses.
    pub(crate) async fn wait_for_check_request(&mut self, timeout: Duration) {
        let _: std::result::Result<_, _> =
            tokio::time::timeout(timeout, self.receiver.recv()).await;
    }

    /// Discard any check requests that arrived while the monitor was busy checking.
    pub(crate) fn clear_check_requests(&mut self) {
        self.receiver = self.receiver.resubscribe();
    }
}

struct AcknowledgedMessage {
    message: UpdateMessage,
    ack: oneshot::Sender<bool>,
}

#[derive(Debug)]
enum UpdateMessage {
    ServerUpdate(Box<ServerDescription>),
    MonitorError {
        address: ServerAddress,
        error: Error,
    },
    ApplicationError {
        address: ServerAddress,
        error: Error,
        phase: HandshakePhase,
    },
    SyncHosts(Vec<ServerAddress>),
    AdvanceClusterTime(ClusterTime),
    Shutdown,
}

/// The background task that owns the authoritative topology state.
struct TopologyWorker {
    id: ObjectId,
    update_receiver: mpsc::UnboundedReceiver<AcknowledgedMessage>,
    publisher: watch::Sender<TopologyState>,
    options: ClientOptions,
    event_emitter: Option<SdamEventEmitter>,
    check_requester: TopologyCheckRequester,
    watcher: TopologyWatcher,
    updater: TopologyUpdater,
    establisher: ConnectionEstablisher,
    metrics: Arc<TopologyMetrics>,

    /// The authoritative copy of the state; mutated here and published to observers by value.
    state: TopologyState,
}

impl TopologyWorker {
    fn start(mut self) {
        runtime::spawn(async move {
            self.initialize().await;

            while let Some(AcknowledgedMessage { message, ack }) = self.update_receiver.recv().await
            {
                let shutdown = matches!(message, UpdateMessage::Shutdown);
                let changed = self.process_message(message).await;
                let _: std::result::Result<_, _> = ack.send(changed);

                if shutdown {
                    break;
                }
            }

            self.emit_event(|id| {
                TopologyClosedEvent { topology_id: id }.into()
            })
            .await;
        });
    }

    async fn initialize(&mut self) {
        self.emit_event(|id| TopologyOpeningEvent { topology_id: id }.into())
            .await;

        let addresses: Vec<_> = self.state.description.servers.keys().cloned().collect();
        for address in addresses {
            self.add_server(address).await;
        }

        if self.state.description.topology_type == TopologyType::LoadBalanced {
            // Load-balanced clients don't have a heartbeat monitor, so the load balancer is
            // marked selectable immediately with an RTT of zero.
            let addresses: Vec<_> = self.state.description.servers.keys().cloned().collect();
            for address in addresses {
                let new_desc = ServerDescription {
                    server_type: ServerType::LoadBalancer,
                    average_round_trip_time: Some(Duration::from_nanos(0)),
                    ..ServerDescription::new(&address)
                };
                self.state
                    .description
                    .servers
                    .insert(address.clone(), new_desc);
                if let Some(server) = self.state.servers.get(&address) {
                    server.pool.mark_as_ready();
                }
            }
        }

        self.emit_event(|id| {
            TopologyDescriptionChangedEvent {
                topology_id: id,
                previous_description: TopologyDescription::default().into(),
                new_description: self.state.description.clone().into(),
            }
            .into()
        })
        .await;

        self.publish_state();

        #[cfg(feature = "dns-resolver")]
        if self.state.description.topology_type != TopologyType::LoadBalanced {
            crate::sdam::srv_polling::SrvPollingMonitor::start(
                self.watcher.clone(),
                self.updater.clone(),
                self.options.clone(),
            );
        }
    }

    async fn process_message(&mut self, message: UpdateMessage) -> bool {
        match message {
            UpdateMessage::ServerUpdate(sd) => self.update_server(*sd).await,
            UpdateMessage::MonitorError { address, error } => {
                self.handle_monitor_error(address, error).await
            }
            UpdateMessage::ApplicationError {
                address,
                error,
                phase,
            } => self.handle_application_error(address, error, phase).await,
            UpdateMessage::SyncHosts(hosts) => {
                let mut new_description = self.state.description.clone();
                new_description.sync_hosts(hosts.into_iter().collect());
                self.apply_new_description(new_description).await
            }
            UpdateMessage::AdvanceClusterTime(cluster_time) => {
                let mut new_description = self.state.description.clone();
                new_description.advance_cluster_time(&cluster_time);
                self.state.description = new_description;
                self.publish_state();
                true
            }
            UpdateMessage::Shutdown => {
                let addresses: Vec<_> = self.state.servers.keys().cloned().collect();
                for address in addresses {
                    self.remove_server(&address).await;
                }
                self.publish_state();
                true
            }
        }
    }

    /// Apply a new server description to the topology, starting and stopping monitors and
    /// waking any blocked server-selection tasks as necessary.
    async fn update_server(&mut self, sd: ServerDescription) -> bool {
        let server_type = sd.server_type;
        let server_address = sd.address.clone();

        let mut new_description = self.state.description.clone();
        if let Err(e) = new_description.update(sd) {
            // This only occurs if a field is accessed from an errored hello reply, which the
            // transition logic never does for Unknown descriptions.
            tracing::warn!(
                target: SDAM_TRACING_EVENT_TARGET,
                "invalid server description received: {}",
                e
            );
            return false;
        }

        let changed = self.apply_new_description(new_description).await;

        if changed {
            if let Some(server) = self.state.servers.get(&server_address) {
                if server_type.is_data_bearing()
                    || (server_type != ServerType::Unknown
                        && self.state.description.topology_type == TopologyType::Single)
                {
                    server.pool.mark_as_ready();
                }
            }
        }

        changed
    }

    async fn handle_monitor_error(&mut self, address: ServerAddress, error: Error) -> bool {
        // The monitor produced this error, so there is no in-progress check to cancel.
        match self.state.servers.get(&address) {
            Some(server) => {
                let description =
                    ServerDescription::new_from_error(address.clone(), error.clone());
                let pool = server.pool.clone();
                let updated = self
                    .update_server(description)
                    .await;
                if updated {
                    // The heartbeat monitor is disabled in load-balanced mode, so this never
                    // has a service id.
                    pool.clear(error, None);
                }
                updated
            }
            None => false,
        }
    }

    async fn handle_application_error(
        &mut self,
        address: ServerAddress,
        error: Error,
        phase: HandshakePhase,
    ) -> bool {
        let server = match self.state.servers.get(&address) {
            Some(server) => server.clone(),
            None => return false,
        };

        // Stale errors from before the most recent pool clear carry no new information.
        match &phase {
            HandshakePhase::PreHello { generation } => {
                match (generation, server.pool.generation()) {
                    (
                        crate::cmap::PoolGeneration::Normal(hgen),
                        crate::cmap::PoolGeneration::Normal(sgen),
                    ) => {
                        if *hgen < sgen {
                            return false;
                        }
                    }
                    // Pre-hello handshake errors are ignored in load-balanced mode.
                    (crate::cmap::PoolGeneration::LoadBalanced(_), _) => return false,
                    _ => return false,
                }
            }
            HandshakePhase::PostHello { generation }
            | HandshakePhase::AfterCompletion { generation, .. } => {
                if generation.is_stale(&server.pool.generation()) {
                    return false;
                }
            }
        }

        let is_load_balanced =
            self.state.description.topology_type == TopologyType::LoadBalanced;

        if error.is_state_change_error() {
            let updated =
                is_load_balanced || self.mark_server_as_unknown(&address, error.clone()).await;

            if updated && (error.is_shutting_down() || phase.wire_version().unwrap_or(0) < 8) {
                server.pool.clear(error, phase.service_id());
            }
            self.check_requester.request();

            updated
        } else if error.is_non_timeout_network_error()
            || (phase.is_before_completion()
                && (error.is_auth_error()
                    || error.is_network_timeout()
                    || error.is_command_error()))
        {
            let updated = if is_load_balanced {
                true
            } else {
                self.mark_server_as_unknown(&address, error.clone()).await
            };
            if updated {
                server.pool.clear(error, phase.service_id());
                server.cancel_monitor_check();
            }
            updated
        } else {
            false
        }
    }

    /// Marks a server in the cluster as unknown due to the given `error`.
    async fn mark_server_as_unknown(&mut self, address: &ServerAddress, error: Error) -> bool {
        let description = ServerDescription::new_from_error(address.clone(), error);
        self.update_server(description).await
    }

    /// Swaps in the new description, reconciling the server set, emitting SDAM events for the
    /// differences, and publishing the new state. Returns whether anything changed.
    async fn apply_new_description(&mut self, new_description: TopologyDescription) -> bool {
        let old_description =
            std::mem::replace(&mut self.state.description, new_description.clone());

        let diff = match old_description.diff(&new_description) {
            Some(diff) => diff,
            None => return false,
        };

        let added: Vec<_> = diff.added_addresses.into_iter().cloned().collect();
        let removed: Vec<_> = diff.removed_addresses.into_iter().cloned().collect();
        let changed: Vec<_> = diff
            .changed_servers
            .into_iter()
            .map(|(address, (old, new))| (address.clone(), old.clone(), new.clone()))
            .collect();

        for address in added {
            self.add_server(address).await;
        }

        for address in removed {
            self.remove_server(&address).await;
        }

        for (address, old, new) in changed {
            self.emit_event(|id| {
                ServerDescriptionChangedEvent {
                    address,
                    topology_id: id,
                    previous_description: ServerInfo::new_owned(old),
                    new_description: ServerInfo::new_owned(new),
                }
                .into()
            })
            .await;
        }

        self.emit_event(|id| {
            TopologyDescriptionChangedEvent {
                topology_id: id,
                previous_description: old_description.into(),
                new_description: new_description.into(),
            }
            .into()
        })
        .await;

        self.publish_state();

        true
    }

    /// Creates the server handle and its pool and starts a monitor for it.
    async fn add_server(&mut self, address: ServerAddress) {
        if self.state.servers.contains_key(&address) {
            return;
        }

        let server = Server::new(
            address.clone(),
            &self.options,
            self.establisher.clone(),
            self.updater.clone(),
            self.metrics.clone(),
        );
        self.state.servers.insert(address.clone(), server.clone());

        // The monitor consults the published state to decide whether its server still
        // exists, so the new server must be visible there before the monitor starts.
        self.publish_state();

        self.emit_event(|id| {
            ServerOpeningEvent {
                address: address.clone(),
                topology_id: id,
            }
            .into()
        })
        .await;

        #[cfg(test)]
        let disable_monitoring = self
            .options
            .test_options
            .as_ref()
            .map(|to| to.disable_monitoring_threads)
            .unwrap_or(false);
        #[cfg(not(test))]
        let disable_monitoring = false;

        // Load balancers are not monitored; their state never changes from the synthesized
        // description.
        if self.state.description.topology_type != TopologyType::LoadBalanced
            && !disable_monitoring
        {
            Monitor::start(
                address,
                self.updater.clone(),
                self.watcher.clone(),
                self.event_emitter.clone(),
                self.check_requester.subscribe(),
                server.subscribe_to_cancellations(),
                self.metrics.clone(),
                self.options.clone(),
            );
        }
    }

    /// Drops the server handle; its pool worker and monitor wind down on their own once the
    /// handle disappears from the published state.
    async fn remove_server(&mut self, address: &ServerAddress) {
        if self.state.servers.remove(address).is_some() {
            let address = address.clone();
            self.emit_event(|id| {
                ServerClosedEvent {
                    address,
                    topology_id: id,
                }
                .into()
            })
            .await;
        }
    }

    fn publish_state(&self) {
        let _: std::result::Result<_, _> = self.publisher.send(self.state.clone());
    }

    async fn emit_event<F>(&self, make_event: F)
    where
        F: FnOnce(ObjectId) -> crate::event::sdam::SdamEvent,
    {
        if let Some(ref emitter) = self.event_emitter {
            emitter.emit(make_event(self.id)).await;
        }
    }
}
