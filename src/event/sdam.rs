//! Contains the events and functionality for monitoring Server Discovery and Monitoring.

use std::{collections::HashMap, sync::Arc, time::Duration};

use bson::{oid::ObjectId, Document};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::{
    error::Error,
    options::ServerAddress,
    runtime,
    sdam::public::{ServerInfo, TopologyType},
    serde_util,
};

/// A description of the most up-to-date information known about a server. Further details can
/// be found in the [Server Discovery and Monitoring specification](https://specifications.readthedocs.io/en/latest/server-discovery-and-monitoring/server-discovery-and-monitoring/).
pub type ServerDescription = ServerInfo<'static>;

/// A description of the most up-to-date information known about a topology.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct TopologyDescription {
    pub(crate) inner: crate::sdam::TopologyDescription,
}

impl TopologyDescription {
    /// The type of the topology.
    pub fn topology_type(&self) -> TopologyType {
        self.inner.topology_type
    }

    /// The replica set name of the topology, if any.
    pub fn set_name(&self) -> Option<&str> {
        self.inner.set_name.as_deref()
    }

    /// A description of the compatibility issue between the driver and the deployment, if any.
    pub fn compatibility_error(&self) -> Option<&str> {
        self.inner.compatibility_error.as_deref()
    }

    /// The servers in this topology.
    pub fn servers(&self) -> HashMap<&ServerAddress, ServerInfo> {
        self.inner
            .servers
            .iter()
            .map(|(address, description)| (address, ServerInfo::new_borrowed(description)))
            .collect()
    }
}

impl From<crate::sdam::TopologyDescription> for TopologyDescription {
    fn from(inner: crate::sdam::TopologyDescription) -> Self {
        Self { inner }
    }
}

/// Published when a server description changes.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerDescriptionChangedEvent {
    /// The address of the server.
    pub address: ServerAddress,

    /// The unique ID of the topology.
    pub topology_id: ObjectId,

    /// The server's previous description.
    pub previous_description: ServerDescription,

    /// The server's new description.
    pub new_description: ServerDescription,
}

/// Published when a server is initialized.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ServerOpeningEvent {
    /// The address of the server.
    pub address: ServerAddress,

    /// The unique ID of the topology.
    #[serde(skip)]
    pub topology_id: ObjectId,
}

/// Published when a server is closed.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ServerClosedEvent {
    /// The address of the server.
    pub address: ServerAddress,

    /// The unique ID of the topology.
    #[serde(skip)]
    pub topology_id: ObjectId,
}

/// Published when a topology description changes.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct TopologyDescriptionChangedEvent {
    /// The ID of the topology.
    pub topology_id: ObjectId,

    /// The topology's previous description.
    pub previous_description: TopologyDescription,

    /// The topology's new description.
    pub new_description: TopologyDescription,
}

/// Published when a topology is initialized.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct TopologyOpeningEvent {
    /// The unique ID of the topology.
    pub topology_id: ObjectId,
}

/// Published when a topology is closed. Note that this event will not be published until the
/// client associated with the topology is shut down or dropped.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct TopologyClosedEvent {
    /// The unique ID of the topology.
    pub topology_id: ObjectId,
}

/// Published when a server monitor's `hello` or legacy hello command is started.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ServerHeartbeatStartedEvent {
    /// The address of the server.
    pub server_address: ServerAddress,

    /// Determines if this heartbeat event is from an awaitable `hello`.
    pub awaited: bool,
}

/// Published when a server monitor's `hello` or legacy hello command succeeds.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ServerHeartbeatSucceededEvent {
    /// The execution time of the event.
    pub duration: Duration,

    /// The reply to the `hello` or legacy hello command.
    pub reply: Document,

    /// The address of the server.
    pub server_address: ServerAddress,

    /// Determines if this heartbeat event is from an awaitable `hello`.
    pub awaited: bool,
}

/// Published when a server monitor's `hello` or legacy hello command fails.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ServerHeartbeatFailedEvent {
    /// The execution time of the event.
    pub duration: Duration,

    /// The failure that occurred.
    #[serde(serialize_with = "serde_util::serialize_error_as_string")]
    pub failure: Error,

    /// The address of the server.
    pub server_address: ServerAddress,

    /// Determines if this heartbeat event is from an awaitable `hello`.
    pub awaited: bool,
}

/// An event related to server discovery and monitoring.
#[derive(Clone, Debug)]
#[allow(missing_docs)]
#[non_exhaustive]
pub enum SdamEvent {
    ServerDescriptionChanged(Box<ServerDescriptionChangedEvent>),
    ServerOpening(ServerOpeningEvent),
    ServerClosed(ServerClosedEvent),
    TopologyDescriptionChanged(Box<TopologyDescriptionChangedEvent>),
    TopologyOpening(TopologyOpeningEvent),
    TopologyClosed(TopologyClosedEvent),
    ServerHeartbeatStarted(ServerHeartbeatStartedEvent),
    ServerHeartbeatSucceeded(ServerHeartbeatSucceededEvent),
    ServerHeartbeatFailed(ServerHeartbeatFailedEvent),
}

/// Applications can implement this trait to specify custom logic to run on each SDAM event
/// sent by the driver.
///
/// Handlers are invoked from a dedicated dispatcher task, never under the topology's internal
/// state, so they may block briefly or call back into the client without risk of deadlock.
///
/// ```rust
/// # use std::sync::Arc;
/// #
/// # use mongodb_core::{
/// #     error::Result,
/// #     event::sdam::{SdamEventHandler, ServerHeartbeatFailedEvent},
/// #     options::ClientOptions,
/// #     Client,
/// # };
/// #
/// struct FailedHeartbeatLogger;
///
/// impl SdamEventHandler for FailedHeartbeatLogger {
///     fn handle_server_heartbeat_failed_event(&self, event: ServerHeartbeatFailedEvent) {
///         eprintln!("Failed server heartbeat: {:?}", event);
///     }
/// }
///
/// # async fn run() -> Result<()> {
/// let mut options = ClientOptions::parse("mongodb://localhost:27017").await?;
/// options.sdam_event_handler = Some(Arc::new(FailedHeartbeatLogger));
/// let client = Client::with_options(options)?;
///
/// // Do things with the client, and failed server heartbeats will be logged to stderr.
/// # Ok(())
/// # }
/// ```
pub trait SdamEventHandler: Send + Sync {
    /// A [`Client`](crate::Client) will call this method on each registered handler when
    /// a server description changes.
    fn handle_server_description_changed_event(&self, _event: ServerDescriptionChangedEvent) {}

    /// A [`Client`](crate::Client) will call this method on each registered handler when
    /// a server is initialized.
    fn handle_server_opening_event(&self, _event: ServerOpeningEvent) {}

    /// A [`Client`](crate::Client) will call this method on each registered handler when
    /// a server is closed.
    fn handle_server_closed_event(&self, _event: ServerClosedEvent) {}

    /// A [`Client`](crate::Client) will call this method on each registered handler when
    /// its topology description changes.
    fn handle_topology_description_changed_event(&self, _event: TopologyDescriptionChangedEvent) {}

    /// A [`Client`](crate::Client) will call this method on each registered handler when
    /// its topology is initialized.
    fn handle_topology_opening_event(&self, _event: TopologyOpeningEvent) {}

    /// A [`Client`](crate::Client) will call this method on each registered handler when
    /// its topology closes.
    fn handle_topology_closed_event(&self, _event: TopologyClosedEvent) {}

    /// A [`Client`](crate::Client) will call this method on each registered handler when
    /// a server heartbeat begins.
    fn handle_server_heartbeat_started_event(&self, _event: ServerHeartbeatStartedEvent) {}

    /// A [`Client`](crate::Client) will call this method on each registered handler when
    /// a server heartbeat succeeds.
    fn handle_server_heartbeat_succeeded_event(&self, _event: ServerHeartbeatSucceededEvent) {}

    /// A [`Client`](crate::Client) will call this method on each registered handler when
    /// a server heartbeat fails.
    fn handle_server_heartbeat_failed_event(&self, _event: ServerHeartbeatFailedEvent) {}
}

const EVENT_CHANNEL_CAPACITY: usize = 500;

/// Hands events off to a dispatcher task that invokes the user's handler, so emission
/// never runs under the topology's internal state.
#[derive(Clone, Debug)]
pub(crate) struct SdamEventEmitter {
    sender: mpsc::Sender<SdamEvent>,
}

impl SdamEventEmitter {
    pub(crate) fn new(handler: Arc<dyn SdamEventHandler>) -> Self {
        let (sender, mut receiver) = mpsc::channel::<SdamEvent>(EVENT_CHANNEL_CAPACITY);
        runtime::spawn(async move {
            while let Some(event) = receiver.recv().await {
                dispatch(handler.as_ref(), event);
            }
        });
        Self { sender }
    }

    pub(crate) async fn emit(&self, event: impl Into<SdamEvent>) {
        // The receiver is only dropped on shutdown; any events emitted after that
        // can be discarded.
        let _: Result<_, _> = self.sender.send(event.into()).await;
    }
}

fn dispatch(handler: &dyn SdamEventHandler, event: SdamEvent) {
    match event {
        SdamEvent::ServerDescriptionChanged(e) => {
            handler.handle_server_description_changed_event(*e)
        }
        SdamEvent::ServerOpening(e) => handler.handle_server_opening_event(e),
        SdamEvent::ServerClosed(e) => handler.handle_server_closed_event(e),
        SdamEvent::TopologyDescriptionChanged(e) => {
            handler.handle_topology_description_changed_event(*e)
        }
        SdamEvent::TopologyOpening(e) => handler.handle_topology_opening_event(e),
        SdamEvent::TopologyClosed(e) => handler.handle_topology_closed_event(e),
        SdamEvent::ServerHeartbeatStarted(e) => handler.handle_server_heartbeat_started_event(e),
        SdamEvent::ServerHeartbeatSucceeded(e) => {
            handler.handle_server_heartbeat_succeeded_event(e)
        }
        SdamEvent::ServerHeartbeatFailed(e) => handler.handle_server_heartbeat_failed_event(e),
    }
}

impl From<ServerDescriptionChangedEvent> for SdamEvent {
    fn from(event: ServerDescriptionChangedEvent) -> Self {
        Self::ServerDescriptionChanged(Box::new(event))
    }
}

impl From<ServerOpeningEvent> for SdamEvent {
    fn from(event: ServerOpeningEvent) -> Self {
        Self::ServerOpening(event)
    }
}

impl From<ServerClosedEvent> for SdamEvent {
    fn from(event: ServerClosedEvent) -> Self {
        Self::ServerClosed(event)
    }
}

impl From<TopologyDescriptionChangedEvent> for SdamEvent {
    fn from(event: TopologyDescriptionChangedEvent) -> Self {
        Self::TopologyDescriptionChanged(Box::new(event))
    }
}

impl From<TopologyOpeningEvent> for SdamEvent {
    fn from(event: TopologyOpeningEvent) -> Self {
        Self::TopologyOpening(event)
    }
}

impl From<TopologyClosedEvent> for SdamEvent {
    fn from(event: TopologyClosedEvent) -> Self {
        Self::TopologyClosed(event)
    }
}

impl From<ServerHeartbeatStartedEvent> for SdamEvent {
    fn from(event: ServerHeartbeatStartedEvent) -> Self {
        Self::ServerHeartbeatStarted(event)
    }
}

impl From<ServerHeartbeatSucceededEvent> for SdamEvent {
    fn from(event: ServerHeartbeatSucceededEvent) -> Self {
        Self::ServerHeartbeatSucceeded(event)
    }
}

impl From<ServerHeartbeatFailedEvent> for SdamEvent {
    fn from(event: ServerHeartbeatFailedEvent) -> Self {
        Self::ServerHeartbeatFailed(event)
    }
}
