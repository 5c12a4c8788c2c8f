pub(crate) mod auth;
pub(crate) mod options;
pub(crate) mod session;

use std::{cmp::Ordering, sync::Arc};

use bson::{doc, Document, Timestamp};
use serde::{Deserialize, Serialize};

use self::session::ServerSessionPool;
use crate::{
    cmap::{establish::HandshakePhase, Command},
    error::Result,
    event::sdam::TopologyDescription,
    metrics::TopologyMetrics,
    options::{ClientOptions, SelectionCriteria},
    sdam::{SelectedServer, Topology, TopologyType},
    selection_criteria::ReadPreference,
};

/// Struct modeling the cluster time reported by the server in `$clusterTime`, attached to
/// outgoing commands for causal consistency.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ClusterTime {
    pub(crate) cluster_time: Timestamp,
    pub(crate) signature: Document,
}

impl ClusterTime {
    pub(crate) fn to_document(&self) -> Document {
        doc! {
            "clusterTime": self.cluster_time,
            "signature": self.signature.clone(),
        }
    }
}

impl std::cmp::Eq for ClusterTime {}

impl std::cmp::PartialEq for ClusterTime {
    fn eq(&self, other: &Self) -> bool {
        self.cluster_time == other.cluster_time
    }
}

impl std::cmp::Ord for ClusterTime {
    fn cmp(&self, other: &Self) -> Ordering {
        let lhs = (self.cluster_time.time, self.cluster_time.increment);
        let rhs = (other.cluster_time.time, other.cluster_time.increment);
        lhs.cmp(&rhs)
    }
}

impl std::cmp::PartialOrd for ClusterTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// The entry point to the crate: a handle to a monitored deployment.
///
/// A `Client` owns the topology (one monitor task per server plus a connection pool per
/// server) and routes each operation to a server chosen by the server selection algorithm.
/// `Client` uses [`std::sync::Arc`] internally, so it can be shared or cloned across tasks
/// cheaply.
///
/// Dropping the last clone of a `Client` shuts down its monitors and closes its pools.
#[derive(Clone, Debug)]
pub struct Client {
    inner: Arc<ClientInner>,
}

#[derive(Debug)]
struct ClientInner {
    topology: Topology,
    options: ClientOptions,
    session_pool: ServerSessionPool,
}

impl Client {
    /// Creates a new `Client` connected to the cluster specified by `uri`. SRV and TXT
    /// lookups are performed as part of this method when the `mongodb+srv` scheme is used.
    pub async fn with_uri_str(uri: impl AsRef<str>) -> Result<Self> {
        let options = ClientOptions::parse(uri.as_ref()).await?;

        Client::with_options(options)
    }

    /// Creates a new `Client` with the given options.
    ///
    /// This method spawns the monitoring tasks and so must be called from within a tokio
    /// runtime.
    pub fn with_options(options: ClientOptions) -> Result<Self> {
        options.validate()?;

        let inner = Arc::new(ClientInner {
            topology: Topology::new(options.clone())?,
            session_pool: ServerSessionPool::new(),
            options,
        });

        Ok(Self { inner })
    }

    /// The options this client was created with.
    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    /// The counters describing this client's monitoring and pooling activity.
    pub fn metrics(&self) -> Arc<TopologyMetrics> {
        self.inner.topology.metrics().clone()
    }

    /// The current view of the deployment: its type, servers, and compatibility with this
    /// crate.
    pub fn topology_description(&self) -> TopologyDescription {
        self.inner.topology.description().into()
    }

    /// The highest `$clusterTime` this client has observed, if any.
    pub fn cluster_time(&self) -> Option<ClusterTime> {
        self.inner.topology.cluster_time()
    }

    /// Runs a database command on a server selected per `selection_criteria`, defaulting to
    /// the client-wide criteria and then to a primary read preference.
    ///
    /// The command is augmented with the client's current `$clusterTime` and a pooled
    /// session id; errors are fed back into the topology so that state-change and network
    /// errors mark the server Unknown and invalidate its pooled connections.
    pub async fn run_command(
        &self,
        db: impl AsRef<str>,
        command: Document,
        selection_criteria: Option<SelectionCriteria>,
    ) -> Result<Document> {
        let command_name = command
            .keys()
            .next()
            .ok_or_else(|| {
                crate::error::Error::invalid_argument("an empty document cannot be run as a command")
            })?
            .clone();

        let criteria = selection_criteria
            .or_else(|| self.inner.options.selection_criteria.clone())
            .unwrap_or(SelectionCriteria::ReadPreference(ReadPreference::Primary));

        let server = self.select_server(&criteria).await?;

        let mut cmd = Command::new(command_name, db.as_ref(), command);

        if let Some(cluster_time) = self.inner.topology.cluster_time() {
            cmd.set_cluster_time(&cluster_time);
        }

        // Mongos performs its own selection from the read preference, so non-primary
        // preferences are forwarded to it.
        if matches!(
            self.inner.topology.topology_type(),
            TopologyType::Sharded | TopologyType::LoadBalanced
        ) {
            if let SelectionCriteria::ReadPreference(ref read_pref) = criteria {
                if !matches!(read_pref, ReadPreference::Primary) {
                    cmd.set_read_preference(read_pref.clone());
                }
            }
        }

        let logical_session_timeout = self.inner.topology.logical_session_timeout();
        let mut session = self
            .inner
            .session_pool
            .check_out(logical_session_timeout)
            .await;
        cmd.body.insert("lsid", session.id.clone());

        let mut connection = match server.pool.check_out().await {
            Ok(connection) => connection,
            Err(error) => {
                self.inner.topology.request_update();
                return Err(error);
            }
        };

        let result = connection.send_command(cmd).await;

        let response = match result {
            Ok(response) => response,
            Err(error) => {
                // A session that saw a network error may still be open server-side; it is
                // not returned to the pool.
                session.mark_dirty();
                self.inner
                    .session_pool
                    .check_in(session, logical_session_timeout)
                    .await;

                self.inner
                    .topology
                    .handle_application_error(
                        server.address().clone(),
                        error.clone(),
                        HandshakePhase::after_completion(&connection),
                    )
                    .await;
                return Err(error);
            }
        };

        if let Some(cluster_time) = response.cluster_time() {
            self.inner.topology.advance_cluster_time(cluster_time).await;
        }

        session.update_last_use();
        self.inner
            .session_pool
            .check_in(session, logical_session_timeout)
            .await;

        if let Err(error) = response.validate() {
            self.inner
                .topology
                .handle_application_error(
                    server.address().clone(),
                    error.clone(),
                    HandshakePhase::after_completion(&connection),
                )
                .await;
            return Err(error);
        }

        Ok(response.into_body())
    }

    /// Selects a server per the criteria and the deployment's current topology, waiting up
    /// to the configured server selection timeout for one to become available.
    pub(crate) async fn select_server(
        &self,
        criteria: &SelectionCriteria,
    ) -> Result<SelectedServer> {
        self.inner.topology.select_server(criteria).await
    }

    /// Shuts down this client, stopping its monitors and closing its connection pools. Any
    /// clones of the client become unusable afterwards; their operations fail with
    /// [`ErrorKind::Shutdown`](crate::error::ErrorKind::Shutdown).
    pub async fn shutdown(self) {
        self.inner.topology.shutdown().await;
    }

    /// Whether the client has been shut down.
    pub fn is_shut_down(&self) -> bool {
        !self.inner.topology.is_alive()
    }
}
