pub(crate) mod conn;
mod connection_requester;
pub(crate) mod establish;
mod manager;
pub(crate) mod options;
mod status;
mod worker;

use std::{collections::HashMap, sync::Arc, time::Duration};

use bson::oid::ObjectId;

pub(crate) use self::{
    conn::{Command, Connection, RawCommandResponse, StreamDescription},
    status::PoolGenerationSubscriber,
};
use self::{
    connection_requester::{ConnectionRequestResult, ConnectionRequester},
    establish::ConnectionEstablisher,
    manager::PoolManager,
    options::ConnectionPoolOptions,
    worker::ConnectionPoolWorker,
};
use crate::{
    error::{Error, Result},
    metrics::TopologyMetrics,
    options::ServerAddress,
    runtime,
    sdam::TopologyUpdater,
};

pub(crate) const DEFAULT_MAX_POOL_SIZE: u32 = 10;

/// A pool of connections to a single server implementing the CMAP pausable-pool model.
/// The pool itself is just a set of channel endpoints; the state lives in a worker task.
#[derive(Clone, Debug)]
pub(crate) struct ConnectionPool {
    address: ServerAddress,
    manager: PoolManager,
    connection_requester: ConnectionRequester,
    generation_subscriber: PoolGenerationSubscriber,
    wait_queue_timeout: Option<Duration>,
}

impl ConnectionPool {
    pub(crate) fn new(
        address: ServerAddress,
        establisher: ConnectionEstablisher,
        server_updater: TopologyUpdater,
        metrics: Arc<TopologyMetrics>,
        options: ConnectionPoolOptions,
    ) -> Self {
        let (connection_requester, request_receiver) = connection_requester::channel();
        let (manager, management_receiver) = manager::channel();
        let is_load_balanced = options.load_balanced.unwrap_or(false);
        let generation = if is_load_balanced {
            PoolGeneration::load_balanced()
        } else {
            PoolGeneration::normal()
        };
        let (generation_publisher, generation_subscriber) = status::channel(generation);

        ConnectionPoolWorker::start(
            address.clone(),
            establisher,
            server_updater,
            metrics,
            &options,
            request_receiver,
            manager.clone(),
            management_receiver,
            generation_publisher,
        );

        Self {
            address,
            manager,
            connection_requester,
            generation_subscriber,
            wait_queue_timeout: options.wait_queue_timeout,
        }
    }

    /// Checks out a connection from the pool. This method will block until this thread is at
    /// the front of the wait queue, and then will block again if no available connections are
    /// in the pool and the total number of connections is not less than the max pool size.
    pub(crate) async fn check_out(&self) -> Result<Connection> {
        let response = match self.wait_queue_timeout {
            Some(timeout) => runtime::timeout(timeout, self.connection_requester.request())
                .await
                .map_err(|_| {
                    Error::network_timeout().with_source(Error::internal(format!(
                        "timed out waiting for a connection to {} to become available",
                        self.address
                    )))
                })?,
            None => self.connection_requester.request().await,
        };

        let conn = match response {
            ConnectionRequestResult::Pooled(c) => Ok(*c),
            ConnectionRequestResult::Establishing(task) => task
                .await
                .map_err(|e| Error::internal(format!("connection establishment task failed: {}", e)))?,
            ConnectionRequestResult::PoolCleared(e) => {
                Err(Error::pool_cleared_error(&self.address, &e))
            }
        }?;

        Ok(conn)
    }

    /// Increments the generation of the pool. Rather than eagerly removing stale connections
    /// from the pool, they are left for the background task to clean up.
    pub(crate) fn clear(&self, cause: Error, service_id: Option<ObjectId>) {
        self.manager.clear(cause, service_id);
    }

    /// Marks the pool as "ready" as per the CMAP specification, allowing connections to be
    /// created and checked out.
    pub(crate) fn mark_as_ready(&self) {
        self.manager.mark_as_ready();
    }

    pub(crate) fn generation(&self) -> PoolGeneration {
        self.generation_subscriber.generation()
    }
}

/// The current generation of a pool: a single counter for ordinary deployments, or one
/// counter per backend service id when connected through a load balancer.
#[derive(Debug, Clone)]
pub(crate) enum PoolGeneration {
    Normal(u32),
    LoadBalanced(HashMap<ObjectId, u32>),
}

impl PoolGeneration {
    pub(crate) fn normal() -> Self {
        Self::Normal(0)
    }

    pub(crate) fn load_balanced() -> Self {
        Self::LoadBalanced(HashMap::new())
    }
}

#[cfg(test)]
mod test;
