use bson::oid::ObjectId;
use tokio::sync::mpsc;

use super::Connection;
use crate::error::Error;

/// Returns a manager and the receiver through which its requests flow to the pool worker.
pub(crate) fn channel() -> (PoolManager, ManagementRequestReceiver) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (
        PoolManager { sender },
        ManagementRequestReceiver { receiver },
    )
}

/// Struct used to make management requests to the pool (e.g. checking in a connection).
/// A PoolManager will NOT keep a pool from going out of scope and closing.
#[derive(Clone, Debug)]
pub(crate) struct PoolManager {
    sender: mpsc::UnboundedSender<PoolManagementRequest>,
}

impl PoolManager {
    /// Clear the pool, rendering all the connections in it or checked out from it stale.
    pub(crate) fn clear(&self, cause: Error, service_id: Option<ObjectId>) {
        let _: std::result::Result<_, _> = self
            .sender
            .send(PoolManagementRequest::Clear { cause, service_id });
    }

    /// Mark the pool as ready, allowing connections to be created and checked out.
    pub(crate) fn mark_as_ready(&self) {
        let _: std::result::Result<_, _> =
            self.sender.send(PoolManagementRequest::MarkAsReady);
    }

    /// Check the given connection back into the pool.
    pub(crate) fn check_in(&self, connection: Connection) {
        if let Err(request) = self
            .sender
            .send(PoolManagementRequest::CheckIn(Box::new(connection)))
        {
            // The pool worker is gone; the connection just closes.
            if let PoolManagementRequest::CheckIn(connection) = request.0 {
                connection.close_and_drop(None);
            }
        }
    }

    /// Notify the pool that establishing a connection succeeded.
    pub(crate) fn handle_connection_succeeded(&self, connection: ConnectionSucceeded) {
        let _: std::result::Result<_, _> = self
            .sender
            .send(PoolManagementRequest::HandleConnectionSucceeded(connection));
    }

    /// Notify the pool that establishing a connection failed.
    pub(crate) fn handle_connection_failed(&self) {
        let _: std::result::Result<_, _> = self
            .sender
            .send(PoolManagementRequest::HandleConnectionFailed);
    }
}

pub(crate) struct ManagementRequestReceiver {
    pub(crate) receiver: mpsc::UnboundedReceiver<PoolManagementRequest>,
}

impl ManagementRequestReceiver {
    pub(crate) async fn recv(&mut self) -> Option<PoolManagementRequest> {
        self.receiver.recv().await
    }
}

/// The requests a pool manager can make of its pool worker.
#[derive(Debug)]
pub(crate) enum PoolManagementRequest {
    /// Clear the pool, i.e. increment the generation.
    Clear {
        cause: Error,
        service_id: Option<ObjectId>,
    },

    /// Mark the pool as ready.
    MarkAsReady,

    /// Check in the given connection.
    CheckIn(Box<Connection>),

    /// Update the pool based on the given establishment success.
    HandleConnectionSucceeded(ConnectionSucceeded),

    /// Update the pool after an establishment failure.
    HandleConnectionFailed,
}

/// The result of a successful connection establishment: either the connection went straight to
/// a waiting request, or it should be stored in the pool.
#[derive(Debug)]
pub(crate) enum ConnectionSucceeded {
    ForPool(Box<Connection>),
    Used { service_id: Option<ObjectId> },
}

impl ConnectionSucceeded {
    pub(crate) fn service_id(&self) -> Option<ObjectId> {
        match self {
            ConnectionSucceeded::ForPool(conn) => conn.generation.service_id(),
            ConnectionSucceeded::Used { service_id, .. } => *service_id,
        }
    }
}
