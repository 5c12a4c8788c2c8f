use tokio::sync::{mpsc, oneshot};

use super::Connection;
use crate::error::{Error, Result};

/// Returns a new requester/receiver pair.
pub(crate) fn channel() -> (ConnectionRequester, ConnectionRequestReceiver) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (
        ConnectionRequester { sender },
        ConnectionRequestReceiver { receiver },
    )
}

/// Handle for requesting Connections from the pool. The pool worker stays alive as long as at
/// least one requester is alive.
#[derive(Clone, Debug)]
pub(crate) struct ConnectionRequester {
    sender: mpsc::UnboundedSender<ConnectionRequest>,
}

impl ConnectionRequester {
    /// Request a connection from the pool that owns the receiver end of this requester.
    pub(crate) async fn request(&self) -> ConnectionRequestResult {
        let (sender, receiver) = oneshot::channel();

        // The send will only fail if the pool has been dropped, in which case the error
        // returned below applies.
        let _: std::result::Result<_, _> = self.sender.send(ConnectionRequest { sender });

        receiver.await.unwrap_or_else(|_| {
            ConnectionRequestResult::PoolCleared(Error::internal(
                "connection pool worker dropped without responding to request",
            ))
        })
    }
}

pub(crate) struct ConnectionRequestReceiver {
    receiver: mpsc::UnboundedReceiver<ConnectionRequest>,
}

impl ConnectionRequestReceiver {
    pub(crate) async fn recv(&mut self) -> Option<ConnectionRequest> {
        self.receiver.recv().await
    }
}

/// Struct encapsulating a request for a connection.
#[derive(Debug)]
pub(crate) struct ConnectionRequest {
    sender: oneshot::Sender<ConnectionRequestResult>,
}

impl ConnectionRequest {
    /// Respond to the connection request, either with a pooled connection or one that is
    /// establishing asynchronously.
    pub(crate) fn fulfill(
        self,
        result: ConnectionRequestResult,
    ) -> std::result::Result<(), ConnectionRequestResult> {
        self.sender.send(result).map_err(|result| result)
    }
}

#[derive(Debug)]
pub(crate) enum ConnectionRequestResult {
    /// A connection that was already established and was simply checked out of the pool.
    Pooled(Box<Connection>),

    /// A new connection in the process of being established.
    /// The handle can be awaited upon to receive the established connection.
    Establishing(tokio::task::JoinHandle<Result<Connection>>),

    /// The request was rejected because the pool was cleared before it could
    /// be fulfilled. The error that caused the pool to be cleared is returned.
    PoolCleared(Error),
}

impl ConnectionRequestResult {
    pub(crate) fn unwrap_pooled_connection(self) -> Connection {
        match self {
            ConnectionRequestResult::Pooled(c) => *c,
            _ => panic!("attempted to unwrap pooled connection when was establishing"),
        }
    }
}
