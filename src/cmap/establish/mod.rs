pub(crate) mod handshake;

use bson::oid::ObjectId;

use self::handshake::{Handshaker, HandshakerOptions};
use super::{
    conn::{Connection, ConnectionGeneration, PendingConnection},
    options::ConnectionPoolOptions,
    PoolGeneration,
};
use crate::error::{Error, Result};

/// Contains the logic to establish a connection, including handshaking and compressor
/// negotiation.
#[derive(Clone, Debug)]
pub(crate) struct ConnectionEstablisher {
    handshaker: Handshaker,
    options: ConnectionPoolOptions,
}

impl ConnectionEstablisher {
    /// Creates a new ConnectionEstablisher from the given options.
    pub(crate) fn new(options: ConnectionPoolOptions) -> Result<Self> {
        let handshaker = Handshaker::new(HandshakerOptions::from(&options))?;
        Ok(Self {
            handshaker,
            options,
        })
    }

    /// Establishes a connection: opens the stream, performs the handshake, and records which
    /// load balancer backend it is pinned to, if any.
    pub(crate) async fn establish_connection(
        &self,
        pending_connection: PendingConnection,
    ) -> std::result::Result<Connection, EstablishError> {
        let pool_generation = pending_connection.generation.clone();

        let mut connection = Connection::connect_pending(pending_connection, &self.options)
            .await
            .map_err(|e| EstablishError::pre_hello(e, pool_generation.clone()))?;

        let hello_reply = self
            .handshaker
            .handshake(&mut connection)
            .await
            .map_err(|e| EstablishError::post_hello(e, connection.generation.clone()))?;

        if let PoolGeneration::LoadBalanced(ref gen_map) = pool_generation {
            let service_id = hello_reply.command_response.service_id;
            let generation = service_id
                .and_then(|sid| gen_map.get(&sid).copied())
                .unwrap_or(0);
            connection.generation = ConnectionGeneration::LoadBalanced {
                generation,
                service_id,
            };
        }

        Ok(connection)
    }
}

/// An error that occurred during connection establishment, labeled with the phase the
/// handshake had reached so the topology can tell whether pooled connections predate it.
#[derive(Debug, Clone)]
pub(crate) struct EstablishError {
    pub(crate) cause: Error,
    pub(crate) handshake_phase: HandshakePhase,
}

impl EstablishError {
    fn pre_hello(cause: Error, generation: PoolGeneration) -> Self {
        Self {
            cause,
            handshake_phase: HandshakePhase::PreHello { generation },
        }
    }

    fn post_hello(cause: Error, generation: ConnectionGeneration) -> Self {
        Self {
            cause,
            handshake_phase: HandshakePhase::PostHello { generation },
        }
    }
}

/// The phase a connection's handshake had reached when an error occurred.
#[derive(Debug, Clone)]
pub(crate) enum HandshakePhase {
    /// The stream failed before the hello reply was received.
    PreHello { generation: PoolGeneration },

    /// The hello completed but later establishment steps failed.
    PostHello { generation: ConnectionGeneration },

    /// The handshake finished; the error came from operation execution.
    AfterCompletion {
        generation: ConnectionGeneration,
        max_wire_version: Option<i32>,
    },
}

impl HandshakePhase {
    pub(crate) fn after_completion(connection: &Connection) -> Self {
        Self::AfterCompletion {
            generation: connection.generation.clone(),
            max_wire_version: connection
                .stream_description()
                .ok()
                .and_then(|sd| sd.max_wire_version),
        }
    }

    /// The `serviceId` reported by the server, if any.
    pub(crate) fn service_id(&self) -> Option<ObjectId> {
        match self {
            HandshakePhase::PreHello { .. } => None,
            HandshakePhase::PostHello { generation, .. }
            | HandshakePhase::AfterCompletion { generation, .. } => generation.service_id(),
        }
    }

    /// The wire version of the server, if known.
    pub(crate) fn wire_version(&self) -> Option<i32> {
        match self {
            HandshakePhase::AfterCompletion {
                max_wire_version, ..
            } => *max_wire_version,
            _ => None,
        }
    }

    /// Whether this phase precedes the completion of the handshake.
    pub(crate) fn is_before_completion(&self) -> bool {
        !matches!(self, HandshakePhase::AfterCompletion { .. })
    }
}
