pub(crate) mod command;
mod stream_description;
pub(crate) mod wire;

use std::time::{Duration, Instant};

use bson::oid::ObjectId;
use tokio::io::BufStream;

use self::wire::{Message, MessageFlags};
use crate::{
    cmap::{manager::PoolManager, options::ConnectionPoolOptions, PoolGeneration},
    compression::Compressor,
    error::{Error, ErrorKind, Result},
    metrics::TopologyMetrics,
    options::{ServerAddress, TlsOptions},
    runtime::{self, AsyncStream},
};

pub(crate) use self::{command::{Command, RawCommandResponse}, stream_description::StreamDescription};

/// A wrapper around a stream to a server plus the state needed to route commands over it.
#[derive(Debug)]
pub(crate) struct Connection {
    pub(crate) id: u32,

    pub(crate) address: ServerAddress,

    pub(crate) generation: ConnectionGeneration,

    stream: BufStream<AsyncStream>,

    /// The cached result of the handshake performed when this connection was established.
    stream_description: Option<StreamDescription>,

    /// The compressor negotiated during the handshake, if any.
    pub(crate) compressor: Option<Compressor>,

    /// Whether the server has indicated it will stream additional replies on this stream
    /// without further requests.
    more_to_come: bool,

    /// Whether a fatal error was observed on this connection.
    error: Option<Error>,

    /// The time when this connection was last checked into the pool.
    ready_and_available_time: Option<Instant>,

    /// A timeout applied to each read and write on this stream.
    socket_timeout: Option<Duration>,

    /// The manager used to check this connection back into its pool when dropped. Not set for
    /// monitoring connections, which are never pooled.
    pub(super) pool_manager: Option<PoolManager>,
}

impl Connection {
    fn new(
        id: u32,
        address: ServerAddress,
        generation: ConnectionGeneration,
        stream: AsyncStream,
        socket_timeout: Option<Duration>,
    ) -> Self {
        Self {
            id,
            address,
            generation,
            stream: BufStream::new(stream),
            stream_description: None,
            compressor: None,
            more_to_come: false,
            error: None,
            ready_and_available_time: None,
            socket_timeout,
            pool_manager: None,
        }
    }

    /// Opens a pooled connection for the given pending-connection slot.
    pub(crate) async fn connect_pending(
        pending: PendingConnection,
        options: &ConnectionPoolOptions,
    ) -> Result<Self> {
        let stream = AsyncStream::connect(
            &pending.address,
            options.connect_timeout,
            options.tls_options.as_ref(),
        )
        .await?;
        Ok(Self::new(
            pending.id,
            pending.address,
            pending.generation.into(),
            stream,
            options.socket_timeout,
        ))
    }

    /// Opens a connection for monitoring. Monitoring connections are never pooled, and their
    /// reads are bounded by the connect timeout rather than the socket timeout.
    pub(crate) async fn connect_monitoring(
        address: ServerAddress,
        connect_timeout: Option<Duration>,
        tls_options: Option<TlsOptions>,
    ) -> Result<Self> {
        let stream = AsyncStream::connect(&address, connect_timeout, tls_options.as_ref()).await?;
        let timeout = connect_timeout.unwrap_or(runtime::DEFAULT_CONNECT_TIMEOUT);
        let timeout = if timeout == Duration::from_secs(0) {
            None
        } else {
            Some(timeout)
        };
        Ok(Self::new(
            0,
            address,
            ConnectionGeneration::Monitoring,
            stream,
            timeout,
        ))
    }

    /// Constructs a connection over an in-memory stream for tests.
    #[cfg(test)]
    pub(crate) fn new_mock(address: ServerAddress, stream: tokio::io::DuplexStream) -> Self {
        Self::new(
            0,
            address,
            ConnectionGeneration::Monitoring,
            AsyncStream::Mock(stream),
            None,
        )
    }

    pub(crate) fn stream_description(&self) -> Result<&StreamDescription> {
        self.stream_description.as_ref().ok_or_else(|| {
            ErrorKind::Internal {
                message: "Stream checked out but not handshaked".to_string(),
            }
            .into()
        })
    }

    pub(crate) fn set_stream_description(&mut self, description: StreamDescription) {
        self.stream_description = Some(description);
    }

    /// Overrides the read/write timeout, e.g. to extend it for an awaitable hello.
    pub(crate) fn set_socket_timeout(&mut self, timeout: Option<Duration>) {
        self.socket_timeout = timeout;
    }

    pub(crate) fn is_streaming(&self) -> bool {
        self.more_to_come
    }

    pub(crate) fn has_errored(&self) -> bool {
        self.error.is_some()
    }

    /// Sends a command over the wire and reads the reply, recording any network error so the
    /// pool can discard this connection.
    pub(crate) async fn send_command(&mut self, command: Command) -> Result<RawCommandResponse> {
        // Servers below wire version 6 only understand the legacy framing, which suffices
        // for the monitoring traffic that is all this crate sends them.
        if let Some(ref sd) = self.stream_description {
            if !sd.supports_op_msg() {
                return self.send_handshake(command).await;
            }
        }

        let to_compress = command.should_compress();
        let message = Message::with_command(command, None);

        let result = self.send_message(message, to_compress).await;
        self.record_error(&result);
        result
    }

    /// Sends a command using the legacy OP_QUERY framing, as done for the first handshake on a
    /// fresh stream.
    pub(crate) async fn send_handshake(&mut self, command: Command) -> Result<RawCommandResponse> {
        let message = Message::with_command(command, None);
        let result = async {
            with_timeout(
                self.socket_timeout,
                message.write_op_query_to(&mut self.stream),
            )
            .await?;
            self.read_response().await
        }
        .await;
        self.record_error(&result);
        result
    }

    async fn send_message(
        &mut self,
        message: Message,
        to_compress: bool,
    ) -> Result<RawCommandResponse> {
        if self.more_to_come {
            return Err(Error::internal(format!(
                "attempted to send a new message to {} while the response to a previous message \
                 is still being streamed",
                self.address,
            )));
        }

        match self.compressor {
            Some(ref compressor) if to_compress => {
                let compressor = compressor.clone();
                with_timeout(
                    self.socket_timeout,
                    message.write_compressed_to(&mut self.stream, &compressor),
                )
                .await?
            }
            _ => with_timeout(self.socket_timeout, message.write_to(&mut self.stream)).await?,
        }

        self.read_response().await
    }

    /// Reads the next reply on this stream without sending anything, i.e. the next message of
    /// an exhaust stream.
    pub(crate) async fn receive_message(&mut self) -> Result<RawCommandResponse> {
        if !self.more_to_come {
            return Err(Error::internal(format!(
                "attempted to stream a response from {} when the server did not indicate more \
                 responses were incoming",
                self.address,
            )));
        }

        let result = self.read_response().await;
        self.record_error(&result);
        result
    }

    async fn read_response(&mut self) -> Result<RawCommandResponse> {
        let message =
            with_timeout(self.socket_timeout, Message::read_from(&mut self.stream)).await?;

        self.more_to_come = message.flags.contains(MessageFlags::MORE_TO_COME);

        RawCommandResponse::new(self.address.clone(), message)
    }

    fn record_error(&mut self, result: &Result<RawCommandResponse>) {
        if let Err(e) = result {
            if e.is_network_error() {
                self.error = Some(e.clone());
                self.more_to_come = false;
            }
        }
    }

    pub(crate) fn mark_as_in_use(&mut self, manager: PoolManager) {
        self.pool_manager = Some(manager);
        self.ready_and_available_time = None;
    }

    pub(crate) fn mark_as_available(&mut self) {
        self.pool_manager = None;
        self.ready_and_available_time = Some(Instant::now());
    }

    /// Checks if the connection is idle, per the provided max idle time.
    pub(crate) fn is_idle(&self, max_idle_time: Option<Duration>) -> bool {
        self.ready_and_available_time
            .and_then(|ready_and_available_time| {
                max_idle_time.map(|max_idle_time| {
                    Instant::now().duration_since(ready_and_available_time) >= max_idle_time
                })
            })
            .unwrap_or(false)
    }

    /// Close this connection, emitting the metric for why it was closed.
    pub(crate) fn close_and_drop(mut self, metrics: Option<&TopologyMetrics>) {
        self.pool_manager.take();
        if let Some(metrics) = metrics {
            metrics.increment_connections_closed();
        }
    }

    /// Nullify the inner state and return it in a new `Connection` for checking back into the
    /// pool.
    fn take(&mut self) -> Connection {
        Connection {
            id: self.id,
            address: self.address.clone(),
            generation: self.generation.clone(),
            stream: std::mem::replace(&mut self.stream, BufStream::new(AsyncStream::Null)),
            stream_description: self.stream_description.take(),
            compressor: self.compressor.take(),
            more_to_come: self.more_to_come,
            error: self.error.take(),
            ready_and_available_time: None,
            socket_timeout: self.socket_timeout,
            pool_manager: None,
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // If the connection has a pool manager, that means that the connection is
        // being dropped when it's checked out. If the pool is still alive, it
        // should check itself back in. Otherwise, the connection should close itself.
        if let Some(pool_manager) = self.pool_manager.take() {
            let dropped_connection = self.take();
            pool_manager.check_in(dropped_connection);
        }
    }
}

/// The generation of a connection, used to discard connections opened before a known failure.
#[derive(Debug, Clone)]
pub(crate) enum ConnectionGeneration {
    /// Monitoring connections are never pooled and so are exempt from generation-based
    /// invalidation.
    Monitoring,

    Normal(u32),

    LoadBalanced {
        generation: u32,
        service_id: Option<ObjectId>,
    },
}

impl ConnectionGeneration {
    pub(crate) fn is_stale(&self, pool_generation: &PoolGeneration) -> bool {
        match (self, pool_generation) {
            (ConnectionGeneration::Monitoring, _) => false,
            (ConnectionGeneration::Normal(cgen), PoolGeneration::Normal(pgen)) => cgen < pgen,
            (
                ConnectionGeneration::LoadBalanced {
                    generation: cgen,
                    service_id: Some(sid),
                },
                PoolGeneration::LoadBalanced(gen_map),
            ) => cgen < gen_map.get(sid).unwrap_or(&0),
            _ => false,
        }
    }

    pub(crate) fn service_id(&self) -> Option<ObjectId> {
        match self {
            ConnectionGeneration::LoadBalanced { service_id, .. } => *service_id,
            _ => None,
        }
    }
}

impl From<PoolGeneration> for ConnectionGeneration {
    fn from(gen: PoolGeneration) -> Self {
        match gen {
            PoolGeneration::Normal(gen) => ConnectionGeneration::Normal(gen),
            PoolGeneration::LoadBalanced(_) => ConnectionGeneration::LoadBalanced {
                generation: 0,
                service_id: None,
            },
        }
    }
}

/// A request for a new connection made before the connection has been established; tracked so
/// the pool's connection counts stay accurate if establishment fails.
#[derive(Debug)]
pub(crate) struct PendingConnection {
    pub(crate) id: u32,
    pub(crate) address: ServerAddress,
    pub(crate) generation: PoolGeneration,
}

/// Awaits `future`, bounding it by `timeout` when one is set. Expiry surfaces as a network
/// timeout error.
async fn with_timeout<T>(
    timeout: Option<Duration>,
    future: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    match timeout {
        Some(timeout) => runtime::timeout(timeout, future).await?,
        None => future.await,
    }
}
