use std::time::Duration;

use bson::oid::ObjectId;

use crate::{hello::HelloReply, options::ServerAddress, sdam::ServerType};

/// Information about the server as reported by the handshake on a given stream.
#[derive(Debug, Default, Clone)]
pub(crate) struct StreamDescription {
    /// The address of the server.
    pub(crate) server_address: ServerAddress,

    /// The type of the server when the handshake occurred.
    pub(crate) initial_server_type: ServerType,

    /// The maximum wire version that the server understands.
    pub(crate) max_wire_version: Option<i32>,

    /// The minimum wire version that the server understands.
    pub(crate) min_wire_version: Option<i32>,

    /// The supported authentication mechanisms for the handshake user, if any.
    pub(crate) sasl_supported_mechs: Option<Vec<String>>,

    /// The time that a session remains active after its most recent use.
    pub(crate) logical_session_timeout: Option<Duration>,

    /// The maximum size of a BSON object the server accepts.
    pub(crate) max_bson_object_size: i64,

    /// The maximum size of a wire protocol message the server accepts.
    pub(crate) max_message_size_bytes: i32,

    /// Whether the server supports the newer `hello` command for monitoring.
    pub(crate) hello_ok: bool,

    /// The id of the load balancer backend this stream is pinned to, if any.
    pub(crate) service_id: Option<ObjectId>,
}

impl StreamDescription {
    /// Constructs a new StreamDescription from a `HelloReply`.
    pub(crate) fn from_hello_reply(reply: &HelloReply) -> Self {
        Self {
            server_address: reply.server_address.clone(),
            initial_server_type: reply.command_response.server_type(),
            max_wire_version: reply.command_response.max_wire_version,
            min_wire_version: reply.command_response.min_wire_version,
            sasl_supported_mechs: reply.command_response.sasl_supported_mechs.clone(),
            logical_session_timeout: reply
                .command_response
                .logical_session_timeout_minutes
                .map(|minutes| Duration::from_secs(minutes as u64 * 60)),
            max_bson_object_size: reply
                .command_response
                .max_bson_object_size
                .unwrap_or(16 * 1024 * 1024),
            max_message_size_bytes: reply
                .command_response
                .max_message_size_bytes
                .unwrap_or(48_000_000),
            hello_ok: reply.command_response.hello_ok.unwrap_or(false),
            service_id: reply.command_response.service_id,
        }
    }

    /// Whether this stream supports OP_MSG, i.e. the server is at least 3.6.
    pub(crate) fn supports_op_msg(&self) -> bool {
        self.max_wire_version.unwrap_or(0) >= 6
    }
}
