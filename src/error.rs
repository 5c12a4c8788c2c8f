//! Contains the `Error` and `Result` types that `mongodb-core` uses.

use std::{
    collections::HashSet,
    fmt::{self, Debug},
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{options::ServerAddress, sdam::TopologyVersion};

const RECOVERING_CODES: [i32; 5] = [11600, 11602, 13436, 189, 91];
const NOTWRITABLEPRIMARY_CODES: [i32; 3] = [10107, 13435, 10058];
const SHUTTING_DOWN_CODES: [i32; 2] = [11600, 91];
const STATE_CHANGE_RETRY_CODES: [i32; 11] =
    [11600, 11602, 10107, 13435, 13436, 189, 91, 7, 6, 89, 9001];

/// Retryable write error label. This label will be added to an error when the error is
/// write-retryable.
pub const RETRYABLE_WRITE_ERROR: &str = "RetryableWriteError";

/// The result type for all methods that can return an error in the `mongodb-core` crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error that can occur in the `mongodb-core` crate. The inner
/// [`ErrorKind`] is boxed to allow the errors to be cloned cheaply and to keep
/// the type small.
#[derive(Clone, Debug, Error)]
#[error("Kind: {kind}, labels: {labels:?}")]
#[non_exhaustive]
pub struct Error {
    /// The type of error that occurred.
    pub kind: Box<ErrorKind>,
    labels: HashSet<String>,
    pub(crate) wire_version: Option<i32>,
    #[source]
    pub(crate) source: Option<Box<Error>>,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind, labels: Option<impl IntoIterator<Item = String>>) -> Self {
        let labels: HashSet<String> = labels
            .map(|labels| labels.into_iter().collect())
            .unwrap_or_default();
        Self {
            kind: Box::new(kind),
            labels,
            wire_version: None,
            source: None,
        }
    }

    pub(crate) fn pool_cleared_error(address: &ServerAddress, cause: &Error) -> Self {
        ErrorKind::ConnectionPoolCleared {
            message: format!(
                "Connection pool for {} cleared because another operation failed with: {}",
                address, cause
            ),
        }
        .into()
    }

    pub(crate) fn internal(message: impl Into<String>) -> Error {
        ErrorKind::Internal {
            message: message.into(),
        }
        .into()
    }

    /// Construct a generic network timeout error.
    pub(crate) fn network_timeout() -> Error {
        ErrorKind::Io(Arc::new(std::io::ErrorKind::TimedOut.into())).into()
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Error {
        ErrorKind::InvalidArgument {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn invalid_uri(message: impl Into<String>) -> Error {
        ErrorKind::InvalidUri {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn invalid_response(message: impl Into<String>) -> Error {
        ErrorKind::InvalidResponse {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn cancelled(message: impl Into<String>) -> Error {
        ErrorKind::Cancelled {
            message: message.into(),
        }
        .into()
    }

    /// Whether the error indicates that the server transitioned out of a state in which it can
    /// serve the operation (stepdown, recovery, or shutdown).
    pub(crate) fn is_state_change_error(&self) -> bool {
        self.is_recovering() || self.is_notwritableprimary()
    }

    pub(crate) fn is_auth_error(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Authentication { .. })
    }

    pub(crate) fn is_command_error(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Command(_))
    }

    pub(crate) fn is_network_timeout(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::TimedOut)
    }

    pub(crate) fn is_non_timeout_network_error(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Io(ref io_err) if io_err.kind() != std::io::ErrorKind::TimedOut)
    }

    pub(crate) fn is_network_error(&self) -> bool {
        matches!(
            self.kind.as_ref(),
            ErrorKind::Io(..) | ErrorKind::ConnectionPoolCleared { .. }
        )
    }

    #[allow(unused)]
    pub(crate) fn is_incompatible_server(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::IncompatibleServer { .. })
    }

    /// Whether a read operation should be retried if this error occurs.
    ///
    /// The retry loop itself lives outside this crate; callers consult this
    /// classification to decide.
    pub fn is_read_retryable(&self) -> bool {
        if self.is_network_error() {
            return true;
        }
        match self.sdam_code() {
            Some(code) => STATE_CHANGE_RETRY_CODES.contains(&code),
            None => false,
        }
    }

    /// Whether a write operation should be retried if this error occurs.
    pub fn is_write_retryable(&self) -> bool {
        self.contains_label(RETRYABLE_WRITE_ERROR) || self.is_read_retryable()
    }

    /// Returns the labels for this error.
    pub fn labels(&self) -> &HashSet<String> {
        &self.labels
    }

    /// Whether this error contains the specified label.
    pub fn contains_label<T: AsRef<str>>(&self, label: T) -> bool {
        self.labels().contains(label.as_ref())
    }

    /// Adds the given label to this error.
    #[allow(unused)]
    pub(crate) fn add_label<T: AsRef<str>>(&mut self, label: T) {
        let label = label.as_ref().to_string();
        self.labels.insert(label);
    }

    #[cfg(feature = "dns-resolver")]
    pub(crate) fn from_resolve_error(error: hickory_resolver::error::ResolveError) -> Self {
        ErrorKind::DnsResolve {
            message: error.to_string(),
        }
        .into()
    }

    #[cfg(feature = "dns-resolver")]
    pub(crate) fn from_resolve_proto_error(error: hickory_proto::error::ProtoError) -> Self {
        ErrorKind::DnsResolve {
            message: error.to_string(),
        }
        .into()
    }

    /// Gets the code from this error for performing topology updates, if applicable.
    pub(crate) fn sdam_code(&self) -> Option<i32> {
        match self.kind.as_ref() {
            ErrorKind::Command(command_error) => Some(command_error.code),
            _ => None,
        }
        .or_else(|| self.source.as_ref().and_then(|s| s.sdam_code()))
    }

    /// Gets the message for this error, if applicable, for use in testing.
    #[cfg(test)]
    pub(crate) fn message(&self) -> Option<String> {
        match self.kind.as_ref() {
            ErrorKind::Command(command_error) => Some(command_error.message.clone()),
            ErrorKind::InvalidUri { message }
            | ErrorKind::InvalidArgument { message }
            | ErrorKind::IncompatibleServer { message }
            | ErrorKind::ServerSelection { message } => Some(message.clone()),
            _ => None,
        }
    }

    /// If this error corresponds to a "not writable primary" error as per the SDAM spec.
    pub(crate) fn is_notwritableprimary(&self) -> bool {
        self.sdam_code()
            .map(|code| NOTWRITABLEPRIMARY_CODES.contains(&code))
            .unwrap_or(false)
    }

    /// If this error corresponds to a "node is recovering" error as per the SDAM spec.
    pub(crate) fn is_recovering(&self) -> bool {
        self.sdam_code()
            .map(|code| RECOVERING_CODES.contains(&code))
            .unwrap_or(false)
    }

    /// If this error corresponds to a "node is shutting down" error as per the SDAM spec.
    pub(crate) fn is_shutting_down(&self) -> bool {
        self.sdam_code()
            .map(|code| SHUTTING_DOWN_CODES.contains(&code))
            .unwrap_or(false)
    }

    pub(crate) fn with_source<E: Into<Option<Error>>>(mut self, source: E) -> Self {
        self.source = source.into().map(Box::new);
        self
    }

    pub(crate) fn topology_version(&self) -> Option<TopologyVersion> {
        match self.kind.as_ref() {
            ErrorKind::Command(c) => c.topology_version,
            _ => None,
        }
    }
}

impl<E> From<E> for Error
where
    ErrorKind: From<E>,
{
    fn from(err: E) -> Self {
        Error::new(err.into(), None::<Option<String>>)
    }
}

impl From<bson::de::Error> for ErrorKind {
    fn from(err: bson::de::Error) -> Self {
        Self::InvalidResponse {
            message: err.to_string(),
        }
    }
}

impl From<bson::ser::Error> for ErrorKind {
    fn from(err: bson::ser::Error) -> Self {
        Self::Internal {
            message: err.to_string(),
        }
    }
}

impl From<std::io::Error> for ErrorKind {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<std::io::ErrorKind> for ErrorKind {
    fn from(err: std::io::ErrorKind) -> Self {
        Self::Io(Arc::new(err.into()))
    }
}

/// The types of errors that can occur.
#[allow(missing_docs)]
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The connection string was malformed or contained invalid or conflicting options.
    #[error("Invalid connection string: {message}")]
    #[non_exhaustive]
    InvalidUri { message: String },

    /// An invalid argument was provided.
    #[error("An invalid argument was provided: {message}")]
    #[non_exhaustive]
    InvalidArgument { message: String },

    /// The credentials in the connection string failed mechanism-level validation.
    #[error("{message}")]
    #[non_exhaustive]
    Authentication { message: String },

    /// The server returned an error to an attempted operation.
    #[error("Command failed: {0}")]
    Command(CommandError),

    /// An error occurred during DNS resolution.
    #[error("An error occurred during DNS resolution: {message}")]
    #[non_exhaustive]
    DnsResolve { message: String },

    #[error("Internal error: {message}")]
    #[non_exhaustive]
    Internal { message: String },

    /// Wrapper around [`std::io::Error`]. Timeouts are reported with
    /// [`std::io::ErrorKind::TimedOut`].
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// The connection pool for a server was cleared during operation execution due to
    /// a concurrent error, causing the operation to fail.
    #[error("{message}")]
    #[non_exhaustive]
    ConnectionPoolCleared { message: String },

    /// The server returned a malformed or unexpected reply: bad framing, a
    /// missing field, or a field of the wrong type.
    #[error("The server returned an invalid reply: {message}")]
    #[non_exhaustive]
    InvalidResponse { message: String },

    /// No server could be selected for the operation within the server selection timeout.
    #[error("{message}")]
    #[non_exhaustive]
    ServerSelection { message: String },

    #[error("{message}")]
    #[non_exhaustive]
    InvalidTlsConfig { message: String },

    /// The deployment's wire version range does not overlap the range this crate supports.
    #[error("The server is incompatible with this driver version: {message}")]
    #[non_exhaustive]
    IncompatibleServer { message: String },

    /// An in-flight operation was interrupted, e.g. a monitor check cancelled after an
    /// application thread observed a network error on the same server.
    #[error("Operation cancelled: {message}")]
    #[non_exhaustive]
    Cancelled { message: String },

    /// A method was called on a client that was shut down.
    #[error("Client has been shut down")]
    Shutdown,
}

/// An error that occurred due to a database command failing.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[non_exhaustive]
pub struct CommandError {
    /// Identifies the type of error.
    pub code: i32,

    /// The name associated with the error code.
    #[serde(rename = "codeName", default)]
    pub code_name: String,

    /// A description of the error that occurred.
    #[serde(rename = "errmsg", default = "String::new")]
    pub message: String,

    /// The topology version reported by the server in the error response.
    #[serde(rename = "topologyVersion")]
    pub(crate) topology_version: Option<TopologyVersion>,
}

impl fmt::Display for CommandError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(
            fmt,
            "Error code {} ({}): {}",
            self.code, self.code_name, self.message
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn command_error(code: i32) -> Error {
        ErrorKind::Command(CommandError {
            code,
            code_name: Default::default(),
            message: Default::default(),
            topology_version: None,
        })
        .into()
    }

    #[test]
    fn state_change_codes_classified() {
        assert!(command_error(10107).is_notwritableprimary());
        assert!(command_error(13435).is_notwritableprimary());
        // InterruptedAtShutdown is both recovering and shutting down.
        assert!(command_error(11600).is_recovering());
        assert!(command_error(11600).is_shutting_down());
        assert!(command_error(91).is_shutting_down());
        assert!(!command_error(8000).is_state_change_error());
    }

    #[test]
    fn network_errors_are_retryable() {
        let io_err: Error = ErrorKind::from(std::io::ErrorKind::ConnectionReset).into();
        assert!(io_err.is_read_retryable());
        assert!(io_err.is_network_error());
        assert!(!io_err.is_network_timeout());

        let timeout = Error::network_timeout();
        assert!(timeout.is_network_timeout());
        assert!(timeout.is_read_retryable());
    }

    #[test]
    fn retryable_code_table() {
        for code in [11600, 11602, 10107, 13435, 13436, 189, 91, 7, 6, 89, 9001] {
            assert!(command_error(code).is_read_retryable(), "code {}", code);
        }
        assert!(!command_error(26).is_read_retryable());
    }
}
