//! Event targets used when emitting tracing events.

/// Target for events related to connection string parsing and validation.
pub(crate) const CONNECTION_STRING_TRACING_EVENT_TARGET: &str = "mongodb_core::uri";

/// Target for events related to topology changes and server monitoring.
pub(crate) const SDAM_TRACING_EVENT_TARGET: &str = "mongodb_core::sdam";

/// Target for events related to server selection.
pub(crate) const SERVER_SELECTION_TRACING_EVENT_TARGET: &str = "mongodb_core::server_selection";

/// Target for events related to connections and connection pools.
pub(crate) const CONNECTION_TRACING_EVENT_TARGET: &str = "mongodb_core::connection";
