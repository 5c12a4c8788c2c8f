//! The connection-string, server-discovery-and-monitoring, and
//! server-selection core of a MongoDB driver.
//!
//! This crate turns a MongoDB connection string into a live, health-monitored
//! set of server connections and routes each operation to an appropriate
//! server. It contains the URI parser and validator, the topology state
//! machine driven by per-server `hello` monitors, read-preference-aware server
//! selection, and per-server connection pools with generation-based
//! invalidation. Higher-level driver concerns (CRUD APIs, cursors, GridFS,
//! client-side encryption) are intentionally absent.
//!
//! ```no_run
//! # use mongodb_core::{error::Result, Client};
//! # async fn run() -> Result<()> {
//! let client = Client::with_uri_str("mongodb://localhost:27017/?replicaSet=rs0").await?;
//! let reply = client
//!     .run_command("admin", mongodb_core::bson::doc! { "ping": 1 }, None)
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![warn(clippy::cast_possible_truncation)]
#![warn(clippy::cast_possible_wrap)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

#[macro_use]
pub mod options;

pub use ::bson;

mod bson_util;
mod client;
mod cmap;
mod compression;
mod concern;
pub mod error;
pub mod event;
mod hello;
mod metrics;
pub(crate) mod runtime;
mod sdam;
mod selection_criteria;
mod serde_util;
mod srv;
mod trace;

pub use crate::{
    client::{Client, ClusterTime},
    metrics::TopologyMetrics,
};

pub use sdam::public::*;

/// A boxed future.
pub type BoxFuture<'a, T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;
