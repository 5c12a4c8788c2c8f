//! Contains the events and functionality for monitoring the behavior of a
//! [`Client`](crate::Client)'s topology.

pub mod sdam;
