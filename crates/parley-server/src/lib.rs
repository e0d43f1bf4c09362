//! # parley-server
//!
//! The relay core and its HTTP/WebSocket surface.
//!
//! - [`manager::ConnectionManager`] owns the active session set and enforces one
//!   live session per identity; it routes inbound events to typed handlers and
//!   fans outbound events out to sessions
//! - [`websocket`] runs the reader/writer loop pair of every admitted socket
//! - [`bridge::QueueBridge`] consumes worker results (and their dead-letter
//!   queue) and hands them to the manager
//! - [`server::ParleyServer`] serves the upgrade, pre-check, health and metrics
//!   routes and coordinates graceful shutdown

#![deny(unsafe_code)]

pub mod bridge;
pub mod config;
pub mod errors;
pub mod health;
pub mod manager;
pub mod metrics;
pub mod server;
pub mod shutdown;
pub mod websocket;

#[cfg(test)]
pub(crate) mod test_support;

pub use errors::{BridgeError, ManagerError, RouteError};
