//! Error types for the connection pool subsystem.

use std::time::Duration;

use connpool_core::{ConnectionState, HostAddr};
use thiserror::Error;

use crate::connection::ConnectionId;

/// Result type alias for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Errors surfaced by connections, host pools and the registry.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to establish connection to {host}: {reason}")]
    Establish { host: HostAddr, reason: String },

    #[error("connection pool exhausted for {host} (waited {waited:?})")]
    PoolExhausted { host: HostAddr, waited: Duration },

    #[error("refresh of connection {id} to {host} failed: {reason}")]
    RefreshFailed {
        host: HostAddr,
        id: ConnectionId,
        reason: String,
    },

    #[error("connection pool is shutting down")]
    ShuttingDown,

    #[error("connection pool for {host} is draining, no new checkouts accepted")]
    Draining { host: HostAddr },

    #[error("connection {id} is not checked out from the pool for {host}")]
    UnknownConnection { host: HostAddr, id: ConnectionId },

    #[error("connection {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: ConnectionId,
        from: ConnectionState,
        to: ConnectionState,
    },

    #[error("transport error on connection {id}: {reason}")]
    Transport { id: ConnectionId, reason: String },

    #[error("transport error on dedicated connection to {host}: {reason}")]
    DedicatedTransport { host: HostAddr, reason: String },

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
}
