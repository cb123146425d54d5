//! connpool: host-keyed connection pools with live statistics and timed
//! refresh.
//!
//! A [`PoolRegistry`] keeps one [`HostPool`] per backend host. Callers
//! check connections out through the registry, use them, and check them
//! back in. A [`Refresher`] periodically refreshes connections that sat
//! idle too long, and a [`StatsAggregator`] turns the pools' counters
//! into a [`ConnPoolStats`] document grouped by topology.
//!
//! # Modules
//!
//! - [`connection`]: a pooled connection and its state machine
//! - [`host_pool`]: bounded connection set for one host
//! - [`registry`]: host → pool map, topology changes, runtime parameters
//! - [`refresher`]: background idle-connection refresh loop
//! - [`stats`]: statistics snapshot and aggregation
//! - [`topology`]: known hosts and their replica group labels
//! - [`dedicated`]: connections opened outside pool accounting
//! - [`transport`]: wire abstraction, with a TCP implementation
//! - [`config`]: runtime configuration and parameter updates

pub mod config;
pub mod connection;
pub mod dedicated;
pub mod error;
pub mod host_pool;
pub mod refresher;
pub mod registry;
pub mod stats;
pub mod topology;
pub mod transport;

mod tasks;

pub use config::{ParameterUpdate, PoolConfig};
pub use connection::{Connection, ConnectionId};
pub use dedicated::{ConnectionGauges, DedicatedConnection, DedicatedKind};
pub use error::{PoolError, PoolResult};
pub use host_pool::{CheckinOutcome, HostPool, PoolSnapshot};
pub use refresher::Refresher;
pub use registry::PoolRegistry;
pub use stats::{ConnPoolStats, GroupStats, HostStats, PoolStats, StatsAggregator};
pub use topology::TopologyView;
pub use transport::tcp::TcpTransport;
pub use transport::{Transport, TransportConnection};

pub use connpool_core::{ConnectionState, HostAddr};
