//! Wire transport abstraction.
//!
//! The pool never speaks a wire protocol itself. A [`Transport`] opens
//! physical connections to a host and a [`TransportConnection`] moves
//! opaque bytes and answers liveness pings. Tests inject a mock; the
//! admin CLI uses [`tcp::TcpTransport`].

pub mod tcp;

#[cfg(test)]
pub(crate) mod mock;

use std::future::Future;
use std::pin::Pin;

use connpool_core::HostAddr;

/// Boxed, sendable future returned by transport methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Opens physical connections. Injected so tests can replace it.
pub trait Transport: Send + Sync {
    /// Establish a new connection to `host`.
    fn connect<'a>(
        &'a self,
        host: &'a HostAddr,
    ) -> BoxFuture<'a, Result<Box<dyn TransportConnection>, String>>;
}

/// One established physical connection.
pub trait TransportConnection: Send + Sync + std::fmt::Debug {
    /// Send bytes over the connection. Returns bytes sent.
    fn send<'a>(&'a mut self, data: &'a [u8]) -> BoxFuture<'a, Result<usize, String>>;
    /// Receive up to `max_bytes` from the connection.
    fn recv(&mut self, max_bytes: usize) -> BoxFuture<'_, Result<Vec<u8>, String>>;
    /// Liveness round-trip used by refresh. `Ok(())` means the connection is alive.
    fn ping(&mut self) -> BoxFuture<'_, Result<(), String>>;
    /// Close the underlying transport.
    fn close(&mut self);
}
