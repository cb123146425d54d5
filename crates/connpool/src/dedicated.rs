//! Connections opened outside pool accounting.
//!
//! A [`DedicatedConnection`] belongs to one caller for its whole life and
//! never returns to a host pool, so it is never counted in `created`.
//! Live handles are tracked by [`ConnectionGauges`] instead.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use connpool_core::HostAddr;
use tracing::debug;

use crate::error::{PoolError, PoolResult};
use crate::transport::TransportConnection;

/// Process-wide counts of live dedicated connections.
#[derive(Debug, Default)]
pub struct ConnectionGauges {
    client: AtomicU64,
    scoped: AtomicU64,
}

impl ConnectionGauges {
    /// Live dedicated connections of either kind.
    pub fn client(&self) -> u64 {
        self.client.load(Ordering::Relaxed)
    }

    /// Live scoped connections (a subset of [`client`](Self::client)).
    pub fn scoped(&self) -> u64 {
        self.scoped.load(Ordering::Relaxed)
    }
}

/// Whether a dedicated connection is also counted as scoped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DedicatedKind {
    Client,
    Scoped,
}

/// RAII handle for a dedicated connection. Dropping it closes the
/// transport and releases its gauge slots.
#[derive(Debug)]
pub struct DedicatedConnection {
    host: HostAddr,
    kind: DedicatedKind,
    transport: Box<dyn TransportConnection>,
    gauges: Arc<ConnectionGauges>,
}

impl DedicatedConnection {
    pub(crate) fn new(
        host: HostAddr,
        kind: DedicatedKind,
        transport: Box<dyn TransportConnection>,
        gauges: Arc<ConnectionGauges>,
    ) -> Self {
        gauges.client.fetch_add(1, Ordering::Relaxed);
        if kind == DedicatedKind::Scoped {
            gauges.scoped.fetch_add(1, Ordering::Relaxed);
        }
        debug!(%host, ?kind, "opened dedicated connection");
        Self {
            host,
            kind,
            transport,
            gauges,
        }
    }

    pub fn host(&self) -> &HostAddr {
        &self.host
    }

    pub fn kind(&self) -> DedicatedKind {
        self.kind
    }

    pub async fn send(&mut self, data: &[u8]) -> PoolResult<usize> {
        self.transport
            .send(data)
            .await
            .map_err(|reason| PoolError::DedicatedTransport {
                host: self.host.clone(),
                reason,
            })
    }

    pub async fn recv(&mut self, max_bytes: usize) -> PoolResult<Vec<u8>> {
        self.transport
            .recv(max_bytes)
            .await
            .map_err(|reason| PoolError::DedicatedTransport {
                host: self.host.clone(),
                reason,
            })
    }
}

impl Drop for DedicatedConnection {
    fn drop(&mut self) {
        self.transport.close();
        self.gauges.client.fetch_sub(1, Ordering::Relaxed);
        if self.kind == DedicatedKind::Scoped {
            self.gauges.scoped.fetch_sub(1, Ordering::Relaxed);
        }
        debug!(host = %self.host, kind = ?self.kind, "closed dedicated connection");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Transport;
    use crate::transport::mock::MockTransport;

    #[tokio::test]
    async fn gauges_follow_handle_lifetime() {
        let (transport, controls) = MockTransport::new();
        let gauges = Arc::new(ConnectionGauges::default());
        let host = HostAddr::from("db.local:27017");

        let client = DedicatedConnection::new(
            host.clone(),
            DedicatedKind::Client,
            transport.connect(&host).await.unwrap(),
            gauges.clone(),
        );
        let scoped = DedicatedConnection::new(
            host.clone(),
            DedicatedKind::Scoped,
            transport.connect(&host).await.unwrap(),
            gauges.clone(),
        );
        assert_eq!((gauges.client(), gauges.scoped()), (2, 1));

        drop(scoped);
        assert_eq!((gauges.client(), gauges.scoped()), (1, 0));
        drop(client);
        assert_eq!((gauges.client(), gauges.scoped()), (0, 0));
        assert_eq!(controls.closes(), 2);
    }
}
