//! A single pooled connection and its lifecycle state machine.
//!
//! ```text
//! Connecting ──▶ Ready ◀──▶ InUse
//!                  │ ▲
//!                  ▼ │
//!               Refreshing ──▶ Failed
//! ```
//!
//! `last_used_at` is only stamped when a checked-out connection comes
//! back, so a connection that was handed out but never returned still
//! counts as never used.

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

use connpool_core::{ConnectionState, HostAddr};

use crate::error::{PoolError, PoolResult};
use crate::transport::{Transport, TransportConnection};

/// Opaque connection identifier, unique within one host pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub(crate) u64);

impl ConnectionId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A physical connection to one host, owned by its host pool while idle
/// and by the caller while checked out.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    host: HostAddr,
    state: ConnectionState,
    created_at: Instant,
    last_used_at: Option<Instant>,
    last_refreshed_at: Option<Instant>,
    refresh_count: u64,
    transport: Box<dyn TransportConnection>,
}

impl Connection {
    /// Open a connection through `transport`, moving it Connecting → Ready.
    ///
    /// On failure nothing is returned, so the attempt never reaches any
    /// pool accounting.
    pub async fn establish(
        host: HostAddr,
        id: ConnectionId,
        transport: &dyn Transport,
        connect_timeout: Duration,
    ) -> PoolResult<Self> {
        let connected = tokio::time::timeout(connect_timeout, transport.connect(&host)).await;
        let backend = match connected {
            Ok(Ok(backend)) => backend,
            Ok(Err(reason)) => return Err(PoolError::Establish { host, reason }),
            Err(_) => {
                return Err(PoolError::Establish {
                    reason: format!("timed out after {connect_timeout:?}"),
                    host,
                });
            }
        };

        let mut conn = Self {
            id,
            host,
            state: ConnectionState::Connecting,
            created_at: Instant::now(),
            last_used_at: None,
            last_refreshed_at: None,
            refresh_count: 0,
            transport: backend,
        };
        conn.transition(ConnectionState::Ready)?;
        Ok(conn)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn host(&self) -> &HostAddr {
        &self.host
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used_at(&self) -> Option<Instant> {
        self.last_used_at
    }

    pub fn refresh_count(&self) -> u64 {
        self.refresh_count
    }

    /// True until the connection has completed its first checkout cycle.
    pub fn was_never_used(&self) -> bool {
        self.last_used_at.is_none()
    }

    /// Time since the connection was created, last returned or last refreshed.
    pub fn idle_for(&self, now: Instant) -> Duration {
        let since = [self.last_used_at, self.last_refreshed_at]
            .into_iter()
            .flatten()
            .fold(self.created_at, Instant::max);
        now.saturating_duration_since(since)
    }

    /// Ready → InUse.
    pub(crate) fn mark_in_use(&mut self) -> PoolResult<()> {
        self.transition(ConnectionState::InUse)
    }

    /// InUse → Ready, stamping `last_used_at`.
    pub(crate) fn mark_returned(&mut self, now: Instant) -> PoolResult<()> {
        self.transition(ConnectionState::Ready)?;
        self.last_used_at = Some(now);
        Ok(())
    }

    /// Ready → Refreshing.
    pub(crate) fn begin_refresh(&mut self) -> PoolResult<()> {
        self.transition(ConnectionState::Refreshing)
    }

    /// Refreshing → Ready, counting the refresh.
    pub(crate) fn complete_refresh(&mut self, now: Instant) -> PoolResult<()> {
        self.transition(ConnectionState::Ready)?;
        self.refresh_count += 1;
        self.last_refreshed_at = Some(now);
        Ok(())
    }

    /// Refreshing → Failed.
    pub(crate) fn fail_refresh(&mut self) -> PoolResult<()> {
        self.transition(ConnectionState::Failed)
    }

    /// Send bytes to the host. Only valid while checked out.
    pub async fn send(&mut self, data: &[u8]) -> PoolResult<usize> {
        self.ensure_in_use()?;
        let id = self.id;
        self.transport
            .send(data)
            .await
            .map_err(|reason| PoolError::Transport { id, reason })
    }

    /// Receive up to `max_bytes` from the host. Only valid while checked out.
    pub async fn recv(&mut self, max_bytes: usize) -> PoolResult<Vec<u8>> {
        self.ensure_in_use()?;
        let id = self.id;
        self.transport
            .recv(max_bytes)
            .await
            .map_err(|reason| PoolError::Transport { id, reason })
    }

    /// Liveness round-trip bounded by `timeout`.
    pub(crate) async fn ping(&mut self, timeout: Duration) -> Result<(), String> {
        match tokio::time::timeout(timeout, self.transport.ping()).await {
            Ok(result) => result,
            Err(_) => Err(format!("refresh timed out after {timeout:?}")),
        }
    }

    pub(crate) fn close(&mut self) {
        self.transport.close();
    }

    fn ensure_in_use(&self) -> PoolResult<()> {
        if self.state == ConnectionState::InUse {
            Ok(())
        } else {
            Err(PoolError::InvalidTransition {
                id: self.id,
                from: self.state,
                to: ConnectionState::InUse,
            })
        }
    }

    fn transition(&mut self, to: ConnectionState) -> PoolResult<()> {
        if !self.state.can_transition_to(to) {
            return Err(PoolError::InvalidTransition {
                id: self.id,
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;
    use std::sync::atomic::Ordering;

    async fn ready_connection() -> Connection {
        let (transport, _) = MockTransport::new();
        Connection::establish(
            HostAddr::from("db.local:27017"),
            ConnectionId(1),
            transport.as_ref(),
            Duration::from_secs(1),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn establish_yields_ready_never_used() {
        let conn = ready_connection().await;
        assert_eq!(conn.state(), ConnectionState::Ready);
        assert!(conn.was_never_used());
        assert_eq!(conn.refresh_count(), 0);
        assert_eq!(conn.id().get(), 1);
    }

    #[tokio::test]
    async fn establish_failure_is_reported() {
        let (transport, controls) = MockTransport::new();
        controls.fail_connect.store(true, Ordering::SeqCst);
        let result = Connection::establish(
            HostAddr::from("db.local:27017"),
            ConnectionId(1),
            transport.as_ref(),
            Duration::from_secs(1),
        )
        .await;
        assert!(matches!(result, Err(PoolError::Establish { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn establish_times_out() {
        let (transport, controls) = MockTransport::new();
        controls.latency_ms.store(5_000, Ordering::SeqCst);
        let err = Connection::establish(
            HostAddr::from("slow.local:27017"),
            ConnectionId(1),
            transport.as_ref(),
            Duration::from_millis(100),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn checkout_cycle_marks_used_only_on_return() {
        let mut conn = ready_connection().await;
        conn.mark_in_use().unwrap();
        assert!(conn.was_never_used(), "acquisition alone does not count as use");

        conn.mark_returned(Instant::now()).unwrap();
        assert!(!conn.was_never_used());
        assert_eq!(conn.state(), ConnectionState::Ready);

        // Stays used after later refreshes.
        conn.begin_refresh().unwrap();
        conn.complete_refresh(Instant::now()).unwrap();
        assert!(!conn.was_never_used());
        assert_eq!(conn.refresh_count(), 1);
    }

    #[tokio::test]
    async fn in_use_connection_cannot_refresh() {
        let mut conn = ready_connection().await;
        conn.mark_in_use().unwrap();
        let err = conn.begin_refresh().unwrap_err();
        assert!(matches!(
            err,
            PoolError::InvalidTransition {
                from: ConnectionState::InUse,
                to: ConnectionState::Refreshing,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn refreshing_connection_cannot_be_checked_out() {
        let mut conn = ready_connection().await;
        conn.begin_refresh().unwrap();
        assert!(conn.mark_in_use().is_err());
        conn.fail_refresh().unwrap();
        assert_eq!(conn.state(), ConnectionState::Failed);
        assert!(conn.complete_refresh(Instant::now()).is_err());
    }

    #[tokio::test]
    async fn send_requires_checkout() {
        let mut conn = ready_connection().await;
        assert!(conn.send(b"ping").await.is_err());
        conn.mark_in_use().unwrap();
        assert_eq!(conn.send(b"ping").await.unwrap(), 4);
        assert!(conn.recv(16).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_clock_resets_on_use_and_refresh() {
        let mut conn = ready_connection().await;
        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(conn.idle_for(Instant::now()) >= Duration::from_millis(500));

        conn.mark_in_use().unwrap();
        conn.mark_returned(Instant::now()).unwrap();
        assert_eq!(conn.idle_for(Instant::now()), Duration::ZERO);

        tokio::time::advance(Duration::from_millis(300)).await;
        conn.begin_refresh().unwrap();
        conn.complete_refresh(Instant::now()).unwrap();
        assert_eq!(conn.idle_for(Instant::now()), Duration::ZERO);
    }

    #[tokio::test]
    async fn ping_reports_failure() {
        let (transport, controls) = MockTransport::new();
        let mut conn = Connection::establish(
            HostAddr::from("db.local:27017"),
            ConnectionId(7),
            transport.as_ref(),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert!(conn.ping(Duration::from_secs(1)).await.is_ok());
        controls.fail_ping.store(true, Ordering::SeqCst);
        assert!(conn.ping(Duration::from_secs(1)).await.is_err());
        conn.close();
        assert_eq!(controls.closes(), 1);
    }
}
