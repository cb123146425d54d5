//! TCP transport for raw byte passthrough.
//!
//! [`TcpTransport`] opens plain `tokio` TCP streams. It performs **no
//! protocol handshake**; callers drive their own wire protocol over
//! [`TransportConnection::send`] and [`TransportConnection::recv`].
//!
//! Liveness is probed with a non-consuming `peek` bounded by a short
//! window: EOF or a socket error means the peer is gone, while a timeout
//! (nothing to read) or pending data means the connection is alive.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use connpool_core::HostAddr;

use super::{BoxFuture, Transport, TransportConnection};

/// A [`TransportConnection`] over a plain TCP stream.
pub struct TcpConnection {
    stream: Option<TcpStream>,
    recv_timeout: Duration,
    probe_window: Duration,
}

impl std::fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let peer = self.stream.as_ref().and_then(|s| s.peer_addr().ok());
        f.debug_struct("TcpConnection")
            .field("peer", &peer)
            .field("open", &self.stream.is_some())
            .finish()
    }
}

impl TcpConnection {
    fn stream(&mut self) -> Result<&mut TcpStream, String> {
        self.stream
            .as_mut()
            .ok_or_else(|| "tcp connection closed".to_string())
    }
}

impl TransportConnection for TcpConnection {
    fn send<'a>(&'a mut self, data: &'a [u8]) -> BoxFuture<'a, Result<usize, String>> {
        Box::pin(async move {
            let stream = self.stream()?;
            stream
                .write_all(data)
                .await
                .map_err(|e| format!("tcp send: {e}"))?;
            Ok(data.len())
        })
    }

    fn recv(&mut self, max_bytes: usize) -> BoxFuture<'_, Result<Vec<u8>, String>> {
        Box::pin(async move {
            let recv_timeout = self.recv_timeout;
            let stream = self.stream()?;
            let mut buf = vec![0u8; max_bytes];
            let n = tokio::time::timeout(recv_timeout, stream.read(&mut buf))
                .await
                .map_err(|_| format!("tcp recv timed out after {recv_timeout:?}"))?
                .map_err(|e| format!("tcp recv: {e}"))?;
            buf.truncate(n);
            Ok(buf)
        })
    }

    fn ping(&mut self) -> BoxFuture<'_, Result<(), String>> {
        Box::pin(async move {
            let window = self.probe_window;
            let stream = self.stream()?;
            let mut peek_buf = [0u8; 1];
            match tokio::time::timeout(window, stream.peek(&mut peek_buf)).await {
                // Nothing to read within the window: idle but alive.
                Err(_) => Ok(()),
                Ok(Ok(0)) => Err("peer closed the connection".to_string()),
                Ok(Ok(_)) => Ok(()),
                Ok(Err(e)) => Err(format!("tcp probe: {e}")),
            }
        })
    }

    fn close(&mut self) {
        // Dropping the stream closes the socket.
        self.stream = None;
    }
}

/// Transport creating plain TCP connections to `host:port` addresses.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    /// Timeout for establishing TCP connections.
    connect_timeout: Duration,
    /// Timeout for recv (read) operations on created connections.
    recv_timeout: Duration,
    /// How long a liveness probe waits for EOF before declaring the peer alive.
    probe_window: Duration,
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            recv_timeout: Duration::from_secs(30),
            probe_window: Duration::from_millis(100),
        }
    }
}

impl TcpTransport {
    pub fn new(connect_timeout: Duration, recv_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            recv_timeout,
            ..Self::default()
        }
    }

    /// Set the liveness probe window.
    pub fn with_probe_window(mut self, window: Duration) -> Self {
        self.probe_window = window;
        self
    }
}

impl Transport for TcpTransport {
    fn connect<'a>(
        &'a self,
        host: &'a HostAddr,
    ) -> BoxFuture<'a, Result<Box<dyn TransportConnection>, String>> {
        Box::pin(async move {
            let stream =
                tokio::time::timeout(self.connect_timeout, TcpStream::connect(host.as_str()))
                    .await
                    .map_err(|_| {
                        format!(
                            "tcp connect to {host} timed out after {:?}",
                            self.connect_timeout
                        )
                    })?
                    .map_err(|e| format!("tcp connect to {host}: {e}"))?;

            // Disable Nagle's algorithm for low-latency request/response exchange.
            let _ = stream.set_nodelay(true);

            tracing::debug!(%host, "established tcp connection");

            Ok(Box::new(TcpConnection {
                stream: Some(stream),
                recv_timeout: self.recv_timeout,
                probe_window: self.probe_window,
            }) as Box<dyn TransportConnection>)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn fast_transport() -> TcpTransport {
        TcpTransport::new(Duration::from_millis(500), Duration::from_millis(500))
            .with_probe_window(Duration::from_millis(20))
    }

    async fn echo_server() -> HostAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    while let Ok(n) = stream.read(&mut buf).await {
                        if n == 0 || stream.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        HostAddr::from(addr.to_string())
    }

    #[tokio::test]
    async fn connect_send_recv_echo() {
        let host = echo_server().await;
        let transport = fast_transport();
        let mut conn = transport.connect(&host).await.unwrap();

        assert_eq!(conn.send(b"hello").await.unwrap(), 5);
        let data = conn.recv(16).await.unwrap();
        assert_eq!(data, b"hello");
    }

    #[tokio::test]
    async fn ping_idle_connection_is_alive() {
        let host = echo_server().await;
        let mut conn = fast_transport().connect(&host).await.unwrap();
        assert!(conn.ping().await.is_ok());
    }

    #[tokio::test]
    async fn ping_detects_peer_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let host = HostAddr::from(listener.local_addr().unwrap().to_string());
        tokio::spawn(async move {
            // Accept and immediately drop.
            let _ = listener.accept().await;
        });

        let mut conn = fast_transport().connect(&host).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(conn.ping().await.is_err());
    }

    #[tokio::test]
    async fn connect_to_closed_port_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let host = HostAddr::from(listener.local_addr().unwrap().to_string());
        drop(listener);

        let result = fast_transport().connect(&host).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn closed_connection_rejects_io() {
        let host = echo_server().await;
        let mut conn = fast_transport().connect(&host).await.unwrap();
        conn.close();
        assert!(conn.send(b"x").await.unwrap_err().contains("closed"));
        assert!(conn.ping().await.is_err());
    }
}
