//! In-process transport for unit tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use connpool_core::HostAddr;

use super::{BoxFuture, Transport, TransportConnection};

/// Switches shared by a [`MockTransport`] and every connection it opened.
#[derive(Debug, Default)]
pub(crate) struct MockControls {
    pub connects: AtomicU64,
    pub pings: AtomicU64,
    pub closes: AtomicU64,
    pub fail_connect: AtomicBool,
    pub fail_ping: AtomicBool,
    /// Artificial latency for connect and ping, in milliseconds.
    pub latency_ms: AtomicU64,
}

impl MockControls {
    pub fn connects(&self) -> u64 {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn pings(&self) -> u64 {
        self.pings.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> u64 {
        self.closes.load(Ordering::SeqCst)
    }

    fn latency(&self) -> Duration {
        Duration::from_millis(self.latency_ms.load(Ordering::SeqCst))
    }
}

pub(crate) struct MockTransport {
    pub controls: Arc<MockControls>,
}

impl MockTransport {
    pub fn new() -> (Arc<Self>, Arc<MockControls>) {
        let controls = Arc::new(MockControls::default());
        let transport = Arc::new(Self {
            controls: controls.clone(),
        });
        (transport, controls)
    }
}

impl Transport for MockTransport {
    fn connect<'a>(
        &'a self,
        _host: &'a HostAddr,
    ) -> BoxFuture<'a, Result<Box<dyn TransportConnection>, String>> {
        Box::pin(async move {
            let latency = self.controls.latency();
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            if self.controls.fail_connect.load(Ordering::SeqCst) {
                return Err("connection refused".to_string());
            }
            self.controls.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(MockConnection {
                controls: self.controls.clone(),
            }) as Box<dyn TransportConnection>)
        })
    }
}

#[derive(Debug)]
pub(crate) struct MockConnection {
    controls: Arc<MockControls>,
}

impl TransportConnection for MockConnection {
    fn send<'a>(&'a mut self, data: &'a [u8]) -> BoxFuture<'a, Result<usize, String>> {
        Box::pin(async move { Ok(data.len()) })
    }

    fn recv(&mut self, _max_bytes: usize) -> BoxFuture<'_, Result<Vec<u8>, String>> {
        Box::pin(async move { Ok(Vec::new()) })
    }

    fn ping(&mut self) -> BoxFuture<'_, Result<(), String>> {
        Box::pin(async move {
            let latency = self.controls.latency();
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            self.controls.pings.fetch_add(1, Ordering::SeqCst);
            if self.controls.fail_ping.load(Ordering::SeqCst) {
                Err("connection reset by peer".to_string())
            } else {
                Ok(())
            }
        })
    }

    fn close(&mut self) {
        self.controls.closes.fetch_add(1, Ordering::SeqCst);
    }
}
