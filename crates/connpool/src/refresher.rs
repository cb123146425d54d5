//! Refresher: background task that refreshes idle connections.
//!
//! Every tick it asks each host pool to start refreshes for connections
//! idle longer than the refresh requirement. The tick interval is
//! recomputed from the registry's current config, and a runtime parameter
//! change cuts the current wait short so a new `refreshRequirementMS`
//! takes effect immediately.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::registry::PoolRegistry;

struct RunningLoop {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

/// Owns the refresh loop for one registry.
pub struct Refresher {
    registry: Arc<PoolRegistry>,
    running: Mutex<Option<RunningLoop>>,
}

impl Refresher {
    pub fn new(registry: Arc<PoolRegistry>) -> Self {
        Self {
            registry,
            running: Mutex::new(None),
        }
    }

    /// Start the loop. Does nothing if it is already running.
    pub fn start(&self) {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let registry = Arc::clone(&self.registry);
        let handle = tokio::spawn(async move {
            run_refresh_loop(registry, shutdown_rx).await;
        });
        *running = Some(RunningLoop {
            handle,
            shutdown_tx,
        });
        info!(pool = %self.registry.name(), "refresher started");
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    /// Stop the loop and wait for refreshes it already started.
    /// Does nothing if the loop is not running.
    pub async fn shutdown(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(running) = running else {
            return;
        };

        let _ = running.shutdown_tx.send(true);
        if let Err(e) = running.handle.await {
            warn!(error = %e, "refresher task did not exit cleanly");
        }
        self.registry.tasks().wait_idle().await;
        info!(pool = %self.registry.name(), "refresher stopped");
    }
}

impl std::fmt::Debug for Refresher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Refresher")
            .field("pool", &self.registry.name())
            .field("running", &self.is_running())
            .finish()
    }
}

async fn run_refresh_loop(registry: Arc<PoolRegistry>, mut shutdown: watch::Receiver<bool>) {
    loop {
        let changed = registry.config_changed();
        tokio::pin!(changed);
        changed.as_mut().enable();
        if registry.is_closed() {
            debug!(pool = %registry.name(), "registry closed, refresher exiting");
            return;
        }
        let interval = registry.config().await.effective_refresh_interval();

        tokio::select! {
            _ = &mut changed => {
                debug!(pool = %registry.name(), "refresh interval recomputed");
            }
            _ = tokio::time::sleep(interval) => {
                let mut started = 0;
                for pool in registry.pools().await {
                    started += pool.refresh_idle().await;
                }
                if started > 0 {
                    debug!(pool = %registry.name(), started, "refresh tick");
                }
            }
            _ = shutdown.changed() => {
                debug!(pool = %registry.name(), "refresher received shutdown signal");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ParameterUpdate, PoolConfig};
    use crate::transport::mock::MockTransport;
    use connpool_core::HostAddr;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn registry(refresh_requirement: Duration) -> Arc<PoolRegistry> {
        let (transport, _) = MockTransport::new();
        PoolRegistry::new(
            PoolConfig {
                min_size: 2,
                max_size: 4,
                refresh_requirement,
                ..PoolConfig::default()
            },
            transport,
        )
    }

    async fn totals(registry: &PoolRegistry) -> (usize, u64) {
        let mut refreshing = 0;
        let mut refreshed = 0;
        for pool in registry.pools().await {
            let snap = pool.snapshot().await;
            refreshing += snap.refreshing;
            refreshed += snap.refreshed;
        }
        (refreshing, refreshed)
    }

    async fn total_refreshed(registry: &PoolRegistry) -> u64 {
        let mut total = 0;
        for pool in registry.pools().await {
            total += pool.snapshot().await.refreshed;
        }
        total
    }

    #[tokio::test]
    async fn refreshes_idle_connections_on_tick() {
        let registry = registry(Duration::from_millis(40));
        registry
            .get_or_create_pool(&HostAddr::from("a:1"))
            .await
            .unwrap();

        let refresher = Refresher::new(Arc::clone(&registry));
        refresher.start();
        tokio::time::sleep(Duration::from_millis(300)).await;
        refresher.shutdown().await;

        assert!(total_refreshed(&registry).await >= 2);
    }

    #[tokio::test]
    async fn start_and_shutdown_are_idempotent() {
        let registry = registry(Duration::from_secs(60));
        let refresher = Refresher::new(registry);
        refresher.shutdown().await;

        refresher.start();
        refresher.start();
        assert!(refresher.is_running());
        refresher.shutdown().await;
        refresher.shutdown().await;
        assert!(!refresher.is_running());

        // Restart after shutdown.
        refresher.start();
        assert!(refresher.is_running());
        refresher.shutdown().await;
    }

    #[tokio::test]
    async fn picks_up_requirement_change_at_runtime() {
        let registry = registry(Duration::from_secs(3600));
        registry
            .get_or_create_pool(&HostAddr::from("a:1"))
            .await
            .unwrap();
        let refresher = Refresher::new(Arc::clone(&registry));
        refresher.start();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(total_refreshed(&registry).await, 0);

        let update = ParameterUpdate {
            refresh_requirement: Some(Duration::from_millis(20)),
            ..Default::default()
        };
        registry.set_parameters(&update).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        refresher.shutdown().await;

        assert!(total_refreshed(&registry).await >= 1);
    }

    #[tokio::test]
    async fn shutdown_lets_started_refreshes_finish() {
        let (transport, controls) = MockTransport::new();
        let registry = PoolRegistry::new(
            PoolConfig {
                min_size: 2,
                max_size: 4,
                refresh_requirement: Duration::from_millis(40),
                ..PoolConfig::default()
            },
            transport,
        );
        let pool = registry
            .get_or_create_pool(&HostAddr::from("a:1"))
            .await
            .unwrap();
        while pool.snapshot().await.available < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        controls.latency_ms.store(100, Ordering::SeqCst);

        let refresher = Refresher::new(Arc::clone(&registry));
        refresher.start();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        let before = loop {
            let (refreshing, refreshed) = totals(&registry).await;
            if refreshing > 0 {
                break refreshed;
            }
            assert!(tokio::time::Instant::now() < deadline, "no refresh started");
            tokio::time::sleep(Duration::from_millis(5)).await;
        };

        refresher.shutdown().await;
        let (refreshing, refreshed) = totals(&registry).await;
        assert_eq!(refreshing, 0);
        assert!(refreshed > before);
    }

    #[tokio::test]
    async fn exits_when_registry_shuts_down() {
        let registry = registry(Duration::from_secs(3600));
        let refresher = Refresher::new(Arc::clone(&registry));
        refresher.start();
        assert!(refresher.is_running());

        registry.shutdown().await;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        while refresher.is_running() {
            assert!(tokio::time::Instant::now() < deadline, "refresher kept running");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        refresher.shutdown().await;
    }
}
