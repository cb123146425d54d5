//! Pool registry: one host pool per backend host.
//!
//! The registry owns the host → pool map, the default [`PoolConfig`]
//! every new pool is seeded from, the current [`TopologyView`], and the
//! background task set all its pools spawn into.
//!
//! Lock order: the registry map lock may be held while taking a pool
//! lock, never the reverse. Pools never call back into the registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Notify, RwLock, watch};
use tracing::{debug, info};

use connpool_core::HostAddr;

use crate::config::{ParameterUpdate, PoolConfig};
use crate::connection::Connection;
use crate::dedicated::{ConnectionGauges, DedicatedConnection, DedicatedKind};
use crate::error::{PoolError, PoolResult};
use crate::host_pool::{CheckinOutcome, HostPool};
use crate::tasks::BackgroundTasks;
use crate::topology::TopologyView;
use crate::transport::Transport;

/// Named collection of host pools sharing one configuration.
pub struct PoolRegistry {
    name: String,
    config: RwLock<PoolConfig>,
    config_changed: Notify,
    pools: RwLock<HashMap<HostAddr, Arc<HostPool>>>,
    topology: watch::Sender<TopologyView>,
    transport: Arc<dyn Transport>,
    tasks: BackgroundTasks,
    gauges: Arc<ConnectionGauges>,
    closed: AtomicBool,
}

impl PoolRegistry {
    pub fn new(config: PoolConfig, transport: Arc<dyn Transport>) -> Arc<Self> {
        let (topology, _) = watch::channel(TopologyView::default());
        Arc::new(Self {
            name: config.name.clone(),
            config: RwLock::new(config),
            config_changed: Notify::new(),
            pools: RwLock::new(HashMap::new()),
            topology,
            transport,
            tasks: BackgroundTasks::default(),
            gauges: Arc::new(ConnectionGauges::default()),
            closed: AtomicBool::new(false),
        })
    }

    /// Logical pool name reported under `pools`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current default configuration.
    pub async fn config(&self) -> PoolConfig {
        self.config.read().await.clone()
    }

    /// Resolves on the next successful [`set_parameters`](Self::set_parameters).
    pub(crate) fn config_changed(&self) -> tokio::sync::futures::Notified<'_> {
        self.config_changed.notified()
    }

    pub fn gauges(&self) -> &ConnectionGauges {
        &self.gauges
    }

    pub(crate) fn tasks(&self) -> &BackgroundTasks {
        &self.tasks
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> PoolResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(PoolError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    /// Return the pool for `host`, creating it (and starting its warm-up
    /// to `min_size`) on first use.
    pub async fn get_or_create_pool(&self, host: &HostAddr) -> PoolResult<Arc<HostPool>> {
        self.ensure_open()?;
        if let Some(pool) = self.pools.read().await.get(host) {
            return Ok(Arc::clone(pool));
        }

        let config = self.config.read().await.clone();
        let mut pools = self.pools.write().await;
        if let Some(pool) = pools.get(host) {
            return Ok(Arc::clone(pool));
        }
        // Shutdown lists pools after setting `closed`; a pool inserted past
        // that point would never be shut down.
        self.ensure_open()?;
        let pool = HostPool::new(
            host.clone(),
            &config,
            Arc::clone(&self.transport),
            self.tasks.clone(),
        );
        let warming = pool.ensure_min_size().await;
        pools.insert(host.clone(), Arc::clone(&pool));
        info!(
            pool = %self.name,
            %host,
            min_size = config.min_size,
            max_size = config.max_size,
            warming,
            "created host pool"
        );
        Ok(pool)
    }

    /// The pool for `host`, if one exists.
    pub async fn pool(&self, host: &HostAddr) -> Option<Arc<HostPool>> {
        self.pools.read().await.get(host).cloned()
    }

    /// Every pool, ordered by host.
    pub async fn pools(&self) -> Vec<Arc<HostPool>> {
        let mut pools: Vec<_> = self.pools.read().await.values().cloned().collect();
        pools.sort_by(|a, b| a.host().cmp(b.host()));
        pools
    }

    /// Check out a connection to `host` using the configured checkout timeout.
    pub async fn checkout(&self, host: &HostAddr) -> PoolResult<Connection> {
        let timeout = self.config.read().await.checkout_timeout;
        self.checkout_with_timeout(host, timeout).await
    }

    pub async fn checkout_with_timeout(
        &self,
        host: &HostAddr,
        timeout: Duration,
    ) -> PoolResult<Connection> {
        let pool = self.get_or_create_pool(host).await?;
        pool.checkout(timeout).await
    }

    /// Return a connection to its pool.
    pub async fn checkin(&self, conn: Connection) -> PoolResult<CheckinOutcome> {
        let pool = self.owning_pool(&conn).await?;
        let outcome = pool.checkin(conn).await?;
        if outcome == CheckinOutcome::Drained {
            self.remove_drained(&pool).await;
        }
        Ok(outcome)
    }

    /// Return a connection the caller found broken.
    pub async fn discard(&self, conn: Connection) -> PoolResult<CheckinOutcome> {
        let pool = self.owning_pool(&conn).await?;
        let outcome = pool.discard(conn).await?;
        if outcome == CheckinOutcome::Drained {
            self.remove_drained(&pool).await;
        }
        Ok(outcome)
    }

    async fn owning_pool(&self, conn: &Connection) -> PoolResult<Arc<HostPool>> {
        self.pool(conn.host())
            .await
            .ok_or_else(|| PoolError::UnknownConnection {
                host: conn.host().clone(),
                id: conn.id(),
            })
    }

    /// Remove the pool for `host`.
    ///
    /// A pool with nothing checked out is removed at once and `true` is
    /// returned. Otherwise it starts draining: idle connections close,
    /// new checkouts fail, and the pool is removed when its last
    /// connection comes back.
    pub async fn remove_pool(&self, host: &HostAddr) -> bool {
        let Some(pool) = self.pool(host).await else {
            return false;
        };
        if pool.begin_drain().await {
            self.remove_drained(&pool).await;
            true
        } else {
            false
        }
    }

    async fn remove_drained(&self, pool: &Arc<HostPool>) {
        {
            let mut pools = self.pools.write().await;
            // A revived or replaced pool under the same host stays.
            let registered = pools
                .get(pool.host())
                .is_some_and(|current| Arc::ptr_eq(current, pool));
            if !registered || !pool.is_draining().await {
                return;
            }
            pools.remove(pool.host());
        }
        pool.shutdown().await;
        info!(pool = %self.name, host = %pool.host(), "removed host pool");
    }

    /// Current topology.
    pub fn topology(&self) -> TopologyView {
        self.topology.borrow().clone()
    }

    /// Receiver that observes every topology change.
    pub fn subscribe_topology(&self) -> watch::Receiver<TopologyView> {
        self.topology.subscribe()
    }

    /// Install a new topology: create pools for added hosts, drain pools
    /// of removed hosts and revive draining pools whose host returned.
    pub async fn on_topology_change(&self, view: TopologyView) -> PoolResult<()> {
        self.ensure_open()?;
        let previous = self.topology.send_replace(view.clone());

        for host in view.hosts() {
            match self.pool(host).await {
                Some(pool) => {
                    pool.revive().await;
                }
                None => {
                    self.get_or_create_pool(host).await?;
                }
            }
        }

        let removed: Vec<&HostAddr> = previous.hosts().filter(|h| !view.contains(h)).collect();
        for host in &removed {
            self.remove_pool(host).await;
        }
        info!(
            pool = %self.name,
            hosts = view.len(),
            removed = removed.len(),
            "topology updated"
        );
        Ok(())
    }

    /// Validate and apply a runtime parameter change to the defaults and
    /// to every existing pool. Checked-out connections are untouched.
    pub async fn set_parameters(&self, update: &ParameterUpdate) -> PoolResult<()> {
        if update.is_empty() {
            return Ok(());
        }
        let config = {
            let mut config = self.config.write().await;
            let mut next = config.clone();
            next.apply(update)?;
            *config = next.clone();
            next
        };
        self.config_changed.notify_waiters();

        for pool in self.pools().await {
            pool.apply_config(&config).await?;
        }
        info!(
            pool = %self.name,
            min_size = config.min_size,
            max_size = config.max_size,
            refresh_requirement_ms = config.refresh_requirement.as_millis() as u64,
            refresh_after_use = config.refresh_after_use,
            "pool parameters updated"
        );
        Ok(())
    }

    /// Open a connection outside pool accounting, counted in
    /// `numClientConnections` while the handle lives.
    pub async fn open_dedicated(&self, host: &HostAddr) -> PoolResult<DedicatedConnection> {
        self.open_unpooled(host, DedicatedKind::Client).await
    }

    /// Like [`open_dedicated`](Self::open_dedicated), additionally counted
    /// in `numAScopedConnections`.
    pub async fn open_scoped(&self, host: &HostAddr) -> PoolResult<DedicatedConnection> {
        self.open_unpooled(host, DedicatedKind::Scoped).await
    }

    async fn open_unpooled(
        &self,
        host: &HostAddr,
        kind: DedicatedKind,
    ) -> PoolResult<DedicatedConnection> {
        self.ensure_open()?;
        let connect_timeout = self.config.read().await.connect_timeout;
        let transport = tokio::time::timeout(connect_timeout, self.transport.connect(host))
            .await
            .map_err(|_| PoolError::Establish {
                host: host.clone(),
                reason: format!("timed out after {connect_timeout:?}"),
            })?
            .map_err(|reason| PoolError::Establish {
                host: host.clone(),
                reason,
            })?;
        Ok(DedicatedConnection::new(
            host.clone(),
            kind,
            transport,
            Arc::clone(&self.gauges),
        ))
    }

    /// Fail blocked checkouts, close idle connections and wait for
    /// in-flight establishments and refreshes. Pools stay registered so
    /// their counters remain readable.
    ///
    /// A [`Refresher`](crate::Refresher) bound to this registry exits on
    /// its own once the registry is closed; calling its `shutdown` first
    /// is still the orderly teardown.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.config_changed.notify_waiters();
        let pools = self.pools().await;
        for pool in &pools {
            pool.shutdown().await;
        }
        debug!(pool = %self.name, pending = self.tasks.len(), "waiting for background pool tasks");
        self.tasks.wait_idle().await;
        info!(pool = %self.name, hosts = pools.len(), "pool registry shut down");
    }
}

impl std::fmt::Debug for PoolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolRegistry")
            .field("name", &self.name)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
