//! Host pool: all connections to one backend host.
//!
//! # Architecture
//!
//! ```text
//! checkout(timeout)
//!   → ready connection available       → InUse, returned
//!   → capacity and nothing pending     → establish (Connecting → Ready → InUse)
//!   → at max_size or pending warm-ups  → wait on `available`, bounded by timeout
//!
//! checkin(conn)
//!   → pool over max_size               → evicted
//!   → refresh_after_use                → Refreshing (background task)
//!   → otherwise                        → Ready
//! ```
//!
//! Every state transition happens under the pool's single mutex. Network
//! round-trips (establish, refresh ping) run in background tasks or in
//! the caller's task with the lock released; only the bookkeeping on
//! either side of them is serialized.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, Notify, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use connpool_core::HostAddr;

use crate::config::PoolConfig;
use crate::connection::{Connection, ConnectionId};
use crate::error::{PoolError, PoolResult};
use crate::tasks::BackgroundTasks;
use crate::transport::Transport;

/// Point-in-time counts for one host pool.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolSnapshot {
    /// Connections checked out by callers.
    pub in_use: usize,
    /// Ready connections sitting idle in the pool.
    pub available: usize,
    /// Connections undergoing a refresh.
    pub refreshing: usize,
    /// Establishments in flight (not counted in any state yet).
    pub connecting: usize,
    /// Connections ever established.
    pub created: u64,
    /// Successful refreshes.
    pub refreshed: u64,
    /// Connections closed without ever completing an operation.
    pub was_never_used: u64,
    pub refresh_failed: u64,
    pub establish_failed: u64,
    /// Checkouts that gave up waiting for capacity.
    pub wait_timeouts: u64,
    pub min_size: usize,
    pub max_size: usize,
    pub draining: bool,
}

/// What happened to a connection handed back to the pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckinOutcome {
    /// Back in the ready set.
    Pooled,
    /// Handed to a refresh task before becoming ready again.
    Refreshing,
    /// Closed (over capacity, discarded, or pool shutting down).
    Closed,
    /// Closed, and it was the last in-use connection of a draining pool.
    Drained,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Open,
    Draining,
    ShutDown,
}

#[derive(Debug, Default)]
struct Counters {
    created: u64,
    refreshed: u64,
    was_never_used: u64,
    refresh_failed: u64,
    establish_failed: u64,
    wait_timeouts: u64,
}

#[derive(Debug)]
struct PoolState {
    min_size: usize,
    max_size: usize,
    refresh_requirement: Duration,
    refresh_after_use: bool,
    /// Ready connections, least recently idle at the front.
    ready: VecDeque<Connection>,
    in_use: HashSet<ConnectionId>,
    refreshing: HashSet<ConnectionId>,
    /// Establishments in flight, claimed or not.
    connecting: usize,
    /// The subset of `connecting` no checkout is waiting on.
    warming: usize,
    counters: Counters,
    phase: Phase,
}

impl PoolState {
    fn total(&self) -> usize {
        self.ready.len() + self.in_use.len() + self.refreshing.len() + self.connecting
    }

    /// Connections needed to get back to `min_size`.
    fn shortfall(&self) -> usize {
        if self.phase != Phase::Open {
            return 0;
        }
        self.min_size
            .min(self.max_size)
            .saturating_sub(self.total())
    }

    fn evict(&mut self, host: &HostAddr, mut conn: Connection, reason: &str) {
        let never_used = conn.was_never_used();
        if never_used {
            self.counters.was_never_used += 1;
        }
        conn.close();
        debug!(%host, id = %conn.id(), never_used, reason, "evicted connection");
    }

    fn evict_all_ready(&mut self, host: &HostAddr, reason: &str) -> usize {
        let ready = std::mem::take(&mut self.ready);
        let closed = ready.len();
        for conn in ready {
            self.evict(host, conn, reason);
        }
        closed
    }

    fn phase_error(&self, host: &HostAddr) -> Option<PoolError> {
        match self.phase {
            Phase::Open => None,
            Phase::Draining => Some(PoolError::Draining { host: host.clone() }),
            Phase::ShutDown => Some(PoolError::ShuttingDown),
        }
    }
}

/// Counts a checkout as waiting for as long as the guard lives, so a
/// cancelled checkout never leaves the count inflated.
struct WaitGuard<'a>(&'a AtomicUsize);

impl<'a> WaitGuard<'a> {
    fn new(waiting: &'a AtomicUsize) -> Self {
        waiting.fetch_add(1, Ordering::SeqCst);
        Self(waiting)
    }
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

enum Step {
    Establish(ConnectionId),
    Wait(Duration),
}

/// Bounded set of connections to a single host.
pub struct HostPool {
    host: HostAddr,
    state: Mutex<PoolState>,
    /// Woken whenever a checkout might now succeed or must fail.
    available: Notify,
    /// Checkouts currently parked on `available`.
    waiting: AtomicUsize,
    next_id: AtomicU64,
    transport: Arc<dyn Transport>,
    tasks: BackgroundTasks,
    connect_timeout: Duration,
    refresh_timeout: Duration,
}

impl HostPool {
    pub(crate) fn new(
        host: HostAddr,
        config: &PoolConfig,
        transport: Arc<dyn Transport>,
        tasks: BackgroundTasks,
    ) -> Arc<Self> {
        Arc::new(Self {
            host,
            state: Mutex::new(PoolState {
                min_size: config.min_size,
                max_size: config.max_size,
                refresh_requirement: config.refresh_requirement,
                refresh_after_use: config.refresh_after_use,
                ready: VecDeque::new(),
                in_use: HashSet::new(),
                refreshing: HashSet::new(),
                connecting: 0,
                warming: 0,
                counters: Counters::default(),
                phase: Phase::Open,
            }),
            available: Notify::new(),
            waiting: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            transport,
            tasks,
            connect_timeout: config.connect_timeout,
            refresh_timeout: config.refresh_timeout,
        })
    }

    pub fn host(&self) -> &HostAddr {
        &self.host
    }

    fn allocate_id(&self) -> ConnectionId {
        ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Check out a connection, waiting up to `timeout` for capacity.
    pub async fn checkout(self: &Arc<Self>, timeout: Duration) -> PoolResult<Connection> {
        let deadline = Instant::now() + timeout;
        let mut wait_guard: Option<WaitGuard<'_>> = None;

        loop {
            // Register interest before inspecting state so a checkin that
            // lands between the check and the wait is not missed.
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            wait_guard.take();

            let step = {
                let mut state = self.state.lock().await;
                if let Some(err) = state.phase_error(&self.host) {
                    return Err(err);
                }

                if let Some(mut conn) = state.ready.pop_back() {
                    conn.mark_in_use()?;
                    state.in_use.insert(conn.id());
                    debug!(
                        host = %self.host,
                        id = %conn.id(),
                        in_use = state.in_use.len(),
                        "reused ready connection"
                    );
                    return Ok(conn);
                }

                // Warm-ups nobody is waiting for will land in the ready set;
                // wait for one of those instead of opening more.
                let unclaimed = state
                    .warming
                    .saturating_sub(self.waiting.load(Ordering::SeqCst));
                if unclaimed == 0 && state.total() < state.max_size {
                    state.connecting += 1;
                    Step::Establish(self.allocate_id())
                } else {
                    wait_guard = Some(WaitGuard::new(&self.waiting));
                    Step::Wait(deadline.saturating_duration_since(Instant::now()))
                }
            };

            match step {
                Step::Establish(id) => return self.establish_for_checkout(id).await,
                Step::Wait(remaining) => {
                    if remaining.is_zero()
                        || tokio::time::timeout_at(deadline, notified).await.is_err()
                    {
                        drop(wait_guard);
                        let mut state = self.state.lock().await;
                        state.counters.wait_timeouts += 1;
                        warn!(
                            host = %self.host,
                            in_use = state.in_use.len(),
                            max_size = state.max_size,
                            timeout = ?timeout,
                            "checkout timed out waiting for a connection"
                        );
                        return Err(PoolError::PoolExhausted {
                            host: self.host.clone(),
                            waited: timeout,
                        });
                    }
                }
            }
        }
    }

    /// Open a connection on behalf of a checkout. The work runs as a
    /// tracked task so a cancelled checkout still settles the pool's
    /// `connecting` count.
    async fn establish_for_checkout(
        self: &Arc<Self>,
        id: ConnectionId,
    ) -> PoolResult<Connection> {
        let (tx, rx) = oneshot::channel();
        self.tasks
            .spawn(Arc::clone(self).run_establish(id, Some(tx)));
        rx.await.unwrap_or(Err(PoolError::ShuttingDown))
    }

    async fn run_establish(
        self: Arc<Self>,
        id: ConnectionId,
        claim: Option<oneshot::Sender<PoolResult<Connection>>>,
    ) {
        let result = Connection::establish(
            self.host.clone(),
            id,
            self.transport.as_ref(),
            self.connect_timeout,
        )
        .await;

        let mut state = self.state.lock().await;
        state.connecting -= 1;
        if claim.is_none() {
            state.warming -= 1;
        }

        let mut conn = match result {
            Ok(conn) => conn,
            Err(e) => {
                state.counters.establish_failed += 1;
                drop(state);
                warn!(host = %self.host, id = %id, error = %e, "connection establishment failed");
                self.available.notify_waiters();
                if let Some(tx) = claim {
                    let _ = tx.send(Err(e));
                }
                return;
            }
        };
        state.counters.created += 1;

        if let Some(err) = state.phase_error(&self.host) {
            state.evict(&self.host, conn, "pool closed during establishment");
            drop(state);
            self.available.notify_waiters();
            if let Some(tx) = claim {
                let _ = tx.send(Err(err));
            }
            return;
        }

        match claim {
            Some(tx) if !tx.is_closed() => {
                if let Err(e) = conn.mark_in_use() {
                    state.evict(&self.host, conn, "unexpected state after establishment");
                    let _ = tx.send(Err(e));
                    return;
                }
                state.in_use.insert(id);
                debug!(
                    host = %self.host,
                    id = %id,
                    total = state.total(),
                    "created new connection for checkout"
                );
                drop(state);
                if let Err(Ok(conn)) = tx.send(Ok(conn)) {
                    // The checkout gave up between the check and the send.
                    let mut state = self.state.lock().await;
                    state.in_use.remove(&id);
                    state.evict(&self.host, conn, "checkout abandoned");
                    drop(state);
                    self.available.notify_waiters();
                }
            }
            _ => {
                if state.total() >= state.max_size {
                    state.evict(&self.host, conn, "pool at maxSize");
                } else {
                    debug!(host = %self.host, id = %id, "warmed connection");
                    state.ready.push_back(conn);
                }
                drop(state);
                self.available.notify_waiters();
            }
        }
    }

    /// Spawn establishments until the pool (counting pending ones) is
    /// back at `min_size`.
    fn spawn_shortfall(self: &Arc<Self>, state: &mut PoolState) -> usize {
        let needed = state.shortfall();
        for _ in 0..needed {
            state.connecting += 1;
            state.warming += 1;
            let id = self.allocate_id();
            self.tasks.spawn(Arc::clone(self).run_establish(id, None));
        }
        if needed > 0 {
            debug!(host = %self.host, needed, min_size = state.min_size, "warming connections");
        }
        needed
    }

    /// Start establishing connections up to `min_size`.
    pub async fn ensure_min_size(self: &Arc<Self>) -> usize {
        let mut state = self.state.lock().await;
        self.spawn_shortfall(&mut state)
    }

    /// Return a checked-out connection.
    pub async fn checkin(self: &Arc<Self>, mut conn: Connection) -> PoolResult<CheckinOutcome> {
        let mut state = self.state.lock().await;
        self.claim_in_use(&mut state, &conn)?;
        conn.mark_returned(Instant::now())?;
        let id = conn.id();

        let phase = state.phase;
        let outcome = match phase {
            Phase::ShutDown => {
                state.evict(&self.host, conn, "pool shut down");
                CheckinOutcome::Closed
            }
            Phase::Draining => {
                state.evict(&self.host, conn, "pool draining");
                if state.in_use.is_empty() {
                    CheckinOutcome::Drained
                } else {
                    CheckinOutcome::Closed
                }
            }
            Phase::Open if state.total() >= state.max_size => {
                state.evict(&self.host, conn, "pool above maxSize");
                CheckinOutcome::Closed
            }
            Phase::Open if state.refresh_after_use => {
                conn.begin_refresh()?;
                state.refreshing.insert(id);
                self.tasks.spawn(Arc::clone(self).run_refresh(conn));
                CheckinOutcome::Refreshing
            }
            Phase::Open => {
                state.ready.push_back(conn);
                CheckinOutcome::Pooled
            }
        };

        debug!(
            host = %self.host,
            id = %id,
            ?outcome,
            available = state.ready.len(),
            in_use = state.in_use.len(),
            "checked in connection"
        );
        drop(state);
        self.available.notify_waiters();
        Ok(outcome)
    }

    /// Return a checked-out connection the caller found broken. It is
    /// closed and, if the pool drops under `min_size`, replaced.
    pub async fn discard(self: &Arc<Self>, conn: Connection) -> PoolResult<CheckinOutcome> {
        let mut state = self.state.lock().await;
        self.claim_in_use(&mut state, &conn)?;
        state.evict(&self.host, conn, "discarded by caller");

        let outcome = if state.phase == Phase::Draining && state.in_use.is_empty() {
            CheckinOutcome::Drained
        } else {
            self.spawn_shortfall(&mut state);
            CheckinOutcome::Closed
        };
        drop(state);
        self.available.notify_waiters();
        Ok(outcome)
    }

    fn claim_in_use(&self, state: &mut PoolState, conn: &Connection) -> PoolResult<()> {
        if conn.host() != &self.host || !state.in_use.remove(&conn.id()) {
            return Err(PoolError::UnknownConnection {
                host: self.host.clone(),
                id: conn.id(),
            });
        }
        Ok(())
    }

    /// Start a refresh for every ready connection idle for at least the
    /// refresh requirement, and top the pool back up to `min_size`.
    ///
    /// Returns the number of refreshes started. Never waits on the network.
    pub async fn refresh_idle(self: &Arc<Self>) -> usize {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        if state.phase != Phase::Open {
            return 0;
        }

        let requirement = state.refresh_requirement;
        let mut started = 0;
        for mut conn in std::mem::take(&mut state.ready) {
            if conn.idle_for(now) < requirement {
                state.ready.push_back(conn);
                continue;
            }
            match conn.begin_refresh() {
                Ok(()) => {
                    state.refreshing.insert(conn.id());
                    self.tasks.spawn(Arc::clone(self).run_refresh(conn));
                    started += 1;
                }
                Err(e) => {
                    warn!(host = %self.host, error = %e, "cannot refresh connection");
                    state.evict(&self.host, conn, "invalid state for refresh");
                }
            }
        }
        self.spawn_shortfall(&mut state);

        if started > 0 {
            debug!(host = %self.host, started, "refreshing idle connections");
        }
        started
    }

    async fn run_refresh(self: Arc<Self>, mut conn: Connection) {
        let result = conn.ping(self.refresh_timeout).await;
        self.finish_refresh(conn, result).await;
    }

    async fn finish_refresh(self: &Arc<Self>, mut conn: Connection, result: Result<(), String>) {
        let mut state = self.state.lock().await;
        state.refreshing.remove(&conn.id());

        match result {
            Ok(()) => {
                state.counters.refreshed += 1;
                if let Err(e) = conn.complete_refresh(Instant::now()) {
                    warn!(host = %self.host, error = %e, "refresh finished in unexpected state");
                    state.evict(&self.host, conn, "invalid state after refresh");
                } else if state.phase != Phase::Open {
                    state.evict(&self.host, conn, "pool closed during refresh");
                } else if state.total() >= state.max_size {
                    state.evict(&self.host, conn, "pool above maxSize");
                } else {
                    debug!(
                        host = %self.host,
                        id = %conn.id(),
                        refresh_count = conn.refresh_count(),
                        "refreshed connection"
                    );
                    state.ready.push_back(conn);
                }
            }
            Err(reason) => {
                let err = PoolError::RefreshFailed {
                    host: self.host.clone(),
                    id: conn.id(),
                    reason,
                };
                warn!(error = %err, "evicting connection");
                state.counters.refresh_failed += 1;
                if let Err(e) = conn.fail_refresh() {
                    warn!(host = %self.host, error = %e, "refresh failed in unexpected state");
                }
                state.evict(&self.host, conn, "refresh failed");
                self.spawn_shortfall(&mut state);
            }
        }
        drop(state);
        self.available.notify_waiters();
    }

    /// Change `min_size`/`max_size`.
    ///
    /// Shrinking evicts idle connections (oldest first) until the pool
    /// fits; in-use connections are left alone and evicted as they come
    /// back. Growing `min_size` starts warm-up establishments. Setting
    /// the current values again does nothing.
    pub async fn set_bounds(self: &Arc<Self>, min_size: usize, max_size: usize) -> PoolResult<()> {
        if max_size == 0 || min_size > max_size {
            return Err(PoolError::InvalidParameter(format!(
                "invalid pool bounds min={min_size} max={max_size}"
            )));
        }

        let mut state = self.state.lock().await;
        if (state.min_size, state.max_size) == (min_size, max_size) {
            return Ok(());
        }
        state.min_size = min_size;
        state.max_size = max_size;

        let mut evicted = 0;
        while state.total() > max_size {
            let Some(conn) = state.ready.pop_front() else {
                break;
            };
            state.evict(&self.host, conn, "pool shrunk");
            evicted += 1;
        }
        let warming = self.spawn_shortfall(&mut state);

        info!(
            host = %self.host,
            min_size,
            max_size,
            evicted,
            warming,
            "pool bounds updated"
        );
        drop(state);
        self.available.notify_waiters();
        Ok(())
    }

    pub async fn set_refresh_requirement(&self, requirement: Duration) {
        self.state.lock().await.refresh_requirement = requirement;
    }

    pub async fn set_refresh_after_use(&self, enabled: bool) {
        self.state.lock().await.refresh_after_use = enabled;
    }

    /// Apply the runtime-tunable parts of `config`.
    pub(crate) async fn apply_config(self: &Arc<Self>, config: &PoolConfig) -> PoolResult<()> {
        self.set_bounds(config.min_size, config.max_size).await?;
        let mut state = self.state.lock().await;
        state.refresh_requirement = config.refresh_requirement;
        state.refresh_after_use = config.refresh_after_use;
        Ok(())
    }

    /// Stop accepting checkouts and close idle connections.
    ///
    /// Returns `true` when nothing is checked out, i.e. the pool can be
    /// dropped right away.
    pub async fn begin_drain(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.phase == Phase::Open {
            state.phase = Phase::Draining;
        }
        let closed = state.evict_all_ready(&self.host, "pool draining");
        let idle = state.in_use.is_empty();
        info!(
            host = %self.host,
            closed,
            in_use = state.in_use.len(),
            "host pool draining"
        );
        drop(state);
        self.available.notify_waiters();
        idle
    }

    /// Undo a drain for a host that came back.
    pub async fn revive(self: &Arc<Self>) -> bool {
        let mut state = self.state.lock().await;
        if state.phase != Phase::Draining {
            return false;
        }
        state.phase = Phase::Open;
        self.spawn_shortfall(&mut state);
        info!(host = %self.host, "host pool revived");
        true
    }

    pub async fn is_draining(&self) -> bool {
        self.state.lock().await.phase == Phase::Draining
    }

    /// Fail every waiter with `ShuttingDown` and close idle connections.
    /// In-use connections are closed as they are checked in.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        state.phase = Phase::ShutDown;
        let closed = state.evict_all_ready(&self.host, "pool shut down");
        debug!(
            host = %self.host,
            closed,
            in_use = state.in_use.len(),
            "host pool shut down"
        );
        drop(state);
        self.available.notify_waiters();
    }

    /// Copy the current counts. Holds the pool lock only while copying.
    pub async fn snapshot(&self) -> PoolSnapshot {
        let state = self.state.lock().await;
        PoolSnapshot {
            in_use: state.in_use.len(),
            available: state.ready.len(),
            refreshing: state.refreshing.len(),
            connecting: state.connecting,
            created: state.counters.created,
            refreshed: state.counters.refreshed,
            was_never_used: state.counters.was_never_used,
            refresh_failed: state.counters.refresh_failed,
            establish_failed: state.counters.establish_failed,
            wait_timeouts: state.counters.wait_timeouts,
            min_size: state.min_size,
            max_size: state.max_size,
            draining: state.phase == Phase::Draining,
        }
    }
}

impl std::fmt::Debug for HostPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostPool")
            .field("host", &self.host)
            .field("waiting", &self.waiting.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
