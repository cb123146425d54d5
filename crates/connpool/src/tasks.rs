//! Tracked background work (warm-up establishments and refreshes).
//!
//! Every task a pool spawns goes through [`BackgroundTasks`] so teardown
//! can wait for in-flight round-trips instead of abandoning them.
//! Spawning is synchronous, so pool bookkeeping and the spawn happen
//! under the same pool lock with no await point in between.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tokio::task::JoinSet;

/// Tracks spawned pool tasks.
///
/// The `JoinSet` stays in place for the life of the tracker; waiters
/// only watch the pending count. Dropping a `wait_idle` future never
/// aborts a task, so a cancelled teardown cannot strand bookkeeping
/// that a refresh or establishment was about to settle.
#[derive(Clone, Default)]
pub(crate) struct BackgroundTasks {
    set: Arc<Mutex<JoinSet<()>>>,
    pending: Arc<Pending>,
}

#[derive(Default)]
struct Pending {
    count: AtomicUsize,
    idle: Notify,
}

/// Held by a running task; releases its pending slot however the task ends.
struct PendingSlot(Arc<Pending>);

impl Drop for PendingSlot {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

impl BackgroundTasks {
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.pending.count.fetch_add(1, Ordering::AcqRel);
        let slot = PendingSlot(Arc::clone(&self.pending));

        let mut set = self.lock();
        // Reap finished tasks so the set does not grow without bound.
        while let Some(result) = set.try_join_next() {
            if let Err(e) = result {
                tracing::warn!(error = %e, "background pool task did not complete");
            }
        }
        set.spawn(async move {
            let _slot = slot;
            task.await;
        });
    }

    /// Number of tasks still running.
    pub fn len(&self) -> usize {
        self.pending.count.load(Ordering::Acquire)
    }

    /// Wait until every tracked task, including ones spawned while
    /// waiting, has finished. Safe to cancel.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.pending.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.len() == 0 {
                return;
            }
            notified.await;
        }
    }

    fn lock(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.set.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for BackgroundTasks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundTasks")
            .field("pending", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn wait_idle_awaits_all_tasks() {
        let tasks = BackgroundTasks::default();
        let done = Arc::new(AtomicUsize::new(0));
        for i in 0..4 {
            let done = done.clone();
            tasks.spawn(async move {
                tokio::time::sleep(Duration::from_millis(10 * i)).await;
                done.fetch_add(1, Ordering::SeqCst);
            });
        }
        tasks.wait_idle().await;
        assert_eq!(done.load(Ordering::SeqCst), 4);
        assert_eq!(tasks.len(), 0);
    }

    #[tokio::test]
    async fn wait_idle_picks_up_tasks_spawned_meanwhile() {
        let tasks = BackgroundTasks::default();
        let done = Arc::new(AtomicUsize::new(0));
        let inner_tasks = tasks.clone();
        let inner_done = done.clone();
        tasks.spawn(async move {
            let d = inner_done.clone();
            inner_tasks.spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                d.fetch_add(1, Ordering::SeqCst);
            });
            inner_done.fetch_add(1, Ordering::SeqCst);
        });
        tasks.wait_idle().await;
        assert_eq!(done.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn wait_idle_on_empty_returns() {
        BackgroundTasks::default().wait_idle().await;
    }

    #[tokio::test]
    async fn cancelled_wait_leaves_tasks_running() {
        let tasks = BackgroundTasks::default();
        let done = Arc::new(AtomicUsize::new(0));
        let d = done.clone();
        tasks.spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            d.fetch_add(1, Ordering::SeqCst);
        });

        let waited = tokio::time::timeout(Duration::from_millis(10), tasks.wait_idle()).await;
        assert!(waited.is_err());
        assert_eq!(tasks.len(), 1);

        tasks.wait_idle().await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert_eq!(tasks.len(), 0);
    }
}
