use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};

use crate::telemetry::EngineMetrics;

/// Bounded set of worker slots for claimed jobs.
///
/// Dispatch never queues: when every slot is busy the caller gets its task
/// back as rejected and must release the job it claimed.
pub struct WorkerPool {
    size: usize,
    permits: Arc<Semaphore>,
    busy: Arc<watch::Sender<usize>>,
    metrics: Arc<EngineMetrics>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("size", &self.size)
            .field("busy", &self.busy())
            .finish()
    }
}

/// Held by a running task; frees its slot on drop, also when the task panics.
struct BusySlot {
    busy: Arc<watch::Sender<usize>>,
    metrics: Arc<EngineMetrics>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for BusySlot {
    fn drop(&mut self) {
        self.busy.send_modify(|n| *n = n.saturating_sub(1));
        self.metrics.set_busy_workers(*self.busy.borrow());
    }
}

impl WorkerPool {
    pub fn new(size: usize, metrics: Arc<EngineMetrics>) -> Self {
        let (busy, _) = watch::channel(0);
        Self {
            size,
            permits: Arc::new(Semaphore::new(size)),
            busy: Arc::new(busy),
            metrics,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn busy(&self) -> usize {
        *self.busy.borrow()
    }

    pub fn is_idle(&self) -> bool {
        self.busy() == 0
    }

    /// Run `task` on a free slot. Returns `false` without spawning when the
    /// pool is saturated or closed.
    pub fn try_dispatch<F>(&self, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Ok(permit) = self.permits.clone().try_acquire_owned() else {
            return false;
        };

        self.busy.send_modify(|n| *n += 1);
        self.metrics.set_busy_workers(self.busy());
        let slot = BusySlot {
            busy: self.busy.clone(),
            metrics: self.metrics.clone(),
            _permit: permit,
        };

        tokio::spawn(async move {
            let _slot = slot;
            task.await;
        });
        true
    }

    /// Receiver that changes whenever a slot is taken or freed.
    pub fn subscribe(&self) -> watch::Receiver<usize> {
        self.busy.subscribe()
    }

    /// Wait until no task is running.
    pub async fn wait_idle(&self) {
        let mut busy = self.subscribe();
        // The sender lives as long as the pool, so this cannot fail.
        let _ = busy.wait_for(|n| *n == 0).await;
    }

    /// Refuse new tasks and wait up to `timeout` for running ones. Returns
    /// `false` when tasks were still running at the deadline.
    pub async fn close(&self, timeout: Duration) -> bool {
        self.permits.close();
        tokio::time::timeout(timeout, self.wait_idle()).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_rejects_when_saturated() {
        let pool = WorkerPool::new(1, Arc::new(EngineMetrics::new()));
        let (release, wait) = oneshot::channel::<()>();

        assert!(pool.try_dispatch(async move {
            let _ = wait.await;
        }));
        assert_eq!(pool.busy(), 1);
        assert!(!pool.try_dispatch(async {}));

        release.send(()).unwrap();
        pool.wait_idle().await;
        assert_eq!(pool.available(), 1);
        assert!(pool.try_dispatch(async {}));
        pool.wait_idle().await;
    }

    #[tokio::test]
    async fn test_panicking_task_frees_slot() {
        let pool = WorkerPool::new(1, Arc::new(EngineMetrics::new()));
        assert!(pool.try_dispatch(async { panic!("boom") }));
        pool.wait_idle().await;
        assert!(pool.is_idle());
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn test_close_refuses_new_work() {
        let pool = WorkerPool::new(2, Arc::new(EngineMetrics::new()));
        assert!(pool.try_dispatch(async {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }));
        assert!(pool.close(Duration::from_secs(5)).await);
        assert!(!pool.try_dispatch(async {}));
    }
}
