//! Worker executors for blocking registry polls.

use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle, Runtime};

use crate::error::ResolverError;

/// Runs resolver polls off the synchronization context.
pub trait OffloadExecutor: Send + Sync {
    fn spawn(&self, task: BoxFuture<'static, ()>);
}

impl OffloadExecutor for Handle {
    fn spawn(&self, task: BoxFuture<'static, ()>) {
        drop(Handle::spawn(self, task));
    }
}

struct PooledRuntime {
    runtime: Runtime,
    refs: usize,
}

/// Reference-counted worker runtime shared by many resolvers.
///
/// The runtime is built on the first [`acquire`](Self::acquire) and shut down
/// in the background once the last holder calls [`release`](Self::release).
/// Each resolver submits at most one poll at a time, so one small runtime
/// serves any number of them.
pub struct SharedWorkerPool {
    worker_threads: usize,
    thread_name: String,
    slot: Mutex<Option<PooledRuntime>>,
}

impl std::fmt::Debug for SharedWorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedWorkerPool")
            .field("worker_threads", &self.worker_threads)
            .field("thread_name", &self.thread_name)
            .field("holders", &self.holders())
            .finish()
    }
}

impl SharedWorkerPool {
    #[must_use]
    pub fn new(worker_threads: usize, thread_name: impl Into<String>) -> Self {
        Self {
            worker_threads: worker_threads.max(1),
            thread_name: thread_name.into(),
            slot: Mutex::new(None),
        }
    }

    /// Take a reference on the pool, starting the runtime if needed.
    ///
    /// # Errors
    /// Returns `ResolverError::WorkerPool` if the runtime cannot be built.
    pub fn acquire(&self) -> Result<Arc<dyn OffloadExecutor>, ResolverError> {
        let mut slot = self.slot.lock();
        let mut pooled = match slot.take() {
            Some(pooled) => pooled,
            None => {
                let runtime = Builder::new_multi_thread()
                    .worker_threads(self.worker_threads)
                    .thread_name(self.thread_name.clone())
                    .enable_all()
                    .build()?;
                tracing::debug!(
                    worker_threads = self.worker_threads,
                    thread_name = %self.thread_name,
                    "Started shared worker pool"
                );
                PooledRuntime { runtime, refs: 0 }
            }
        };
        pooled.refs += 1;
        let handle = pooled.runtime.handle().clone();
        *slot = Some(pooled);
        Ok(Arc::new(handle))
    }

    /// Drop a reference taken by [`acquire`](Self::acquire).
    pub fn release(&self) {
        let mut slot = self.slot.lock();
        let Some(pooled) = slot.as_mut() else {
            tracing::warn!("Released a shared worker pool that holds no runtime");
            return;
        };
        pooled.refs -= 1;
        if pooled.refs == 0
            && let Some(pooled) = slot.take()
        {
            pooled.runtime.shutdown_background();
            tracing::debug!(thread_name = %self.thread_name, "Stopped shared worker pool");
        }
    }

    /// Number of outstanding references.
    #[must_use]
    pub fn holders(&self) -> usize {
        self.slot.lock().as_ref().map_or(0, |pooled| pooled.refs)
    }
}

impl Drop for SharedWorkerPool {
    fn drop(&mut self) {
        // dropping a runtime from async code panics; shutting down in the background never does
        if let Some(pooled) = self.slot.get_mut().take() {
            pooled.runtime.shutdown_background();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn runtime_lives_while_referenced() {
        let pool = SharedWorkerPool::new(1, "test-worker");
        assert_eq!(pool.holders(), 0);

        let first = pool.acquire().unwrap();
        let _second = pool.acquire().unwrap();
        assert_eq!(pool.holders(), 2);

        let (tx, rx) = std::sync::mpsc::channel();
        first.spawn(Box::pin(async move {
            tx.send(std::thread::current().name().map(str::to_owned)).unwrap();
        }));
        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some("test-worker"));

        pool.release();
        assert_eq!(pool.holders(), 1);
        pool.release();
        assert_eq!(pool.holders(), 0);
    }

    #[test]
    fn reacquire_after_full_release_starts_a_new_runtime() {
        let pool = SharedWorkerPool::new(1, "test-worker");
        drop(pool.acquire().unwrap());
        pool.release();

        let exec = pool.acquire().unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        exec.spawn(Box::pin(async move {
            tx.send(()).unwrap();
        }));
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        pool.release();
    }

    #[test]
    fn unbalanced_release_is_ignored() {
        let pool = SharedWorkerPool::new(1, "test-worker");
        pool.release();
        assert_eq!(pool.holders(), 0);
    }

    #[tokio::test]
    async fn handle_is_an_offload_executor() {
        let exec: Arc<dyn OffloadExecutor> = Arc::new(Handle::current());
        let (tx, rx) = tokio::sync::oneshot::channel();
        exec.spawn(Box::pin(async move {
            tx.send(7).unwrap();
        }));
        assert_eq!(rx.await.unwrap(), 7);
    }
}
