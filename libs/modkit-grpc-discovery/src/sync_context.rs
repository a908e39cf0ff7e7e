//! Single-threaded, ordered task execution.

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::thread::{self, ThreadId};

use parking_lot::Mutex;

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Serializes tasks without owning a thread.
///
/// [`execute`](Self::execute) queues a task and then drains the queue on the
/// calling thread, unless another thread is already draining, in which case
/// that thread picks the task up. Tasks therefore run one at a time and in
/// submission order. A task that calls `execute` on the same context has its
/// new task run right after it returns.
///
/// Tasks must be short and must not block.
#[derive(Default)]
pub struct SynchronizationContext {
    queue: Mutex<VecDeque<Task>>,
    drainer: Mutex<Option<ThreadId>>,
}

impl std::fmt::Debug for SynchronizationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SynchronizationContext")
            .field("queued", &self.queue.lock().len())
            .field("drainer", &*self.drainer.lock())
            .finish()
    }
}

impl SynchronizationContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `task` and run queued tasks unless another thread already is.
    pub fn execute(&self, task: impl FnOnce() + Send + 'static) {
        self.queue.lock().push_back(Box::new(task));
        self.drain();
    }

    /// `true` when the current thread is running tasks of this context.
    #[must_use]
    pub fn is_current_thread(&self) -> bool {
        *self.drainer.lock() == Some(thread::current().id())
    }

    fn drain(&self) {
        loop {
            {
                let mut drainer = self.drainer.lock();
                if drainer.is_some() {
                    return;
                }
                *drainer = Some(thread::current().id());
            }

            while let Some(task) = self.next_task() {
                if catch_unwind(AssertUnwindSafe(task)).is_err() {
                    tracing::error!("task panicked in synchronization context");
                }
            }

            *self.drainer.lock() = None;
            // a task queued between the last pop and the release would be stranded
            if self.queue.lock().is_empty() {
                return;
            }
        }
    }

    fn next_task(&self) -> Option<Task> {
        self.queue.lock().pop_front()
    }
}
