//! Thread-per-task executor with an optional concurrency limit.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

use super::error::SchedulerError;
use super::error_handler::already_reported;
use super::executor::TaskExecutor;
use super::task::{Runnable, TaskDecorator};
use super::worker_pool::PoolError;

#[derive(Default)]
struct Throttle {
    active: Mutex<usize>,
    released: Condvar,
}

impl Throttle {
    /// Block while `limit` tasks are running, then take a slot.
    fn acquire(&self, limit: Option<usize>) {
        let mut active = self.active.lock();
        if let Some(limit) = limit {
            while *active >= limit {
                self.released.wait(&mut active);
            }
        }
        *active += 1;
    }

    fn release(&self) {
        let mut active = self.active.lock();
        *active = active.saturating_sub(1);
        self.released.notify_one();
    }
}

/// Releases a throttle slot when the task thread ends, even on panic.
struct Permit(Arc<Throttle>);

impl Drop for Permit {
    fn drop(&mut self) {
        self.0.release();
    }
}

/// Starts a new thread for every task.
///
/// With a concurrency limit, `execute` blocks the submitter until a running
/// task finishes.
pub struct SimpleAsyncTaskExecutor {
    thread_name_prefix: String,
    concurrency_limit: Option<usize>,
    throttle: Arc<Throttle>,
    seq: AtomicU64,
    decorator: Option<Arc<dyn TaskDecorator>>,
}

impl fmt::Debug for SimpleAsyncTaskExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimpleAsyncTaskExecutor")
            .field("thread_name_prefix", &self.thread_name_prefix)
            .field("concurrency_limit", &self.concurrency_limit)
            .field("active", &self.active_count())
            .finish()
    }
}

impl SimpleAsyncTaskExecutor {
    /// Create an unthrottled executor whose threads are named `{prefix}{n}`.
    pub fn new(thread_name_prefix: impl Into<String>) -> Self {
        Self {
            thread_name_prefix: thread_name_prefix.into(),
            concurrency_limit: None,
            throttle: Arc::new(Throttle::default()),
            seq: AtomicU64::new(0),
            decorator: None,
        }
    }

    /// Limit concurrently running tasks; `None` removes the limit.
    #[must_use]
    pub const fn with_concurrency_limit(mut self, limit: Option<usize>) -> Self {
        self.concurrency_limit = limit;
        self
    }

    /// Wrap every submitted task with `decorator`.
    #[must_use]
    pub fn with_task_decorator(mut self, decorator: Arc<dyn TaskDecorator>) -> Self {
        self.decorator = Some(decorator);
        self
    }

    /// Tasks currently running.
    #[must_use]
    pub fn active_count(&self) -> usize {
        *self.throttle.active.lock()
    }

    /// Identity used in rejection errors.
    #[must_use]
    pub fn describe(&self) -> String {
        format!(
            "SimpleAsyncTaskExecutor[{}] (active = {}, limit = {:?})",
            self.thread_name_prefix,
            self.active_count(),
            self.concurrency_limit
        )
    }
}

impl TaskExecutor for SimpleAsyncTaskExecutor {
    fn execute(&self, task: Runnable) -> Result<(), SchedulerError> {
        if self.concurrency_limit == Some(0) {
            return Err(SchedulerError::rejected(
                self.describe(),
                task.description(),
                PoolError::InvalidConfig("concurrency limit is 0".into()),
            ));
        }
        let task = match &self.decorator {
            Some(decorator) => decorator.decorate(task),
            None => task,
        };
        self.throttle.acquire(self.concurrency_limit);
        let permit = Permit(Arc::clone(&self.throttle));
        let n = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let name = format!("{}{n}", self.thread_name_prefix);
        let description = task.description().to_owned();

        thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let _permit = permit;
                match task.run() {
                    Err(failure) if already_reported(&failure) => {
                        debug!(task = %task.description(), error = %failure, "Task failed");
                    }
                    Err(failure) => error!(task = %task.description(), error = %failure, "Task failed"),
                    Ok(()) => {}
                }
            })
            .map(|_| debug!(thread = %name, task = %description, "Task thread started"))
            .map_err(|e| {
                SchedulerError::rejected(
                    self.describe(),
                    description,
                    PoolError::Internal(format!("failed to spawn thread `{name}`: {e}")),
                )
            })
    }
}
