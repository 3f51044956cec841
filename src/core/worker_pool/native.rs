//! Core/max/keep-alive thread pool on dedicated OS threads.
//!
//! Placement follows the classic executor rules: grow to the core size, then
//! queue, then grow to the max size, then apply the rejection policy. Workers
//! above the core size (or every worker, once core timeout is allowed) retire
//! after `keep_alive` without work.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::Ordering;
use tracing::{debug, error, info, warn};

use crate::config::{PoolConfig, RejectionPolicy};
use crate::core::error_handler::already_reported;
use crate::core::task::Runnable;

use super::{PoolCounters, PoolError, PoolStats};

const DEFAULT_THREAD_PREFIX: &str = "pool-worker-";

/// Pool run state, ordered by progress towards termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum RunState {
    /// Accepting and running tasks.
    Running,
    /// No new tasks; queued tasks still run.
    Shutdown,
    /// No new tasks; queued tasks were drained.
    Stop,
    /// All workers have exited.
    Terminated,
}

/// Mutable pool state, guarded by one monitor so getter/setter pairs stay atomic.
struct PoolState {
    run_state: RunState,
    /// Task sender. Option allows clean shutdown by dropping.
    sender: Option<Sender<Runnable>>,
    workers: usize,
    largest: usize,
    thread_seq: u64,
    core_pool_size: usize,
    max_pool_size: usize,
    keep_alive: Duration,
    allow_core_thread_timeout: bool,
}

struct Inner {
    thread_name_prefix: String,
    queue_capacity: Option<usize>,
    rejection_policy: RejectionPolicy,
    state: Mutex<PoolState>,
    terminated: Condvar,
    receiver: Receiver<Runnable>,
    counters: PoolCounters,
}

/// What an idle worker should do next.
enum NextTask {
    /// Run this task.
    Run(Runnable),
    /// The queue is closed and empty; exit and deregister.
    Exit,
    /// The worker already deregistered itself after idling out.
    Retired,
}

/// Thread pool with live-resizable core/max sizes.
///
/// # Design
///
/// - **No polling**: workers block on channel recv; termination uses a Condvar
/// - **Clean shutdown**: dropping the sender lets workers drain and exit
/// - **Single monitor**: sizing parameters and worker accounting share one lock
pub struct WorkerPool {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("thread_name_prefix", &self.inner.thread_name_prefix)
            .field("stats", &self.stats())
            .finish()
    }
}

impl WorkerPool {
    /// Create a new worker pool.
    ///
    /// No threads are started unless `prestart_all_core_threads` is set.
    ///
    /// # Errors
    ///
    /// - `PoolError::InvalidConfig` if the configuration is invalid
    /// - `PoolError::Internal` if a prestarted thread cannot be spawned
    pub fn new(config: &PoolConfig) -> Result<Self, PoolError> {
        config.validate().map_err(PoolError::InvalidConfig)?;

        let (sender, receiver) = match config.queue_capacity {
            Some(capacity) => bounded(capacity),
            None => unbounded(),
        };
        let pool = Self {
            inner: Arc::new(Inner {
                thread_name_prefix: config
                    .thread_name_prefix
                    .clone()
                    .unwrap_or_else(|| DEFAULT_THREAD_PREFIX.to_owned()),
                queue_capacity: config.queue_capacity,
                rejection_policy: config.rejection_policy,
                state: Mutex::new(PoolState {
                    run_state: RunState::Running,
                    sender: Some(sender),
                    workers: 0,
                    largest: 0,
                    thread_seq: 0,
                    core_pool_size: config.core_pool_size,
                    max_pool_size: config.max_pool_size,
                    keep_alive: config.keep_alive(),
                    allow_core_thread_timeout: config.allow_core_thread_timeout,
                }),
                terminated: Condvar::new(),
                receiver,
                counters: PoolCounters::default(),
            }),
        };

        if config.prestart_all_core_threads {
            pool.prestart_all_core_threads()?;
        }

        info!(
            thread_name_prefix = %pool.inner.thread_name_prefix,
            core_pool_size = config.core_pool_size,
            max_pool_size = config.max_pool_size,
            queue_capacity = ?config.queue_capacity,
            rejection_policy = ?config.rejection_policy,
            "WorkerPool initialized"
        );

        Ok(pool)
    }

    /// Submit a task for execution.
    ///
    /// Never blocks: with a zero-capacity queue the task is handed to an idle
    /// worker, a new thread is started, or the rejection policy applies.
    ///
    /// # Errors
    ///
    /// - `PoolError::QueueFull` if the pool is saturated and the policy is abort
    /// - `PoolError::PoolShutdown` if the pool has been shut down (any policy)
    /// - `PoolError::Internal` if a worker thread cannot be spawned
    pub fn execute(&self, task: Runnable) -> Result<(), PoolError> {
        self.inner.counters.submitted_tasks.fetch_add(1, Ordering::Relaxed);
        match self.place(task) {
            Ok(()) => Ok(()),
            Err((task, PoolError::QueueFull)) => self.reject(task),
            Err((_, err)) => {
                self.inner.counters.rejected_tasks.fetch_add(1, Ordering::Relaxed);
                Err(err)
            }
        }
    }

    /// Try to place a task on a thread or in the queue, handing it back on failure.
    fn place(&self, task: Runnable) -> Result<(), (Runnable, PoolError)> {
        let mut state = self.inner.state.lock();
        if state.run_state != RunState::Running {
            return Err((task, PoolError::PoolShutdown));
        }

        if state.workers < state.core_pool_size {
            return self
                .inner
                .add_worker(&mut state, Some(task.clone()))
                .map_err(|err| (task, err));
        }

        let Some(sender) = state.sender.as_ref() else {
            return Err((task, PoolError::PoolShutdown));
        };
        match sender.try_send(task) {
            Ok(()) => {
                debug!(queued = self.inner.receiver.len(), "Task queued");
                if state.workers == 0 {
                    // The task is already queued; a spawn failure leaves it for the next worker.
                    let _ = self.inner.add_worker(&mut state, None);
                }
                Ok(())
            }
            Err(TrySendError::Full(task)) => {
                if state.workers < state.max_pool_size {
                    self.inner
                        .add_worker(&mut state, Some(task.clone()))
                        .map_err(|err| (task, err))
                } else {
                    Err((task, PoolError::QueueFull))
                }
            }
            Err(TrySendError::Disconnected(task)) => Err((task, PoolError::PoolShutdown)),
        }
    }

    fn reject(&self, task: Runnable) -> Result<(), PoolError> {
        let counters = &self.inner.counters;
        match self.inner.rejection_policy {
            RejectionPolicy::Abort => {
                counters.rejected_tasks.fetch_add(1, Ordering::Relaxed);
                warn!(task = %task.description(), "Pool saturated; task rejected");
                Err(PoolError::QueueFull)
            }
            RejectionPolicy::CallerRuns => {
                debug!(task = %task.description(), "Pool saturated; running task on caller thread");
                self.inner.run_task(&task);
                Ok(())
            }
            RejectionPolicy::Discard => {
                counters.rejected_tasks.fetch_add(1, Ordering::Relaxed);
                warn!(task = %task.description(), "Pool saturated; task discarded");
                Ok(())
            }
            RejectionPolicy::DiscardOldest => {
                counters.rejected_tasks.fetch_add(1, Ordering::Relaxed);
                let Ok(oldest) = self.inner.receiver.try_recv() else {
                    warn!(task = %task.description(), "Pool saturated with nothing queued; task discarded");
                    return Ok(());
                };
                warn!(task = %oldest.description(), "Pool saturated; oldest queued task discarded");
                match self.place(task) {
                    Ok(()) => Ok(()),
                    Err((task, PoolError::QueueFull)) => {
                        warn!(task = %task.description(), "Pool still saturated; task discarded");
                        Ok(())
                    }
                    Err((_, err)) => Err(err),
                }
            }
        }
    }

    /// Start idle core threads until the core size is reached.
    ///
    /// Returns the number of threads started.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Internal` if a thread cannot be spawned.
    pub fn prestart_all_core_threads(&self) -> Result<usize, PoolError> {
        let mut state = self.inner.state.lock();
        let mut started = 0;
        while state.run_state == RunState::Running && state.workers < state.core_pool_size {
            self.inner.add_worker(&mut state, None)?;
            started += 1;
        }
        Ok(started)
    }

    /// Stop accepting tasks; queued and running tasks still complete.
    ///
    /// Does not block. Calling it again is a no-op.
    pub fn shutdown(&self) {
        let mut state = self.inner.state.lock();
        if state.run_state != RunState::Running {
            return;
        }
        state.run_state = RunState::Shutdown;
        // Workers drain the queue, then see the disconnect and exit.
        state.sender = None;
        self.inner.try_terminate(&mut state);
        info!(
            thread_name_prefix = %self.inner.thread_name_prefix,
            workers = state.workers,
            queued = self.inner.receiver.len(),
            "WorkerPool shutting down"
        );
    }

    /// Stop accepting tasks and drain the queue.
    ///
    /// Running tasks are not interrupted; the drained tasks are returned to
    /// the caller, never run.
    pub fn shutdown_now(&self) -> Vec<Runnable> {
        {
            let mut state = self.inner.state.lock();
            if state.run_state < RunState::Stop {
                state.run_state = RunState::Stop;
                state.sender = None;
            }
        }
        let drained: Vec<Runnable> = self.inner.receiver.try_iter().collect();
        let mut state = self.inner.state.lock();
        self.inner.try_terminate(&mut state);
        info!(
            thread_name_prefix = %self.inner.thread_name_prefix,
            workers = state.workers,
            drained = drained.len(),
            "WorkerPool stopped"
        );
        drained
    }

    /// Block until all workers have exited or `timeout` elapses.
    ///
    /// Returns `true` if the pool terminated in time.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        while state.run_state != RunState::Terminated {
            if self.inner.terminated.wait_until(&mut state, deadline).timed_out() {
                return state.run_state == RunState::Terminated;
            }
        }
        true
    }

    /// Whether `shutdown` or `shutdown_now` has been called.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.inner.state.lock().run_state != RunState::Running
    }

    /// Whether all workers have exited after shutdown.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.inner.state.lock().run_state == RunState::Terminated
    }

    /// Current core pool size.
    #[must_use]
    pub fn core_pool_size(&self) -> usize {
        self.inner.state.lock().core_pool_size
    }

    /// Change the core pool size on the live pool.
    ///
    /// Growing starts threads for already queued work. Shrinking takes effect
    /// as surplus threads next go idle.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::InvalidArgument` if `size` exceeds the max pool size.
    pub fn set_core_pool_size(&self, size: usize) -> Result<(), PoolError> {
        let mut state = self.inner.state.lock();
        if size > state.max_pool_size {
            return Err(PoolError::InvalidArgument(format!(
                "core_pool_size ({size}) must not exceed max_pool_size ({})",
                state.max_pool_size
            )));
        }
        state.core_pool_size = size;
        let missing = size.saturating_sub(state.workers).min(self.inner.receiver.len());
        for _ in 0..missing {
            if state.run_state != RunState::Running {
                break;
            }
            self.inner.add_worker(&mut state, None)?;
        }
        debug!(core_pool_size = size, "Core pool size changed");
        Ok(())
    }

    /// Current maximum pool size.
    #[must_use]
    pub fn max_pool_size(&self) -> usize {
        self.inner.state.lock().max_pool_size
    }

    /// Change the maximum pool size on the live pool.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::InvalidArgument` if `size` is zero or below the core size.
    pub fn set_max_pool_size(&self, size: usize) -> Result<(), PoolError> {
        let mut state = self.inner.state.lock();
        if size == 0 || size < state.core_pool_size {
            return Err(PoolError::InvalidArgument(format!(
                "max_pool_size ({size}) must be greater than 0 and at least core_pool_size ({})",
                state.core_pool_size
            )));
        }
        state.max_pool_size = size;
        debug!(max_pool_size = size, "Max pool size changed");
        Ok(())
    }

    /// Current keep-alive.
    #[must_use]
    pub fn keep_alive(&self) -> Duration {
        self.inner.state.lock().keep_alive
    }

    /// Change the keep-alive on the live pool.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::InvalidArgument` for a zero keep-alive while core
    /// threads may time out.
    pub fn set_keep_alive(&self, keep_alive: Duration) -> Result<(), PoolError> {
        let mut state = self.inner.state.lock();
        if keep_alive.is_zero() && state.allow_core_thread_timeout {
            return Err(PoolError::InvalidArgument(
                "keep-alive must be greater than 0 when core threads may time out".into(),
            ));
        }
        state.keep_alive = keep_alive;
        Ok(())
    }

    /// Allow or forbid core threads to time out.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::InvalidArgument` when enabling with a zero keep-alive.
    pub fn set_allow_core_thread_timeout(&self, allow: bool) -> Result<(), PoolError> {
        let mut state = self.inner.state.lock();
        if allow && state.keep_alive.is_zero() {
            return Err(PoolError::InvalidArgument(
                "keep-alive must be greater than 0 when core threads may time out".into(),
            ));
        }
        state.allow_core_thread_timeout = allow;
        Ok(())
    }

    /// Live worker threads.
    #[must_use]
    pub fn pool_size(&self) -> usize {
        self.inner.state.lock().workers
    }

    /// Threads currently running a task (best effort).
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.inner.counters.active_tasks.load(Ordering::Relaxed)
    }

    /// Tasks waiting in the queue.
    #[must_use]
    pub fn queue_size(&self) -> usize {
        self.inner.receiver.len()
    }

    /// Queue capacity fixed at creation.
    #[must_use]
    pub fn queue_capacity(&self) -> Option<usize> {
        self.inner.queue_capacity
    }

    /// Highest number of threads ever alive at once.
    #[must_use]
    pub fn largest_pool_size(&self) -> usize {
        self.inner.state.lock().largest
    }

    /// Tasks that finished running.
    #[must_use]
    pub fn completed_task_count(&self) -> u64 {
        self.inner.counters.completed_tasks.load(Ordering::Relaxed)
    }

    /// Get current pool statistics.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let (workers, largest) = {
            let state = self.inner.state.lock();
            (state.workers, state.largest)
        };
        self.inner
            .counters
            .snapshot(workers, self.inner.receiver.len(), largest)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Signal shutdown but don't join; idle workers drain and exit on their own.
        if !self.is_shutdown() {
            debug!("WorkerPool dropped without explicit shutdown - workers will be detached");
            self.shutdown();
        }
    }
}

impl Inner {
    /// Spawn a worker, optionally seeded with its first task.
    fn add_worker(self: &Arc<Self>, state: &mut PoolState, first: Option<Runnable>) -> Result<(), PoolError> {
        state.thread_seq += 1;
        let name = format!("{}{}", self.thread_name_prefix, state.thread_seq);
        let inner = Arc::clone(self);
        thread::Builder::new()
            .name(name.clone())
            .spawn(move || inner.worker_loop(first))
            .map_err(|e| {
                error!(thread = %name, error = %e, "Failed to spawn worker thread");
                PoolError::Internal(format!("failed to spawn worker thread `{name}`: {e}"))
            })?;
        state.workers += 1;
        state.largest = state.largest.max(state.workers);
        debug!(thread = %name, workers = state.workers, "Worker thread started");
        Ok(())
    }

    fn worker_loop(self: Arc<Self>, first: Option<Runnable>) {
        let mut next = first;
        loop {
            let task = match next.take() {
                Some(task) => task,
                None => match self.next_task() {
                    NextTask::Run(task) => task,
                    NextTask::Exit => {
                        let mut state = self.state.lock();
                        state.workers -= 1;
                        self.try_terminate(&mut state);
                        return;
                    }
                    NextTask::Retired => return,
                },
            };
            self.run_task(&task);
        }
    }

    fn next_task(&self) -> NextTask {
        loop {
            let (timed, keep_alive) = {
                let mut state = self.state.lock();
                if state.run_state >= RunState::Stop {
                    return NextTask::Exit;
                }
                if state.workers > state.max_pool_size {
                    return self.retire(&mut state);
                }
                (
                    state.allow_core_thread_timeout || state.workers > state.core_pool_size,
                    state.keep_alive,
                )
            };

            let received = if timed {
                self.receiver.recv_timeout(keep_alive)
            } else {
                self.receiver
                    .recv()
                    .map_err(|_| RecvTimeoutError::Disconnected)
            };

            match received {
                Ok(task) => return NextTask::Run(task),
                Err(RecvTimeoutError::Disconnected) => return NextTask::Exit,
                Err(RecvTimeoutError::Timeout) => {
                    let mut state = self.state.lock();
                    let surplus =
                        state.allow_core_thread_timeout || state.workers > state.core_pool_size;
                    if surplus && (state.workers > 1 || self.receiver.is_empty()) {
                        return self.retire(&mut state);
                    }
                }
            }
        }
    }

    fn retire(&self, state: &mut PoolState) -> NextTask {
        state.workers -= 1;
        debug!(workers = state.workers, "Idle worker retired");
        self.try_terminate(state);
        NextTask::Retired
    }

    fn run_task(&self, task: &Runnable) {
        self.counters.active_tasks.fetch_add(1, Ordering::Relaxed);
        let result = task.run();
        self.counters.active_tasks.fetch_sub(1, Ordering::Relaxed);
        self.counters.completed_tasks.fetch_add(1, Ordering::Relaxed);
        if let Err(failure) = result {
            self.counters.failed_tasks.fetch_add(1, Ordering::Relaxed);
            if already_reported(&failure) {
                debug!(task = %task.description(), error = %failure, "Task failed on worker thread");
            } else {
                error!(task = %task.description(), error = %failure, "Task failed on worker thread");
            }
        }
    }

    /// Move to `Terminated` once shut down with no workers left.
    fn try_terminate(&self, state: &mut PoolState) {
        if state.run_state == RunState::Running || state.run_state == RunState::Terminated {
            return;
        }
        if state.workers == 0 && (state.run_state == RunState::Stop || self.receiver.is_empty()) {
            state.run_state = RunState::Terminated;
            self.terminated.notify_all();
            info!(thread_name_prefix = %self.thread_name_prefix, "WorkerPool terminated");
        }
    }
}
