//! Delay-queue scheduling on top of a `WorkerPool`.
//!
//! One timer thread owns the delay queue (ordered by due instant, ties broken
//! by submission order) and hands due entries to the worker pool. Periodic
//! entries re-enter the queue after each successful run:
//!
//! - fixed rate: next due = previous *scheduled* instant + period
//! - fixed delay: next due = completion instant + delay
//!
//! A run that fails ends its periodic chain.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

use crate::config::{PoolConfig, SchedulerPoolConfig};
use crate::core::future::{ScheduledFuture, ScheduledHandle};
use crate::core::task::{Runnable, TaskFailure};

use super::{PoolError, PoolStats, WorkerPool};

/// Backend contract of a scheduled executor.
///
/// Scheduler facades consume this; the native implementation is
/// [`ScheduledWorkerPool`]. Errors are backend-native and get translated by
/// the facade.
pub trait ScheduledExecutor: Send + Sync {
    /// Run a task as soon as possible.
    ///
    /// # Errors
    ///
    /// Returns a [`PoolError`] if the task cannot be accepted.
    fn execute(&self, task: Runnable) -> Result<(), PoolError>;

    /// Run a task once after `delay`.
    ///
    /// # Errors
    ///
    /// Returns a [`PoolError`] if the task cannot be accepted.
    fn schedule(&self, task: Runnable, delay: Duration) -> Result<ScheduledHandle, PoolError>;

    /// Run a task every `period`, measured from each scheduled start.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::InvalidArgument` for a zero period, or another
    /// [`PoolError`] if the task cannot be accepted.
    fn schedule_at_fixed_rate(
        &self,
        task: Runnable,
        initial_delay: Duration,
        period: Duration,
    ) -> Result<ScheduledHandle, PoolError>;

    /// Run a task repeatedly, waiting `delay` after each completion.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::InvalidArgument` for a zero delay, or another
    /// [`PoolError`] if the task cannot be accepted.
    fn schedule_with_fixed_delay(
        &self,
        task: Runnable,
        initial_delay: Duration,
        delay: Duration,
    ) -> Result<ScheduledHandle, PoolError>;

    /// Human-readable identity used in rejection errors.
    fn describe(&self) -> String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Period {
    OneShot,
    FixedRate(Duration),
    FixedDelay(Duration),
}

impl Period {
    const fn is_periodic(self) -> bool {
        !matches!(self, Self::OneShot)
    }
}

type QueueKey = (Instant, u64);

enum EntryStatus {
    Waiting,
    Running,
    Finished(Result<(), TaskFailure>),
}

struct EntryState {
    status: EntryStatus,
    cancelled: bool,
    key: QueueKey,
    /// Released once the entry finishes.
    task: Option<Runnable>,
}

/// A scheduled task and its handle.
struct ScheduledEntry {
    description: String,
    period: Period,
    state: Mutex<EntryState>,
    finished: Condvar,
    owner: Weak<SchedInner>,
}

impl fmt::Debug for ScheduledEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledEntry")
            .field("task", &self.description)
            .field("period", &self.period)
            .field("delay", &self.delay())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl ScheduledEntry {
    /// Claim the entry for a run; returns its scheduled instant and task.
    fn begin_run(&self) -> Option<(Instant, Runnable)> {
        let mut state = self.state.lock();
        if state.cancelled || !matches!(state.status, EntryStatus::Waiting) {
            return None;
        }
        let task = state.task.clone()?;
        state.status = EntryStatus::Running;
        Some((state.key.0, task))
    }

    /// Record the outcome and hand back the task, to be dropped once no lock is held.
    #[must_use]
    fn finish_locked(&self, state: &mut EntryState, result: Result<(), TaskFailure>) -> Option<Runnable> {
        if !matches!(state.status, EntryStatus::Finished(_)) {
            state.status = EntryStatus::Finished(result);
            self.finished.notify_all();
        }
        state.task.take()
    }

    fn finish(&self, result: Result<(), TaskFailure>) {
        let mut state = self.state.lock();
        let result = if state.cancelled {
            Err(TaskFailure::Cancelled)
        } else {
            result
        };
        let released = self.finish_locked(&mut state, result);
        drop(state);
        drop(released);
    }

    #[must_use]
    fn cancel_locked(&self, state: &mut EntryState) -> Option<Runnable> {
        state.cancelled = true;
        self.finish_locked(state, Err(TaskFailure::Cancelled))
    }
}

impl ScheduledFuture for ScheduledEntry {
    fn cancel(&self) -> bool {
        let (key, released) = {
            let mut state = self.state.lock();
            if matches!(state.status, EntryStatus::Finished(_)) {
                return false;
            }
            if matches!(state.status, EntryStatus::Running) {
                // The run in flight completes; the chain ends after it.
                state.cancelled = true;
                (None, None)
            } else {
                let released = self.cancel_locked(&mut state);
                (Some(state.key), released)
            }
        };
        drop(released);
        if let (Some(key), Some(owner)) = (key, self.owner.upgrade()) {
            if owner.remove_on_cancel.load(Ordering::Relaxed) {
                owner.queue.lock().entries.remove(&key);
                owner.wake.notify_all();
            }
        }
        true
    }

    fn is_cancelled(&self) -> bool {
        self.state.lock().cancelled
    }

    fn is_done(&self) -> bool {
        matches!(self.state.lock().status, EntryStatus::Finished(_))
    }

    fn delay(&self) -> Duration {
        let state = self.state.lock();
        match state.status {
            EntryStatus::Waiting => state.key.0.saturating_duration_since(Instant::now()),
            _ => Duration::ZERO,
        }
    }

    fn wait(&self, timeout: Duration) -> Result<(), TaskFailure> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let EntryStatus::Finished(result) = &state.status {
                return match result {
                    Ok(()) => Ok(()),
                    Err(failure) => Err(failure.duplicate()),
                };
            }
            if self.finished.wait_until(&mut state, deadline).timed_out()
                && !matches!(state.status, EntryStatus::Finished(_))
            {
                return Err(TaskFailure::Timeout);
            }
        }
    }
}

struct DelayQueue {
    entries: BTreeMap<QueueKey, Arc<ScheduledEntry>>,
    shutdown: bool,
    stopped: bool,
    in_flight_periodic: usize,
    timer_done: bool,
}

struct SchedInner {
    pool: WorkerPool,
    name: String,
    queue: Mutex<DelayQueue>,
    wake: Condvar,
    timer_finished: Condvar,
    seq: AtomicU64,
    remove_on_cancel: AtomicBool,
    continue_periodic_after_shutdown: bool,
    execute_delayed_after_shutdown: bool,
}

/// Hands one due entry to the pool; dropped unrun, it cancels the entry.
struct Dispatch {
    inner: Arc<SchedInner>,
    entry: Option<Arc<ScheduledEntry>>,
}

impl Dispatch {
    fn run(mut self) {
        if let Some(entry) = self.entry.take() {
            self.inner.run_entry(&entry);
        }
    }
}

impl Drop for Dispatch {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.take() {
            entry.finish(Err(TaskFailure::Cancelled));
            if entry.period.is_periodic() {
                let mut queue = self.inner.queue.lock();
                queue.in_flight_periodic = queue.in_flight_periodic.saturating_sub(1);
                self.inner.wake.notify_all();
            }
        }
    }
}

impl SchedInner {
    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    fn dispatch_runnable(self: &Arc<Self>, entry: Arc<ScheduledEntry>) -> Runnable {
        let name = entry.description.clone();
        let dispatch = Dispatch {
            inner: Arc::clone(self),
            entry: Some(entry),
        };
        Runnable::once(move || {
            dispatch.run();
            Ok(())
        })
        .named(name)
    }

    fn run_entry(&self, entry: &Arc<ScheduledEntry>) {
        let Some((scheduled, task)) = entry.begin_run() else {
            if entry.period.is_periodic() {
                let mut queue = self.queue.lock();
                queue.in_flight_periodic = queue.in_flight_periodic.saturating_sub(1);
                self.wake.notify_all();
            }
            return;
        };

        let result = task.run();
        drop(task);

        let next_due = match entry.period {
            Period::OneShot => {
                entry.finish(result);
                return;
            }
            Period::FixedRate(period) => scheduled.checked_add(period),
            Period::FixedDelay(delay) => Instant::now().checked_add(delay),
        };

        let mut queue = self.queue.lock();
        queue.in_flight_periodic = queue.in_flight_periodic.saturating_sub(1);
        let released = {
            let mut state = entry.state.lock();
            match result {
                Err(failure) => {
                    debug!(task = %entry.description, error = %failure, "Periodic task failed; schedule ended");
                    let result = if state.cancelled { Err(TaskFailure::Cancelled) } else { Err(failure) };
                    entry.finish_locked(&mut state, result)
                }
                Ok(()) if state.cancelled => entry.finish_locked(&mut state, Err(TaskFailure::Cancelled)),
                Ok(()) if queue.stopped || (queue.shutdown && !self.continue_periodic_after_shutdown) => {
                    entry.cancel_locked(&mut state)
                }
                Ok(()) => match next_due {
                    Some(due) => {
                        let key = (due, self.next_seq());
                        state.key = key;
                        state.status = EntryStatus::Waiting;
                        queue.entries.insert(key, Arc::clone(entry));
                        None
                    }
                    None => entry.finish_locked(&mut state, Ok(())),
                },
            }
        };
        self.wake.notify_all();
        drop(queue);
        drop(released);
    }

    fn timer_loop(self: Arc<Self>) {
        debug!(scheduler = %self.name, "Timer thread started");
        let mut queue = self.queue.lock();
        loop {
            if queue.stopped
                || (queue.shutdown && queue.entries.is_empty() && queue.in_flight_periodic == 0)
            {
                break;
            }
            let Some((&(due, seq), _)) = queue.entries.first_key_value() else {
                self.wake.wait(&mut queue);
                continue;
            };
            if due > Instant::now() {
                self.wake.wait_until(&mut queue, due);
                continue;
            }
            let Some(entry) = queue.entries.remove(&(due, seq)) else {
                continue;
            };
            if entry.is_cancelled() {
                drop(queue);
                drop(entry);
                queue = self.queue.lock();
                continue;
            }
            if entry.period.is_periodic() {
                queue.in_flight_periodic += 1;
            }
            let runnable = self.dispatch_runnable(entry);
            // Dispatch without holding the queue; a refused Dispatch cancels itself on drop.
            drop(queue);
            if let Err(err) = self.pool.execute(runnable) {
                debug!(scheduler = %self.name, error = %err, "Due task not accepted by worker pool");
            }
            queue = self.queue.lock();
        }
        queue.timer_done = true;
        self.timer_finished.notify_all();
        drop(queue);
        self.pool.shutdown();
        debug!(scheduler = %self.name, "Timer thread exiting");
    }
}

/// Scheduled executor: a timer thread plus a fixed-size `WorkerPool`.
pub struct ScheduledWorkerPool {
    inner: Arc<SchedInner>,
}

impl fmt::Debug for ScheduledWorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledWorkerPool")
            .field("name", &self.inner.name)
            .field("scheduled", &self.scheduled_task_count())
            .field("pool", &self.inner.pool)
            .finish()
    }
}

impl ScheduledWorkerPool {
    /// Create the pool and start its timer thread.
    ///
    /// # Errors
    ///
    /// - `PoolError::InvalidConfig` if the configuration is invalid
    /// - `PoolError::Internal` if the timer thread cannot be spawned
    pub fn new(config: &SchedulerPoolConfig) -> Result<Self, PoolError> {
        config.validate().map_err(PoolError::InvalidConfig)?;
        let prefix = config
            .thread_name_prefix
            .clone()
            .unwrap_or_else(|| "scheduled-worker-".to_owned());
        let pool = WorkerPool::new(
            &PoolConfig::new()
                .with_core_pool_size(config.pool_size)
                .with_max_pool_size(config.pool_size)
                .with_thread_name_prefix(prefix.clone()),
        )?;

        let inner = Arc::new(SchedInner {
            pool,
            name: prefix.clone(),
            queue: Mutex::new(DelayQueue {
                entries: BTreeMap::new(),
                shutdown: false,
                stopped: false,
                in_flight_periodic: 0,
                timer_done: false,
            }),
            wake: Condvar::new(),
            timer_finished: Condvar::new(),
            seq: AtomicU64::new(0),
            remove_on_cancel: AtomicBool::new(config.remove_on_cancel),
            continue_periodic_after_shutdown: config.continue_existing_periodic_tasks_after_shutdown,
            execute_delayed_after_shutdown: config.execute_existing_delayed_tasks_after_shutdown,
        });

        let timer = Arc::clone(&inner);
        thread::Builder::new()
            .name(format!("{prefix}timer"))
            .spawn(move || timer.timer_loop())
            .map_err(|e| PoolError::Internal(format!("failed to spawn timer thread: {e}")))?;

        info!(
            scheduler = %prefix,
            pool_size = config.pool_size,
            remove_on_cancel = config.remove_on_cancel,
            "ScheduledWorkerPool initialized"
        );

        Ok(Self { inner })
    }

    fn enqueue(&self, task: Runnable, delay: Duration, period: Period) -> Result<ScheduledHandle, PoolError> {
        let now = Instant::now();
        // Delays too large for `Instant` are parked a century out.
        let due = now
            .checked_add(delay)
            .or_else(|| now.checked_add(Duration::from_secs(100 * 365 * 24 * 3600)))
            .unwrap_or(now);
        let mut queue = self.inner.queue.lock();
        if queue.shutdown {
            return Err(PoolError::PoolShutdown);
        }
        let key = (due, self.inner.next_seq());
        let entry = Arc::new(ScheduledEntry {
            description: task.description().to_owned(),
            period,
            state: Mutex::new(EntryState {
                status: EntryStatus::Waiting,
                cancelled: false,
                key,
                task: Some(task),
            }),
            finished: Condvar::new(),
            owner: Arc::downgrade(&self.inner),
        });
        queue.entries.insert(key, Arc::clone(&entry));
        self.inner.wake.notify_all();
        debug!(task = %entry.description, delay_ms = delay.as_millis(), "Task scheduled");
        Ok(entry as ScheduledHandle)
    }

    /// Resize the worker pool on the live scheduler.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::InvalidArgument` for a zero size.
    pub fn set_pool_size(&self, size: usize) -> Result<(), PoolError> {
        if size == 0 {
            return Err(PoolError::InvalidArgument("pool_size must be greater than 0".into()));
        }
        let pool = &self.inner.pool;
        if size >= pool.max_pool_size() {
            pool.set_max_pool_size(size)?;
            pool.set_core_pool_size(size)
        } else {
            pool.set_core_pool_size(size)?;
            pool.set_max_pool_size(size)
        }
    }

    /// Remove cancelled tasks from the delay queue right away.
    pub fn set_remove_on_cancel(&self, remove: bool) {
        self.inner.remove_on_cancel.store(remove, Ordering::Relaxed);
    }

    /// Whether cancelled tasks are removed right away.
    #[must_use]
    pub fn remove_on_cancel(&self) -> bool {
        self.inner.remove_on_cancel.load(Ordering::Relaxed)
    }

    /// Stop accepting tasks.
    ///
    /// Delayed one-shot tasks still run unless configured otherwise; periodic
    /// tasks are cancelled unless configured to continue.
    pub fn shutdown(&self) {
        let mut queue = self.inner.queue.lock();
        if queue.shutdown {
            return;
        }
        queue.shutdown = true;
        let keep_delayed = self.inner.execute_delayed_after_shutdown;
        let keep_periodic = self.inner.continue_periodic_after_shutdown;
        let mut cancelled = Vec::new();
        queue.entries.retain(|_, entry| {
            let keep = if entry.period.is_periodic() { keep_periodic } else { keep_delayed };
            if !keep {
                let released = entry.cancel_locked(&mut entry.state.lock());
                cancelled.push((Arc::clone(entry), released));
            }
            keep
        });
        info!(
            scheduler = %self.inner.name,
            remaining = queue.entries.len(),
            cancelled = cancelled.len(),
            "ScheduledWorkerPool shutting down"
        );
        self.inner.wake.notify_all();
        drop(queue);
        drop(cancelled);
    }

    /// Stop the timer, drain the delay queue and the worker queue.
    ///
    /// Returns the tasks that never started. Dropping them cancels their handles.
    pub fn shutdown_now(&self) -> Vec<Runnable> {
        let mut drained = {
            let mut queue = self.inner.queue.lock();
            queue.shutdown = true;
            queue.stopped = true;
            let entries = std::mem::take(&mut queue.entries);
            self.inner.wake.notify_all();
            entries
                .into_values()
                .map(|entry| self.inner.dispatch_runnable(entry))
                .collect::<Vec<_>>()
        };
        drained.extend(self.inner.pool.shutdown_now());
        info!(scheduler = %self.inner.name, drained = drained.len(), "ScheduledWorkerPool stopped");
        drained
    }

    /// Block until the timer has stopped and all workers have exited, or `timeout` elapses.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        {
            let mut queue = self.inner.queue.lock();
            while !queue.timer_done {
                if self.inner.timer_finished.wait_until(&mut queue, deadline).timed_out() && !queue.timer_done {
                    return false;
                }
            }
        }
        self.inner
            .pool
            .await_termination(deadline.saturating_duration_since(Instant::now()))
    }

    /// Whether shutdown has been requested.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.inner.queue.lock().shutdown
    }

    /// Whether the timer and all workers have stopped.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.inner.queue.lock().timer_done && self.inner.pool.is_terminated()
    }

    /// Tasks waiting in the delay queue.
    #[must_use]
    pub fn scheduled_task_count(&self) -> usize {
        self.inner.queue.lock().entries.len()
    }

    /// Live worker threads.
    #[must_use]
    pub fn pool_size(&self) -> usize {
        self.inner.pool.pool_size()
    }

    /// Configured worker count.
    #[must_use]
    pub fn core_pool_size(&self) -> usize {
        self.inner.pool.core_pool_size()
    }

    /// Workers currently running a task.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.inner.pool.active_count()
    }

    /// Worker pool statistics; `queue_size` counts due tasks awaiting a worker.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.inner.pool.stats()
    }
}

impl Drop for ScheduledWorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl ScheduledExecutor for ScheduledWorkerPool {
    fn execute(&self, task: Runnable) -> Result<(), PoolError> {
        if self.is_shutdown() {
            return Err(PoolError::PoolShutdown);
        }
        self.inner.pool.execute(task)
    }

    fn schedule(&self, task: Runnable, delay: Duration) -> Result<ScheduledHandle, PoolError> {
        self.enqueue(task, delay, Period::OneShot)
    }

    fn schedule_at_fixed_rate(
        &self,
        task: Runnable,
        initial_delay: Duration,
        period: Duration,
    ) -> Result<ScheduledHandle, PoolError> {
        if period.is_zero() {
            return Err(PoolError::InvalidArgument("period must be greater than 0".into()));
        }
        self.enqueue(task, initial_delay, Period::FixedRate(period))
    }

    fn schedule_with_fixed_delay(
        &self,
        task: Runnable,
        initial_delay: Duration,
        delay: Duration,
    ) -> Result<ScheduledHandle, PoolError> {
        if delay.is_zero() {
            return Err(PoolError::InvalidArgument("delay must be greater than 0".into()));
        }
        self.enqueue(task, initial_delay, Period::FixedDelay(delay))
    }

    fn describe(&self) -> String {
        format!(
            "ScheduledWorkerPool[{}] (pool size = {}, active = {}, scheduled = {})",
            self.inner.name,
            self.pool_size(),
            self.active_count(),
            self.scheduled_task_count()
        )
    }
}
