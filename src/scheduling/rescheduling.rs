//! Self-rescheduling task: the trigger bridge for backends without native
//! trigger support.
//!
//! Each tick runs the work, records what happened in a fresh
//! [`TriggerContext`], asks the policy for the next instant and submits the
//! next tick as a one-shot with the matching delay. The chain ends when the
//! policy returns `None`, the work fails with a propagating error, the policy
//! panics, the handle is cancelled, or the backend stops accepting ticks.
//!
//! Lock discipline: the chain lock is never held while calling into the
//! backend or dropping a backend handle.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

use crate::core::future::{ScheduledFuture, ScheduledHandle};
use crate::core::task::{panic_message, Runnable, TaskFailure};
use crate::core::worker_pool::{PoolError, ScheduledExecutor};
use crate::util::clock;

use super::managed::{BackendTrigger, LastExecution};
use super::trigger::{Trigger, TriggerContext};

/// Where the next instant comes from.
#[derive(Clone)]
pub(crate) enum NextRun {
    /// A plain trigger fed with the chain's own context.
    Trigger(Arc<dyn Trigger>),
    /// A backend trigger fed with the backend's last-execution record.
    Backend(Arc<dyn BackendTrigger>),
}

enum ChainStatus {
    Active,
    Finished(Result<(), TaskFailure>),
}

struct ChainState {
    status: ChainStatus,
    cancelled: bool,
    context: TriggerContext,
    scheduled_time: Option<DateTime<Utc>>,
    current: Option<ScheduledHandle>,
    generation: u64,
    runs: u64,
}

/// One chain of trigger-driven executions.
pub(crate) struct ReschedulingRunnable {
    task: Runnable,
    next_run: NextRun,
    executor: Weak<dyn ScheduledExecutor>,
    submitted_at: DateTime<Utc>,
    state: Mutex<ChainState>,
    finished: Condvar,
}

/// The unit submitted per execution; dropped unrun, it cancels the chain.
struct Tick {
    chain: Option<Arc<ReschedulingRunnable>>,
}

impl Tick {
    fn run(mut self) {
        if let Some(chain) = self.chain.take() {
            chain.run();
        }
    }
}

impl Drop for Tick {
    fn drop(&mut self) {
        if let Some(chain) = self.chain.take() {
            chain.finish(Err(TaskFailure::Cancelled));
        }
    }
}

impl fmt::Debug for ReschedulingRunnable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ReschedulingRunnable")
            .field("task", &self.task.description())
            .field("scheduled_time", &state.scheduled_time)
            .field("runs", &state.runs)
            .field("cancelled", &state.cancelled)
            .field("done", &matches!(state.status, ChainStatus::Finished(_)))
            .finish()
    }
}

impl ReschedulingRunnable {
    pub(crate) fn new(task: Runnable, next_run: NextRun, executor: &Arc<dyn ScheduledExecutor>) -> Arc<Self> {
        Arc::new(Self {
            task,
            next_run,
            executor: Arc::downgrade(executor),
            submitted_at: clock::now(),
            state: Mutex::new(ChainState {
                status: ChainStatus::Active,
                cancelled: false,
                context: TriggerContext::default(),
                scheduled_time: None,
                current: None,
                generation: 0,
                runs: 0,
            }),
            finished: Condvar::new(),
        })
    }

    /// Schedule the first execution.
    ///
    /// Returns `Ok(None)` when the policy yields no first instant; nothing is
    /// submitted in that case.
    ///
    /// # Errors
    ///
    /// Returns the backend's [`PoolError`] if the first tick is refused.
    pub(crate) fn start(self: &Arc<Self>) -> Result<Option<ScheduledHandle>, PoolError> {
        let Some(first) = self.next_time(&TriggerContext::default()) else {
            debug!(task = %self.task.description(), "Trigger produced no first execution time");
            self.finish(Ok(()));
            return Ok(None);
        };
        let executor = self
            .executor
            .upgrade()
            .ok_or(PoolError::PoolShutdown)?;
        let generation = {
            let mut state = self.state.lock();
            state.scheduled_time = Some(first);
            state.generation += 1;
            state.generation
        };
        let handle = executor.schedule(self.tick(), clock::delay_until(first))?;
        self.install(generation, handle);
        Ok(Some(Arc::clone(self) as ScheduledHandle))
    }

    fn tick(self: &Arc<Self>) -> Runnable {
        let tick = Tick {
            chain: Some(Arc::clone(self)),
        };
        Runnable::once(move || {
            tick.run();
            Ok(())
        })
        .named(self.task.description())
    }

    /// Keep `handle` as the current tick unless a newer tick or the end of the chain got there first.
    fn install(&self, generation: u64, handle: ScheduledHandle) {
        let (stale, previous) = {
            let mut state = self.state.lock();
            if state.cancelled || matches!(state.status, ChainStatus::Finished(_)) {
                (Some(handle), None)
            } else if state.generation == generation {
                (None, state.current.replace(handle))
            } else {
                (None, None)
            }
        };
        if let Some(stale) = stale {
            stale.cancel();
        }
        drop(previous);
    }

    /// Evaluate the policy; a panic ends the chain.
    fn next_time(&self, context: &TriggerContext) -> Option<DateTime<Utc>> {
        let evaluated = catch_unwind(AssertUnwindSafe(|| match &self.next_run {
            NextRun::Trigger(trigger) => trigger.next_execution_time(context),
            NextRun::Backend(trigger) => {
                let last = LastExecution::from_context(self.task.description(), context);
                trigger.next_run_time(last.as_ref(), self.submitted_at)
            }
        }));
        match evaluated {
            Ok(next) => next,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(task = %self.task.description(), error = %message, "Trigger failed; schedule ended");
                self.finish(Err(TaskFailure::Panicked(message)));
                None
            }
        }
    }

    fn should_skip(&self, context: &TriggerContext, scheduled: DateTime<Utc>) -> bool {
        let NextRun::Backend(trigger) = &self.next_run else {
            return false;
        };
        let last = LastExecution::from_context(self.task.description(), context);
        catch_unwind(AssertUnwindSafe(|| trigger.skip_run(last.as_ref(), scheduled))).unwrap_or(false)
    }

    fn run(self: &Arc<Self>) {
        let (scheduled, context) = {
            let state = self.state.lock();
            if state.cancelled || matches!(state.status, ChainStatus::Finished(_)) {
                return;
            }
            (state.scheduled_time.unwrap_or_else(clock::now), state.context)
        };

        let started = clock::now();
        if self.should_skip(&context, scheduled) {
            debug!(task = %self.task.description(), %scheduled, "Backend trigger skipped this run");
        } else if let Err(failure) = self.task.run() {
            debug!(task = %self.task.description(), error = %failure, "Scheduled run failed; schedule ended");
            self.finish(Err(failure));
            return;
        }
        let completed = clock::now();

        {
            let mut state = self.state.lock();
            if state.cancelled || matches!(state.status, ChainStatus::Finished(_)) {
                return;
            }
            state.runs += 1;
            state.context = TriggerContext::new(Some(scheduled), Some(started), Some(completed));
        }
        self.schedule_next();
    }

    fn schedule_next(self: &Arc<Self>) {
        let context = self.state.lock().context;
        let Some(next) = self.next_time(&context) else {
            debug!(task = %self.task.description(), "Trigger completed; schedule ended");
            self.finish(Ok(()));
            return;
        };
        let Some(executor) = self.executor.upgrade() else {
            self.finish(Err(TaskFailure::Cancelled));
            return;
        };
        let generation = {
            let mut state = self.state.lock();
            if state.cancelled || matches!(state.status, ChainStatus::Finished(_)) {
                return;
            }
            state.scheduled_time = Some(next);
            state.generation += 1;
            state.generation
        };
        match executor.schedule(self.tick(), clock::delay_until(next)) {
            Ok(handle) => self.install(generation, handle),
            Err(err) => {
                // The refused tick has already cancelled the chain on drop.
                error!(
                    task = %self.task.description(),
                    executor = %executor.describe(),
                    error = %err,
                    "Next execution was not accepted; schedule ended"
                );
                self.finish(Err(TaskFailure::Cancelled));
            }
        }
    }

    fn finish(&self, result: Result<(), TaskFailure>) {
        let current = {
            let mut state = self.state.lock();
            if matches!(state.status, ChainStatus::Finished(_)) {
                return;
            }
            let result = if state.cancelled { Err(TaskFailure::Cancelled) } else { result };
            state.status = ChainStatus::Finished(result);
            self.finished.notify_all();
            state.current.take()
        };
        drop(current);
    }

    /// Completed executions so far.
    pub(crate) fn run_count(&self) -> u64 {
        self.state.lock().runs
    }
}

impl ScheduledFuture for ReschedulingRunnable {
    fn cancel(&self) -> bool {
        let current = {
            let mut state = self.state.lock();
            if matches!(state.status, ChainStatus::Finished(_)) {
                return false;
            }
            state.cancelled = true;
            state.current.take()
        };
        if let Some(current) = current {
            current.cancel();
        }
        self.finish(Err(TaskFailure::Cancelled));
        true
    }

    fn is_cancelled(&self) -> bool {
        self.state.lock().cancelled
    }

    fn is_done(&self) -> bool {
        matches!(self.state.lock().status, ChainStatus::Finished(_))
    }

    fn delay(&self) -> Duration {
        let current = self.state.lock().current.clone();
        current.map_or(Duration::ZERO, |handle| handle.delay())
    }

    fn wait(&self, timeout: Duration) -> Result<(), TaskFailure> {
        let deadline = std::time::Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let ChainStatus::Finished(result) = &state.status {
                return match result {
                    Ok(()) => Ok(()),
                    Err(failure) => Err(failure.duplicate()),
                };
            }
            if self.finished.wait_until(&mut state, deadline).timed_out()
                && !matches!(state.status, ChainStatus::Finished(_))
            {
                return Err(TaskFailure::Timeout);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerPoolConfig;
    use crate::core::worker_pool::ScheduledWorkerPool;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn backend() -> Arc<dyn ScheduledExecutor> {
        Arc::new(ScheduledWorkerPool::new(&SchedulerPoolConfig::new().with_pool_size(2)).unwrap())
    }

    fn every_10ms() -> Arc<dyn Trigger> {
        Arc::new(|ctx: &TriggerContext| {
            Some(ctx.last_completion_time.map_or_else(clock::now, |t| t + chrono::Duration::milliseconds(10)))
        })
    }

    #[test]
    fn test_terminal_trigger_stops_chain() {
        let executor = backend();
        let runs = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&runs);
        let task = Runnable::new(move || {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let budget = Arc::new(AtomicUsize::new(3));
        let remaining = Arc::clone(&budget);
        let trigger: Arc<dyn Trigger> = Arc::new(move |ctx: &TriggerContext| {
            let left = remaining.load(Ordering::SeqCst);
            if left == 0 {
                return None;
            }
            remaining.store(left - 1, Ordering::SeqCst);
            Some(ctx.last_completion_time.unwrap_or_else(clock::now))
        });
        let chain = ReschedulingRunnable::new(task, NextRun::Trigger(trigger), &executor);
        let handle = chain.start().unwrap().unwrap();
        handle.wait(Duration::from_secs(5)).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert_eq!(chain.run_count(), 3);
    }

    #[test]
    fn test_no_first_time_schedules_nothing() {
        let executor = backend();
        let never: Arc<dyn Trigger> = Arc::new(|_: &TriggerContext| None);
        let chain = ReschedulingRunnable::new(Runnable::new(|| Ok(())), NextRun::Trigger(never), &executor);
        assert!(chain.start().unwrap().is_none());
    }

    #[test]
    fn test_cancel_stops_chain() {
        let executor = backend();
        let runs = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&runs);
        let task = Runnable::new(move || {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let chain = ReschedulingRunnable::new(task, NextRun::Trigger(every_10ms()), &executor);
        let handle = chain.start().unwrap().unwrap();
        std::thread::sleep(Duration::from_millis(60));
        assert!(handle.cancel());
        let after_cancel = runs.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(60));
        assert!(runs.load(Ordering::SeqCst) <= after_cancel + 1);
        assert!(handle.is_cancelled());
        assert!(matches!(handle.wait(Duration::from_secs(1)), Err(TaskFailure::Cancelled)));
    }

    #[test]
    fn test_panicking_trigger_ends_chain() {
        let executor = backend();
        let trigger: Arc<dyn Trigger> = Arc::new(|ctx: &TriggerContext| {
            assert!(ctx.is_first_run(), "trigger exploded");
            Some(clock::now())
        });
        let chain = ReschedulingRunnable::new(Runnable::new(|| Ok(())), NextRun::Trigger(trigger), &executor);
        let handle = chain.start().unwrap().unwrap();
        let err = handle.wait(Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, TaskFailure::Panicked(_)));
    }

    #[test]
    fn test_shutdown_now_cancels_pending_tick() {
        let pool = Arc::new(ScheduledWorkerPool::new(&SchedulerPoolConfig::new()).unwrap());
        let executor: Arc<dyn ScheduledExecutor> = Arc::clone(&pool) as Arc<dyn ScheduledExecutor>;
        let later: Arc<dyn Trigger> = Arc::new(|_: &TriggerContext| Some(clock::now() + chrono::Duration::seconds(60)));
        let chain = ReschedulingRunnable::new(Runnable::new(|| Ok(())), NextRun::Trigger(later), &executor);
        let handle = chain.start().unwrap().unwrap();
        drop(pool.shutdown_now());
        assert!(matches!(handle.wait(Duration::from_secs(1)), Err(TaskFailure::Cancelled)));
    }
}
