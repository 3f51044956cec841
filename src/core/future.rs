//! Result futures for submitted work and handles for scheduled work.
//!
//! `TaskFuture` is the blocking handle returned by `submit`; waiting uses a
//! `parking_lot` Condvar, never polling. `ListenableFuture` adds completion
//! callbacks and, with the `tokio-runtime` feature, an async bridge.

use std::fmt;
use std::ops::Deref;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::error::AppResult;
use super::task::{panic_message, Runnable, TaskFailure};

type Listener<T> = Box<dyn FnOnce(&Result<T, TaskFailure>) + Send>;

enum Outcome<T> {
    Pending,
    Running,
    Done(Result<T, TaskFailure>),
    Consumed,
}

struct FutureState<T> {
    outcome: Outcome<T>,
    listeners: Vec<Listener<T>>,
}

struct Shared<T> {
    state: Mutex<FutureState<T>>,
    done: Condvar,
}

impl<T> Shared<T> {
    /// Store the outcome if still unresolved; listeners run under the state lock.
    fn resolve(&self, result: Result<T, TaskFailure>) -> bool {
        let mut state = self.state.lock();
        if matches!(state.outcome, Outcome::Done(_) | Outcome::Consumed) {
            return false;
        }
        for listener in std::mem::take(&mut state.listeners) {
            listener(&result);
        }
        state.outcome = Outcome::Done(result);
        self.done.notify_all();
        true
    }
}

/// Handle to the eventual outcome of a submitted task.
pub struct TaskFuture<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for TaskFuture<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for TaskFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskFuture")
            .field("done", &self.is_done())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl<T> TaskFuture<T> {
    /// Create an unresolved future and the completer that resolves it.
    pub(crate) fn new() -> (Self, Completer<T>) {
        let shared = Arc::new(Shared {
            state: Mutex::new(FutureState {
                outcome: Outcome::Pending,
                listeners: Vec::new(),
            }),
            done: Condvar::new(),
        });
        (
            Self {
                shared: Arc::clone(&shared),
            },
            Completer {
                shared: Some(shared),
            },
        )
    }

    /// Cancel the task if it has not started yet.
    ///
    /// A task that is already running is not interrupted.
    pub fn cancel(&self) -> bool {
        {
            let state = self.shared.state.lock();
            if !matches!(state.outcome, Outcome::Pending) {
                return false;
            }
        }
        self.shared.resolve(Err(TaskFailure::Cancelled))
    }

    /// Whether the task was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self.shared.state.lock().outcome,
            Outcome::Done(Err(TaskFailure::Cancelled))
        )
    }

    /// Whether the task has finished, failed or been cancelled.
    #[must_use]
    pub fn is_done(&self) -> bool {
        matches!(
            self.shared.state.lock().outcome,
            Outcome::Done(_) | Outcome::Consumed
        )
    }

    /// Wait up to `timeout` for the outcome and take it.
    ///
    /// # Errors
    ///
    /// - `TaskFailure::Timeout` if the task did not finish in time
    /// - `TaskFailure::Consumed` if a previous call already took the outcome
    /// - the task's own failure (error, panic or cancellation) otherwise
    pub fn get(&self, timeout: Duration) -> Result<T, TaskFailure> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        loop {
            if matches!(state.outcome, Outcome::Done(_)) {
                break;
            }
            if matches!(state.outcome, Outcome::Consumed) {
                return Err(TaskFailure::Consumed);
            }
            if self.shared.done.wait_until(&mut state, deadline).timed_out()
                && !matches!(state.outcome, Outcome::Done(_) | Outcome::Consumed)
            {
                return Err(TaskFailure::Timeout);
            }
        }
        match std::mem::replace(&mut state.outcome, Outcome::Consumed) {
            Outcome::Done(result) => result,
            _ => Err(TaskFailure::Consumed),
        }
    }

    fn add_listener(&self, listener: Listener<T>) {
        let mut state = self.shared.state.lock();
        if matches!(state.outcome, Outcome::Pending | Outcome::Running) {
            state.listeners.push(listener);
            return;
        }
        match &state.outcome {
            Outcome::Done(result) => listener(result),
            _ => listener(&Err(TaskFailure::Consumed)),
        }
    }
}

/// Resolves a [`TaskFuture`]; dropping it unresolved cancels the future.
pub(crate) struct Completer<T> {
    shared: Option<Arc<Shared<T>>>,
}

impl<T> Completer<T> {
    /// Mark the task running; returns `false` if it was cancelled first.
    pub(crate) fn start(&self) -> bool {
        let Some(shared) = self.shared.as_ref() else {
            return false;
        };
        let mut state = shared.state.lock();
        if matches!(state.outcome, Outcome::Pending) {
            state.outcome = Outcome::Running;
            true
        } else {
            false
        }
    }

    /// Resolve the future with the task's outcome.
    pub(crate) fn complete(mut self, result: Result<T, TaskFailure>) {
        if let Some(shared) = self.shared.take() {
            shared.resolve(result);
        }
    }
}

impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.resolve(Err(TaskFailure::Cancelled));
        }
    }
}

/// Build the runnable that executes `task` and resolves `completer`.
///
/// The runnable itself always succeeds: the task's failure travels through
/// the future rather than the pool's failure counters.
pub(crate) fn future_task<T, F>(task: F, completer: Completer<T>) -> Runnable
where
    T: Send + 'static,
    F: FnOnce() -> AppResult<T> + Send + 'static,
{
    Runnable::once(move || {
        if completer.start() {
            let result = match catch_unwind(AssertUnwindSafe(task)) {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(err)) => Err(TaskFailure::Failed(err)),
                Err(payload) => Err(TaskFailure::Panicked(panic_message(payload.as_ref()))),
            };
            completer.complete(result);
        }
        Ok(())
    })
    .named(std::any::type_name::<F>())
}

/// A [`TaskFuture`] that accepts completion callbacks.
///
/// Callbacks run on the thread that completes the task, while the future's
/// state lock is held; they must not block on this same future.
pub struct ListenableFuture<T> {
    inner: TaskFuture<T>,
}

impl<T> Clone for ListenableFuture<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for ListenableFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ListenableFuture").field(&self.inner).finish()
    }
}

impl<T> From<TaskFuture<T>> for ListenableFuture<T> {
    fn from(inner: TaskFuture<T>) -> Self {
        Self { inner }
    }
}

impl<T> Deref for ListenableFuture<T> {
    type Target = TaskFuture<T>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<T: Send + 'static> ListenableFuture<T> {
    /// Register success and failure callbacks.
    ///
    /// If the task is already complete the matching callback runs immediately.
    pub fn add_callback<S, E>(&self, on_success: S, on_failure: E)
    where
        S: FnOnce(&T) + Send + 'static,
        E: FnOnce(&TaskFailure) + Send + 'static,
    {
        self.inner.add_listener(Box::new(move |result| match result {
            Ok(value) => on_success(value),
            Err(failure) => on_failure(failure),
        }));
    }

    /// Await the outcome from async code.
    ///
    /// # Errors
    ///
    /// Returns the task's failure, or `TaskFailure::Consumed` if the outcome
    /// was already taken.
    #[cfg(feature = "tokio-runtime")]
    pub async fn into_async(self) -> Result<T, TaskFailure> {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        self.inner.add_listener(Box::new(move |_| {
            let _ = tx.send(());
        }));
        // A dropped sender also means the listener ran (or never will).
        let _ = rx.await;
        self.inner.get(Duration::ZERO)
    }
}

/// Handle to a scheduled (possibly repeating) task.
pub trait ScheduledFuture: Send + Sync + fmt::Debug {
    /// Prevent further executions; a run already in flight is not interrupted.
    fn cancel(&self) -> bool;

    /// Whether the schedule was cancelled.
    fn is_cancelled(&self) -> bool;

    /// Whether the schedule has ended, by completion, failure or cancellation.
    fn is_done(&self) -> bool;

    /// Time remaining until the next planned execution (zero if due or finished).
    fn delay(&self) -> Duration;

    /// Wait up to `timeout` for the schedule to end.
    ///
    /// # Errors
    ///
    /// - `TaskFailure::Timeout` if the schedule is still active after `timeout`
    /// - `TaskFailure::Cancelled` if the schedule was cancelled
    /// - the propagated failure that ended the schedule
    fn wait(&self, timeout: Duration) -> Result<(), TaskFailure>;
}

/// Shared handle returned by every scheduling call.
pub type ScheduledHandle = Arc<dyn ScheduledFuture>;
