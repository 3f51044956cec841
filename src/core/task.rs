//! Units of work, their failures, and submission-time decoration.

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use super::error::AppResult;
use super::error_handler::{ErrorHandler, ErrorPolicy};

/// Failure of a unit of work, or of waiting for one.
#[derive(Debug, Error)]
pub enum TaskFailure {
    /// The work returned an error.
    #[error("task failed: {0:#}")]
    Failed(anyhow::Error),
    /// The work panicked; the payload message is preserved.
    #[error("task panicked: {0}")]
    Panicked(String),
    /// The task was cancelled before it completed.
    #[error("task was cancelled")]
    Cancelled,
    /// Waiting for the outcome timed out.
    #[error("timed out waiting for task outcome")]
    Timeout,
    /// The outcome was already taken by an earlier `get`.
    #[error("task outcome was already consumed")]
    Consumed,
}

impl TaskFailure {
    /// Copy of this failure for a second observer; error chains become their rendered text.
    pub(crate) fn duplicate(&self) -> Self {
        match self {
            Self::Failed(err) => Self::Failed(anyhow::anyhow!("{err:#}")),
            Self::Panicked(msg) => Self::Panicked(msg.clone()),
            Self::Cancelled => Self::Cancelled,
            Self::Timeout => Self::Timeout,
            Self::Consumed => Self::Consumed,
        }
    }
}

type Work = dyn Fn() -> AppResult<()> + Send + Sync;

/// A described, cloneable unit of work.
///
/// Cloning is cheap (the closure is shared), which lets repeating schedules
/// run the same work on every tick. Single-use closures go through
/// [`Runnable::once`].
#[derive(Clone)]
pub struct Runnable {
    work: Arc<Work>,
    description: Arc<str>,
    error_handler: Option<Arc<dyn ErrorHandler>>,
}

impl Runnable {
    /// Wrap a repeatable closure.
    pub fn new<F>(work: F) -> Self
    where
        F: Fn() -> AppResult<()> + Send + Sync + 'static,
    {
        Self {
            work: Arc::new(work),
            description: std::any::type_name::<F>().into(),
            error_handler: None,
        }
    }

    /// Wrap a closure that runs at most once; later invocations are no-ops.
    pub fn once<F>(work: F) -> Self
    where
        F: FnOnce() -> AppResult<()> + Send + 'static,
    {
        let slot = Mutex::new(Some(work));
        Self {
            work: Arc::new(move || {
                let work = slot.lock().take();
                work.map_or(Ok(()), |work| work())
            }),
            description: std::any::type_name::<F>().into(),
            error_handler: None,
        }
    }

    /// Replace the description used in logs and rejection errors.
    #[must_use]
    pub fn named(mut self, description: impl Into<String>) -> Self {
        self.description = description.into().into();
        self
    }

    /// Attach the error policy this task wants when it is scheduled.
    #[must_use]
    pub fn with_error_policy(self, policy: ErrorPolicy) -> Self {
        self.with_error_handler(policy.handler())
    }

    /// Attach a custom error handler used when this task is scheduled.
    #[must_use]
    pub fn with_error_handler(mut self, handler: Arc<dyn ErrorHandler>) -> Self {
        self.error_handler = Some(handler);
        self
    }

    /// Human-readable description of the work.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Error handler attached to this task, if any.
    #[must_use]
    pub fn error_handler(&self) -> Option<&Arc<dyn ErrorHandler>> {
        self.error_handler.as_ref()
    }

    /// Run the work, converting both returned errors and panics into a [`TaskFailure`].
    ///
    /// # Errors
    ///
    /// - `TaskFailure::Failed` when the work returns an error
    /// - `TaskFailure::Panicked` when the work panics
    pub fn run(&self) -> Result<(), TaskFailure> {
        match catch_unwind(AssertUnwindSafe(|| (self.work)())) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(TaskFailure::Failed(err)),
            Err(payload) => Err(TaskFailure::Panicked(panic_message(payload.as_ref()))),
        }
    }
}

impl fmt::Debug for Runnable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runnable")
            .field("description", &self.description)
            .field("error_handler", &self.error_handler.is_some())
            .finish()
    }
}

/// Extract a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_owned())
}

/// Wraps a unit of work once, at submission time.
///
/// Typical uses are context propagation (tracing spans, tenant ids) and
/// timing. Decoration never happens inside the pool's run loop.
pub trait TaskDecorator: Send + Sync {
    /// Return the decorated task.
    fn decorate(&self, task: Runnable) -> Runnable;
}

impl<F> TaskDecorator for F
where
    F: Fn(Runnable) -> Runnable + Send + Sync,
{
    fn decorate(&self, task: Runnable) -> Runnable {
        self(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_runnable_runs_repeatedly() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let task = Runnable::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        task.run().unwrap();
        task.clone().run().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_once_runs_a_single_time() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let task = Runnable::once(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        task.run().unwrap();
        task.run().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panic_is_captured() {
        let task = Runnable::new(|| panic!("boom"));
        match task.run() {
            Err(TaskFailure::Panicked(msg)) => assert_eq!(msg, "boom"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_error_is_captured() {
        let task = Runnable::new(|| Err(anyhow::anyhow!("bad input")));
        let err = task.run().unwrap_err();
        assert_eq!(err.to_string(), "task failed: bad input");
    }

    #[test]
    fn test_named_description() {
        let task = Runnable::new(|| Ok(())).named("nightly-report");
        assert_eq!(task.description(), "nightly-report");
    }

    #[test]
    fn test_closure_decorator() {
        let decorator = |task: Runnable| {
            let name = format!("decorated({})", task.description());
            task.named(name)
        };
        let task = decorator.decorate(Runnable::new(|| Ok(())).named("job"));
        assert_eq!(task.description(), "decorated(job)");
    }
}
