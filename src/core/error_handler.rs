//! Error policies for scheduled work.
//!
//! A repeating schedule either logs a failed run and keeps ticking, or logs
//! it and ends the chain. One-shot work scheduled ad hoc propagates by
//! default so the failure reaches the returned handle.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::error;

use super::task::{Runnable, TaskFailure};

/// Decides what happens after a unit of work fails.
pub trait ErrorHandler: Send + Sync {
    /// Handle a failure of the task described by `task`.
    ///
    /// # Errors
    ///
    /// Returning the failure propagates it: a repeating schedule stops and the
    /// handle reports the failure. Returning `Ok(())` suppresses it.
    fn handle_error(&self, task: &str, failure: TaskFailure) -> Result<(), TaskFailure>;
}

/// Logs the failure and suppresses it.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingErrorHandler;

impl ErrorHandler for LoggingErrorHandler {
    fn handle_error(&self, task: &str, failure: TaskFailure) -> Result<(), TaskFailure> {
        error!(task = %task, error = %failure, "Unexpected error occurred in scheduled task");
        Ok(())
    }
}

/// Logs the failure and propagates it.
#[derive(Debug, Clone, Copy, Default)]
pub struct PropagatingErrorHandler;

impl ErrorHandler for PropagatingErrorHandler {
    fn handle_error(&self, task: &str, failure: TaskFailure) -> Result<(), TaskFailure> {
        error!(task = %task, error = %failure, "Unexpected error occurred in scheduled task; propagating");
        Err(failure)
    }
}

/// The two built-in error policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Log and keep the schedule alive.
    LogAndSuppress,
    /// Log and end the schedule.
    LogAndPropagate,
}

impl ErrorPolicy {
    /// Default policy: repeating work suppresses, one-shot work propagates.
    #[must_use]
    pub const fn default_for(repeating: bool) -> Self {
        if repeating {
            Self::LogAndSuppress
        } else {
            Self::LogAndPropagate
        }
    }

    /// Handler implementing this policy.
    #[must_use]
    pub fn handler(self) -> Arc<dyn ErrorHandler> {
        match self {
            Self::LogAndSuppress => Arc::new(LoggingErrorHandler),
            Self::LogAndPropagate => Arc::new(PropagatingErrorHandler),
        }
    }
}

/// A failure an error handler has already seen and chose to propagate.
#[derive(Debug, Error)]
#[error(transparent)]
struct Propagated(TaskFailure);

/// Whether `failure` already went through an error handler, which logs it.
pub(crate) fn already_reported(failure: &TaskFailure) -> bool {
    matches!(failure, TaskFailure::Failed(err) if err.is::<Propagated>())
}

/// Wrap `task` so its failures go through an error handler.
///
/// The handler is, in order of preference: the one attached to the task, the
/// scheduler-wide `fallback`, or the default policy for `repeating`.
pub(crate) fn with_error_handling(
    task: Runnable,
    fallback: Option<&Arc<dyn ErrorHandler>>,
    repeating: bool,
) -> Runnable {
    let handler = task
        .error_handler()
        .or(fallback)
        .cloned()
        .unwrap_or_else(|| ErrorPolicy::default_for(repeating).handler());
    let description = task.description().to_owned();
    let name = description.clone();
    Runnable::new(move || match task.run() {
        Ok(()) => Ok(()),
        Err(failure) => handler
            .handle_error(&description, failure)
            .map_err(|failure| anyhow::Error::new(Propagated(failure))),
    })
    .named(name)
}
