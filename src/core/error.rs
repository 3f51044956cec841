//! Error types for executor and scheduler operations.

use thiserror::Error;

use super::worker_pool::PoolError;

/// Errors produced by executors and scheduler facades.
///
/// Capacity problems always surface as [`SchedulerError::TaskRejected`]; the
/// backend pool's own [`PoolError`] only ever appears as its `cause`.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The backing pool refused to accept a task.
    #[error("executor [{executor}] did not accept task: {task}")]
    TaskRejected {
        /// Description of the executor that refused the task.
        executor: String,
        /// Description of the rejected task.
        task: String,
        /// Backend reason for the rejection.
        #[source]
        cause: PoolError,
    },
    /// The component has not been initialized yet.
    #[error("`{0}` has not been initialized")]
    NotInitialized(String),
    /// The component was already initialized or has been shut down.
    #[error("`{0}` cannot be initialized again")]
    AlreadyInitialized(String),
    /// Configuration validation failed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// A live parameter change or scheduling argument was rejected.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl SchedulerError {
    /// Build the single rejection error from its parts.
    pub fn rejected(executor: impl Into<String>, task: impl Into<String>, cause: PoolError) -> Self {
        Self::TaskRejected {
            executor: executor.into(),
            task: task.into(),
            cause,
        }
    }

    /// Whether this error is a capacity rejection.
    #[must_use]
    pub const fn is_rejection(&self) -> bool {
        matches!(self, Self::TaskRejected { .. })
    }
}

/// Application-facing result using anyhow for units of work and higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
