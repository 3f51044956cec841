//! Errors of the persistent scheduler engine and the registration protocol.

use thiserror::Error;

use crate::core::error::SchedulerError;
use crate::infra::datasource::{DataSourceError, TransactionError};
use crate::scheduling::trigger::TriggerError;

/// Engine and job store failures.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A job, trigger or calendar with the same identity is already stored.
    ///
    /// Registration treats this as a benign race, not a failure.
    #[error("{kind} `{key}` already exists")]
    ObjectAlreadyExists {
        /// `job`, `trigger` or `calendar`.
        kind: &'static str,
        /// Rendered identity.
        key: String,
    },
    /// No job with this key.
    #[error("job `{0}` not found")]
    JobNotFound(String),
    /// No trigger with this key.
    #[error("trigger `{0}` not found")]
    TriggerNotFound(String),
    /// A trigger names a calendar that is not stored.
    #[error("calendar `{0}` not found")]
    CalendarNotFound(String),
    /// No implementation is registered for a job type.
    #[error("no job implementation registered for type `{0}`")]
    UnknownJobType(String),
    /// The trigger never fires.
    #[error("trigger `{0}` will never fire")]
    NeverFires(String),
    /// The calendar excluded every candidate fire time within the search limit.
    #[error("calendar excluded {0} consecutive candidate fire times")]
    CalendarExhausted(usize),
    /// Job data could not be decoded into the job's parameters.
    #[error("job data binding failed: {0}")]
    DataBinding(String),
    /// A stored row could not be interpreted.
    #[error("job store error: {0}")]
    Store(String),
    /// Connection or database failure.
    #[error(transparent)]
    DataSource(#[from] DataSourceError),
    /// Definition (de)serialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// The executor refused a job run.
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    /// A schedule could not be evaluated.
    #[error(transparent)]
    Trigger(#[from] TriggerError),
    /// The engine has been shut down.
    #[error("scheduler engine `{0}` is shut down")]
    Shutdown(String),
}

impl EngineError {
    /// Already-exists signal for `kind` and `key`.
    pub fn already_exists(kind: &'static str, key: impl ToString) -> Self {
        Self::ObjectAlreadyExists {
            kind,
            key: key.to_string(),
        }
    }

    /// Whether this is the benign already-exists race.
    #[must_use]
    pub const fn is_already_exists(&self) -> bool {
        matches!(self, Self::ObjectAlreadyExists { .. })
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        Self::DataSource(DataSourceError::Sqlite(err))
    }
}

/// Failure of a registration batch.
#[derive(Debug, Error)]
pub enum RegistrationError {
    /// A registration step failed; the batch was rolled back when transactional.
    #[error("job registration failed: {0}")]
    Failed(#[source] EngineError),
    /// The surrounding transaction could not be started or committed.
    #[error(transparent)]
    Transaction(#[from] TransactionError),
}
