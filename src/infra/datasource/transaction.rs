//! Thread-bound transactions over a [`DataSource`].

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

use super::{bind, binding, unbind, Binding, DataSource, DataSourceError, SharedConnection};

/// Transaction demarcation failures.
#[derive(Debug, Error)]
pub enum TransactionError {
    /// The connection could not be obtained or the statement failed.
    #[error(transparent)]
    DataSource(#[from] DataSourceError),
    /// A participant marked the transaction rollback-only, so commit rolled back.
    #[error("transaction on `{0}` was marked rollback-only and has been rolled back")]
    RolledBack(String),
    /// Commit or rollback was already called for this status.
    #[error("transaction on `{0}` is already completed")]
    AlreadyCompleted(String),
}

impl From<rusqlite::Error> for TransactionError {
    fn from(err: rusqlite::Error) -> Self {
        Self::DataSource(DataSourceError::Sqlite(err))
    }
}

/// Begins, commits and rolls back units of work.
pub trait TransactionManager: Send + Sync {
    /// Start a unit of work, or join the one already running on this thread.
    ///
    /// # Errors
    ///
    /// Returns [`TransactionError`] if no connection can be opened or the
    /// transaction cannot start.
    fn begin(&self) -> Result<TransactionStatus, TransactionError>;

    /// Commit the unit of work started by `status`.
    ///
    /// A participating status only completes; the outermost one commits.
    ///
    /// # Errors
    ///
    /// Returns [`TransactionError::RolledBack`] if a participant asked for
    /// rollback, or the database error of the commit.
    fn commit(&self, status: TransactionStatus) -> Result<(), TransactionError>;

    /// Roll back the unit of work started by `status`.
    ///
    /// A participating status marks the outer unit rollback-only.
    ///
    /// # Errors
    ///
    /// Returns the database error of the rollback.
    fn rollback(&self, status: TransactionStatus) -> Result<(), TransactionError>;
}

/// Handle of a running unit of work.
///
/// Dropping an uncompleted status rolls it back.
pub struct TransactionStatus {
    data_source: String,
    binding: Binding,
    new_transaction: bool,
    completed: bool,
}

impl fmt::Debug for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionStatus")
            .field("data_source", &self.data_source)
            .field("new_transaction", &self.new_transaction)
            .field("completed", &self.completed)
            .finish_non_exhaustive()
    }
}

impl TransactionStatus {
    /// Whether this status started the transaction rather than joining one.
    #[must_use]
    pub const fn is_new_transaction(&self) -> bool {
        self.new_transaction
    }

    /// Whether commit or rollback has run.
    #[must_use]
    pub const fn is_completed(&self) -> bool {
        self.completed
    }

    /// Mark the whole unit of work for rollback.
    pub fn set_rollback_only(&self) {
        self.binding.rollback_only.store(true, Ordering::SeqCst);
    }

    /// Whether the unit of work will roll back.
    #[must_use]
    pub fn is_rollback_only(&self) -> bool {
        self.binding.rollback_only.load(Ordering::SeqCst)
    }

    /// The connection of the unit of work.
    #[must_use]
    pub fn connection(&self) -> SharedConnection {
        Arc::clone(&self.binding.conn)
    }

    fn complete(&mut self, commit: bool) -> Result<(), TransactionError> {
        if self.completed {
            return Err(TransactionError::AlreadyCompleted(self.data_source.clone()));
        }
        self.completed = true;
        if !self.new_transaction {
            if !commit {
                self.set_rollback_only();
            }
            return Ok(());
        }
        unbind(&self.data_source);
        let rollback_only = self.is_rollback_only();
        let conn = self.binding.conn.lock();
        if commit && !rollback_only {
            if let Err(err) = conn.execute_batch("COMMIT") {
                if let Err(rollback_err) = conn.execute_batch("ROLLBACK") {
                    warn!(data_source = %self.data_source, error = %rollback_err, "Rollback after failed commit failed");
                }
                return Err(err.into());
            }
            debug!(data_source = %self.data_source, "Committed transaction");
            return Ok(());
        }
        conn.execute_batch("ROLLBACK")?;
        debug!(data_source = %self.data_source, "Rolled back transaction");
        if commit {
            return Err(TransactionError::RolledBack(self.data_source.clone()));
        }
        Ok(())
    }
}

impl Drop for TransactionStatus {
    fn drop(&mut self) {
        if !self.completed {
            if let Err(err) = self.complete(false) {
                warn!(data_source = %self.data_source, error = %err, "Rollback of abandoned transaction failed");
            }
        }
    }
}

/// Transaction manager for one [`DataSource`].
///
/// `begin` opens a connection, issues `BEGIN IMMEDIATE` and binds the
/// connection to the calling thread until commit or rollback.
#[derive(Clone)]
pub struct DataSourceTransactionManager {
    data_source: Arc<dyn DataSource>,
}

impl fmt::Debug for DataSourceTransactionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataSourceTransactionManager")
            .field("data_source", &self.data_source.id())
            .finish()
    }
}

impl DataSourceTransactionManager {
    /// Manager for `data_source`.
    #[must_use]
    pub fn new(data_source: Arc<dyn DataSource>) -> Self {
        Self { data_source }
    }

    /// The managed data source.
    #[must_use]
    pub fn data_source(&self) -> &Arc<dyn DataSource> {
        &self.data_source
    }
}

impl TransactionManager for DataSourceTransactionManager {
    fn begin(&self) -> Result<TransactionStatus, TransactionError> {
        let id = self.data_source.id().to_owned();
        if let Some(existing) = binding(&id) {
            debug!(data_source = %id, "Participating in existing transaction");
            return Ok(TransactionStatus {
                data_source: id,
                binding: existing,
                new_transaction: false,
                completed: false,
            });
        }
        let conn = self.data_source.connect()?;
        conn.execute_batch("BEGIN IMMEDIATE")?;
        let fresh = Binding {
            conn: Arc::new(Mutex::new(conn)),
            rollback_only: Arc::new(AtomicBool::new(false)),
        };
        bind(&id, fresh.clone());
        debug!(data_source = %id, "Began transaction");
        Ok(TransactionStatus {
            data_source: id,
            binding: fresh,
            new_transaction: true,
            completed: false,
        })
    }

    fn commit(&self, mut status: TransactionStatus) -> Result<(), TransactionError> {
        status.complete(true)
    }

    fn rollback(&self, mut status: TransactionStatus) -> Result<(), TransactionError> {
        status.complete(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::datasource::{bound_connection, SqliteDataSource};

    fn setup() -> (tempfile::TempDir, Arc<dyn DataSource>) {
        let dir = tempfile::tempdir().unwrap();
        let source = SqliteDataSource::new(dir.path().join("tx.db"));
        let conn = source.connect().unwrap();
        conn.execute_batch("CREATE TABLE items (name TEXT NOT NULL)").unwrap();
        (dir, Arc::new(source))
    }

    fn count(source: &Arc<dyn DataSource>) -> i64 {
        source
            .connect()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM items", [], |row| row.get(0))
            .unwrap()
    }

    fn insert(status: &TransactionStatus) {
        status
            .connection()
            .lock()
            .execute("INSERT INTO items (name) VALUES ('a')", [])
            .unwrap();
    }

    #[test]
    fn test_commit_persists_and_unbinds() {
        let (_dir, source) = setup();
        let manager = DataSourceTransactionManager::new(Arc::clone(&source));
        let status = manager.begin().unwrap();
        assert!(status.is_new_transaction());
        assert!(bound_connection(source.id()).is_some());
        insert(&status);
        manager.commit(status).unwrap();
        assert!(bound_connection(source.id()).is_none());
        assert_eq!(count(&source), 1);
    }

    #[test]
    fn test_rollback_discards() {
        let (_dir, source) = setup();
        let manager = DataSourceTransactionManager::new(Arc::clone(&source));
        let status = manager.begin().unwrap();
        insert(&status);
        manager.rollback(status).unwrap();
        assert_eq!(count(&source), 0);
    }

    #[test]
    fn test_nested_rollback_marks_outer() {
        let (_dir, source) = setup();
        let manager = DataSourceTransactionManager::new(Arc::clone(&source));
        let outer = manager.begin().unwrap();
        let inner = manager.begin().unwrap();
        assert!(!inner.is_new_transaction());
        insert(&inner);
        manager.rollback(inner).unwrap();
        assert!(outer.is_rollback_only());
        assert!(matches!(manager.commit(outer), Err(TransactionError::RolledBack(_))));
        assert_eq!(count(&source), 0);
    }

    #[test]
    fn test_dropped_status_rolls_back() {
        let (_dir, source) = setup();
        let manager = DataSourceTransactionManager::new(Arc::clone(&source));
        {
            let status = manager.begin().unwrap();
            insert(&status);
        }
        assert!(bound_connection(source.id()).is_none());
        assert_eq!(count(&source), 0);
    }
}
