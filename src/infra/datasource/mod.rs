//! Data sources and the transactional connection bridge.
//!
//! A [`DataSource`] opens connections. The [`DataSourceTransactionManager`]
//! binds one connection per data source to the current thread for the length
//! of a unit of work, and the connection providers hand that connection (or a
//! fresh one) to a job store.

pub mod provider;
pub mod transaction;

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::Connection;
use thiserror::Error;
use tracing::debug;

pub use provider::{
    ConnectionBridge, ConnectionProvider, NonTransactionalConnectionProvider, ProvidedConnection,
    TransactionalConnectionProvider,
};
pub use transaction::{DataSourceTransactionManager, TransactionError, TransactionManager, TransactionStatus};

/// A connection shared between a transaction and the code running inside it.
pub type SharedConnection = Arc<Mutex<Connection>>;

/// Connection failures.
#[derive(Debug, Error)]
pub enum DataSourceError {
    /// SQLite reported an error.
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// The data source cannot hand out connections.
    #[error("data source `{0}` is unavailable")]
    Unavailable(String),
}

/// Opens connections to one database.
pub trait DataSource: Send + Sync {
    /// Identity used to bind transactional connections.
    fn id(&self) -> &str;

    /// Open a new connection.
    ///
    /// # Errors
    ///
    /// Returns [`DataSourceError`] if the database cannot be opened.
    fn connect(&self) -> Result<Connection, DataSourceError>;
}

/// File-backed SQLite data source.
#[derive(Debug, Clone)]
pub struct SqliteDataSource {
    id: String,
    path: PathBuf,
    busy_timeout: Duration,
}

impl SqliteDataSource {
    /// Data source for the database file at `path`, identified by its path.
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        Self {
            id: path.display().to_string(),
            path,
            busy_timeout: Duration::from_secs(5),
        }
    }

    /// Override the identity.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// How long a connection waits on a locked database.
    #[must_use]
    pub const fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    /// Database file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DataSource for SqliteDataSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn connect(&self) -> Result<Connection, DataSourceError> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(self.busy_timeout)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        debug!(data_source = %self.id, "Opened connection");
        Ok(conn)
    }
}

impl fmt::Display for SqliteDataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sqlite:{}", self.path.display())
    }
}

/// A connection bound to a unit of work, with its rollback-only mark.
#[derive(Clone)]
pub(crate) struct Binding {
    pub(crate) conn: SharedConnection,
    pub(crate) rollback_only: Arc<AtomicBool>,
}

thread_local! {
    static BOUND: RefCell<HashMap<String, Binding>> = RefCell::new(HashMap::new());
}

/// Connection bound to the current thread's unit of work for `data_source`.
#[must_use]
pub fn bound_connection(data_source: &str) -> Option<SharedConnection> {
    binding(data_source).map(|binding| binding.conn)
}

pub(crate) fn binding(data_source: &str) -> Option<Binding> {
    BOUND.with(|bound| bound.borrow().get(data_source).cloned())
}

pub(crate) fn bind(data_source: &str, binding: Binding) {
    BOUND.with(|bound| {
        bound.borrow_mut().insert(data_source.to_owned(), binding);
    });
}

pub(crate) fn unbind(data_source: &str) -> Option<Binding> {
    BOUND.with(|bound| bound.borrow_mut().remove(data_source))
}
