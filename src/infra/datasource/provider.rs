//! Connection providers handed to job stores.
//!
//! The transactional provider reuses the connection bound to the caller's
//! unit of work, so store writes join the application's transaction. The
//! non-transactional provider always works on its own connection.

use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use rusqlite::Connection;
use tracing::{debug, warn};

use super::{binding, DataSource, DataSourceError, SharedConnection};

/// Name of the provider that joins the caller's transaction.
pub const TRANSACTIONAL: &str = "transactional";
/// Name of the provider that always uses an independent connection.
pub const NON_TRANSACTIONAL: &str = "non-transactional";

/// A connection handed out by a [`ConnectionProvider`].
pub struct ProvidedConnection {
    conn: SharedConnection,
    bound: bool,
}

impl fmt::Debug for ProvidedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvidedConnection").field("bound", &self.bound).finish_non_exhaustive()
    }
}

impl ProvidedConnection {
    fn owned(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            bound: false,
        }
    }

    /// Lock the connection for use.
    pub fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    /// Whether this is the connection of a running unit of work.
    #[must_use]
    pub const fn is_bound(&self) -> bool {
        self.bound
    }

    fn close(self) {
        if self.bound {
            return;
        }
        match Arc::try_unwrap(self.conn) {
            Ok(conn) => {
                if let Err((_, err)) = conn.into_inner().close() {
                    warn!(error = %err, "Closing connection failed");
                }
            }
            Err(_) => debug!("Connection still shared at release; closed on last drop"),
        }
    }
}

/// Supplies connections to a job store.
pub trait ConnectionProvider: Send + Sync {
    /// Get a connection.
    ///
    /// # Errors
    ///
    /// Returns [`DataSourceError`] if no connection can be opened.
    fn acquire(&self) -> Result<ProvidedConnection, DataSourceError>;

    /// Give back a connection obtained from [`Self::acquire`].
    fn release(&self, conn: ProvidedConnection);

    /// Release held resources; a no-op when their lifecycle is owned elsewhere.
    fn shutdown(&self) {}
}

/// Joins the unit of work bound to the calling thread.
///
/// Without a bound unit of work the call runs on its own auto-commit
/// connection, which is closed on release.
pub struct TransactionalConnectionProvider {
    data_source: Arc<dyn DataSource>,
}

impl fmt::Debug for TransactionalConnectionProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionalConnectionProvider")
            .field("data_source", &self.data_source.id())
            .finish()
    }
}

impl TransactionalConnectionProvider {
    /// Provider over `data_source`.
    #[must_use]
    pub fn new(data_source: Arc<dyn DataSource>) -> Self {
        Self { data_source }
    }
}

impl ConnectionProvider for TransactionalConnectionProvider {
    fn acquire(&self) -> Result<ProvidedConnection, DataSourceError> {
        match binding(self.data_source.id()) {
            Some(bound) => Ok(ProvidedConnection {
                conn: bound.conn,
                bound: true,
            }),
            None => Ok(ProvidedConnection::owned(self.data_source.connect()?)),
        }
    }

    fn release(&self, conn: ProvidedConnection) {
        conn.close();
    }
}

/// Always works on an independent connection and closes it on release.
pub struct NonTransactionalConnectionProvider {
    data_source: Arc<dyn DataSource>,
}

impl fmt::Debug for NonTransactionalConnectionProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NonTransactionalConnectionProvider")
            .field("data_source", &self.data_source.id())
            .finish()
    }
}

impl NonTransactionalConnectionProvider {
    /// Provider over `data_source`.
    #[must_use]
    pub fn new(data_source: Arc<dyn DataSource>) -> Self {
        Self { data_source }
    }
}

impl ConnectionProvider for NonTransactionalConnectionProvider {
    fn acquire(&self) -> Result<ProvidedConnection, DataSourceError> {
        Ok(ProvidedConnection::owned(self.data_source.connect()?))
    }

    fn release(&self, conn: ProvidedConnection) {
        conn.close();
    }
}

/// Both named connection sources for one application database.
///
/// The non-transactional source uses its own data source when one is
/// configured and falls back to the transactional one otherwise.
#[derive(Clone)]
pub struct ConnectionBridge {
    transactional: Arc<dyn ConnectionProvider>,
    non_transactional: Arc<dyn ConnectionProvider>,
}

impl fmt::Debug for ConnectionBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionBridge").finish_non_exhaustive()
    }
}

impl ConnectionBridge {
    /// Bridge over `data_source`, optionally with a separate non-transactional source.
    #[must_use]
    pub fn new(data_source: Arc<dyn DataSource>, non_transactional: Option<Arc<dyn DataSource>>) -> Self {
        let fallback = non_transactional.unwrap_or_else(|| Arc::clone(&data_source));
        debug!(
            transactional = %data_source.id(),
            non_transactional = %fallback.id(),
            "Configured connection bridge"
        );
        Self {
            transactional: Arc::new(TransactionalConnectionProvider::new(data_source)),
            non_transactional: Arc::new(NonTransactionalConnectionProvider::new(fallback)),
        }
    }

    /// Provider that joins the caller's transaction.
    #[must_use]
    pub fn transactional(&self) -> Arc<dyn ConnectionProvider> {
        Arc::clone(&self.transactional)
    }

    /// Provider with independent connections.
    #[must_use]
    pub fn non_transactional(&self) -> Arc<dyn ConnectionProvider> {
        Arc::clone(&self.non_transactional)
    }

    /// Provider by name: [`TRANSACTIONAL`] or [`NON_TRANSACTIONAL`].
    #[must_use]
    pub fn provider(&self, name: &str) -> Option<Arc<dyn ConnectionProvider>> {
        match name {
            TRANSACTIONAL => Some(self.transactional()),
            NON_TRANSACTIONAL => Some(self.non_transactional()),
            _ => None,
        }
    }
}
