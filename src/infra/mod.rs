//! Infrastructure adapters: job stores and the transactional connection bridge.

pub mod datasource;
pub mod store;

pub use datasource::{ConnectionBridge, DataSource, DataSourceTransactionManager, SqliteDataSource};
pub use store::{RamJobStore, SqliteJobStore};
