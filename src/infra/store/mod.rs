//! Job store adapters.

pub mod memory;
pub mod sqlite;

pub use memory::RamJobStore;
pub use sqlite::{LockStrategy, SqliteJobStore, DEFAULT_TABLE_PREFIX};
