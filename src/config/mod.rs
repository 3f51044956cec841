//! Configuration models for executors, schedulers, and shutdown behaviour.

pub mod pool;

pub use pool::{ExecutorsConfig, PoolConfig, RejectionPolicy, SchedulerPoolConfig};
