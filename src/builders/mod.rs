//! Builders to construct executors and schedulers from configuration.

pub mod pool_builder;

pub use pool_builder::{build_executors, build_schedulers, BuiltPools, PoolBuilder};
