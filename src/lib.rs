//! # Prometheus Scheduling
//!
//! Trigger-driven task scheduling, managed thread pools and persistent job
//! registration for the Prometheus AI Platform.
//!
//! The crate is layered:
//!
//! - **Executors**: [`core::ThreadPoolTaskExecutor`] owns a core/max thread
//!   pool behind a lifecycle (configure, initialise, use, shut down). Any
//!   capacity problem surfaces as the single
//!   [`core::SchedulerError::TaskRejected`] error.
//! - **Schedulers**: [`scheduling::TaskScheduler`] runs work once, at fixed
//!   rate, with fixed delay, or driven by a [`scheduling::Trigger`] such as
//!   [`scheduling::CronTrigger`]. Backends without trigger support run
//!   triggers as self-rescheduling chains.
//! - **Persistent jobs**: [`jobs::PersistentScheduler`] fires triggers kept in
//!   a [`jobs::JobStore`] (in memory or SQLite). [`jobs::JobRegistrar`]
//!   registers declared jobs idempotently at every process start, optionally
//!   inside one transaction of the surrounding application.
//!
//! ## Scheduling work
//!
//! ```rust,ignore
//! use prometheus_scheduling::config::SchedulerPoolConfig;
//! use prometheus_scheduling::core::Runnable;
//! use prometheus_scheduling::scheduling::{CronTrigger, TaskScheduler, ThreadPoolTaskScheduler};
//! use std::sync::Arc;
//!
//! let scheduler = ThreadPoolTaskScheduler::new("reports", SchedulerPoolConfig::new().with_pool_size(2));
//! scheduler.initialize()?;
//!
//! let nightly = Arc::new(CronTrigger::with_zone("0 0 2 * * *", "Europe/Paris")?);
//! if let Some(handle) = scheduler.schedule(Runnable::new(|| build_report()), nightly)? {
//!     // ...
//!     handle.cancel();
//! }
//! scheduler.shutdown();
//! ```
//!
//! ## Registering persistent jobs
//!
//! ```rust,ignore
//! use prometheus_scheduling::infra::{DataSourceTransactionManager, SqliteDataSource};
//! use prometheus_scheduling::jobs::{JobDefinition, JobRegistrar, TriggerDefinition};
//!
//! let report = JobRegistrar::new(engine)
//!     .with_transaction_manager(Arc::new(DataSourceTransactionManager::new(source)))
//!     .job(JobDefinition::builder("report").build("nightlyReport"))
//!     .trigger(nightly_trigger)
//!     .register_jobs_and_triggers()?;
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Units of work, futures, backend pools, executors and their errors.
pub mod core;
/// Configuration models for executors and schedulers.
pub mod config;
/// Builders to construct executors and schedulers from configuration.
pub mod builders;
/// Job stores and the transactional connection bridge.
pub mod infra;
/// Trigger-driven scheduling facades.
pub mod scheduling;
/// Persistent jobs, triggers, the scheduler engine and registration.
pub mod jobs;
/// Shared utilities.
pub mod util;
