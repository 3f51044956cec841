//! Pool lifecycle: one-time creation, thread naming, and bounded shutdown.
//!
//! Every executor and scheduler owns a [`PoolLifecycle`]. The lifecycle moves
//! `NotStarted -> Running -> Terminated` exactly once; a second shutdown is a
//! no-op. Shutdown waits at most the configured duration and only logs a
//! warning when the pool has not terminated by then.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::error::SchedulerError;
use super::task::Runnable;
use super::worker_pool::{PoolError, ScheduledWorkerPool, WorkerPool};

/// A backend pool whose lifecycle can be managed.
pub trait ManagedPool: Send + Sync + 'static {
    /// Stop accepting work; queued work still runs.
    fn shutdown(&self);

    /// Stop accepting work and drain the queue; returns the tasks never started.
    fn shutdown_now(&self) -> Vec<Runnable>;

    /// Wait up to `timeout` for termination; `true` if terminated.
    fn await_termination(&self, timeout: Duration) -> bool;
}

impl ManagedPool for WorkerPool {
    fn shutdown(&self) {
        Self::shutdown(self);
    }

    fn shutdown_now(&self) -> Vec<Runnable> {
        Self::shutdown_now(self)
    }

    fn await_termination(&self, timeout: Duration) -> bool {
        Self::await_termination(self, timeout)
    }
}

impl ManagedPool for ScheduledWorkerPool {
    fn shutdown(&self) {
        Self::shutdown(self);
    }

    fn shutdown_now(&self) -> Vec<Runnable> {
        Self::shutdown_now(self)
    }

    fn await_termination(&self, timeout: Duration) -> bool {
        Self::await_termination(self, timeout)
    }
}

/// Observable lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// `initialize` has not been called.
    NotStarted,
    /// The pool is live.
    Running,
    /// The pool has been shut down.
    Terminated,
}

enum Slot<P> {
    NotStarted,
    Running(Arc<P>),
    Terminated,
}

/// Shutdown behaviour applied by [`PoolLifecycle::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownPolicy {
    /// Let queued work finish (`true`) or drain it (`false`).
    pub wait_for_tasks_to_complete: bool,
    /// Upper bound on how long shutdown blocks.
    pub await_termination: Duration,
}

impl Default for ShutdownPolicy {
    fn default() -> Self {
        Self {
            wait_for_tasks_to_complete: false,
            await_termination: Duration::ZERO,
        }
    }
}

/// Owns one backend pool from creation to teardown.
pub struct PoolLifecycle<P: ManagedPool> {
    name: String,
    slot: Mutex<Slot<P>>,
    policy: Mutex<ShutdownPolicy>,
}

impl<P: ManagedPool> fmt::Debug for PoolLifecycle<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolLifecycle")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

impl<P: ManagedPool> PoolLifecycle<P> {
    /// Create a lifecycle for the component called `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            slot: Mutex::new(Slot::NotStarted),
            policy: Mutex::new(ShutdownPolicy::default()),
        }
    }

    /// Owning component's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Thread name prefix: the configured one, or `"{name}-"`.
    #[must_use]
    pub fn thread_name_prefix(&self, configured: Option<&str>) -> String {
        configured.map_or_else(|| format!("{}-", self.name), str::to_owned)
    }

    /// Replace the shutdown policy used by [`Self::shutdown`].
    pub fn set_shutdown_policy(&self, policy: ShutdownPolicy) {
        *self.policy.lock() = policy;
    }

    /// Current shutdown policy.
    #[must_use]
    pub fn shutdown_policy(&self) -> ShutdownPolicy {
        *self.policy.lock()
    }

    /// Build the pool with `factory`, exactly once.
    ///
    /// # Errors
    ///
    /// - `SchedulerError::AlreadyInitialized` if already running or terminated
    /// - `SchedulerError::InvalidConfig` if the factory rejects its configuration
    /// - `SchedulerError::InvalidArgument` for any other factory failure
    pub fn initialize<F>(&self, factory: F) -> Result<Arc<P>, SchedulerError>
    where
        F: FnOnce() -> Result<P, PoolError>,
    {
        let mut slot = self.slot.lock();
        if !matches!(*slot, Slot::NotStarted) {
            return Err(SchedulerError::AlreadyInitialized(self.name.clone()));
        }
        let pool = Arc::new(factory().map_err(|err| match err {
            PoolError::InvalidConfig(msg) => SchedulerError::InvalidConfig(format!("{}: {msg}", self.name)),
            other => SchedulerError::InvalidArgument(format!("{}: {other}", self.name)),
        })?);
        *slot = Slot::Running(Arc::clone(&pool));
        info!(component = %self.name, "Initialized pool");
        Ok(pool)
    }

    /// The live pool.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::NotInitialized` before `initialize` or after shutdown.
    pub fn pool(&self) -> Result<Arc<P>, SchedulerError> {
        self.try_pool()
            .ok_or_else(|| SchedulerError::NotInitialized(self.name.clone()))
    }

    /// The live pool, if running.
    #[must_use]
    pub fn try_pool(&self) -> Option<Arc<P>> {
        match &*self.slot.lock() {
            Slot::Running(pool) => Some(Arc::clone(pool)),
            Slot::NotStarted | Slot::Terminated => None,
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        match &*self.slot.lock() {
            Slot::NotStarted => LifecycleState::NotStarted,
            Slot::Running(_) => LifecycleState::Running,
            Slot::Terminated => LifecycleState::Terminated,
        }
    }

    /// Shut down using the stored [`ShutdownPolicy`].
    pub fn shutdown(&self) -> bool {
        let policy = self.shutdown_policy();
        self.shutdown_with(policy.wait_for_tasks_to_complete, policy.await_termination)
    }

    /// Shut down the pool and block for at most `await_termination`.
    ///
    /// With `wait_for_tasks` queued work finishes; otherwise the queue is
    /// drained and the drained tasks are dropped (cancelling their futures).
    /// Returns `true` if the pool terminated within the wait. A timeout is
    /// logged, not raised. Only the first call does anything.
    pub fn shutdown_with(&self, wait_for_tasks: bool, await_termination: Duration) -> bool {
        let pool = {
            let mut slot = self.slot.lock();
            if !matches!(*slot, Slot::Running(_)) {
                debug!(component = %self.name, "Shutdown requested but pool is not running");
                return true;
            }
            match std::mem::replace(&mut *slot, Slot::Terminated) {
                Slot::Running(pool) => pool,
                Slot::NotStarted | Slot::Terminated => return true,
            }
        };

        info!(component = %self.name, wait_for_tasks, "Shutting down pool");
        if wait_for_tasks {
            pool.shutdown();
        } else {
            let drained = pool.shutdown_now();
            if !drained.is_empty() {
                debug!(component = %self.name, drained = drained.len(), "Dropped queued tasks on immediate shutdown");
            }
        }

        if await_termination.is_zero() {
            return pool.await_termination(Duration::ZERO);
        }
        let terminated = pool.await_termination(await_termination);
        if !terminated {
            warn!(
                component = %self.name,
                await_termination_ms = u64::try_from(await_termination.as_millis()).unwrap_or(u64::MAX),
                "Timed out while waiting for pool to terminate"
            );
        }
        terminated
    }
}
