//! Pool and scheduler configuration structures.

use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What a pool does with a task it cannot place.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionPolicy {
    /// Refuse the task with an error.
    #[default]
    Abort,
    /// Run the task on the submitting thread.
    CallerRuns,
    /// Silently drop the task.
    Discard,
    /// Drop the oldest queued task and retry the new one.
    DiscardOldest,
}

impl FromStr for RejectionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "abort" => Ok(Self::Abort),
            "caller_runs" => Ok(Self::CallerRuns),
            "discard" => Ok(Self::Discard),
            "discard_oldest" => Ok(Self::DiscardOldest),
            other => Err(format!("unknown rejection policy `{other}`")),
        }
    }
}

/// Thread pool configuration.
///
/// Core size, max size and keep-alive can change on a live pool; queue
/// capacity and rejection policy are fixed when the pool is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Threads kept alive even when idle.
    pub core_pool_size: usize,
    /// Upper bound on threads.
    pub max_pool_size: usize,
    /// Idle time after which a surplus thread retires, in milliseconds.
    pub keep_alive_ms: u64,
    /// Queue capacity: `None` is unbounded, `Some(0)` is synchronous hand-off.
    pub queue_capacity: Option<usize>,
    /// Let core threads retire after `keep_alive_ms` too.
    pub allow_core_thread_timeout: bool,
    /// Start all core threads when the pool is created.
    pub prestart_all_core_threads: bool,
    /// Worker thread name prefix; defaults to the owning component's name.
    pub thread_name_prefix: Option<String>,
    /// Behaviour when no thread or queue slot is available.
    pub rejection_policy: RejectionPolicy,
    /// Graceful shutdown (finish queued work) instead of draining the queue.
    pub wait_for_tasks_to_complete_on_shutdown: bool,
    /// How long shutdown blocks waiting for termination, in milliseconds.
    pub await_termination_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            core_pool_size: 1,
            max_pool_size: usize::MAX,
            keep_alive_ms: 60_000,
            queue_capacity: None,
            allow_core_thread_timeout: false,
            prestart_all_core_threads: false,
            thread_name_prefix: None,
            rejection_policy: RejectionPolicy::Abort,
            wait_for_tasks_to_complete_on_shutdown: false,
            await_termination_ms: 0,
        }
    }
}

impl PoolConfig {
    /// Create a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fixed-size pool with one thread per available CPU.
    #[must_use]
    pub fn per_cpu() -> Self {
        let cpus = num_cpus::get().max(1);
        Self::default().with_core_pool_size(cpus).with_max_pool_size(cpus)
    }

    /// Set the core pool size.
    #[must_use]
    pub const fn with_core_pool_size(mut self, size: usize) -> Self {
        self.core_pool_size = size;
        self
    }

    /// Set the maximum pool size.
    #[must_use]
    pub const fn with_max_pool_size(mut self, size: usize) -> Self {
        self.max_pool_size = size;
        self
    }

    /// Set the keep-alive duration.
    #[must_use]
    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive_ms = u64::try_from(keep_alive.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set the queue capacity (`None` for unbounded).
    #[must_use]
    pub const fn with_queue_capacity(mut self, capacity: Option<usize>) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Allow core threads to time out.
    #[must_use]
    pub const fn with_allow_core_thread_timeout(mut self, allow: bool) -> Self {
        self.allow_core_thread_timeout = allow;
        self
    }

    /// Start all core threads eagerly.
    #[must_use]
    pub const fn with_prestart_all_core_threads(mut self, prestart: bool) -> Self {
        self.prestart_all_core_threads = prestart;
        self
    }

    /// Set the thread name prefix.
    #[must_use]
    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = Some(prefix.into());
        self
    }

    /// Set the rejection policy.
    #[must_use]
    pub const fn with_rejection_policy(mut self, policy: RejectionPolicy) -> Self {
        self.rejection_policy = policy;
        self
    }

    /// Choose graceful (`true`) or immediate (`false`) shutdown.
    #[must_use]
    pub const fn with_wait_for_tasks_to_complete_on_shutdown(mut self, wait: bool) -> Self {
        self.wait_for_tasks_to_complete_on_shutdown = wait;
        self
    }

    /// Set how long shutdown waits for termination.
    #[must_use]
    pub fn with_await_termination(mut self, timeout: Duration) -> Self {
        self.await_termination_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Keep-alive as a `Duration`.
    #[must_use]
    pub const fn keep_alive(&self) -> Duration {
        Duration::from_millis(self.keep_alive_ms)
    }

    /// Await-termination as a `Duration`.
    #[must_use]
    pub const fn await_termination(&self) -> Duration {
        Duration::from_millis(self.await_termination_ms)
    }

    /// Validate pool configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_pool_size == 0 {
            return Err("max_pool_size must be greater than 0".into());
        }
        if self.core_pool_size > self.max_pool_size {
            return Err(format!(
                "core_pool_size ({}) must not exceed max_pool_size ({})",
                self.core_pool_size, self.max_pool_size
            ));
        }
        if self.allow_core_thread_timeout && self.keep_alive_ms == 0 {
            return Err("keep_alive_ms must be greater than 0 when core threads may time out".into());
        }
        Ok(())
    }

    /// Parse pool configuration from a JSON string and validate.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load configuration from `{PREFIX}_*` environment variables.
    ///
    /// A `.env` file in the working directory is loaded first if present.
    /// Unset variables keep their default values.
    pub fn from_env(prefix: &str) -> Result<Self, String> {
        let _ = dotenvy::dotenv();
        let mut cfg = Self::default();
        if let Some(v) = env_var(prefix, "CORE_POOL_SIZE")? {
            cfg.core_pool_size = v;
        }
        if let Some(v) = env_var(prefix, "MAX_POOL_SIZE")? {
            cfg.max_pool_size = v;
        }
        if let Some(v) = env_var(prefix, "KEEP_ALIVE_MS")? {
            cfg.keep_alive_ms = v;
        }
        if let Some(v) = env_var(prefix, "QUEUE_CAPACITY")? {
            cfg.queue_capacity = Some(v);
        }
        if let Some(v) = env_var(prefix, "ALLOW_CORE_THREAD_TIMEOUT")? {
            cfg.allow_core_thread_timeout = v;
        }
        if let Some(v) = env_var(prefix, "PRESTART_ALL_CORE_THREADS")? {
            cfg.prestart_all_core_threads = v;
        }
        if let Some(v) = env_var::<String>(prefix, "THREAD_NAME_PREFIX")? {
            cfg.thread_name_prefix = Some(v);
        }
        if let Some(v) = env_var(prefix, "REJECTION_POLICY")? {
            cfg.rejection_policy = v;
        }
        if let Some(v) = env_var(prefix, "WAIT_FOR_TASKS_TO_COMPLETE_ON_SHUTDOWN")? {
            cfg.wait_for_tasks_to_complete_on_shutdown = v;
        }
        if let Some(v) = env_var(prefix, "AWAIT_TERMINATION_MS")? {
            cfg.await_termination_ms = v;
        }
        cfg.validate()?;
        Ok(cfg)
    }
}

/// Scheduled pool configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerPoolConfig {
    /// Number of worker threads executing due tasks.
    pub pool_size: usize,
    /// Worker thread name prefix; defaults to the owning component's name.
    pub thread_name_prefix: Option<String>,
    /// Remove cancelled tasks from the delay queue immediately.
    pub remove_on_cancel: bool,
    /// Keep running periodic tasks after shutdown.
    pub continue_existing_periodic_tasks_after_shutdown: bool,
    /// Still run delayed one-shot tasks that are queued at shutdown.
    pub execute_existing_delayed_tasks_after_shutdown: bool,
    /// Graceful shutdown (let the timer drain) instead of dropping queued work.
    pub wait_for_tasks_to_complete_on_shutdown: bool,
    /// How long shutdown blocks waiting for termination, in milliseconds.
    pub await_termination_ms: u64,
}

impl Default for SchedulerPoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 1,
            thread_name_prefix: None,
            remove_on_cancel: false,
            continue_existing_periodic_tasks_after_shutdown: false,
            execute_existing_delayed_tasks_after_shutdown: true,
            wait_for_tasks_to_complete_on_shutdown: false,
            await_termination_ms: 0,
        }
    }
}

impl SchedulerPoolConfig {
    /// Create a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the worker count.
    #[must_use]
    pub const fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    /// Set the thread name prefix.
    #[must_use]
    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = Some(prefix.into());
        self
    }

    /// Remove cancelled tasks from the delay queue immediately.
    #[must_use]
    pub const fn with_remove_on_cancel(mut self, remove: bool) -> Self {
        self.remove_on_cancel = remove;
        self
    }

    /// Choose graceful (`true`) or immediate (`false`) shutdown.
    #[must_use]
    pub const fn with_wait_for_tasks_to_complete_on_shutdown(mut self, wait: bool) -> Self {
        self.wait_for_tasks_to_complete_on_shutdown = wait;
        self
    }

    /// Set how long shutdown waits for termination.
    #[must_use]
    pub fn with_await_termination(mut self, timeout: Duration) -> Self {
        self.await_termination_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Await-termination as a `Duration`.
    #[must_use]
    pub const fn await_termination(&self) -> Duration {
        Duration::from_millis(self.await_termination_ms)
    }

    /// Validate scheduler pool values.
    pub fn validate(&self) -> Result<(), String> {
        if self.pool_size == 0 {
            return Err("pool_size must be greater than 0".into());
        }
        Ok(())
    }
}

/// Root configuration: named executors and schedulers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorsConfig {
    /// Map of executor name to pool configuration.
    pub executors: HashMap<String, PoolConfig>,
    /// Map of scheduler name to scheduled pool configuration.
    pub schedulers: HashMap<String, SchedulerPoolConfig>,
}

impl ExecutorsConfig {
    /// Validate all entries and ensure at least one exists.
    pub fn validate(&self) -> Result<(), String> {
        if self.executors.is_empty() && self.schedulers.is_empty() {
            return Err("at least one executor or scheduler must be defined".into());
        }
        for (name, pool) in &self.executors {
            pool.validate()
                .map_err(|e| format!("executor `{name}` invalid: {e}"))?;
        }
        for (name, pool) in &self.schedulers {
            pool.validate()
                .map_err(|e| format!("scheduler `{name}` invalid: {e}"))?;
        }
        Ok(())
    }

    /// Parse configuration from a JSON string and validate.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }
}

fn env_var<T>(prefix: &str, key: &str) -> Result<Option<T>, String>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let name = format!("{prefix}_{key}");
    match env::var(&name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| format!("{name}: {e}")),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(PoolConfig::default().validate().is_ok());
        assert!(SchedulerPoolConfig::default().validate().is_ok());
    }

    #[test]
    fn test_core_above_max_is_rejected() {
        let cfg = PoolConfig::new().with_core_pool_size(4).with_max_pool_size(2);
        assert!(cfg.validate().unwrap_err().contains("must not exceed"));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let cfg = PoolConfig::from_json_str(r#"{"core_pool_size": 2, "max_pool_size": 4}"#).unwrap();
        assert_eq!(cfg.core_pool_size, 2);
        assert_eq!(cfg.keep_alive_ms, 60_000);
        assert_eq!(cfg.rejection_policy, RejectionPolicy::Abort);
    }

    #[test]
    fn test_rejection_policy_from_str() {
        assert_eq!("caller_runs".parse::<RejectionPolicy>().unwrap(), RejectionPolicy::CallerRuns);
        assert!("block".parse::<RejectionPolicy>().is_err());
    }

    #[test]
    fn test_from_env() {
        env::set_var("PSCHED_CFG_TEST_CORE_POOL_SIZE", "3");
        env::set_var("PSCHED_CFG_TEST_MAX_POOL_SIZE", "6");
        env::set_var("PSCHED_CFG_TEST_QUEUE_CAPACITY", "10");
        env::set_var("PSCHED_CFG_TEST_REJECTION_POLICY", "discard_oldest");
        let cfg = PoolConfig::from_env("PSCHED_CFG_TEST").unwrap();
        assert_eq!(cfg.core_pool_size, 3);
        assert_eq!(cfg.max_pool_size, 6);
        assert_eq!(cfg.queue_capacity, Some(10));
        assert_eq!(cfg.rejection_policy, RejectionPolicy::DiscardOldest);
    }

    #[test]
    fn test_from_env_reports_bad_value() {
        env::set_var("PSCHED_BAD_TEST_CORE_POOL_SIZE", "many");
        let err = PoolConfig::from_env("PSCHED_BAD_TEST").unwrap_err();
        assert!(err.contains("PSCHED_BAD_TEST_CORE_POOL_SIZE"));
    }
}
