//! Builders to construct named executors and schedulers from configuration.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::ExecutorsConfig;
use crate::core::{SchedulerError, ThreadPoolTaskExecutor};
use crate::scheduling::ThreadPoolTaskScheduler;

/// Initialise one thread-pool executor per configured entry.
///
/// Each executor's name is its default thread-name prefix. If any entry
/// fails to initialise, the ones already started are shut down.
///
/// # Errors
///
/// `SchedulerError::InvalidConfig` for an invalid entry, or the first
/// initialisation failure.
pub fn build_executors(
    cfg: &ExecutorsConfig,
) -> Result<HashMap<String, Arc<ThreadPoolTaskExecutor>>, SchedulerError> {
    let mut executors: HashMap<String, Arc<ThreadPoolTaskExecutor>> = HashMap::new();
    for (name, pool_cfg) in &cfg.executors {
        pool_cfg
            .validate()
            .map_err(|e| SchedulerError::InvalidConfig(format!("executor `{name}`: {e}")))?;
        let executor = Arc::new(ThreadPoolTaskExecutor::new(name.clone(), pool_cfg.clone()));
        if let Err(err) = executor.initialize() {
            for built in executors.values() {
                built.shutdown();
            }
            return Err(err);
        }
        executors.insert(name.clone(), executor);
    }
    Ok(executors)
}

/// Initialise one thread-pool scheduler per configured entry.
///
/// # Errors
///
/// `SchedulerError::InvalidConfig` for an invalid entry, or the first
/// initialisation failure.
pub fn build_schedulers(
    cfg: &ExecutorsConfig,
) -> Result<HashMap<String, Arc<ThreadPoolTaskScheduler>>, SchedulerError> {
    let mut schedulers: HashMap<String, Arc<ThreadPoolTaskScheduler>> = HashMap::new();
    for (name, pool_cfg) in &cfg.schedulers {
        pool_cfg
            .validate()
            .map_err(|e| SchedulerError::InvalidConfig(format!("scheduler `{name}`: {e}")))?;
        let scheduler = Arc::new(ThreadPoolTaskScheduler::new(name.clone(), pool_cfg.clone()));
        if let Err(err) = scheduler.initialize() {
            for built in schedulers.values() {
                built.shutdown();
            }
            return Err(err);
        }
        schedulers.insert(name.clone(), scheduler);
    }
    Ok(schedulers)
}

/// Named components built from one [`ExecutorsConfig`].
#[derive(Debug, Default)]
pub struct BuiltPools {
    /// Executors by name.
    pub executors: HashMap<String, Arc<ThreadPoolTaskExecutor>>,
    /// Schedulers by name.
    pub schedulers: HashMap<String, Arc<ThreadPoolTaskScheduler>>,
}

impl BuiltPools {
    /// Executor called `name`.
    #[must_use]
    pub fn executor(&self, name: &str) -> Option<Arc<ThreadPoolTaskExecutor>> {
        self.executors.get(name).cloned()
    }

    /// Scheduler called `name`.
    #[must_use]
    pub fn scheduler(&self, name: &str) -> Option<Arc<ThreadPoolTaskScheduler>> {
        self.schedulers.get(name).cloned()
    }

    /// Shut everything down; `false` if any component missed its termination deadline.
    pub fn shutdown_all(&self) -> bool {
        let mut clean = true;
        for (name, scheduler) in &self.schedulers {
            if !scheduler.shutdown() {
                warn!(scheduler = %name, "Scheduler did not terminate in time");
                clean = false;
            }
        }
        for (name, executor) in &self.executors {
            if !executor.shutdown() {
                warn!(executor = %name, "Executor did not terminate in time");
                clean = false;
            }
        }
        clean
    }
}

/// Builds every executor and scheduler of a configuration.
#[derive(Debug, Clone)]
pub struct PoolBuilder {
    config: ExecutorsConfig,
}

impl PoolBuilder {
    /// Builder over `config`.
    #[must_use]
    pub const fn new(config: ExecutorsConfig) -> Self {
        Self { config }
    }

    /// Builder over a JSON document.
    ///
    /// # Errors
    ///
    /// `SchedulerError::InvalidConfig` if parsing or validation fails.
    pub fn from_json_str(input: &str) -> Result<Self, SchedulerError> {
        ExecutorsConfig::from_json_str(input)
            .map(Self::new)
            .map_err(SchedulerError::InvalidConfig)
    }

    /// The configuration being built.
    #[must_use]
    pub const fn config(&self) -> &ExecutorsConfig {
        &self.config
    }

    /// Validate and initialise everything.
    ///
    /// # Errors
    ///
    /// `SchedulerError::InvalidConfig` if the configuration is invalid, or
    /// the first initialisation failure; nothing is left running on error.
    pub fn build(&self) -> Result<BuiltPools, SchedulerError> {
        self.config.validate().map_err(SchedulerError::InvalidConfig)?;
        let executors = build_executors(&self.config)?;
        let schedulers = match build_schedulers(&self.config) {
            Ok(schedulers) => schedulers,
            Err(err) => {
                for executor in executors.values() {
                    executor.shutdown();
                }
                return Err(err);
            }
        };
        info!(
            executors = executors.len(),
            schedulers = schedulers.len(),
            "Built pools from configuration"
        );
        Ok(BuiltPools { executors, schedulers })
    }
}
