//! Job implementations, their registry, and typed job data.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde_json::Value;
use uuid::Uuid;

use crate::core::error::AppResult;

use super::error::EngineError;
use super::model::{JobDataMap, JobDefinition, TriggerKey};
use super::store::TriggerFiredBundle;

/// Code run when a trigger fires its job.
pub trait Job: Send + Sync {
    /// Run once for `context`.
    ///
    /// # Errors
    ///
    /// Any error is logged and reported to job listeners.
    fn execute(&self, context: &JobExecutionContext) -> AppResult<()>;
}

impl<F> Job for F
where
    F: Fn(&JobExecutionContext) -> AppResult<()> + Send + Sync,
{
    fn execute(&self, context: &JobExecutionContext) -> AppResult<()> {
        self(context)
    }
}

/// Maps the `job_type` of stored definitions to implementations.
#[derive(Default)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<String, Arc<dyn Job>>>,
}

impl fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRegistry").field("job_types", &self.job_types()).finish()
    }
}

impl JobRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `job` under `job_type`, returning the one it replaced.
    pub fn register(&self, job_type: impl Into<String>, job: Arc<dyn Job>) -> Option<Arc<dyn Job>> {
        self.jobs.write().insert(job_type.into(), job)
    }

    /// Register a closure under `job_type`.
    pub fn register_fn<F>(&self, job_type: impl Into<String>, job: F) -> Option<Arc<dyn Job>>
    where
        F: Fn(&JobExecutionContext) -> AppResult<()> + Send + Sync + 'static,
    {
        self.register(job_type, Arc::new(job))
    }

    /// Implementation for `job_type`.
    #[must_use]
    pub fn get(&self, job_type: &str) -> Option<Arc<dyn Job>> {
        self.jobs.read().get(job_type).cloned()
    }

    /// Registered job types, sorted.
    #[must_use]
    pub fn job_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.jobs.read().keys().cloned().collect();
        types.sort();
        types
    }
}

/// Everything a job run can see about itself.
#[derive(Debug, Clone)]
pub struct JobExecutionContext {
    /// Unique id of this run.
    pub fire_instance_id: String,
    /// The job being run.
    pub job: JobDefinition,
    /// The trigger that fired.
    pub trigger_key: TriggerKey,
    /// Job data overlaid with trigger data.
    pub merged_data: JobDataMap,
    /// When the fire was planned.
    pub scheduled_fire_time: DateTime<Utc>,
    /// When the fire happened.
    pub fire_time: DateTime<Utc>,
    /// The trigger's fire before this one.
    pub previous_fire_time: Option<DateTime<Utc>>,
    /// The trigger's next planned fire.
    pub next_fire_time: Option<DateTime<Utc>>,
}

impl JobExecutionContext {
    /// Context for the fire described by `bundle`.
    #[must_use]
    pub fn from_bundle(bundle: &TriggerFiredBundle) -> Self {
        let mut merged_data = bundle.job.data.clone();
        merged_data.extend(bundle.trigger.definition.data.clone());
        Self {
            fire_instance_id: Uuid::new_v4().to_string(),
            job: bundle.job.clone(),
            trigger_key: bundle.trigger.key().clone(),
            merged_data,
            scheduled_fire_time: bundle.scheduled_fire_time,
            fire_time: bundle.fire_time,
            previous_fire_time: bundle.previous_fire_time,
            next_fire_time: bundle.trigger.next_fire_time,
        }
    }

    /// One merged data value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.merged_data.get(key)
    }

    /// Decode the merged data into `T` through `binding`.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::DataBinding` if decoding fails.
    pub fn bind<T: DeserializeOwned>(&self, binding: &JobDataBinding) -> Result<T, EngineError> {
        binding.bind(&self.merged_data)
    }
}

/// Decodes job data into a typed parameter struct through an allow-list.
///
/// Keys outside the list are dropped, or rejected in strict mode. Missing
/// keys are left to the target type's `serde` defaults.
#[derive(Debug, Clone, Default)]
pub struct JobDataBinding {
    allowed: BTreeSet<String>,
    strict: bool,
}

impl JobDataBinding {
    /// Binding that accepts `keys`.
    pub fn allowing<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: keys.into_iter().map(Into::into).collect(),
            strict: false,
        }
    }

    /// Reject data with keys outside the allow-list.
    #[must_use]
    pub const fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Decode `data` into `T`.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::DataBinding` for a disallowed key in strict mode
    /// or a value `T` cannot be built from.
    pub fn bind<T: DeserializeOwned>(&self, data: &JobDataMap) -> Result<T, EngineError> {
        let mut accepted = JobDataMap::new();
        for (key, value) in data {
            if self.allowed.contains(key) {
                accepted.insert(key.clone(), value.clone());
            } else if self.strict {
                return Err(EngineError::DataBinding(format!("key `{key}` is not bindable")));
            }
        }
        serde_json::from_value(Value::Object(accepted)).map_err(|err| EngineError::DataBinding(err.to_string()))
    }
}
