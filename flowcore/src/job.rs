use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::CommandContext;
use crate::error::Result;
use crate::ids::{BatchId, ExecutionId, JobId, ProcessInstanceId};

/// Durable record of deferred work.
///
/// A job is acquirable when it is due, not held by a live lock, has retries
/// left and is not suspended. Zero retries marks a terminal failure that an
/// incident reports until an operator resets the retries.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Handler key.
    pub job_type: String,
    /// Opaque handler input.
    pub configuration: Value,
    pub due_date: DateTime<Utc>,
    pub retries: u32,
    /// Failures recorded so far, drives the retry backoff.
    pub attempts: u32,
    pub exception_message: Option<String>,
    pub exception_stacktrace: Option<String>,
    pub lock_owner: Option<String>,
    pub lock_expiration: Option<DateTime<Utc>>,
    pub exclusive: bool,
    /// Higher runs first among jobs with the same due date.
    pub priority: i64,
    pub suspended: bool,
    pub process_instance_id: Option<ProcessInstanceId>,
    pub execution_id: Option<ExecutionId>,
    pub batch_id: Option<BatchId>,
    pub created_at: DateTime<Utc>,
    pub revision: u32,
}

impl Job {
    pub fn new(
        job_type: impl Into<String>,
        configuration: Value,
        due_date: DateTime<Utc>,
        retries: u32,
    ) -> Self {
        Self {
            id: JobId::new(),
            job_type: job_type.into(),
            configuration,
            due_date,
            retries,
            attempts: 0,
            exception_message: None,
            exception_stacktrace: None,
            lock_owner: None,
            lock_expiration: None,
            exclusive: false,
            priority: 0,
            suspended: false,
            process_instance_id: None,
            execution_id: None,
            batch_id: None,
            created_at: due_date,
            revision: 0,
        }
    }

    pub fn with_exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn for_execution(
        mut self,
        process_instance_id: ProcessInstanceId,
        execution_id: ExecutionId,
    ) -> Self {
        self.process_instance_id = Some(process_instance_id);
        self.execution_id = Some(execution_id);
        self
    }

    pub fn for_batch(mut self, batch_id: BatchId) -> Self {
        self.batch_id = Some(batch_id);
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Held by an owner whose lock has not expired.
    pub fn is_locked_at(&self, now: DateTime<Utc>) -> bool {
        self.lock_owner.is_some() && self.lock_expiration.is_some_and(|until| until > now)
    }

    pub fn is_acquirable_at(&self, now: DateTime<Utc>) -> bool {
        self.due_date <= now && !self.is_locked_at(now) && self.retries > 0 && !self.suspended
    }

    pub fn is_failed(&self) -> bool {
        self.retries == 0
    }

    pub fn is_owned_by(&self, owner: &str) -> bool {
        self.lock_owner.as_deref() == Some(owner)
    }

    pub fn lock(&mut self, owner: impl Into<String>, until: DateTime<Utc>) {
        self.lock_owner = Some(owner.into());
        self.lock_expiration = Some(until);
    }

    pub fn unlock(&mut self) {
        self.lock_owner = None;
        self.lock_expiration = None;
    }
}

/// Filter over persisted jobs.
#[derive(Clone, Debug, Default)]
pub struct JobQuery {
    pub process_instance_id: Option<ProcessInstanceId>,
    pub execution_id: Option<ExecutionId>,
    pub batch_id: Option<BatchId>,
    pub job_type: Option<String>,
    /// Only jobs whose retries are exhausted.
    pub failed_only: bool,
}

impl JobQuery {
    pub fn by_process_instance(id: ProcessInstanceId) -> Self {
        Self {
            process_instance_id: Some(id),
            ..Default::default()
        }
    }

    pub fn by_batch(id: BatchId) -> Self {
        Self {
            batch_id: Some(id),
            ..Default::default()
        }
    }

    pub fn by_execution(id: ExecutionId) -> Self {
        Self {
            execution_id: Some(id),
            ..Default::default()
        }
    }

    pub fn with_type(mut self, job_type: impl Into<String>) -> Self {
        self.job_type = Some(job_type.into());
        self
    }

    pub fn failed(mut self) -> Self {
        self.failed_only = true;
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.process_instance_id
            .is_none_or(|id| job.process_instance_id == Some(id))
            && self.execution_id.is_none_or(|id| job.execution_id == Some(id))
            && self.batch_id.is_none_or(|id| job.batch_id == Some(id))
            && self
                .job_type
                .as_deref()
                .is_none_or(|job_type| job.job_type == job_type)
            && (!self.failed_only || job.is_failed())
    }
}

/// What happens to a job after its handler returned successfully.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobOutcome {
    /// Delete the job.
    Completed,
    /// Keep the job, release its lock and make it due again at `due_date`.
    Rescheduled { due_date: DateTime<Utc> },
}

/// Executes jobs of one type.
///
/// Handlers run inside the job's transaction. They may be invoked more than
/// once for the same job when a lock expires mid-execution, so their effects
/// outside the store must be idempotent.
#[async_trait]
pub trait JobHandler: Send + Sync {
    fn job_type(&self) -> &str;

    async fn execute(&self, configuration: &Value, ctx: &mut CommandContext)
        -> Result<JobOutcome>;
}

/// Handlers keyed by job type.
#[derive(Clone, Default)]
pub struct JobHandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl JobHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for the same type.
    pub fn register(&mut self, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(handler.job_type().to_string(), handler);
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }
}

impl fmt::Debug for JobHandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<&String> = self.handlers.keys().collect();
        types.sort();
        f.debug_struct("JobHandlerRegistry")
            .field("job_types", &types)
            .finish()
    }
}
