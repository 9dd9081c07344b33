use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use tracing::Instrument;

use crate::auth::Permission;
use crate::command::Command;
use crate::context::CommandContext;
use crate::error::{EngineError, Result};
use crate::events::EngineEvent;
use crate::ids::{IncidentId, JobId};
use crate::incident::{Incident, IncidentQuery, FAILED_JOB_INCIDENT};
use crate::job::{Job, JobOutcome, JobQuery};
use crate::store::{EntityKey, Precondition};
use crate::telemetry::execute_job_span;

use super::incident::{close_incident, open_incident};

const UPDATE_JOB: Permission = Permission::new("job", "update");
const READ_JOB: Permission = Permission::new("job", "read");

fn lock_lost(job_id: JobId, detail: impl Into<String>) -> EngineError {
    EngineError::conflict(EntityKey::Job(job_id).to_string(), detail)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|message| (*message).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

/// Lock a due job for one node.
///
/// A single revision-checked update; losing the race is reported as a
/// conflict and never retried, the next acquisition cycle decides again.
#[derive(Clone, Debug)]
pub struct ClaimJobCommand {
    pub job_id: JobId,
    pub lock_owner: String,
    pub lock_expiration: DateTime<Utc>,
}

#[async_trait]
impl Command for ClaimJobCommand {
    type Output = Job;

    fn name(&self) -> &'static str {
        "claim_job"
    }

    fn retry_on_conflict(&self) -> bool {
        false
    }

    async fn execute(&self, ctx: &mut CommandContext) -> Result<Job> {
        let now = ctx.now();
        let mut job = ctx
            .job(self.job_id)
            .await?
            .ok_or_else(|| lock_lost(self.job_id, "deleted before claim"))?;
        if !job.is_acquirable_at(now) {
            return Err(lock_lost(self.job_id, "no longer acquirable"));
        }

        job.lock(&self.lock_owner, self.lock_expiration);
        if job.exclusive && ctx.config().job_executor.exclusive_jobs_enabled {
            if let Some(process_instance_id) = job.process_instance_id {
                ctx.transaction()
                    .require_precondition(Precondition::NoLiveExclusiveLock {
                        process_instance_id,
                        job_id: job.id,
                        now,
                    });
            }
        }
        ctx.update(job.clone())?;
        Ok(job)
    }
}

/// Run the handler of a claimed job and apply its outcome.
#[derive(Clone, Debug)]
pub struct ExecuteJobCommand {
    pub job_id: JobId,
    /// Expected lock owner; `None` executes regardless of locks.
    pub lock_owner: Option<String>,
}

impl ExecuteJobCommand {
    pub fn claimed_by(job_id: JobId, lock_owner: impl Into<String>) -> Self {
        Self {
            job_id,
            lock_owner: Some(lock_owner.into()),
        }
    }

    /// Execute outside the executor, e.g. from a test or an admin tool.
    pub fn unowned(job_id: JobId) -> Self {
        Self {
            job_id,
            lock_owner: None,
        }
    }
}

#[async_trait]
impl Command for ExecuteJobCommand {
    type Output = JobOutcome;

    fn name(&self) -> &'static str {
        "execute_job"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> Result<JobOutcome> {
        let job = ctx.require_job(self.job_id).await?;
        if let Some(owner) = &self.lock_owner {
            if !job.is_owned_by(owner) {
                return Err(lock_lost(
                    job.id,
                    format!("lock now held by {:?}", job.lock_owner),
                ));
            }
        }

        let handler = ctx.job_handler(&job.job_type).ok_or_else(|| {
            EngineError::handler(anyhow::anyhow!(
                "no handler registered for job type {}",
                job.job_type
            ))
        })?;

        let started = Instant::now();
        let span = execute_job_span(job.id.to_string(), &job.job_type);
        // A panicking handler is a failed attempt like any other error.
        let outcome = match AssertUnwindSafe(handler.execute(&job.configuration, ctx).instrument(span))
            .catch_unwind()
            .await
        {
            Ok(result) => result?,
            Err(panic) => {
                return Err(EngineError::handler(anyhow::anyhow!(
                    "job handler panicked: {}",
                    panic_message(panic.as_ref())
                )));
            }
        };

        // The handler may have touched its own job, e.g. a batch job
        // cancelling its process instance.
        let Some(mut job) = ctx.job(self.job_id).await? else {
            return Ok(JobOutcome::Completed);
        };
        match &outcome {
            JobOutcome::Completed => {
                ctx.delete::<Job>(job.id)?;
                ctx.publish(EngineEvent::JobCompleted {
                    job_id: job.id,
                    job_type: job.job_type.clone(),
                });
            }
            JobOutcome::Rescheduled { due_date } => {
                job.unlock();
                job.due_date = *due_date;
                ctx.publish(EngineEvent::JobRescheduled {
                    job_id: job.id,
                    due_date: *due_date,
                });
                ctx.update(job.clone())?;
                ctx.transaction().mark_job_added();
            }
        }

        let metrics = ctx.services().metrics.clone();
        let job_type = job.job_type.clone();
        ctx.transaction().on_commit(move || {
            metrics.record_job_executed(&job_type, started.elapsed().as_secs_f64());
        });
        Ok(outcome)
    }
}

/// Record a handler failure in a fresh transaction.
///
/// Decrements retries, stores the failure details, applies the retry backoff
/// and releases the lock. At zero retries the job stays as a terminal failure
/// reported by exactly one `failedJob` incident.
#[derive(Clone, Debug)]
pub struct HandleJobFailureCommand {
    pub job_id: JobId,
    pub lock_owner: Option<String>,
    pub message: String,
    pub stacktrace: Option<String>,
}

impl HandleJobFailureCommand {
    pub fn from_error(job_id: JobId, lock_owner: Option<String>, error: &EngineError) -> Self {
        let (message, stacktrace) = error.failure_details();
        Self {
            job_id,
            lock_owner,
            message,
            stacktrace,
        }
    }
}

/// Result of recording a job failure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobFailure {
    pub retries_left: u32,
    pub incident_id: Option<IncidentId>,
}

#[async_trait]
impl Command for HandleJobFailureCommand {
    /// `None` when the job is gone or was taken over by another owner.
    type Output = Option<JobFailure>;

    fn name(&self) -> &'static str {
        "handle_job_failure"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> Result<Option<JobFailure>> {
        let Some(mut job) = ctx.job(self.job_id).await? else {
            return Ok(None);
        };
        if let Some(owner) = &self.lock_owner {
            if job.lock_owner.as_deref().is_some_and(|current| current != owner) {
                tracing::debug!(job_id = %job.id, "failure ignored, job owned by another node");
                return Ok(None);
            }
        }

        let now = ctx.now();
        let had_retries = job.retries > 0;
        job.retries = job.retries.saturating_sub(1);
        job.attempts += 1;
        job.exception_message = Some(self.message.clone());
        job.exception_stacktrace = self.stacktrace.clone();
        job.unlock();
        // A delay past the representable range parks the job for good.
        job.due_date = now
            .checked_add_signed(ctx.retry_backoff().delay(job.attempts))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        ctx.update(job.clone())?;

        ctx.publish(EngineEvent::JobFailed {
            job_id: job.id,
            retries_left: job.retries,
            message: self.message.clone(),
        });
        let metrics = ctx.services().metrics.clone();
        let (job_id, job_type, retries_left) = (job.id, job.job_type.clone(), job.retries);
        ctx.transaction().on_commit(move || {
            metrics.record_job_failed(job_id.to_string(), &job_type, retries_left);
        });

        let mut incident_id = None;
        // A job already out of retries keeps its one open incident.
        if job.is_failed() && had_retries {
            incident_id = Some(open_failed_job_incident(ctx, &job, &self.message).await?);
        } else if !job.is_failed() {
            ctx.transaction().mark_job_added();
        }

        Ok(Some(JobFailure {
            retries_left: job.retries,
            incident_id,
        }))
    }
}

/// Release a lock without consuming a retry.
#[derive(Clone, Debug)]
pub struct UnlockJobCommand {
    pub job_id: JobId,
    pub lock_owner: String,
}

#[async_trait]
impl Command for UnlockJobCommand {
    /// Whether a lock held by `lock_owner` was released.
    type Output = bool;

    fn name(&self) -> &'static str {
        "unlock_job"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> Result<bool> {
        let Some(mut job) = ctx.job(self.job_id).await? else {
            return Ok(false);
        };
        if !job.is_owned_by(&self.lock_owner) {
            return Ok(false);
        }
        job.unlock();
        ctx.update(job)?;
        ctx.transaction().mark_job_added();
        Ok(true)
    }
}

/// Give a job a number of retries, resolving its `failedJob` incident.
#[derive(Clone, Copy, Debug)]
pub struct SetJobRetriesCommand {
    pub job_id: JobId,
    pub retries: u32,
}

async fn open_failed_job_incident(ctx: &mut CommandContext, job: &Job, message: &str) -> Result<IncidentId> {
    let incident = Incident::new(FAILED_JOB_INCIDENT, message, ctx.now())
        .for_job(job.id)
        .for_execution(job.process_instance_id, job.execution_id);
    open_incident(ctx, incident).await
}

/// Apply new retries to a loaded job; shared with the retries batch.
///
/// Reviving a job resolves its `failedJob` incident, taking the last retry
/// away opens one.
pub(crate) async fn set_job_retries(ctx: &mut CommandContext, mut job: Job, retries: u32) -> Result<()> {
    let previous = job.retries;
    job.retries = retries;
    if retries > 0 {
        let failed = IncidentQuery::by_job(job.id).with_type(FAILED_JOB_INCIDENT);
        for incident in ctx.incidents(&failed).await? {
            close_incident(ctx, &incident)?;
        }
        ctx.transaction().mark_job_added();
    } else if previous > 0 {
        let message = job
            .exception_message
            .clone()
            .unwrap_or_else(|| "job retries set to 0".to_string());
        open_failed_job_incident(ctx, &job, &message).await?;
    }
    ctx.update(job)
}

#[async_trait]
impl Command for SetJobRetriesCommand {
    type Output = ();

    fn name(&self) -> &'static str {
        "set_job_retries"
    }

    fn permission(&self) -> Option<Permission> {
        Some(UPDATE_JOB)
    }

    async fn execute(&self, ctx: &mut CommandContext) -> Result<()> {
        let job = ctx.require_job(self.job_id).await?;
        set_job_retries(ctx, job, self.retries).await
    }
}

/// Move a job's due date.
#[derive(Clone, Copy, Debug)]
pub struct SetJobDueDateCommand {
    pub job_id: JobId,
    pub due_date: DateTime<Utc>,
}

#[async_trait]
impl Command for SetJobDueDateCommand {
    type Output = ();

    fn name(&self) -> &'static str {
        "set_job_due_date"
    }

    fn permission(&self) -> Option<Permission> {
        Some(UPDATE_JOB)
    }

    async fn execute(&self, ctx: &mut CommandContext) -> Result<()> {
        let mut job = ctx.require_job(self.job_id).await?;
        job.due_date = self.due_date;
        ctx.update(job)?;
        if self.due_date <= ctx.now() {
            ctx.transaction().mark_job_added();
        }
        Ok(())
    }
}

/// Keep a job from being acquired until it is activated again.
#[derive(Clone, Copy, Debug)]
pub struct SuspendJobCommand {
    pub job_id: JobId,
}

#[async_trait]
impl Command for SuspendJobCommand {
    type Output = ();

    fn name(&self) -> &'static str {
        "suspend_job"
    }

    fn permission(&self) -> Option<Permission> {
        Some(UPDATE_JOB)
    }

    async fn execute(&self, ctx: &mut CommandContext) -> Result<()> {
        set_suspended(ctx, self.job_id, true).await
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ActivateJobCommand {
    pub job_id: JobId,
}

#[async_trait]
impl Command for ActivateJobCommand {
    type Output = ();

    fn name(&self) -> &'static str {
        "activate_job"
    }

    fn permission(&self) -> Option<Permission> {
        Some(UPDATE_JOB)
    }

    async fn execute(&self, ctx: &mut CommandContext) -> Result<()> {
        set_suspended(ctx, self.job_id, false).await
    }
}

async fn set_suspended(ctx: &mut CommandContext, job_id: JobId, suspended: bool) -> Result<()> {
    let mut job = ctx.require_job(job_id).await?;
    if job.suspended == suspended {
        return Ok(());
    }
    job.suspended = suspended;
    ctx.update(job)?;
    if !suspended {
        ctx.transaction().mark_job_added();
    }
    Ok(())
}

/// Jobs matching a query.
#[derive(Clone, Debug, Default)]
pub struct FindJobsCommand {
    pub query: JobQuery,
}

#[async_trait]
impl Command for FindJobsCommand {
    type Output = Vec<Job>;

    fn name(&self) -> &'static str {
        "find_jobs"
    }

    fn permission(&self) -> Option<Permission> {
        Some(READ_JOB)
    }

    async fn execute(&self, ctx: &mut CommandContext) -> Result<Vec<Job>> {
        ctx.jobs(&self.query).await
    }
}
