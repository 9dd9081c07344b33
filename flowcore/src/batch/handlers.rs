use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::commands::{set_job_retries, CancelProcessInstanceCommand};
use crate::context::CommandContext;
use crate::error::{EngineError, Result};
use crate::events::EngineEvent;
use crate::ids::{BatchId, JobId, ProcessInstanceId};
use crate::job::{Job, JobHandler, JobOutcome, JobQuery};

use super::{Batch, BatchJobHandler};

pub const BATCH_SEED_JOB: &str = "batch-seed";
pub const BATCH_EXECUTION_JOB: &str = "batch-execution";
pub const BATCH_MONITOR_JOB: &str = "batch-monitor";

pub const SET_JOB_RETRIES_BATCH: &str = "set-job-retries";
pub const PROCESS_INSTANCE_CANCELLATION_BATCH: &str = "process-instance-cancellation";

/// Configuration of seed and monitor jobs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchJobConfig {
    pub batch_id: BatchId,
}

impl BatchJobConfig {
    pub fn new(batch_id: BatchId) -> Self {
        Self { batch_id }
    }

    pub(crate) fn to_value(&self) -> Result<Value> {
        serde_json::to_value(self)
            .map_err(|err| EngineError::Internal(format!("batch job config: {err}")))
    }
}

/// Configuration of one execution job: its chunk of items.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchExecutionConfig {
    pub batch_id: BatchId,
    pub items: Vec<String>,
}

fn parse<T: for<'de> Deserialize<'de>>(configuration: &Value) -> Result<T> {
    serde_json::from_value(configuration.clone())
        .map_err(|err| EngineError::validation(format!("invalid batch job configuration: {err}")))
}

/// Creates execution jobs chunk by chunk.
///
/// Each run creates at most `jobs_per_seed` execution jobs and reschedules
/// itself while items remain.
#[derive(Clone, Copy, Debug, Default)]
pub struct BatchSeedJobHandler;

#[async_trait]
impl JobHandler for BatchSeedJobHandler {
    fn job_type(&self) -> &str {
        BATCH_SEED_JOB
    }

    async fn execute(&self, configuration: &Value, ctx: &mut CommandContext) -> Result<JobOutcome> {
        let config: BatchJobConfig = parse(configuration)?;
        let Some(mut batch) = ctx.batch(config.batch_id).await? else {
            return Ok(JobOutcome::Completed);
        };

        let now = ctx.now();
        let retries = ctx.config().retry.default_retries;
        let mut created = 0;
        while created < batch.jobs_per_seed {
            let Some(items) = batch.next_chunk() else {
                break;
            };
            let chunk = BatchExecutionConfig {
                batch_id: batch.id,
                items,
            };
            let configuration = serde_json::to_value(&chunk)
                .map_err(|err| EngineError::Internal(format!("batch chunk: {err}")))?;
            ctx.create_job(Job::new(BATCH_EXECUTION_JOB, configuration, now, retries).for_batch(batch.id))?;
            created += 1;
        }
        batch.jobs_created += created;

        let metrics = ctx.services().metrics.clone();
        let batch_id = batch.id;
        ctx.transaction().on_commit(move || {
            metrics.record_batch_jobs_created(batch_id.to_string(), created as usize);
        });

        if batch.has_remaining_items() {
            ctx.update(batch)?;
            return Ok(JobOutcome::Rescheduled { due_date: now });
        }

        tracing::debug!(batch_id = %batch_id, jobs_created = batch.jobs_created, "batch seeding finished");
        batch.seed_job_id = None;
        ctx.update(batch)?;
        Ok(JobOutcome::Completed)
    }
}

/// Applies the batch type's handler to one chunk.
#[derive(Clone, Copy, Debug, Default)]
pub struct BatchExecutionJobHandler;

#[async_trait]
impl JobHandler for BatchExecutionJobHandler {
    fn job_type(&self) -> &str {
        BATCH_EXECUTION_JOB
    }

    async fn execute(&self, configuration: &Value, ctx: &mut CommandContext) -> Result<JobOutcome> {
        let config: BatchExecutionConfig = parse(configuration)?;
        let Some(batch) = ctx.batch(config.batch_id).await? else {
            return Ok(JobOutcome::Completed);
        };
        let handler = ctx.batch_handler(&batch.batch_type).ok_or_else(|| {
            EngineError::handler(anyhow::anyhow!(
                "no batch handler registered for type {}",
                batch.batch_type
            ))
        })?;

        handler.execute(&config.items, &batch.payload, ctx).await?;

        let metrics = ctx.services().metrics.clone();
        ctx.transaction()
            .on_commit(move || metrics.record_batch_job_completed());
        Ok(JobOutcome::Completed)
    }
}

/// Deletes the batch once its seed job and all execution jobs are gone.
#[derive(Clone, Copy, Debug, Default)]
pub struct BatchMonitorJobHandler;

#[async_trait]
impl JobHandler for BatchMonitorJobHandler {
    fn job_type(&self) -> &str {
        BATCH_MONITOR_JOB
    }

    async fn execute(&self, configuration: &Value, ctx: &mut CommandContext) -> Result<JobOutcome> {
        let config: BatchJobConfig = parse(configuration)?;
        let Some(batch) = ctx.batch(config.batch_id).await? else {
            return Ok(JobOutcome::Completed);
        };

        let pending = ctx
            .jobs(&JobQuery::by_batch(batch.id))
            .await?
            .into_iter()
            .filter(|job| job.job_type != BATCH_MONITOR_JOB)
            .count();
        if batch.seed_job_id.is_some() || pending > 0 {
            let poll = ctx.config().batch.monitor_poll_interval();
            let due_date = ctx.now().checked_add_signed(poll).ok_or_else(|| {
                EngineError::validation(format!("monitor poll interval {poll} out of range"))
            })?;
            return Ok(JobOutcome::Rescheduled { due_date });
        }

        ctx.delete::<Batch>(batch.id)?;
        ctx.publish(EngineEvent::BatchCompleted { batch_id: batch.id });
        let metrics = ctx.services().metrics.clone();
        let batch_id = batch.id;
        ctx.transaction()
            .on_commit(move || metrics.record_batch_completed(batch_id.to_string()));
        tracing::info!(
            batch_id = %batch.id,
            jobs_created = batch.jobs_created,
            "batch completed"
        );
        Ok(JobOutcome::Completed)
    }
}

fn parse_uuid(item: &str) -> Result<Uuid> {
    Uuid::parse_str(item).map_err(|err| EngineError::validation(format!("invalid id {item}: {err}")))
}

#[derive(Debug, Deserialize)]
struct SetRetriesPayload {
    retries: u32,
}

/// Items are job ids; payload `{"retries": n}`.
#[derive(Clone, Copy, Debug, Default)]
pub struct SetJobRetriesBatchHandler;

#[async_trait]
impl BatchJobHandler for SetJobRetriesBatchHandler {
    fn batch_type(&self) -> &str {
        SET_JOB_RETRIES_BATCH
    }

    async fn execute(&self, items: &[String], payload: &Value, ctx: &mut CommandContext) -> Result<()> {
        let payload: SetRetriesPayload = parse(payload)?;
        for item in items {
            let job_id = JobId(parse_uuid(item)?);
            // Jobs deleted since the batch was created are skipped.
            if let Some(job) = ctx.job(job_id).await? {
                set_job_retries(ctx, job, payload.retries).await?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
struct CancellationPayload {
    #[serde(default)]
    reason: Option<String>,
}

/// Items are process instance ids; payload `{"reason": "..."}`.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessInstanceCancellationBatchHandler;

#[async_trait]
impl BatchJobHandler for ProcessInstanceCancellationBatchHandler {
    fn batch_type(&self) -> &str {
        PROCESS_INSTANCE_CANCELLATION_BATCH
    }

    async fn execute(&self, items: &[String], payload: &Value, ctx: &mut CommandContext) -> Result<()> {
        let payload: CancellationPayload = if payload.is_null() {
            CancellationPayload::default()
        } else {
            parse(payload)?
        };
        for item in items {
            let process_instance_id = ProcessInstanceId(parse_uuid(item)?);
            if ctx
                .execution(process_instance_id.root_execution())
                .await?
                .is_none()
            {
                continue;
            }
            let mut command = CancelProcessInstanceCommand::new(process_instance_id);
            command.reason = payload.reason.clone();
            ctx.run_nested(&command).await?;
        }
        Ok(())
    }
}
