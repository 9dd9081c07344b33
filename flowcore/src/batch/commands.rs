use async_trait::async_trait;
use serde_json::Value;

use crate::auth::Permission;
use crate::command::Command;
use crate::commands::{close_incident, FindIncidentsCommand};
use crate::context::CommandContext;
use crate::error::{EngineError, Result};
use crate::events::EngineEvent;
use crate::ids::BatchId;
use crate::incident::IncidentQuery;
use crate::job::{Job, JobQuery};

use super::handlers::{BatchJobConfig, BATCH_EXECUTION_JOB, BATCH_MONITOR_JOB, BATCH_SEED_JOB};
use super::{Batch, BatchStatistics};

const CREATE_BATCH: Permission = Permission::new("batch", "create");
const UPDATE_BATCH: Permission = Permission::new("batch", "update");
const DELETE_BATCH: Permission = Permission::new("batch", "delete");
const READ_BATCH: Permission = Permission::new("batch", "read");

/// Split a bulk operation over `item_ids` into a tracked batch.
///
/// Stores the batch and creates its seed and monitor jobs; execution jobs
/// are created later by the seed job.
#[derive(Clone, Debug)]
pub struct CreateBatchCommand {
    pub batch_type: String,
    pub item_ids: Vec<String>,
    pub payload: Value,
}

impl CreateBatchCommand {
    pub fn new(batch_type: impl Into<String>, item_ids: Vec<String>, payload: Value) -> Self {
        Self {
            batch_type: batch_type.into(),
            item_ids,
            payload,
        }
    }
}

#[async_trait]
impl Command for CreateBatchCommand {
    type Output = BatchId;

    fn name(&self) -> &'static str {
        "create_batch"
    }

    fn permission(&self) -> Option<Permission> {
        Some(CREATE_BATCH)
    }

    async fn execute(&self, ctx: &mut CommandContext) -> Result<BatchId> {
        if self.item_ids.is_empty() {
            return Err(EngineError::validation("a batch needs at least one item"));
        }
        if self.item_ids.iter().any(|id| id.trim().is_empty()) {
            return Err(EngineError::validation("batch item ids must not be empty"));
        }
        if ctx.batch_handler(&self.batch_type).is_none() {
            return Err(EngineError::validation(format!(
                "no batch handler registered for type {}",
                self.batch_type
            )));
        }

        let now = ctx.now();
        let settings = ctx.config().batch.clone();
        let retries = ctx.config().retry.default_retries;
        let mut batch = Batch::new(
            &self.batch_type,
            self.item_ids.clone(),
            self.payload.clone(),
            settings.chunk_size,
            settings.jobs_per_seed,
            now,
        );

        let config = BatchJobConfig::new(batch.id).to_value()?;
        let seed = Job::new(BATCH_SEED_JOB, config.clone(), now, retries).for_batch(batch.id);
        let monitor = Job::new(BATCH_MONITOR_JOB, config, now, retries).for_batch(batch.id);
        batch.seed_job_id = Some(seed.id);
        batch.monitor_job_id = Some(monitor.id);

        let batch_id = batch.id;
        ctx.publish(EngineEvent::BatchCreated {
            batch_id,
            batch_type: batch.batch_type.clone(),
            total_jobs: batch.total_jobs,
        });
        tracing::info!(
            batch_id = %batch_id,
            batch_type = %batch.batch_type,
            total_jobs = batch.total_jobs,
            "batch created"
        );
        ctx.insert(batch)?;
        ctx.create_job(seed)?;
        ctx.create_job(monitor)?;
        Ok(batch_id)
    }
}

/// Stop acquisition of every job of a batch.
#[derive(Clone, Copy, Debug)]
pub struct SuspendBatchCommand {
    pub batch_id: BatchId,
}

#[async_trait]
impl Command for SuspendBatchCommand {
    type Output = ();

    fn name(&self) -> &'static str {
        "suspend_batch"
    }

    fn permission(&self) -> Option<Permission> {
        Some(UPDATE_BATCH)
    }

    async fn execute(&self, ctx: &mut CommandContext) -> Result<()> {
        set_suspended(ctx, self.batch_id, true).await
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ActivateBatchCommand {
    pub batch_id: BatchId,
}

#[async_trait]
impl Command for ActivateBatchCommand {
    type Output = ();

    fn name(&self) -> &'static str {
        "activate_batch"
    }

    fn permission(&self) -> Option<Permission> {
        Some(UPDATE_BATCH)
    }

    async fn execute(&self, ctx: &mut CommandContext) -> Result<()> {
        set_suspended(ctx, self.batch_id, false).await
    }
}

async fn set_suspended(ctx: &mut CommandContext, batch_id: BatchId, suspended: bool) -> Result<()> {
    let mut batch = ctx.require_batch(batch_id).await?;
    if batch.suspended == suspended {
        return Ok(());
    }
    batch.suspended = suspended;
    ctx.update(batch)?;
    if !suspended {
        ctx.transaction().mark_job_added();
    }
    tracing::info!(batch_id = %batch_id, suspended, "batch suspension changed");
    Ok(())
}

/// Remove a batch with all of its jobs and their incidents.
#[derive(Clone, Copy, Debug)]
pub struct DeleteBatchCommand {
    pub batch_id: BatchId,
}

#[async_trait]
impl Command for DeleteBatchCommand {
    type Output = ();

    fn name(&self) -> &'static str {
        "delete_batch"
    }

    fn permission(&self) -> Option<Permission> {
        Some(DELETE_BATCH)
    }

    async fn execute(&self, ctx: &mut CommandContext) -> Result<()> {
        ctx.require_batch(self.batch_id).await?;
        for job in ctx.jobs(&JobQuery::by_batch(self.batch_id)).await? {
            let incidents = ctx
                .run_nested(&FindIncidentsCommand {
                    query: IncidentQuery::by_job(job.id),
                })
                .await?;
            for incident in incidents {
                close_incident(ctx, &incident)?;
            }
            ctx.delete::<Job>(job.id)?;
        }
        ctx.delete::<Batch>(self.batch_id)?;
        tracing::info!(batch_id = %self.batch_id, "batch deleted");
        Ok(())
    }
}

/// Progress of a batch.
#[derive(Clone, Copy, Debug)]
pub struct BatchStatisticsCommand {
    pub batch_id: BatchId,
}

#[async_trait]
impl Command for BatchStatisticsCommand {
    type Output = BatchStatistics;

    fn name(&self) -> &'static str {
        "batch_statistics"
    }

    fn permission(&self) -> Option<Permission> {
        Some(READ_BATCH)
    }

    async fn execute(&self, ctx: &mut CommandContext) -> Result<BatchStatistics> {
        let batch = ctx.require_batch(self.batch_id).await?;
        let execution_jobs: Vec<Job> = ctx
            .jobs(&JobQuery::by_batch(self.batch_id).with_type(BATCH_EXECUTION_JOB))
            .await?;

        Ok(BatchStatistics {
            batch_id: batch.id,
            total_jobs: batch.total_jobs,
            jobs_created: batch.jobs_created,
            remaining_jobs: execution_jobs.len() as u32,
            completed_jobs: batch.jobs_created.saturating_sub(execution_jobs.len() as u32),
            failed_jobs: execution_jobs.iter().filter(|job| job.is_failed()).count() as u32,
            seed_pending: batch.seed_job_id.is_some(),
            suspended: batch.suspended,
        })
    }
}
