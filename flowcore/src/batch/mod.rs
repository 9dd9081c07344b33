//! Bulk operations split into seed, execution and monitor jobs.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::CommandContext;
use crate::error::Result;
use crate::ids::{BatchId, JobId};

/// Batch creation and lifecycle commands.
pub mod commands;
/// Seed, execution and monitor job handlers plus built-in batch types.
pub mod handlers;

pub use commands::{
    ActivateBatchCommand, BatchStatisticsCommand, CreateBatchCommand, DeleteBatchCommand,
    SuspendBatchCommand,
};
pub use handlers::{
    BatchExecutionJobHandler, BatchMonitorJobHandler, BatchSeedJobHandler,
    ProcessInstanceCancellationBatchHandler, SetJobRetriesBatchHandler, BATCH_EXECUTION_JOB,
    BATCH_MONITOR_JOB, BATCH_SEED_JOB, PROCESS_INSTANCE_CANCELLATION_BATCH,
    SET_JOB_RETRIES_BATCH,
};

/// One bulk operation tracked as a unit.
///
/// Complete exactly when its seed job and all its execution jobs are gone;
/// the monitor job then deletes it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub id: BatchId,
    pub batch_type: String,
    /// Execution jobs the batch will create in total.
    pub total_jobs: u32,
    /// Execution jobs created by the seed so far. Finished ones are
    /// deleted, so progress is derived from the jobs still present.
    pub jobs_created: u32,
    pub chunk_size: u32,
    pub jobs_per_seed: u32,
    /// Item ids not yet assigned to an execution job.
    pub remaining_items: Vec<String>,
    /// Operation parameters handed to every execution job.
    pub payload: Value,
    pub seed_job_id: Option<JobId>,
    pub monitor_job_id: Option<JobId>,
    pub suspended: bool,
    pub created_at: DateTime<Utc>,
    pub revision: u32,
}

impl Batch {
    pub fn new(
        batch_type: impl Into<String>,
        items: Vec<String>,
        payload: Value,
        chunk_size: u32,
        jobs_per_seed: u32,
        created_at: DateTime<Utc>,
    ) -> Self {
        let total_jobs = Self::jobs_for(items.len(), chunk_size);
        Self {
            id: BatchId::new(),
            batch_type: batch_type.into(),
            total_jobs,
            jobs_created: 0,
            chunk_size,
            jobs_per_seed,
            remaining_items: items,
            payload,
            seed_job_id: None,
            monitor_job_id: None,
            suspended: false,
            created_at,
            revision: 0,
        }
    }

    /// `ceil(items / chunk_size)`.
    pub fn jobs_for(items: usize, chunk_size: u32) -> u32 {
        let chunk = chunk_size.max(1) as usize;
        items.div_ceil(chunk) as u32
    }

    /// Pop the next chunk of at most `chunk_size` items, front first.
    pub fn next_chunk(&mut self) -> Option<Vec<String>> {
        if self.remaining_items.is_empty() {
            return None;
        }
        let take = (self.chunk_size.max(1) as usize).min(self.remaining_items.len());
        Some(self.remaining_items.drain(..take).collect())
    }

    pub fn has_remaining_items(&self) -> bool {
        !self.remaining_items.is_empty()
    }
}

/// Progress of a batch computed from its live jobs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchStatistics {
    pub batch_id: BatchId,
    pub total_jobs: u32,
    pub jobs_created: u32,
    /// Execution jobs still present, including failed ones.
    pub remaining_jobs: u32,
    /// `jobs_created - remaining_jobs`.
    pub completed_jobs: u32,
    /// Remaining execution jobs out of retries.
    pub failed_jobs: u32,
    pub seed_pending: bool,
    pub suspended: bool,
}

/// Applies a batch operation to one chunk of items.
///
/// Runs inside the execution job's transaction, so a failure rolls back
/// only this chunk. Chunks never write the batch itself and can run side by
/// side.
#[async_trait]
pub trait BatchJobHandler: Send + Sync {
    fn batch_type(&self) -> &str;

    async fn execute(&self, items: &[String], payload: &Value, ctx: &mut CommandContext)
        -> Result<()>;
}

/// Batch handlers keyed by batch type.
#[derive(Clone, Default)]
pub struct BatchHandlerRegistry {
    handlers: HashMap<String, Arc<dyn BatchJobHandler>>,
}

impl BatchHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in batch types.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(SetJobRetriesBatchHandler));
        registry.register(Arc::new(ProcessInstanceCancellationBatchHandler));
        registry
    }

    pub fn register(&mut self, handler: Arc<dyn BatchJobHandler>) {
        self.handlers.insert(handler.batch_type().to_string(), handler);
    }

    pub fn get(&self, batch_type: &str) -> Option<Arc<dyn BatchJobHandler>> {
        self.handlers.get(batch_type).cloned()
    }

    pub fn contains(&self, batch_type: &str) -> bool {
        self.handlers.contains_key(batch_type)
    }
}

impl fmt::Debug for BatchHandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<&String> = self.handlers.keys().collect();
        types.sort();
        f.debug_struct("BatchHandlerRegistry")
            .field("batch_types", &types)
            .finish()
    }
}
