//! The process engine facade.
//!
//! [`ProcessEngine`] wires the shared services, the command executor and
//! the job executor together and exposes the built-in commands as methods.
//! Anything not covered here goes through [`ProcessEngine::execute`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::auth::Authentication;
use crate::batch::{
    ActivateBatchCommand, BatchStatistics, BatchStatisticsCommand, CreateBatchCommand,
    DeleteBatchCommand, SuspendBatchCommand,
};
use crate::command::Command;
use crate::commands::{
    ActivateJobCommand, CancelProcessInstanceCommand, CreateIncidentCommand,
    ExecuteJobCommand, FindExecutionsCommand, FindIncidentsCommand, FindJobsCommand,
    HandleJobFailureCommand,
    ResolveIncidentCommand, SetJobDueDateCommand, SetJobRetriesCommand, SignalExecutionCommand,
    StartProcessInstanceCommand, SuspendJobCommand,
};
use crate::config::EngineConfig;
use crate::context::EngineServices;
use crate::error::Result;
use crate::events::EngineEvent;
use crate::executor::JobExecutor;
use crate::ids::{BatchId, ExecutionId, IncidentId, JobId, ProcessInstanceId};
use crate::incident::{Incident, IncidentQuery};
use crate::interceptor::CommandExecutor;
use crate::job::{Job, JobOutcome, JobQuery};
use crate::pvm::{Execution, ExecutionQuery};
use crate::telemetry::MetricsSnapshot;

mod builder;

pub use builder::ProcessEngineBuilder;

/// One engine node: commands plus a job executor over a shared store.
///
/// Several engines may share a store; each needs its own `lock_owner`.
pub struct ProcessEngine {
    services: Arc<EngineServices>,
    commands: CommandExecutor,
    job_executor: JobExecutor,
}

impl std::fmt::Debug for ProcessEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessEngine")
            .field("commands", &self.commands)
            .field("job_executor", &self.job_executor)
            .finish()
    }
}

impl ProcessEngine {
    pub fn builder(config: EngineConfig) -> ProcessEngineBuilder {
        ProcessEngineBuilder::new(config)
    }

    pub(crate) fn from_parts(
        services: Arc<EngineServices>,
        commands: CommandExecutor,
        job_executor: JobExecutor,
    ) -> Self {
        Self {
            services,
            commands,
            job_executor,
        }
    }

    pub fn services(&self) -> &Arc<EngineServices> {
        &self.services
    }

    pub fn config(&self) -> &EngineConfig {
        &self.services.config
    }

    pub fn command_executor(&self) -> &CommandExecutor {
        &self.commands
    }

    pub fn job_executor(&self) -> &JobExecutor {
        &self.job_executor
    }

    /// Start background job acquisition.
    pub async fn start(&self) -> anyhow::Result<()> {
        self.job_executor.start().await
    }

    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.job_executor.shutdown().await
    }

    /// Run any command through the interceptor chain.
    pub async fn execute<C: Command>(&self, command: C) -> Result<C::Output> {
        self.commands.execute(command).await
    }

    /// Run a command with authorization checks for `authentication`.
    pub async fn execute_as<C: Command>(
        &self,
        command: C,
        authentication: Authentication,
    ) -> Result<C::Output> {
        self.commands.execute_as(command, authentication).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.services.events.subscribe()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.services.metrics.snapshot()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.services.clock.now()
    }

    pub async fn start_process_instance(&self, definition_key: &str) -> Result<ProcessInstanceId> {
        self.execute(StartProcessInstanceCommand::new(definition_key))
            .await
    }

    pub async fn signal(&self, execution_id: ExecutionId) -> Result<()> {
        self.execute(SignalExecutionCommand::new(execution_id)).await
    }

    pub async fn cancel_process_instance(
        &self,
        process_instance_id: ProcessInstanceId,
        reason: Option<&str>,
    ) -> Result<()> {
        let mut command = CancelProcessInstanceCommand::new(process_instance_id);
        command.reason = reason.map(str::to_string);
        self.execute(command).await
    }

    pub async fn executions(&self, query: ExecutionQuery) -> Result<Vec<Execution>> {
        self.execute(FindExecutionsCommand { query }).await
    }

    pub async fn jobs(&self, query: JobQuery) -> Result<Vec<Job>> {
        self.execute(FindJobsCommand { query }).await
    }

    pub async fn incidents(&self, query: IncidentQuery) -> Result<Vec<Incident>> {
        self.execute(FindIncidentsCommand { query }).await
    }

    /// Run a job right away, ignoring locks and due date.
    ///
    /// A failure uses up a retry exactly as on the job executor; the error is
    /// still returned to the caller.
    pub async fn execute_job(&self, job_id: JobId) -> Result<JobOutcome> {
        let err = match self.execute(ExecuteJobCommand::unowned(job_id)).await {
            Ok(outcome) => return Ok(outcome),
            Err(err) if !err.counts_as_job_failure() => return Err(err),
            Err(err) => err,
        };
        let failure = HandleJobFailureCommand::from_error(job_id, None, &err);
        if let Err(record_err) = self.execute(failure).await {
            tracing::error!(job_id = %job_id, error = %record_err, "failed to record job failure");
        }
        Err(err)
    }

    pub async fn set_job_retries(&self, job_id: JobId, retries: u32) -> Result<()> {
        self.execute(SetJobRetriesCommand { job_id, retries }).await
    }

    pub async fn set_job_due_date(&self, job_id: JobId, due_date: DateTime<Utc>) -> Result<()> {
        self.execute(SetJobDueDateCommand { job_id, due_date }).await
    }

    pub async fn suspend_job(&self, job_id: JobId) -> Result<()> {
        self.execute(SuspendJobCommand { job_id }).await
    }

    pub async fn activate_job(&self, job_id: JobId) -> Result<()> {
        self.execute(ActivateJobCommand { job_id }).await
    }

    pub async fn create_incident(
        &self,
        incident_type: &str,
        execution_id: ExecutionId,
        message: &str,
    ) -> Result<IncidentId> {
        self.execute(CreateIncidentCommand::new(incident_type, execution_id, message))
            .await
    }

    pub async fn resolve_incident(&self, incident_id: IncidentId) -> Result<()> {
        self.execute(ResolveIncidentCommand { incident_id }).await
    }

    pub async fn create_batch(
        &self,
        batch_type: &str,
        item_ids: Vec<String>,
        payload: Value,
    ) -> Result<BatchId> {
        self.execute(CreateBatchCommand::new(batch_type, item_ids, payload))
            .await
    }

    pub async fn suspend_batch(&self, batch_id: BatchId) -> Result<()> {
        self.execute(SuspendBatchCommand { batch_id }).await
    }

    pub async fn activate_batch(&self, batch_id: BatchId) -> Result<()> {
        self.execute(ActivateBatchCommand { batch_id }).await
    }

    pub async fn delete_batch(&self, batch_id: BatchId) -> Result<()> {
        self.execute(DeleteBatchCommand { batch_id }).await
    }

    pub async fn batch_statistics(&self, batch_id: BatchId) -> Result<BatchStatistics> {
        self.execute(BatchStatisticsCommand { batch_id }).await
    }
}
