use async_trait::async_trait;
use serde_json::Value;

use crate::context::CommandContext;
use crate::error::{EngineError, Result};
use crate::job::{JobHandler, JobOutcome};

use super::execution::ExecutionState;
use super::invoker::{
    load_tree, save_tree, ContinuationConfig, OperationInvoker, ASYNC_CONTINUATION_JOB, TIMER_JOB,
};

/// Continues an `async_before` activity.
#[derive(Clone, Copy, Debug, Default)]
pub struct AsyncContinuationJobHandler;

/// Leaves an intermediate timer once its job is due.
#[derive(Clone, Copy, Debug, Default)]
pub struct TimerJobHandler;

#[async_trait]
impl JobHandler for AsyncContinuationJobHandler {
    fn job_type(&self) -> &str {
        ASYNC_CONTINUATION_JOB
    }

    async fn execute(&self, configuration: &Value, ctx: &mut CommandContext) -> Result<JobOutcome> {
        resume(configuration, ctx).await
    }
}

#[async_trait]
impl JobHandler for TimerJobHandler {
    fn job_type(&self) -> &str {
        TIMER_JOB
    }

    async fn execute(&self, configuration: &Value, ctx: &mut CommandContext) -> Result<JobOutcome> {
        resume(configuration, ctx).await
    }
}

async fn resume(configuration: &Value, ctx: &mut CommandContext) -> Result<JobOutcome> {
    let config: ContinuationConfig = serde_json::from_value(configuration.clone())
        .map_err(|err| EngineError::validation(format!("invalid continuation job: {err}")))?;

    let tree = load_tree(ctx, config.process_instance_id).await?;
    let execution = tree.require(config.execution_id)?;
    if !execution.is_at(&config.activity_id) {
        return Err(EngineError::validation(format!(
            "execution {} is no longer at {}",
            config.execution_id, config.activity_id
        )));
    }
    let definition = ctx.definition(&execution.process_definition_key)?;

    let mut invoker = OperationInvoker::new(definition, tree);
    invoker.tree_mut().require_mut(config.execution_id)?.state = ExecutionState::RunnableAtActivity;
    invoker.schedule(config.execution_id, config.operation);
    invoker.run(ctx)?;
    save_tree(ctx, invoker.into_tree())?;
    Ok(JobOutcome::Completed)
}
