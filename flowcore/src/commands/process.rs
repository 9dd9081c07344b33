use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::auth::Permission;
use crate::command::Command;
use crate::context::CommandContext;
use crate::error::{EngineError, Result};
use crate::events::EngineEvent;
use crate::ids::{ExecutionId, ProcessInstanceId};
use crate::incident::IncidentQuery;
use crate::job::{Job, JobQuery};
use crate::pvm::{
    load_tree, save_tree, AtomicOperation, Execution, ExecutionQuery, ExecutionState,
    ExecutionTree, OperationInvoker,
};

use super::incident::close_incident;

const START_PROCESS: Permission = Permission::new("process_instance", "create");
const UPDATE_PROCESS: Permission = Permission::new("process_instance", "update");
const DELETE_PROCESS: Permission = Permission::new("process_instance", "delete");
const READ_PROCESS: Permission = Permission::new("process_instance", "read");

/// Start a process instance and run it until every path waits.
#[derive(Clone, Debug)]
pub struct StartProcessInstanceCommand {
    pub definition_key: String,
    pub business_key: Option<String>,
    pub variables: BTreeMap<String, Value>,
}

impl StartProcessInstanceCommand {
    pub fn new(definition_key: impl Into<String>) -> Self {
        Self {
            definition_key: definition_key.into(),
            business_key: None,
            variables: BTreeMap::new(),
        }
    }

    pub fn with_business_key(mut self, business_key: impl Into<String>) -> Self {
        self.business_key = Some(business_key.into());
        self
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.variables.insert(name.into(), value);
        self
    }
}

#[async_trait]
impl Command for StartProcessInstanceCommand {
    type Output = ProcessInstanceId;

    fn name(&self) -> &'static str {
        "start_process_instance"
    }

    fn permission(&self) -> Option<Permission> {
        Some(START_PROCESS)
    }

    async fn execute(&self, ctx: &mut CommandContext) -> Result<ProcessInstanceId> {
        let definition = ctx.definition(&self.definition_key)?;
        let process_instance_id = ProcessInstanceId::new();

        let mut root = Execution::new_root(
            process_instance_id,
            &definition.key,
            self.business_key.clone(),
        );
        root.variables = self.variables.clone();
        let root_id = root.id;

        let mut invoker = OperationInvoker::new(definition, ExecutionTree::start(root));
        invoker.schedule(root_id, AtomicOperation::ProcessStart);
        invoker.run(ctx)?;
        save_tree(ctx, invoker.into_tree())?;

        tracing::debug!(
            process_instance_id = %process_instance_id,
            definition = %self.definition_key,
            "process instance started"
        );
        Ok(process_instance_id)
    }
}

/// Move an execution waiting in a user or receive task past it.
#[derive(Clone, Debug)]
pub struct SignalExecutionCommand {
    pub execution_id: ExecutionId,
    pub variables: BTreeMap<String, Value>,
}

impl SignalExecutionCommand {
    pub fn new(execution_id: ExecutionId) -> Self {
        Self {
            execution_id,
            variables: BTreeMap::new(),
        }
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.variables.insert(name.into(), value);
        self
    }
}

#[async_trait]
impl Command for SignalExecutionCommand {
    type Output = ();

    fn name(&self) -> &'static str {
        "signal_execution"
    }

    fn permission(&self) -> Option<Permission> {
        Some(UPDATE_PROCESS)
    }

    async fn execute(&self, ctx: &mut CommandContext) -> Result<()> {
        let execution = ctx
            .execution(self.execution_id)
            .await?
            .ok_or_else(|| EngineError::not_found("execution", self.execution_id))?;
        let definition = ctx.definition(&execution.process_definition_key)?;

        let waiting = execution.is_active
            && execution.state == ExecutionState::RunnableAtActivity
            && execution
                .activity_id
                .as_deref()
                .and_then(|id| definition.activity(id).ok())
                .is_some_and(|activity| activity.kind.is_wait_state());
        if !waiting {
            return Err(EngineError::validation(format!(
                "execution {} is not waiting for a signal",
                self.execution_id
            )));
        }

        let tree = load_tree(ctx, execution.process_instance_id).await?;
        let mut invoker = OperationInvoker::new(definition, tree);
        invoker
            .tree_mut()
            .require_mut(self.execution_id)?
            .variables
            .extend(self.variables.clone());
        invoker.schedule(self.execution_id, AtomicOperation::TransitionNotifyListenerEnd);
        invoker.run(ctx)?;
        save_tree(ctx, invoker.into_tree())
    }
}

/// Remove a running instance with its executions, jobs and incidents.
#[derive(Clone, Debug)]
pub struct CancelProcessInstanceCommand {
    pub process_instance_id: ProcessInstanceId,
    pub reason: Option<String>,
}

impl CancelProcessInstanceCommand {
    pub fn new(process_instance_id: ProcessInstanceId) -> Self {
        Self {
            process_instance_id,
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

#[async_trait]
impl Command for CancelProcessInstanceCommand {
    type Output = ();

    fn name(&self) -> &'static str {
        "cancel_process_instance"
    }

    fn permission(&self) -> Option<Permission> {
        Some(DELETE_PROCESS)
    }

    async fn execute(&self, ctx: &mut CommandContext) -> Result<()> {
        let pid = self.process_instance_id;
        let mut tree = load_tree(ctx, pid).await?;
        tree.remove_all()?;
        save_tree(ctx, tree)?;

        for job in ctx.jobs(&JobQuery::by_process_instance(pid)).await? {
            ctx.delete::<Job>(job.id)?;
        }
        for incident in ctx.incidents(&IncidentQuery::by_process_instance(pid)).await? {
            close_incident(ctx, &incident)?;
        }

        ctx.publish(EngineEvent::ProcessCancelled {
            process_instance_id: pid,
            reason: self.reason.clone(),
        });
        tracing::info!(process_instance_id = %pid, reason = ?self.reason, "process instance cancelled");
        Ok(())
    }
}

/// Executions matching a query.
#[derive(Clone, Debug, Default)]
pub struct FindExecutionsCommand {
    pub query: ExecutionQuery,
}

#[async_trait]
impl Command for FindExecutionsCommand {
    type Output = Vec<Execution>;

    fn name(&self) -> &'static str {
        "find_executions"
    }

    fn permission(&self) -> Option<Permission> {
        Some(READ_PROCESS)
    }

    async fn execute(&self, ctx: &mut CommandContext) -> Result<Vec<Execution>> {
        ctx.executions(&self.query).await
    }
}
