use std::collections::VecDeque;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::clock::after_millis;
use crate::context::CommandContext;
use crate::error::{EngineError, Result};
use crate::events::EngineEvent;
use crate::ids::{ExecutionId, ProcessInstanceId};
use crate::job::Job;

use super::execution::{Execution, ExecutionQuery, ExecutionState, ExecutionTree};
use super::listener::{ExecutionListener, ListenerEvent, ListenerEventKind};
use super::model::{Activity, ActivityKind, ProcessDefinition};
use super::operation::{next_operation, AtomicOperation, Outcome, Transition};

/// Job type continuing an `async_before` activity.
pub const ASYNC_CONTINUATION_JOB: &str = "async-continuation";
/// Job type firing an intermediate timer.
pub const TIMER_JOB: &str = "timer-transition";

/// Guard against definitions that loop without reaching a wait state.
const MAX_OPERATIONS: usize = 10_000;

/// Configuration of continuation and timer jobs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinuationConfig {
    pub process_instance_id: ProcessInstanceId,
    pub execution_id: ExecutionId,
    pub activity_id: String,
    /// Operation to resume with.
    pub operation: AtomicOperation,
}

struct Step {
    outcome: Outcome,
    targets: Vec<ExecutionId>,
}

impl Step {
    fn on(execution: ExecutionId, outcome: Outcome) -> Self {
        Self {
            outcome,
            targets: vec![execution],
        }
    }

    fn to(targets: Vec<ExecutionId>, outcome: Outcome) -> Self {
        Self { outcome, targets }
    }

    fn done(outcome: Outcome) -> Self {
        Self {
            outcome,
            targets: Vec::new(),
        }
    }
}

/// Drives queued atomic operations over one execution tree until every
/// execution rests in a wait state.
///
/// Operations run in FIFO order and forks enqueue their branches in flow
/// declaration order, so the same tree and trigger always produce the same
/// sequence.
pub struct OperationInvoker {
    definition: Arc<ProcessDefinition>,
    tree: ExecutionTree,
    queue: VecDeque<(ExecutionId, AtomicOperation)>,
    performed: Vec<(ExecutionId, AtomicOperation)>,
}

impl std::fmt::Debug for OperationInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationInvoker")
            .field("definition", &self.definition.key)
            .field("executions", &self.tree.len())
            .field("queued", &self.queue.len())
            .finish()
    }
}

impl OperationInvoker {
    pub fn new(definition: Arc<ProcessDefinition>, tree: ExecutionTree) -> Self {
        Self {
            definition,
            tree,
            queue: VecDeque::new(),
            performed: Vec::new(),
        }
    }

    pub fn schedule(&mut self, execution: ExecutionId, operation: AtomicOperation) {
        self.queue.push_back((execution, operation));
    }

    pub fn tree(&self) -> &ExecutionTree {
        &self.tree
    }

    pub fn tree_mut(&mut self) -> &mut ExecutionTree {
        &mut self.tree
    }

    /// Operations performed so far, in order.
    pub fn performed(&self) -> &[(ExecutionId, AtomicOperation)] {
        &self.performed
    }

    /// Run until the queue drains; cancellation is honoured between
    /// operations.
    pub fn run(&mut self, ctx: &mut CommandContext) -> Result<()> {
        let listeners: Vec<Arc<dyn ExecutionListener>> = ctx.execution_listeners().to_vec();

        while let Some((execution, operation)) = self.queue.pop_front() {
            ctx.check_cancelled()?;
            if self.performed.len() >= MAX_OPERATIONS {
                return Err(EngineError::Internal(format!(
                    "process {} exceeded {MAX_OPERATIONS} atomic operations without reaching a wait state",
                    self.definition.key
                )));
            }

            let step = self.perform(execution, operation, &listeners, ctx)?;
            self.performed.push((execution, operation));
            tracing::debug!(
                process_instance_id = %self.tree.process_instance_id(),
                execution_id = %execution,
                operation = operation.name(),
                outcome = ?step.outcome,
                "atomic operation"
            );

            match next_operation(operation, step.outcome) {
                Some(Transition::Next(next)) => {
                    for target in step.targets {
                        self.queue.push_back((target, next));
                    }
                }
                Some(Transition::Suspend) => {}
                None => {
                    return Err(EngineError::Internal(format!(
                        "{} reported illegal outcome {:?}",
                        operation.name(),
                        step.outcome
                    )))
                }
            }
        }
        Ok(())
    }

    pub fn into_tree(self) -> ExecutionTree {
        self.tree
    }

    fn perform(
        &mut self,
        id: ExecutionId,
        operation: AtomicOperation,
        listeners: &[Arc<dyn ExecutionListener>],
        ctx: &mut CommandContext,
    ) -> Result<Step> {
        match operation {
            AtomicOperation::ProcessStart => self.process_start(id, ctx),
            AtomicOperation::TransitionNotifyListenerStart => {
                self.notify_start(id, listeners, ctx)
            }
            AtomicOperation::TransitionCreateScope => self.create_scope(id),
            AtomicOperation::ActivityExecute => self.activity_execute(id, ctx),
            AtomicOperation::TransitionNotifyListenerEnd => self.notify_end(id, listeners),
            AtomicOperation::TransitionNotifyListenerTake => self.take(id, listeners),
            AtomicOperation::ActivityEnd => self.activity_end(id),
            AtomicOperation::TransitionDestroyScope => self.destroy_scope(id),
            AtomicOperation::ProcessEnd => self.process_end(id, ctx),
        }
    }

    fn current_activity(&self, id: ExecutionId) -> Result<(Execution, Activity)> {
        let execution = self.tree.require(id)?.clone();
        let activity_id = execution
            .activity_id
            .as_deref()
            .ok_or_else(|| EngineError::Internal(format!("execution {id} is not at an activity")))?;
        let activity = self.definition.activity(activity_id)?.clone();
        Ok((execution, activity))
    }

    fn fire(
        listeners: &[Arc<dyn ExecutionListener>],
        kind: ListenerEventKind,
        execution: &Execution,
        activity_id: &str,
        flow_id: Option<&str>,
    ) -> Result<()> {
        let event = ListenerEvent {
            kind,
            process_instance_id: execution.process_instance_id,
            execution_id: execution.id,
            activity_id,
            flow_id,
        };
        for listener in listeners {
            listener.notify(&event)?;
        }
        Ok(())
    }

    fn continuation_job(
        &self,
        job_type: &str,
        execution: &Execution,
        activity_id: &str,
        resume: AtomicOperation,
        due_date: chrono::DateTime<chrono::Utc>,
        ctx: &CommandContext,
    ) -> Result<Job> {
        let config = ContinuationConfig {
            process_instance_id: execution.process_instance_id,
            execution_id: execution.id,
            activity_id: activity_id.to_string(),
            operation: resume,
        };
        let configuration = serde_json::to_value(&config)
            .map_err(|err| EngineError::Internal(format!("continuation config: {err}")))?;
        Ok(Job::new(
            job_type,
            configuration,
            due_date,
            ctx.config().retry.default_retries,
        )
        .with_exclusive(true)
        .for_execution(execution.process_instance_id, execution.id))
    }

    fn process_start(&mut self, id: ExecutionId, ctx: &mut CommandContext) -> Result<Step> {
        let initial = self.definition.initial.clone();
        let root = self.tree.require_mut(id)?;
        root.activity_id = Some(initial);
        root.state = ExecutionState::RunnableAtActivity;
        ctx.publish(EngineEvent::ProcessStarted {
            process_instance_id: root.process_instance_id,
            process_definition_key: root.process_definition_key.clone(),
        });
        Ok(Step::on(id, Outcome::Proceed))
    }

    fn notify_start(
        &mut self,
        id: ExecutionId,
        listeners: &[Arc<dyn ExecutionListener>],
        ctx: &mut CommandContext,
    ) -> Result<Step> {
        let (execution, activity) = self.current_activity(id)?;
        Self::fire(listeners, ListenerEventKind::Start, &execution, &activity.id, None)?;

        let enters_scope = matches!(activity.kind, ActivityKind::SubProcess { .. });
        if activity.async_before {
            let resume = if enters_scope {
                AtomicOperation::TransitionCreateScope
            } else {
                AtomicOperation::ActivityExecute
            };
            let job = self.continuation_job(
                ASYNC_CONTINUATION_JOB,
                &execution,
                &activity.id,
                resume,
                ctx.now(),
                ctx,
            )?;
            ctx.create_job(job)?;
            self.tree.require_mut(id)?.state = ExecutionState::AsyncWaiting;
            return Ok(Step::done(Outcome::Async));
        }

        if enters_scope {
            Ok(Step::on(id, Outcome::EnterScope))
        } else {
            Ok(Step::on(id, Outcome::Proceed))
        }
    }

    fn create_scope(&mut self, id: ExecutionId) -> Result<Step> {
        let (execution, activity) = self.current_activity(id)?;
        let ActivityKind::SubProcess { initial } = &activity.kind else {
            return Err(EngineError::Internal(format!(
                "cannot create scope for {} activity {}",
                kind_name(&activity.kind),
                activity.id
            )));
        };

        let child = Execution::new_child(&execution, initial, true, false);
        let child_id = self.tree.add_child(child)?;
        self.tree.require_mut(id)?.suspend_for_children();
        Ok(Step::on(child_id, Outcome::Proceed))
    }

    fn activity_execute(&mut self, id: ExecutionId, ctx: &mut CommandContext) -> Result<Step> {
        let (execution, activity) = self.current_activity(id)?;
        match &activity.kind {
            ActivityKind::StartEvent
            | ActivityKind::Task
            | ActivityKind::ServiceTask
            | ActivityKind::EndEvent => {
                self.tree.require_mut(id)?.state = ExecutionState::RunnableAtActivity;
                Ok(Step::on(id, Outcome::Leave))
            }
            ActivityKind::UserTask | ActivityKind::ReceiveTask => {
                self.tree.require_mut(id)?.state = ExecutionState::RunnableAtActivity;
                ctx.publish(EngineEvent::ExecutionWaiting {
                    process_instance_id: execution.process_instance_id,
                    execution_id: id,
                    activity_id: activity.id.clone(),
                });
                Ok(Step::done(Outcome::Wait))
            }
            ActivityKind::TimerCatch { delay_ms } => {
                let due = after_millis(ctx.now(), *delay_ms).ok_or_else(|| {
                    EngineError::validation(format!(
                        "timer {} delay of {delay_ms} ms is out of range",
                        activity.id
                    ))
                })?;
                let job = self.continuation_job(
                    TIMER_JOB,
                    &execution,
                    &activity.id,
                    AtomicOperation::TransitionNotifyListenerEnd,
                    due,
                    ctx,
                )?;
                ctx.create_job(job)?;
                self.tree.require_mut(id)?.state = ExecutionState::AsyncWaiting;
                Ok(Step::done(Outcome::Wait))
            }
            ActivityKind::ParallelGateway => self.join(id, &execution, &activity),
            ActivityKind::SubProcess { .. } => Err(EngineError::Internal(format!(
                "sub-process {} must be entered through a scope",
                activity.id
            ))),
        }
    }

    fn join(&mut self, id: ExecutionId, execution: &Execution, activity: &Activity) -> Result<Step> {
        let Some(parent_id) = execution.parent_id.filter(|_| execution.is_concurrent) else {
            return Ok(Step::on(id, Outcome::Leave));
        };
        if activity.incoming <= 1 {
            return Ok(Step::on(id, Outcome::Leave));
        }

        self.tree.require_mut(id)?.is_active = false;
        let joined: Vec<ExecutionId> = self
            .tree
            .children(parent_id)
            .into_iter()
            .filter(|c| !c.is_active && c.is_at(&activity.id))
            .map(|c| c.id)
            .collect();
        if joined.len() < activity.incoming {
            return Ok(Step::done(Outcome::Joined));
        }

        for other in joined.iter().filter(|other| **other != id) {
            self.tree.remove(*other)?;
        }

        let others_running = self.tree.children(parent_id).len() > 1;
        if others_running {
            // Other branches are still elsewhere; this execution carries on.
            self.tree.require_mut(id)?.is_active = true;
            return Ok(Step::on(id, Outcome::JoinComplete));
        }

        self.tree.remove(id)?;
        let parent = self.tree.require_mut(parent_id)?;
        parent.resume();
        parent.activity_id = Some(activity.id.clone());
        Ok(Step::on(parent_id, Outcome::JoinComplete))
    }

    fn notify_end(&mut self, id: ExecutionId, listeners: &[Arc<dyn ExecutionListener>]) -> Result<Step> {
        let (execution, activity) = self.current_activity(id)?;
        Self::fire(listeners, ListenerEventKind::End, &execution, &activity.id, None)?;
        self.tree.require_mut(id)?.state = ExecutionState::RunnableAtActivity;
        if activity.outgoing.is_empty() {
            Ok(Step::on(id, Outcome::NoOutgoing))
        } else {
            Ok(Step::on(id, Outcome::Proceed))
        }
    }

    fn take(&mut self, id: ExecutionId, listeners: &[Arc<dyn ExecutionListener>]) -> Result<Step> {
        let (execution, activity) = self.current_activity(id)?;
        for flow in &activity.outgoing {
            Self::fire(
                listeners,
                ListenerEventKind::Take,
                &execution,
                &activity.id,
                Some(&flow.id),
            )?;
        }

        match activity.outgoing.as_slice() {
            [] => Err(EngineError::Internal(format!(
                "activity {} has no outgoing flow to take",
                activity.id
            ))),
            [flow] => {
                self.tree.require_mut(id)?.activity_id = Some(flow.target.clone());
                Ok(Step::on(id, Outcome::Proceed))
            }
            [first, rest @ ..] if execution.is_concurrent => {
                let parent_id = execution.parent_id.ok_or_else(|| {
                    EngineError::Internal(format!("concurrent execution {id} has no parent"))
                })?;
                self.tree.require_mut(id)?.activity_id = Some(first.target.clone());
                let parent = self.tree.require(parent_id)?.clone();
                let mut targets = vec![id];
                for flow in rest {
                    let branch = Execution::new_child(&parent, &flow.target, false, true);
                    targets.push(self.tree.add_child(branch)?);
                }
                Ok(Step::to(targets, Outcome::Fork))
            }
            flows => {
                self.tree.require_mut(id)?.suspend_for_children();
                let scope = self.tree.require(id)?.clone();
                let mut targets = Vec::with_capacity(flows.len());
                for flow in flows {
                    let branch = Execution::new_child(&scope, &flow.target, false, true);
                    targets.push(self.tree.add_child(branch)?);
                }
                Ok(Step::to(targets, Outcome::Fork))
            }
        }
    }

    fn activity_end(&mut self, id: ExecutionId) -> Result<Step> {
        let execution = self.tree.require(id)?.clone();
        if execution.is_root() {
            return Ok(Step::on(id, Outcome::InstanceCompleted));
        }
        let parent_id = execution
            .parent_id
            .ok_or_else(|| EngineError::Internal(format!("execution {id} has no parent")))?;

        if execution.is_concurrent {
            self.tree.remove(id)?;
            if self.tree.children(parent_id).is_empty() {
                return Ok(Step::on(parent_id, Outcome::ConcurrentCompleted));
            }
            return Ok(Step::done(Outcome::Ended));
        }
        if execution.is_scope {
            return Ok(Step::on(id, Outcome::ScopeCompleted));
        }
        Err(EngineError::Internal(format!(
            "execution {id} is neither scope nor concurrent"
        )))
    }

    fn destroy_scope(&mut self, id: ExecutionId) -> Result<Step> {
        let parent_id = self
            .tree
            .require(id)?
            .parent_id
            .ok_or_else(|| EngineError::Internal(format!("scope execution {id} has no parent")))?;
        self.tree.remove(id)?;
        self.tree.require_mut(parent_id)?.resume();
        Ok(Step::on(parent_id, Outcome::Proceed))
    }

    fn process_end(&mut self, id: ExecutionId, ctx: &mut CommandContext) -> Result<Step> {
        let root = self.tree.require_mut(id)?;
        root.is_active = false;
        root.is_ended = true;
        root.state = ExecutionState::Ended;
        let process_instance_id = root.process_instance_id;
        self.tree.remove_all()?;
        ctx.publish(EngineEvent::ProcessCompleted {
            process_instance_id,
        });
        tracing::info!(%process_instance_id, "process instance completed");
        Ok(Step::done(Outcome::Ended))
    }
}

fn kind_name(kind: &ActivityKind) -> &'static str {
    match kind {
        ActivityKind::StartEvent => "start event",
        ActivityKind::EndEvent => "end event",
        ActivityKind::Task => "task",
        ActivityKind::ServiceTask => "service task",
        ActivityKind::UserTask => "user task",
        ActivityKind::ReceiveTask => "receive task",
        ActivityKind::TimerCatch { .. } => "timer",
        ActivityKind::ParallelGateway => "parallel gateway",
        ActivityKind::SubProcess { .. } => "sub-process",
    }
}

/// Load every execution of an instance through the command's unit of work.
pub async fn load_tree(
    ctx: &mut CommandContext,
    process_instance_id: ProcessInstanceId,
) -> Result<ExecutionTree> {
    let executions = ctx
        .executions(&ExecutionQuery::by_process_instance(process_instance_id))
        .await?;
    if executions.is_empty() {
        return Err(EngineError::not_found("process instance", process_instance_id));
    }
    ExecutionTree::from_executions(process_instance_id, executions)
}

/// Write the tree's inserts, updates and deletes into the unit of work.
pub fn save_tree(ctx: &mut CommandContext, tree: ExecutionTree) -> Result<()> {
    let changes = tree.into_changes();
    for execution in changes.inserted {
        ctx.insert(execution)?;
    }
    for execution in changes.updated {
        ctx.update(execution)?;
    }
    for execution in changes.deleted {
        ctx.delete::<Execution>(execution.id)?;
    }
    Ok(())
}
