//! Process virtual machine: execution trees advanced by atomic operations.

mod execution;
mod handlers;
mod invoker;
mod listener;
mod model;
mod operation;

pub use execution::{Execution, ExecutionQuery, ExecutionState, ExecutionTree, TreeChanges};
pub use handlers::{AsyncContinuationJobHandler, TimerJobHandler};
pub use invoker::{
    load_tree, save_tree, ContinuationConfig, OperationInvoker, ASYNC_CONTINUATION_JOB, TIMER_JOB,
};
pub use listener::{ExecutionListener, ListenerEvent, ListenerEventKind};
pub use model::{
    Activity, ActivityKind, DefinitionRepository, InMemoryDefinitionRepository, ProcessDefinition,
    ProcessDefinitionBuilder, SequenceFlow,
};
pub use operation::{next_operation, AtomicOperation, Outcome, Transition};
