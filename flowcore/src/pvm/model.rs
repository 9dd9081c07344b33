use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::clock::MAX_DELAY_MS;
use crate::error::{EngineError, Result};

/// Behavior of an activity when an execution arrives at it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActivityKind {
    StartEvent,
    EndEvent,
    /// Passes straight through.
    Task,
    /// Passes straight through; pair with `async_before` to run it from a job.
    ServiceTask,
    /// Waits for a signal.
    UserTask,
    /// Waits for a signal.
    ReceiveTask,
    /// Waits for a timer job due `delay_ms` after arrival.
    TimerCatch { delay_ms: u64 },
    /// Forks on several outgoing flows, joins on several incoming flows.
    ParallelGateway,
    /// Embedded scope entered at `initial`.
    SubProcess { initial: String },
}

impl ActivityKind {
    pub fn is_wait_state(&self) -> bool {
        matches!(self, Self::UserTask | Self::ReceiveTask)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceFlow {
    pub id: String,
    pub target: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activity {
    pub id: String,
    pub kind: ActivityKind,
    /// Outgoing flows in declaration order.
    pub outgoing: Vec<SequenceFlow>,
    pub incoming: usize,
    /// Enclosing sub-process, `None` at the top level.
    pub parent: Option<String>,
    /// Suspend before executing and continue from a job.
    pub async_before: bool,
}

/// Immutable, validated process graph.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessDefinition {
    pub key: String,
    pub initial: String,
    pub activities: BTreeMap<String, Activity>,
}

impl ProcessDefinition {
    pub fn builder(key: impl Into<String>) -> ProcessDefinitionBuilder {
        ProcessDefinitionBuilder::new(key)
    }

    pub fn activity(&self, id: &str) -> Result<&Activity> {
        self.activities.get(id).ok_or_else(|| {
            EngineError::Internal(format!("activity {id} not found in process {}", self.key))
        })
    }
}

/// Builds and validates a [`ProcessDefinition`].
///
/// ```ignore
/// let definition = ProcessDefinition::builder("order")
///     .start("start")
///     .user_task("review")
///     .end("done")
///     .flow("start", "review")
///     .flow("review", "done")
///     .build()?;
/// ```
#[derive(Debug)]
pub struct ProcessDefinitionBuilder {
    key: String,
    initial: Option<String>,
    activities: Vec<Activity>,
    flows: Vec<(String, String)>,
    scope: Vec<String>,
}

impl ProcessDefinitionBuilder {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            initial: None,
            activities: Vec::new(),
            flows: Vec::new(),
            scope: Vec::new(),
        }
    }

    pub fn activity(mut self, id: impl Into<String>, kind: ActivityKind) -> Self {
        self.activities.push(Activity {
            id: id.into(),
            kind,
            outgoing: Vec::new(),
            incoming: 0,
            parent: self.scope.last().cloned(),
            async_before: false,
        });
        self
    }

    /// Start event; the first one declared at the top level is the initial activity.
    pub fn start(mut self, id: impl Into<String>) -> Self {
        let id = id.into();
        if self.scope.is_empty() && self.initial.is_none() {
            self.initial = Some(id.clone());
        }
        self.activity(id, ActivityKind::StartEvent)
    }

    pub fn end(self, id: impl Into<String>) -> Self {
        self.activity(id, ActivityKind::EndEvent)
    }

    pub fn task(self, id: impl Into<String>) -> Self {
        self.activity(id, ActivityKind::Task)
    }

    pub fn service_task(self, id: impl Into<String>) -> Self {
        self.activity(id, ActivityKind::ServiceTask)
    }

    pub fn user_task(self, id: impl Into<String>) -> Self {
        self.activity(id, ActivityKind::UserTask)
    }

    pub fn receive_task(self, id: impl Into<String>) -> Self {
        self.activity(id, ActivityKind::ReceiveTask)
    }

    pub fn timer(self, id: impl Into<String>, delay_ms: u64) -> Self {
        self.activity(id, ActivityKind::TimerCatch { delay_ms })
    }

    pub fn parallel_gateway(self, id: impl Into<String>) -> Self {
        self.activity(id, ActivityKind::ParallelGateway)
    }

    /// Open a sub-process; activities declared until [`Self::end_sub_process`]
    /// belong to it.
    pub fn sub_process(mut self, id: impl Into<String>, initial: impl Into<String>) -> Self {
        let id = id.into();
        self = self.activity(
            id.clone(),
            ActivityKind::SubProcess {
                initial: initial.into(),
            },
        );
        self.scope.push(id);
        self
    }

    pub fn end_sub_process(mut self) -> Self {
        self.scope.pop();
        self
    }

    /// Mark the most recently declared activity as asynchronous.
    pub fn async_before(mut self) -> Self {
        if let Some(last) = self.activities.last_mut() {
            last.async_before = true;
        }
        self
    }

    pub fn flow(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.flows.push((source.into(), target.into()));
        self
    }

    pub fn build(self) -> Result<ProcessDefinition> {
        let initial = self
            .initial
            .ok_or_else(|| EngineError::validation(format!("process {} has no start event", self.key)))?;

        let mut activities = BTreeMap::new();
        for activity in self.activities {
            let id = activity.id.clone();
            if let ActivityKind::TimerCatch { delay_ms } = activity.kind {
                if delay_ms > MAX_DELAY_MS {
                    return Err(EngineError::validation(format!(
                        "timer {id} delay of {delay_ms} ms exceeds {MAX_DELAY_MS} ms"
                    )));
                }
            }
            if activities.insert(id.clone(), activity).is_some() {
                return Err(EngineError::validation(format!("duplicate activity {id}")));
            }
        }

        for (index, (source, target)) in self.flows.into_iter().enumerate() {
            let source_parent = activities
                .get(&source)
                .map(|a| a.parent.clone())
                .ok_or_else(|| EngineError::validation(format!("unknown flow source {source}")))?;
            let target_activity = activities
                .get_mut(&target)
                .ok_or_else(|| EngineError::validation(format!("unknown flow target {target}")))?;
            if target_activity.parent != source_parent {
                return Err(EngineError::validation(format!(
                    "flow {source} -> {target} crosses a sub-process boundary"
                )));
            }
            target_activity.incoming += 1;
            if let Some(source_activity) = activities.get_mut(&source) {
                source_activity.outgoing.push(SequenceFlow {
                    id: format!("flow{}_{source}_{target}", index + 1),
                    target,
                });
            }
        }

        for activity in activities.values() {
            if let ActivityKind::SubProcess { initial } = &activity.kind {
                let inner = activities.get(initial).ok_or_else(|| {
                    EngineError::validation(format!(
                        "sub-process {} starts at unknown activity {initial}",
                        activity.id
                    ))
                })?;
                if inner.parent.as_deref() != Some(activity.id.as_str()) {
                    return Err(EngineError::validation(format!(
                        "sub-process {} starts outside its scope at {initial}",
                        activity.id
                    )));
                }
            }
        }

        Ok(ProcessDefinition {
            key: self.key,
            initial,
            activities,
        })
    }
}

/// Source of deployed process definitions.
pub trait DefinitionRepository: Send + Sync + fmt::Debug {
    fn get(&self, key: &str) -> Option<Arc<ProcessDefinition>>;
}

#[derive(Debug, Default)]
pub struct InMemoryDefinitionRepository {
    definitions: RwLock<HashMap<String, Arc<ProcessDefinition>>>,
}

impl InMemoryDefinitionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deploy a definition, replacing any previous one with the same key.
    pub fn deploy(&self, definition: ProcessDefinition) {
        self.definitions
            .write()
            .insert(definition.key.clone(), Arc::new(definition));
    }
}

impl DefinitionRepository for InMemoryDefinitionRepository {
    fn get(&self, key: &str) -> Option<Arc<ProcessDefinition>> {
        self.definitions.read().get(key).cloned()
    }
}
