use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, Result};
use crate::ids::{ExecutionId, ProcessInstanceId};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    /// Positioned at an activity; either moving or waiting for a signal.
    RunnableAtActivity,
    /// Waiting for a job (async continuation or timer).
    AsyncWaiting,
    /// Inactive while child executions run (scope, fork or join).
    ScopeSuspended,
    Ended,
}

/// One concurrent path of control within a process instance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub process_instance_id: ProcessInstanceId,
    /// Arena index of the parent; `None` only for the root.
    pub parent_id: Option<ExecutionId>,
    /// Children in creation order, owned by this execution.
    pub children: Vec<ExecutionId>,
    pub process_definition_key: String,
    pub business_key: Option<String>,
    pub activity_id: Option<String>,
    pub is_scope: bool,
    pub is_concurrent: bool,
    pub is_active: bool,
    pub is_ended: bool,
    pub state: ExecutionState,
    pub variables: BTreeMap<String, Value>,
    pub revision: u32,
}

impl Execution {
    pub fn new_root(
        process_instance_id: ProcessInstanceId,
        process_definition_key: impl Into<String>,
        business_key: Option<String>,
    ) -> Self {
        Self {
            id: process_instance_id.root_execution(),
            process_instance_id,
            parent_id: None,
            children: Vec::new(),
            process_definition_key: process_definition_key.into(),
            business_key,
            activity_id: None,
            is_scope: true,
            is_concurrent: false,
            is_active: true,
            is_ended: false,
            state: ExecutionState::RunnableAtActivity,
            variables: BTreeMap::new(),
            revision: 0,
        }
    }

    /// Child positioned at `activity_id`, not yet attached to the parent.
    pub fn new_child(parent: &Execution, activity_id: &str, is_scope: bool, is_concurrent: bool) -> Self {
        Self {
            id: ExecutionId::new(),
            process_instance_id: parent.process_instance_id,
            parent_id: Some(parent.id),
            children: Vec::new(),
            process_definition_key: parent.process_definition_key.clone(),
            business_key: None,
            activity_id: Some(activity_id.to_string()),
            is_scope,
            is_concurrent,
            is_active: true,
            is_ended: false,
            state: ExecutionState::RunnableAtActivity,
            variables: BTreeMap::new(),
            revision: 0,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn is_at(&self, activity_id: &str) -> bool {
        self.activity_id.as_deref() == Some(activity_id)
    }

    pub fn suspend_for_children(&mut self) {
        self.is_active = false;
        self.state = ExecutionState::ScopeSuspended;
    }

    pub fn resume(&mut self) {
        self.is_active = true;
        self.state = ExecutionState::RunnableAtActivity;
    }
}

#[derive(Clone, Debug, Default)]
pub struct ExecutionQuery {
    pub process_instance_id: Option<ProcessInstanceId>,
    pub activity_id: Option<String>,
    pub active_only: bool,
}

impl ExecutionQuery {
    pub fn by_process_instance(id: ProcessInstanceId) -> Self {
        Self {
            process_instance_id: Some(id),
            ..Default::default()
        }
    }

    pub fn at_activity(mut self, activity_id: impl Into<String>) -> Self {
        self.activity_id = Some(activity_id.into());
        self
    }

    pub fn active(mut self) -> Self {
        self.active_only = true;
        self
    }

    pub fn matches(&self, execution: &Execution) -> bool {
        self.process_instance_id
            .is_none_or(|id| execution.process_instance_id == id)
            && self
                .activity_id
                .as_deref()
                .is_none_or(|activity| execution.is_at(activity))
            && (!self.active_only || execution.is_active)
    }
}

/// Arena holding every execution of one process instance.
///
/// Parent and child links are ids into the arena. The tree records which
/// executions were created, modified or removed so a command can write the
/// difference back through its unit of work.
#[derive(Clone, Debug)]
pub struct ExecutionTree {
    process_instance_id: ProcessInstanceId,
    nodes: BTreeMap<ExecutionId, Execution>,
    created: BTreeSet<ExecutionId>,
    modified: BTreeSet<ExecutionId>,
    removed: Vec<Execution>,
}

/// Writes produced by an [`ExecutionTree`].
#[derive(Clone, Debug, Default)]
pub struct TreeChanges {
    pub inserted: Vec<Execution>,
    pub updated: Vec<Execution>,
    pub deleted: Vec<Execution>,
}

impl ExecutionTree {
    /// Tree for a process instance that is being started.
    pub fn start(root: Execution) -> Self {
        let process_instance_id = root.process_instance_id;
        let mut created = BTreeSet::new();
        created.insert(root.id);
        let mut nodes = BTreeMap::new();
        nodes.insert(root.id, root);
        Self {
            process_instance_id,
            nodes,
            created,
            modified: BTreeSet::new(),
            removed: Vec::new(),
        }
    }

    /// Rebuild the arena from persisted executions.
    pub fn from_executions(
        process_instance_id: ProcessInstanceId,
        executions: Vec<Execution>,
    ) -> Result<Self> {
        let nodes: BTreeMap<ExecutionId, Execution> =
            executions.into_iter().map(|e| (e.id, e)).collect();

        let roots = nodes.values().filter(|e| e.is_root()).count();
        if roots != 1 {
            return Err(EngineError::Internal(format!(
                "process instance {process_instance_id} has {roots} root executions"
            )));
        }
        for execution in nodes.values() {
            if let Some(parent) = execution.parent_id {
                let linked = nodes
                    .get(&parent)
                    .is_some_and(|p| p.children.contains(&execution.id));
                if !linked {
                    return Err(EngineError::Internal(format!(
                        "execution {} is detached from parent {parent}",
                        execution.id
                    )));
                }
            }
        }

        Ok(Self {
            process_instance_id,
            nodes,
            created: BTreeSet::new(),
            modified: BTreeSet::new(),
            removed: Vec::new(),
        })
    }

    pub fn process_instance_id(&self) -> ProcessInstanceId {
        self.process_instance_id
    }

    pub fn root_id(&self) -> ExecutionId {
        self.process_instance_id.root_execution()
    }

    pub fn get(&self, id: ExecutionId) -> Option<&Execution> {
        self.nodes.get(&id)
    }

    pub fn require(&self, id: ExecutionId) -> Result<&Execution> {
        self.nodes
            .get(&id)
            .ok_or_else(|| EngineError::not_found("execution", id))
    }

    /// Mutable access; the execution is written back on save.
    pub fn require_mut(&mut self, id: ExecutionId) -> Result<&mut Execution> {
        if !self.created.contains(&id) && self.nodes.contains_key(&id) {
            self.modified.insert(id);
        }
        self.nodes
            .get_mut(&id)
            .ok_or_else(|| EngineError::not_found("execution", id))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn executions(&self) -> impl Iterator<Item = &Execution> {
        self.nodes.values()
    }

    pub fn children(&self, id: ExecutionId) -> Vec<&Execution> {
        self.nodes
            .get(&id)
            .map(|e| e.children.iter().filter_map(|c| self.nodes.get(c)).collect())
            .unwrap_or_default()
    }

    /// Attach a new child to its parent (`child.parent_id`).
    pub fn add_child(&mut self, child: Execution) -> Result<ExecutionId> {
        let parent_id = child
            .parent_id
            .ok_or_else(|| EngineError::Internal("child execution without parent".into()))?;
        let id = child.id;
        self.require_mut(parent_id)?.children.push(id);
        self.created.insert(id);
        self.nodes.insert(id, child);
        Ok(id)
    }

    /// Remove an execution and its whole subtree, detaching it from its parent.
    pub fn remove(&mut self, id: ExecutionId) -> Result<()> {
        let parent_id = self.require(id)?.parent_id;
        if let Some(parent_id) = parent_id {
            self.require_mut(parent_id)?.children.retain(|c| *c != id);
        }

        let mut pending = vec![id];
        while let Some(next) = pending.pop() {
            if let Some(execution) = self.nodes.remove(&next) {
                pending.extend(execution.children.iter().copied());
                self.modified.remove(&next);
                if !self.created.remove(&next) {
                    self.removed.push(execution);
                }
            }
        }
        Ok(())
    }

    /// Remove every execution of the instance.
    pub fn remove_all(&mut self) -> Result<()> {
        let root = self.root_id();
        if self.nodes.contains_key(&root) {
            self.remove(root)?;
        }
        Ok(())
    }

    pub fn into_changes(mut self) -> TreeChanges {
        let inserted = self
            .created
            .iter()
            .filter_map(|id| self.nodes.get(id).cloned())
            .collect();
        let updated = self
            .modified
            .iter()
            .filter_map(|id| self.nodes.get(id).cloned())
            .collect();
        TreeChanges {
            inserted,
            updated,
            deleted: std::mem::take(&mut self.removed),
        }
    }
}
