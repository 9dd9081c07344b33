use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::batch::Batch;
use crate::error::Result;
use crate::ids::{BatchId, ExecutionId, IncidentId, JobId, ProcessInstanceId};
use crate::incident::{Incident, IncidentQuery};
use crate::job::{Job, JobQuery};
use crate::pvm::{Execution, ExecutionQuery};

/// Identity of a persisted entity across all entity kinds.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub enum EntityKey {
    Execution(ExecutionId),
    Job(JobId),
    Batch(BatchId),
    Incident(IncidentId),
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Execution(id) => write!(f, "execution:{id}"),
            Self::Job(id) => write!(f, "job:{id}"),
            Self::Batch(id) => write!(f, "batch:{id}"),
            Self::Incident(id) => write!(f, "incident:{id}"),
        }
    }
}

/// A persisted entity of any kind.
#[derive(Clone, Debug, PartialEq)]
pub enum Entity {
    Execution(Execution),
    Job(Job),
    Batch(Batch),
    Incident(Incident),
}

impl Entity {
    pub fn key(&self) -> EntityKey {
        match self {
            Self::Execution(e) => EntityKey::Execution(e.id),
            Self::Job(j) => EntityKey::Job(j.id),
            Self::Batch(b) => EntityKey::Batch(b.id),
            Self::Incident(i) => EntityKey::Incident(i.id),
        }
    }

    pub fn revision(&self) -> u32 {
        match self {
            Self::Execution(e) => e.revision,
            Self::Job(j) => j.revision,
            Self::Batch(b) => b.revision,
            Self::Incident(i) => i.revision,
        }
    }

    pub fn set_revision(&mut self, revision: u32) {
        match self {
            Self::Execution(e) => e.revision = revision,
            Self::Job(j) => j.revision = revision,
            Self::Batch(b) => b.revision = revision,
            Self::Incident(i) => i.revision = revision,
        }
    }
}

/// Typed access to one entity kind inside [`Entity`].
pub trait Record: Clone + Send + Sync + 'static {
    type Id: Copy + Send + Sync + fmt::Display;

    /// Human readable kind used in errors.
    const KIND: &'static str;

    fn key_of(id: Self::Id) -> EntityKey;
    fn key(&self) -> EntityKey;
    fn into_entity(self) -> Entity;
    fn as_record(entity: &Entity) -> Option<&Self>;
}

macro_rules! record {
    ($ty:ident, $id:ident, $kind:literal) => {
        impl Record for $ty {
            type Id = $id;
            const KIND: &'static str = $kind;

            fn key_of(id: $id) -> EntityKey {
                EntityKey::$ty(id)
            }

            fn key(&self) -> EntityKey {
                EntityKey::$ty(self.id)
            }

            fn into_entity(self) -> Entity {
                Entity::$ty(self)
            }

            fn as_record(entity: &Entity) -> Option<&Self> {
                match entity {
                    Entity::$ty(inner) => Some(inner),
                    _ => None,
                }
            }
        }
    };
}

record!(Execution, ExecutionId, "execution");
record!(Job, JobId, "job");
record!(Batch, BatchId, "batch");
record!(Incident, IncidentId, "incident");

/// One write in a unit of work.
#[derive(Clone, Debug, PartialEq)]
pub enum Change {
    /// Entity must not exist yet. Stored at revision 1.
    Insert(Entity),
    /// Stored revision must equal `expected_revision`; the entity carries
    /// `expected_revision + 1`.
    Update {
        entity: Entity,
        expected_revision: u32,
    },
    Delete {
        key: EntityKey,
        expected_revision: u32,
    },
}

impl Change {
    pub fn key(&self) -> EntityKey {
        match self {
            Self::Insert(entity) | Self::Update { entity, .. } => entity.key(),
            Self::Delete { key, .. } => *key,
        }
    }
}

/// Condition checked atomically with the writes of a [`ChangeSet`].
#[derive(Clone, Debug, PartialEq)]
pub enum Precondition {
    /// No exclusive job of the instance other than `job_id` holds a lock
    /// that is still live at `now`.
    NoLiveExclusiveLock {
        process_instance_id: ProcessInstanceId,
        job_id: JobId,
        now: DateTime<Utc>,
    },
}

/// All writes of one transaction, applied all-or-nothing.
///
/// Any revision mismatch or failed precondition rejects the whole set with
/// [`EngineError::OptimisticLock`](crate::EngineError::OptimisticLock).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChangeSet {
    pub changes: Vec<Change>,
    pub preconditions: Vec<Precondition>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && self.preconditions.is_empty()
    }

    pub fn push(&mut self, change: Change) {
        self.changes.push(change);
    }

    pub fn require(&mut self, precondition: Precondition) {
        self.preconditions.push(precondition);
    }
}

/// Parameters of the due-job query.
#[derive(Clone, Debug)]
pub struct AcquisitionQuery {
    pub now: DateTime<Utc>,
    pub limit: usize,
    /// Skip exclusive jobs whose process instance already has an exclusive
    /// job under a live lock.
    pub exclusive_aware: bool,
}

/// Persistence boundary of the engine.
///
/// Reads return committed state. All mutation goes through [`Store::flush`]
/// with optimistic revision checks.
#[async_trait]
pub trait Store: Send + Sync {
    async fn find(&self, key: EntityKey) -> Result<Option<Entity>>;

    async fn find_executions(&self, query: &ExecutionQuery) -> Result<Vec<Execution>>;

    async fn find_jobs(&self, query: &JobQuery) -> Result<Vec<Job>>;

    async fn find_incidents(&self, query: &IncidentQuery) -> Result<Vec<Incident>>;

    async fn find_batches(&self) -> Result<Vec<Batch>>;

    /// Due, unlocked (or expired-lock) jobs with retries left, excluding
    /// suspended jobs and jobs of suspended batches. Ordered by due date,
    /// then priority descending.
    async fn find_due_unlocked_jobs(&self, query: &AcquisitionQuery) -> Result<Vec<Job>>;

    async fn flush(&self, changes: ChangeSet) -> Result<()>;
}

/// Actively clears locks whose ownership window has passed.
#[async_trait]
pub trait LockExpiryScanner: Send + Sync {
    /// Clears expired locks, leaving due date and retries untouched.
    async fn clear_expired_locks(&self, now: DateTime<Utc>) -> Result<Vec<JobId>>;
}

/// Store that also supports the active lock sweep.
pub trait EngineStore: Store + LockExpiryScanner {}

impl<T: Store + LockExpiryScanner> EngineStore for T {}
