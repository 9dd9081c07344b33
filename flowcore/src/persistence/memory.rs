use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::batch::Batch;
use crate::error::{EngineError, Result};
use crate::ids::{JobId, ProcessInstanceId};
use crate::incident::{Incident, IncidentQuery};
use crate::job::{Job, JobQuery};
use crate::pvm::{Execution, ExecutionQuery};
use crate::store::{
    AcquisitionQuery, Change, ChangeSet, Entity, EntityKey, LockExpiryScanner, Precondition,
    Store,
};

/// Process-local store.
///
/// A change set is validated completely under the write lock before any of
/// it is applied, which gives the same all-or-nothing flush a database
/// transaction does.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    entities: RwLock<BTreeMap<EntityKey, Entity>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entities.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.read().is_empty()
    }

    /// Every stored job, in key order.
    pub fn jobs(&self) -> Vec<Job> {
        self.entities
            .read()
            .values()
            .filter_map(|entity| match entity {
                Entity::Job(job) => Some(job.clone()),
                _ => None,
            })
            .collect()
    }

    fn collect<T>(&self, select: impl Fn(&Entity) -> Option<&T>) -> Vec<T>
    where
        T: Clone,
    {
        self.entities
            .read()
            .values()
            .filter_map(|entity| select(entity).cloned())
            .collect()
    }

    fn validate(entities: &BTreeMap<EntityKey, Entity>, changes: &ChangeSet) -> Result<()> {
        for change in &changes.changes {
            let key = change.key();
            let stored = entities.get(&key).map(Entity::revision);
            match (change, stored) {
                (Change::Insert(_), None) => {}
                (Change::Insert(_), Some(_)) => {
                    return Err(EngineError::conflict(key.to_string(), "already exists"));
                }
                (
                    Change::Update {
                        expected_revision, ..
                    }
                    | Change::Delete {
                        expected_revision, ..
                    },
                    Some(revision),
                ) if revision == *expected_revision => {}
                (
                    Change::Update {
                        expected_revision, ..
                    }
                    | Change::Delete {
                        expected_revision, ..
                    },
                    Some(revision),
                ) => {
                    return Err(EngineError::conflict(
                        key.to_string(),
                        format!("expected revision {expected_revision}, found {revision}"),
                    ));
                }
                (_, None) => {
                    return Err(EngineError::conflict(key.to_string(), "deleted concurrently"));
                }
            }
        }

        for precondition in &changes.preconditions {
            match precondition {
                Precondition::NoLiveExclusiveLock {
                    process_instance_id,
                    job_id,
                    now,
                } => {
                    let held = entities.values().any(|entity| match entity {
                        Entity::Job(job) => {
                            job.id != *job_id
                                && job.exclusive
                                && job.process_instance_id == Some(*process_instance_id)
                                && job.is_locked_at(*now)
                        }
                        _ => false,
                    });
                    if held {
                        return Err(EngineError::conflict(
                            EntityKey::Job(*job_id).to_string(),
                            format!("process instance {process_instance_id} already runs an exclusive job"),
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn find(&self, key: EntityKey) -> Result<Option<Entity>> {
        Ok(self.entities.read().get(&key).cloned())
    }

    async fn find_executions(&self, query: &ExecutionQuery) -> Result<Vec<Execution>> {
        Ok(self.collect(|entity| match entity {
            Entity::Execution(e) if query.matches(e) => Some(e),
            _ => None,
        }))
    }

    async fn find_jobs(&self, query: &JobQuery) -> Result<Vec<Job>> {
        Ok(self.collect(|entity| match entity {
            Entity::Job(job) if query.matches(job) => Some(job),
            _ => None,
        }))
    }

    async fn find_incidents(&self, query: &IncidentQuery) -> Result<Vec<Incident>> {
        Ok(self.collect(|entity| match entity {
            Entity::Incident(incident) if query.matches(incident) => Some(incident),
            _ => None,
        }))
    }

    async fn find_batches(&self) -> Result<Vec<Batch>> {
        Ok(self.collect(|entity| match entity {
            Entity::Batch(batch) => Some(batch),
            _ => None,
        }))
    }

    async fn find_due_unlocked_jobs(&self, query: &AcquisitionQuery) -> Result<Vec<Job>> {
        let entities = self.entities.read();
        let now = query.now;

        let suspended_batches: HashSet<_> = entities
            .values()
            .filter_map(|entity| match entity {
                Entity::Batch(batch) if batch.suspended => Some(batch.id),
                _ => None,
            })
            .collect();

        let busy_instances: HashSet<ProcessInstanceId> = if query.exclusive_aware {
            entities
                .values()
                .filter_map(|entity| match entity {
                    Entity::Job(job) if job.exclusive && job.is_locked_at(now) => {
                        job.process_instance_id
                    }
                    _ => None,
                })
                .collect()
        } else {
            HashSet::new()
        };

        let mut due: Vec<Job> = entities
            .values()
            .filter_map(|entity| match entity {
                Entity::Job(job) => Some(job),
                _ => None,
            })
            .filter(|job| job.is_acquirable_at(now))
            .filter(|job| job.batch_id.is_none_or(|id| !suspended_batches.contains(&id)))
            .filter(|job| {
                !job.exclusive
                    || job
                        .process_instance_id
                        .is_none_or(|pid| !busy_instances.contains(&pid))
            })
            .cloned()
            .collect();

        due.sort_by(|a, b| {
            a.due_date
                .cmp(&b.due_date)
                .then(b.priority.cmp(&a.priority))
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        due.truncate(query.limit);
        Ok(due)
    }

    async fn flush(&self, changes: ChangeSet) -> Result<()> {
        let mut entities = self.entities.write();
        Self::validate(&entities, &changes)?;

        for change in changes.changes {
            match change {
                Change::Insert(mut entity) => {
                    entity.set_revision(1);
                    entities.insert(entity.key(), entity);
                }
                Change::Update { entity, .. } => {
                    entities.insert(entity.key(), entity);
                }
                Change::Delete { key, .. } => {
                    entities.remove(&key);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl LockExpiryScanner for InMemoryStore {
    async fn clear_expired_locks(&self, now: DateTime<Utc>) -> Result<Vec<JobId>> {
        let mut entities = self.entities.write();
        let mut cleared = Vec::new();
        for entity in entities.values_mut() {
            if let Entity::Job(job) = entity {
                if job.lock_owner.is_some() && !job.is_locked_at(now) {
                    job.unlock();
                    job.revision += 1;
                    cleared.push(job.id);
                }
            }
        }
        Ok(cleared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn job(due: DateTime<Utc>) -> Job {
        Job::new("test", json!({}), due, 3)
    }

    async fn insert(store: &InMemoryStore, job: Job) -> Job {
        let mut changes = ChangeSet::new();
        changes.push(Change::Insert(Entity::Job(job.clone())));
        store.flush(changes).await.unwrap();
        match store.find(EntityKey::Job(job.id)).await.unwrap() {
            Some(Entity::Job(job)) => job,
            other => panic!("unexpected {other:?}"),
        }
    }

    fn query(now: DateTime<Utc>) -> AcquisitionQuery {
        AcquisitionQuery {
            now,
            limit: 10,
            exclusive_aware: true,
        }
    }

    #[tokio::test]
    async fn test_due_jobs_ordered_by_due_date_then_priority() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let late = insert(&store, job(now - Duration::seconds(1))).await;
        let early_low = insert(&store, job(now - Duration::seconds(10))).await;
        let early_high = insert(&store, job(now - Duration::seconds(10)).with_priority(5)).await;
        insert(&store, job(now + Duration::seconds(10))).await;

        let due = store.find_due_unlocked_jobs(&query(now)).await.unwrap();
        let ids: Vec<JobId> = due.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![early_high.id, early_low.id, late.id]);
    }

    #[tokio::test]
    async fn test_stale_update_rejects_whole_change_set() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let stored = insert(&store, job(now)).await;
        let fresh = job(now);

        let mut changes = ChangeSet::new();
        changes.push(Change::Insert(Entity::Job(fresh.clone())));
        changes.push(Change::Update {
            entity: Entity::Job(stored.clone()),
            expected_revision: 7,
        });
        let err = store.flush(changes).await.unwrap_err();
        assert!(err.is_conflict());
        assert!(store.find(EntityKey::Job(fresh.id)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_exclusive_jobs_of_busy_instance_skipped() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let pid = ProcessInstanceId::new();
        let execution = pid.root_execution();

        let mut running = job(now).with_exclusive(true).for_execution(pid, execution);
        running.lock("node-a", now + Duration::minutes(5));
        let running = insert(&store, running).await;
        let waiting = insert(&store, job(now).with_exclusive(true).for_execution(pid, execution)).await;
        let other = insert(&store, job(now)).await;

        let due = store.find_due_unlocked_jobs(&query(now)).await.unwrap();
        let ids: Vec<JobId> = due.iter().map(|j| j.id).collect();
        assert_eq!(ids.len(), 1);
        assert!(ids.contains(&other.id));
        assert!(!ids.contains(&waiting.id));

        let mut changes = ChangeSet::new();
        let mut claimed = waiting.clone();
        claimed.lock("node-b", now + Duration::minutes(5));
        claimed.revision += 1;
        changes.push(Change::Update {
            entity: Entity::Job(claimed),
            expected_revision: waiting.revision,
        });
        changes.require(Precondition::NoLiveExclusiveLock {
            process_instance_id: pid,
            job_id: waiting.id,
            now,
        });
        assert!(store.flush(changes).await.unwrap_err().is_conflict());
        assert!(running.is_locked_at(now));
    }

    #[tokio::test]
    async fn test_expired_lock_is_acquirable_and_cleared() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let due = now - Duration::seconds(30);
        let mut locked = job(due);
        locked.lock("dead-node", now - Duration::seconds(1));
        let locked = insert(&store, locked).await;

        let found = store.find_due_unlocked_jobs(&query(now)).await.unwrap();
        assert_eq!(found.len(), 1);

        let cleared = store.clear_expired_locks(now).await.unwrap();
        assert_eq!(cleared, vec![locked.id]);
        let after = match store.find(EntityKey::Job(locked.id)).await.unwrap() {
            Some(Entity::Job(job)) => job,
            other => panic!("unexpected {other:?}"),
        };
        assert!(after.lock_owner.is_none());
        assert_eq!(after.due_date, due);
        assert_eq!(after.retries, 3);
        assert_eq!(after.revision, locked.revision + 1);
    }

    #[tokio::test]
    async fn test_jobs_of_suspended_batch_skipped() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let mut batch = Batch::new("t", vec!["a".into()], json!({}), 1, 1, now);
        batch.suspended = true;
        let mut changes = ChangeSet::new();
        changes.push(Change::Insert(Entity::Batch(batch.clone())));
        store.flush(changes).await.unwrap();
        insert(&store, job(now).for_batch(batch.id)).await;

        assert!(store.find_due_unlocked_jobs(&query(now)).await.unwrap().is_empty());
    }
}
