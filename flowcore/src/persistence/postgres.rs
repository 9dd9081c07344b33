use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::batch::Batch;
use crate::error::{EngineError, Result};
use crate::ids::JobId;
use crate::incident::{Incident, IncidentQuery};
use crate::job::{Job, JobQuery};
use crate::pvm::{Execution, ExecutionQuery};
use crate::store::{
    AcquisitionQuery, Change, ChangeSet, Entity, EntityKey, LockExpiryScanner, Precondition,
    Store,
};

const KIND_EXECUTION: &str = "execution";
const KIND_JOB: &str = "job";
const KIND_BATCH: &str = "batch";
const KIND_INCIDENT: &str = "incident";

/// PostgreSQL-backed entity store.
///
/// Every entity lives in one `flowcore_entities` row holding its JSON body
/// plus the columns the due-job query and the exclusivity check filter on.
/// Flushes run in one database transaction with revision-guarded writes.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

/// Column values of one entity row.
struct EntityRow {
    kind: &'static str,
    id: Uuid,
    revision: i32,
    process_instance_id: Option<Uuid>,
    batch_id: Option<Uuid>,
    due_date: Option<DateTime<Utc>>,
    retries: Option<i32>,
    priority: Option<i64>,
    exclusive: bool,
    suspended: bool,
    lock_owner: Option<String>,
    lock_expiration: Option<DateTime<Utc>>,
    created_at: Option<DateTime<Utc>>,
    data: Value,
}

impl EntityRow {
    fn from_entity(entity: &Entity) -> anyhow::Result<Self> {
        let base = |kind, id: Uuid, revision: u32, data| Self {
            kind,
            id,
            revision: revision as i32,
            process_instance_id: None,
            batch_id: None,
            due_date: None,
            retries: None,
            priority: None,
            exclusive: false,
            suspended: false,
            lock_owner: None,
            lock_expiration: None,
            created_at: None,
            data,
        };

        Ok(match entity {
            Entity::Execution(e) => Self {
                process_instance_id: Some(e.process_instance_id.0),
                ..base(KIND_EXECUTION, e.id.0, e.revision, serde_json::to_value(e)?)
            },
            Entity::Job(j) => Self {
                process_instance_id: j.process_instance_id.map(|id| id.0),
                batch_id: j.batch_id.map(|id| id.0),
                due_date: Some(j.due_date),
                retries: Some(j.retries as i32),
                priority: Some(j.priority),
                exclusive: j.exclusive,
                suspended: j.suspended,
                lock_owner: j.lock_owner.clone(),
                lock_expiration: j.lock_expiration,
                created_at: Some(j.created_at),
                ..base(KIND_JOB, j.id.0, j.revision, serde_json::to_value(j)?)
            },
            Entity::Batch(b) => Self {
                suspended: b.suspended,
                created_at: Some(b.created_at),
                ..base(KIND_BATCH, b.id.0, b.revision, serde_json::to_value(b)?)
            },
            Entity::Incident(i) => Self {
                process_instance_id: i.process_instance_id.map(|id| id.0),
                created_at: Some(i.created_at),
                ..base(KIND_INCIDENT, i.id.0, i.revision, serde_json::to_value(i)?)
            },
        })
    }
}

fn key_parts(key: &EntityKey) -> (&'static str, Uuid) {
    match key {
        EntityKey::Execution(id) => (KIND_EXECUTION, id.0),
        EntityKey::Job(id) => (KIND_JOB, id.0),
        EntityKey::Batch(id) => (KIND_BATCH, id.0),
        EntityKey::Incident(id) => (KIND_INCIDENT, id.0),
    }
}

/// Decode a row; the revision column wins over the JSON body.
fn decode(row: &PgRow) -> anyhow::Result<Entity> {
    let kind: String = row.try_get("kind")?;
    let revision: i32 = row.try_get("revision")?;
    let data: Value = row.try_get("data")?;

    let mut entity = match kind.as_str() {
        KIND_EXECUTION => Entity::Execution(serde_json::from_value(data)?),
        KIND_JOB => Entity::Job(serde_json::from_value(data)?),
        KIND_BATCH => Entity::Batch(serde_json::from_value(data)?),
        KIND_INCIDENT => Entity::Incident(serde_json::from_value(data)?),
        other => return Err(anyhow::anyhow!("unknown entity kind: {}", other)),
    };
    entity.set_revision(revision as u32);
    Ok(entity)
}

fn decode_all<T>(rows: &[PgRow], select: impl Fn(Entity) -> Option<T>) -> Result<Vec<T>> {
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        if let Some(record) = select(decode(row)?) {
            out.push(record);
        }
    }
    Ok(out)
}

fn store_err(err: sqlx::Error) -> EngineError {
    EngineError::Store(err.into())
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the entity table and its indexes when missing.
    pub async fn migrate(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS flowcore_entities (
                kind TEXT NOT NULL,
                id UUID NOT NULL,
                revision INTEGER NOT NULL,
                process_instance_id UUID NULL,
                batch_id UUID NULL,
                due_date TIMESTAMPTZ NULL,
                retries INTEGER NULL,
                priority BIGINT NULL,
                exclusive BOOLEAN NOT NULL DEFAULT FALSE,
                suspended BOOLEAN NOT NULL DEFAULT FALSE,
                lock_owner TEXT NULL,
                lock_expiration TIMESTAMPTZ NULL,
                created_at TIMESTAMPTZ NULL,
                data JSONB NOT NULL,
                PRIMARY KEY (kind, id)
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS flowcore_entities_due_idx
            ON flowcore_entities (due_date, priority DESC)
            WHERE kind = 'job'
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS flowcore_entities_instance_idx
            ON flowcore_entities (process_instance_id)
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS flowcore_entities_batch_idx
            ON flowcore_entities (batch_id)
            WHERE kind = 'job'
            "#,
        ];
        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(store_err)?;
        }
        Ok(())
    }

    async fn find_kind(
        &self,
        kind: &'static str,
        process_instance_id: Option<Uuid>,
        batch_id: Option<Uuid>,
    ) -> Result<Vec<PgRow>> {
        sqlx::query(
            r#"
            SELECT kind, revision, data
            FROM flowcore_entities
            WHERE kind = $1
              AND ($2::uuid IS NULL OR process_instance_id = $2)
              AND ($3::uuid IS NULL OR batch_id = $3)
            ORDER BY id
            "#,
        )
        .bind(kind)
        .bind(process_instance_id)
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)
    }

    async fn check_precondition(
        tx: &mut Transaction<'_, Postgres>,
        precondition: &Precondition,
    ) -> Result<()> {
        match precondition {
            Precondition::NoLiveExclusiveLock {
                process_instance_id,
                job_id,
                now,
            } => {
                // Serializes concurrent claims for the same instance until commit.
                sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
                    .bind(process_instance_id.to_string())
                    .execute(&mut **tx)
                    .await
                    .map_err(store_err)?;

                let held: i64 = sqlx::query(
                    r#"
                    SELECT COUNT(*) AS held
                    FROM flowcore_entities
                    WHERE kind = 'job'
                      AND process_instance_id = $1
                      AND id <> $2
                      AND exclusive
                      AND lock_owner IS NOT NULL
                      AND lock_expiration > $3
                    "#,
                )
                .bind(process_instance_id.0)
                .bind(job_id.0)
                .bind(*now)
                .fetch_one(&mut **tx)
                .await
                .map_err(store_err)?
                .try_get("held")
                .map_err(store_err)?;

                if held > 0 {
                    return Err(EngineError::conflict(
                        EntityKey::Job(*job_id).to_string(),
                        format!("process instance {process_instance_id} already runs an exclusive job"),
                    ));
                }
                Ok(())
            }
        }
    }

    async fn apply(tx: &mut Transaction<'_, Postgres>, change: &Change) -> Result<()> {
        let key = change.key();
        let affected = match change {
            Change::Insert(entity) => {
                let row = EntityRow::from_entity(entity)?;
                sqlx::query(
                    r#"
                    INSERT INTO flowcore_entities (
                        kind, id, revision, process_instance_id, batch_id, due_date,
                        retries, priority, exclusive, suspended, lock_owner,
                        lock_expiration, created_at, data
                    )
                    VALUES ($1, $2, 1, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                    ON CONFLICT (kind, id) DO NOTHING
                    "#,
                )
                .bind(row.kind)
                .bind(row.id)
                .bind(row.process_instance_id)
                .bind(row.batch_id)
                .bind(row.due_date)
                .bind(row.retries)
                .bind(row.priority)
                .bind(row.exclusive)
                .bind(row.suspended)
                .bind(&row.lock_owner)
                .bind(row.lock_expiration)
                .bind(row.created_at)
                .bind(&row.data)
                .execute(&mut **tx)
                .await
                .map_err(store_err)?
                .rows_affected()
            }
            Change::Update {
                entity,
                expected_revision,
            } => {
                let row = EntityRow::from_entity(entity)?;
                sqlx::query(
                    r#"
                    UPDATE flowcore_entities
                    SET revision = $3,
                        process_instance_id = $4,
                        batch_id = $5,
                        due_date = $6,
                        retries = $7,
                        priority = $8,
                        exclusive = $9,
                        suspended = $10,
                        lock_owner = $11,
                        lock_expiration = $12,
                        created_at = $13,
                        data = $14
                    WHERE kind = $1
                      AND id = $2
                      AND revision = $15
                    "#,
                )
                .bind(row.kind)
                .bind(row.id)
                .bind(row.revision)
                .bind(row.process_instance_id)
                .bind(row.batch_id)
                .bind(row.due_date)
                .bind(row.retries)
                .bind(row.priority)
                .bind(row.exclusive)
                .bind(row.suspended)
                .bind(&row.lock_owner)
                .bind(row.lock_expiration)
                .bind(row.created_at)
                .bind(&row.data)
                .bind(*expected_revision as i32)
                .execute(&mut **tx)
                .await
                .map_err(store_err)?
                .rows_affected()
            }
            Change::Delete {
                key,
                expected_revision,
            } => {
                let (kind, id) = key_parts(key);
                sqlx::query(
                    r#"
                    DELETE FROM flowcore_entities
                    WHERE kind = $1
                      AND id = $2
                      AND revision = $3
                    "#,
                )
                .bind(kind)
                .bind(id)
                .bind(*expected_revision as i32)
                .execute(&mut **tx)
                .await
                .map_err(store_err)?
                .rows_affected()
            }
        };

        if affected == 0 {
            let detail = match change {
                Change::Insert(_) => "already exists".to_string(),
                Change::Update {
                    expected_revision, ..
                }
                | Change::Delete {
                    expected_revision, ..
                } => format!("revision {expected_revision} is stale"),
            };
            return Err(EngineError::conflict(key.to_string(), detail));
        }
        Ok(())
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn find(&self, key: EntityKey) -> Result<Option<Entity>> {
        let (kind, id) = key_parts(&key);
        let row = sqlx::query(
            r#"
            SELECT kind, revision, data
            FROM flowcore_entities
            WHERE kind = $1 AND id = $2
            "#,
        )
        .bind(kind)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(row.as_ref().map(decode).transpose()?)
    }

    async fn find_executions(&self, query: &ExecutionQuery) -> Result<Vec<Execution>> {
        let rows = self
            .find_kind(KIND_EXECUTION, query.process_instance_id.map(|id| id.0), None)
            .await?;
        decode_all(&rows, |entity| match entity {
            Entity::Execution(e) if query.matches(&e) => Some(e),
            _ => None,
        })
    }

    async fn find_jobs(&self, query: &JobQuery) -> Result<Vec<Job>> {
        let rows = self
            .find_kind(
                KIND_JOB,
                query.process_instance_id.map(|id| id.0),
                query.batch_id.map(|id| id.0),
            )
            .await?;
        decode_all(&rows, |entity| match entity {
            Entity::Job(job) if query.matches(&job) => Some(job),
            _ => None,
        })
    }

    async fn find_incidents(&self, query: &IncidentQuery) -> Result<Vec<Incident>> {
        let rows = self
            .find_kind(KIND_INCIDENT, query.process_instance_id.map(|id| id.0), None)
            .await?;
        decode_all(&rows, |entity| match entity {
            Entity::Incident(incident) if query.matches(&incident) => Some(incident),
            _ => None,
        })
    }

    async fn find_batches(&self) -> Result<Vec<Batch>> {
        let rows = self.find_kind(KIND_BATCH, None, None).await?;
        decode_all(&rows, |entity| match entity {
            Entity::Batch(batch) => Some(batch),
            _ => None,
        })
    }

    async fn find_due_unlocked_jobs(&self, query: &AcquisitionQuery) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            r#"
            SELECT j.kind, j.revision, j.data
            FROM flowcore_entities j
            WHERE j.kind = 'job'
              AND j.due_date <= $1
              AND j.retries > 0
              AND NOT j.suspended
              AND NOT (j.lock_owner IS NOT NULL AND j.lock_expiration > $1)
              AND NOT EXISTS (
                  SELECT 1 FROM flowcore_entities b
                  WHERE b.kind = 'batch' AND b.id = j.batch_id AND b.suspended
              )
              AND (
                  NOT $3
                  OR NOT j.exclusive
                  OR j.process_instance_id IS NULL
                  OR NOT EXISTS (
                      SELECT 1 FROM flowcore_entities o
                      WHERE o.kind = 'job'
                        AND o.exclusive
                        AND o.process_instance_id = j.process_instance_id
                        AND o.lock_owner IS NOT NULL
                        AND o.lock_expiration > $1
                  )
              )
            ORDER BY j.due_date, j.priority DESC, j.created_at, j.id
            LIMIT $2
            "#,
        )
        .bind(query.now)
        .bind(query.limit as i64)
        .bind(query.exclusive_aware)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        decode_all(&rows, |entity| match entity {
            Entity::Job(job) => Some(job),
            _ => None,
        })
    }

    async fn flush(&self, changes: ChangeSet) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await.map_err(store_err)?;

        for precondition in &changes.preconditions {
            if let Err(err) = Self::check_precondition(&mut tx, precondition).await {
                drop(tx.rollback().await);
                return Err(err);
            }
        }
        for change in &changes.changes {
            if let Err(err) = Self::apply(&mut tx, change).await {
                if err.is_conflict() {
                    debug!(error = %err, "flush rejected");
                } else {
                    warn!(error = %err, "flush failed");
                }
                drop(tx.rollback().await);
                return Err(err);
            }
        }

        tx.commit().await.map_err(store_err)?;
        Ok(())
    }
}

#[async_trait]
impl LockExpiryScanner for PostgresStore {
    async fn clear_expired_locks(&self, now: DateTime<Utc>) -> Result<Vec<JobId>> {
        let rows = sqlx::query(
            r#"
            UPDATE flowcore_entities
            SET lock_owner = NULL,
                lock_expiration = NULL,
                revision = revision + 1,
                data = data || '{"lock_owner": null, "lock_expiration": null}'::jsonb
            WHERE kind = 'job'
              AND lock_owner IS NOT NULL
              AND (lock_expiration IS NULL OR lock_expiration <= $1)
            RETURNING id
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        let mut cleared = Vec::with_capacity(rows.len());
        for row in rows {
            let id: Uuid = row.try_get("id").map_err(store_err)?;
            cleared.push(JobId(id));
        }
        if !cleared.is_empty() {
            debug!(count = cleared.len(), "cleared expired job locks");
        }
        Ok(cleared)
    }
}
