//! Postgres-backed job store.
//!
//! Leases are Postgres session-level advisory locks keyed by a hash of the
//! record id. A session lock lives on one connection, so every lease keeps
//! its pooled connection checked out until release. If the process dies the
//! session ends and Postgres drops the lock, which is what lets another
//! process pick the record up.
//!
//! ## Error Mapping
//!
//! | SQLx error | Postgres code | `JobStoreError` |
//! |------------|---------------|-----------------|
//! | Database (unique violation) | `23505` | `Duplicate` |
//! | anything else | | `Storage` |
//!
//! ## Runtime
//!
//! The [`JobStore`] trait is synchronous; calls are bridged onto the tokio
//! runtime whose [`Handle`] the store was built with. Call it from worker or
//! other plain threads, never from inside that runtime's own tasks.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use sqlx::pool::PoolConnection;
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Postgres, Row};
use tokio::runtime::Handle;
use tracing::{debug, instrument, warn};

use lockstep_core::{JobId, LeaseToken, ProcessId};

use super::pause::{PauseStore, PauseTarget, PausedSnapshot};
use super::queues::QueueSelector;
use super::store::{JobStore, JobStoreError};
use super::types::{ClaimQuery, ClaimedJob, JobRecord, Lease, PriorityOrder};

/// Schema for jobs and pauses; idempotent.
pub const MIGRATION: &str = include_str!("../../migrations/0001_lockstep_jobs.sql");

/// Candidates fetched per page while scanning for a lockable record.
const CLAIM_CANDIDATES: i64 = 20;

const COLUMNS: &str = "id, job_class, arguments, queue_name, priority, labels, scheduled_at, \
    created_at, performed_at, finished_at, error, executions_count, locked_by_id, cron_key, cron_at";

struct Held {
    token: LeaseToken,
    conn: PoolConnection<Postgres>,
}

pub struct PostgresJobStore {
    pool: PgPool,
    runtime: Handle,
    process_id: ProcessId,
    leases: Mutex<HashMap<JobId, Held>>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool, runtime: Handle) -> Self {
        Self {
            pool,
            runtime,
            process_id: ProcessId::new(),
            leases: Mutex::new(HashMap::new()),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn process_id(&self) -> ProcessId {
        self.process_id
    }

    pub async fn migrate(&self) -> Result<(), JobStoreError> {
        sqlx::raw_sql(MIGRATION)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    #[instrument(skip(self, record), fields(job_id = %record.id, queue = %record.queue_name), err)]
    async fn insert_record(&self, record: &JobRecord) -> Result<Option<JobId>, JobStoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO lockstep_jobs
                (id, job_class, arguments, queue_name, priority, labels, scheduled_at,
                 created_at, cron_key, cron_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT DO NOTHING
            RETURNING id
            "#,
        )
        .bind(record.id.as_uuid())
        .bind(&record.job_class)
        .bind(&record.arguments)
        .bind(&record.queue_name)
        .bind(record.priority)
        .bind(&record.labels)
        .bind(record.scheduled_at)
        .bind(record.created_at)
        .bind(&record.cron_key)
        .bind(record.cron_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert", e))?;

        Ok(row.map(|_| record.id))
    }

    #[instrument(skip(self), err)]
    async fn fetch(&self, id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
        let sql = format!("SELECT {COLUMNS} FROM lockstep_jobs WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;
        row.map(|r| JobRow::from_row(&r).map(Into::into))
            .transpose()
            .map_err(|e| map_sqlx_error("decode", e))
    }

    #[instrument(skip(self, query), fields(queues = %query.queues), err)]
    async fn claim(&self, query: &ClaimQuery) -> Result<Option<ClaimedJob>, JobStoreError> {
        let (only, except) = match &query.queues {
            QueueSelector::All => (None, None),
            QueueSelector::Only(q) => (Some(q.clone()), None),
            QueueSelector::Except(q) => (None, Some(q.clone())),
        };
        let direction = match query.order {
            PriorityOrder::SmallerFirst => "ASC",
            PriorityOrder::LargerFirst => "DESC",
        };

        // Rows whose advisory lock is held by any session are not candidates.
        let sql = format!(
            r#"
            SELECT j.id FROM lockstep_jobs j
            WHERE j.finished_at IS NULL
              AND COALESCE(j.scheduled_at, j.created_at) <= $1
              AND ($2::text[] IS NULL OR j.queue_name = ANY($2))
              AND ($3::text[] IS NULL OR NOT (j.queue_name = ANY($3)))
              AND NOT (j.id = ANY($4))
              AND NOT EXISTS (
                  SELECT 1 FROM pg_locks l
                  WHERE l.locktype = 'advisory'
                    AND l.objsubid = 1
                    AND ((l.classid::bigint << 32) | l.objid::bigint) = {key}
              )
            ORDER BY j.priority {direction}, COALESCE(j.scheduled_at, j.created_at) ASC, j.id ASC
            LIMIT $5
            "#,
            key = lock_key("j.id"),
        );

        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire_connection", e))?;

        // Candidates lost to a concurrent claimer are passed over and the
        // scan continues until nothing eligible is left.
        let mut passed: Vec<uuid::Uuid> = query.skip.iter().map(|id| *id.as_uuid()).collect();
        loop {
            let candidates: Vec<uuid::Uuid> = sqlx::query_scalar(&sql)
                .bind(query.now)
                .bind(&only)
                .bind(&except)
                .bind(&passed)
                .bind(CLAIM_CANDIDATES)
                .fetch_all(&mut *conn)
                .await
                .map_err(|e| map_sqlx_error("claim_candidates", e))?;
            if candidates.is_empty() {
                return Ok(None);
            }

            for candidate in candidates {
                let id = JobId::from_uuid(candidate);
                match self.lock_on(&mut conn, id, true).await {
                    Ok(Some(claimed)) => {
                        self.hold(id, claimed.lease.token, conn);
                        return Ok(Some(claimed));
                    }
                    Ok(None) => passed.push(candidate),
                    Err(err) => {
                        discard(conn).await;
                        return Err(err);
                    }
                }
            }
        }
    }

    #[instrument(skip(self), err)]
    async fn acquire_record(&self, id: JobId) -> Result<Option<ClaimedJob>, JobStoreError> {
        if self.fetch(id).await?.is_none() {
            return Err(JobStoreError::NotFound(id));
        }
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire_connection", e))?;
        match self.lock_on(&mut conn, id, false).await {
            Ok(Some(claimed)) => {
                self.hold(id, claimed.lease.token, conn);
                Ok(Some(claimed))
            }
            Ok(None) => Ok(None),
            Err(err) => {
                discard(conn).await;
                Err(err)
            }
        }
    }

    /// Try the advisory lock for `id` on `conn`; on success re-check that
    /// the record is still claimable and stamp the owner.
    ///
    /// On `Err` the session may still hold the lock; callers must
    /// [`discard`] the connection rather than return it to the pool.
    async fn lock_on(
        &self,
        conn: &mut PoolConnection<Postgres>,
        id: JobId,
        require_due: bool,
    ) -> Result<Option<ClaimedJob>, JobStoreError> {
        let locked: bool =
            sqlx::query_scalar(&format!("SELECT pg_try_advisory_lock({})", lock_key("$1::uuid")))
                .bind(id.as_uuid())
                .fetch_one(&mut **conn)
                .await
                .map_err(|e| map_sqlx_error("try_lock", e))?;
        if !locked {
            return Ok(None);
        }

        let sql = format!(
            r#"
            UPDATE lockstep_jobs SET locked_by_id = $2
            WHERE id = $1
              AND finished_at IS NULL
              AND ($3 = false OR COALESCE(scheduled_at, created_at) <= now())
            RETURNING {COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .bind(self.process_id.as_uuid())
            .bind(require_due)
            .fetch_optional(&mut **conn)
            .await
            .map_err(|e| map_sqlx_error("stamp_owner", e))?;

        let Some(row) = row else {
            // Finished between candidate selection and locking.
            unlock(conn, id).await?;
            return Ok(None);
        };
        let record: JobRecord = JobRow::from_row(&row)
            .map_err(|e| map_sqlx_error("decode", e))?
            .into();

        debug!(job_id = %id, "lease acquired");
        Ok(Some(ClaimedJob {
            lease: Lease {
                job_id: id,
                token: LeaseToken::new(),
                owner: self.process_id,
            },
            record,
        }))
    }

    fn hold(&self, id: JobId, token: LeaseToken, conn: PoolConnection<Postgres>) {
        // A replaced entry hands its connection back to the pool on drop.
        let _runtime = self.runtime.enter();
        self.leases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Held { token, conn });
    }

    /// Remove the lease's connection from the map if `lease` is its holder.
    fn take_held(&self, lease: &Lease) -> Option<Held> {
        let mut leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        match leases.get(&lease.job_id) {
            Some(held) if held.token == lease.token => leases.remove(&lease.job_id),
            _ => None,
        }
    }

    /// Run `f` against the lease's own connection. The map lock is not held
    /// during the round trip.
    fn with_lease<T>(
        &self,
        lease: &Lease,
        f: impl for<'c> FnOnce(
            &'c mut PoolConnection<Postgres>,
        ) -> std::pin::Pin<
            Box<dyn std::future::Future<Output = Result<T, JobStoreError>> + Send + 'c>,
        >,
    ) -> Result<T, JobStoreError> {
        let mut held = self
            .take_held(lease)
            .ok_or(JobStoreError::LeaseLost(lease.job_id))?;
        let result = self.runtime.block_on(f(&mut held.conn));
        self.hold(lease.job_id, held.token, held.conn);
        result
    }

    #[instrument(skip(self), err)]
    async fn delete_finished_batch(
        &self,
        cutoff: DateTime<Utc>,
        include_discarded: bool,
        limit: usize,
    ) -> Result<usize, JobStoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM lockstep_jobs
            WHERE id IN (
                SELECT id FROM lockstep_jobs
                WHERE finished_at IS NOT NULL
                  AND finished_at < $1
                  AND ($2 OR error IS NULL)
                LIMIT $3
            )
            "#,
        )
        .bind(cutoff)
        .bind(include_discarded)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("delete_finished", e))?;

        Ok(usize::try_from(result.rows_affected()).unwrap_or(usize::MAX))
    }

    #[instrument(skip(self), err)]
    async fn lock_exists(&self, id: JobId) -> Result<bool, JobStoreError> {
        let sql = format!(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM pg_locks
                WHERE locktype = 'advisory'
                  AND objsubid = 1
                  AND ((classid::bigint << 32) | objid::bigint) = {key}
            )
            "#,
            key = lock_key("$1::uuid"),
        );
        sqlx::query_scalar(&sql)
            .bind(id.as_uuid())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("is_locked", e))
    }
}

/// Advisory lock key for the record id produced by the SQL expression `id`.
fn lock_key(id: &str) -> String {
    format!("('x' || substr(md5('lockstep_jobs' || ({id})::text), 1, 16))::bit(64)::bigint")
}

async fn unlock(conn: &mut PoolConnection<Postgres>, id: JobId) -> Result<(), JobStoreError> {
    let sql = format!("SELECT pg_advisory_unlock({})", lock_key("$1::uuid"));
    let released: bool = sqlx::query_scalar(&sql)
        .bind(id.as_uuid())
        .fetch_one(&mut **conn)
        .await
        .map_err(|e| map_sqlx_error("unlock", e))?;
    if !released {
        warn!(job_id = %id, "advisory lock was not held at release");
    }
    Ok(())
}

/// Close `conn` instead of returning it to the pool. Ending the session
/// drops every advisory lock it still holds.
async fn discard(conn: PoolConnection<Postgres>) {
    if let Err(err) = conn.close().await {
        warn!(error = %err, "closing a connection with a possibly held lock failed");
    }
}

impl JobStore for PostgresJobStore {
    fn insert(&self, record: JobRecord) -> Result<JobId, JobStoreError> {
        let id = record.id;
        self.runtime
            .block_on(self.insert_record(&record))?
            .ok_or_else(|| JobStoreError::Duplicate(id.to_string()))
    }

    fn insert_batch(&self, records: Vec<JobRecord>) -> Result<Vec<Option<JobId>>, JobStoreError> {
        self.runtime.block_on(async {
            let mut ids = Vec::with_capacity(records.len());
            for record in &records {
                ids.push(match self.insert_record(record).await {
                    Ok(id) => id,
                    Err(err) => {
                        warn!(job_id = %record.id, error = %err, "batch insert skipped a record");
                        None
                    }
                });
            }
            Ok(ids)
        })
    }

    fn get(&self, id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
        self.runtime.block_on(self.fetch(id))
    }

    fn claim_next(&self, query: &ClaimQuery) -> Result<Option<ClaimedJob>, JobStoreError> {
        self.runtime.block_on(self.claim(query))
    }

    fn acquire(&self, id: JobId) -> Result<Option<ClaimedJob>, JobStoreError> {
        self.runtime.block_on(self.acquire_record(id))
    }

    fn is_locked(&self, id: JobId) -> Result<bool, JobStoreError> {
        self.runtime.block_on(self.lock_exists(id))
    }

    fn mark_performing(&self, lease: &Lease) -> Result<(), JobStoreError> {
        let id = *lease.job_id.as_uuid();
        self.with_lease(lease, |conn| {
            Box::pin(async move {
                sqlx::query(
                    "UPDATE lockstep_jobs SET performed_at = now(), executions_count = executions_count + 1 WHERE id = $1",
                )
                .bind(id)
                .execute(&mut **conn)
                .await
                .map_err(|e| map_sqlx_error("mark_performing", e))?;
                Ok(())
            })
        })
    }

    fn mark_finished(&self, lease: &Lease, error: Option<&str>) -> Result<(), JobStoreError> {
        let id = *lease.job_id.as_uuid();
        let error = error.map(str::to_string);
        self.with_lease(lease, |conn| {
            Box::pin(async move {
                sqlx::query(
                    r#"
                    UPDATE lockstep_jobs SET finished_at = now(), error = $2
                    WHERE id = $1 AND finished_at IS NULL
                    "#,
                )
                .bind(id)
                .bind(error)
                .execute(&mut **conn)
                .await
                .map_err(|e| map_sqlx_error("mark_finished", e))?;
                Ok(())
            })
        })
    }

    fn release(&self, lease: &Lease) -> Result<(), JobStoreError> {
        let Some(mut held) = self.take_held(lease) else {
            return Ok(());
        };

        let id = lease.job_id;
        // The connection drops inside the runtime, back to the pool or closed.
        self.runtime.block_on(async move {
            let cleared = sqlx::query("UPDATE lockstep_jobs SET locked_by_id = NULL WHERE id = $1")
                .bind(id.as_uuid())
                .execute(&mut *held.conn)
                .await
                .map_err(|e| map_sqlx_error("clear_owner", e));
            let unlocked = unlock(&mut held.conn, id).await;
            let result = cleared.map(|_| ()).and(unlocked);
            if result.is_err() {
                discard(held.conn).await;
            }
            result
        })
    }

    fn delete_finished(
        &self,
        cutoff: DateTime<Utc>,
        include_discarded: bool,
        limit: usize,
    ) -> Result<usize, JobStoreError> {
        self.runtime
            .block_on(self.delete_finished_batch(cutoff, include_discarded, limit))
    }
}

impl PauseStore for PostgresJobStore {
    fn load(&self) -> Result<PausedSnapshot, JobStoreError> {
        self.runtime.block_on(async {
            let rows: Vec<(String, String)> =
                sqlx::query_as("SELECT kind, value FROM lockstep_pauses")
                    .fetch_all(&self.pool)
                    .await
                    .map_err(|e| map_sqlx_error("load_pauses", e))?;

            let mut snapshot = PausedSnapshot::default();
            for (kind, value) in rows {
                let target = match kind.as_str() {
                    "queue" => PauseTarget::Queue(value),
                    "job_class" => PauseTarget::JobClass(value),
                    "label" => PauseTarget::Label(value),
                    other => {
                        warn!(kind = other, "ignoring unknown pause kind");
                        continue;
                    }
                };
                snapshot.insert(&target);
            }
            Ok(snapshot)
        })
    }

    fn set(&self, target: &PauseTarget, paused: bool) -> Result<(), JobStoreError> {
        let sql = if paused {
            "INSERT INTO lockstep_pauses (kind, value) VALUES ($1, $2) ON CONFLICT DO NOTHING"
        } else {
            "DELETE FROM lockstep_pauses WHERE kind = $1 AND value = $2"
        };
        self.runtime.block_on(async {
            sqlx::query(sql)
                .bind(target.kind())
                .bind(target.value())
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("set_pause", e))?;
            Ok(())
        })
    }
}

impl Drop for PostgresJobStore {
    fn drop(&mut self) {
        let leases = std::mem::take(
            self.leases
                .get_mut()
                .unwrap_or_else(PoisonError::into_inner),
        );
        if leases.is_empty() {
            return;
        }
        warn!(held = leases.len(), "store dropped with leases held, ending their sessions");
        let _runtime = self.runtime.enter();
        for (_, held) in leases {
            // Detached connections close on drop instead of rejoining the pool.
            drop(held.conn.detach());
        }
    }
}

impl std::fmt::Debug for PostgresJobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let held = self.leases.lock().map(|l| l.len()).unwrap_or_default();
        f.debug_struct("PostgresJobStore")
            .field("process_id", &self.process_id)
            .field("held_leases", &held)
            .finish()
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    if let sqlx::Error::Database(db) = &err {
        if db.code().as_deref() == Some("23505") {
            return JobStoreError::Duplicate(format!("{operation}: {}", db.message()));
        }
    }
    JobStoreError::Storage(format!("{operation}: {err}"))
}

#[derive(Debug)]
struct JobRow {
    id: uuid::Uuid,
    job_class: String,
    arguments: serde_json::Value,
    queue_name: String,
    priority: i32,
    labels: Vec<String>,
    scheduled_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    performed_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    error: Option<String>,
    executions_count: i32,
    locked_by_id: Option<uuid::Uuid>,
    cron_key: Option<String>,
    cron_at: Option<DateTime<Utc>>,
}

impl<'r> FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            job_class: row.try_get("job_class")?,
            arguments: row.try_get("arguments")?,
            queue_name: row.try_get("queue_name")?,
            priority: row.try_get("priority")?,
            labels: row.try_get("labels")?,
            scheduled_at: row.try_get("scheduled_at")?,
            created_at: row.try_get("created_at")?,
            performed_at: row.try_get("performed_at")?,
            finished_at: row.try_get("finished_at")?,
            error: row.try_get("error")?,
            executions_count: row.try_get("executions_count")?,
            locked_by_id: row.try_get("locked_by_id")?,
            cron_key: row.try_get("cron_key")?,
            cron_at: row.try_get("cron_at")?,
        })
    }
}

impl From<JobRow> for JobRecord {
    fn from(row: JobRow) -> Self {
        JobRecord {
            id: JobId::from_uuid(row.id),
            job_class: row.job_class,
            arguments: row.arguments,
            queue_name: row.queue_name,
            priority: row.priority,
            labels: row.labels,
            scheduled_at: row.scheduled_at,
            created_at: row.created_at,
            performed_at: row.performed_at,
            finished_at: row.finished_at,
            error: row.error,
            executions_count: u32::try_from(row.executions_count).unwrap_or(0),
            locked_by: row.locked_by_id.map(ProcessId::from_uuid),
            cron_key: row.cron_key,
            cron_at: row.cron_at,
        }
    }
}
