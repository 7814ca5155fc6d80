//! Postgres-backed job store.
//!
//! ## Claim
//!
//! `claim` runs in one transaction: expired candidates are swept to `failed`,
//! then a single eligible row is selected with `FOR UPDATE SKIP LOCKED`, so
//! concurrent claimers never block on (or both win) the same row. The
//! ordering-key head check is a `NOT EXISTS` over earlier live rows.
//!
//! ## Lease-holder operations
//!
//! `start`, `heartbeat`, `complete`, `fail` and `defer` lock the row and
//! check `claimed_by` before writing; a mismatch is `LostLease`.
//!
//! ## Error Mapping
//!
//! | SQLx Error | JobStoreError |
//! |------------|---------------|
//! | unique violation (`23505`) on insert | `AlreadyExists` |
//! | anything else | `Storage` |

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::types::Json;
use sqlx::{FromRow, Postgres, Row, Transaction};
use tracing::{Span, debug, instrument, warn};
use uuid::Uuid;

use patchflow_core::{JobId, TenantId};

use super::store::{JobStats, JobStore, JobStoreError, apply_failure};
use super::types::{
    Claimed, FailOutcome, HeartbeatOutcome, JobEnvelope, JobError, JobRecord, JobStatus, WorkerId,
};
use crate::db::{Db, is_unique_violation, to_u32};
use crate::resilience::RetryPolicy;

const JOB_COLUMNS: &str = "seq, envelope, status, claimed_by, claimed_at, heartbeat_at, \
     lease_expires_at, last_error, result, reclaim_count, updated_at, finished_at";

#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    db: Db,
    retry_policy: RetryPolicy,
}

impl PostgresJobStore {
    pub fn new(db: Db) -> Self {
        Self {
            db,
            retry_policy: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    async fn fetch_for_update(
        tx: &mut Transaction<'_, Postgres>,
        job_id: JobId,
    ) -> Result<Option<JobRecord>, JobStoreError> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE job_id = $1 FOR UPDATE"
        ))
        .bind(job_id.as_uuid())
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("fetch_for_update", e))?;

        match row {
            Some(r) => Ok(Some(
                JobRow::from_row(&r)
                    .map_err(|e| map_sqlx_error("decode", e))?
                    .try_into()?,
            )),
            None => Ok(None),
        }
    }

    async fn write_record(
        tx: &mut Transaction<'_, Postgres>,
        job: &JobRecord,
    ) -> Result<(), JobStoreError> {
        sqlx::query(
            r#"
            UPDATE jobs SET
                status = $2,
                attempt = $3,
                delay_until = $4,
                envelope = $5,
                claimed_by = $6,
                claimed_at = $7,
                heartbeat_at = $8,
                lease_expires_at = $9,
                last_error = $10,
                result = $11,
                reclaim_count = $12,
                updated_at = $13,
                finished_at = $14
            WHERE job_id = $1
            "#,
        )
        .bind(job.id().as_uuid())
        .bind(job.status.as_str())
        .bind(job.envelope.attempt as i32)
        .bind(job.envelope.delay_until)
        .bind(Json(&job.envelope))
        .bind(job.claimed_by.as_ref().map(WorkerId::as_str))
        .bind(job.claimed_at)
        .bind(job.heartbeat_at)
        .bind(job.lease_expires_at)
        .bind(job.last_error.as_ref().map(Json))
        .bind(job.result.as_ref())
        .bind(job.reclaim_count as i32)
        .bind(job.updated_at)
        .bind(job.finished_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("write_record", e))?;
        Ok(())
    }

    /// Lock the row, check the lease holder, mutate, write back.
    async fn with_leased<T>(
        &self,
        operation: &'static str,
        job_id: JobId,
        worker: &WorkerId,
        f: impl FnOnce(&mut JobRecord) -> T,
    ) -> Result<T, JobStoreError> {
        let mut tx = self
            .db
            .pool()
            .begin()
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;

        let mut job = Self::fetch_for_update(&mut tx, job_id)
            .await?
            .ok_or(JobStoreError::NotFound(job_id))?;
        if !job.is_held_by(worker) {
            return Err(JobStoreError::LostLease(job_id));
        }

        let out = f(&mut job);
        Self::write_record(&mut tx, &job).await?;
        tx.commit().await.map_err(|e| map_sqlx_error(operation, e))?;
        Ok(out)
    }

    async fn claim_async(
        &self,
        worker: &WorkerId,
        lease: Duration,
        scope: Option<TenantId>,
        now: DateTime<Utc>,
    ) -> Result<Option<Claimed>, JobStoreError> {
        let scope = scope.map(Uuid::from);
        let mut tx = self
            .db
            .pool()
            .begin()
            .await
            .map_err(|e| map_sqlx_error("claim", e))?;

        let expired = sqlx::query(
            r#"
            UPDATE jobs SET
                status = 'failed',
                last_error = $2,
                finished_at = $1,
                updated_at = $1,
                claimed_by = NULL,
                claimed_at = NULL,
                heartbeat_at = NULL,
                lease_expires_at = NULL
            WHERE deadline IS NOT NULL AND deadline <= $1
              AND ($3::uuid IS NULL OR tenant_id = $3)
              AND ((status = 'pending' AND (delay_until IS NULL OR delay_until <= $1))
                   OR (status IN ('claimed', 'running') AND lease_expires_at < $1))
            "#,
        )
        .bind(now)
        .bind(Json(JobError::deadline_exceeded()))
        .bind(scope)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("claim_sweep", e))?;
        if expired.rows_affected() > 0 {
            warn!(count = expired.rows_affected(), "deadline passed before claim");
        }

        let row = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs j
            WHERE ($2::uuid IS NULL OR j.tenant_id = $2)
              AND ((j.status = 'pending' AND (j.delay_until IS NULL OR j.delay_until <= $1))
                   OR (j.status IN ('claimed', 'running') AND j.lease_expires_at < $1))
              AND (j.ordering_key IS NULL OR NOT EXISTS (
                    SELECT 1 FROM jobs e
                    WHERE e.tenant_id = j.tenant_id
                      AND e.ordering_key = j.ordering_key
                      AND e.seq < j.seq
                      AND e.status IN ('pending', 'claimed', 'running')))
            ORDER BY j.priority DESC, j.ordering_key COLLATE "C" NULLS FIRST, j.seq
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#
        ))
        .bind(now)
        .bind(scope)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("claim", e))?;

        let Some(row) = row else {
            tx.commit().await.map_err(|e| map_sqlx_error("claim", e))?;
            return Ok(None);
        };
        let mut job: JobRecord = JobRow::from_row(&row)
            .map_err(|e| map_sqlx_error("decode", e))?
            .try_into()?;
        let reclaimed = job.mark_claimed(worker, lease, now);
        Self::write_record(&mut tx, &job).await?;
        tx.commit().await.map_err(|e| map_sqlx_error("claim", e))?;

        debug!(job_id = %job.id(), worker = %worker, reclaimed, "claimed job");
        Ok(Some(Claimed { job, reclaimed }))
    }
}

impl JobStore for PostgresJobStore {
    #[instrument(skip_all, fields(job_id = %envelope.job_id, tenant_id = %envelope.tenant_id), err)]
    fn enqueue(&self, envelope: JobEnvelope, now: DateTime<Utc>) -> Result<JobId, JobStoreError> {
        envelope.validate()?;
        let job_id = envelope.job_id;
        self.db.run(async {
            sqlx::query(
                r#"
                INSERT INTO jobs (
                    job_id, tenant_id, run_id, job_type, status, priority, ordering_key,
                    attempt, max_retries, delay_until, deadline, idempotency_key, envelope,
                    created_at, updated_at
                )
                VALUES ($1, $2, $3, $4, 'pending', $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
                "#,
            )
            .bind(envelope.job_id.as_uuid())
            .bind(envelope.tenant_id.as_uuid())
            .bind(envelope.run_id.as_uuid())
            .bind(envelope.job_type.as_str())
            .bind(envelope.priority)
            .bind(envelope.ordering_key.as_deref())
            .bind(envelope.attempt as i32)
            .bind(envelope.max_retries as i32)
            .bind(envelope.delay_until)
            .bind(envelope.deadline)
            .bind(envelope.idempotency_key.as_deref())
            .bind(Json(&envelope))
            .bind(envelope.created_at)
            .bind(now)
            .execute(self.db.pool())
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    JobStoreError::AlreadyExists(job_id)
                } else {
                    map_sqlx_error("enqueue", e)
                }
            })
        })?;
        Ok(job_id)
    }

    fn get(&self, tenant_id: TenantId, job_id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
        let row = self.db.run(async {
            sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE job_id = $1"))
                .bind(job_id.as_uuid())
                .fetch_optional(self.db.pool())
                .await
                .map_err(|e| map_sqlx_error("get", e))
        })?;

        let Some(row) = row else {
            return Ok(None);
        };
        let job: JobRecord = JobRow::from_row(&row)
            .map_err(|e| map_sqlx_error("decode", e))?
            .try_into()?;
        if job.tenant_id() != tenant_id {
            return Err(JobStoreError::TenantIsolation);
        }
        Ok(Some(job))
    }

    #[instrument(skip_all, fields(worker = %worker, job_id), err)]
    fn claim(
        &self,
        worker: &WorkerId,
        lease: Duration,
        scope: Option<TenantId>,
        now: DateTime<Utc>,
    ) -> Result<Option<Claimed>, JobStoreError> {
        let claimed = self.db.run(self.claim_async(worker, lease, scope, now))?;
        if let Some(c) = &claimed {
            Span::current().record("job_id", tracing::field::display(c.job.id()));
        }
        Ok(claimed)
    }

    fn start(&self, job_id: JobId, worker: &WorkerId, now: DateTime<Utc>) -> Result<JobRecord, JobStoreError> {
        self.db.run(self.with_leased("start", job_id, worker, |job| {
            job.mark_running(now);
            job.clone()
        }))
    }

    fn heartbeat(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<HeartbeatOutcome, JobStoreError> {
        let result = self.db.run(self.with_leased("heartbeat", job_id, worker, |job| {
            job.extend_lease(lease, now);
            job.lease_expires_at
        }));
        match result {
            Ok(Some(lease_expires_at)) => Ok(HeartbeatOutcome::Extended { lease_expires_at }),
            Ok(None) | Err(JobStoreError::LostLease(_)) => Ok(HeartbeatOutcome::LostLease),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip_all, fields(job_id = %job_id, worker = %worker), err)]
    fn complete(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        result: JsonValue,
        now: DateTime<Utc>,
    ) -> Result<JobRecord, JobStoreError> {
        self.db.run(self.with_leased("complete", job_id, worker, |job| {
            job.mark_completed(result, now);
            job.clone()
        }))
    }

    #[instrument(skip_all, fields(job_id = %job_id, worker = %worker, kind = %error.kind, retry = retry), err)]
    fn fail(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        error: JobError,
        retry: bool,
        now: DateTime<Utc>,
    ) -> Result<FailOutcome, JobStoreError> {
        let policy = self.retry_policy;
        self.db.run(self.with_leased("fail", job_id, worker, |job| {
            apply_failure(job, error, retry, &policy, now)
        }))
    }

    fn defer(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<JobRecord, JobStoreError> {
        self.db.run(self.with_leased("defer", job_id, worker, |job| {
            job.mark_deferred(until, now);
            job.clone()
        }))
    }

    fn expire(&self, job_id: JobId, now: DateTime<Utc>) -> Result<JobRecord, JobStoreError> {
        self.db.run(async {
            let mut tx = self
                .db
                .pool()
                .begin()
                .await
                .map_err(|e| map_sqlx_error("expire", e))?;
            let mut job = Self::fetch_for_update(&mut tx, job_id)
                .await?
                .ok_or(JobStoreError::NotFound(job_id))?;
            if job.status.is_terminal() {
                return Err(JobStoreError::InvalidTransition {
                    job_id,
                    status: job.status,
                    action: "expire",
                });
            }
            job.mark_expired(now);
            Self::write_record(&mut tx, &job).await?;
            tx.commit().await.map_err(|e| map_sqlx_error("expire", e))?;
            Ok::<_, JobStoreError>(job)
        })
    }

    fn list_by_status(
        &self,
        tenant_id: TenantId,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<JobRecord>, JobStoreError> {
        let rows = self.db.run(async {
            sqlx::query(&format!(
                "SELECT {JOB_COLUMNS} FROM jobs \
                 WHERE tenant_id = $1 AND ($2::text IS NULL OR status = $2) \
                 ORDER BY seq ASC LIMIT $3"
            ))
            .bind(tenant_id.as_uuid())
            .bind(status.map(JobStatus::as_str))
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(self.db.pool())
            .await
            .map_err(|e| map_sqlx_error("list_by_status", e))
        })?;

        rows.iter()
            .map(|r| -> Result<JobRecord, JobStoreError> {
                JobRow::from_row(r)
                    .map_err(|e| map_sqlx_error("decode", e))?
                    .try_into()
            })
            .collect()
    }

    #[instrument(skip_all, fields(tenant_id = %tenant_id, job_id = %job_id), err)]
    fn redrive(&self, tenant_id: TenantId, job_id: JobId, now: DateTime<Utc>) -> Result<JobRecord, JobStoreError> {
        self.db.run(async {
            let mut tx = self
                .db
                .pool()
                .begin()
                .await
                .map_err(|e| map_sqlx_error("redrive", e))?;
            let mut job = Self::fetch_for_update(&mut tx, job_id)
                .await?
                .ok_or(JobStoreError::NotFound(job_id))?;
            if job.tenant_id() != tenant_id {
                return Err(JobStoreError::TenantIsolation);
            }
            if job.status != JobStatus::DeadLetter {
                return Err(JobStoreError::InvalidTransition {
                    job_id,
                    status: job.status,
                    action: "redrive",
                });
            }
            job.mark_redriven(now);
            Self::write_record(&mut tx, &job).await?;
            tx.commit().await.map_err(|e| map_sqlx_error("redrive", e))?;
            Ok::<_, JobStoreError>(job)
        })
    }

    fn cleanup(&self, older_than: DateTime<Utc>) -> Result<usize, JobStoreError> {
        let result = self.db.run(async {
            sqlx::query(
                "DELETE FROM jobs WHERE status IN ('completed', 'failed') AND finished_at < $1",
            )
            .bind(older_than)
            .execute(self.db.pool())
            .await
            .map_err(|e| map_sqlx_error("cleanup", e))
        })?;
        Ok(result.rows_affected() as usize)
    }

    fn stats(&self, tenant_id: Option<TenantId>, now: DateTime<Utc>) -> Result<JobStats, JobStoreError> {
        let scope = tenant_id.map(Uuid::from);
        let (rows, oldest) = self.db.run(async {
            let rows = sqlx::query(
                "SELECT status, COUNT(*) AS n FROM jobs \
                 WHERE ($1::uuid IS NULL OR tenant_id = $1) GROUP BY status",
            )
            .bind(scope)
            .fetch_all(self.db.pool())
            .await
            .map_err(|e| map_sqlx_error("stats", e))?;

            let oldest: Option<DateTime<Utc>> = sqlx::query_scalar(
                "SELECT MIN(COALESCE(delay_until, created_at)) FROM jobs \
                 WHERE status = 'pending' AND COALESCE(delay_until, created_at) <= $2 \
                   AND ($1::uuid IS NULL OR tenant_id = $1)",
            )
            .bind(scope)
            .bind(now)
            .fetch_one(self.db.pool())
            .await
            .map_err(|e| map_sqlx_error("stats", e))?;

            Ok::<_, JobStoreError>((rows, oldest))
        })?;

        let mut stats = JobStats {
            oldest_due_at: oldest,
            ..JobStats::default()
        };
        for row in rows {
            let status: String = row.try_get("status").map_err(|e| map_sqlx_error("stats", e))?;
            let n: i64 = row.try_get("n").map_err(|e| map_sqlx_error("stats", e))?;
            stats.add(status.parse()?, usize::try_from(n).unwrap_or(0));
        }
        Ok(stats)
    }
}

fn map_sqlx_error(operation: &'static str, err: sqlx::Error) -> JobStoreError {
    JobStoreError::Storage(format!("{operation}: {err}"))
}

/// Row shape shared by every job query.
struct JobRow {
    seq: i64,
    envelope: JobEnvelope,
    status: String,
    claimed_by: Option<String>,
    claimed_at: Option<DateTime<Utc>>,
    heartbeat_at: Option<DateTime<Utc>>,
    lease_expires_at: Option<DateTime<Utc>>,
    last_error: Option<JobError>,
    result: Option<JsonValue>,
    reclaim_count: i32,
    updated_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl<'r> FromRow<'r, sqlx::postgres::PgRow> for JobRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        let Json(envelope): Json<JobEnvelope> = row.try_get("envelope")?;
        let last_error: Option<Json<JobError>> = row.try_get("last_error")?;
        Ok(Self {
            seq: row.try_get("seq")?,
            envelope,
            status: row.try_get("status")?,
            claimed_by: row.try_get("claimed_by")?,
            claimed_at: row.try_get("claimed_at")?,
            heartbeat_at: row.try_get("heartbeat_at")?,
            lease_expires_at: row.try_get("lease_expires_at")?,
            last_error: last_error.map(|Json(e)| e),
            result: row.try_get("result")?,
            reclaim_count: row.try_get("reclaim_count")?,
            updated_at: row.try_get("updated_at")?,
            finished_at: row.try_get("finished_at")?,
        })
    }
}

impl TryFrom<JobRow> for JobRecord {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(JobRecord {
            envelope: row.envelope,
            status: row.status.parse()?,
            claimed_by: row.claimed_by.map(WorkerId::new),
            claimed_at: row.claimed_at,
            heartbeat_at: row.heartbeat_at,
            lease_expires_at: row.lease_expires_at,
            last_error: row.last_error,
            result: row.result,
            reclaim_count: to_u32(row.reclaim_count),
            seq: u64::try_from(row.seq).unwrap_or(0),
            updated_at: row.updated_at,
            finished_at: row.finished_at,
        })
    }
}
