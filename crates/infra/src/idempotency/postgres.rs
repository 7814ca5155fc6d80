//! Postgres-backed idempotency store.
//!
//! `begin_or_join` first tries `INSERT ... ON CONFLICT DO NOTHING`; a
//! concurrent inserter waits on the primary key and loses. Otherwise the
//! existing row is locked `FOR UPDATE` and the decision is made on the
//! locked copy, so only one caller can flip it back to `processing`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{Postgres, Row, Transaction};
use tracing::instrument;

use super::store::{BeginOutcome, IdempotencyError, IdempotencyKey, IdempotencyRecord, IdempotencyStore};
use crate::db::Db;

#[derive(Debug, Clone)]
pub struct PostgresIdempotencyStore {
    db: Db,
}

impl PostgresIdempotencyStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    async fn fetch(
        tx: &mut Transaction<'_, Postgres>,
        key: &IdempotencyKey,
        for_update: bool,
    ) -> Result<Option<IdempotencyRecord>, IdempotencyError> {
        let sql = format!(
            "SELECT state, result_snapshot, locked_by, lock_expires_at, created_at, updated_at, completed_at \
             FROM idempotency_keys WHERE tenant_id = $1 AND operation = $2 AND idem_key = $3{}",
            if for_update { " FOR UPDATE" } else { "" }
        );
        let row = sqlx::query(&sql)
            .bind(key.tenant_id.as_uuid())
            .bind(&key.operation)
            .bind(&key.key)
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("fetch", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let state: String = row.try_get("state").map_err(|e| map_sqlx_error("decode", e))?;
        Ok(Some(IdempotencyRecord {
            key: key.clone(),
            state: state.parse()?,
            result_snapshot: row.try_get("result_snapshot").map_err(|e| map_sqlx_error("decode", e))?,
            locked_by: row.try_get("locked_by").map_err(|e| map_sqlx_error("decode", e))?,
            lock_expires_at: row.try_get("lock_expires_at").map_err(|e| map_sqlx_error("decode", e))?,
            created_at: row.try_get("created_at").map_err(|e| map_sqlx_error("decode", e))?,
            updated_at: row.try_get("updated_at").map_err(|e| map_sqlx_error("decode", e))?,
            completed_at: row.try_get("completed_at").map_err(|e| map_sqlx_error("decode", e))?,
        }))
    }

    async fn write(tx: &mut Transaction<'_, Postgres>, record: &IdempotencyRecord) -> Result<(), IdempotencyError> {
        sqlx::query(
            r#"
            UPDATE idempotency_keys SET
                state = $4,
                result_snapshot = $5,
                locked_by = $6,
                lock_expires_at = $7,
                updated_at = $8,
                completed_at = $9
            WHERE tenant_id = $1 AND operation = $2 AND idem_key = $3
            "#,
        )
        .bind(record.key.tenant_id.as_uuid())
        .bind(&record.key.operation)
        .bind(&record.key.key)
        .bind(record.state.as_str())
        .bind(record.result_snapshot.as_ref())
        .bind(record.locked_by.as_deref())
        .bind(record.lock_expires_at)
        .bind(record.updated_at)
        .bind(record.completed_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("write", e))?;
        Ok(())
    }

    async fn mutate<T>(
        &self,
        operation: &'static str,
        key: &IdempotencyKey,
        f: impl FnOnce(&mut IdempotencyRecord) -> Result<T, IdempotencyError>,
    ) -> Result<Option<T>, IdempotencyError> {
        let mut tx = self
            .db
            .pool()
            .begin()
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        let Some(mut record) = Self::fetch(&mut tx, key, true).await? else {
            return Ok(None);
        };
        let out = f(&mut record)?;
        Self::write(&mut tx, &record).await?;
        tx.commit().await.map_err(|e| map_sqlx_error(operation, e))?;
        Ok(Some(out))
    }
}

impl IdempotencyStore for PostgresIdempotencyStore {
    #[instrument(skip_all, fields(key = %key, owner = owner), err)]
    fn begin_or_join(
        &self,
        key: &IdempotencyKey,
        owner: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<BeginOutcome, IdempotencyError> {
        self.db.run(async {
            let mut tx = self
                .db
                .pool()
                .begin()
                .await
                .map_err(|e| map_sqlx_error("begin_or_join", e))?;

            let fresh = IdempotencyRecord::processing(key.clone(), owner, ttl, now);
            let inserted = sqlx::query(
                r#"
                INSERT INTO idempotency_keys (
                    tenant_id, operation, idem_key, state, locked_by, lock_expires_at, created_at, updated_at
                )
                VALUES ($1, $2, $3, 'processing', $4, $5, $6, $6)
                ON CONFLICT (tenant_id, operation, idem_key) DO NOTHING
                "#,
            )
            .bind(key.tenant_id.as_uuid())
            .bind(&key.operation)
            .bind(&key.key)
            .bind(owner)
            .bind(fresh.lock_expires_at)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("begin_or_join", e))?;

            let outcome = if inserted.rows_affected() == 1 {
                BeginOutcome::Acquired { recovered: false }
            } else {
                let mut record = Self::fetch(&mut tx, key, true)
                    .await?
                    .ok_or_else(|| IdempotencyError::NotFound(key.to_string()))?;
                let outcome = record.begin(owner, ttl, now);
                if matches!(outcome, BeginOutcome::Acquired { .. }) {
                    Self::write(&mut tx, &record).await?;
                }
                outcome
            };

            tx.commit().await.map_err(|e| map_sqlx_error("begin_or_join", e))?;
            Ok::<_, IdempotencyError>(outcome)
        })
    }

    fn finish(
        &self,
        key: &IdempotencyKey,
        owner: &str,
        result: JsonValue,
        now: DateTime<Utc>,
    ) -> Result<(), IdempotencyError> {
        self.db
            .run(self.mutate("finish", key, |record| record.complete(owner, result, now)))?
            .ok_or_else(|| IdempotencyError::NotFound(key.to_string()))
    }

    fn extend(
        &self,
        key: &IdempotencyKey,
        owner: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, IdempotencyError> {
        let extended = self
            .db
            .run(self.mutate("extend", key, |record| Ok(record.extend(owner, ttl, now))))?;
        Ok(extended.unwrap_or(false))
    }

    fn release(&self, key: &IdempotencyKey, owner: &str, now: DateTime<Utc>) -> Result<bool, IdempotencyError> {
        let released = self
            .db
            .run(self.mutate("release", key, |record| Ok(record.release(owner, now))))?;
        Ok(released.unwrap_or(false))
    }

    fn get(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord>, IdempotencyError> {
        self.db.run(async {
            let mut tx = self
                .db
                .pool()
                .begin()
                .await
                .map_err(|e| map_sqlx_error("get", e))?;
            let record = Self::fetch(&mut tx, key, false).await?;
            tx.commit().await.map_err(|e| map_sqlx_error("get", e))?;
            Ok::<_, IdempotencyError>(record)
        })
    }

    fn cleanup(&self, now: DateTime<Utc>, completed_retention: Duration) -> Result<usize, IdempotencyError> {
        let completed_before = now - crate::jobs::types::chrono_duration(completed_retention);
        let result = self.db.run(async {
            sqlx::query(
                r#"
                DELETE FROM idempotency_keys
                WHERE state = 'failed'
                   OR (state = 'processing' AND (lock_expires_at IS NULL OR lock_expires_at <= $1))
                   OR (state = 'completed' AND completed_at < $2)
                "#,
            )
            .bind(now)
            .bind(completed_before)
            .execute(self.db.pool())
            .await
            .map_err(|e| map_sqlx_error("cleanup", e))
        })?;
        Ok(result.rows_affected() as usize)
    }
}

fn map_sqlx_error(operation: &'static str, err: sqlx::Error) -> IdempotencyError {
    IdempotencyError::Storage(format!("{operation}: {err}"))
}
