//! Postgres-backed run store.
//!
//! The full record lives in a JSONB column; `status`, `version` and the
//! timestamps are mirrored into columns for filtering and the version check.

use chrono::{DateTime, Utc};
use sqlx::Row;
use tracing::instrument;

use patchflow_core::{ExpectedVersion, RunId, TenantId};

use super::run::RunRecord;
use super::store::{RunStore, RunStoreError};
use crate::db::{Db, is_unique_violation};

#[derive(Debug, Clone)]
pub struct PostgresRunStore {
    db: Db,
}

impl PostgresRunStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

fn encode(run: &RunRecord) -> Result<serde_json::Value, RunStoreError> {
    serde_json::to_value(run).map_err(|e| RunStoreError::Storage(format!("encode run: {e}")))
}

fn decode(row: &sqlx::postgres::PgRow) -> Result<RunRecord, RunStoreError> {
    let record: serde_json::Value = row.try_get("record").map_err(|e| map_sqlx_error("decode", e))?;
    let version: i64 = row.try_get("version").map_err(|e| map_sqlx_error("decode", e))?;
    let mut run: RunRecord =
        serde_json::from_value(record).map_err(|e| RunStoreError::Storage(format!("decode run: {e}")))?;
    run.version = u64::try_from(version).unwrap_or(0);
    Ok(run)
}

impl RunStore for PostgresRunStore {
    #[instrument(skip_all, fields(run_id = %run.run_id, tenant_id = %run.tenant_id), err)]
    fn create(&self, mut run: RunRecord) -> Result<RunRecord, RunStoreError> {
        run.version = 1;
        let record = encode(&run)?;
        self.db.run(async {
            sqlx::query(
                r#"
                INSERT INTO runs (run_id, tenant_id, status, version, record, created_at, updated_at)
                VALUES ($1, $2, $3, 1, $4, $5, $6)
                "#,
            )
            .bind(run.run_id.as_uuid())
            .bind(run.tenant_id.as_uuid())
            .bind(run.status.as_str())
            .bind(&record)
            .bind(run.created_at)
            .bind(run.updated_at)
            .execute(self.db.pool())
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    RunStoreError::AlreadyExists(run.run_id)
                } else {
                    map_sqlx_error("create", e)
                }
            })
        })?;
        Ok(run)
    }

    #[instrument(skip(self), err)]
    fn get(&self, tenant_id: TenantId, run_id: RunId) -> Result<Option<RunRecord>, RunStoreError> {
        let row = self.db.run(async {
            sqlx::query("SELECT tenant_id, version, record FROM runs WHERE run_id = $1")
                .bind(run_id.as_uuid())
                .fetch_optional(self.db.pool())
                .await
                .map_err(|e| map_sqlx_error("get", e))
        })?;
        let Some(row) = row else {
            return Ok(None);
        };
        let owner: uuid::Uuid = row.try_get("tenant_id").map_err(|e| map_sqlx_error("decode", e))?;
        if TenantId::from(owner) != tenant_id {
            return Err(RunStoreError::TenantIsolation);
        }
        decode(&row).map(Some)
    }

    #[instrument(skip_all, fields(run_id = %run.run_id, expected = ?expected), err)]
    fn save(&self, run: &RunRecord, expected: ExpectedVersion) -> Result<RunRecord, RunStoreError> {
        self.db.run(async {
            let mut tx = self.db.pool().begin().await.map_err(|e| map_sqlx_error("save", e))?;

            let row = sqlx::query("SELECT tenant_id, version FROM runs WHERE run_id = $1 FOR UPDATE")
                .bind(run.run_id.as_uuid())
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("save", e))?
                .ok_or(RunStoreError::NotFound(run.run_id))?;
            let owner: uuid::Uuid = row.try_get("tenant_id").map_err(|e| map_sqlx_error("decode", e))?;
            let actual: i64 = row.try_get("version").map_err(|e| map_sqlx_error("decode", e))?;
            let actual = u64::try_from(actual).unwrap_or(0);

            if TenantId::from(owner) != run.tenant_id {
                return Err(RunStoreError::TenantIsolation);
            }
            if !expected.matches(actual) {
                return Err(RunStoreError::Conflict {
                    run_id: run.run_id,
                    expected,
                    actual,
                });
            }

            let mut next = run.clone();
            next.version = actual + 1;
            let record = encode(&next)?;
            sqlx::query(
                "UPDATE runs SET status = $2, version = $3, record = $4, updated_at = $5 WHERE run_id = $1",
            )
            .bind(next.run_id.as_uuid())
            .bind(next.status.as_str())
            .bind(next.version as i64)
            .bind(&record)
            .bind(next.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("save", e))?;

            tx.commit().await.map_err(|e| map_sqlx_error("save", e))?;
            Ok::<_, RunStoreError>(next)
        })
    }

    #[instrument(skip(self), err)]
    fn cleanup(&self, older_than: DateTime<Utc>) -> Result<usize, RunStoreError> {
        let result = self.db.run(async {
            sqlx::query("DELETE FROM runs WHERE status IN ('completed', 'failed') AND updated_at < $1")
                .bind(older_than)
                .execute(self.db.pool())
                .await
                .map_err(|e| map_sqlx_error("cleanup", e))
        })?;
        Ok(result.rows_affected() as usize)
    }
}

fn map_sqlx_error(operation: &'static str, err: sqlx::Error) -> RunStoreError {
    RunStoreError::Storage(format!("{operation}: {err}"))
}
