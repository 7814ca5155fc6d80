//! Postgres-backed admission controller.
//!
//! Each operation locks the tenant row `FOR UPDATE` (creating it on first
//! use), loads the holder set, applies the shared state transition and writes
//! the row and holder changes in the same transaction.

use chrono::{DateTime, Utc};
use sqlx::{Postgres, Row, Transaction};
use tracing::instrument;

use patchflow_core::{JobId, TenantId};

use super::store::AdmissionController;
use super::types::{
    Admission, AdmissionError, AdmissionPolicy, PlanTier, TenantConcurrencyState,
};
use crate::db::{Db, to_u32};

#[derive(Debug, Clone)]
pub struct PostgresAdmissionController {
    db: Db,
    policy: AdmissionPolicy,
}

impl PostgresAdmissionController {
    pub fn new(db: Db, policy: AdmissionPolicy) -> Self {
        Self { db, policy }
    }

    async fn lock_tenant(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        tenant_id: TenantId,
    ) -> Result<TenantConcurrencyState, AdmissionError> {
        let default = TenantConcurrencyState::new(tenant_id, &self.policy);
        sqlx::query(
            r#"
            INSERT INTO tenant_concurrency (tenant_id, plan, plan_limit, in_flight_count, status)
            VALUES ($1, $2, $3, 0, 'active')
            ON CONFLICT (tenant_id) DO NOTHING
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(default.plan.as_str())
        .bind(default.plan_limit as i32)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("lock_tenant", e))?;

        let row = sqlx::query(
            "SELECT plan, plan_limit, status, status_reason, status_changed_at \
             FROM tenant_concurrency WHERE tenant_id = $1 FOR UPDATE",
        )
        .bind(tenant_id.as_uuid())
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("lock_tenant", e))?;

        let holders: Vec<uuid::Uuid> =
            sqlx::query_scalar("SELECT holder_id FROM tenant_holders WHERE tenant_id = $1")
                .bind(tenant_id.as_uuid())
                .fetch_all(&mut **tx)
                .await
                .map_err(|e| map_sqlx_error("lock_tenant", e))?;

        let plan: String = row.try_get("plan").map_err(|e| map_sqlx_error("decode", e))?;
        let status: String = row.try_get("status").map_err(|e| map_sqlx_error("decode", e))?;
        let plan_limit: i32 = row.try_get("plan_limit").map_err(|e| map_sqlx_error("decode", e))?;
        let holders: std::collections::BTreeSet<JobId> = holders.into_iter().map(JobId::from).collect();

        Ok(TenantConcurrencyState {
            tenant_id,
            plan: plan.parse()?,
            plan_limit: to_u32(plan_limit),
            in_flight_count: holders.len() as u32,
            status: status.parse()?,
            status_reason: row.try_get("status_reason").map_err(|e| map_sqlx_error("decode", e))?,
            status_changed_at: row
                .try_get("status_changed_at")
                .map_err(|e| map_sqlx_error("decode", e))?,
            holders,
        })
    }

    async fn write_tenant(
        tx: &mut Transaction<'_, Postgres>,
        state: &TenantConcurrencyState,
    ) -> Result<(), AdmissionError> {
        sqlx::query(
            r#"
            UPDATE tenant_concurrency SET
                plan = $2,
                plan_limit = $3,
                in_flight_count = $4,
                status = $5,
                status_reason = $6,
                status_changed_at = $7
            WHERE tenant_id = $1
            "#,
        )
        .bind(state.tenant_id.as_uuid())
        .bind(state.plan.as_str())
        .bind(state.plan_limit as i32)
        .bind(state.in_flight_count as i32)
        .bind(state.status.as_str())
        .bind(state.status_reason.as_deref())
        .bind(state.status_changed_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("write_tenant", e))?;
        Ok(())
    }

    /// Lock, mutate, persist. `f` returns the caller's value.
    async fn with_tenant<T>(
        &self,
        operation: &'static str,
        tenant_id: TenantId,
        f: impl FnOnce(&mut TenantConcurrencyState, &AdmissionPolicy) -> T,
    ) -> Result<(T, TenantConcurrencyState), AdmissionError> {
        let mut tx = self
            .db
            .pool()
            .begin()
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        let mut state = self.lock_tenant(&mut tx, tenant_id).await?;
        let out = f(&mut state, &self.policy);
        Self::write_tenant(&mut tx, &state).await?;
        tx.commit().await.map_err(|e| map_sqlx_error(operation, e))?;
        Ok((out, state))
    }
}

impl AdmissionController for PostgresAdmissionController {
    #[instrument(skip_all, fields(tenant_id = %tenant_id, holder = %holder), err)]
    fn try_admit(&self, tenant_id: TenantId, holder: JobId) -> Result<Admission, AdmissionError> {
        self.db.run(async {
            let mut tx = self
                .db
                .pool()
                .begin()
                .await
                .map_err(|e| map_sqlx_error("try_admit", e))?;
            let mut state = self.lock_tenant(&mut tx, tenant_id).await?;
            let was_holder = state.holders.contains(&holder);
            let admission = state.admit(holder, &self.policy);

            if admission.is_granted() && !was_holder {
                sqlx::query(
                    "INSERT INTO tenant_holders (tenant_id, holder_id, admitted_at) VALUES ($1, $2, now())",
                )
                .bind(tenant_id.as_uuid())
                .bind(holder.as_uuid())
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("try_admit", e))?;
                Self::write_tenant(&mut tx, &state).await?;
            }

            tx.commit().await.map_err(|e| map_sqlx_error("try_admit", e))?;
            Ok::<_, AdmissionError>(admission)
        })
    }

    #[instrument(skip_all, fields(tenant_id = %tenant_id, holder = %holder), err)]
    fn release(&self, tenant_id: TenantId, holder: JobId) -> Result<bool, AdmissionError> {
        self.db.run(async {
            let mut tx = self
                .db
                .pool()
                .begin()
                .await
                .map_err(|e| map_sqlx_error("release", e))?;
            let mut state = self.lock_tenant(&mut tx, tenant_id).await?;
            let released = state.release(holder);
            if released {
                sqlx::query("DELETE FROM tenant_holders WHERE tenant_id = $1 AND holder_id = $2")
                    .bind(tenant_id.as_uuid())
                    .bind(holder.as_uuid())
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| map_sqlx_error("release", e))?;
                Self::write_tenant(&mut tx, &state).await?;
            }
            tx.commit().await.map_err(|e| map_sqlx_error("release", e))?;
            Ok::<_, AdmissionError>(released)
        })
    }

    fn pause(&self, tenant_id: TenantId, reason: &str, now: DateTime<Utc>) -> Result<bool, AdmissionError> {
        let (changed, _) = self.db.run(self.with_tenant("pause", tenant_id, |state, _| {
            state.transition(super::TenantStatus::Paused, Some(reason), now)
        }))?;
        Ok(changed)
    }

    fn resume(&self, tenant_id: TenantId, now: DateTime<Utc>) -> Result<bool, AdmissionError> {
        let (changed, _) = self.db.run(self.with_tenant("resume", tenant_id, |state, _| {
            state.transition(super::TenantStatus::Active, None, now)
        }))?;
        Ok(changed)
    }

    fn suspend(&self, tenant_id: TenantId, reason: &str, now: DateTime<Utc>) -> Result<bool, AdmissionError> {
        let (changed, _) = self.db.run(self.with_tenant("suspend", tenant_id, |state, _| {
            state.transition(super::TenantStatus::Suspended, Some(reason), now)
        }))?;
        Ok(changed)
    }

    fn set_plan(&self, tenant_id: TenantId, plan: PlanTier) -> Result<TenantConcurrencyState, AdmissionError> {
        let ((), state) = self.db.run(self.with_tenant("set_plan", tenant_id, |state, policy| {
            state.set_plan(plan, policy)
        }))?;
        Ok(state)
    }

    fn state(&self, tenant_id: TenantId) -> Result<TenantConcurrencyState, AdmissionError> {
        let ((), state) = self.db.run(self.with_tenant("state", tenant_id, |_, _| ()))?;
        Ok(state)
    }
}

fn map_sqlx_error(operation: &'static str, err: sqlx::Error) -> AdmissionError {
    AdmissionError::Storage(format!("{operation}: {err}"))
}
