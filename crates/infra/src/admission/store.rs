//! Admission controller trait and the in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use patchflow_core::{JobId, TenantId};

use super::types::{
    Admission, AdmissionError, AdmissionPolicy, PlanTier, TenantConcurrencyState, TenantStatus,
};

/// Per-tenant concurrency admission.
///
/// The check and the increment of `try_admit` happen in one critical section,
/// so `in_flight_count <= plan_limit` holds under any interleaving.
pub trait AdmissionController: Send + Sync {
    fn try_admit(&self, tenant_id: TenantId, holder: JobId) -> Result<Admission, AdmissionError>;

    /// Returns whether `holder` held a slot.
    fn release(&self, tenant_id: TenantId, holder: JobId) -> Result<bool, AdmissionError>;

    /// Returns whether the status changed.
    fn pause(&self, tenant_id: TenantId, reason: &str, now: DateTime<Utc>) -> Result<bool, AdmissionError>;

    fn resume(&self, tenant_id: TenantId, now: DateTime<Utc>) -> Result<bool, AdmissionError>;

    fn suspend(&self, tenant_id: TenantId, reason: &str, now: DateTime<Utc>) -> Result<bool, AdmissionError>;

    fn set_plan(&self, tenant_id: TenantId, plan: PlanTier) -> Result<TenantConcurrencyState, AdmissionError>;

    fn state(&self, tenant_id: TenantId) -> Result<TenantConcurrencyState, AdmissionError>;
}

/// Single-process admission controller.
#[derive(Debug)]
pub struct InMemoryAdmissionController {
    policy: AdmissionPolicy,
    tenants: Mutex<HashMap<TenantId, TenantConcurrencyState>>,
}

impl InMemoryAdmissionController {
    pub fn new(policy: AdmissionPolicy) -> Self {
        Self {
            policy,
            tenants: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &AdmissionPolicy {
        &self.policy
    }

    fn with_tenant<T>(
        &self,
        tenant_id: TenantId,
        f: impl FnOnce(&mut TenantConcurrencyState, &AdmissionPolicy) -> T,
    ) -> Result<T, AdmissionError> {
        let mut tenants = self.lock()?;
        let state = tenants
            .entry(tenant_id)
            .or_insert_with(|| TenantConcurrencyState::new(tenant_id, &self.policy));
        Ok(f(state, &self.policy))
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<TenantId, TenantConcurrencyState>>, AdmissionError> {
        self.tenants
            .lock()
            .map_err(|_| AdmissionError::Storage("tenant table lock poisoned".to_string()))
    }
}

impl Default for InMemoryAdmissionController {
    fn default() -> Self {
        Self::new(AdmissionPolicy::default())
    }
}

impl AdmissionController for InMemoryAdmissionController {
    fn try_admit(&self, tenant_id: TenantId, holder: JobId) -> Result<Admission, AdmissionError> {
        self.with_tenant(tenant_id, |state, policy| state.admit(holder, policy))
    }

    fn release(&self, tenant_id: TenantId, holder: JobId) -> Result<bool, AdmissionError> {
        let mut tenants = self.lock()?;
        Ok(tenants.get_mut(&tenant_id).is_some_and(|s| s.release(holder)))
    }

    fn pause(&self, tenant_id: TenantId, reason: &str, now: DateTime<Utc>) -> Result<bool, AdmissionError> {
        self.with_tenant(tenant_id, |state, _| state.transition(TenantStatus::Paused, Some(reason), now))
    }

    fn resume(&self, tenant_id: TenantId, now: DateTime<Utc>) -> Result<bool, AdmissionError> {
        self.with_tenant(tenant_id, |state, _| state.transition(TenantStatus::Active, None, now))
    }

    fn suspend(&self, tenant_id: TenantId, reason: &str, now: DateTime<Utc>) -> Result<bool, AdmissionError> {
        self.with_tenant(tenant_id, |state, _| {
            state.transition(TenantStatus::Suspended, Some(reason), now)
        })
    }

    fn set_plan(&self, tenant_id: TenantId, plan: PlanTier) -> Result<TenantConcurrencyState, AdmissionError> {
        self.with_tenant(tenant_id, |state, policy| {
            state.set_plan(plan, policy);
            state.clone()
        })
    }

    fn state(&self, tenant_id: TenantId) -> Result<TenantConcurrencyState, AdmissionError> {
        let tenants = self.lock()?;
        Ok(tenants
            .get(&tenant_id)
            .cloned()
            .unwrap_or_else(|| TenantConcurrencyState::new(tenant_id, &self.policy)))
    }
}

impl<C: AdmissionController + ?Sized> AdmissionController for Arc<C> {
    fn try_admit(&self, tenant_id: TenantId, holder: JobId) -> Result<Admission, AdmissionError> {
        (**self).try_admit(tenant_id, holder)
    }

    fn release(&self, tenant_id: TenantId, holder: JobId) -> Result<bool, AdmissionError> {
        (**self).release(tenant_id, holder)
    }

    fn pause(&self, tenant_id: TenantId, reason: &str, now: DateTime<Utc>) -> Result<bool, AdmissionError> {
        (**self).pause(tenant_id, reason, now)
    }

    fn resume(&self, tenant_id: TenantId, now: DateTime<Utc>) -> Result<bool, AdmissionError> {
        (**self).resume(tenant_id, now)
    }

    fn suspend(&self, tenant_id: TenantId, reason: &str, now: DateTime<Utc>) -> Result<bool, AdmissionError> {
        (**self).suspend(tenant_id, reason, now)
    }

    fn set_plan(&self, tenant_id: TenantId, plan: PlanTier) -> Result<TenantConcurrencyState, AdmissionError> {
        (**self).set_plan(tenant_id, plan)
    }

    fn state(&self, tenant_id: TenantId) -> Result<TenantConcurrencyState, AdmissionError> {
        (**self).state(tenant_id)
    }
}
