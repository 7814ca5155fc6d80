//! Run persistence with optimistic concurrency.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use patchflow_core::{ExpectedVersion, RunId, TenantId};

use super::run::RunRecord;

#[derive(Debug, Clone, thiserror::Error)]
pub enum RunStoreError {
    #[error("run not found: {0}")]
    NotFound(RunId),

    #[error("run belongs to a different tenant")]
    TenantIsolation,

    #[error("run already exists: {0}")]
    AlreadyExists(RunId),

    #[error("version conflict on run {run_id}: expected {expected:?}, actual {actual}")]
    Conflict {
        run_id: RunId,
        expected: ExpectedVersion,
        actual: u64,
    },

    #[error("storage error: {0}")]
    Storage(String),
}

pub trait RunStore: Send + Sync {
    /// Persist a new run at version 1.
    fn create(&self, run: RunRecord) -> Result<RunRecord, RunStoreError>;

    fn get(&self, tenant_id: TenantId, run_id: RunId) -> Result<Option<RunRecord>, RunStoreError>;

    /// Conditional write; returns the stored copy with its new version.
    fn save(&self, run: &RunRecord, expected: ExpectedVersion) -> Result<RunRecord, RunStoreError>;

    /// Delete completed and failed runs last updated before `older_than`.
    fn cleanup(&self, older_than: DateTime<Utc>) -> Result<usize, RunStoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryRunStore {
    runs: RwLock<HashMap<RunId, RunRecord>>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> RunStoreError {
    RunStoreError::Storage("run table lock poisoned".to_string())
}

impl RunStore for InMemoryRunStore {
    fn create(&self, mut run: RunRecord) -> Result<RunRecord, RunStoreError> {
        let mut runs = self.runs.write().map_err(poisoned)?;
        if runs.contains_key(&run.run_id) {
            return Err(RunStoreError::AlreadyExists(run.run_id));
        }
        run.version = 1;
        runs.insert(run.run_id, run.clone());
        Ok(run)
    }

    fn get(&self, tenant_id: TenantId, run_id: RunId) -> Result<Option<RunRecord>, RunStoreError> {
        let runs = self.runs.read().map_err(poisoned)?;
        match runs.get(&run_id) {
            Some(run) if run.tenant_id != tenant_id => Err(RunStoreError::TenantIsolation),
            other => Ok(other.cloned()),
        }
    }

    fn save(&self, run: &RunRecord, expected: ExpectedVersion) -> Result<RunRecord, RunStoreError> {
        let mut runs = self.runs.write().map_err(poisoned)?;
        let stored = runs
            .get_mut(&run.run_id)
            .ok_or(RunStoreError::NotFound(run.run_id))?;
        if stored.tenant_id != run.tenant_id {
            return Err(RunStoreError::TenantIsolation);
        }
        if !expected.matches(stored.version) {
            return Err(RunStoreError::Conflict {
                run_id: run.run_id,
                expected,
                actual: stored.version,
            });
        }
        let mut next = run.clone();
        next.version = stored.version + 1;
        *stored = next.clone();
        Ok(next)
    }

    fn cleanup(&self, older_than: DateTime<Utc>) -> Result<usize, RunStoreError> {
        let mut runs = self.runs.write().map_err(poisoned)?;
        let before = runs.len();
        runs.retain(|_, r| !(r.status.is_terminal() && r.updated_at < older_than));
        Ok(before - runs.len())
    }
}

impl<S: RunStore + ?Sized> RunStore for Arc<S> {
    fn create(&self, run: RunRecord) -> Result<RunRecord, RunStoreError> {
        (**self).create(run)
    }

    fn get(&self, tenant_id: TenantId, run_id: RunId) -> Result<Option<RunRecord>, RunStoreError> {
        (**self).get(tenant_id, run_id)
    }

    fn save(&self, run: &RunRecord, expected: ExpectedVersion) -> Result<RunRecord, RunStoreError> {
        (**self).save(run, expected)
    }

    fn cleanup(&self, older_than: DateTime<Utc>) -> Result<usize, RunStoreError> {
        (**self).cleanup(older_than)
    }
}
