//! Idempotency records, the store trait and the in-memory store.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use patchflow_core::{DomainError, DomainResult, TenantId};

use crate::jobs::types::{MAX_KEY_LEN, chrono_duration};

/// `(tenant, operation, key)`; unique per tenant and operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey {
    pub tenant_id: TenantId,
    pub operation: String,
    pub key: String,
}

impl IdempotencyKey {
    pub fn new(tenant_id: TenantId, operation: impl Into<String>, key: impl Into<String>) -> DomainResult<Self> {
        let key = Self {
            tenant_id,
            operation: operation.into(),
            key: key.into(),
        };
        if key.operation.trim().is_empty() {
            return Err(DomainError::validation("idempotency operation must not be empty"));
        }
        if key.key.trim().is_empty() {
            return Err(DomainError::validation("idempotency key must not be empty"));
        }
        if key.key.len() > MAX_KEY_LEN {
            return Err(DomainError::validation(format!(
                "idempotency key longer than {MAX_KEY_LEN} bytes"
            )));
        }
        Ok(key)
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.tenant_id, self.operation, self.key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyState {
    Processing,
    Completed,
    /// Lock released without a result; the next request re-acquires.
    Failed,
}

impl IdempotencyState {
    pub fn as_str(self) -> &'static str {
        match self {
            IdempotencyState::Processing => "processing",
            IdempotencyState::Completed => "completed",
            IdempotencyState::Failed => "failed",
        }
    }
}

impl std::str::FromStr for IdempotencyState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processing" => Ok(IdempotencyState::Processing),
            "completed" => Ok(IdempotencyState::Completed),
            "failed" => Ok(IdempotencyState::Failed),
            other => Err(DomainError::validation(format!("unknown idempotency state: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: IdempotencyKey,
    pub state: IdempotencyState,
    pub result_snapshot: Option<JsonValue>,
    pub locked_by: Option<String>,
    pub lock_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Answer to a `begin_or_join` call.
#[derive(Debug, Clone, PartialEq)]
pub enum BeginOutcome {
    /// Caller won the lock and must `finish` or `release` it.
    Acquired {
        /// An abandoned, released or self-owned lock was taken over.
        recovered: bool,
    },
    /// Already completed; this is the stored result. Do not re-execute.
    Cached(JsonValue),
    /// Another execution holds the lock.
    InFlight { locked_by: String, retry_after: Duration },
}

impl IdempotencyRecord {
    pub fn processing(key: IdempotencyKey, owner: &str, ttl: Duration, now: DateTime<Utc>) -> Self {
        Self {
            key,
            state: IdempotencyState::Processing,
            result_snapshot: None,
            locked_by: Some(owner.to_string()),
            lock_expires_at: Some(now + chrono_duration(ttl)),
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn lock_expired(&self, now: DateTime<Utc>) -> bool {
        self.lock_expires_at.is_none_or(|at| at <= now)
    }

    /// Decide the outcome for `owner`, taking the lock when allowed.
    ///
    /// The owner is re-entrant: a reclaimed job re-enters its own lock
    /// without waiting for the TTL.
    pub fn begin(&mut self, owner: &str, ttl: Duration, now: DateTime<Utc>) -> BeginOutcome {
        match self.state {
            IdempotencyState::Completed => {
                BeginOutcome::Cached(self.result_snapshot.clone().unwrap_or(JsonValue::Null))
            }
            IdempotencyState::Processing
                if !self.lock_expired(now) && self.locked_by.as_deref() != Some(owner) =>
            {
                let retry_after = self
                    .lock_expires_at
                    .and_then(|at| (at - now).to_std().ok())
                    .unwrap_or(Duration::ZERO);
                BeginOutcome::InFlight {
                    locked_by: self.locked_by.clone().unwrap_or_default(),
                    retry_after,
                }
            }
            IdempotencyState::Processing | IdempotencyState::Failed => {
                self.state = IdempotencyState::Processing;
                self.locked_by = Some(owner.to_string());
                self.lock_expires_at = Some(now + chrono_duration(ttl));
                self.updated_at = now;
                BeginOutcome::Acquired { recovered: true }
            }
        }
    }

    fn is_owned_by(&self, owner: &str) -> bool {
        self.state == IdempotencyState::Processing && self.locked_by.as_deref() == Some(owner)
    }

    /// `processing -> completed`, only by the lock owner.
    pub fn complete(&mut self, owner: &str, result: JsonValue, now: DateTime<Utc>) -> Result<(), IdempotencyError> {
        if !self.is_owned_by(owner) {
            return Err(IdempotencyError::NotOwner {
                key: self.key.to_string(),
                owner: owner.to_string(),
            });
        }
        self.state = IdempotencyState::Completed;
        self.result_snapshot = Some(result);
        self.locked_by = None;
        self.lock_expires_at = None;
        self.updated_at = now;
        self.completed_at = Some(now);
        Ok(())
    }

    /// Push the lock expiry to `now + ttl`; false if `owner` no longer holds the lock.
    pub fn extend(&mut self, owner: &str, ttl: Duration, now: DateTime<Utc>) -> bool {
        if !self.is_owned_by(owner) {
            return false;
        }
        self.lock_expires_at = Some(now + chrono_duration(ttl));
        self.updated_at = now;
        true
    }

    /// `processing -> failed`; returns false if `owner` no longer holds the lock.
    pub fn release(&mut self, owner: &str, now: DateTime<Utc>) -> bool {
        if !self.is_owned_by(owner) {
            return false;
        }
        self.state = IdempotencyState::Failed;
        self.locked_by = None;
        self.lock_expires_at = None;
        self.updated_at = now;
        true
    }

    /// Abandoned locks, released records and completed records past retention.
    pub fn is_expired(&self, now: DateTime<Utc>, completed_retention: Duration) -> bool {
        match self.state {
            IdempotencyState::Processing => self.lock_expired(now),
            IdempotencyState::Failed => true,
            IdempotencyState::Completed => self
                .completed_at
                .is_some_and(|at| at + chrono_duration(completed_retention) < now),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum IdempotencyError {
    #[error("{owner} does not hold the lock on {key}")]
    NotOwner { key: String, owner: String },
    #[error("no idempotency record for {0}")]
    NotFound(String),
    #[error(transparent)]
    Validation(#[from] DomainError),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Durable key → single winning execution mapping.
pub trait IdempotencyStore: Send + Sync {
    /// Acquire the lock, return the cached result, or report a duplicate in flight.
    fn begin_or_join(
        &self,
        key: &IdempotencyKey,
        owner: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<BeginOutcome, IdempotencyError>;

    fn finish(
        &self,
        key: &IdempotencyKey,
        owner: &str,
        result: JsonValue,
        now: DateTime<Utc>,
    ) -> Result<(), IdempotencyError>;

    /// Keep a live owner's lock from looking abandoned; called alongside lease heartbeats.
    fn extend(
        &self,
        key: &IdempotencyKey,
        owner: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, IdempotencyError>;

    /// Clear the lock so a legitimate retry can re-acquire.
    fn release(&self, key: &IdempotencyKey, owner: &str, now: DateTime<Utc>) -> Result<bool, IdempotencyError>;

    fn get(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord>, IdempotencyError>;

    /// Remove expired records; returns how many.
    fn cleanup(&self, now: DateTime<Utc>, completed_retention: Duration) -> Result<usize, IdempotencyError>;
}

/// In-memory idempotency store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryIdempotencyStore {
    records: Mutex<HashMap<IdempotencyKey, IdempotencyRecord>>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<IdempotencyKey, IdempotencyRecord>>, IdempotencyError> {
        self.records
            .lock()
            .map_err(|_| IdempotencyError::Storage("idempotency table lock poisoned".to_string()))
    }
}

impl IdempotencyStore for InMemoryIdempotencyStore {
    fn begin_or_join(
        &self,
        key: &IdempotencyKey,
        owner: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<BeginOutcome, IdempotencyError> {
        let mut records = self.lock()?;
        match records.get_mut(key) {
            Some(record) => Ok(record.begin(owner, ttl, now)),
            None => {
                records.insert(key.clone(), IdempotencyRecord::processing(key.clone(), owner, ttl, now));
                Ok(BeginOutcome::Acquired { recovered: false })
            }
        }
    }

    fn finish(
        &self,
        key: &IdempotencyKey,
        owner: &str,
        result: JsonValue,
        now: DateTime<Utc>,
    ) -> Result<(), IdempotencyError> {
        let mut records = self.lock()?;
        let record = records
            .get_mut(key)
            .ok_or_else(|| IdempotencyError::NotFound(key.to_string()))?;
        record.complete(owner, result, now)
    }

    fn extend(
        &self,
        key: &IdempotencyKey,
        owner: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, IdempotencyError> {
        let mut records = self.lock()?;
        Ok(records.get_mut(key).is_some_and(|r| r.extend(owner, ttl, now)))
    }

    fn release(&self, key: &IdempotencyKey, owner: &str, now: DateTime<Utc>) -> Result<bool, IdempotencyError> {
        let mut records = self.lock()?;
        Ok(records.get_mut(key).is_some_and(|r| r.release(owner, now)))
    }

    fn get(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord>, IdempotencyError> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn cleanup(&self, now: DateTime<Utc>, completed_retention: Duration) -> Result<usize, IdempotencyError> {
        let mut records = self.lock()?;
        let before = records.len();
        records.retain(|_, r| !r.is_expired(now, completed_retention));
        Ok(before - records.len())
    }
}

impl<S: IdempotencyStore + ?Sized> IdempotencyStore for Arc<S> {
    fn begin_or_join(
        &self,
        key: &IdempotencyKey,
        owner: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<BeginOutcome, IdempotencyError> {
        (**self).begin_or_join(key, owner, ttl, now)
    }

    fn finish(
        &self,
        key: &IdempotencyKey,
        owner: &str,
        result: JsonValue,
        now: DateTime<Utc>,
    ) -> Result<(), IdempotencyError> {
        (**self).finish(key, owner, result, now)
    }

    fn extend(
        &self,
        key: &IdempotencyKey,
        owner: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, IdempotencyError> {
        (**self).extend(key, owner, ttl, now)
    }

    fn release(&self, key: &IdempotencyKey, owner: &str, now: DateTime<Utc>) -> Result<bool, IdempotencyError> {
        (**self).release(key, owner, now)
    }

    fn get(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord>, IdempotencyError> {
        (**self).get(key)
    }

    fn cleanup(&self, now: DateTime<Utc>, completed_retention: Duration) -> Result<usize, IdempotencyError> {
        (**self).cleanup(now, completed_retention)
    }
}
