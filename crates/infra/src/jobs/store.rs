//! Job storage abstraction and the in-memory implementation.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use patchflow_core::{DomainError, ErrorKind, JobId, TenantId};

use super::types::{
    Claimed, FailOutcome, HeartbeatOutcome, JobEnvelope, JobError, JobRecord, JobStatus, WorkerId,
};
use crate::resilience::RetryPolicy;

/// Durable job store.
///
/// Every mutation takes an explicit `now` so lease and delay arithmetic is
/// deterministic under test. Operations that act on a claimed job take the
/// caller's [`WorkerId`] and fail with [`JobStoreError::LostLease`] when the
/// job has been taken over.
pub trait JobStore: Send + Sync {
    /// Validate and persist a new job as `pending`.
    fn enqueue(&self, envelope: JobEnvelope, now: DateTime<Utc>) -> Result<JobId, JobStoreError>;

    /// Get a job by ID, scoped to a tenant.
    fn get(&self, tenant_id: TenantId, job_id: JobId) -> Result<Option<JobRecord>, JobStoreError>;

    /// Atomically lease one eligible job.
    ///
    /// Eligible: `pending` with `delay_until <= now`, or `claimed`/`running`
    /// with a lapsed lease, and first in line for its ordering key. Candidates
    /// past their deadline are moved to `failed` instead. Order: priority
    /// (high first), ordering key, enqueue sequence.
    fn claim(
        &self,
        worker: &WorkerId,
        lease: Duration,
        scope: Option<TenantId>,
        now: DateTime<Utc>,
    ) -> Result<Option<Claimed>, JobStoreError>;

    /// `claimed -> running`.
    fn start(&self, job_id: JobId, worker: &WorkerId, now: DateTime<Utc>) -> Result<JobRecord, JobStoreError>;

    /// Extend the lease held by `worker`.
    fn heartbeat(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<HeartbeatOutcome, JobStoreError>;

    fn complete(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        result: JsonValue,
        now: DateTime<Utc>,
    ) -> Result<JobRecord, JobStoreError>;

    /// Record a failed attempt.
    ///
    /// With `retry` and budget left the job returns to `pending` with the next
    /// attempt number and a backoff delay (the error's `retry_after_ms` wins).
    /// Otherwise it is dead-lettered. Deadline errors go to `failed`.
    fn fail(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        error: JobError,
        retry: bool,
        now: DateTime<Utc>,
    ) -> Result<FailOutcome, JobStoreError>;

    /// Return a leased job to `pending` until `until` without consuming an attempt.
    fn defer(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<JobRecord, JobStoreError>;

    /// Move a non-terminal job to `failed` with a deadline error.
    fn expire(&self, job_id: JobId, now: DateTime<Utc>) -> Result<JobRecord, JobStoreError>;

    /// List jobs by status (all statuses when `None`), oldest first.
    fn list_by_status(
        &self,
        tenant_id: TenantId,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<JobRecord>, JobStoreError>;

    /// Dead-lettered jobs with their full attempt history.
    fn list_dead_letters(&self, tenant_id: TenantId, limit: usize) -> Result<Vec<JobRecord>, JobStoreError> {
        self.list_by_status(tenant_id, Some(JobStatus::DeadLetter), limit)
    }

    /// Explicit re-drive of a dead-lettered job back to `pending` (attempt reset, history kept).
    fn redrive(&self, tenant_id: TenantId, job_id: JobId, now: DateTime<Utc>) -> Result<JobRecord, JobStoreError>;

    /// Delete `completed`/`failed` records that finished before `older_than`.
    /// Dead letters stay until re-driven.
    fn cleanup(&self, older_than: DateTime<Utc>) -> Result<usize, JobStoreError>;

    /// Counts per status, optionally for one tenant.
    fn stats(&self, tenant_id: Option<TenantId>, now: DateTime<Utc>) -> Result<JobStats, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("tenant isolation violation")]
    TenantIsolation,
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("lease on job {0} is no longer held by this worker")]
    LostLease(JobId),
    #[error("job {job_id} is {status}, cannot {action}")]
    InvalidTransition {
        job_id: JobId,
        status: JobStatus,
        action: &'static str,
    },
    #[error(transparent)]
    Validation(#[from] DomainError),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Job statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub claimed: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub dead_letter: usize,
    /// Earliest moment a currently due pending job became deliverable.
    pub oldest_due_at: Option<DateTime<Utc>>,
}

impl JobStats {
    pub fn add(&mut self, status: JobStatus, count: usize) {
        let slot = match status {
            JobStatus::Pending => &mut self.pending,
            JobStatus::Claimed => &mut self.claimed,
            JobStatus::Running => &mut self.running,
            JobStatus::Completed => &mut self.completed,
            JobStatus::Failed => &mut self.failed,
            JobStatus::DeadLetter => &mut self.dead_letter,
        };
        *slot += count;
    }

    pub fn oldest_undelivered_age(&self, now: DateTime<Utc>) -> Duration {
        self.oldest_due_at
            .and_then(|at| (now - at).to_std().ok())
            .unwrap_or(Duration::ZERO)
    }
}

/// Apply a failure to a record according to `policy` and the retry flag.
pub(crate) fn apply_failure(
    job: &mut JobRecord,
    error: JobError,
    retry: bool,
    policy: &RetryPolicy,
    now: DateTime<Utc>,
) -> FailOutcome {
    if error.kind == ErrorKind::DeadlineExceeded {
        job.envelope.previous_attempts.push(super::types::AttemptRecord {
            attempt_number: job.envelope.attempt,
            failed_at: now,
            error_kind: error.kind,
            error_message: error.message.clone(),
        });
        job.mark_expired(now);
        job.last_error = Some(error);
        return FailOutcome::Failed;
    }

    let attempt = job.envelope.attempt;
    if retry && attempt < job.envelope.max_retries {
        let delay = policy.delay_with_hint(attempt, error.retry_after());
        job.mark_failed(error, Some(delay), now);
        FailOutcome::Retrying {
            next_attempt: job.envelope.attempt,
            delay_until: job.envelope.delay_until.unwrap_or(now),
        }
    } else {
        job.mark_failed(error, None, now);
        FailOutcome::DeadLettered
    }
}

/// Earliest moment a pending job became due.
pub(crate) fn due_since(job: &JobRecord) -> DateTime<Utc> {
    job.envelope.delay_until.unwrap_or(job.envelope.created_at)
}

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<JobId, JobRecord>,
    next_seq: u64,
}

/// In-memory job store for tests/dev.
///
/// A single write lock around the whole table makes `claim` trivially exclusive.
#[derive(Debug)]
pub struct InMemoryJobStore {
    inner: RwLock<Inner>,
    retry_policy: RetryPolicy,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            retry_policy: RetryPolicy::default(),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Backoff used when re-enqueuing failed jobs.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>, JobStoreError> {
        self.inner
            .read()
            .map_err(|_| JobStoreError::Storage("job table lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>, JobStoreError> {
        self.inner
            .write()
            .map_err(|_| JobStoreError::Storage("job table lock poisoned".to_string()))
    }

    /// Run `f` on a job currently leased by `worker`.
    fn with_leased<T>(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        f: impl FnOnce(&mut JobRecord) -> T,
    ) -> Result<T, JobStoreError> {
        let mut inner = self.write()?;
        let job = inner.jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        if !job.is_held_by(worker) {
            return Err(JobStoreError::LostLease(job_id));
        }
        Ok(f(job))
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl JobStore for InMemoryJobStore {
    fn enqueue(&self, envelope: JobEnvelope, now: DateTime<Utc>) -> Result<JobId, JobStoreError> {
        envelope.validate()?;
        let mut inner = self.write()?;
        let id = envelope.job_id;
        if inner.jobs.contains_key(&id) {
            return Err(JobStoreError::AlreadyExists(id));
        }
        inner.next_seq += 1;
        let seq = inner.next_seq;
        inner.jobs.insert(id, JobRecord::new(envelope, seq, now));
        Ok(id)
    }

    fn get(&self, tenant_id: TenantId, job_id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
        let inner = self.read()?;
        match inner.jobs.get(&job_id) {
            Some(job) if job.tenant_id() == tenant_id => Ok(Some(job.clone())),
            Some(_) => Err(JobStoreError::TenantIsolation),
            None => Ok(None),
        }
    }

    fn claim(
        &self,
        worker: &WorkerId,
        lease: Duration,
        scope: Option<TenantId>,
        now: DateTime<Utc>,
    ) -> Result<Option<Claimed>, JobStoreError> {
        let mut inner = self.write()?;
        let in_scope = |j: &JobRecord| scope.is_none_or(|t| j.tenant_id() == t);

        let expired: Vec<JobId> = inner
            .jobs
            .values()
            .filter(|j| in_scope(j) && j.is_claimable(now) && j.envelope.is_past_deadline(now))
            .map(JobRecord::id)
            .collect();
        for id in expired {
            if let Some(job) = inner.jobs.get_mut(&id) {
                warn!(job_id = %id, tenant_id = %job.tenant_id(), "deadline passed before claim");
                job.mark_expired(now);
            }
        }

        // Head of line per (tenant, ordering key): the lowest non-terminal seq.
        let mut heads: HashMap<(TenantId, String), u64> = HashMap::new();
        for job in inner.jobs.values() {
            if job.status.is_terminal() {
                continue;
            }
            if let Some(key) = &job.envelope.ordering_key {
                heads
                    .entry((job.tenant_id(), key.clone()))
                    .and_modify(|seq| *seq = (*seq).min(job.seq))
                    .or_insert(job.seq);
            }
        }

        let candidate = inner
            .jobs
            .values()
            .filter(|j| in_scope(j) && j.is_claimable(now))
            .filter(|j| match &j.envelope.ordering_key {
                Some(key) => heads.get(&(j.tenant_id(), key.clone())) == Some(&j.seq),
                None => true,
            })
            .min_by_key(|j| (Reverse(j.envelope.priority), j.envelope.ordering_key.clone(), j.seq))
            .map(JobRecord::id);

        let Some(id) = candidate else {
            return Ok(None);
        };
        let job = inner.jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;
        let reclaimed = job.mark_claimed(worker, lease, now);
        debug!(job_id = %id, worker = %worker, reclaimed, attempt = job.envelope.attempt, "claimed job");
        Ok(Some(Claimed {
            job: job.clone(),
            reclaimed,
        }))
    }

    fn start(&self, job_id: JobId, worker: &WorkerId, now: DateTime<Utc>) -> Result<JobRecord, JobStoreError> {
        self.with_leased(job_id, worker, |job| {
            job.mark_running(now);
            job.clone()
        })
    }

    fn heartbeat(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<HeartbeatOutcome, JobStoreError> {
        match self.with_leased(job_id, worker, |job| {
            job.extend_lease(lease, now);
            job.lease_expires_at
        }) {
            Ok(Some(lease_expires_at)) => Ok(HeartbeatOutcome::Extended { lease_expires_at }),
            Ok(None) | Err(JobStoreError::LostLease(_)) => Ok(HeartbeatOutcome::LostLease),
            Err(e) => Err(e),
        }
    }

    fn complete(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        result: JsonValue,
        now: DateTime<Utc>,
    ) -> Result<JobRecord, JobStoreError> {
        self.with_leased(job_id, worker, |job| {
            job.mark_completed(result, now);
            job.clone()
        })
    }

    fn fail(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        error: JobError,
        retry: bool,
        now: DateTime<Utc>,
    ) -> Result<FailOutcome, JobStoreError> {
        let policy = self.retry_policy;
        self.with_leased(job_id, worker, |job| apply_failure(job, error, retry, &policy, now))
    }

    fn defer(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<JobRecord, JobStoreError> {
        self.with_leased(job_id, worker, |job| {
            job.mark_deferred(until, now);
            job.clone()
        })
    }

    fn expire(&self, job_id: JobId, now: DateTime<Utc>) -> Result<JobRecord, JobStoreError> {
        let mut inner = self.write()?;
        let job = inner.jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        if job.status.is_terminal() {
            return Err(JobStoreError::InvalidTransition {
                job_id,
                status: job.status,
                action: "expire",
            });
        }
        job.mark_expired(now);
        Ok(job.clone())
    }

    fn list_by_status(
        &self,
        tenant_id: TenantId,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<JobRecord>, JobStoreError> {
        let inner = self.read()?;
        let mut result: Vec<_> = inner
            .jobs
            .values()
            .filter(|j| j.tenant_id() == tenant_id && status.is_none_or(|s| j.status == s))
            .cloned()
            .collect();

        result.sort_by_key(|j| j.seq);
        result.truncate(limit);
        Ok(result)
    }

    fn redrive(&self, tenant_id: TenantId, job_id: JobId, now: DateTime<Utc>) -> Result<JobRecord, JobStoreError> {
        let mut inner = self.write()?;
        let job = inner.jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
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
        Ok(job.clone())
    }

    fn cleanup(&self, older_than: DateTime<Utc>) -> Result<usize, JobStoreError> {
        let mut inner = self.write()?;
        let before = inner.jobs.len();
        inner.jobs.retain(|_, j| {
            !(matches!(j.status, JobStatus::Completed | JobStatus::Failed)
                && j.finished_at.is_some_and(|at| at < older_than))
        });
        Ok(before - inner.jobs.len())
    }

    fn stats(&self, tenant_id: Option<TenantId>, now: DateTime<Utc>) -> Result<JobStats, JobStoreError> {
        let inner = self.read()?;
        let mut stats = JobStats::default();

        for job in inner.jobs.values() {
            if tenant_id.is_some_and(|t| job.tenant_id() != t) {
                continue;
            }
            stats.add(job.status, 1);
            if job.status == JobStatus::Pending {
                let due = due_since(job);
                if due <= now && stats.oldest_due_at.is_none_or(|o| due < o) {
                    stats.oldest_due_at = Some(due);
                }
            }
        }

        Ok(stats)
    }
}

impl<S: JobStore + ?Sized> JobStore for Arc<S> {
    fn enqueue(&self, envelope: JobEnvelope, now: DateTime<Utc>) -> Result<JobId, JobStoreError> {
        (**self).enqueue(envelope, now)
    }

    fn get(&self, tenant_id: TenantId, job_id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
        (**self).get(tenant_id, job_id)
    }

    fn claim(
        &self,
        worker: &WorkerId,
        lease: Duration,
        scope: Option<TenantId>,
        now: DateTime<Utc>,
    ) -> Result<Option<Claimed>, JobStoreError> {
        (**self).claim(worker, lease, scope, now)
    }

    fn start(&self, job_id: JobId, worker: &WorkerId, now: DateTime<Utc>) -> Result<JobRecord, JobStoreError> {
        (**self).start(job_id, worker, now)
    }

    fn heartbeat(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<HeartbeatOutcome, JobStoreError> {
        (**self).heartbeat(job_id, worker, lease, now)
    }

    fn complete(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        result: JsonValue,
        now: DateTime<Utc>,
    ) -> Result<JobRecord, JobStoreError> {
        (**self).complete(job_id, worker, result, now)
    }

    fn fail(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        error: JobError,
        retry: bool,
        now: DateTime<Utc>,
    ) -> Result<FailOutcome, JobStoreError> {
        (**self).fail(job_id, worker, error, retry, now)
    }

    fn defer(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<JobRecord, JobStoreError> {
        (**self).defer(job_id, worker, until, now)
    }

    fn expire(&self, job_id: JobId, now: DateTime<Utc>) -> Result<JobRecord, JobStoreError> {
        (**self).expire(job_id, now)
    }

    fn list_by_status(
        &self,
        tenant_id: TenantId,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<JobRecord>, JobStoreError> {
        (**self).list_by_status(tenant_id, status, limit)
    }

    fn list_dead_letters(&self, tenant_id: TenantId, limit: usize) -> Result<Vec<JobRecord>, JobStoreError> {
        (**self).list_dead_letters(tenant_id, limit)
    }

    fn redrive(&self, tenant_id: TenantId, job_id: JobId, now: DateTime<Utc>) -> Result<JobRecord, JobStoreError> {
        (**self).redrive(tenant_id, job_id, now)
    }

    fn cleanup(&self, older_than: DateTime<Utc>) -> Result<usize, JobStoreError> {
        (**self).cleanup(older_than)
    }

    fn stats(&self, tenant_id: Option<TenantId>, now: DateTime<Utc>) -> Result<JobStats, JobStoreError> {
        (**self).stats(tenant_id, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::JobType;
    use crate::resilience::Jitter;
    use patchflow_core::RunId;
    use serde_json::json;
    use std::sync::Barrier;
    use std::thread;

    const LEASE: Duration = Duration::from_secs(30);

    fn test_tenant() -> TenantId {
        TenantId::new()
    }

    fn job(tenant: TenantId) -> JobEnvelope {
        JobEnvelope::new(tenant, RunId::new(), JobType::StartRun, json!({}))
    }

    fn store() -> InMemoryJobStore {
        InMemoryJobStore::new().with_retry_policy(
            RetryPolicy::exponential(10, Duration::from_millis(100), Duration::from_secs(1))
                .with_jitter(Jitter::None),
        )
    }

    #[test]
    fn enqueue_and_claim() {
        let store = store();
        let tenant = test_tenant();
        let now = Utc::now();
        let w = WorkerId::new("w1");

        let job_id = store.enqueue(job(tenant), now).unwrap();

        let claimed = store.claim(&w, LEASE, None, now).unwrap().unwrap();
        assert_eq!(claimed.job.id(), job_id);
        assert!(!claimed.reclaimed);
        assert_eq!(claimed.job.status, JobStatus::Claimed);
        assert_eq!(claimed.job.envelope.attempt, 1);

        // No more jobs
        assert!(store.claim(&w, LEASE, None, now).unwrap().is_none());
    }

    #[test]
    fn enqueue_rejects_invalid_and_duplicate_envelopes() {
        let store = store();
        let tenant = test_tenant();
        let now = Utc::now();

        let bad = job(tenant).with_max_retries(0);
        assert!(matches!(store.enqueue(bad, now), Err(JobStoreError::Validation(_))));

        let env = job(tenant);
        store.enqueue(env.clone(), now).unwrap();
        assert!(matches!(store.enqueue(env, now), Err(JobStoreError::AlreadyExists(_))));
    }

    #[test]
    fn tenant_isolation() {
        let store = store();
        let tenant1 = test_tenant();
        let tenant2 = test_tenant();
        let now = Utc::now();

        let job_id = store.enqueue(job(tenant1), now).unwrap();

        assert!(matches!(store.get(tenant2, job_id), Err(JobStoreError::TenantIsolation)));
        assert!(store
            .claim(&WorkerId::new("w"), LEASE, Some(tenant2), now)
            .unwrap()
            .is_none());
    }

    #[test]
    fn claim_orders_by_priority_then_key_then_seq() {
        let store = store();
        let tenant = test_tenant();
        let now = Utc::now();
        let w = WorkerId::new("w");

        let low = store.enqueue(job(tenant), now).unwrap();
        let high = store.enqueue(job(tenant).with_priority(10), now).unwrap();
        let low2 = store.enqueue(job(tenant), now).unwrap();

        let order: Vec<JobId> = (0..3)
            .map(|_| store.claim(&w, LEASE, None, now).unwrap().unwrap().job.id())
            .collect();
        assert_eq!(order, vec![high, low, low2]);
    }

    #[test]
    fn delayed_jobs_wait() {
        let store = store();
        let tenant = test_tenant();
        let now = Utc::now();
        let w = WorkerId::new("w");

        store
            .enqueue(job(tenant).scheduled_at(now + chrono::Duration::seconds(10)), now)
            .unwrap();
        assert!(store.claim(&w, LEASE, None, now).unwrap().is_none());
        assert!(store
            .claim(&w, LEASE, None, now + chrono::Duration::seconds(10))
            .unwrap()
            .is_some());
    }

    #[test]
    fn ordering_key_blocks_later_jobs_until_head_is_terminal() {
        let store = store();
        let tenant = test_tenant();
        let now = Utc::now();
        let w = WorkerId::new("w");

        let first = store.enqueue(job(tenant).with_ordering_key("repo#1"), now).unwrap();
        let second = store.enqueue(job(tenant).with_ordering_key("repo#1"), now).unwrap();
        let other = store.enqueue(job(tenant).with_ordering_key("repo#2"), now).unwrap();

        assert_eq!(store.claim(&w, LEASE, None, now).unwrap().unwrap().job.id(), first);
        // `second` is blocked while `first` is in flight; `other` is not.
        assert_eq!(store.claim(&w, LEASE, None, now).unwrap().unwrap().job.id(), other);
        assert!(store.claim(&w, LEASE, None, now).unwrap().is_none());

        // A retrying head still blocks.
        store.fail(first, &w, JobError::transient("x"), true, now).unwrap();
        assert!(store.claim(&w, LEASE, None, now).unwrap().is_none());
        let later = now + chrono::Duration::seconds(5);
        assert_eq!(store.claim(&w, LEASE, None, later).unwrap().unwrap().job.id(), first);
        store.complete(first, &w, json!({}), later).unwrap();

        assert_eq!(store.claim(&w, LEASE, None, later).unwrap().unwrap().job.id(), second);
    }

    #[test]
    fn expired_candidates_fail_instead_of_being_claimed() {
        let store = store();
        let tenant = test_tenant();
        let now = Utc::now();

        let id = store
            .enqueue(job(tenant).with_deadline(now - chrono::Duration::seconds(1)), now)
            .unwrap();
        assert!(store.claim(&WorkerId::new("w"), LEASE, None, now).unwrap().is_none());

        let record = store.get(tenant, id).unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.last_error.unwrap().kind, ErrorKind::DeadlineExceeded);
    }

    #[test]
    fn retry_exhaustion_dead_letters_with_history() {
        let store = store();
        let tenant = test_tenant();
        let w = WorkerId::new("w");
        let mut now = Utc::now();

        let id = store.enqueue(job(tenant).with_max_retries(3), now).unwrap();
        let mut outcomes = Vec::new();
        for _ in 0..3 {
            let claimed = store.claim(&w, LEASE, None, now).unwrap().unwrap();
            store.start(claimed.job.id(), &w, now).unwrap();
            outcomes.push(store.fail(id, &w, JobError::transient("timeout"), true, now).unwrap());
            now += chrono::Duration::seconds(2);
        }

        assert!(matches!(outcomes[0], FailOutcome::Retrying { next_attempt: 2, .. }));
        assert!(matches!(outcomes[1], FailOutcome::Retrying { next_attempt: 3, .. }));
        assert_eq!(outcomes[2], FailOutcome::DeadLettered);

        let dead = store.list_dead_letters(tenant, 10).unwrap();
        assert_eq!(dead.len(), 1);
        let history = &dead[0].envelope.previous_attempts;
        assert_eq!(history.iter().map(|a| a.attempt_number).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert!(history.iter().all(|a| a.error_kind == ErrorKind::Transient));

        // Never auto-retried.
        assert!(store.claim(&w, LEASE, None, now + chrono::Duration::days(1)).unwrap().is_none());
    }

    #[test]
    fn retry_after_hint_sets_delay() {
        let store = store();
        let tenant = test_tenant();
        let w = WorkerId::new("w");
        let now = Utc::now();

        let id = store.enqueue(job(tenant), now).unwrap();
        store.claim(&w, LEASE, None, now).unwrap();
        let outcome = store
            .fail(id, &w, JobError::transient("429").with_retry_after(Duration::from_millis(700)), true, now)
            .unwrap();
        assert_eq!(
            outcome,
            FailOutcome::Retrying {
                next_attempt: 2,
                delay_until: now + chrono::Duration::milliseconds(700),
            }
        );
    }

    #[test]
    fn non_retryable_failure_dead_letters_immediately() {
        let store = store();
        let tenant = test_tenant();
        let w = WorkerId::new("w");
        let now = Utc::now();

        let id = store.enqueue(job(tenant).with_max_retries(5), now).unwrap();
        store.claim(&w, LEASE, None, now).unwrap();
        assert_eq!(
            store.fail(id, &w, JobError::fatal("bad patch"), false, now).unwrap(),
            FailOutcome::DeadLettered
        );
    }

    #[test]
    fn defer_keeps_attempt() {
        let store = store();
        let tenant = test_tenant();
        let w = WorkerId::new("w");
        let now = Utc::now();

        let id = store.enqueue(job(tenant), now).unwrap();
        store.claim(&w, LEASE, None, now).unwrap();
        let until = now + chrono::Duration::seconds(5);
        let record = store.defer(id, &w, until, now).unwrap();
        assert_eq!(record.status, JobStatus::Pending);
        assert_eq!(record.envelope.attempt, 1);
        assert!(record.envelope.previous_attempts.is_empty());
        assert!(store.claim(&w, LEASE, None, now).unwrap().is_none());
        assert!(store.claim(&w, LEASE, None, until).unwrap().is_some());
    }

    #[test]
    fn lease_recovery_lets_second_worker_finish_exactly_once() {
        let store = store();
        let tenant = test_tenant();
        let a = WorkerId::new("a");
        let b = WorkerId::new("b");
        let lease = Duration::from_secs(10);
        let t0 = Utc::now();

        let id = store.enqueue(job(tenant), t0).unwrap();
        store.claim(&a, lease, None, t0).unwrap().unwrap();
        store.start(id, &a, t0).unwrap();
        // A stops heartbeating.
        assert!(store.claim(&b, lease, None, t0 + chrono::Duration::seconds(5)).unwrap().is_none());

        let t1 = t0 + chrono::Duration::seconds(11);
        let claimed = store.claim(&b, lease, None, t1).unwrap().unwrap();
        assert!(claimed.reclaimed);
        assert_eq!(claimed.job.reclaim_count, 1);

        // A wakes up and tries to finish: rejected.
        assert_eq!(store.heartbeat(id, &a, lease, t1).unwrap(), HeartbeatOutcome::LostLease);
        assert!(matches!(store.complete(id, &a, json!({"by": "a"}), t1), Err(JobStoreError::LostLease(_))));

        store.start(id, &b, t1).unwrap();
        assert!(matches!(store.heartbeat(id, &b, lease, t1).unwrap(), HeartbeatOutcome::Extended { .. }));
        store.complete(id, &b, json!({"by": "b"}), t1).unwrap();

        let record = store.get(tenant, id).unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.result, Some(json!({"by": "b"})));
        assert!(matches!(store.complete(id, &b, json!({}), t1), Err(JobStoreError::LostLease(_))));
    }

    #[test]
    fn redrive_is_explicit_and_keeps_history() {
        let store = store();
        let tenant = test_tenant();
        let w = WorkerId::new("w");
        let now = Utc::now();

        let id = store.enqueue(job(tenant).with_max_retries(1), now).unwrap();
        store.claim(&w, LEASE, None, now).unwrap();
        store.fail(id, &w, JobError::transient("boom"), true, now).unwrap();

        assert!(matches!(store.redrive(test_tenant(), id, now), Err(JobStoreError::TenantIsolation)));
        let record = store.redrive(tenant, id, now).unwrap();
        assert_eq!(record.status, JobStatus::Pending);
        assert_eq!(record.envelope.attempt, 1);
        assert_eq!(record.envelope.previous_attempts.len(), 1);
        assert!(matches!(
            store.redrive(tenant, id, now),
            Err(JobStoreError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn cleanup_removes_old_terminal_records_but_keeps_dead_letters() {
        let store = store();
        let tenant = test_tenant();
        let w = WorkerId::new("w");
        let now = Utc::now();

        let done = store.enqueue(job(tenant), now).unwrap();
        store.claim(&w, LEASE, None, now).unwrap();
        store.complete(done, &w, json!({}), now).unwrap();

        let dead = store.enqueue(job(tenant).with_max_retries(1), now).unwrap();
        store.claim(&w, LEASE, None, now).unwrap();
        store.fail(dead, &w, JobError::fatal("x"), false, now).unwrap();

        let pending = store.enqueue(job(tenant), now).unwrap();

        assert_eq!(store.cleanup(now).unwrap(), 0);
        assert_eq!(store.cleanup(now + chrono::Duration::seconds(1)).unwrap(), 1);
        assert!(store.get(tenant, done).unwrap().is_none());
        assert!(store.get(tenant, dead).unwrap().is_some());
        assert!(store.get(tenant, pending).unwrap().is_some());
    }

    #[test]
    fn stats_tracking() {
        let store = store();
        let tenant = test_tenant();
        let now = Utc::now();
        let w = WorkerId::new("w");

        for _ in 0..5 {
            store.enqueue(job(tenant), now - chrono::Duration::seconds(30)).unwrap();
        }
        store.enqueue(job(test_tenant()), now).unwrap();

        store.claim(&w, LEASE, Some(tenant), now).unwrap();
        store.claim(&w, LEASE, Some(tenant), now).unwrap();

        let stats = store.stats(Some(tenant), now).unwrap();
        assert_eq!(stats.pending, 3);
        assert_eq!(stats.claimed, 2);
        assert!(stats.oldest_due_at.is_some());

        let all = store.stats(None, now).unwrap();
        assert_eq!(all.pending, 4);
    }

    #[test]
    fn concurrent_claimers_never_share_a_job() {
        const WORKERS: usize = 128;
        const JOBS: usize = 64;

        let store = Arc::new(store());
        let tenant = test_tenant();
        let now = Utc::now();
        for _ in 0..JOBS {
            store.enqueue(job(tenant), now).unwrap();
        }

        let barrier = Arc::new(Barrier::new(WORKERS));
        let handles: Vec<_> = (0..WORKERS)
            .map(|i| {
                let store = store.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    let worker = WorkerId::new(format!("w{i}"));
                    barrier.wait();
                    store
                        .claim(&worker, LEASE, None, now)
                        .unwrap()
                        .map(|c| c.job.id())
                })
            })
            .collect();

        let mut claimed: Vec<JobId> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(claimed.len(), JOBS);
        claimed.sort();
        claimed.dedup();
        assert_eq!(claimed.len(), JOBS, "a job was claimed twice");
    }
}
