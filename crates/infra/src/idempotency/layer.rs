use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use patchflow_observability::Metrics;

use super::store::{BeginOutcome, IdempotencyError, IdempotencyKey, IdempotencyStore};

/// Idempotency store plus lock TTL, retention and counters.
#[derive(Clone)]
pub struct IdempotencyLayer {
    store: Arc<dyn IdempotencyStore>,
    lock_ttl: Duration,
    completed_retention: Duration,
    metrics: Metrics,
}

impl std::fmt::Debug for IdempotencyLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdempotencyLayer")
            .field("lock_ttl", &self.lock_ttl)
            .field("completed_retention", &self.completed_retention)
            .finish_non_exhaustive()
    }
}

impl IdempotencyLayer {
    pub fn new(
        store: Arc<dyn IdempotencyStore>,
        lock_ttl: Duration,
        completed_retention: Duration,
        metrics: Metrics,
    ) -> Self {
        Self {
            store,
            lock_ttl,
            completed_retention,
            metrics,
        }
    }

    pub fn store(&self) -> &Arc<dyn IdempotencyStore> {
        &self.store
    }

    pub fn begin_or_join(
        &self,
        key: &IdempotencyKey,
        owner: &str,
        now: DateTime<Utc>,
    ) -> Result<BeginOutcome, IdempotencyError> {
        self.metrics.record_idempotency_check();
        let outcome = self.store.begin_or_join(key, owner, self.lock_ttl, now)?;
        match &outcome {
            BeginOutcome::Acquired { recovered: false } => {}
            BeginOutcome::Acquired { recovered: true } => {
                info!(key = %key, owner, "idempotency lock recovered");
                self.metrics.record_lock_recovery();
            }
            BeginOutcome::Cached(_) => {
                debug!(key = %key, owner, "duplicate skipped, returning cached result");
                self.metrics.record_duplicate_skipped();
            }
            BeginOutcome::InFlight { locked_by, .. } => {
                debug!(key = %key, owner, locked_by = %locked_by, "duplicate in flight");
                self.metrics.record_processing_conflict();
            }
        }
        Ok(outcome)
    }

    pub fn finish(
        &self,
        key: &IdempotencyKey,
        owner: &str,
        result: JsonValue,
        now: DateTime<Utc>,
    ) -> Result<(), IdempotencyError> {
        self.store.finish(key, owner, result, now)
    }

    /// Renew the lock for another `lock_ttl` while its owner is still working.
    pub fn extend(&self, key: &IdempotencyKey, owner: &str, now: DateTime<Utc>) -> Result<bool, IdempotencyError> {
        let extended = self.store.extend(key, owner, self.lock_ttl, now)?;
        if !extended {
            warn!(key = %key, owner, "idempotency lock no longer held");
        }
        Ok(extended)
    }

    pub fn release(&self, key: &IdempotencyKey, owner: &str, now: DateTime<Utc>) -> Result<bool, IdempotencyError> {
        let released = self.store.release(key, owner, now)?;
        if !released {
            warn!(key = %key, owner, "release by a non-owner ignored");
        }
        Ok(released)
    }

    /// Remove expired records and count them as TTL cleanups.
    pub fn cleanup(&self, now: DateTime<Utc>) -> Result<usize, IdempotencyError> {
        let removed = self.store.cleanup(now, self.completed_retention)?;
        if removed > 0 {
            self.metrics.record_ttl_cleanups(removed as u64);
            info!(removed, "idempotency records cleaned up");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idempotency::InMemoryIdempotencyStore;
    use patchflow_core::TenantId;
    use patchflow_observability::IdempotencyCounters;
    use serde_json::json;

    fn layer() -> (IdempotencyLayer, Metrics) {
        let metrics = patchflow_observability::metrics::init().unwrap();
        let layer = IdempotencyLayer::new(
            Arc::new(InMemoryIdempotencyStore::new()),
            Duration::from_secs(30),
            Duration::from_secs(3600),
            metrics.clone(),
        );
        (layer, metrics)
    }

    #[test]
    fn counters_follow_outcomes() {
        let (layer, metrics) = layer();
        let key = IdempotencyKey::new(TenantId::new(), "start-run", "k1").unwrap();
        let now = Utc::now();

        layer.begin_or_join(&key, "a", now).unwrap();
        layer.begin_or_join(&key, "b", now).unwrap();
        layer.release(&key, "a", now).unwrap();
        layer.begin_or_join(&key, "b", now).unwrap();
        layer.finish(&key, "b", json!({"ok": true}), now).unwrap();
        layer.begin_or_join(&key, "c", now).unwrap();

        assert_eq!(
            metrics.idempotency_counters(),
            IdempotencyCounters {
                checks_total: 4,
                duplicates_skipped: 1,
                processing_conflicts: 1,
                lock_recoveries: 1,
                ttl_cleanups: 0,
            }
        );

        assert_eq!(layer.cleanup(now + chrono::Duration::hours(2)).unwrap(), 1);
        assert_eq!(metrics.idempotency_counters().ttl_cleanups, 1);
    }
}
