//! Retry + circuit breaker around an arbitrary fallible operation.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use patchflow_core::ErrorKind;
use patchflow_steps::StepError;
use thiserror::Error;
use tracing::{debug, warn};

use super::breaker::BreakerRegistry;
use super::retry::RetryPolicy;

/// Errors that can describe how they should be retried.
pub trait ClassifyError {
    fn error_kind(&self) -> ErrorKind;

    /// Dependency-provided delay (e.g. a `Retry-After` header).
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

impl ClassifyError for StepError {
    fn error_kind(&self) -> ErrorKind {
        self.kind
    }

    fn retry_after(&self) -> Option<Duration> {
        StepError::retry_after(self)
    }
}

#[derive(Debug, Error)]
pub enum ResilienceError<E> {
    /// The dependency's breaker is open; the operation was not called.
    #[error("circuit open for {dependency}, retry after {retry_after:?}")]
    CircuitOpen {
        dependency: String,
        retry_after: Duration,
    },

    #[error("non-retryable failure after {attempts} attempt(s): {error}")]
    NonRetryable { attempts: u32, error: E },

    #[error("retries exhausted after {attempts} attempt(s): {last}")]
    Exhausted { attempts: u32, last: E },

    /// The next backoff would overrun the deadline.
    #[error("deadline exceeded after {attempts} attempt(s): {last}")]
    DeadlineExceeded { attempts: u32, last: E },
}

impl<E: ClassifyError> ResilienceError<E> {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ResilienceError::CircuitOpen { .. } | ResilienceError::Exhausted { .. } => {
                ErrorKind::Transient
            }
            ResilienceError::NonRetryable { error, .. } => error.error_kind(),
            ResilienceError::DeadlineExceeded { .. } => ErrorKind::DeadlineExceeded,
        }
    }

    /// Suggested wait before the caller tries again.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ResilienceError::CircuitOpen { retry_after, .. } => Some(*retry_after),
            ResilienceError::Exhausted { last, .. } => last.retry_after(),
            _ => None,
        }
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            ResilienceError::CircuitOpen { .. } => None,
            ResilienceError::NonRetryable { error, .. } => Some(error),
            ResilienceError::Exhausted { last, .. } | ResilienceError::DeadlineExceeded { last, .. } => {
                Some(last)
            }
        }
    }
}

/// Runs operations against named dependencies with retry and breaker protection.
///
/// Blocks the calling thread while backing off; callers are worker threads.
#[derive(Debug, Clone)]
pub struct ResilienceExecutor {
    breakers: Arc<BreakerRegistry>,
}

impl ResilienceExecutor {
    pub fn new(breakers: Arc<BreakerRegistry>) -> Self {
        Self { breakers }
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    pub fn execute<T, E, F>(
        &self,
        dependency: &str,
        policy: &RetryPolicy,
        op: F,
    ) -> Result<T, ResilienceError<E>>
    where
        E: ClassifyError + std::fmt::Display,
        F: FnMut(u32) -> Result<T, E>,
    {
        self.execute_until(dependency, policy, None, op)
    }

    /// Like [`execute`](Self::execute), but gives up instead of sleeping past `deadline`.
    ///
    /// `op` receives the 1-based attempt number.
    pub fn execute_until<T, E, F>(
        &self,
        dependency: &str,
        policy: &RetryPolicy,
        deadline: Option<DateTime<Utc>>,
        mut op: F,
    ) -> Result<T, ResilienceError<E>>
    where
        E: ClassifyError + std::fmt::Display,
        F: FnMut(u32) -> Result<T, E>,
    {
        let breaker = self.breakers.get(dependency);
        let mut attempt = 0;

        loop {
            attempt += 1;

            let permit = breaker.acquire(Instant::now()).map_err(|rejected| {
                debug!(dependency, attempt, "short-circuited by open breaker");
                ResilienceError::CircuitOpen {
                    dependency: dependency.to_string(),
                    retry_after: rejected.retry_after,
                }
            })?;

            let err = match op(attempt) {
                Ok(value) => {
                    permit.record_success(Instant::now());
                    return Ok(value);
                }
                Err(err) => err,
            };

            let kind = err.error_kind();
            // Only dependency trouble counts against the breaker; dropping the permit hands a probe back.
            if kind == ErrorKind::Transient {
                permit.record_failure(Instant::now());
            } else {
                drop(permit);
            }

            if !(policy.retry_if)(kind) {
                return Err(ResilienceError::NonRetryable {
                    attempts: attempt,
                    error: err,
                });
            }
            if attempt >= policy.max_attempts {
                warn!(dependency, attempts = attempt, error = %err, "retries exhausted");
                return Err(ResilienceError::Exhausted {
                    attempts: attempt,
                    last: err,
                });
            }

            let delay = policy.delay_with_hint(attempt, err.retry_after());
            if let Some(deadline) = deadline {
                let wake_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
                if wake_at >= deadline {
                    return Err(ResilienceError::DeadlineExceeded {
                        attempts: attempt,
                        last: err,
                    });
                }
            }

            debug!(dependency, attempt, delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX), error = %err, "retrying");
            thread::sleep(delay);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::breaker::{BreakerConfig, BreakerState};
    use crate::resilience::retry::Jitter;
    use std::cell::Cell;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::exponential(max_attempts, Duration::from_millis(1), Duration::from_millis(5))
            .with_jitter(Jitter::None)
    }

    fn executor(config: BreakerConfig) -> ResilienceExecutor {
        ResilienceExecutor::new(Arc::new(BreakerRegistry::new(config)))
    }

    #[test]
    fn succeeds_after_transient_failures() {
        let exec = executor(BreakerConfig::default());
        let calls = Cell::new(0);
        let result = exec.execute("github", &fast_policy(3), |attempt| {
            calls.set(calls.get() + 1);
            if attempt < 3 {
                Err(StepError::transient("502"))
            } else {
                Ok(attempt)
            }
        });
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn validation_errors_are_not_retried() {
        let exec = executor(BreakerConfig::default());
        let calls = Cell::new(0);
        let result: Result<(), _> = exec.execute("github", &fast_policy(5), |_| {
            calls.set(calls.get() + 1);
            Err(StepError::new(ErrorKind::Validation, "bad request"))
        });
        assert!(matches!(result, Err(ResilienceError::NonRetryable { attempts: 1, .. })));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn exhaustion_reports_attempts_and_last_error() {
        let exec = executor(BreakerConfig::default());
        let result: Result<(), _> = exec.execute("github", &fast_policy(2), |attempt| {
            Err(StepError::transient(format!("timeout #{attempt}")))
        });
        match result {
            Err(ResilienceError::Exhausted { attempts, last }) => {
                assert_eq!(attempts, 2);
                assert_eq!(last.message, "timeout #2");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn open_breaker_fails_fast_without_burning_attempts() {
        let exec = executor(BreakerConfig {
            failure_threshold: 2,
            failure_rate_threshold: 0.5,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(60),
            half_open_successes: 1,
        });

        let _: Result<(), _> = exec.execute("model", &fast_policy(2), |_| {
            Err(StepError::transient("503"))
        });
        assert_eq!(exec.breakers().get("model").state(), BreakerState::Open);

        let calls = Cell::new(0);
        let result: Result<(), ResilienceError<StepError>> =
            exec.execute("model", &fast_policy(5), |_| {
                calls.set(calls.get() + 1);
                Ok(())
            });
        assert!(matches!(result, Err(ResilienceError::CircuitOpen { .. })));
        assert_eq!(calls.get(), 0);

        // Other dependencies are unaffected.
        assert!(exec.execute("github", &fast_policy(1), |_| Ok::<_, StepError>(())).is_ok());
    }

    #[test]
    fn panic_during_half_open_trial_does_not_wedge_breaker() {
        let exec = executor(BreakerConfig {
            failure_threshold: 1,
            failure_rate_threshold: 0.5,
            window: Duration::from_secs(60),
            cooldown: Duration::ZERO,
            half_open_successes: 1,
        });
        let _: Result<(), _> = exec.execute("model", &fast_policy(1), |_| Err(StepError::transient("503")));
        assert_eq!(exec.breakers().get("model").state(), BreakerState::Open);

        let unwound = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _: Result<(), ResilienceError<StepError>> =
                exec.execute("model", &fast_policy(1), |_| panic!("client bug"));
        }));
        assert!(unwound.is_err());

        // The trial permit came back, so a healthy call can close the breaker.
        assert!(exec.execute("model", &fast_policy(1), |_| Ok::<_, StepError>(())).is_ok());
        assert_eq!(exec.breakers().get("model").state(), BreakerState::Closed);
        for _ in 0..5 {
            assert!(exec.execute("model", &fast_policy(1), |_| Ok::<_, StepError>(())).is_ok());
        }
    }

    #[test]
    fn retry_after_hint_beyond_deadline_stops_early() {
        let exec = executor(BreakerConfig::default());
        let policy = RetryPolicy::exponential(5, Duration::from_millis(1), Duration::from_secs(60));
        let deadline = Utc::now() + chrono::Duration::seconds(1);
        let result: Result<(), _> = exec.execute_until("github", &policy, Some(deadline), |_| {
            Err(StepError::transient("429").with_retry_after(Duration::from_secs(30)))
        });
        let err = result.unwrap_err();
        assert!(matches!(err, ResilienceError::DeadlineExceeded { attempts: 1, .. }));
        assert_eq!(err.kind(), ErrorKind::DeadlineExceeded);
    }
}
