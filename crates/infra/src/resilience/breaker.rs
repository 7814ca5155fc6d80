//! Per-dependency circuit breakers.
//!
//! State machine:
//!
//! ```text
//! closed --(window failures >= threshold and rate >= rate threshold)--> open
//! open --(cooldown elapsed, next caller)--> half_open (one probe in flight)
//! half_open --(probe ok, N consecutive)--> closed
//! half_open --(probe failed)--> open
//! ```
//!
//! All transitions of one breaker happen under its mutex, so concurrent callers
//! in the process observe a single consistent state.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use patchflow_observability::Metrics;
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BreakerConfig {
    /// Minimum failures inside `window` before the breaker may trip.
    pub failure_threshold: u32,
    /// Minimum failure ratio inside `window` (0, 1].
    pub failure_rate_threshold: f64,
    pub window: Duration,
    pub cooldown: Duration,
    /// Consecutive successful probes needed to close again.
    pub half_open_successes: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_rate_threshold: 0.5,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
            half_open_successes: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

/// Permission to call the dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permit {
    pub probe: bool,
}

/// A permit that settles exactly once.
///
/// Dropping it unsettled, including while unwinding from a panicking call,
/// hands a half-open probe back so the next caller can probe again.
#[must_use]
#[derive(Debug)]
pub struct PermitGuard<'a> {
    breaker: &'a CircuitBreaker,
    permit: Option<Permit>,
}

impl PermitGuard<'_> {
    pub fn is_probe(&self) -> bool {
        self.permit.is_some_and(|p| p.probe)
    }

    pub fn record_success(mut self, now: Instant) {
        self.permit = None;
        self.breaker.record_success(now);
    }

    pub fn record_failure(mut self, now: Instant) {
        self.permit = None;
        self.breaker.record_failure(now);
    }
}

impl Drop for PermitGuard<'_> {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take() {
            self.breaker.release_probe(permit);
        }
    }
}

/// The breaker refused the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejected {
    pub retry_after: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub dependency: String,
    pub state: BreakerState,
    /// Failures currently inside the window.
    pub failure_count: u32,
    pub successes_in_half_open: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open_for_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure_ms_ago: Option<u64>,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    outcomes: VecDeque<(Instant, bool)>,
    opened_at: Option<Instant>,
    last_failure_at: Option<Instant>,
    successes_in_half_open: u32,
    probe_in_flight: bool,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    dependency: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
    metrics: Option<Metrics>,
}

impl CircuitBreaker {
    pub fn new(dependency: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            dependency: dependency.into(),
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                outcomes: VecDeque::new(),
                opened_at: None,
                last_failure_at: None,
                successes_in_half_open: 0,
                probe_in_flight: false,
            }),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn dependency(&self) -> &str {
        &self.dependency
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Inner holds plain data; a panic mid-update leaves it usable.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Ask to call the dependency at `now`.
    pub fn try_acquire(&self, now: Instant) -> Result<Permit, Rejected> {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => Ok(Permit { probe: false }),
            BreakerState::Open => {
                let opened_at = inner.opened_at.unwrap_or(now);
                let elapsed = now.saturating_duration_since(opened_at);
                if elapsed >= self.config.cooldown {
                    self.transition(&mut inner, BreakerState::HalfOpen);
                    inner.probe_in_flight = true;
                    Ok(Permit { probe: true })
                } else {
                    Err(Rejected {
                        retry_after: self.config.cooldown - elapsed,
                    })
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(Rejected {
                        retry_after: self.config.cooldown,
                    })
                } else {
                    inner.probe_in_flight = true;
                    Ok(Permit { probe: true })
                }
            }
        }
    }

    pub fn record_success(&self, now: Instant) {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => {
                inner.outcomes.push_back((now, true));
                self.prune(&mut inner, now);
            }
            BreakerState::HalfOpen => {
                inner.probe_in_flight = false;
                inner.successes_in_half_open += 1;
                if inner.successes_in_half_open >= self.config.half_open_successes {
                    self.transition(&mut inner, BreakerState::Closed);
                }
            }
            // A call admitted before the breaker opened; it says nothing about recovery.
            BreakerState::Open => {}
        }
    }

    pub fn record_failure(&self, now: Instant) {
        let mut inner = self.lock();
        inner.last_failure_at = Some(now);
        match inner.state {
            BreakerState::Closed => {
                inner.outcomes.push_back((now, false));
                self.prune(&mut inner, now);
                let total = inner.outcomes.len() as u32;
                let failures = inner.outcomes.iter().filter(|(_, ok)| !ok).count() as u32;
                let rate = failures as f64 / total.max(1) as f64;
                if failures >= self.config.failure_threshold
                    && rate >= self.config.failure_rate_threshold
                {
                    inner.opened_at = Some(now);
                    self.transition(&mut inner, BreakerState::Open);
                }
            }
            BreakerState::HalfOpen => {
                inner.probe_in_flight = false;
                inner.opened_at = Some(now);
                self.transition(&mut inner, BreakerState::Open);
            }
            BreakerState::Open => {}
        }
    }

    /// Give back a probe permit without an outcome (the call never reached the dependency).
    pub fn release_probe(&self, permit: Permit) {
        if permit.probe {
            self.lock().probe_in_flight = false;
        }
    }

    /// `try_acquire` bound to this breaker; see [`PermitGuard`].
    pub fn acquire(&self, now: Instant) -> Result<PermitGuard<'_>, Rejected> {
        let permit = self.try_acquire(now)?;
        Ok(PermitGuard {
            breaker: self,
            permit: Some(permit),
        })
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    pub fn snapshot(&self, now: Instant) -> BreakerSnapshot {
        let mut inner = self.lock();
        self.prune(&mut inner, now);
        BreakerSnapshot {
            dependency: self.dependency.clone(),
            state: inner.state,
            failure_count: inner.outcomes.iter().filter(|(_, ok)| !ok).count() as u32,
            successes_in_half_open: inner.successes_in_half_open,
            open_for_ms: match inner.state {
                BreakerState::Closed => None,
                _ => inner
                    .opened_at
                    .map(|at| u64::try_from(now.saturating_duration_since(at).as_millis()).unwrap_or(u64::MAX)),
            },
            last_failure_ms_ago: inner
                .last_failure_at
                .map(|at| u64::try_from(now.saturating_duration_since(at).as_millis()).unwrap_or(u64::MAX)),
        }
    }

    fn prune(&self, inner: &mut Inner, now: Instant) {
        while let Some((at, _)) = inner.outcomes.front() {
            if now.saturating_duration_since(*at) > self.config.window {
                inner.outcomes.pop_front();
            } else {
                break;
            }
        }
    }

    fn transition(&self, inner: &mut Inner, to: BreakerState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        match to {
            BreakerState::Closed => {
                inner.outcomes.clear();
                inner.opened_at = None;
                inner.successes_in_half_open = 0;
                info!(dependency = %self.dependency, from = from.as_str(), "circuit closed");
            }
            BreakerState::Open => {
                inner.successes_in_half_open = 0;
                warn!(dependency = %self.dependency, from = from.as_str(), "circuit opened");
            }
            BreakerState::HalfOpen => {
                inner.successes_in_half_open = 0;
                info!(dependency = %self.dependency, "circuit half-open, probing");
            }
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_breaker_transition(&self.dependency, to.as_str());
        }
    }
}

/// Breakers shared by every caller in the process, keyed by dependency name.
#[derive(Debug)]
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    metrics: Option<Metrics>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn get(&self, dependency: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        breakers
            .entry(dependency.to_string())
            .or_insert_with(|| {
                let mut breaker = CircuitBreaker::new(dependency, self.config);
                if let Some(metrics) = &self.metrics {
                    breaker = breaker.with_metrics(metrics.clone());
                }
                Arc::new(breaker)
            })
            .clone()
    }

    pub fn snapshots(&self, now: Instant) -> Vec<BreakerSnapshot> {
        let breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<_> = breakers.values().map(|b| b.snapshot(now)).collect();
        out.sort_by(|a, b| a.dependency.cmp(&b.dependency));
        out
    }
}
