//! Resilience primitives for calls to external dependencies.
//!
//! - [`RetryPolicy`]: bounded attempts with exponential backoff and full jitter
//! - [`CircuitBreaker`]: sliding-window failure detection per dependency
//! - [`ResilienceExecutor`]: combines both; an open breaker short-circuits
//!   before any retry budget is spent

pub mod breaker;
pub mod executor;
pub mod retry;

pub use breaker::{
    BreakerConfig, BreakerRegistry, BreakerSnapshot, BreakerState, CircuitBreaker, Permit, PermitGuard, Rejected,
};
pub use executor::{ClassifyError, ResilienceError, ResilienceExecutor};
pub use retry::{BackoffStrategy, Jitter, RetryPolicy};
