//! Infrastructure layer: durable stores, execution machinery, configuration.
//!
//! Every store comes in two flavours behind one trait: an in-memory
//! implementation for tests and single-process deployments, and a Postgres
//! implementation sharing the same semantics.

/// Per-tenant concurrency admission (plan limits, pause and suspension).
pub mod admission;

/// Configuration loading and representation.
pub mod config;

/// Postgres connection pool and migrations wiring.
pub mod db;

/// Exactly-once result caching keyed by idempotency key.
pub mod idempotency;

/// Durable job queue, leases, dead letters and the worker pool.
pub mod jobs;

/// Pipeline runs driven step by step through the resilience executor.
pub mod orchestrator;

/// Retry with backoff plus per-step-type circuit breakers.
pub mod resilience;
