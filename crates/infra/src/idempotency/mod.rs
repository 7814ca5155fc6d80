//! Idempotency layer: one winning execution per key, cached results for duplicates.
//!
//! - A first request takes a `processing` lock owned by its job id
//! - A duplicate sees either the cached result (`completed`) or "in flight, retry later"
//! - `release` clears the lock after a failed attempt so the retry can re-acquire
//! - A lock whose TTL lapsed is abandoned and may be taken over

pub mod layer;
pub mod postgres;
pub mod store;

pub use layer::IdempotencyLayer;
pub use postgres::PostgresIdempotencyStore;
pub use store::{
    BeginOutcome, IdempotencyError, IdempotencyKey, IdempotencyRecord, IdempotencyState, IdempotencyStore,
    InMemoryIdempotencyStore,
};
