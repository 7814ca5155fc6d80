//! Postgres plumbing shared by the persistent stores.
//!
//! The stores expose synchronous traits (workers are plain threads), so every
//! query runs through [`Db::run`], which drives the future on a tokio runtime.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::info;

const SCHEMA: &str = include_str!("../migrations/001_patchflow.sql");

/// Pool plus the runtime used to drive it from synchronous callers.
#[derive(Debug, Clone)]
pub struct Db {
    pool: Arc<PgPool>,
    handle: Handle,
}

impl Db {
    pub fn new(pool: PgPool, handle: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            handle,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Block the current thread on `fut`.
    ///
    /// Inside a multi-threaded runtime the worker is handed off with
    /// `block_in_place`; from plain threads the stored handle is used.
    /// Must not be called from a current-thread runtime.
    pub fn run<F: Future>(&self, fut: F) -> F::Output {
        match Handle::try_current() {
            Ok(current) if current.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(|| current.block_on(fut))
            }
            _ => self.handle.block_on(fut),
        }
    }
}

/// Connect and apply the schema.
pub async fn connect(url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect(url)
        .await?;
    ensure_schema(&pool).await?;
    Ok(pool)
}

pub async fn ensure_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(SCHEMA).execute(pool).await?;
    info!("database schema ensured");
    Ok(())
}

/// Postgres `23505`.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.code().as_deref() == Some("23505"),
        _ => false,
    }
}

/// Convert a stored integer column back to `u32`, clamping negatives.
pub(crate) fn to_u32(v: i32) -> u32 {
    u32::try_from(v).unwrap_or(0)
}
