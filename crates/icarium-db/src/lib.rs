//! Store layer for the icarium image builder.
//!
//! Provides the configuration and credential store traits along with
//! PostgreSQL and in-memory implementations.

pub mod error;
pub mod repo;

pub use error::{DbError, DbResult};
pub use repo::*;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;

/// Create a new database connection pool.
pub async fn create_pool(database_url: &str) -> DbResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Create a pool that connects on first use.
///
/// Only a malformed URL fails here. An unreachable server surfaces on each
/// query after `acquire_timeout`, so callers can apply their own retry policy.
pub fn create_lazy_pool(database_url: &str, acquire_timeout: Duration) -> DbResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(acquire_timeout)
        .connect_lazy(database_url)?;
    Ok(pool)
}

/// Run database migrations.
pub async fn run_migrations(pool: &PgPool) -> DbResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
