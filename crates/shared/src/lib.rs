//! Shared infrastructure for the Campus services.
//!
//! Pool construction and database migrations used by both the API server
//! and the background worker.

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Create the main database connection pool.
///
/// Sized for request serving; the worker uses the same settings with a
/// smaller connection count via `PgPoolOptions` directly.
pub async fn create_pool(database_url: &str) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await?;

    Ok(pool)
}

/// Create a pool for running migrations.
///
/// Uses a single connection with a long acquire timeout; migration
/// statements can hold locks for longer than regular queries.
pub async fn create_migration_pool(database_url: &str) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(30))
        .connect(database_url)
        .await?;

    Ok(pool)
}

/// Run embedded migrations against the given pool.
pub async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::info!("Database migrations applied");
    Ok(())
}
