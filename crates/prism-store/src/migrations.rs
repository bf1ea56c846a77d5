//! Embedded schema migrations.

use crate::error::{Result, StoreError};
use sqlx::SqlitePool;

/// Apply every pending migration in `migrations/`.
///
/// # Errors
/// Returns `StoreError::Migration` if a migration fails to execute.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    tracing::debug!("Running store migrations");

    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| StoreError::Migration(e.to_string()))?;

    Ok(())
}

/// Highest applied migration version, or 0 before the first run.
pub async fn get_schema_version(pool: &SqlitePool) -> Result<i64> {
    let table_exists = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='_sqlx_migrations'",
    )
    .fetch_one(pool)
    .await?
        > 0;

    if !table_exists {
        return Ok(0);
    }

    let version =
        sqlx::query_scalar::<_, i64>("SELECT COALESCE(MAX(version), 0) FROM _sqlx_migrations")
            .fetch_optional(pool)
            .await?
            .unwrap_or(0);

    Ok(version)
}
