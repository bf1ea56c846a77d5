//! Connection pool setup.

use crate::error::{Result, StoreError};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;

/// Open (creating if needed) the database at `path`.
///
/// `:memory:` databases get a single connection, since each connection to
/// an in-memory database sees its own empty database.
///
/// # Errors
/// Returns `StoreError::Open` if the path is invalid or the database cannot
/// be opened.
pub async fn open_pool(path: &str) -> Result<SqlitePool> {
    let in_memory = path == ":memory:";
    let mut options = SqliteConnectOptions::from_str(path)
        .map_err(|e| StoreError::Open(format!("invalid connection string: {e}")))?
        .create_if_missing(true);
    if !in_memory {
        options = options.journal_mode(SqliteJournalMode::Wal);
    }

    let mut pool_options = SqlitePoolOptions::new().max_connections(if in_memory { 1 } else { 5 });
    if in_memory {
        pool_options = pool_options.idle_timeout(None).max_lifetime(None);
    }

    let pool = pool_options
        .connect_with(options)
        .await
        .map_err(|e| StoreError::Open(e.to_string()))?;

    tracing::info!("Store pool opened at {}", path);
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_open_in_memory() {
        let pool = open_pool(":memory:").await.expect("open pool");
        let one: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&pool)
            .await
            .expect("query");
        assert_eq!(one, 1);
    }

    #[tokio::test]
    async fn test_open_creates_file() {
        let tmp = TempDir::new().expect("create temp dir");
        let path = tmp.path().join("prism.db");
        let path = path.to_str().expect("utf-8 path");

        open_pool(path).await.expect("open pool");
        assert!(std::path::Path::new(path).exists());
    }
}
