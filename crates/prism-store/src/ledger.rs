//! Ledger snapshot persistence.

use crate::error::{Result, StoreError};
use prism_core::Usd;
use prism_gateway::LedgerSnapshot;
use sqlx::SqlitePool;

/// Replace the stored snapshot.
pub async fn save_snapshot(pool: &SqlitePool, snapshot: &LedgerSnapshot) -> Result<()> {
    sqlx::query(
        r"
        INSERT INTO ledger_state (
            id, day_key, month_key, daily_spent_mills, monthly_spent_mills,
            daily_warned, monthly_warned, updated_at
        )
        VALUES (1, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            day_key = excluded.day_key,
            month_key = excluded.month_key,
            daily_spent_mills = excluded.daily_spent_mills,
            monthly_spent_mills = excluded.monthly_spent_mills,
            daily_warned = excluded.daily_warned,
            monthly_warned = excluded.monthly_warned,
            updated_at = excluded.updated_at
        ",
    )
    .bind(&snapshot.day_key)
    .bind(&snapshot.month_key)
    .bind(snapshot.daily_spent.mills())
    .bind(snapshot.monthly_spent.mills())
    .bind(snapshot.daily_warned)
    .bind(snapshot.monthly_warned)
    .bind(chrono::Utc::now().to_rfc3339())
    .execute(pool)
    .await?;

    Ok(())
}

type SnapshotRow = (String, String, i64, i64, bool, bool);

/// Load the stored snapshot, if one was ever saved.
pub async fn load_snapshot(pool: &SqlitePool) -> Result<Option<LedgerSnapshot>> {
    let row: Option<SnapshotRow> = sqlx::query_as(
        r"
        SELECT day_key, month_key, daily_spent_mills, monthly_spent_mills,
               daily_warned, monthly_warned
        FROM ledger_state
        WHERE id = 1
        ",
    )
    .fetch_optional(pool)
    .await?;

    let Some((day_key, month_key, daily, monthly, daily_warned, monthly_warned)) = row else {
        return Ok(None);
    };
    if daily < 0 || monthly < 0 {
        return Err(StoreError::Corrupt("negative ledger spend".to_string()));
    }

    Ok(Some(LedgerSnapshot {
        day_key,
        month_key,
        daily_spent: Usd::from_mills(daily),
        monthly_spent: Usd::from_mills(monthly),
        daily_warned,
        monthly_warned,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::open_pool;
    use crate::migrations::run_migrations;

    async fn setup() -> SqlitePool {
        let pool = open_pool(":memory:").await.expect("open pool");
        run_migrations(&pool).await.expect("run migrations");
        pool
    }

    fn snapshot(daily: i64) -> LedgerSnapshot {
        LedgerSnapshot {
            day_key: "2026-03-14".to_string(),
            month_key: "2026-03".to_string(),
            daily_spent: Usd::from_mills(daily),
            monthly_spent: Usd::from_mills(daily * 3),
            daily_warned: false,
            monthly_warned: true,
        }
    }

    #[tokio::test]
    async fn test_load_empty() {
        let pool = setup().await;
        assert!(load_snapshot(&pool).await.expect("load").is_none());
    }

    #[tokio::test]
    async fn test_save_replaces_previous() {
        let pool = setup().await;
        save_snapshot(&pool, &snapshot(100)).await.expect("save");
        save_snapshot(&pool, &snapshot(250)).await.expect("save again");

        let loaded = load_snapshot(&pool).await.expect("load").expect("present");
        assert_eq!(loaded, snapshot(250));

        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ledger_state")
            .fetch_one(&pool)
            .await
            .expect("count");
        assert_eq!(rows, 1);
    }

    #[tokio::test]
    async fn test_negative_spend_is_corrupt() {
        let pool = setup().await;
        sqlx::query(
            "INSERT INTO ledger_state (id, day_key, month_key, daily_spent_mills, monthly_spent_mills, updated_at) VALUES (1, 'd', 'm', -5, 0, 'now')",
        )
        .execute(&pool)
        .await
        .expect("insert");

        assert!(matches!(load_snapshot(&pool).await, Err(StoreError::Corrupt(_))));
    }
}
