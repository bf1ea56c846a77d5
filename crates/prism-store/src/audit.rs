//! Audit record persistence.
//!
//! The full record is stored as JSON; a few columns are lifted out for
//! filtering.

use crate::error::Result;
use prism_gateway::{AuditOutcome, AuditRecord};
use sqlx::SqlitePool;

/// Insert one record.
pub async fn insert_record(pool: &SqlitePool, record: &AuditRecord) -> Result<()> {
    let json = serde_json::to_string(record)?;
    let error_kind = match &record.outcome {
        AuditOutcome::Success => None,
        AuditOutcome::Error { kind, .. } => Some(kind.as_str()),
    };

    sqlx::query(
        r"
        INSERT INTO audit_records (
            id, request_id, timestamp, mode, success, error_kind, cost_mills, record
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ",
    )
    .bind(record.id.to_string())
    .bind(record.request_id.as_str())
    .bind(record.timestamp.to_rfc3339())
    .bind(record.mode.as_str())
    .bind(record.is_success())
    .bind(error_kind)
    .bind(record.trace.cost_charged.mills())
    .bind(json)
    .execute(pool)
    .await?;

    Ok(())
}

/// Most recent records first, at most `limit`.
pub async fn recent_records(pool: &SqlitePool, limit: u32) -> Result<Vec<AuditRecord>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        r"
        SELECT record
        FROM audit_records
        ORDER BY timestamp DESC, rowid DESC
        LIMIT ?
        ",
    )
    .bind(i64::from(limit))
    .fetch_all(pool)
    .await?;

    decode(rows)
}

/// Every record written for `request_id`, oldest first.
pub async fn records_for_request(pool: &SqlitePool, request_id: &str) -> Result<Vec<AuditRecord>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        r"
        SELECT record
        FROM audit_records
        WHERE request_id = ?
        ORDER BY timestamp ASC, rowid ASC
        ",
    )
    .bind(request_id)
    .fetch_all(pool)
    .await?;

    decode(rows)
}

/// Count of failed calls per error kind, most frequent first.
pub async fn failure_counts(pool: &SqlitePool) -> Result<Vec<(String, i64)>> {
    let rows = sqlx::query_as(
        r"
        SELECT error_kind, COUNT(*) AS failures
        FROM audit_records
        WHERE success = 0 AND error_kind IS NOT NULL
        GROUP BY error_kind
        ORDER BY failures DESC, error_kind ASC
        ",
    )
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

fn decode(rows: Vec<(String,)>) -> Result<Vec<AuditRecord>> {
    rows.into_iter()
        .map(|(json,)| serde_json::from_str(&json).map_err(Into::into))
        .collect()
}
