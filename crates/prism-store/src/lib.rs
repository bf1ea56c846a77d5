//! Prism Store - `SQLite` persistence for the gateway.
//!
//! Implements the gateway's [`LedgerStore`] and [`AuditSink`] seams so
//! budget spend survives restarts and audit records can be queried later.
//!
//! # Example
//!
//! ```ignore
//! use prism_gateway::Gateway;
//! use prism_store::SqliteStore;
//! use std::sync::Arc;
//!
//! let store = Arc::new(SqliteStore::open("prism.db").await?);
//! let gateway = Gateway::builder(config)
//!     .with_ledger_store(store.clone())
//!     .with_audit_sink(store)
//!     .build()
//!     .await?;
//! ```
//!
//! # Layout
//!
//! - One `ledger_state` row holds the current day and month spend
//! - `audit_records` keeps one row per gateway call, with the full record as JSON
//! - Migrations are embedded and run on open

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod audit;
pub mod connection;
pub mod error;
pub mod ledger;
pub mod migrations;

pub use error::{Result, StoreError};

use async_trait::async_trait;
use prism_gateway::{AuditRecord, AuditSink, LedgerSnapshot, LedgerStore};
use sqlx::SqlitePool;

/// `SQLite`-backed ledger store and audit sink.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open the database at `path` and bring its schema up to date.
    pub async fn open(path: &str) -> Result<Self> {
        let pool = connection::open_pool(path).await?;
        migrations::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    /// Fresh in-memory database.
    pub async fn in_memory() -> Result<Self> {
        Self::open(":memory:").await
    }

    /// Underlying pool.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Most recent audit records, newest first.
    pub async fn recent_audit_records(&self, limit: u32) -> Result<Vec<AuditRecord>> {
        audit::recent_records(&self.pool, limit).await
    }

    /// Audit records for one request id.
    pub async fn audit_records_for(&self, request_id: &str) -> Result<Vec<AuditRecord>> {
        audit::records_for_request(&self.pool, request_id).await
    }

    /// Close the pool, waiting for in-flight queries.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl LedgerStore for SqliteStore {
    async fn save(&self, snapshot: &LedgerSnapshot) -> prism_gateway::Result<()> {
        ledger::save_snapshot(&self.pool, snapshot).await?;
        Ok(())
    }

    async fn load(&self) -> prism_gateway::Result<Option<LedgerSnapshot>> {
        Ok(ledger::load_snapshot(&self.pool).await?)
    }
}

#[async_trait]
impl AuditSink for SqliteStore {
    async fn append(&self, record: &AuditRecord) -> prism_gateway::Result<()> {
        audit::insert_record(&self.pool, record).await?;
        Ok(())
    }
}
