//! Persistence seams for ledger state and audit records.

use crate::audit::AuditRecord;
use crate::error::Result;
use crate::ledger::LedgerSnapshot;
use async_trait::async_trait;
use parking_lot::Mutex;

/// Durable home for the cost ledger.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Persist the latest snapshot, replacing any previous one.
    async fn save(&self, snapshot: &LedgerSnapshot) -> Result<()>;

    /// Most recently saved snapshot, if any.
    async fn load(&self) -> Result<Option<LedgerSnapshot>>;
}

/// Destination for audit records.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Append one record.
    async fn append(&self, record: &AuditRecord) -> Result<()>;
}

/// In-process store for tests and embedded use.
#[derive(Debug, Default)]
pub struct MemoryStore {
    snapshot: Mutex<Option<LedgerSnapshot>>,
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Audit records appended so far, in order.
    #[must_use]
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().clone()
    }

    /// Last saved snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Option<LedgerSnapshot> {
        self.snapshot.lock().clone()
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn save(&self, snapshot: &LedgerSnapshot) -> Result<()> {
        *self.snapshot.lock() = Some(snapshot.clone());
        Ok(())
    }

    async fn load(&self) -> Result<Option<LedgerSnapshot>> {
        Ok(self.snapshot.lock().clone())
    }
}

#[async_trait]
impl AuditSink for MemoryStore {
    async fn append(&self, record: &AuditRecord) -> Result<()> {
        self.records.lock().push(record.clone());
        Ok(())
    }
}

/// Emits each record as a structured `tracing` event.
///
/// Used when no durable sink is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

#[async_trait]
impl AuditSink for TracingSink {
    async fn append(&self, record: &AuditRecord) -> Result<()> {
        let trace = serde_json::to_string(&record.trace)
            .map_err(|e| crate::error::GatewayError::Storage(e.to_string()))?;
        tracing::info!(
            target: "prism::audit",
            record_id = %record.id,
            request_id = %record.request_id,
            mode = record.mode.as_str(),
            success = record.is_success(),
            trace = %trace,
            "Audit record"
        );
        Ok(())
    }
}
