//! Per-request audit records.
//!
//! Every completed call produces exactly one [`AuditRecord`] holding its
//! decision trace: the strategy used, the planned route, each backend
//! attempt, the cache outcome, any budget reroute and the cost charged.
//! Every free-text field passes through the [`Sanitizer`] before it
//! reaches the sink.

use crate::error::{BackendFailure, FailureKind, GatewayError};
use crate::request::RequestMode;
use crate::sanitizer::Sanitizer;
use crate::store::AuditSink;
use chrono::{DateTime, Utc};
use prism_core::{BackendId, RequestId, Usd};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Longest prompt excerpt kept in a record, in characters.
pub const EXCERPT_CHARS: usize = 200;

/// Result of one backend attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// Backend returned text
    Success {
        /// Tokens billed
        tokens: u32,
        /// Cost of the attempt
        cost: Usd,
    },
    /// Backend was skipped, failed or timed out
    Failed {
        /// Failure classification
        kind: FailureKind,
        /// Sanitized reason
        reason: String,
    },
}

/// One backend contacted (or skipped) while serving a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attempt {
    /// Backend concerned
    pub backend: BackendId,
    /// What happened
    pub outcome: AttemptOutcome,
    /// Time spent on the attempt, in milliseconds
    pub latency_ms: u64,
}

impl Attempt {
    /// A successful attempt.
    #[must_use]
    pub fn success(backend: BackendId, tokens: u32, cost: Usd, latency: Duration) -> Self {
        Self {
            backend,
            outcome: AttemptOutcome::Success { tokens, cost },
            latency_ms: millis(latency),
        }
    }

    /// A failed attempt.
    #[must_use]
    pub fn failed(failure: &BackendFailure, latency: Duration) -> Self {
        Self {
            backend: failure.backend.clone(),
            outcome: AttemptOutcome::Failed {
                kind: failure.kind,
                reason: failure.reason.clone(),
            },
            latency_ms: millis(latency),
        }
    }

    /// Whether the backend returned text.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, AttemptOutcome::Success { .. })
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// How the response cache took part in a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheOutcome {
    /// Served from the cache
    Hit,
    /// Looked up, not found
    Miss,
    /// Not consulted
    #[default]
    Bypassed,
}

/// What the gateway decided and why.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DecisionTrace {
    /// Routing strategy label
    pub strategy: Option<String>,
    /// Planned attempt order
    pub route: Vec<BackendId>,
    /// Backend whose output was returned
    pub chosen: Option<BackendId>,
    /// Attempts in the order they finished
    pub attempts: Vec<Attempt>,
    /// Cache participation
    pub cache: CacheOutcome,
    /// Whether a budget denial moved the request to a free local backend
    pub budget_rerouted: bool,
    /// Amount committed to the ledger
    pub cost_charged: Usd,
    /// Renormalized synthesis weights of contributing members
    pub synthesis_weights: Vec<(BackendId, f64)>,
}

/// Final status of a request.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AuditOutcome {
    /// Request returned a result
    #[default]
    Success,
    /// Request returned an error
    Error {
        /// Stable error label, see [`GatewayError::kind`]
        kind: String,
        /// Sanitized error message
        message: String,
    },
}

impl AuditOutcome {
    /// Outcome describing `err`.
    #[must_use]
    pub fn from_error(err: &GatewayError) -> Self {
        Self::Error {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

/// One audit row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Unique record id
    pub id: Uuid,
    /// Request the record describes
    pub request_id: RequestId,
    /// Completion time
    pub timestamp: DateTime<Utc>,
    /// Request mode
    pub mode: RequestMode,
    /// Final status
    pub outcome: AuditOutcome,
    /// Decision trace
    pub trace: DecisionTrace,
    /// Leading characters of the sanitized prompt
    pub prompt_excerpt: String,
}

impl AuditRecord {
    /// Empty successful record for `request_id`.
    #[must_use]
    pub fn new(request_id: RequestId, mode: RequestMode) -> Self {
        Self {
            id: Uuid::new_v4(),
            request_id,
            timestamp: Utc::now(),
            mode,
            outcome: AuditOutcome::Success,
            trace: DecisionTrace::default(),
            prompt_excerpt: String::new(),
        }
    }

    /// Set the prompt excerpt.
    #[must_use]
    pub fn with_prompt(mut self, prompt: &str) -> Self {
        self.prompt_excerpt = prompt.to_string();
        self
    }

    /// Whether the request succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outcome == AuditOutcome::Success
    }
}

/// Sanitizes records and hands them to an [`AuditSink`].
#[derive(Clone)]
pub struct AuditLog {
    sink: Arc<dyn AuditSink>,
    sanitizer: Arc<Sanitizer>,
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog").finish_non_exhaustive()
    }
}

impl AuditLog {
    /// Create a log writing to `sink`.
    pub fn new(sink: Arc<dyn AuditSink>, sanitizer: Arc<Sanitizer>) -> Self {
        Self { sink, sanitizer }
    }

    /// Sanitize and append `record`.
    ///
    /// Sink failures are logged and never propagated to the caller.
    pub async fn write(&self, record: AuditRecord) {
        let record = self.sanitize(record);
        if let Err(e) = self.sink.append(&record).await {
            tracing::error!(
                request_id = %record.request_id,
                error = %e,
                "Failed to write audit record"
            );
        }
    }

    fn sanitize(&self, mut record: AuditRecord) -> AuditRecord {
        let excerpt = self.sanitizer.redact(&record.prompt_excerpt);
        record.prompt_excerpt = excerpt.chars().take(EXCERPT_CHARS).collect();

        if let AuditOutcome::Error { message, .. } = &mut record.outcome {
            *message = self.sanitizer.redact(message);
        }
        for attempt in &mut record.trace.attempts {
            if let AttemptOutcome::Failed { reason, .. } = &mut attempt.outcome {
                *reason = self.sanitizer.redact(reason);
            }
        }
        record
    }
}
