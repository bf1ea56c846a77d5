//! Error types for the gateway.

use crate::ledger::BudgetPeriod;
use prism_core::{BackendId, ConfigError, PrismError, Usd};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors surfaced by gateway operations.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// A backend failed in a way that may succeed on retry
    #[error("transient backend error ({backend}): {summary}")]
    TransientBackend {
        /// Backend that failed
        backend: BackendId,
        /// Classified, sanitized summary
        summary: String,
    },

    /// A backend failed in a way that will not succeed on retry
    #[error("permanent backend error ({backend}): {summary}")]
    PermanentBackend {
        /// Backend that failed
        backend: BackendId,
        /// Classified, sanitized summary
        summary: String,
    },

    /// Admission denied by the cost ledger
    #[error("{period} budget exceeded: requested {requested}, remaining {remaining} of {limit}")]
    BudgetExceeded {
        /// Period whose limit would be crossed
        period: BudgetPeriod,
        /// Projected cost of the request
        requested: Usd,
        /// Budget left in the period, net of reservations
        remaining: Usd,
        /// Configured limit for the period
        limit: Usd,
    },

    /// Admission denied by the rate limiter for every candidate backend
    #[error("rate limit exceeded for {}", join_ids(.backends))]
    RateLimitExceeded {
        /// Backends that were throttled
        backends: Vec<BackendId>,
    },

    /// Malformed or unsafe input, rejected before any backend contact
    #[error("invalid request: {0}")]
    Validation(String),

    /// Signature invalid or replay detected
    #[error("security violation: {0}")]
    Security(#[from] SecurityViolation),

    /// Every synthesis member failed
    #[error("all {} synthesis backends failed: {}", .failures.len(), join_failures(.failures))]
    AggregateSynthesis {
        /// Failure of each member
        failures: Vec<BackendFailure>,
    },

    /// Every backend in the fallback chain failed
    #[error("fallback chain exhausted after {} attempts: {}", .attempts.len(), join_failures(.attempts))]
    FallbackExhausted {
        /// Failure of each attempt, in chain order
        attempts: Vec<BackendFailure>,
    },

    /// Backend id not registered with the factory
    #[error("backend not found: {backend}")]
    BackendNotFound {
        /// Requested backend id
        backend: String,
    },

    /// No backend could be planned for the request
    #[error("no backend available for this request")]
    NoBackendAvailable,

    /// Storage collaborator failure
    #[error("storage error: {0}")]
    Storage(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Stable snake_case label used in audit records and logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TransientBackend { .. } => "transient_backend",
            Self::PermanentBackend { .. } => "permanent_backend",
            Self::BudgetExceeded { .. } => "budget_exceeded",
            Self::RateLimitExceeded { .. } => "rate_limit_exceeded",
            Self::Validation(_) => "validation",
            Self::Security(_) => "security",
            Self::AggregateSynthesis { .. } => "aggregate_synthesis",
            Self::FallbackExhausted { .. } => "fallback_exhausted",
            Self::BackendNotFound { .. } => "backend_not_found",
            Self::NoBackendAvailable => "no_backend_available",
            Self::Storage(_) => "storage",
            Self::Config(_) => "config",
            Self::Internal(_) => "internal",
        }
    }

    /// Error for a chain that ended after one failed attempt.
    ///
    /// Timeouts count as transient.
    #[must_use]
    pub fn from_failure(failure: BackendFailure) -> Self {
        let BackendFailure {
            backend,
            kind,
            reason,
        } = failure;
        match kind {
            FailureKind::Throttled => Self::RateLimitExceeded {
                backends: vec![backend],
            },
            FailureKind::Timeout | FailureKind::Transient => Self::TransientBackend {
                backend,
                summary: reason,
            },
            FailureKind::Permanent => Self::PermanentBackend {
                backend,
                summary: reason,
            },
        }
    }
}

impl From<PrismError> for GatewayError {
    fn from(err: PrismError) -> Self {
        match err {
            PrismError::Config(e) => Self::Config(e),
            PrismError::Validation(msg) => Self::Validation(msg),
            other => Self::Internal(other.to_string()),
        }
    }
}

/// Whether an adapter failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Timeout, 5xx, connection reset, upstream throttling
    Transient,
    /// Auth failure, invalid request, upstream quota exhausted
    Permanent,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => f.write_str("transient"),
            Self::Permanent => f.write_str("permanent"),
        }
    }
}

/// Classified error returned by a backend adapter.
///
/// The summary is written by the adapter and never contains upstream
/// response bodies.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{class}: {summary}")]
pub struct BackendError {
    /// Retry classification
    pub class: ErrorClass,
    /// Short sanitized description
    pub summary: String,
}

impl BackendError {
    /// A retryable failure.
    pub fn transient(summary: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Transient,
            summary: summary.into(),
        }
    }

    /// A non-retryable failure.
    pub fn permanent(summary: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Permanent,
            summary: summary.into(),
        }
    }

    /// Whether the failure may succeed on retry.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.class == ErrorClass::Transient
    }
}

/// How a single backend attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Rejected by the rate limiter before the call
    Throttled,
    /// Cancelled at its deadline
    Timeout,
    /// Transient adapter error
    Transient,
    /// Permanent adapter error
    Permanent,
}

impl FailureKind {
    /// Stable snake_case label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Throttled => "throttled",
            Self::Timeout => "timeout",
            Self::Transient => "transient",
            Self::Permanent => "permanent",
        }
    }
}

impl From<ErrorClass> for FailureKind {
    fn from(class: ErrorClass) -> Self {
        match class {
            ErrorClass::Transient => Self::Transient,
            ErrorClass::Permanent => Self::Permanent,
        }
    }
}

/// One backend's failure within a fallback chain or synthesis fan-out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendFailure {
    /// Backend that failed
    pub backend: BackendId,
    /// Failure classification
    pub kind: FailureKind,
    /// Sanitized reason
    pub reason: String,
}

impl BackendFailure {
    /// Build a failure record.
    pub fn new(backend: BackendId, kind: FailureKind, reason: impl Into<String>) -> Self {
        Self {
            backend,
            kind,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for BackendFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({})", self.backend, self.kind.as_str(), self.reason)
    }
}

/// Request signature or replay check failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SecurityViolation {
    /// Request carries no signature
    #[error("request is not signed")]
    MissingSignature,

    /// Timestamp older than the accepted window
    #[error("signature timestamp is {age_secs}s old, window is {window_secs}s")]
    StaleTimestamp {
        /// Age of the request in seconds
        age_secs: i64,
        /// Accepted window in seconds
        window_secs: u64,
    },

    /// Timestamp too far in the future
    #[error("signature timestamp is {ahead_secs}s in the future, window is {window_secs}s")]
    FutureTimestamp {
        /// Seconds ahead of the local clock
        ahead_secs: i64,
        /// Accepted window in seconds
        window_secs: u64,
    },

    /// Signature doesn't match the record
    #[error("signature mismatch")]
    InvalidSignature,

    /// Nonce already used by an accepted request
    #[error("nonce has already been used")]
    ReplayedNonce,
}

/// Response cache failure. Callers treat these as misses.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Request parameters could not be canonicalized
    #[error("failed to build cache key: {0}")]
    Key(#[from] serde_json::Error),
}

fn join_ids(ids: &[BackendId]) -> String {
    ids.iter()
        .map(BackendId::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

fn join_failures(failures: &[BackendFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result type alias for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> BackendId {
        BackendId::new(s).expect("valid backend id")
    }

    #[test]
    fn test_error_display() {
        let err = GatewayError::BudgetExceeded {
            period: BudgetPeriod::Daily,
            requested: Usd::from_mills(100),
            remaining: Usd::from_mills(50),
            limit: Usd::from_mills(10_000),
        };
        assert_eq!(
            err.to_string(),
            "daily budget exceeded: requested $0.100, remaining $0.050 of $10.000"
        );

        let err = GatewayError::RateLimitExceeded {
            backends: vec![id("alpha"), id("beta")],
        };
        assert_eq!(err.to_string(), "rate limit exceeded for alpha, beta");
    }

    #[test]
    fn test_aggregate_lists_each_failure() {
        let err = GatewayError::AggregateSynthesis {
            failures: vec![
                BackendFailure::new(id("alpha"), FailureKind::Timeout, "deadline elapsed"),
                BackendFailure::new(id("beta"), FailureKind::Permanent, "authentication failed"),
            ],
        };
        let msg = err.to_string();
        assert!(msg.starts_with("all 2 synthesis backends failed"));
        assert!(msg.contains("alpha timeout (deadline elapsed)"));
        assert!(msg.contains("beta permanent (authentication failed)"));
    }

    #[test]
    fn test_from_failure_preserves_class() {
        let err = GatewayError::from_failure(BackendFailure::new(id("alpha"), FailureKind::Transient, "HTTP 503"));
        assert_eq!(err.kind(), "transient_backend");
        assert_eq!(err.to_string(), "transient backend error (alpha): HTTP 503");

        let err = GatewayError::from_failure(BackendFailure::new(id("alpha"), FailureKind::Timeout, "no response"));
        assert_eq!(err.kind(), "transient_backend");

        let err = GatewayError::from_failure(BackendFailure::new(id("alpha"), FailureKind::Permanent, "HTTP 401"));
        assert!(matches!(err, GatewayError::PermanentBackend { ref backend, .. } if backend == &id("alpha")));
    }

    #[test]
    fn test_security_violation_converts() {
        let err: GatewayError = SecurityViolation::ReplayedNonce.into();
        assert_eq!(err.kind(), "security");
        assert_eq!(err.to_string(), "security violation: nonce has already been used");
    }

    #[test]
    fn test_prism_validation_maps_to_validation() {
        let err: GatewayError = PrismError::Validation("bad id".to_string()).into();
        assert!(matches!(err, GatewayError::Validation(_)));
    }
}
