//! Prism Gateway - Multi-backend text generation with privacy, budget and
//! reliability controls.
//!
//! A [`Gateway`] accepts generation requests and serves each one on the
//! best available backend, or fans it out to several and combines the
//! answers. Prompts are stripped of PII before they leave the process,
//! spend is admitted against daily and monthly budgets, and every call
//! leaves one sanitized audit record.
//!
//! # Modules
//!
//! - [`orchestrator`] - The [`Gateway`] pipeline and its builder
//! - [`backend`] / [`backends`] - Adapter trait and OpenAI, Anthropic, Ollama adapters
//! - [`factory`] - Adapter registry and synthesis weights
//! - [`routing`] - Strategy-ordered route planning
//! - [`health`] - EWMA success and latency tracking
//! - [`fallback`] / [`synthesis`] - Chain and fan-out execution under deadlines
//! - [`ledger`] - Two-phase budget reservations
//! - [`rate_limit`] - Per-backend token buckets
//! - [`cache`] - LRU response cache
//! - [`sanitizer`] - PII detection and redaction
//! - [`signer`] - HMAC request signing and replay protection
//! - [`audit`] / [`store`] - Decision traces and persistence seams
//!
//! # Example
//!
//! ```ignore
//! use prism_gateway::{Gateway, GatewayConfig, MemoryStore, RequestContext};
//! use std::sync::Arc;
//!
//! let store = Arc::new(MemoryStore::new());
//! let gateway = Gateway::builder(GatewayConfig::load()?)
//!     .with_audit_sink(store.clone())
//!     .build()
//!     .await?;
//!
//! let result = gateway.generate(RequestContext::new("Summarize RFC 9110")).await?;
//! println!("{} answered for {}", result.backend_id, result.cost);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod audit;
pub mod backend;
pub mod backends;
pub mod cache;
pub mod error;
pub mod factory;
pub mod fallback;
pub mod health;
pub mod ledger;
pub mod orchestrator;
pub mod rate_limit;
pub mod request;
pub mod routing;
pub mod sanitizer;
pub mod signer;
pub mod store;
pub mod synthesis;
pub mod telemetry;

pub use audit::{Attempt, AttemptOutcome, AuditLog, AuditOutcome, AuditRecord, CacheOutcome, DecisionTrace};
pub use backend::{BackendAdapter, BackendDescriptor, BackendOutput};
pub use cache::{CacheKey, ResponseCache};
pub use error::{
    BackendError, BackendFailure, CacheError, ErrorClass, FailureKind, GatewayError, Result,
    SecurityViolation,
};
pub use factory::BackendFactory;
pub use health::{HealthMonitor, HealthSnapshot};
pub use ledger::{BudgetEvent, BudgetPeriod, Clock, CostLedger, LedgerSnapshot, LedgerUsage, Reservation};
pub use orchestrator::{Gateway, GatewayBuilder};
pub use rate_limit::RateLimiter;
pub use request::{GenerationParams, GenerationResult, RequestContext, RequestMode, SynthesisSummary};
pub use routing::{RoutePlan, Router, RoutingMode, RoutingStrategy};
pub use sanitizer::{PiiCategory, PiiDetection, SanitizeResult, Sanitizer};
pub use signer::RequestSigner;
pub use store::{AuditSink, LedgerStore, MemoryStore, TracingSink};

pub use prism_core::{BackendId, BackendKind, GatewayConfig, RateLimitConfig, RequestId, TokenPrice, Usd};
