//! Request and result types exchanged with gateway callers.

use crate::error::BackendFailure;
use crate::routing::RoutingMode;
use chrono::{DateTime, Utc};
use prism_core::{BackendId, RequestId, Usd};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How a request should be served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestMode {
    /// One backend, with fallback
    #[default]
    Single,
    /// Fan out to every synthesis-eligible backend and combine
    Synthesis,
    /// Item of a batch call; served on the single path
    Batch,
}

impl RequestMode {
    /// Stable snake_case label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Synthesis => "synthesis",
            Self::Batch => "batch",
        }
    }
}

/// Caller-supplied generation parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    /// Maximum tokens to generate
    pub max_tokens: u32,
    /// Sampling temperature (0.0 - 2.0)
    pub temperature: f32,
    /// Minimum static quality a backend must have to be preferred
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_quality: Option<f32>,
    /// Routing strategy override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<RoutingMode>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: 512,
            temperature: 0.7,
            target_quality: None,
            strategy: None,
        }
    }
}

/// A single generation request, owned by the gateway for the call's lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestContext {
    /// Caller-visible request id
    pub request_id: RequestId,
    /// Prompt text as received
    pub prompt: String,
    /// Prompt after PII redaction; set by the gateway
    #[serde(default)]
    pub sanitized_prompt: Option<String>,
    /// Requested mode
    pub mode: RequestMode,
    /// Generation parameters
    pub params: GenerationParams,
    /// Backend to try first, if healthy enough to be planned
    #[serde(default)]
    pub preferred_backend: Option<BackendId>,
    /// Creation time; covered by the signature
    pub created_at: DateTime<Utc>,
    /// Single-use token for replay protection
    pub nonce: String,
    /// Hex HMAC over the signed fields
    #[serde(default)]
    pub signature: Option<String>,
}

impl RequestContext {
    /// Create an unsigned single-mode request with default parameters.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            request_id: RequestId::generate(),
            prompt: prompt.into(),
            sanitized_prompt: None,
            mode: RequestMode::Single,
            params: GenerationParams::default(),
            preferred_backend: None,
            created_at: Utc::now(),
            nonce: random_nonce(),
            signature: None,
        }
    }

    /// Set the request mode.
    #[must_use]
    pub fn with_mode(mut self, mode: RequestMode) -> Self {
        self.mode = mode;
        self
    }

    /// Replace all generation parameters.
    #[must_use]
    pub fn with_params(mut self, params: GenerationParams) -> Self {
        self.params = params;
        self
    }

    /// Set the maximum output tokens.
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.params.max_tokens = max_tokens;
        self
    }

    /// Set the sampling temperature.
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.params.temperature = temperature;
        self
    }

    /// Set the target quality.
    #[must_use]
    pub fn with_target_quality(mut self, quality: f32) -> Self {
        self.params.target_quality = Some(quality);
        self
    }

    /// Override the routing strategy.
    #[must_use]
    pub fn with_strategy(mut self, strategy: RoutingMode) -> Self {
        self.params.strategy = Some(strategy);
        self
    }

    /// Hint the backend to try first.
    #[must_use]
    pub fn with_preferred_backend(mut self, backend: BackendId) -> Self {
        self.preferred_backend = Some(backend);
        self
    }

    /// Use a caller-chosen request id.
    #[must_use]
    pub fn with_request_id(mut self, request_id: RequestId) -> Self {
        self.request_id = request_id;
        self
    }

    /// Override the creation timestamp.
    #[must_use]
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Override the nonce.
    #[must_use]
    pub fn with_nonce(mut self, nonce: impl Into<String>) -> Self {
        self.nonce = nonce.into();
        self
    }

    /// The prompt that may leave the process: sanitized if available.
    #[must_use]
    pub fn outbound_prompt(&self) -> &str {
        self.sanitized_prompt.as_deref().unwrap_or(&self.prompt)
    }

    /// Deterministic serialization of the signed request content.
    ///
    /// Keys are emitted in sorted order, so the same content always yields
    /// the same bytes.
    #[must_use]
    pub fn canonical_payload(&self) -> String {
        serde_json::json!({
            "max_tokens": self.params.max_tokens,
            "mode": self.mode.as_str(),
            "preferred_backend": self.preferred_backend.as_ref().map(BackendId::as_str),
            "prompt": self.prompt,
            "strategy": self.params.strategy.map(RoutingMode::as_str),
            "target_quality": self.params.target_quality.map(|q| format!("{q:.3}")),
            "temperature": format!("{:.3}", self.params.temperature),
        })
        .to_string()
    }
}

fn random_nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Contributors and failures of a synthesis call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisSummary {
    /// Renormalized weights of successful members, summing to 1
    pub weights: Vec<(BackendId, f64)>,
    /// Members that failed or timed out
    pub failures: Vec<BackendFailure>,
}

/// Final output of a gateway call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResult {
    /// Backend that produced the text
    pub backend_id: BackendId,
    /// Generated text
    pub text: String,
    /// Tokens billed for the call
    pub token_count: u32,
    /// Cost charged
    pub cost: Usd,
    /// Wall time of the call
    pub latency: Duration,
    /// Whether the result was served from the response cache
    pub cache_hit: bool,
    /// Synthesis details, for synthesis calls
    #[serde(default)]
    pub synthesis: Option<SynthesisSummary>,
}

/// Rough token estimate: one token per four characters, at least one.
#[must_use]
pub fn estimate_tokens(text: &str) -> u32 {
    let chars = text.chars().count();
    u32::try_from(chars.div_ceil(4)).unwrap_or(u32::MAX).max(1)
}
