//! Backend adapter interface and descriptor.

use crate::error::BackendError;
use crate::request::GenerationParams;
use async_trait::async_trait;
use prism_core::{BackendConfig, BackendId, BackendKind, TokenPrice, Usd};
use std::time::Duration;

/// Output of a successful backend call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendOutput {
    /// Generated text
    pub text: String,
    /// Tokens billed (prompt + completion) as reported by the backend
    pub token_count: u32,
}

/// Uniform contract for external generation backends.
///
/// Adapters classify every failure as transient or permanent and summarize
/// it without upstream response bodies. Cancellation happens by dropping
/// the returned future; deadlines are applied by the caller.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    /// Static description of this backend.
    fn descriptor(&self) -> &BackendDescriptor;

    /// Generate text for an already sanitized prompt.
    async fn call(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<BackendOutput, BackendError>;

    /// Backend id, shorthand for `descriptor().id`.
    fn id(&self) -> &BackendId {
        &self.descriptor().id
    }
}

/// Immutable description of a configured backend.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendDescriptor {
    /// Unique id
    pub id: BackendId,
    /// Adapter kind
    pub kind: BackendKind,
    /// Model name
    pub model: String,
    /// Capability tags
    pub capabilities: Vec<String>,
    /// Static quality weight in [0, 1]
    pub quality: f64,
    /// Price per thousand tokens
    pub cost_per_1k_tokens: TokenPrice,
    /// Synthesis weight in [0, 1]; assigned by the factory when unset
    pub synthesis_weight: Option<f64>,
    /// Whether the backend takes part in synthesis
    pub synthesis_eligible: bool,
    /// Whether the backend runs on the local machine
    pub is_local: bool,
    /// Endpoint base URL
    pub endpoint: Option<String>,
    /// Environment variable holding the credential
    pub credential_env: Option<String>,
    /// Per-call timeout
    pub timeout: Option<Duration>,
}

impl BackendDescriptor {
    /// Descriptor with neutral defaults, for programmatic adapters.
    #[must_use]
    pub fn new(id: BackendId, kind: BackendKind) -> Self {
        Self {
            id,
            kind,
            model: String::new(),
            capabilities: Vec::new(),
            quality: 0.5,
            cost_per_1k_tokens: TokenPrice::ZERO,
            synthesis_weight: None,
            synthesis_eligible: true,
            is_local: kind.is_local(),
            endpoint: kind.default_endpoint().map(str::to_string),
            credential_env: None,
            timeout: None,
        }
    }

    /// Build from a configuration entry.
    #[must_use]
    pub fn from_config(config: &BackendConfig) -> Self {
        Self {
            id: config.id.clone(),
            kind: config.kind,
            model: config.model.clone(),
            capabilities: config.capabilities.clone(),
            quality: config.quality,
            cost_per_1k_tokens: TokenPrice::from_dollars(config.cost_per_1k_tokens_usd),
            synthesis_weight: config.synthesis_weight,
            synthesis_eligible: config.synthesis,
            is_local: config.kind.is_local(),
            endpoint: config
                .endpoint
                .clone()
                .or_else(|| config.kind.default_endpoint().map(str::to_string)),
            credential_env: config.credential_env.clone(),
            timeout: config.timeout_ms.map(Duration::from_millis),
        }
    }

    /// Set the model name.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Set the static quality weight.
    #[must_use]
    pub fn with_quality(mut self, quality: f64) -> Self {
        self.quality = quality;
        self
    }

    /// Set the price per thousand tokens.
    #[must_use]
    pub fn with_cost_per_1k(mut self, cost: impl Into<TokenPrice>) -> Self {
        self.cost_per_1k_tokens = cost.into();
        self
    }

    /// Set the synthesis weight.
    #[must_use]
    pub fn with_synthesis_weight(mut self, weight: f64) -> Self {
        self.synthesis_weight = Some(weight);
        self
    }

    /// Include or exclude the backend from synthesis.
    #[must_use]
    pub fn with_synthesis(mut self, eligible: bool) -> Self {
        self.synthesis_eligible = eligible;
        self
    }

    /// Mark the backend as local.
    #[must_use]
    pub fn with_local(mut self, is_local: bool) -> Self {
        self.is_local = is_local;
        self
    }

    /// Set the per-call timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Add a capability tag.
    #[must_use]
    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.push(capability.into());
        self
    }

    /// Cost of `tokens` at this backend's price.
    #[must_use]
    pub fn cost_for(&self, tokens: u32) -> Usd {
        self.cost_per_1k_tokens.cost_for(u64::from(tokens))
    }

    /// Whether calls are free and stay on the machine.
    #[must_use]
    pub fn is_zero_cost_local(&self) -> bool {
        self.is_local && self.cost_per_1k_tokens.is_zero()
    }
}
