//! The gateway entry point.
//!
//! A call runs through a fixed sequence: validate, sanitize, verify, plan,
//! reserve budget, consult the cache, execute (fallback chain or synthesis),
//! settle the reservation, sanitize and cache the response, audit. Exactly
//! one audit record is written per call whatever the outcome.

use crate::audit::{AuditLog, AuditOutcome, AuditRecord, CacheOutcome};
use crate::backend::{BackendAdapter, BackendDescriptor};
use crate::cache::ResponseCache;
use crate::error::{GatewayError, Result};
use crate::factory::BackendFactory;
use crate::fallback::FallbackExecutor;
use crate::health::{HealthMonitor, HealthSnapshot};
use crate::ledger::{BudgetEvent, Clock, CostLedger, LedgerUsage};
use crate::rate_limit::RateLimiter;
use crate::request::{estimate_tokens, GenerationResult, RequestContext, RequestMode};
use crate::routing::{RoutePlan, Router, RoutingMode};
use crate::sanitizer::Sanitizer;
use crate::signer::RequestSigner;
use crate::store::{AuditSink, LedgerStore, TracingSink};
use crate::synthesis::SynthesisCoordinator;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use prism_core::{BackendId, GatewayConfig, RateLimitConfig, Usd};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio::time::Instant;

/// Where a request will be sent.
enum Route {
    Chain(RoutePlan),
    Synthesis(Vec<(Arc<dyn BackendAdapter>, f64)>),
}

impl Route {
    fn strategy_label(&self) -> &'static str {
        match self {
            Self::Chain(plan) => plan.strategy.as_str(),
            Self::Synthesis(_) => "synthesis",
        }
    }

    fn backends(&self) -> Vec<BackendId> {
        match self {
            Self::Chain(plan) => plan.chain.clone(),
            Self::Synthesis(members) => members.iter().map(|(a, _)| a.id().clone()).collect(),
        }
    }
}

/// Builder for [`Gateway`].
pub struct GatewayBuilder {
    config: GatewayConfig,
    adapters: Vec<Arc<dyn BackendAdapter>>,
    rate_limits: Vec<(BackendId, RateLimitConfig)>,
    signer: Option<RequestSigner>,
    ledger_store: Option<Arc<dyn LedgerStore>>,
    audit_sink: Option<Arc<dyn AuditSink>>,
    clock: Option<Clock>,
}

impl GatewayBuilder {
    /// Start from `config`. Backends listed there are built at
    /// [`build`](Self::build) time.
    #[must_use]
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            adapters: Vec::new(),
            rate_limits: Vec::new(),
            signer: None,
            ledger_store: None,
            audit_sink: None,
            clock: None,
        }
    }

    /// Register a programmatic adapter alongside the configured ones.
    #[must_use]
    pub fn with_adapter(mut self, adapter: Arc<dyn BackendAdapter>) -> Self {
        self.adapters.push(adapter);
        self
    }

    /// Dedicated token bucket for one backend.
    #[must_use]
    pub fn with_rate_limit(mut self, backend: BackendId, config: RateLimitConfig) -> Self {
        self.rate_limits.push((backend, config));
        self
    }

    /// Require and verify request signatures.
    ///
    /// Without a signer, requests are accepted unsigned.
    #[must_use]
    pub fn with_signer(mut self, signer: RequestSigner) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Persist ledger state to `store` and restore it at build time.
    #[must_use]
    pub fn with_ledger_store(mut self, store: Arc<dyn LedgerStore>) -> Self {
        self.ledger_store = Some(store);
        self
    }

    /// Write audit records to `sink` instead of the log.
    #[must_use]
    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit_sink = Some(sink);
        self
    }

    /// Read budget period boundaries from `clock`.
    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Validate configuration and assemble the gateway.
    ///
    /// # Errors
    /// Returns error if configuration is invalid, an adapter cannot be
    /// built or registered, or persisted ledger state cannot be loaded.
    pub async fn build(self) -> Result<Gateway> {
        let config = self.config;
        config.validate()?;

        let mut factory = BackendFactory::from_config(&config.backends)?;
        for adapter in self.adapters {
            factory.register(adapter)?;
        }

        let mut limiter = RateLimiter::new(config.rate_limit.clone());
        for backend in &config.backends {
            if let Some(limit) = &backend.rate_limit {
                limiter = limiter.with_backend(backend.id.clone(), limit.clone());
            }
        }
        for (backend, limit) in self.rate_limits {
            limiter = limiter.with_backend(backend, limit);
        }

        let mode: RoutingMode = config.routing.default_strategy.parse()?;
        let sanitizer = Arc::new(Sanitizer::from_config(&config.sanitizer)?);

        let ledger = match self.clock {
            Some(clock) => CostLedger::with_clock(&config.budget, clock),
            None => CostLedger::new(&config.budget),
        };
        if let Some(store) = &self.ledger_store {
            if let Some(snapshot) = store.load().await? {
                ledger.restore(&snapshot);
            }
        }

        if self.signer.is_none() {
            tracing::warn!("No request signer configured, accepting unsigned requests");
        }

        let audit_sink = self.audit_sink.unwrap_or_else(|| Arc::new(TracingSink));

        tracing::info!(
            backends = factory.len(),
            strategy = mode.as_str(),
            "Gateway initialized"
        );

        Ok(Gateway {
            router: Router::new(mode, config.routing.healthy_threshold),
            health: Arc::new(HealthMonitor::new()),
            limiter,
            ledger,
            cache: ResponseCache::new(&config.cache),
            audit: AuditLog::new(audit_sink, Arc::clone(&sanitizer)),
            sanitizer,
            signer: self.signer,
            ledger_store: self.ledger_store,
            persist_lock: AsyncMutex::new(()),
            factory,
            fallback_deadline: Duration::from_millis(config.deadlines.fallback_ms),
            synthesis_deadline: Duration::from_millis(config.deadlines.synthesis_ms),
            request_deadline: Duration::from_millis(config.deadlines.request_ms),
            max_prompt_chars: config.limits.max_prompt_chars,
            max_output_tokens: config.limits.max_output_tokens,
            batch_concurrency: config.limits.batch_concurrency.max(1),
            sanitize_responses: config.sanitizer.sanitize_responses,
        })
    }
}

/// Multi-backend generation gateway.
pub struct Gateway {
    factory: BackendFactory,
    router: Router,
    health: Arc<HealthMonitor>,
    limiter: RateLimiter,
    ledger: CostLedger,
    cache: ResponseCache,
    sanitizer: Arc<Sanitizer>,
    signer: Option<RequestSigner>,
    audit: AuditLog,
    ledger_store: Option<Arc<dyn LedgerStore>>,
    // Held from snapshot until the save completes, so saves land in order.
    persist_lock: AsyncMutex<()>,
    fallback_deadline: Duration,
    synthesis_deadline: Duration,
    request_deadline: Duration,
    max_prompt_chars: usize,
    max_output_tokens: u32,
    batch_concurrency: usize,
    sanitize_responses: bool,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("factory", &self.factory)
            .field("router", &self.router)
            .field("signed", &self.signer.is_some())
            .finish_non_exhaustive()
    }
}

impl Gateway {
    /// Start building a gateway from `config`.
    #[must_use]
    pub fn builder(config: GatewayConfig) -> GatewayBuilder {
        GatewayBuilder::new(config)
    }

    /// Build a gateway entirely from configuration, with signing enabled.
    ///
    /// # Errors
    /// Returns error if the signing secret is missing or the gateway cannot
    /// be built.
    pub async fn from_config(config: GatewayConfig) -> Result<Self> {
        let signer = RequestSigner::from_config(&config.signing)?;
        GatewayBuilder::new(config).with_signer(signer).build().await
    }

    /// Serve one request in the mode it carries.
    ///
    /// # Errors
    /// Returns the first failure of the pipeline; see [`GatewayError`].
    pub async fn generate(&self, ctx: RequestContext) -> Result<GenerationResult> {
        let started = Instant::now();
        let request_id = ctx.request_id.clone();
        let mut record = AuditRecord::new(request_id.clone(), ctx.mode);

        let result = self.serve(ctx, &mut record, started).await;

        record.timestamp = Utc::now();
        match &result {
            Ok(output) => {
                record.trace.chosen = Some(output.backend_id.clone());
                tracing::info!(
                    request_id = %request_id,
                    backend = %output.backend_id,
                    cost = %output.cost,
                    cache_hit = output.cache_hit,
                    latency_ms = output.latency.as_millis(),
                    "Request served"
                );
            }
            Err(e) => {
                record.outcome = AuditOutcome::from_error(e);
                tracing::warn!(request_id = %request_id, kind = e.kind(), "Request failed");
            }
        }
        self.audit.write(record).await;
        result
    }

    /// Serve `ctx` by fanning out to every synthesis-eligible backend.
    ///
    /// The request mode is set to synthesis; signed requests must be signed
    /// with that mode.
    ///
    /// # Errors
    /// Returns `AggregateSynthesis` if every member fails, or any pipeline
    /// error raised before the fan-out.
    pub async fn generate_synthesis(&self, ctx: RequestContext) -> Result<GenerationResult> {
        self.generate(ctx.with_mode(RequestMode::Synthesis)).await
    }

    /// Serve several independent requests with bounded concurrency.
    ///
    /// Results are returned in input order; one item failing does not
    /// affect the others.
    pub async fn generate_batch(
        &self,
        requests: Vec<RequestContext>,
    ) -> Vec<Result<GenerationResult>> {
        tracing::debug!(
            items = requests.len(),
            concurrency = self.batch_concurrency,
            "Processing batch"
        );
        stream::iter(requests)
            .map(|ctx| self.generate(ctx))
            .buffered(self.batch_concurrency)
            .collect()
            .await
    }

    /// Current spend, holds and limits.
    #[must_use]
    pub fn usage(&self) -> LedgerUsage {
        self.ledger.usage()
    }

    /// Health of every backend that has been called.
    #[must_use]
    pub fn health(&self) -> Vec<HealthSnapshot> {
        self.health.snapshots()
    }

    /// Subscribe to budget warnings.
    #[must_use]
    pub fn subscribe_budget_events(&self) -> broadcast::Receiver<BudgetEvent> {
        self.ledger.subscribe()
    }

    /// Registered backends in registration order.
    pub fn backends(&self) -> impl Iterator<Item = &BackendDescriptor> {
        self.factory.descriptors()
    }

    async fn serve(
        &self,
        mut ctx: RequestContext,
        record: &mut AuditRecord,
        started: Instant,
    ) -> Result<GenerationResult> {
        self.validate(&ctx)?;

        let sanitized = self.sanitizer.sanitize(&ctx.prompt);
        if sanitized.has_pii() {
            tracing::info!(
                request_id = %ctx.request_id,
                redactions = sanitized.pii_count(),
                "Redacted PII from prompt"
            );
        }
        record.prompt_excerpt.clone_from(&sanitized.text);
        ctx.sanitized_prompt = Some(sanitized.text);

        if let Some(signer) = &self.signer {
            signer.verify(&ctx)?;
        }

        let mut route = self.plan(&ctx);
        let projected = self.projected_cost(&route, &ctx);

        let reservation = match self.ledger.reserve(projected) {
            Ok(reservation) => reservation,
            Err(denial) => {
                let Some(local) = self.factory.zero_cost_local() else {
                    return Err(denial.into());
                };
                tracing::info!(
                    period = %denial.period,
                    backend = %local.id(),
                    "Budget exhausted, rerouting to free local backend"
                );
                record.trace.budget_rerouted = true;
                route = Route::Chain(RoutePlan {
                    strategy: self.router.default_mode(),
                    chain: vec![local.id().clone()],
                });
                self.ledger.reserve(Usd::ZERO)?
            }
        };

        record.trace.strategy = Some(route.strategy_label().to_string());
        record.trace.route = route.backends();

        let key = match ResponseCache::key_for(ctx.outbound_prompt(), &ctx.params, ctx.mode) {
            Ok(key) => Some(key).filter(|_| self.cache.is_enabled()),
            Err(e) => {
                tracing::warn!(error = %e, "Cache key unavailable, bypassing cache");
                None
            }
        };

        if let Some(key) = &key {
            if let Some(mut hit) = self.cache.get(key) {
                reservation.release();
                record.trace.cache = CacheOutcome::Hit;
                hit.cost = Usd::ZERO;
                hit.latency = started.elapsed();
                tracing::debug!(request_id = %ctx.request_id, "Served from cache");
                return Ok(hit);
            }
            record.trace.cache = CacheOutcome::Miss;
        }

        let request_deadline = started + self.request_deadline;
        let prompt = ctx.outbound_prompt();
        let (outcome, attempts) = match route {
            Route::Chain(plan) => {
                let executor = FallbackExecutor::new(
                    &self.factory,
                    &self.limiter,
                    &self.health,
                    self.fallback_deadline,
                );
                let outcome = executor
                    .execute(&plan.chain, prompt, &ctx.params, request_deadline)
                    .await;
                (outcome.result, outcome.attempts)
            }
            Route::Synthesis(members) => {
                let coordinator =
                    SynthesisCoordinator::new(&self.limiter, &self.health, self.synthesis_deadline);
                let outcome = coordinator
                    .execute(members, prompt, &ctx.params, request_deadline)
                    .await;
                (outcome.result, outcome.attempts)
            }
        };
        record.trace.attempts = attempts;

        let mut result = match outcome {
            Ok(mut result) => {
                result.cost = reservation.commit(result.cost);
                record.trace.cost_charged = result.cost;
                result
            }
            Err(e) => {
                reservation.release();
                return Err(e);
            }
        };
        self.persist_ledger().await;

        if self.sanitize_responses {
            let cleaned = self.sanitizer.sanitize(&result.text);
            if cleaned.has_pii() {
                tracing::info!(
                    request_id = %ctx.request_id,
                    redactions = cleaned.pii_count(),
                    "Redacted PII from response"
                );
            }
            result.text = cleaned.text;
        }
        result.latency = started.elapsed();
        if let Some(summary) = &result.synthesis {
            record.trace.synthesis_weights.clone_from(&summary.weights);
        }

        if let Some(key) = key {
            self.cache.put(key, result.clone(), self.cache.ttl());
        }
        Ok(result)
    }

    fn validate(&self, ctx: &RequestContext) -> Result<()> {
        if ctx.prompt.trim().is_empty() {
            return Err(GatewayError::Validation("prompt is empty".to_string()));
        }
        if ctx.prompt.contains('\0') {
            return Err(GatewayError::Validation("prompt contains NUL bytes".to_string()));
        }
        let chars = ctx.prompt.chars().count();
        if chars > self.max_prompt_chars {
            return Err(GatewayError::Validation(format!(
                "prompt is {chars} characters, limit is {}",
                self.max_prompt_chars
            )));
        }

        let params = &ctx.params;
        if params.max_tokens == 0 || params.max_tokens > self.max_output_tokens {
            return Err(GatewayError::Validation(format!(
                "max_tokens must be between 1 and {}",
                self.max_output_tokens
            )));
        }
        if !(0.0..=2.0).contains(&params.temperature) {
            return Err(GatewayError::Validation(
                "temperature must be between 0.0 and 2.0".to_string(),
            ));
        }
        if let Some(quality) = params.target_quality {
            if !(0.0..=1.0).contains(&quality) {
                return Err(GatewayError::Validation(
                    "target_quality must be between 0.0 and 1.0".to_string(),
                ));
            }
        }
        if let Some(preferred) = &ctx.preferred_backend {
            if !self.factory.contains(preferred) {
                return Err(GatewayError::BackendNotFound {
                    backend: preferred.to_string(),
                });
            }
        }
        Ok(())
    }

    fn plan(&self, ctx: &RequestContext) -> Route {
        match ctx.mode {
            RequestMode::Synthesis => Route::Synthesis(self.factory.synthesis_members()),
            RequestMode::Single | RequestMode::Batch => Route::Chain(self.router.plan(
                self.factory.descriptors(),
                &self.health,
                &ctx.params,
                ctx.preferred_backend.as_ref(),
            )),
        }
    }

    /// Worst-case cost: the priciest backend the chain may reach, or every
    /// member for synthesis, at prompt estimate plus `max_tokens`.
    fn projected_cost(&self, route: &Route, ctx: &RequestContext) -> Usd {
        let tokens = estimate_tokens(ctx.outbound_prompt()).saturating_add(ctx.params.max_tokens);
        match route {
            Route::Chain(plan) => plan
                .chain
                .iter()
                .filter_map(|id| self.factory.get(id).ok())
                .map(|adapter| adapter.descriptor().cost_for(tokens))
                .max()
                .unwrap_or(Usd::ZERO),
            Route::Synthesis(members) => members
                .iter()
                .map(|(adapter, _)| adapter.descriptor().cost_for(tokens))
                .sum(),
        }
    }

    async fn persist_ledger(&self) {
        let Some(store) = &self.ledger_store else {
            return;
        };
        let _guard = self.persist_lock.lock().await;
        if let Err(e) = store.save(&self.ledger.snapshot()).await {
            tracing::error!(error = %e, "Failed to persist ledger state");
        }
    }
}
