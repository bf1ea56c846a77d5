//! Ordered fallback execution over a planned route.
//!
//! Each backend in the chain is tried at most once. An attempt is bounded by
//! the smallest of the backend's own timeout, the fallback deadline and what
//! is left of the request deadline; an attempt that hits its bound is
//! cancelled and the next backend is tried.

use crate::audit::Attempt;
use crate::backend::{BackendAdapter, BackendOutput};
use crate::error::{BackendFailure, FailureKind, GatewayError, Result};
use crate::factory::BackendFactory;
use crate::health::HealthMonitor;
use crate::rate_limit::RateLimiter;
use crate::request::{GenerationParams, GenerationResult};
use prism_core::{BackendId, Usd};
use std::time::Duration;
use tokio::time::Instant;

/// Successful backend call.
#[derive(Debug, Clone)]
pub(crate) struct Invocation {
    pub output: BackendOutput,
    pub cost: Usd,
    pub latency: Duration,
}

/// Call `adapter` within `timeout`, recording the outcome with `health`.
pub(crate) async fn invoke(
    adapter: &dyn BackendAdapter,
    prompt: &str,
    params: &GenerationParams,
    timeout: Duration,
    health: &HealthMonitor,
) -> (Attempt, std::result::Result<Invocation, BackendFailure>) {
    let id = adapter.id().clone();
    let started = Instant::now();
    let outcome = tokio::time::timeout(timeout, adapter.call(prompt, params)).await;
    let latency = started.elapsed();

    match outcome {
        Ok(Ok(output)) => {
            health.record_success(&id, latency, output.token_count);
            let cost = adapter.descriptor().cost_for(output.token_count);
            let attempt = Attempt::success(id, output.token_count, cost, latency);
            (
                attempt,
                Ok(Invocation {
                    output,
                    cost,
                    latency,
                }),
            )
        }
        Ok(Err(err)) => {
            health.record_failure(&id, &err.summary);
            let failure = BackendFailure::new(id, err.class.into(), err.summary);
            (Attempt::failed(&failure, latency), Err(failure))
        }
        Err(_) => {
            let reason = format!("no response within {}ms", timeout.as_millis());
            health.record_failure(&id, &reason);
            let failure = BackendFailure::new(id, FailureKind::Timeout, reason);
            (Attempt::failed(&failure, latency), Err(failure))
        }
    }
}

/// Result of walking a chain.
#[derive(Debug)]
pub struct ChainOutcome {
    /// Result from the first backend that succeeded, or the chain error
    pub result: Result<GenerationResult>,
    /// Every attempt made, in order
    pub attempts: Vec<Attempt>,
}

/// Walks a route, trying each backend until one returns text.
#[derive(Debug)]
pub struct FallbackExecutor<'a> {
    factory: &'a BackendFactory,
    limiter: &'a RateLimiter,
    health: &'a HealthMonitor,
    attempt_deadline: Duration,
}

impl<'a> FallbackExecutor<'a> {
    /// Create an executor bounding each attempt by `attempt_deadline`.
    #[must_use]
    pub fn new(
        factory: &'a BackendFactory,
        limiter: &'a RateLimiter,
        health: &'a HealthMonitor,
        attempt_deadline: Duration,
    ) -> Self {
        Self {
            factory,
            limiter,
            health,
            attempt_deadline,
        }
    }

    /// Try `chain` in order.
    ///
    /// Fails with `NoBackendAvailable` for an empty chain,
    /// `RateLimitExceeded` if every backend was throttled, the classified
    /// `TransientBackend` / `PermanentBackend` error when only one attempt
    /// was made, and `FallbackExhausted` otherwise.
    pub async fn execute(
        &self,
        chain: &[BackendId],
        prompt: &str,
        params: &GenerationParams,
        request_deadline: Instant,
    ) -> ChainOutcome {
        let mut attempts = Vec::with_capacity(chain.len());
        let mut failures: Vec<BackendFailure> = Vec::new();

        for id in chain {
            let Ok(adapter) = self.factory.get(id) else {
                tracing::warn!(backend = %id, "Planned backend is not registered, skipping");
                continue;
            };

            if !self.limiter.allow(id) {
                let failure =
                    BackendFailure::new(id.clone(), FailureKind::Throttled, "rate limit reached");
                attempts.push(Attempt::failed(&failure, Duration::ZERO));
                failures.push(failure);
                continue;
            }

            let remaining = request_deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                let failure = BackendFailure::new(
                    id.clone(),
                    FailureKind::Timeout,
                    "request deadline exhausted before attempt",
                );
                attempts.push(Attempt::failed(&failure, Duration::ZERO));
                failures.push(failure);
                break;
            }

            let timeout = adapter
                .descriptor()
                .timeout
                .map_or(self.attempt_deadline, |t| t.min(self.attempt_deadline))
                .min(remaining);

            let (attempt, outcome) = invoke(&*adapter, prompt, params, timeout, self.health).await;
            attempts.push(attempt);

            match outcome {
                Ok(invocation) => {
                    tracing::debug!(
                        backend = %id,
                        tokens = invocation.output.token_count,
                        latency_ms = invocation.latency.as_millis(),
                        "Backend call succeeded"
                    );
                    let result = GenerationResult {
                        backend_id: id.clone(),
                        text: invocation.output.text,
                        token_count: invocation.output.token_count,
                        cost: invocation.cost,
                        latency: invocation.latency,
                        cache_hit: false,
                        synthesis: None,
                    };
                    return ChainOutcome {
                        result: Ok(result),
                        attempts,
                    };
                }
                Err(failure) => {
                    tracing::warn!(
                        backend = %id,
                        kind = failure.kind.as_str(),
                        reason = %failure.reason,
                        "Backend attempt failed, falling back"
                    );
                    failures.push(failure);
                }
            }
        }

        ChainOutcome {
            result: Err(chain_error(failures)),
            attempts,
        }
    }
}

fn chain_error(mut failures: Vec<BackendFailure>) -> GatewayError {
    if failures.is_empty() {
        return GatewayError::NoBackendAvailable;
    }
    if failures.iter().all(|f| f.kind == FailureKind::Throttled) {
        return GatewayError::RateLimitExceeded {
            backends: failures.into_iter().map(|f| f.backend).collect(),
        };
    }
    if failures.len() == 1 {
        if let Some(failure) = failures.pop() {
            return GatewayError::from_failure(failure);
        }
    }
    GatewayError::FallbackExhausted { attempts: failures }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendDescriptor;
    use crate::error::BackendError;
    use async_trait::async_trait;
    use prism_core::{BackendKind, RateLimitConfig};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct SlowAdapter {
        descriptor: BackendDescriptor,
        delay: Duration,
        reply: std::result::Result<&'static str, BackendError>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl BackendAdapter for SlowAdapter {
        fn descriptor(&self) -> &BackendDescriptor {
            &self.descriptor
        }

        async fn call(
            &self,
            _prompt: &str,
            _params: &GenerationParams,
        ) -> std::result::Result<BackendOutput, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.reply.clone().map(|text| BackendOutput {
                text: text.to_string(),
                token_count: 100,
            })
        }
    }

    fn id(s: &str) -> BackendId {
        BackendId::new(s).expect("valid id")
    }

    fn adapter(
        name: &str,
        delay_ms: u64,
        reply: std::result::Result<&'static str, BackendError>,
    ) -> Arc<SlowAdapter> {
        Arc::new(SlowAdapter {
            descriptor: BackendDescriptor::new(id(name), BackendKind::Custom)
                .with_cost_per_1k(Usd::from_mills(20)),
            delay: Duration::from_millis(delay_ms),
            reply,
            calls: AtomicUsize::new(0),
        })
    }

    fn factory(adapters: &[Arc<SlowAdapter>]) -> BackendFactory {
        let mut factory = BackendFactory::new();
        for a in adapters {
            factory.register(a.clone()).expect("register");
        }
        factory
    }

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(30)
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_primary_falls_back_within_deadline() {
        let slow = adapter("slow", 5_000, Ok("late"));
        let fast = adapter("fast", 10, Ok("on time"));
        let factory = factory(&[slow.clone(), fast.clone()]);
        let limiter = RateLimiter::default();
        let health = HealthMonitor::new();
        let executor = FallbackExecutor::new(&factory, &limiter, &health, Duration::from_secs(2));

        let started = Instant::now();
        let outcome = executor
            .execute(&[id("slow"), id("fast")], "hi", &GenerationParams::default(), far_deadline())
            .await;
        let elapsed = started.elapsed();

        let result = outcome.result.expect("fallback succeeds");
        assert_eq!(result.backend_id, id("fast"));
        assert_eq!(result.text, "on time");
        assert_eq!(result.cost, Usd::from_mills(2));
        assert!(elapsed < Duration::from_millis(2_100), "took {elapsed:?}");

        assert_eq!(outcome.attempts.len(), 2);
        assert!(!outcome.attempts[0].is_success());
        assert!(outcome.attempts[1].is_success());
        assert_eq!(health.snapshot(&id("slow")).failures, 1);
        assert_eq!(health.snapshot(&id("fast")).successes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_backend_tried_once() {
        let a = adapter("aa", 0, Err(BackendError::transient("HTTP 503")));
        let b = adapter("bb", 0, Err(BackendError::permanent("HTTP 401")));
        let factory = factory(&[a.clone(), b.clone()]);
        let limiter = RateLimiter::default();
        let health = HealthMonitor::new();
        let executor = FallbackExecutor::new(&factory, &limiter, &health, Duration::from_secs(2));

        let outcome = executor
            .execute(&[id("aa"), id("bb")], "hi", &GenerationParams::default(), far_deadline())
            .await;

        match outcome.result {
            Err(GatewayError::FallbackExhausted { attempts }) => {
                assert_eq!(attempts.len(), 2);
                assert_eq!(attempts[0].kind, FailureKind::Transient);
                assert_eq!(attempts[1].kind, FailureKind::Permanent);
            }
            other => panic!("expected exhausted chain, got {other:?}"),
        }
        assert_eq!(a.calls.load(Ordering::SeqCst), 1);
        assert_eq!(b.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttled_chain_reports_rate_limit() {
        let a = adapter("aa", 0, Ok("unused"));
        let factory = factory(&[a.clone()]);
        let limiter = RateLimiter::new(RateLimitConfig {
            capacity: 1,
            refill_per_second: 0.0,
        });
        assert!(limiter.allow(&id("aa")));
        let health = HealthMonitor::new();
        let executor = FallbackExecutor::new(&factory, &limiter, &health, Duration::from_secs(2));

        let outcome = executor
            .execute(&[id("aa")], "hi", &GenerationParams::default(), far_deadline())
            .await;

        assert!(matches!(
            outcome.result,
            Err(GatewayError::RateLimitExceeded { ref backends }) if backends == &vec![id("aa")]
        ));
        assert_eq!(a.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_chain() {
        let factory = BackendFactory::new();
        let limiter = RateLimiter::default();
        let health = HealthMonitor::new();
        let executor = FallbackExecutor::new(&factory, &limiter, &health, Duration::from_secs(2));

        let outcome = executor
            .execute(&[], "hi", &GenerationParams::default(), far_deadline())
            .await;
        assert!(matches!(outcome.result, Err(GatewayError::NoBackendAvailable)));
        assert!(outcome.attempts.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_deadline_caps_attempt() {
        let slow = adapter("slow", 5_000, Ok("late"));
        let factory = factory(&[slow.clone()]);
        let limiter = RateLimiter::default();
        let health = HealthMonitor::new();
        let executor = FallbackExecutor::new(&factory, &limiter, &health, Duration::from_secs(2));

        let started = Instant::now();
        let deadline = started + Duration::from_millis(500);
        let outcome = executor
            .execute(&[id("slow")], "hi", &GenerationParams::default(), deadline)
            .await;

        assert!(matches!(outcome.result, Err(GatewayError::TransientBackend { .. })));
        assert!(started.elapsed() < Duration::from_millis(600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_attempt_keeps_classification() {
        let a = adapter("aa", 0, Err(BackendError::permanent("authentication failed")));
        let factory = factory(&[a.clone()]);
        let limiter = RateLimiter::default();
        let health = HealthMonitor::new();
        let executor = FallbackExecutor::new(&factory, &limiter, &health, Duration::from_secs(2));

        let outcome = executor
            .execute(&[id("aa")], "hi", &GenerationParams::default(), far_deadline())
            .await;

        match outcome.result {
            Err(GatewayError::PermanentBackend { backend, summary }) => {
                assert_eq!(backend, id("aa"));
                assert_eq!(summary, "authentication failed");
            }
            other => panic!("expected permanent backend error, got {other:?}"),
        }
        assert_eq!(outcome.attempts.len(), 1);
    }
}
