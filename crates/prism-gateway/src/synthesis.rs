//! Concurrent fan-out to every synthesis member under one deadline.

use crate::audit::Attempt;
use crate::backend::BackendAdapter;
use crate::error::{BackendFailure, FailureKind, GatewayError, Result};
use crate::fallback::{invoke, Invocation};
use crate::health::HealthMonitor;
use crate::rate_limit::RateLimiter;
use crate::request::{GenerationParams, GenerationResult, SynthesisSummary};
use prism_core::{BackendId, Usd};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;

/// Scale `weights` so they sum to one.
///
/// If every weight is zero the members share equally.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn renormalize(weights: &[(BackendId, f64)]) -> Vec<(BackendId, f64)> {
    let total: f64 = weights.iter().map(|(_, w)| w.max(0.0)).sum();
    if total <= 0.0 {
        let share = 1.0 / weights.len().max(1) as f64;
        return weights.iter().map(|(id, _)| (id.clone(), share)).collect();
    }
    weights
        .iter()
        .map(|(id, w)| (id.clone(), w.max(0.0) / total))
        .collect()
}

/// Result of a fan-out.
#[derive(Debug)]
pub struct SynthesisOutcome {
    /// Combined result, or the error when no member succeeded
    pub result: Result<GenerationResult>,
    /// Every member attempt, in completion order
    pub attempts: Vec<Attempt>,
}

struct Contribution {
    index: usize,
    backend: BackendId,
    weight: f64,
    invocation: Invocation,
}

/// Runs synthesis members concurrently and combines their outputs.
///
/// Members still running at the deadline are cancelled and reported as
/// timeouts. The returned text is that of the contributor with the highest
/// renormalized weight; tokens and cost are summed over contributors.
#[derive(Debug)]
pub struct SynthesisCoordinator<'a> {
    limiter: &'a RateLimiter,
    health: &'a Arc<HealthMonitor>,
    deadline: Duration,
}

impl<'a> SynthesisCoordinator<'a> {
    /// Create a coordinator cancelling members after `deadline`.
    #[must_use]
    pub fn new(limiter: &'a RateLimiter, health: &'a Arc<HealthMonitor>, deadline: Duration) -> Self {
        Self {
            limiter,
            health,
            deadline,
        }
    }

    /// Fan `prompt` out to `members` and wait for all of them or the deadline.
    pub async fn execute(
        &self,
        members: Vec<(Arc<dyn BackendAdapter>, f64)>,
        prompt: &str,
        params: &GenerationParams,
        request_deadline: Instant,
    ) -> SynthesisOutcome {
        let started = Instant::now();
        let deadline = (started + self.deadline).min(request_deadline);

        let mut attempts = Vec::with_capacity(members.len());
        let mut failures: Vec<(usize, BackendFailure)> = Vec::new();
        let mut pending: HashMap<BackendId, usize> = HashMap::new();
        let mut tasks = JoinSet::new();

        for (index, (adapter, weight)) in members.into_iter().enumerate() {
            let id = adapter.id().clone();
            if !self.limiter.allow(&id) {
                let failure = BackendFailure::new(id, FailureKind::Throttled, "rate limit reached");
                attempts.push(Attempt::failed(&failure, Duration::ZERO));
                failures.push((index, failure));
                continue;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            let timeout = adapter
                .descriptor()
                .timeout
                .map_or(remaining, |t| t.min(remaining));
            let health = Arc::clone(self.health);
            let prompt = prompt.to_string();
            let params = params.clone();

            pending.insert(id, index);
            tasks.spawn(async move {
                let (attempt, outcome) = invoke(&*adapter, &prompt, &params, timeout, &health).await;
                (index, weight, attempt, outcome)
            });
        }

        if pending.is_empty() {
            let error = if failures.is_empty() {
                GatewayError::NoBackendAvailable
            } else {
                GatewayError::RateLimitExceeded {
                    backends: failures.into_iter().map(|(_, f)| f.backend).collect(),
                }
            };
            return SynthesisOutcome {
                result: Err(error),
                attempts,
            };
        }

        let mut contributions = Vec::new();
        let mut deadline_hit = false;
        loop {
            let next = if deadline_hit {
                tasks.join_next().await
            } else {
                match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        tracing::warn!(
                            pending = pending.len(),
                            "Synthesis deadline reached, cancelling remaining backends"
                        );
                        deadline_hit = true;
                        tasks.abort_all();
                        continue;
                    }
                }
            };

            match next {
                None => break,
                Some(Ok((index, weight, attempt, outcome))) => {
                    let backend = attempt.backend.clone();
                    pending.remove(&backend);
                    attempts.push(attempt);
                    match outcome {
                        Ok(invocation) => contributions.push(Contribution {
                            index,
                            backend,
                            weight,
                            invocation,
                        }),
                        Err(failure) => failures.push((index, failure)),
                    }
                }
                Some(Err(err)) if err.is_cancelled() => {}
                Some(Err(err)) => {
                    tracing::error!(error = %err, "Synthesis member task failed");
                }
            }
        }

        for (backend, index) in pending {
            let (kind, reason) = if deadline_hit {
                (FailureKind::Timeout, "cancelled at synthesis deadline")
            } else {
                (FailureKind::Transient, "member task ended unexpectedly")
            };
            self.health.record_failure(&backend, reason);
            let failure = BackendFailure::new(backend, kind, reason);
            attempts.push(Attempt::failed(&failure, started.elapsed()));
            failures.push((index, failure));
        }

        failures.sort_by_key(|(index, _)| *index);
        let failures: Vec<BackendFailure> = failures.into_iter().map(|(_, f)| f).collect();

        if contributions.is_empty() {
            return SynthesisOutcome {
                result: Err(GatewayError::AggregateSynthesis { failures }),
                attempts,
            };
        }

        let result = combine(contributions, failures, started.elapsed());
        SynthesisOutcome {
            result: Ok(result),
            attempts,
        }
    }
}

fn combine(
    mut contributions: Vec<Contribution>,
    failures: Vec<BackendFailure>,
    latency: Duration,
) -> GenerationResult {
    contributions.sort_by_key(|c| c.index);

    let raw: Vec<(BackendId, f64)> = contributions
        .iter()
        .map(|c| (c.backend.clone(), c.weight))
        .collect();
    let weights = renormalize(&raw);

    // Highest weight wins; ties go to the smaller id.
    let mut best = 0;
    for (i, (id, weight)) in weights.iter().enumerate().skip(1) {
        let (best_id, best_weight) = &weights[best];
        match weight.total_cmp(best_weight) {
            Ordering::Greater => best = i,
            Ordering::Equal if id < best_id => best = i,
            _ => {}
        }
    }
    let chosen = &contributions[best];
    let backend_id = chosen.backend.clone();
    let text = chosen.invocation.output.text.clone();

    let token_count = contributions
        .iter()
        .map(|c| c.invocation.output.token_count)
        .fold(0u32, u32::saturating_add);
    let cost: Usd = contributions.iter().map(|c| c.invocation.cost).sum();

    tracing::debug!(
        chosen = %backend_id,
        contributors = contributions.len(),
        failed = failures.len(),
        "Synthesis combined"
    );

    GenerationResult {
        backend_id,
        text,
        token_count,
        cost,
        latency,
        cache_hit: false,
        synthesis: Some(SynthesisSummary { weights, failures }),
    }
}
