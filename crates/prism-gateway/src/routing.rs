//! Backend selection policies.
//!
//! A [`Router`] splits backends into the healthy set (score at or above the
//! threshold) and the rest. The chosen [`RoutingStrategy`] orders the
//! healthy set; the remaining backends follow by descending score. When no
//! backend is healthy, the strategy orders the backends sharing the highest
//! score, so a cold start still honours the policy. Every comparison falls
//! back to the backend id, making plans reproducible.

use crate::backend::BackendDescriptor;
use crate::error::GatewayError;
use crate::health::{HealthMonitor, HealthSnapshot, DEFAULT_HEALTHY_THRESHOLD};
use crate::request::GenerationParams;
use prism_core::BackendId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Selectable routing policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingMode {
    /// Highest static quality
    QualityFirst,
    /// Lowest price per token
    CostOptimized,
    /// Weighted blend of quality, cost and health
    #[default]
    Balanced,
    /// Lowest rolling average latency
    LatencyOptimized,
}

impl RoutingMode {
    /// Every mode.
    pub const ALL: [Self; 4] = [
        Self::QualityFirst,
        Self::CostOptimized,
        Self::Balanced,
        Self::LatencyOptimized,
    ];

    /// Stable snake_case name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::QualityFirst => "quality_first",
            Self::CostOptimized => "cost_optimized",
            Self::Balanced => "balanced",
            Self::LatencyOptimized => "latency_optimized",
        }
    }

    /// Strategy implementing this mode.
    #[must_use]
    pub fn strategy(self) -> &'static dyn RoutingStrategy {
        match self {
            Self::QualityFirst => &QualityFirst,
            Self::CostOptimized => &CostOptimized,
            Self::Balanced => &Balanced,
            Self::LatencyOptimized => &LatencyOptimized,
        }
    }
}

impl fmt::Display for RoutingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoutingMode {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|mode| mode.as_str() == s)
            .ok_or_else(|| GatewayError::Validation(format!("unknown routing strategy '{s}'")))
    }
}

/// A backend considered for routing, with its current health.
#[derive(Debug, Clone)]
pub struct Candidate<'a> {
    /// Static description
    pub descriptor: &'a BackendDescriptor,
    /// Health at planning time
    pub health: HealthSnapshot,
}

impl Candidate<'_> {
    fn id(&self) -> &BackendId {
        &self.descriptor.id
    }
}

/// Orders candidates best first. Implementations are stateless.
pub trait RoutingStrategy: Send + Sync {
    /// Snake_case name recorded in decision traces.
    fn name(&self) -> &'static str;

    /// Sort `candidates` best first, breaking ties by backend id.
    fn rank<'a>(&self, candidates: Vec<Candidate<'a>>) -> Vec<Candidate<'a>>;
}

/// Highest static quality first.
#[derive(Debug, Clone, Copy, Default)]
pub struct QualityFirst;

impl RoutingStrategy for QualityFirst {
    fn name(&self) -> &'static str {
        "quality_first"
    }

    fn rank<'a>(&self, mut candidates: Vec<Candidate<'a>>) -> Vec<Candidate<'a>> {
        candidates.sort_by(|a, b| {
            b.descriptor
                .quality
                .total_cmp(&a.descriptor.quality)
                .then_with(|| a.id().cmp(b.id()))
        });
        candidates
    }
}

/// Lowest price per token first.
///
/// Charged cost is always computed from the descriptor price, so the
/// historical cost per token of a backend equals that price.
#[derive(Debug, Clone, Copy, Default)]
pub struct CostOptimized;

impl RoutingStrategy for CostOptimized {
    fn name(&self) -> &'static str {
        "cost_optimized"
    }

    fn rank<'a>(&self, mut candidates: Vec<Candidate<'a>>) -> Vec<Candidate<'a>> {
        candidates.sort_by(|a, b| {
            a.descriptor
                .cost_per_1k_tokens
                .cmp(&b.descriptor.cost_per_1k_tokens)
                .then_with(|| a.id().cmp(b.id()))
        });
        candidates
    }
}

/// `0.5 * quality / max_quality + 0.3 * (1 - cost / max_cost) + 0.2 * health`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Balanced;

impl Balanced {
    #[allow(clippy::cast_precision_loss)]
    fn scores(candidates: &[Candidate<'_>]) -> Vec<f64> {
        let max_quality = candidates
            .iter()
            .map(|c| c.descriptor.quality)
            .fold(0.0_f64, f64::max);
        let max_cost = candidates
            .iter()
            .map(|c| c.descriptor.cost_per_1k_tokens.micros())
            .max()
            .unwrap_or(0);

        candidates
            .iter()
            .map(|c| {
                let quality = if max_quality > 0.0 {
                    c.descriptor.quality / max_quality
                } else {
                    0.0
                };
                let cost = if max_cost > 0 {
                    c.descriptor.cost_per_1k_tokens.micros() as f64 / max_cost as f64
                } else {
                    0.0
                };
                0.5 * quality + 0.3 * (1.0 - cost) + 0.2 * c.health.score
            })
            .collect()
    }
}

impl RoutingStrategy for Balanced {
    fn name(&self) -> &'static str {
        "balanced"
    }

    fn rank<'a>(&self, candidates: Vec<Candidate<'a>>) -> Vec<Candidate<'a>> {
        let scores = Self::scores(&candidates);
        let mut scored: Vec<_> = scores.into_iter().zip(candidates).collect();
        scored.sort_by(|(sa, a), (sb, b)| sb.total_cmp(sa).then_with(|| a.id().cmp(b.id())));
        scored.into_iter().map(|(_, c)| c).collect()
    }
}

/// Lowest rolling average latency first; unmeasured backends last.
#[derive(Debug, Clone, Copy, Default)]
pub struct LatencyOptimized;

impl RoutingStrategy for LatencyOptimized {
    fn name(&self) -> &'static str {
        "latency_optimized"
    }

    fn rank<'a>(&self, mut candidates: Vec<Candidate<'a>>) -> Vec<Candidate<'a>> {
        candidates.sort_by(|a, b| {
            match (a.health.avg_latency, b.health.avg_latency) {
                (Some(la), Some(lb)) => la.cmp(&lb),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            }
            .then_with(|| a.id().cmp(b.id()))
        });
        candidates
    }
}

/// Ordered backends for one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutePlan {
    /// Strategy that ordered the chain
    pub strategy: RoutingMode,
    /// Backends in attempt order
    pub chain: Vec<BackendId>,
}

impl RoutePlan {
    /// First backend of the chain.
    #[must_use]
    pub fn primary(&self) -> Option<&BackendId> {
        self.chain.first()
    }
}

/// Plans routes from descriptors and health snapshots.
#[derive(Debug, Clone)]
pub struct Router {
    default_mode: RoutingMode,
    threshold: f64,
}

impl Default for Router {
    fn default() -> Self {
        Self::new(RoutingMode::default(), DEFAULT_HEALTHY_THRESHOLD)
    }
}

impl Router {
    /// Create a router.
    #[must_use]
    pub fn new(default_mode: RoutingMode, threshold: f64) -> Self {
        Self {
            default_mode,
            threshold,
        }
    }

    /// Strategy used when a request doesn't pick one.
    #[must_use]
    pub fn default_mode(&self) -> RoutingMode {
        self.default_mode
    }

    /// Order `descriptors` for a request. Reads health, mutates nothing.
    pub fn plan<'a>(
        &self,
        descriptors: impl IntoIterator<Item = &'a BackendDescriptor>,
        health: &HealthMonitor,
        params: &GenerationParams,
        preferred: Option<&BackendId>,
    ) -> RoutePlan {
        let mode = params.strategy.unwrap_or(self.default_mode);
        let candidates: Vec<Candidate<'a>> = descriptors
            .into_iter()
            .map(|descriptor| Candidate {
                health: health.snapshot(&descriptor.id),
                descriptor,
            })
            .collect();

        let (mut first, mut rest): (Vec<_>, Vec<_>) = candidates
            .into_iter()
            .partition(|c| c.health.score >= self.threshold);

        if first.is_empty() {
            let top = rest.iter().map(|c| c.health.score).fold(f64::NEG_INFINITY, f64::max);
            (first, rest) = rest.into_iter().partition(|c| c.health.score >= top);
        }

        if let Some(target) = params.target_quality {
            let target = f64::from(target);
            let (qualified, below): (Vec<_>, Vec<_>) =
                first.iter().cloned().partition(|c| c.descriptor.quality >= target);
            if !qualified.is_empty() {
                first = qualified;
                rest.extend(below);
            }
        }

        let mut chain: Vec<BackendId> = mode
            .strategy()
            .rank(first)
            .into_iter()
            .map(|c| c.id().clone())
            .collect();

        rest.sort_by(|a, b| {
            b.health
                .score
                .total_cmp(&a.health.score)
                .then_with(|| a.id().cmp(b.id()))
        });
        chain.extend(rest.into_iter().map(|c| c.id().clone()));

        if let Some(preferred) = preferred {
            if let Some(pos) = chain.iter().position(|id| id == preferred) {
                let id = chain.remove(pos);
                chain.insert(0, id);
            }
        }

        tracing::debug!(
            strategy = mode.as_str(),
            chain = ?chain.iter().map(BackendId::as_str).collect::<Vec<_>>(),
            "Planned route"
        );

        RoutePlan {
            strategy: mode,
            chain,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_core::{BackendKind, TokenPrice, Usd};
    use std::time::Duration;

    fn descriptor(id: &str, quality: f64, cost_mills: i64) -> BackendDescriptor {
        BackendDescriptor::new(BackendId::new(id).expect("valid id"), BackendKind::Custom)
            .with_quality(quality)
            .with_cost_per_1k(Usd::from_mills(cost_mills))
    }

    fn ids(plan: &RoutePlan) -> Vec<&str> {
        plan.chain.iter().map(BackendId::as_str).collect()
    }

    fn warm(monitor: &HealthMonitor, id: &str, latency_ms: u64) {
        monitor.record_success(&BackendId::new(id).expect("valid id"), Duration::from_millis(latency_ms), 1);
    }

    fn params(mode: RoutingMode) -> GenerationParams {
        GenerationParams {
            strategy: Some(mode),
            ..GenerationParams::default()
        }
    }

    fn set() -> Vec<BackendDescriptor> {
        vec![
            descriptor("premium", 0.95, 30),
            descriptor("standard", 0.75, 10),
            descriptor("budget", 0.5, 1),
        ]
    }

    #[test]
    fn test_mode_parsing() {
        for mode in RoutingMode::ALL {
            assert_eq!(mode.as_str().parse::<RoutingMode>().expect("known mode"), mode);
            assert_eq!(mode.strategy().name(), mode.as_str());
        }
        assert!("fastest".parse::<RoutingMode>().is_err());
    }

    #[test]
    fn test_quality_first() {
        let monitor = HealthMonitor::new();
        let backends = set();
        let plan = Router::default().plan(&backends, &monitor, &params(RoutingMode::QualityFirst), None);
        assert_eq!(ids(&plan), vec!["premium", "standard", "budget"]);
    }

    #[test]
    fn test_cost_optimized() {
        let monitor = HealthMonitor::new();
        let backends = set();
        let plan = Router::default().plan(&backends, &monitor, &params(RoutingMode::CostOptimized), None);
        assert_eq!(ids(&plan), vec!["budget", "standard", "premium"]);
    }

    #[test]
    fn test_cost_optimized_orders_sub_mill_prices() {
        let monitor = HealthMonitor::new();
        let backends = vec![
            descriptor("aa", 0.5, 0).with_cost_per_1k(TokenPrice::from_dollars(0.0004)),
            descriptor("bb", 0.5, 0).with_cost_per_1k(TokenPrice::from_dollars(0.0001)),
            descriptor("cc", 0.5, 0),
        ];
        let plan = Router::default().plan(&backends, &monitor, &params(RoutingMode::CostOptimized), None);
        assert_eq!(ids(&plan), vec!["cc", "bb", "aa"]);
    }

    #[test]
    fn test_balanced_formula() {
        let monitor = HealthMonitor::new();
        let backends = set();
        // premium: 0.5*1 + 0.3*0 + 0.1 = 0.6
        // standard: 0.5*0.789 + 0.3*0.667 + 0.1 = 0.695
        // budget: 0.5*0.526 + 0.3*0.967 + 0.1 = 0.653
        let plan = Router::default().plan(&backends, &monitor, &params(RoutingMode::Balanced), None);
        assert_eq!(ids(&plan), vec!["standard", "budget", "premium"]);
    }

    #[test]
    fn test_latency_optimized_unmeasured_last() {
        let monitor = HealthMonitor::new();
        warm(&monitor, "premium", 300);
        warm(&monitor, "standard", 50);
        let backends = set();
        let plan =
            Router::default().plan(&backends, &monitor, &params(RoutingMode::LatencyOptimized), None);
        // budget is unobserved and unhealthy, so it trails the healthy set.
        assert_eq!(ids(&plan), vec!["standard", "premium", "budget"]);
    }

    #[test]
    fn test_healthy_set_ranked_before_unhealthy() {
        let monitor = HealthMonitor::new();
        warm(&monitor, "budget", 100);
        let premium = BackendId::new("premium").expect("valid id");
        monitor.record_failure(&premium, "HTTP 503");
        let backends = set();
        let plan = Router::default().plan(&backends, &monitor, &params(RoutingMode::QualityFirst), None);
        // budget healthy (1.0), standard neutral (0.5), premium failing (0.1)
        assert_eq!(ids(&plan), vec!["budget", "standard", "premium"]);
    }

    #[test]
    fn test_none_healthy_picks_highest_score() {
        let monitor = HealthMonitor::new();
        for id in ["premium", "standard"] {
            monitor.record_failure(&BackendId::new(id).expect("valid id"), "timeout");
        }
        let backends = set();
        let plan = Router::default().plan(&backends, &monitor, &params(RoutingMode::QualityFirst), None);
        assert_eq!(plan.primary().map(BackendId::as_str), Some("budget"));
    }

    #[test]
    fn test_ties_break_by_id() {
        let monitor = HealthMonitor::new();
        let backends = vec![descriptor("zulu", 0.8, 5), descriptor("alpha", 0.8, 5)];
        for mode in RoutingMode::ALL {
            let plan = Router::default().plan(&backends, &monitor, &params(mode), None);
            assert_eq!(ids(&plan), vec!["alpha", "zulu"], "mode {mode}");
        }
    }

    #[test]
    fn test_target_quality_filters_first_tier() {
        let monitor = HealthMonitor::new();
        let backends = set();
        let mut p = params(RoutingMode::CostOptimized);
        p.target_quality = Some(0.7);
        let plan = Router::default().plan(&backends, &monitor, &p, None);
        assert_eq!(ids(&plan), vec!["standard", "premium", "budget"]);

        p.target_quality = Some(0.99);
        let plan = Router::default().plan(&backends, &monitor, &p, None);
        assert_eq!(ids(&plan), vec!["budget", "standard", "premium"]);
    }

    #[test]
    fn test_preferred_backend_goes_first() {
        let monitor = HealthMonitor::new();
        let backends = set();
        let preferred = BackendId::new("premium").expect("valid id");
        let plan = Router::default().plan(
            &backends,
            &monitor,
            &params(RoutingMode::CostOptimized),
            Some(&preferred),
        );
        assert_eq!(ids(&plan), vec!["premium", "budget", "standard"]);
    }

    #[test]
    fn test_default_mode_applies() {
        let monitor = HealthMonitor::new();
        let backends = set();
        let router = Router::new(RoutingMode::QualityFirst, 0.7);
        let plan = router.plan(&backends, &monitor, &GenerationParams::default(), None);
        assert_eq!(plan.strategy, RoutingMode::QualityFirst);
        assert_eq!(plan.primary().map(BackendId::as_str), Some("premium"));
    }
}
