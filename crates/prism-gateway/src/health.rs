//! Per-backend health tracking.
//!
//! Each backend keeps an exponentially weighted success rate and latency,
//! plus a bounded window of recent latency samples that serves as the
//! rolling baseline. The derived score is
//! `0.8 * success_ewma + 0.2 * min(1, baseline / recent_latency)`.

use dashmap::DashMap;
use parking_lot::Mutex;
use prism_core::BackendId;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;

/// Score for a backend with no observations.
pub const NEUTRAL_SCORE: f64 = 0.5;

/// Default health threshold for routing.
pub const DEFAULT_HEALTHY_THRESHOLD: f64 = 0.7;

const SUCCESS_WEIGHT: f64 = 0.8;
const LATENCY_WEIGHT: f64 = 0.2;

#[derive(Debug, Default)]
struct HealthRecord {
    successes: u64,
    failures: u64,
    tokens: u64,
    success_ewma: f64,
    latency_ewma_ms: Option<f64>,
    samples: VecDeque<f64>,
    last_failure: Option<String>,
}

impl HealthRecord {
    fn observations(&self) -> u64 {
        self.successes + self.failures
    }

    fn observe(&mut self, outcome: f64, alpha: f64) {
        self.success_ewma = if self.observations() == 0 {
            outcome
        } else {
            alpha * outcome + (1.0 - alpha) * self.success_ewma
        };
    }

    fn latency_factor(&self) -> f64 {
        let Some(recent) = self.latency_ewma_ms else {
            return NEUTRAL_SCORE;
        };
        if self.samples.is_empty() {
            return NEUTRAL_SCORE;
        }
        if recent <= f64::EPSILON {
            return 1.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let baseline = self.samples.iter().sum::<f64>() / self.samples.len() as f64;
        (baseline / recent).min(1.0)
    }

    fn score(&self) -> f64 {
        if self.observations() == 0 {
            return NEUTRAL_SCORE;
        }
        let score = SUCCESS_WEIGHT * self.success_ewma + LATENCY_WEIGHT * self.latency_factor();
        score.clamp(0.0, 1.0)
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn millis_to_duration(ms: f64) -> Duration {
    Duration::from_micros((ms * 1000.0).round().max(0.0) as u64)
}

/// Read-only view of a backend's health.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSnapshot {
    /// Backend id
    pub backend: BackendId,
    /// Successful calls observed
    pub successes: u64,
    /// Failed calls observed
    pub failures: u64,
    /// Tokens generated by successful calls
    pub tokens: u64,
    /// Exponentially weighted success rate
    pub success_rate: f64,
    /// Exponentially weighted latency of successful calls
    pub avg_latency: Option<Duration>,
    /// Derived score in [0, 1]
    pub score: f64,
    /// Sanitized reason of the most recent failure
    pub last_failure: Option<String>,
}

impl HealthSnapshot {
    fn from_record(backend: &BackendId, record: &HealthRecord) -> Self {
        Self {
            backend: backend.clone(),
            successes: record.successes,
            failures: record.failures,
            tokens: record.tokens,
            success_rate: record.success_ewma,
            avg_latency: record.latency_ewma_ms.map(millis_to_duration),
            score: record.score(),
            last_failure: record.last_failure.clone(),
        }
    }

    /// Snapshot of a backend with no observations.
    #[must_use]
    pub fn unobserved(backend: BackendId) -> Self {
        Self::from_record(&backend, &HealthRecord::default())
    }
}

/// Tracks success, failure and latency per backend.
#[derive(Debug)]
pub struct HealthMonitor {
    records: DashMap<BackendId, Mutex<HealthRecord>>,
    alpha: f64,
    window: usize,
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthMonitor {
    /// Create a monitor with EWMA alpha 0.3 and a 32-sample window.
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            alpha: 0.3,
            window: 32,
        }
    }

    /// Override the EWMA smoothing factor.
    #[must_use]
    pub fn with_alpha(mut self, alpha: f64) -> Self {
        self.alpha = alpha.clamp(0.0, 1.0);
        self
    }

    /// Override the latency sample window.
    #[must_use]
    pub fn with_window(mut self, window: usize) -> Self {
        self.window = window.max(1);
        self
    }

    /// Record a successful call.
    pub fn record_success(&self, backend: &BackendId, latency: Duration, tokens: u32) {
        let alpha = self.alpha;
        let window = self.window;
        let latency_ms = latency.as_secs_f64() * 1000.0;
        self.update(backend, |record| {
            record.observe(1.0, alpha);
            record.successes += 1;
            record.tokens += u64::from(tokens);
            record.latency_ewma_ms = Some(match record.latency_ewma_ms {
                Some(prev) => alpha * latency_ms + (1.0 - alpha) * prev,
                None => latency_ms,
            });
            if record.samples.len() == window {
                record.samples.pop_front();
            }
            record.samples.push_back(latency_ms);
        });
    }

    /// Record a failed call with its sanitized reason.
    pub fn record_failure(&self, backend: &BackendId, reason: &str) {
        let alpha = self.alpha;
        self.update(backend, |record| {
            record.observe(0.0, alpha);
            record.failures += 1;
            record.last_failure = Some(reason.to_string());
        });
        tracing::debug!(backend = %backend, reason = %reason, "Recorded backend failure");
    }

    /// Current score in [0, 1]; 0.5 with no observations.
    #[must_use]
    pub fn score(&self, backend: &BackendId) -> f64 {
        self.records
            .get(backend)
            .map_or(NEUTRAL_SCORE, |record| record.lock().score())
    }

    /// Whether the score meets `threshold`.
    #[must_use]
    pub fn is_healthy(&self, backend: &BackendId, threshold: f64) -> bool {
        self.score(backend) >= threshold
    }

    /// Snapshot of one backend.
    #[must_use]
    pub fn snapshot(&self, backend: &BackendId) -> HealthSnapshot {
        self.records.get(backend).map_or_else(
            || HealthSnapshot::unobserved(backend.clone()),
            |record| HealthSnapshot::from_record(backend, &record.lock()),
        )
    }

    /// Snapshots of every observed backend, ordered by id.
    #[must_use]
    pub fn snapshots(&self) -> Vec<HealthSnapshot> {
        let mut snapshots: Vec<_> = self
            .records
            .iter()
            .map(|entry| HealthSnapshot::from_record(entry.key(), &entry.value().lock()))
            .collect();
        snapshots.sort_by(|a, b| a.backend.cmp(&b.backend));
        snapshots
    }

    fn update(&self, backend: &BackendId, f: impl FnOnce(&mut HealthRecord)) {
        if let Some(record) = self.records.get(backend) {
            f(&mut *record.lock());
            return;
        }
        let record = self.records.entry(backend.clone()).or_default();
        f(&mut *record.lock());
    }
}
