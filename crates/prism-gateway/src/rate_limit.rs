//! Per-backend token bucket admission control.
//!
//! Buckets refill lazily from elapsed time on each check; there is no
//! background timer.

use dashmap::DashMap;
use parking_lot::Mutex;
use prism_core::{BackendId, RateLimitConfig};
use std::collections::HashMap;
use std::time::Instant;

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(config: &RateLimitConfig) -> Self {
        let capacity = f64::from(config.capacity);
        Self {
            tokens: capacity,
            capacity,
            refill_per_sec: config.refill_per_second,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    fn try_take(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Token bucket rate limiter keyed by backend.
#[derive(Debug, Default)]
pub struct RateLimiter {
    buckets: DashMap<BackendId, Mutex<TokenBucket>>,
    default_config: RateLimitConfig,
    overrides: HashMap<BackendId, RateLimitConfig>,
}

impl RateLimiter {
    /// Create a limiter applying `default_config` to every backend.
    #[must_use]
    pub fn new(default_config: RateLimitConfig) -> Self {
        Self {
            buckets: DashMap::new(),
            default_config,
            overrides: HashMap::new(),
        }
    }

    /// Use a dedicated bucket configuration for one backend.
    #[must_use]
    pub fn with_backend(mut self, backend: BackendId, config: RateLimitConfig) -> Self {
        self.buckets.remove(&backend);
        self.overrides.insert(backend, config);
        self
    }

    /// Take one token for `backend`, returning false if none is available.
    pub fn allow(&self, backend: &BackendId) -> bool {
        let allowed = self.with_bucket(backend, TokenBucket::try_take);
        if !allowed {
            tracing::debug!(backend = %backend, "Rate limit rejected call");
        }
        allowed
    }

    /// Whole tokens currently available for `backend`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn available(&self, backend: &BackendId) -> u32 {
        self.with_bucket(backend, |bucket| {
            bucket.refill();
            bucket.tokens.floor() as u32
        })
    }

    fn with_bucket<R>(&self, backend: &BackendId, f: impl FnOnce(&mut TokenBucket) -> R) -> R {
        if let Some(bucket) = self.buckets.get(backend) {
            return f(&mut *bucket.lock());
        }
        let bucket = self
            .buckets
            .entry(backend.clone())
            .or_insert_with(|| Mutex::new(TokenBucket::new(self.config_for(backend))));
        let result = f(&mut *bucket.lock());
        result
    }

    fn config_for(&self, backend: &BackendId) -> &RateLimitConfig {
        self.overrides.get(backend).unwrap_or(&self.default_config)
    }
}
