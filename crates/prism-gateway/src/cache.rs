//! Content-addressed response cache with LRU eviction and per-entry TTL.

use crate::error::CacheError;
use crate::request::{GenerationParams, GenerationResult, RequestMode};
use lru::LruCache;
use parking_lot::Mutex;
use prism_core::CacheConfig;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

/// SHA-256 over the canonical form of a request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Hex digest.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Serialize)]
struct CanonicalRequest<'a> {
    prompt: &'a str,
    mode: &'static str,
    max_tokens: u32,
    temperature: String,
    target_quality: Option<String>,
    strategy: Option<&'static str>,
}

#[derive(Debug)]
struct CacheEntry {
    result: GenerationResult,
    expires_at: Instant,
}

/// LRU response cache.
///
/// Only successful, sanitized results are stored. Lookups return a copy
/// with `cache_hit` set.
#[derive(Debug)]
pub struct ResponseCache {
    entries: Mutex<LruCache<CacheKey, CacheEntry>>,
    ttl: Duration,
    enabled: bool,
}

impl ResponseCache {
    /// Create a cache from configuration.
    #[must_use]
    pub fn new(config: &CacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl: Duration::from_secs(config.ttl_secs),
            enabled: config.enabled,
        }
    }

    /// Whether lookups are performed at all.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Default entry time-to-live.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Compute the key for a request.
    ///
    /// Whitespace runs in the prompt collapse to one space and the
    /// temperature is fixed to three decimals, so equivalent requests share
    /// a key. Batch items share keys with single requests.
    ///
    /// # Errors
    /// Returns error if the canonical form cannot be serialized.
    pub fn key_for(
        sanitized_prompt: &str,
        params: &GenerationParams,
        mode: RequestMode,
    ) -> Result<CacheKey, CacheError> {
        let prompt = sanitized_prompt.split_whitespace().collect::<Vec<_>>().join(" ");
        let mode = match mode {
            RequestMode::Single | RequestMode::Batch => RequestMode::Single,
            RequestMode::Synthesis => RequestMode::Synthesis,
        };
        let canonical = CanonicalRequest {
            prompt: &prompt,
            mode: mode.as_str(),
            max_tokens: params.max_tokens,
            temperature: format!("{:.3}", params.temperature),
            target_quality: params.target_quality.map(|q| format!("{q:.3}")),
            strategy: params.strategy.map(|s| s.as_str()),
        };
        let bytes = serde_json::to_vec(&canonical)?;
        Ok(CacheKey(hex::encode(Sha256::digest(&bytes))))
    }

    /// Look up a live entry, evicting it if expired.
    #[must_use]
    pub fn get(&self, key: &CacheKey) -> Option<GenerationResult> {
        if !self.enabled {
            return None;
        }
        let mut entries = self.entries.lock();
        let expired = match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => {
                let mut result = entry.result.clone();
                result.cache_hit = true;
                return Some(result);
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.pop(key);
            tracing::debug!(key = %key, "Cache entry expired");
        }
        None
    }

    /// Store `result` for `ttl`. Last writer wins.
    pub fn put(&self, key: CacheKey, result: GenerationResult, ttl: Duration) {
        if !self.enabled {
            return;
        }
        let entry = CacheEntry {
            result: GenerationResult {
                cache_hit: false,
                ..result
            },
            expires_at: Instant::now() + ttl,
        };
        self.entries.lock().put(key, entry);
    }

    /// Number of stored entries, including expired ones not yet evicted.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
