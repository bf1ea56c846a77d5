//! HMAC request signing with timestamp window and nonce replay checks.

use crate::error::SecurityViolation;
use crate::ledger::Clock;
use crate::request::RequestContext;
use chrono::Utc;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use prism_core::{ConfigError, SigningConfig};
use sha2::{Digest, Sha256};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

/// Default accepted timestamp skew in seconds.
pub const DEFAULT_WINDOW_SECS: u64 = 300;

/// Default number of remembered nonces.
pub const DEFAULT_NONCE_CAPACITY: usize = 10_000;

/// Bounded set of accepted nonces, evicting the oldest first.
#[derive(Debug)]
struct NonceSet {
    order: VecDeque<String>,
    seen: HashSet<String>,
    capacity: usize,
}

impl NonceSet {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            seen: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    /// Returns `false` if the nonce was already present.
    fn insert(&mut self, nonce: &str) -> bool {
        if self.seen.contains(nonce) {
            return false;
        }
        while self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(nonce.to_string());
        self.seen.insert(nonce.to_string());
        true
    }
}

/// Signs and verifies [`RequestContext`]s with a shared secret.
///
/// The signed message binds the request id, creation time in milliseconds,
/// nonce and a digest of the canonical payload.
pub struct RequestSigner {
    secret: Zeroizing<Vec<u8>>,
    window_secs: u64,
    nonces: Mutex<NonceSet>,
    clock: Clock,
}

impl fmt::Debug for RequestSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestSigner")
            .field("secret", &"[REDACTED]")
            .field("window_secs", &self.window_secs)
            .finish_non_exhaustive()
    }
}

impl RequestSigner {
    /// Create a signer with the default window and nonce capacity.
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: Zeroizing::new(secret.into()),
            window_secs: DEFAULT_WINDOW_SECS,
            nonces: Mutex::new(NonceSet::new(DEFAULT_NONCE_CAPACITY)),
            clock: Arc::new(Utc::now),
        }
    }

    /// Create a signer whose secret is read from the configured environment
    /// variable.
    ///
    /// # Errors
    /// Returns `MissingSecret` if the variable is unset or empty.
    pub fn from_config(config: &SigningConfig) -> Result<Self, ConfigError> {
        let secret = std::env::var(&config.secret_env)
            .ok()
            .filter(|value| !value.is_empty())
            .map(Zeroizing::new)
            .ok_or_else(|| ConfigError::MissingSecret {
                var: config.secret_env.clone(),
            })?;

        Ok(Self::new(secret.as_bytes().to_vec())
            .with_window_secs(config.window_secs)
            .with_nonce_capacity(config.nonce_capacity))
    }

    /// Set the accepted timestamp skew.
    #[must_use]
    pub fn with_window_secs(mut self, window_secs: u64) -> Self {
        self.window_secs = window_secs;
        self
    }

    /// Set how many nonces are remembered.
    #[must_use]
    pub fn with_nonce_capacity(mut self, capacity: usize) -> Self {
        self.nonces = Mutex::new(NonceSet::new(capacity));
        self
    }

    /// Read time from `clock`.
    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Compute and attach the signature.
    pub fn sign(&self, ctx: &mut RequestContext) {
        ctx.signature = Some(hex::encode(self.mac_for(ctx).finalize().into_bytes()));
    }

    /// Check signature, timestamp window and nonce freshness.
    ///
    /// The nonce is only recorded once everything else has passed, so a
    /// forged request cannot burn a legitimate nonce.
    ///
    /// # Errors
    /// Returns the first failed check.
    pub fn verify(&self, ctx: &RequestContext) -> Result<(), SecurityViolation> {
        let signature = ctx
            .signature
            .as_deref()
            .ok_or(SecurityViolation::MissingSignature)?;

        let age_secs = ((self.clock)() - ctx.created_at).num_seconds();
        let window = i64::try_from(self.window_secs).unwrap_or(i64::MAX);
        if age_secs > window {
            return Err(SecurityViolation::StaleTimestamp {
                age_secs,
                window_secs: self.window_secs,
            });
        }
        if -age_secs > window {
            return Err(SecurityViolation::FutureTimestamp {
                ahead_secs: -age_secs,
                window_secs: self.window_secs,
            });
        }

        let provided = hex::decode(signature).map_err(|_| SecurityViolation::InvalidSignature)?;
        self.mac_for(ctx)
            .verify_slice(&provided)
            .map_err(|_| SecurityViolation::InvalidSignature)?;

        if !self.nonces.lock().insert(&ctx.nonce) {
            tracing::warn!(request_id = %ctx.request_id, "Replayed nonce rejected");
            return Err(SecurityViolation::ReplayedNonce);
        }
        Ok(())
    }

    fn mac_for(&self, ctx: &RequestContext) -> HmacSha256 {
        let payload_digest = hex::encode(Sha256::digest(ctx.canonical_payload().as_bytes()));
        let message = format!(
            "{}\n{}\n{}\n{}",
            ctx.request_id,
            ctx.created_at.timestamp_millis(),
            ctx.nonce,
            payload_digest
        );
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC can take key of any size");
        mac.update(message.as_bytes());
        mac
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration as ChronoDuration, TimeZone};

    fn fixed_clock(at: DateTime<Utc>) -> Clock {
        Arc::new(move || at)
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, 12, 0, 0).single().expect("valid time")
    }

    fn signer() -> RequestSigner {
        RequestSigner::new(b"test-secret".to_vec()).with_clock(fixed_clock(now()))
    }

    fn signed(prompt: &str) -> RequestContext {
        let mut ctx = RequestContext::new(prompt).with_created_at(now());
        signer().sign(&mut ctx);
        ctx
    }

    #[test]
    fn test_valid_signature_accepted() {
        let ctx = signed("hello");
        assert_eq!(ctx.signature.as_ref().map(String::len), Some(64));
        assert!(signer().verify(&ctx).is_ok());
    }

    #[test]
    fn test_missing_signature() {
        let ctx = RequestContext::new("hello").with_created_at(now());
        assert_eq!(signer().verify(&ctx), Err(SecurityViolation::MissingSignature));
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let mut ctx = signed("hello");
        ctx.prompt = "hello, with changes".to_string();
        assert_eq!(signer().verify(&ctx), Err(SecurityViolation::InvalidSignature));

        let mut ctx = signed("hello");
        ctx.params.max_tokens += 1;
        assert_eq!(signer().verify(&ctx), Err(SecurityViolation::InvalidSignature));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let ctx = signed("hello");
        let other = RequestSigner::new(b"other-secret".to_vec()).with_clock(fixed_clock(now()));
        assert_eq!(other.verify(&ctx), Err(SecurityViolation::InvalidSignature));
    }

    #[test]
    fn test_garbage_signature_rejected() {
        let mut ctx = signed("hello");
        ctx.signature = Some("not hex".to_string());
        assert_eq!(signer().verify(&ctx), Err(SecurityViolation::InvalidSignature));
    }

    #[test]
    fn test_stale_timestamp_rejected_even_when_correctly_signed() {
        let created = now() - ChronoDuration::minutes(10);
        let mut ctx = RequestContext::new("hello").with_created_at(created);
        signer().sign(&mut ctx);

        assert!(matches!(
            signer().verify(&ctx),
            Err(SecurityViolation::StaleTimestamp { age_secs: 600, window_secs: 300 })
        ));
    }

    #[test]
    fn test_future_timestamp_rejected() {
        let mut ctx = RequestContext::new("hello").with_created_at(now() + ChronoDuration::minutes(6));
        signer().sign(&mut ctx);
        assert!(matches!(
            signer().verify(&ctx),
            Err(SecurityViolation::FutureTimestamp { ahead_secs: 360, .. })
        ));
    }

    #[test]
    fn test_edge_of_window_accepted() {
        let mut ctx = RequestContext::new("hello").with_created_at(now() - ChronoDuration::seconds(300));
        signer().sign(&mut ctx);
        assert!(signer().verify(&ctx).is_ok());
    }

    #[test]
    fn test_replay_rejected() {
        let signer = signer();
        let ctx = signed("hello");
        assert!(signer.verify(&ctx).is_ok());
        assert_eq!(signer.verify(&ctx), Err(SecurityViolation::ReplayedNonce));
    }

    #[test]
    fn test_forged_request_does_not_consume_nonce() {
        let signer = signer();
        let ctx = signed("hello");
        let mut forged = ctx.clone();
        forged.prompt = "forged".to_string();

        assert_eq!(signer.verify(&forged), Err(SecurityViolation::InvalidSignature));
        assert!(signer.verify(&ctx).is_ok());
    }

    #[test]
    fn test_nonce_capacity_evicts_oldest() {
        let mut nonces = NonceSet::new(2);
        assert!(nonces.insert("a"));
        assert!(nonces.insert("b"));
        assert!(!nonces.insert("a"));
        assert!(nonces.insert("c"));
        assert!(nonces.insert("a"));
        assert!(!nonces.insert("c"));
    }

    #[test]
    fn test_from_config_requires_secret() {
        let config = SigningConfig {
            secret_env: "PRISM_TEST_SIGNER_SECRET_UNSET".to_string(),
            ..SigningConfig::default()
        };
        assert!(matches!(
            RequestSigner::from_config(&config),
            Err(ConfigError::MissingSecret { .. })
        ));

        std::env::set_var("PRISM_TEST_SIGNER_SECRET_SET", "s3cret");
        let config = SigningConfig {
            secret_env: "PRISM_TEST_SIGNER_SECRET_SET".to_string(),
            window_secs: 60,
            ..SigningConfig::default()
        };
        let signer = RequestSigner::from_config(&config).expect("secret present");
        assert_eq!(signer.window_secs, 60);
    }
}
