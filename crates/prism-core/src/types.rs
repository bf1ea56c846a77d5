//! Shared types used across the Prism gateway.
//!
//! This module defines the identifier newtypes and the fixed-point money type
//! that keeps cost accounting free of floating point drift.

use crate::error::PrismError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Sub};
use std::sync::OnceLock;

/// Newtype for backend identifiers with validation.
///
/// Backend IDs must be lowercase alphanumeric with hyphens, dots or
/// underscores, 2-64 characters, starting with a letter or digit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BackendId(String);

impl BackendId {
    /// Create a new `BackendId` from a string.
    ///
    /// # Errors
    /// Returns error if the ID doesn't match the required format.
    pub fn new(id: impl Into<String>) -> Result<Self, PrismError> {
        let id = id.into();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    /// Get the inner string value.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(id: &str) -> Result<(), PrismError> {
        static BACKEND_REGEX: OnceLock<Regex> = OnceLock::new();
        let regex = BACKEND_REGEX
            .get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9._-]{1,63}$").expect("valid regex"));

        if regex.is_match(id) {
            Ok(())
        } else {
            Err(PrismError::Validation(format!(
                "invalid backend ID: must be 2-64 lowercase alphanumeric characters, got '{id}'"
            )))
        }
    }
}

impl TryFrom<String> for BackendId {
    type Error = PrismError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<BackendId> for String {
    fn from(id: BackendId) -> Self {
        id.0
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Newtype for request identifiers.
///
/// Request IDs are opaque caller-visible tokens: 1-128 characters drawn from
/// ASCII alphanumerics and `-_.:`. Generated IDs are UUID v4 strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RequestId(String);

impl RequestId {
    /// Create a new `RequestId` from a string.
    ///
    /// # Errors
    /// Returns error if the ID is empty, too long or has illegal characters.
    pub fn new(id: impl Into<String>) -> Result<Self, PrismError> {
        let id = id.into();
        let legal = id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'));

        if id.is_empty() || id.len() > 128 || !legal {
            return Err(PrismError::Validation(format!(
                "invalid request ID: must be 1-128 characters of [A-Za-z0-9-_.:], got '{id}'"
            )));
        }
        Ok(Self(id))
    }

    /// Create a new random `RequestId` using UUID v4.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Get the inner string value.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RequestId {
    type Error = PrismError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<RequestId> for String {
    fn from(id: RequestId) -> Self {
        id.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// US dollar amount in three-decimal fixed point.
///
/// Stored as an integer count of thousandths of a dollar ("mills"), so
/// repeated additions never drift.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Usd(i64);

impl Usd {
    /// Zero dollars.
    pub const ZERO: Self = Self(0);

    /// Mills per dollar.
    pub const MILLS_PER_DOLLAR: i64 = 1000;

    /// Create an amount from thousandths of a dollar.
    #[must_use]
    pub const fn from_mills(mills: i64) -> Self {
        Self(mills)
    }

    /// Create an amount from a dollar value, rounded to the nearest mill.
    ///
    /// Only used at configuration boundaries; arithmetic stays in mills.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn from_dollars(dollars: f64) -> Self {
        Self((dollars * 1000.0).round() as i64)
    }

    /// Amount in thousandths of a dollar.
    #[must_use]
    pub const fn mills(self) -> i64 {
        self.0
    }

    /// Approximate dollar value, for display and ratios only.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_dollars(self) -> f64 {
        self.0 as f64 / 1000.0
    }

    /// Whether this amount is exactly zero.
    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Subtraction that stops at zero.
    #[must_use]
    pub fn saturating_sub(self, other: Self) -> Self {
        Self(self.0.saturating_sub(other.0).max(0))
    }
}

impl Add for Usd {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for Usd {
    fn add_assign(&mut self, rhs: Self) {
        self.0 = self.0.saturating_add(rhs.0);
    }
}

impl Sub for Usd {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0.saturating_sub(rhs.0))
    }
}

impl Sum for Usd {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::ZERO, |acc, x| acc + x)
    }
}

impl fmt::Display for Usd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}${}.{:03}", abs / 1000, abs % 1000)
    }
}

/// Price per thousand tokens, in millionths of a dollar.
///
/// Rates are kept finer than [`Usd`] so sub-mill prices survive; only the
/// charge for a whole call is rounded to mills.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenPrice(i64);

impl TokenPrice {
    /// Free.
    pub const ZERO: Self = Self(0);

    /// Create a price from micro-dollars per thousand tokens.
    #[must_use]
    pub const fn from_micros(micros: i64) -> Self {
        Self(micros)
    }

    /// Create a price from dollars per thousand tokens, rounded to the
    /// nearest micro-dollar.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn from_dollars(dollars: f64) -> Self {
        Self((dollars * 1_000_000.0).round() as i64)
    }

    /// Micro-dollars per thousand tokens.
    #[must_use]
    pub const fn micros(self) -> i64 {
        self.0
    }

    /// Whether the price is exactly zero.
    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Cost of `tokens`, rounded half up to the nearest mill.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn cost_for(self, tokens: u64) -> Usd {
        // micros/1k * tokens = micro-dollars * 1000; one mill = 1_000_000 of those
        let numerator = i128::from(self.0) * i128::from(tokens);
        let mills = (numerator + 500_000).div_euclid(1_000_000);
        Usd::from_mills(mills.clamp(i128::from(i64::MIN), i128::from(i64::MAX)) as i64)
    }
}

impl From<Usd> for TokenPrice {
    fn from(per_1k: Usd) -> Self {
        Self(per_1k.mills().saturating_mul(1000))
    }
}

impl fmt::Display for TokenPrice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}${}.{:06}/1k", abs / 1_000_000, abs % 1_000_000)
    }
}
