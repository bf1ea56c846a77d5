//! PII detection and redaction for outbound prompts, responses and audit text.

use once_cell::sync::Lazy;
use prism_core::{ConfigError, SanitizerConfig};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Pattern-based PII sanitizer.
///
/// Every match of every enabled pattern is replaced with a
/// `[REDACTED_<CATEGORY>]` placeholder. Where matches overlap, the one that
/// starts first wins, and among those starting together the longest wins.
#[derive(Debug, Clone)]
pub struct Sanitizer {
    patterns: Vec<PiiPattern>,
}

impl Default for Sanitizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Sanitizer {
    /// Create a sanitizer with every built-in category enabled.
    #[must_use]
    pub fn new() -> Self {
        Self {
            patterns: PiiCategory::BUILT_IN
                .iter()
                .map(|category| PiiPattern {
                    category: category.clone(),
                    regex: builtin_regex(category).clone(),
                })
                .collect(),
        }
    }

    /// Build a sanitizer from configuration.
    ///
    /// An empty category list enables every built-in category.
    ///
    /// # Errors
    /// Returns error if a category name is unknown or a custom pattern is
    /// not a valid regular expression.
    pub fn from_config(config: &SanitizerConfig) -> Result<Self, ConfigError> {
        let mut sanitizer = if config.categories.is_empty() {
            Self::new()
        } else {
            let mut patterns = Vec::with_capacity(config.categories.len());
            for name in &config.categories {
                let category = PiiCategory::from_name(name).ok_or_else(|| {
                    ConfigError::invalid("sanitizer.categories", format!("unknown category '{name}'"))
                })?;
                patterns.push(PiiPattern {
                    regex: builtin_regex(&category).clone(),
                    category,
                });
            }
            Self { patterns }
        };

        for custom in &config.custom_patterns {
            sanitizer = sanitizer.with_pattern(&custom.name, &custom.pattern)?;
        }

        Ok(sanitizer)
    }

    /// Add a custom named pattern.
    ///
    /// # Errors
    /// Returns error if the pattern is not a valid regular expression.
    pub fn with_pattern(mut self, name: &str, pattern: &str) -> Result<Self, ConfigError> {
        let regex = Regex::new(pattern).map_err(|e| {
            ConfigError::invalid(format!("sanitizer.custom_patterns.{name}"), e.to_string())
        })?;
        self.patterns.push(PiiPattern {
            category: PiiCategory::Custom(custom_label(name)),
            regex,
        });
        Ok(self)
    }

    /// Categories currently enabled, in evaluation order.
    pub fn categories(&self) -> impl Iterator<Item = &PiiCategory> {
        self.patterns.iter().map(|p| &p.category)
    }

    /// Redact every PII match in `text`.
    #[must_use]
    pub fn sanitize(&self, text: &str) -> SanitizeResult {
        let mut candidates: Vec<(usize, usize, usize)> = Vec::new();
        for (index, pattern) in self.patterns.iter().enumerate() {
            for found in pattern.regex.find_iter(text) {
                if !found.is_empty() {
                    candidates.push((found.start(), found.end(), index));
                }
            }
        }

        if candidates.is_empty() {
            return SanitizeResult {
                text: text.to_string(),
                detections: Vec::new(),
            };
        }

        candidates.sort_by(|a, b| {
            a.0.cmp(&b.0)
                .then_with(|| (b.1 - b.0).cmp(&(a.1 - a.0)))
                .then_with(|| a.2.cmp(&b.2))
        });

        let mut output = String::with_capacity(text.len());
        let mut detections = Vec::new();
        let mut cursor = 0;
        for (start, end, index) in candidates {
            if start < cursor {
                continue;
            }
            let category = &self.patterns[index].category;
            output.push_str(&text[cursor..start]);
            output.push_str(&category.placeholder());
            detections.push(PiiDetection {
                category: category.clone(),
                start,
                end,
            });
            cursor = end;
        }
        output.push_str(&text[cursor..]);

        SanitizeResult {
            text: output,
            detections,
        }
    }

    /// Redact `text` and return only the sanitized string.
    #[must_use]
    pub fn redact(&self, text: &str) -> String {
        self.sanitize(text).text
    }
}

/// Result of sanitizing a string. Matched values are not retained.
#[derive(Debug, Clone)]
pub struct SanitizeResult {
    /// Text with every match replaced by its placeholder
    pub text: String,
    /// Redacted spans, in order of position in the original text
    pub detections: Vec<PiiDetection>,
}

impl SanitizeResult {
    /// Check if any PII was detected.
    #[must_use]
    pub fn has_pii(&self) -> bool {
        !self.detections.is_empty()
    }

    /// Number of redacted spans.
    #[must_use]
    pub fn pii_count(&self) -> usize {
        self.detections.len()
    }
}

/// A redacted span of the original text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PiiDetection {
    /// Category of the match
    pub category: PiiCategory,
    /// Byte offset where the match started
    pub start: usize,
    /// Byte offset where the match ended
    pub end: usize,
}

/// Category of sensitive data.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PiiCategory {
    /// Email address
    Email,
    /// Phone number
    Phone,
    /// US Social Security Number
    Ssn,
    /// Payment card number
    CreditCard,
    /// IPv4 address
    Ipv4,
    /// IPv6 address
    Ipv6,
    /// Hardware MAC address
    MacAddress,
    /// API-key-shaped secret token
    ApiKey,
    /// AWS access key id
    AwsAccessKey,
    /// JSON Web Token
    Jwt,
    /// HTTP bearer credential
    BearerToken,
    /// International bank account number
    Iban,
    /// Passport number following a passport keyword
    Passport,
    /// Date following a birth-date keyword
    DateOfBirth,
    /// Numbered street address
    StreetAddress,
    /// Named pattern supplied by configuration
    Custom(String),
}

impl PiiCategory {
    /// Every built-in category.
    pub const BUILT_IN: [Self; 15] = [
        Self::Email,
        Self::Phone,
        Self::Ssn,
        Self::CreditCard,
        Self::Ipv4,
        Self::Ipv6,
        Self::MacAddress,
        Self::ApiKey,
        Self::AwsAccessKey,
        Self::Jwt,
        Self::BearerToken,
        Self::Iban,
        Self::Passport,
        Self::DateOfBirth,
        Self::StreetAddress,
    ];

    /// Look up a built-in category by its snake_case config name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::BUILT_IN
            .iter()
            .find(|category| category.name() == name)
            .cloned()
    }

    /// Snake_case config name.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Email => "email",
            Self::Phone => "phone",
            Self::Ssn => "ssn",
            Self::CreditCard => "credit_card",
            Self::Ipv4 => "ipv4",
            Self::Ipv6 => "ipv6",
            Self::MacAddress => "mac_address",
            Self::ApiKey => "api_key",
            Self::AwsAccessKey => "aws_access_key",
            Self::Jwt => "jwt",
            Self::BearerToken => "bearer_token",
            Self::Iban => "iban",
            Self::Passport => "passport",
            Self::DateOfBirth => "date_of_birth",
            Self::StreetAddress => "street_address",
            Self::Custom(name) => name,
        }
    }

    /// Placeholder that replaces matches of this category.
    #[must_use]
    pub fn placeholder(&self) -> String {
        let label = match self {
            Self::Custom(label) => label.clone(),
            other => other.name().to_ascii_uppercase(),
        };
        format!("[REDACTED_{label}]")
    }
}

impl fmt::Display for PiiCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone)]
struct PiiPattern {
    category: PiiCategory,
    regex: Regex,
}

impl fmt::Debug for PiiPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PiiPattern")
            .field("category", &self.category)
            .field("regex", &self.regex.as_str())
            .finish()
    }
}

fn custom_label(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

fn builtin_regex(category: &PiiCategory) -> &'static Regex {
    match category {
        PiiCategory::Email => &EMAIL_REGEX,
        PiiCategory::Phone => &PHONE_REGEX,
        PiiCategory::Ssn => &SSN_REGEX,
        PiiCategory::CreditCard => &CREDIT_CARD_REGEX,
        PiiCategory::Ipv4 => &IPV4_REGEX,
        PiiCategory::Ipv6 => &IPV6_REGEX,
        PiiCategory::MacAddress => &MAC_REGEX,
        PiiCategory::ApiKey => &API_KEY_REGEX,
        PiiCategory::AwsAccessKey => &AWS_KEY_REGEX,
        PiiCategory::Jwt => &JWT_REGEX,
        PiiCategory::BearerToken => &BEARER_REGEX,
        PiiCategory::Iban => &IBAN_REGEX,
        PiiCategory::Passport => &PASSPORT_REGEX,
        PiiCategory::DateOfBirth => &DOB_REGEX,
        // Custom categories carry their own regex; never looked up here.
        PiiCategory::StreetAddress | PiiCategory::Custom(_) => &STREET_REGEX,
    }
}

static EMAIL_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b[a-z0-9._%+-]+@[a-z0-9.-]+\.[a-z]{2,}\b").expect("valid email regex")
});

static PHONE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:\+\d{1,3}[-.\s]?)?(?:\(\d{3}\)|\b\d{3})[-.\s]?\d{3}[-.\s]?\d{4}\b")
        .expect("valid phone regex")
});

static SSN_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").expect("valid SSN regex"));

static CREDIT_CARD_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:\d{4}[-\s]?){3}\d{4}\b|\b3[47]\d{2}[-\s]?\d{6}[-\s]?\d{5}\b")
        .expect("valid credit card regex")
});

static IPV4_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:(?:25[0-5]|2[0-4]\d|1?\d?\d)\.){3}(?:25[0-5]|2[0-4]\d|1?\d?\d)\b")
        .expect("valid IPv4 regex")
});

static IPV6_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(?:[0-9a-f]{1,4}:){7}[0-9a-f]{1,4}\b|\b(?:[0-9a-f]{1,4}:){1,7}:(?:[0-9a-f]{1,4}:){0,6}[0-9a-f]{1,4}\b",
    )
    .expect("valid IPv6 regex")
});

static MAC_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b[0-9a-f]{2}(?:[:-][0-9a-f]{2}){5}\b").expect("valid MAC regex")
});

static API_KEY_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:sk|pk|rk|ghp|gho|xoxb|xoxp)[-_][A-Za-z0-9_-]{16,}").expect("valid API key regex")
});

static AWS_KEY_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:AKIA|ASIA)[0-9A-Z]{16}\b").expect("valid AWS key regex")
});

static JWT_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\beyJ[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+").expect("valid JWT regex")
});

static BEARER_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bbearer\s+[A-Za-z0-9._~+/-]+=*").expect("valid bearer regex")
});

static IBAN_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b[A-Z]{2}\d{2}(?: ?[A-Z0-9]{4}){2,7}(?: ?[A-Z0-9]{1,3})?\b").expect("valid IBAN regex")
});

static PASSPORT_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bpassport(?:\s+(?:no\.?|number|#))?[:\s#]*[A-Z0-9]{6,9}\b")
        .expect("valid passport regex")
});

static DOB_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(?:dob|date of birth|born(?: on)?)[:\s]*(?:\d{1,2}[/-]\d{1,2}[/-]\d{2,4}|\d{4}-\d{2}-\d{2})\b",
    )
    .expect("valid date of birth regex")
});

static STREET_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\b\d{1,5}\s+(?:[A-Z][a-z0-9]*\.?\s+){1,3}(?:Street|St|Avenue|Ave|Road|Rd|Boulevard|Blvd|Lane|Ln|Drive|Dr|Court|Ct|Way|Place|Pl)\b",
    )
    .expect("valid street address regex")
});
