//! Configuration management for the Prism gateway.
//!
//! Provides TOML-based configuration with XDG-compliant paths and
//! environment variable overrides.

use crate::error::{ConfigError, ConfigResult};
use crate::types::BackendId;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Routing strategy names accepted in `routing.default_strategy`.
pub const ROUTING_STRATEGIES: [&str; 4] = [
    "quality_first",
    "cost_optimized",
    "balanced",
    "latency_optimized",
];

/// Main gateway configuration.
///
/// This is loaded from `~/.config/prism/gateway.toml` (or platform equivalent).
/// If the file doesn't exist, default values are used.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Configured generation backends
    pub backends: Vec<BackendConfig>,
    /// Daily and monthly spend limits
    pub budget: BudgetConfig,
    /// Default token bucket applied to backends without their own
    pub rate_limit: RateLimitConfig,
    /// Response cache settings
    pub cache: CacheConfig,
    /// Fallback, synthesis and request deadlines
    pub deadlines: DeadlineConfig,
    /// PII sanitizer settings
    pub sanitizer: SanitizerConfig,
    /// Request signing settings
    pub signing: SigningConfig,
    /// Routing strategy settings
    pub routing: RoutingConfig,
    /// Input limits and batch concurrency
    pub limits: LimitsConfig,
}

impl GatewayConfig {
    /// Load configuration from disk, falling back to defaults if not found.
    ///
    /// # Errors
    /// Returns error if:
    /// - Config directory cannot be determined
    /// - File exists but cannot be read
    /// - File contents are not valid TOML
    pub fn load() -> ConfigResult<Self> {
        let config_path = Self::config_path()?;
        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path, falling back to defaults.
    pub fn load_from(path: &Path) -> ConfigResult<Self> {
        if path.exists() {
            tracing::debug!("Loading config from {}", path.display());
            let contents = fs::read_to_string(path)?;
            let config = toml::from_str(&contents)?;
            Ok(config)
        } else {
            tracing::debug!("Config file not found, using defaults");
            Ok(Self::default())
        }
    }

    /// Load configuration with environment variable overrides.
    ///
    /// Supports the following environment variables:
    /// - `PRISM_DAILY_LIMIT_USD`: Override the daily budget
    /// - `PRISM_MONTHLY_LIMIT_USD`: Override the monthly budget
    /// - `PRISM_ROUTING_STRATEGY`: Override the default routing strategy
    /// - `PRISM_CACHE_TTL_SECS`: Override the cache TTL
    /// - `PRISM_FALLBACK_DEADLINE_MS`: Override the fallback deadline
    pub fn load_with_env() -> ConfigResult<Self> {
        let mut config = Self::load()?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply the supported environment variable overrides in place.
    pub fn apply_env_overrides(&mut self) {
        if let Some(limit) = env_parse::<f64>("PRISM_DAILY_LIMIT_USD") {
            self.budget.daily_limit_usd = limit;
            tracing::debug!("Override budget.daily_limit_usd from env: {}", limit);
        }

        if let Some(limit) = env_parse::<f64>("PRISM_MONTHLY_LIMIT_USD") {
            self.budget.monthly_limit_usd = limit;
            tracing::debug!("Override budget.monthly_limit_usd from env: {}", limit);
        }

        if let Ok(strategy) = std::env::var("PRISM_ROUTING_STRATEGY") {
            tracing::debug!("Override routing.default_strategy from env: {}", strategy);
            self.routing.default_strategy = strategy;
        }

        if let Some(ttl) = env_parse::<u64>("PRISM_CACHE_TTL_SECS") {
            self.cache.ttl_secs = ttl;
            tracing::debug!("Override cache.ttl_secs from env: {}", ttl);
        }

        if let Some(ms) = env_parse::<u64>("PRISM_FALLBACK_DEADLINE_MS") {
            self.deadlines.fallback_ms = ms;
            tracing::debug!("Override deadlines.fallback_ms from env: {}", ms);
        }
    }

    /// Check cross-field constraints that serde cannot express.
    ///
    /// # Errors
    /// Returns `ConfigError::InvalidValue` naming the first offending field.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.budget.daily_limit_usd < 0.0 || self.budget.monthly_limit_usd < 0.0 {
            return Err(ConfigError::invalid("budget", "limits must not be negative"));
        }
        if !(0.0..=1.0).contains(&self.budget.warning_ratio) {
            return Err(ConfigError::invalid(
                "budget.warning_ratio",
                "must be between 0 and 1",
            ));
        }
        if !ROUTING_STRATEGIES.contains(&self.routing.default_strategy.as_str()) {
            return Err(ConfigError::invalid(
                "routing.default_strategy",
                format!(
                    "unknown strategy '{}', expected one of {}",
                    self.routing.default_strategy,
                    ROUTING_STRATEGIES.join(", ")
                ),
            ));
        }
        if !(0.0..=1.0).contains(&self.routing.healthy_threshold) {
            return Err(ConfigError::invalid(
                "routing.healthy_threshold",
                "must be between 0 and 1",
            ));
        }
        if self.cache.capacity == 0 {
            return Err(ConfigError::invalid("cache.capacity", "must be at least 1"));
        }
        if self.deadlines.fallback_ms == 0 || self.deadlines.synthesis_ms == 0 {
            return Err(ConfigError::invalid("deadlines", "deadlines must be positive"));
        }
        if self.limits.batch_concurrency == 0 {
            return Err(ConfigError::invalid(
                "limits.batch_concurrency",
                "must be at least 1",
            ));
        }
        self.rate_limit.validate("rate_limit")?;

        let mut seen = HashSet::new();
        for backend in &self.backends {
            let field = format!("backends.{}", backend.id);
            if !seen.insert(backend.id.clone()) {
                return Err(ConfigError::invalid(field, "duplicate backend id"));
            }
            if !(0.0..=1.0).contains(&backend.quality) {
                return Err(ConfigError::invalid(field, "quality must be between 0 and 1"));
            }
            if backend.cost_per_1k_tokens_usd < 0.0 {
                return Err(ConfigError::invalid(field, "price must not be negative"));
            }
            if let Some(weight) = backend.synthesis_weight {
                if !(0.0..=1.0).contains(&weight) {
                    return Err(ConfigError::invalid(
                        field,
                        "synthesis_weight must be between 0 and 1",
                    ));
                }
            }
            if let Some(limit) = &backend.rate_limit {
                limit.validate(&field)?;
            }
        }

        Ok(())
    }

    /// Save configuration to disk.
    ///
    /// Creates the config directory if it doesn't exist.
    pub fn save(&self) -> ConfigResult<()> {
        let config_path = Self::config_path()?;
        self.save_to(&config_path)
    }

    /// Save configuration to a specific path.
    pub fn save_to(&self, path: &Path) -> ConfigResult<()> {
        let config_dir = path
            .parent()
            .ok_or_else(|| ConfigError::invalid("config_path", "no parent directory"))?;

        fs::create_dir_all(config_dir)?;
        tracing::debug!("Saving config to {}", path.display());

        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Get the path to the configuration file.
    ///
    /// Uses XDG base directories: `~/.config/prism/gateway.toml`
    pub fn config_path() -> ConfigResult<PathBuf> {
        let dirs = ProjectDirs::from("com", "prism", "prism").ok_or(ConfigError::NoConfigDir)?;
        Ok(dirs.config_dir().join("gateway.toml"))
    }

    /// Get the data directory path.
    ///
    /// Uses XDG base directories: `~/.local/share/prism`
    pub fn data_dir() -> ConfigResult<PathBuf> {
        let dirs = ProjectDirs::from("com", "prism", "prism").ok_or(ConfigError::NoConfigDir)?;
        Ok(dirs.data_dir().to_path_buf())
    }
}

fn env_parse<T: std::str::FromStr>(var: &str) -> Option<T> {
    std::env::var(var).ok().and_then(|val| val.parse().ok())
}

/// Kind of generation backend, selecting the adapter implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// `OpenAI` chat completions API
    OpenAi,
    /// Anthropic messages API
    Anthropic,
    /// Local Ollama server
    Ollama,
    /// Local LM Studio server (`OpenAI`-compatible)
    LmStudio,
    /// Adapter registered programmatically rather than from configuration
    Custom,
}

impl BackendKind {
    /// Whether backends of this kind run on the local machine.
    #[must_use]
    pub fn is_local(self) -> bool {
        matches!(self, Self::Ollama | Self::LmStudio)
    }

    /// Default endpoint for this kind, if it has one.
    #[must_use]
    pub fn default_endpoint(self) -> Option<&'static str> {
        match self {
            Self::OpenAi => Some("https://api.openai.com/v1"),
            Self::Anthropic => Some("https://api.anthropic.com/v1"),
            Self::Ollama => Some("http://localhost:11434"),
            Self::LmStudio => Some("http://localhost:1234/v1"),
            Self::Custom => None,
        }
    }
}

/// Configuration for a single generation backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Unique backend identifier
    pub id: BackendId,
    /// Adapter kind
    pub kind: BackendKind,
    /// Model name passed to the backend
    pub model: String,
    /// Endpoint override (defaults per kind)
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Name of the environment variable holding the API credential
    #[serde(default)]
    pub credential_env: Option<String>,
    /// Capability tags
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Static quality weight (0-1) used by quality-aware routing
    #[serde(default = "default_quality")]
    pub quality: f64,
    /// Price per thousand tokens, in dollars
    #[serde(default)]
    pub cost_per_1k_tokens_usd: f64,
    /// Synthesis weight (0-1); defaults are assigned in declaration order
    #[serde(default)]
    pub synthesis_weight: Option<f64>,
    /// Whether this backend takes part in synthesis requests
    #[serde(default = "default_true")]
    pub synthesis: bool,
    /// Per-call timeout override in milliseconds
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Token bucket override for this backend
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
}

fn default_quality() -> f64 {
    0.5
}

fn default_true() -> bool {
    true
}

/// Daily and monthly spend limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Daily limit in dollars
    pub daily_limit_usd: f64,
    /// Monthly limit in dollars
    pub monthly_limit_usd: f64,
    /// Fraction of a limit at which the warning event fires
    pub warning_ratio: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            daily_limit_usd: 10.0,
            monthly_limit_usd: 200.0,
            warning_ratio: 0.8,
        }
    }
}

/// Token bucket settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Maximum tokens (burst size)
    pub capacity: u32,
    /// Tokens added per second
    pub refill_per_second: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 60,
            refill_per_second: 1.0,
        }
    }
}

impl RateLimitConfig {
    fn validate(&self, field: &str) -> ConfigResult<()> {
        if self.capacity == 0 {
            return Err(ConfigError::invalid(
                format!("{field}.capacity"),
                "must be at least 1",
            ));
        }
        if !self.refill_per_second.is_finite() || self.refill_per_second < 0.0 {
            return Err(ConfigError::invalid(
                format!("{field}.refill_per_second"),
                "must be a non-negative number",
            ));
        }
        Ok(())
    }
}

/// Response cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Whether the response cache is consulted
    pub enabled: bool,
    /// Entry time-to-live in seconds
    pub ttl_secs: u64,
    /// Maximum number of entries before LRU eviction
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 300,
            capacity: 1024,
        }
    }
}

/// Deadline settings, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadlineConfig {
    /// Per-attempt deadline in the fallback chain
    pub fallback_ms: u64,
    /// Ceiling for a whole synthesis fan-out
    pub synthesis_ms: u64,
    /// Overall request deadline shared by all fallback attempts
    pub request_ms: u64,
}

impl Default for DeadlineConfig {
    fn default() -> Self {
        Self {
            fallback_ms: 2_000,
            synthesis_ms: 10_000,
            request_ms: 30_000,
        }
    }
}

/// A custom named redaction pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomPattern {
    /// Category name used in the placeholder (e.g. `EMPLOYEE_ID`)
    pub name: String,
    /// Regular expression matching the sensitive span
    pub pattern: String,
}

/// PII sanitizer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SanitizerConfig {
    /// Built-in categories to enable by name; empty enables all
    pub categories: Vec<String>,
    /// Additional named patterns
    pub custom_patterns: Vec<CustomPattern>,
    /// Whether backend responses are sanitized before being returned
    pub sanitize_responses: bool,
}

impl Default for SanitizerConfig {
    fn default() -> Self {
        Self {
            categories: Vec::new(),
            custom_patterns: Vec::new(),
            sanitize_responses: true,
        }
    }
}

/// Request signing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SigningConfig {
    /// Environment variable holding the shared HMAC secret
    pub secret_env: String,
    /// Accepted timestamp skew in seconds
    pub window_secs: u64,
    /// Number of recent nonces remembered
    pub nonce_capacity: usize,
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            secret_env: "PRISM_SIGNING_SECRET".to_string(),
            window_secs: 300,
            nonce_capacity: 10_000,
        }
    }
}

/// Routing strategy settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// `quality_first`, `cost_optimized`, `balanced` or `latency_optimized`
    pub default_strategy: String,
    /// Minimum health score for a backend to count as healthy
    pub healthy_threshold: f64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            default_strategy: "balanced".to_string(),
            healthy_threshold: 0.7,
        }
    }
}

/// Input limits and batch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum prompt length in characters
    pub max_prompt_chars: usize,
    /// Maximum `max_tokens` a caller may request
    pub max_output_tokens: u32,
    /// Maximum batch items processed concurrently
    pub batch_concurrency: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_prompt_chars: 100_000,
            max_output_tokens: 8_192,
            batch_concurrency: 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = GatewayConfig::default();
        assert!((config.budget.daily_limit_usd - 10.0).abs() < f64::EPSILON);
        assert!((config.budget.monthly_limit_usd - 200.0).abs() < f64::EPSILON);
        assert_eq!(config.cache.ttl_secs, 300);
        assert_eq!(config.deadlines.fallback_ms, 2_000);
        assert_eq!(config.deadlines.synthesis_ms, 10_000);
        assert_eq!(config.signing.window_secs, 300);
        assert_eq!(config.routing.default_strategy, "balanced");
        assert!(config.backends.is_empty());
        config.validate().expect("default config is valid");
    }

    #[test]
    fn test_config_save_load() {
        let tmp = TempDir::new().expect("create temp dir");
        let config_path = tmp.path().join("nested").join("gateway.toml");

        let mut config = GatewayConfig::default();
        config.budget.daily_limit_usd = 25.0;
        config.backends.push(BackendConfig {
            id: BackendId::new("local").expect("valid id"),
            kind: BackendKind::Ollama,
            model: "llama3.1:8b".to_string(),
            endpoint: None,
            credential_env: None,
            capabilities: vec!["chat".to_string()],
            quality: 0.4,
            cost_per_1k_tokens_usd: 0.0,
            synthesis_weight: Some(0.25),
            synthesis: true,
            timeout_ms: Some(5_000),
            rate_limit: None,
        });

        config.save_to(&config_path).expect("save config");
        let loaded = GatewayConfig::load_from(&config_path).expect("load config");

        assert!((loaded.budget.daily_limit_usd - 25.0).abs() < f64::EPSILON);
        assert_eq!(loaded.backends.len(), 1);
        assert_eq!(loaded.backends[0].kind, BackendKind::Ollama);
        assert_eq!(loaded.backends[0].synthesis_weight, Some(0.25));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let tmp = TempDir::new().expect("create temp dir");
        let config = GatewayConfig::load_from(&tmp.path().join("absent.toml"))
            .expect("load defaults");
        assert_eq!(config.cache.capacity, 1024);
    }

    #[test]
    fn test_partial_config() {
        let toml_str = r#"
[budget]
daily_limit_usd = 5.0

[[backends]]
id = "primary"
kind = "open_ai"
model = "gpt-4o"
credential_env = "OPENAI_API_KEY"
quality = 0.9
cost_per_1k_tokens_usd = 0.01
"#;

        let config: GatewayConfig = toml::from_str(toml_str).expect("parse partial config");
        assert!((config.budget.daily_limit_usd - 5.0).abs() < f64::EPSILON);
        assert!((config.budget.monthly_limit_usd - 200.0).abs() < f64::EPSILON);
        assert_eq!(config.backends[0].kind, BackendKind::OpenAi);
        assert!(config.backends[0].synthesis);
        assert_eq!(config.backends[0].synthesis_weight, None);
        config.validate().expect("partial config is valid");
    }

    #[test]
    fn test_validate_rejects_duplicates_and_ranges() {
        let toml_str = r#"
[[backends]]
id = "dup"
kind = "ollama"
model = "a"

[[backends]]
id = "dup"
kind = "ollama"
model = "b"
"#;
        let config: GatewayConfig = toml::from_str(toml_str).expect("parse config");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));

        let mut config = GatewayConfig::default();
        config.routing.healthy_threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = GatewayConfig::default();
        config.rate_limit.capacity = 0;
        assert!(config.validate().is_err());

        let mut config = GatewayConfig::default();
        config.routing.default_strategy = "fastest".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        std::env::set_var("PRISM_DAILY_LIMIT_USD", "42.5");
        std::env::set_var("PRISM_ROUTING_STRATEGY", "cost_optimized");

        let mut config = GatewayConfig::default();
        config.apply_env_overrides();
        assert!((config.budget.daily_limit_usd - 42.5).abs() < f64::EPSILON);
        assert_eq!(config.routing.default_strategy, "cost_optimized");

        std::env::remove_var("PRISM_DAILY_LIMIT_USD");
        std::env::remove_var("PRISM_ROUTING_STRATEGY");
    }

    #[test]
    fn test_backend_kind_locality() {
        assert!(BackendKind::Ollama.is_local());
        assert!(BackendKind::LmStudio.is_local());
        assert!(!BackendKind::OpenAi.is_local());
        assert_eq!(
            BackendKind::Anthropic.default_endpoint(),
            Some("https://api.anthropic.com/v1")
        );
    }
}
