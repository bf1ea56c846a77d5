//! Core error types for the Prism gateway.
//!
//! This module defines the central error type shared by the workspace crates.
//! Subsystem crates wrap it in their own error enums.

use thiserror::Error;

/// Central error type for shared Prism operations.
#[derive(Error, Debug)]
pub enum PrismError {
    /// Configuration errors (file loading, parsing, validation)
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Validation errors (invalid identifiers, amounts)
    #[error("validation error: {0}")]
    Validation(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal errors
    #[error("internal error: {0}")]
    Internal(String),
}

/// Configuration-specific errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to determine config directory path
    #[error("could not determine config directory (XDG base directories not available)")]
    NoConfigDir,

    /// Failed to parse TOML
    #[error("failed to parse config TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Failed to serialize config
    #[error("failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    /// I/O error reading/writing config
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A referenced secret is not present in the environment
    #[error("missing secret: environment variable {var} is not set")]
    MissingSecret {
        /// Environment variable name
        var: String,
    },

    /// Invalid configuration value
    #[error("invalid config value for {field}: {reason}")]
    InvalidValue {
        /// Field name
        field: String,
        /// Reason for invalidity
        reason: String,
    },
}

impl ConfigError {
    /// Shorthand for an [`ConfigError::InvalidValue`].
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Result type alias using `PrismError`.
pub type Result<T> = std::result::Result<T, PrismError>;

/// Result type alias for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PrismError::Validation("invalid backend id".to_string());
        assert_eq!(err.to_string(), "validation error: invalid backend id");

        let err = ConfigError::MissingSecret {
            var: "PRISM_SIGNING_SECRET".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "missing secret: environment variable PRISM_SIGNING_SECRET is not set"
        );
    }

    #[test]
    fn test_error_from_config() {
        let config_err = ConfigError::NoConfigDir;
        let prism_err: PrismError = config_err.into();
        assert!(matches!(prism_err, PrismError::Config(_)));
    }

    #[test]
    fn test_invalid_shorthand() {
        let err = ConfigError::invalid("budget.daily_limit_usd", "must be positive");
        assert_eq!(
            err.to_string(),
            "invalid config value for budget.daily_limit_usd: must be positive"
        );
    }
}
