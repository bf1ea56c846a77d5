//! Prism Core - Foundation crate for the Prism generation gateway.
//!
//! This crate provides the shared types, error handling and configuration
//! management that the gateway and its storage collaborator depend on.
//!
//! # Modules
//!
//! - [`error`] - Central error types using thiserror
//! - [`config`] - TOML-based configuration with XDG paths and env overrides
//! - [`types`] - Shared newtypes (`BackendId`, `RequestId`, `Usd`)
//!
//! # Example
//!
//! ```rust
//! use prism_core::{GatewayConfig, Usd};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = GatewayConfig::default();
//! config.validate()?;
//!
//! let daily = Usd::from_dollars(config.budget.daily_limit_usd);
//! assert_eq!(daily.to_string(), "$10.000");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod config;
pub mod error;
pub mod types;

// Re-export commonly used types
pub use config::{
    BackendConfig, BackendKind, BudgetConfig, CacheConfig, CustomPattern, DeadlineConfig,
    GatewayConfig, LimitsConfig, RateLimitConfig, RoutingConfig, SanitizerConfig, SigningConfig,
};
pub use error::{ConfigError, ConfigResult, PrismError, Result};
pub use types::{BackendId, RequestId, TokenPrice, Usd};
