//! Common utilities shared across HTTP backend adapters.

use crate::error::BackendError;
use prism_core::ConfigError;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Build an HTTP client with the adapter's timeout.
///
/// The gateway applies its own deadlines; this one only bounds a stuck
/// connection when an adapter is used on its own.
///
/// # Errors
/// Returns error if the HTTP client cannot be created.
pub fn build_http_client(timeout: Option<Duration>) -> Result<Client, ConfigError> {
    Client::builder()
        .timeout(timeout.unwrap_or(Duration::from_secs(60)))
        .build()
        .map_err(|e| ConfigError::invalid("backends", format!("failed to create HTTP client: {e}")))
}

/// Read a credential from the environment variable named in configuration.
///
/// # Errors
/// Returns `ConfigError::MissingSecret` if the variable is unset or empty.
pub fn resolve_credential(var: &str) -> Result<String, ConfigError> {
    match std::env::var(var) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ConfigError::MissingSecret {
            var: var.to_string(),
        }),
    }
}

/// Classify a non-success HTTP response.
///
/// The body is inspected only to tell upstream throttling apart from an
/// exhausted quota; it is never copied into the summary.
pub async fn classify_response(response: Response) -> BackendError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    classify_status(status, &body)
}

/// Classify an HTTP status, using `body` only for quota detection.
#[must_use]
pub fn classify_status(status: StatusCode, body: &str) -> BackendError {
    let code = status.as_u16();
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            BackendError::permanent(format!("authentication failed (HTTP {code})"))
        }
        StatusCode::PAYMENT_REQUIRED => {
            BackendError::permanent(format!("upstream quota exhausted (HTTP {code})"))
        }
        StatusCode::TOO_MANY_REQUESTS => {
            let lowered = body.to_ascii_lowercase();
            if lowered.contains("insufficient_quota") || lowered.contains("quota") {
                BackendError::permanent(format!("upstream quota exhausted (HTTP {code})"))
            } else {
                BackendError::transient(format!("upstream throttled (HTTP {code})"))
            }
        }
        StatusCode::REQUEST_TIMEOUT => BackendError::transient(format!("upstream timeout (HTTP {code})")),
        s if s.is_server_error() => BackendError::transient(format!("upstream server error (HTTP {code})")),
        s if s.is_client_error() => BackendError::permanent(format!("invalid request (HTTP {code})")),
        _ => BackendError::transient(format!("unexpected status (HTTP {code})")),
    }
}

/// Classify a transport error without exposing its message.
#[must_use]
pub fn classify_transport(err: &reqwest::Error) -> BackendError {
    if err.is_timeout() {
        BackendError::transient("request timed out")
    } else if err.is_connect() {
        BackendError::transient("connection failed")
    } else if err.is_decode() {
        BackendError::transient("malformed response body")
    } else if err.is_builder() {
        BackendError::permanent("invalid request")
    } else {
        BackendError::transient("connection reset")
    }
}

/// Message structure for `OpenAI`-compatible APIs.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StandardMessage {
    /// Role of the message sender ("system", "user", "assistant")
    pub role: String,
    /// Text content
    pub content: String,
}

/// Token usage as reported by `OpenAI`-compatible APIs.
#[derive(Debug, Deserialize, Clone)]
pub struct StandardUsage {
    /// Prompt tokens
    pub prompt_tokens: u32,
    /// Completion tokens
    pub completion_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorClass;

    #[test]
    fn test_build_http_client() {
        assert!(build_http_client(Some(Duration::from_secs(5))).is_ok());
        assert!(build_http_client(None).is_ok());
    }

    #[test]
    fn test_auth_failures_are_permanent() {
        let err = classify_status(StatusCode::UNAUTHORIZED, "{\"error\":\"bad key sk-123\"}");
        assert_eq!(err.class, ErrorClass::Permanent);
        assert!(!err.summary.contains("sk-123"));
        assert_eq!(classify_status(StatusCode::FORBIDDEN, "").class, ErrorClass::Permanent);
    }

    #[test]
    fn test_invalid_requests_are_permanent() {
        for status in [StatusCode::BAD_REQUEST, StatusCode::NOT_FOUND, StatusCode::UNPROCESSABLE_ENTITY] {
            assert_eq!(classify_status(status, "").class, ErrorClass::Permanent);
        }
    }

    #[test]
    fn test_throttling_vs_quota() {
        let throttled = classify_status(StatusCode::TOO_MANY_REQUESTS, "slow down");
        assert_eq!(throttled.class, ErrorClass::Transient);

        let quota = classify_status(
            StatusCode::TOO_MANY_REQUESTS,
            "{\"error\":{\"code\":\"insufficient_quota\"}}",
        );
        assert_eq!(quota.class, ErrorClass::Permanent);
        assert!(!quota.summary.contains("insufficient_quota"));
    }

    #[test]
    fn test_server_errors_are_transient() {
        for status in [
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::GATEWAY_TIMEOUT,
        ] {
            let err = classify_status(status, "stack trace with secrets");
            assert_eq!(err.class, ErrorClass::Transient);
            assert!(!err.summary.contains("secrets"));
        }
    }

    #[test]
    fn test_resolve_credential() {
        std::env::set_var("PRISM_TEST_CREDENTIAL_PRESENT", "value");
        assert_eq!(
            resolve_credential("PRISM_TEST_CREDENTIAL_PRESENT").expect("credential set"),
            "value"
        );
        std::env::remove_var("PRISM_TEST_CREDENTIAL_PRESENT");

        assert!(matches!(
            resolve_credential("PRISM_TEST_CREDENTIAL_ABSENT"),
            Err(ConfigError::MissingSecret { .. })
        ));
    }
}
