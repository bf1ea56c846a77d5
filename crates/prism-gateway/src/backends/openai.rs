//! `OpenAI`-compatible chat completions adapter.
//!
//! Also serves LM Studio and other servers exposing the same API.

use super::common::{
    build_http_client, classify_response, classify_transport, StandardMessage, StandardUsage,
};
use crate::backend::{BackendAdapter, BackendDescriptor, BackendOutput};
use crate::error::BackendError;
use crate::request::{estimate_tokens, GenerationParams};
use async_trait::async_trait;
use prism_core::ConfigError;
use reqwest::Client;
use serde::{Deserialize, Serialize};

/// Adapter for `OpenAI`-compatible chat completion endpoints.
pub struct OpenAiAdapter {
    descriptor: BackendDescriptor,
    api_key: Option<String>,
    client: Client,
    base_url: String,
}

impl OpenAiAdapter {
    /// Create an adapter for `descriptor`.
    ///
    /// Local servers may run without a key.
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be created.
    pub fn new(descriptor: BackendDescriptor, api_key: Option<String>) -> Result<Self, ConfigError> {
        let base_url = descriptor
            .endpoint
            .clone()
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string());
        Ok(Self {
            client: build_http_client(descriptor.timeout)?,
            descriptor,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn to_api_request(&self, prompt: &str, params: &GenerationParams) -> OpenAiRequest {
        OpenAiRequest {
            model: self.descriptor.model.clone(),
            messages: vec![StandardMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            max_tokens: params.max_tokens,
            temperature: params.temperature,
        }
    }

    fn convert_api_response(prompt: &str, response: OpenAiResponse) -> Result<BackendOutput, BackendError> {
        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| BackendError::transient("response contained no choices"))?;

        let token_count = response.usage.map_or_else(
            || estimate_tokens(prompt).saturating_add(estimate_tokens(&choice.message.content)),
            |u| u.prompt_tokens.saturating_add(u.completion_tokens),
        );

        Ok(BackendOutput {
            text: choice.message.content,
            token_count,
        })
    }
}

#[async_trait]
impl BackendAdapter for OpenAiAdapter {
    fn descriptor(&self) -> &BackendDescriptor {
        &self.descriptor
    }

    async fn call(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<BackendOutput, BackendError> {
        let api_request = self.to_api_request(prompt, params);

        let mut request = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Content-Type", "application/json")
            .json(&api_request);
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {key}"));
        }

        let response = request.send().await.map_err(|e| classify_transport(&e))?;

        if !response.status().is_success() {
            return Err(classify_response(response).await);
        }

        let api_response: OpenAiResponse =
            response.json().await.map_err(|e| classify_transport(&e))?;

        Self::convert_api_response(prompt, api_response)
    }
}

#[derive(Debug, Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<StandardMessage>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
    usage: Option<StandardUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: StandardMessage,
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_core::{BackendId, BackendKind};

    fn adapter() -> OpenAiAdapter {
        let descriptor = BackendDescriptor::new(BackendId::new("gpt").expect("valid id"), BackendKind::OpenAi)
            .with_model("gpt-4o");
        OpenAiAdapter::new(descriptor, Some("test-key".to_string())).expect("create adapter")
    }

    #[test]
    fn test_api_request_conversion() {
        let params = GenerationParams {
            max_tokens: 1000,
            temperature: 0.7,
            ..GenerationParams::default()
        };
        let api_request = adapter().to_api_request("Hello", &params);

        assert_eq!(api_request.model, "gpt-4o");
        assert_eq!(api_request.max_tokens, 1000);
        assert_eq!(api_request.messages.len(), 1);
        assert_eq!(api_request.messages[0].role, "user");
        assert_eq!(api_request.messages[0].content, "Hello");
    }

    #[test]
    fn test_response_conversion_uses_reported_usage() {
        let response: OpenAiResponse = serde_json::from_str(
            r#"{"choices":[{"message":{"role":"assistant","content":"Hi there"}}],
                "usage":{"prompt_tokens":5,"completion_tokens":7}}"#,
        )
        .expect("parse response");
        let output = OpenAiAdapter::convert_api_response("Hello", response).expect("convert");
        assert_eq!(output.text, "Hi there");
        assert_eq!(output.token_count, 12);
    }

    #[test]
    fn test_oversized_usage_saturates() {
        let response: OpenAiResponse = serde_json::from_str(
            r#"{"choices":[{"message":{"role":"assistant","content":"Hi"}}],
                "usage":{"prompt_tokens":4294967295,"completion_tokens":10}}"#,
        )
        .expect("parse response");
        let output = OpenAiAdapter::convert_api_response("Hello", response).expect("convert");
        assert_eq!(output.token_count, u32::MAX);
    }

    #[test]
    fn test_empty_choices_is_transient() {
        let response: OpenAiResponse =
            serde_json::from_str(r#"{"choices":[]}"#).expect("parse response");
        let err = OpenAiAdapter::convert_api_response("Hello", response).expect_err("no choices");
        assert!(err.is_transient());
    }

    #[test]
    fn test_base_url_defaults() {
        assert_eq!(adapter().base_url, "https://api.openai.com/v1");
    }
}
