//! Anthropic Messages API adapter.

use super::common::{build_http_client, classify_response, classify_transport};
use crate::backend::{BackendAdapter, BackendDescriptor, BackendOutput};
use crate::error::BackendError;
use crate::request::GenerationParams;
use async_trait::async_trait;
use prism_core::ConfigError;
use reqwest::Client;
use serde::{Deserialize, Serialize};

/// Adapter for the Anthropic Messages API.
pub struct AnthropicAdapter {
    descriptor: BackendDescriptor,
    api_key: String,
    client: Client,
    base_url: String,
}

impl AnthropicAdapter {
    /// Create an adapter for `descriptor`.
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be created.
    pub fn new(descriptor: BackendDescriptor, api_key: impl Into<String>) -> Result<Self, ConfigError> {
        let base_url = descriptor
            .endpoint
            .clone()
            .unwrap_or_else(|| "https://api.anthropic.com/v1".to_string());
        Ok(Self {
            client: build_http_client(descriptor.timeout)?,
            descriptor,
            api_key: api_key.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn to_api_request(&self, prompt: &str, params: &GenerationParams) -> AnthropicRequest {
        AnthropicRequest {
            model: self.descriptor.model.clone(),
            messages: vec![AnthropicMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            max_tokens: params.max_tokens,
            // The Messages API accepts temperatures in [0, 1].
            temperature: params.temperature.min(1.0),
        }
    }

    fn convert_api_response(response: AnthropicResponse) -> BackendOutput {
        let text = response
            .content
            .into_iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text),
                ContentBlock::Other => None,
            })
            .collect::<Vec<_>>()
            .join("\n");

        BackendOutput {
            text,
            token_count: response
                .usage
                .input_tokens
                .saturating_add(response.usage.output_tokens),
        }
    }
}

#[async_trait]
impl BackendAdapter for AnthropicAdapter {
    fn descriptor(&self) -> &BackendDescriptor {
        &self.descriptor
    }

    async fn call(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<BackendOutput, BackendError> {
        let api_request = self.to_api_request(prompt, params);

        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&api_request)
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;

        if !response.status().is_success() {
            return Err(classify_response(response).await);
        }

        let api_response: AnthropicResponse =
            response.json().await.map_err(|e| classify_transport(&e))?;

        Ok(Self::convert_api_response(api_response))
    }
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    messages: Vec<AnthropicMessage>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<ContentBlock>,
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
}
