//! Ollama local server adapter.

use super::common::{build_http_client, classify_response, classify_transport};
use crate::backend::{BackendAdapter, BackendDescriptor, BackendOutput};
use crate::error::BackendError;
use crate::request::{estimate_tokens, GenerationParams};
use async_trait::async_trait;
use prism_core::ConfigError;
use reqwest::Client;
use serde::{Deserialize, Serialize};

/// Adapter for a local Ollama instance. Prompts never leave the machine.
pub struct OllamaAdapter {
    descriptor: BackendDescriptor,
    client: Client,
    base_url: String,
}

impl OllamaAdapter {
    /// Create an adapter for `descriptor`.
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be created.
    pub fn new(descriptor: BackendDescriptor) -> Result<Self, ConfigError> {
        let base_url = descriptor
            .endpoint
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());
        Ok(Self {
            client: build_http_client(descriptor.timeout)?,
            descriptor,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn to_api_request(&self, prompt: &str, params: &GenerationParams) -> OllamaRequest {
        OllamaRequest {
            model: self.descriptor.model.clone(),
            prompt: prompt.to_string(),
            stream: false,
            options: OllamaOptions {
                temperature: params.temperature,
                num_predict: i32::try_from(params.max_tokens).unwrap_or(i32::MAX),
            },
        }
    }

    fn convert_api_response(prompt: &str, response: OllamaResponse) -> BackendOutput {
        let token_count = match (response.prompt_eval_count, response.eval_count) {
            (Some(input), Some(output)) => input.saturating_add(output),
            (None, Some(output)) => estimate_tokens(prompt).saturating_add(output),
            _ => estimate_tokens(prompt).saturating_add(estimate_tokens(&response.response)),
        };
        BackendOutput {
            text: response.response,
            token_count,
        }
    }
}

#[async_trait]
impl BackendAdapter for OllamaAdapter {
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
            .post(format!("{}/api/generate", self.base_url))
            .json(&api_request)
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;

        if !response.status().is_success() {
            return Err(classify_response(response).await);
        }

        let api_response: OllamaResponse =
            response.json().await.map_err(|e| classify_transport(&e))?;

        Ok(Self::convert_api_response(prompt, api_response))
    }
}

#[derive(Debug, Serialize)]
struct OllamaRequest {
    model: String,
    prompt: String,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
    num_predict: i32,
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    response: String,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
}
