//! OpenAI-compatible chat-completions client
//! Works against OpenAI itself, OpenRouter, vLLM and anything else speaking the protocol

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use super::{strip_code_fences, system_prompt, TextUnderstanding};
use crate::config::LlmConfig;
use crate::{PipelineError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionResponse {
    pub choices: Vec<ChatChoice>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatChoice {
    pub message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

pub struct OpenAICompatibleClient {
    client: Client,
    config: LlmConfig,
}

impl OpenAICompatibleClient {
    pub fn new(config: LlmConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| PipelineError::Config(format!("HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }

    fn build_headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(api_key) = &self.config.api_key {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {}", api_key))
                    .map_err(|e| PipelineError::Config(format!("Invalid API key format: {}", e)))?,
            );
        }
        Ok(headers)
    }

    fn build_request(&self, raw_text: &str) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: self.config.model.clone(),
            messages: vec![
                ChatMessage::system(system_prompt()),
                ChatMessage::user(format!("Document text:\n\n{}", raw_text)),
            ],
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        }
    }

    /// Map a non-2xx reply; credentials problems will not fix themselves
    fn handle_error_response(status_code: u16, error_text: &str) -> PipelineError {
        let message = serde_json::from_str::<ApiErrorBody>(error_text)
            .map(|body| body.error.message)
            .unwrap_or_else(|_| error_text.to_string());
        match status_code {
            401 | 403 => PipelineError::Config(format!("authentication rejected: {}", message)),
            _ => PipelineError::TextUnderstanding(format!("HTTP {}: {}", status_code, message)),
        }
    }
}

#[async_trait]
impl TextUnderstanding for OpenAICompatibleClient {
    async fn understand(&self, raw_text: &str) -> Result<String> {
        let request_url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        debug!(
            "Chat completion request: URL={}, Model={}, {} chars of text",
            request_url,
            self.config.model,
            raw_text.len()
        );

        let response = self
            .client
            .post(&request_url)
            .headers(self.build_headers()?)
            .json(&self.build_request(raw_text))
            .send()
            .await
            .map_err(|e| PipelineError::TextUnderstanding(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            error!("Chat completion error: {} - {}", status, error_text);
            return Err(Self::handle_error_response(status.as_u16(), &error_text));
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::TextUnderstanding(format!("unreadable reply: {}", e)))?;

        let content = completion
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| PipelineError::TextUnderstanding("reply had no choices".to_string()))?;

        Ok(strip_code_fences(&content).to_string())
    }
}
