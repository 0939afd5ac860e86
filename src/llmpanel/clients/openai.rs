//! The `OpenAICompatibleClient` struct implements `ClientWrapper` for any endpoint
//! speaking the OpenAI Chat Completions protocol (OpenAI itself, xAI, and most
//! self-hosted gateways).
//!
//! # Example
//!
//! ```rust,no_run
//! use llmpanel::client_wrapper::ClientWrapper;
//! use llmpanel::clients::openai::OpenAICompatibleClient;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! let client = OpenAICompatibleClient::openai(&std::env::var("OPENAI_API_KEY")?);
//! let reply = client
//!     .chat("You are terse.", "Name one prime number.", "gpt-4o-mini", Some(16))
//!     .await?;
//! println!("{} ({:?})", reply.content, reply.usage);
//! # Ok(())
//! # }
//! ```

use crate::client_wrapper::{ChatResponse, ClientError, ClientWrapper, TokenUsage};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const XAI_BASE_URL: &str = "https://api.x.ai/v1";

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("response contained no choices")]
    EmptyResponse,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<usize>,
}

#[derive(Deserialize)]
struct ChatCompletion {
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    prompt_tokens: usize,
    completion_tokens: usize,
}

/// Client for an OpenAI-compatible `/chat/completions` endpoint.
pub struct OpenAICompatibleClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    provider: String,
}

impl OpenAICompatibleClient {
    /// Construct a client for `base_url` (e.g. `https://api.openai.com/v1`).
    pub fn new(api_key: &str, base_url: &str) -> Self {
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Some(Duration::from_secs(90)))
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|e| {
                log::warn!("OpenAICompatibleClient: falling back to default HTTP client: {}", e);
                reqwest::Client::new()
            });
        Self {
            http,
            api_key: api_key.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            provider: "openai-compatible".to_string(),
        }
    }

    pub fn openai(api_key: &str) -> Self {
        Self::new(api_key, OPENAI_BASE_URL).with_provider_name("openai")
    }

    pub fn xai(api_key: &str) -> Self {
        Self::new(api_key, XAI_BASE_URL).with_provider_name("xai")
    }

    /// Label recorded on ledger transactions for models the crate can't attribute.
    pub fn with_provider_name(mut self, provider: &str) -> Self {
        self.provider = provider.to_string();
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

fn into_chat_response(completion: ChatCompletion) -> Result<ChatResponse, ProviderError> {
    let content = completion
        .choices
        .into_iter()
        .next()
        .ok_or(ProviderError::EmptyResponse)?
        .message
        .content
        .unwrap_or_default();
    let mut response = ChatResponse::new(content);
    if let Some(usage) = completion.usage {
        response = response.with_usage(TokenUsage::new(
            usage.prompt_tokens,
            usage.completion_tokens,
        ));
    }
    Ok(response)
}

#[async_trait]
impl ClientWrapper for OpenAICompatibleClient {
    async fn chat(
        &self,
        system_prompt: &str,
        user_message: &str,
        model: &str,
        max_tokens: Option<usize>,
    ) -> Result<ChatResponse, ClientError> {
        let request = ChatRequest {
            model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: user_message,
                },
            ],
            max_tokens,
        };

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            log::error!(
                "OpenAICompatibleClient: {} returned HTTP {}",
                self.base_url,
                status.as_u16()
            );
            return Err(Box::new(ProviderError::Status {
                status: status.as_u16(),
                body,
            }));
        }

        let completion: ChatCompletion = response.json().await?;
        Ok(into_chat_response(completion)?)
    }

    fn provider_name(&self) -> &str {
        &self.provider
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_content_and_usage() {
        let raw = r#"{
            "id": "chatcmpl-1",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "42"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 1, "total_tokens": 13}
        }"#;
        let completion: ChatCompletion = serde_json::from_str(raw).unwrap();
        let response = into_chat_response(completion).unwrap();
        assert_eq!(response.content, "42");
        assert_eq!(response.usage, Some(TokenUsage::new(12, 1)));
    }

    #[test]
    fn test_missing_usage_is_none() {
        let raw = r#"{"choices": [{"message": {"content": "hi"}}]}"#;
        let completion: ChatCompletion = serde_json::from_str(raw).unwrap();
        assert!(into_chat_response(completion).unwrap().usage.is_none());
    }

    #[test]
    fn test_empty_choices_is_an_error() {
        let completion: ChatCompletion = serde_json::from_str(r#"{"choices": []}"#).unwrap();
        assert!(matches!(
            into_chat_response(completion),
            Err(ProviderError::EmptyResponse)
        ));
    }

    #[test]
    fn test_trailing_slash_trimmed() {
        let client = OpenAICompatibleClient::new("k", "http://localhost:8080/v1/");
        assert_eq!(client.base_url(), "http://localhost:8080/v1");
        assert_eq!(client.provider_name(), "openai-compatible");
    }
}
