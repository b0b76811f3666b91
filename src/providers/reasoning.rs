//! # Reasoning Provider
//!
//! Chat-completion client. Token and temperature limits come from
//! configuration and are deliberately small - the output is spoken over a
//! phone line, not rendered on a screen.

use crate::config::ProviderConfig;
use crate::error::{AppError, AppResult};
use crate::providers::{parse_json_body, provider_client, ChatMessage, ReasoningProvider};
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

pub struct HttpReasoningProvider {
    config: ProviderConfig,
    client: reqwest::Client,
}

impl HttpReasoningProvider {
    pub fn new(config: &ProviderConfig) -> AppResult<Self> {
        if config.api_base.trim().is_empty() {
            return Err(AppError::Config(
                "provider api_base must not be empty".to_string(),
            ));
        }
        Ok(Self {
            config: config.clone(),
            client: provider_client(config.timeout_ms)?,
        })
    }
}

#[async_trait]
impl ReasoningProvider for HttpReasoningProvider {
    async fn complete(&self, messages: Vec<ChatMessage>) -> AppResult<String> {
        if messages.is_empty() {
            return Err(AppError::Provider(
                "chat completion needs at least one message".to_string(),
            ));
        }
        debug!(messages = messages.len(), "requesting chat completion");

        let payload = json!({
            "messages": messages,
            "max_tokens": self.config.chat_max_tokens,
            "temperature": self.config.chat_temperature,
        });

        let response = self
            .client
            .post(format!(
                "{}/v1/chat/completions",
                self.config.api_base.trim_end_matches('/')
            ))
            .header("api-subscription-key", &self.config.api_key)
            .json(&payload)
            .send()
            .await?;

        let body = parse_json_body("chat-completion", response).await?;

        let content = body
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_string();
        if content.is_empty() {
            return Err(AppError::Provider(
                "chat completion returned no content".to_string(),
            ));
        }

        Ok(content)
    }
}
