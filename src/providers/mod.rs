//! # Speech and Reasoning Providers
//!
//! HTTP clients for the three opaque services the conversation loop calls:
//! speech-to-text, chat completion and text-to-speech. One provider account
//! serves all three, so the clients share the configuration block and the
//! `api-subscription-key` header convention.
//!
//! ## Boundary policy:
//! Each call gets an explicit result type with required-field validation at
//! the edge - a response missing its transcript or audio payload becomes an
//! `AppError::Provider` here, never an attribute error three stages later.
//! The traits are the seams: the pipeline only sees `dyn
//! TranscriptionProvider` etc., and tests substitute deterministic fakes.
//!
//! No retries anywhere. A failed call fails the turn and the call moves on.

pub mod reasoning;
pub mod synthesis;
pub mod transcription;

pub use reasoning::HttpReasoningProvider;
pub use synthesis::HttpSynthesisProvider;
pub use transcription::HttpTranscriptionProvider;

use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use serde::Serialize;

const MAX_ERROR_BODY_CHARS: usize = 512;

/// Recognized text plus the language the caller spoke in.
///
/// The language tag drives both the narration language and the synthesis
/// voice, so it travels with the transcript everywhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptResult {
    pub transcript: String,
    pub language_code: String,
}

/// One message in a chat-completion conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
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

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Speech-to-text service seam.
#[async_trait]
pub trait TranscriptionProvider: Send + Sync {
    /// Transcribe one containerized audio turn.
    async fn transcribe(&self, container_audio: Vec<u8>) -> AppResult<TranscriptResult>;
}

/// Chat-completion service seam.
#[async_trait]
pub trait ReasoningProvider: Send + Sync {
    /// Run one completion over the message list and return the generated text.
    async fn complete(&self, messages: Vec<ChatMessage>) -> AppResult<String>;
}

/// Text-to-speech service seam.
#[async_trait]
pub trait SynthesisProvider: Send + Sync {
    /// Synthesize speech, returning one or more decoded WAV segments.
    async fn synthesize(&self, text: &str, language_code: &str) -> AppResult<Vec<Vec<u8>>>;
}

/// Check the HTTP status and parse the body as JSON, mapping both failure
/// modes to a Provider error tagged with the operation name.
pub(crate) async fn parse_json_body(
    operation: &str,
    response: reqwest::Response,
) -> AppResult<serde_json::Value> {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();

    if !status.is_success() {
        return Err(AppError::Provider(format!(
            "{} call failed: status={} body={}",
            operation,
            status.as_u16(),
            truncate_body(&body)
        )));
    }

    serde_json::from_str(&body).map_err(|e| {
        AppError::Provider(format!("{} returned invalid JSON: {}", operation, e))
    })
}

/// Bound how much of an upstream error body ends up in a log line.
pub(crate) fn truncate_body(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return "<empty>".to_string();
    }
    if trimmed.chars().count() <= MAX_ERROR_BODY_CHARS {
        return trimmed.to_string();
    }
    let truncated: String = trimmed.chars().take(MAX_ERROR_BODY_CHARS).collect();
    format!("{}...", truncated)
}

/// Build the shared HTTP client with the configured per-request timeout.
pub(crate) fn provider_client(timeout_ms: u64) -> AppResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_millis(timeout_ms.max(1)))
        .build()
        .map_err(|e| AppError::Provider(format!("failed to initialize HTTP client: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_message_serializes_to_role_content_shape() {
        let msg = ChatMessage::system("You are a helpful assistant.");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "system");
        assert_eq!(json["content"], "You are a helpful assistant.");
    }

    #[test]
    fn test_truncate_body_handles_empty_and_long_input() {
        assert_eq!(truncate_body("   "), "<empty>");
        assert_eq!(truncate_body("short"), "short");

        let long = "x".repeat(2000);
        let truncated = truncate_body(&long);
        assert!(truncated.ends_with("..."));
        assert!(truncated.chars().count() <= MAX_ERROR_BODY_CHARS + 3);
    }
}
