//! # Transcription Provider
//!
//! Speech-to-text over HTTP: posts the containerized turn audio as a
//! multipart upload and validates the `{transcript, language_code}` reply at
//! the boundary. The translate-style endpoint detects the spoken language
//! itself, which is what lets the rest of the turn answer in kind.

use crate::config::ProviderConfig;
use crate::error::{AppError, AppResult};
use crate::providers::{parse_json_body, provider_client, TranscriptResult, TranscriptionProvider};
use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

/// Fallback language when the provider omits the tag; the transport's
/// calling region makes Indian English the sensible default.
const DEFAULT_LANGUAGE_CODE: &str = "en-IN";

pub struct HttpTranscriptionProvider {
    config: ProviderConfig,
    client: reqwest::Client,
}

impl HttpTranscriptionProvider {
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
impl TranscriptionProvider for HttpTranscriptionProvider {
    async fn transcribe(&self, container_audio: Vec<u8>) -> AppResult<TranscriptResult> {
        if container_audio.is_empty() {
            return Err(AppError::Provider(
                "no audio to transcribe".to_string(),
            ));
        }
        debug!(
            bytes = container_audio.len(),
            model = %self.config.stt_model,
            "sending audio for transcription"
        );

        let file = reqwest::multipart::Part::bytes(container_audio)
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| AppError::Provider(format!("failed to build audio part: {}", e)))?;
        let form = reqwest::multipart::Form::new()
            .part("file", file)
            .text("model", self.config.stt_model.clone());

        let response = self
            .client
            .post(format!(
                "{}/speech-to-text-translate",
                self.config.api_base.trim_end_matches('/')
            ))
            .header("api-subscription-key", &self.config.api_key)
            .multipart(form)
            .send()
            .await?;

        let body = parse_json_body("speech-to-text", response).await?;

        let transcript = body
            .get("transcript")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_string();
        if transcript.is_empty() {
            return Err(AppError::Provider(
                "speech-to-text response carried no transcript".to_string(),
            ));
        }

        let language_code = body
            .get("language_code")
            .and_then(Value::as_str)
            .filter(|code| !code.trim().is_empty())
            .unwrap_or(DEFAULT_LANGUAGE_CODE)
            .to_string();

        Ok(TranscriptResult {
            transcript,
            language_code,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    #[test]
    fn test_rejects_empty_api_base() {
        let mut config = AppConfig::default().providers;
        config.api_base = "  ".to_string();
        assert!(HttpTranscriptionProvider::new(&config).is_err());
    }

    #[tokio::test]
    async fn test_rejects_empty_audio_before_any_network_call() {
        let config = AppConfig::default().providers;
        let provider = HttpTranscriptionProvider::new(&config).unwrap();
        let err = provider.transcribe(Vec::new()).await.unwrap_err();
        assert!(matches!(err, AppError::Provider(_)));
    }
}
