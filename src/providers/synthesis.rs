//! # Synthesis Provider
//!
//! Text-to-speech client. Audio comes back as a list of base64 WAV
//! segments; this client decodes each segment and hands the list to the
//! codec adapter, which reassembles them into one container. The sample
//! rate is requested at the telephony rate so no resampling is needed
//! downstream.

use crate::config::ProviderConfig;
use crate::error::{AppError, AppResult};
use crate::providers::{parse_json_body, provider_client, SynthesisProvider};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use serde_json::{json, Value};
use tracing::debug;

pub struct HttpSynthesisProvider {
    config: ProviderConfig,
    client: reqwest::Client,
}

impl HttpSynthesisProvider {
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
impl SynthesisProvider for HttpSynthesisProvider {
    async fn synthesize(&self, text: &str, language_code: &str) -> AppResult<Vec<Vec<u8>>> {
        let text = text.trim();
        if text.is_empty() {
            return Err(AppError::Provider(
                "nothing to synthesize".to_string(),
            ));
        }
        debug!(
            chars = text.len(),
            language = language_code,
            speaker = %self.config.tts_speaker,
            "requesting speech synthesis"
        );

        let payload = json!({
            "text": text,
            "target_language_code": language_code,
            "speaker": self.config.tts_speaker,
            "model": self.config.tts_model,
            "speech_sample_rate": self.config.tts_sample_rate,
        });

        let response = self
            .client
            .post(format!(
                "{}/text-to-speech",
                self.config.api_base.trim_end_matches('/')
            ))
            .header("api-subscription-key", &self.config.api_key)
            .json(&payload)
            .send()
            .await?;

        let body = parse_json_body("text-to-speech", response).await?;

        let encoded_segments = body
            .get("audios")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                AppError::Provider("text-to-speech response missing audios field".to_string())
            })?;
        if encoded_segments.is_empty() {
            return Err(AppError::Provider(
                "text-to-speech returned zero audio segments".to_string(),
            ));
        }

        let mut segments = Vec::with_capacity(encoded_segments.len());
        for (index, encoded) in encoded_segments.iter().enumerate() {
            let encoded = encoded.as_str().ok_or_else(|| {
                AppError::Provider(format!("audio segment {} is not a string", index))
            })?;
            let bytes = BASE64_STANDARD.decode(encoded).map_err(|e| {
                AppError::Provider(format!("audio segment {} failed base64 decode: {}", index, e))
            })?;
            segments.push(bytes);
        }

        Ok(segments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    #[test]
    fn test_rejects_empty_api_base() {
        let mut config = AppConfig::default().providers;
        config.api_base = String::new();
        assert!(HttpSynthesisProvider::new(&config).is_err());
    }

    #[tokio::test]
    async fn test_rejects_blank_text() {
        let config = AppConfig::default().providers;
        let provider = HttpSynthesisProvider::new(&config).unwrap();
        assert!(provider.synthesize("   ", "en-IN").await.is_err());
    }
}
