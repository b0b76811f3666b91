//! # Configuration Management
//!
//! This module handles loading and managing application configuration from
//! multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix, plus a few well-known names
//!   like SARVAM_API_KEY used by deployment setups)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Well-known environment variables (SARVAM_API_KEY, HOST, PORT, ...)
//! 2. Environment variables with APP_ prefix
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! Provider credentials and external service URLs are only ever read from
//! the environment - they have empty defaults and are never hardcoded.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Main application configuration that contains all settings.
///
/// Breaking configuration into logical groups (server, providers, services,
/// audio, performance, audit) keeps each concern easy to find as the
/// application grows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub providers: ProviderConfig,
    pub services: ServicesConfig,
    pub audio: AudioConfig,
    pub performance: PerformanceConfig,
    pub audit: AuditConfig,
}

/// Server-specific configuration settings.
///
/// ## Fields:
/// - `host`/`port`: bind address for the HTTP server
/// - `public_stream_url`: the externally reachable `wss://` URL of the
///   `/ws/call` endpoint. The call-setup webhook hands this URL to the
///   telephony platform, so in local development it must point at a tunnel
///   (e.g. an ngrok forwarding address), not at localhost.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub public_stream_url: String,
}

/// Speech/reasoning provider configuration.
///
/// The same provider account serves transcription, chat completion and
/// speech synthesis; `api_key` comes from the SARVAM_API_KEY environment
/// variable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub api_base: String,
    pub api_key: String,
    /// Speech-to-text model identifier
    pub stt_model: String,
    /// Token budget for each chat completion - answers are spoken, keep them short
    pub chat_max_tokens: u32,
    pub chat_temperature: f32,
    /// Text-to-speech model identifier
    pub tts_model: String,
    /// Voice to synthesize with (must be compatible with `tts_model`)
    pub tts_speaker: String,
    /// Sample rate requested from synthesis, in Hz. Telephony transports
    /// carry 8kHz audio, so request 8kHz directly and skip resampling.
    pub tts_sample_rate: u32,
    /// Per-request timeout applied by the HTTP client, in milliseconds
    pub timeout_ms: u64,
}

/// External financial service endpoints.
///
/// The ledger service answers identity and expense queries; the payment
/// service mints payment links. Both are the source of truth - nothing from
/// them is cached locally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServicesConfig {
    pub ledger_base_url: String,
    pub ledger_api_key: String,
    pub payment_base_url: String,
}

/// Audio turn framing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Bytes of companded audio to accumulate before dispatching a turn.
    /// At 8-bit/8kHz mono, 8000 bytes is one second; the 24000 default is
    /// roughly three seconds of caller speech.
    pub turn_threshold_bytes: usize,
    /// Telephony stream sample rate in Hz
    pub sample_rate: u32,
}

/// Performance tuning configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    /// Maximum number of concurrent call sessions to handle simultaneously
    pub max_concurrent_calls: usize,
}

/// Audit trail configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Directory receiving the append-only audit log and per-turn audio artifacts
    pub log_dir: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
                // Placeholder - must be overridden with the tunnel/deployment URL
                public_stream_url: "wss://localhost:8080/ws/call".to_string(),
            },
            providers: ProviderConfig {
                api_base: "https://api.sarvam.ai".to_string(),
                api_key: String::new(),
                stt_model: "saaras:v2.5".to_string(),
                chat_max_tokens: 100,
                chat_temperature: 0.7,
                tts_model: "bulbul:v2".to_string(),
                tts_speaker: "anushka".to_string(),
                tts_sample_rate: 8000,
                timeout_ms: 15_000,
            },
            services: ServicesConfig {
                ledger_base_url: String::new(),
                ledger_api_key: String::new(),
                payment_base_url: String::new(),
            },
            audio: AudioConfig {
                turn_threshold_bytes: 24_000,
                sample_rate: 8000,
            },
            performance: PerformanceConfig {
                max_concurrent_calls: 10,
            },
            audit: AuditConfig {
                log_dir: "call_audit".to_string(),
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with values from config.toml (if it exists)
    /// 3. Override with environment variables prefixed with APP_
    /// 4. Handle well-known environment variables (HOST, PORT, credential
    ///    and service-URL names) that don't follow the APP_ convention
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            // Example: APP_SERVER_HOST becomes server.host in the config
            .add_source(config::Environment::with_prefix("APP").separator("_"));

        // Deployment platforms commonly inject these without the APP_ prefix
        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }
        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }
        if let Ok(url) = env::var("PUBLIC_STREAM_URL") {
            settings = settings.set_override("server.public_stream_url", url)?;
        }

        // Credentials and service endpoints are environment-only
        if let Ok(key) = env::var("SARVAM_API_KEY") {
            settings = settings.set_override("providers.api_key", key)?;
        }
        if let Ok(url) = env::var("LEDGER_BASE_URL") {
            settings = settings.set_override("services.ledger_base_url", url)?;
        }
        if let Ok(key) = env::var("LEDGER_API_KEY") {
            settings = settings.set_override("services.ledger_api_key", key)?;
        }
        if let Ok(url) = env::var("PAYMENT_BASE_URL") {
            settings = settings.set_override("services.payment_base_url", url)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// Catching configuration errors at startup prevents runtime failures
    /// mid-call and produces clear messages about what is wrong.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.audio.turn_threshold_bytes == 0 {
            return Err(anyhow::anyhow!("Turn threshold must be greater than 0 bytes"));
        }

        if self.performance.max_concurrent_calls == 0 {
            return Err(anyhow::anyhow!("Max concurrent calls must be greater than 0"));
        }

        if !(0.0..=2.0).contains(&self.providers.chat_temperature) {
            return Err(anyhow::anyhow!(
                "Chat temperature must be between 0.0 and 2.0, got {}",
                self.providers.chat_temperature
            ));
        }

        if self.audit.log_dir.trim().is_empty() {
            return Err(anyhow::anyhow!("Audit log directory cannot be empty"));
        }

        Ok(())
    }

    /// Update configuration from a JSON string (used for runtime config updates).
    ///
    /// Only the fields present in the JSON are changed, so a client can send
    /// just `{"audio": {"turn_threshold_bytes": 16000}}` to tune turn length
    /// without touching anything else. Credentials are deliberately not
    /// updatable through this path.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(server) = partial_config.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                self.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                self.server.port = port as u16;
            }
            if let Some(url) = server.get("public_stream_url").and_then(|v| v.as_str()) {
                self.server.public_stream_url = url.to_string();
            }
        }

        if let Some(providers) = partial_config.get("providers") {
            if let Some(model) = providers.get("stt_model").and_then(|v| v.as_str()) {
                self.providers.stt_model = model.to_string();
            }
            if let Some(model) = providers.get("tts_model").and_then(|v| v.as_str()) {
                self.providers.tts_model = model.to_string();
            }
            if let Some(speaker) = providers.get("tts_speaker").and_then(|v| v.as_str()) {
                self.providers.tts_speaker = speaker.to_string();
            }
            if let Some(tokens) = providers.get("chat_max_tokens").and_then(|v| v.as_u64()) {
                self.providers.chat_max_tokens = tokens as u32;
            }
            if let Some(temp) = providers.get("chat_temperature").and_then(|v| v.as_f64()) {
                self.providers.chat_temperature = temp as f32;
            }
        }

        if let Some(audio) = partial_config.get("audio") {
            if let Some(threshold) = audio.get("turn_threshold_bytes").and_then(|v| v.as_u64()) {
                self.audio.turn_threshold_bytes = threshold as usize;
            }
        }

        if let Some(performance) = partial_config.get("performance") {
            if let Some(calls) = performance.get("max_concurrent_calls").and_then(|v| v.as_u64()) {
                self.performance.max_concurrent_calls = calls as usize;
            }
        }

        self.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The default configuration must be valid and carry the reference turn
    /// threshold of ~3 seconds of telephony audio.
    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.audio.turn_threshold_bytes, 24_000);
        assert_eq!(config.audio.sample_rate, 8000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.turn_threshold_bytes = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.providers.chat_temperature = 5.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"audio": {"turn_threshold_bytes": 16000}, "providers": {"tts_speaker": "abhilash"}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.audio.turn_threshold_bytes, 16_000);
        assert_eq!(config.providers.tts_speaker, "abhilash");
        // Untouched fields keep their values
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn test_config_update_rejects_invalid_values() {
        let mut config = AppConfig::default();
        let json = r#"{"performance": {"max_concurrent_calls": 0}}"#;
        assert!(config.update_from_json(json).is_err());
    }
}
