//! Runtime configuration endpoints.
//!
//! GET returns the active configuration with credentials redacted; PUT
//! applies a partial JSON update (validated before it takes effect).

use crate::{config::AppConfig, error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Serialize the configuration for clients, leaving credentials out.
fn redacted_config_json(config: &AppConfig) -> serde_json::Value {
    json!({
        "server": {
            "host": config.server.host,
            "port": config.server.port,
            "public_stream_url": config.server.public_stream_url
        },
        "providers": {
            "api_base": config.providers.api_base,
            "api_key_set": !config.providers.api_key.is_empty(),
            "stt_model": config.providers.stt_model,
            "chat_max_tokens": config.providers.chat_max_tokens,
            "chat_temperature": config.providers.chat_temperature,
            "tts_model": config.providers.tts_model,
            "tts_speaker": config.providers.tts_speaker,
            "tts_sample_rate": config.providers.tts_sample_rate,
            "timeout_ms": config.providers.timeout_ms
        },
        "services": {
            "ledger_base_url": config.services.ledger_base_url,
            "ledger_api_key_set": !config.services.ledger_api_key.is_empty(),
            "payment_base_url": config.services.payment_base_url
        },
        "audio": {
            "turn_threshold_bytes": config.audio.turn_threshold_bytes,
            "sample_rate": config.audio.sample_rate
        },
        "performance": {
            "max_concurrent_calls": config.performance.max_concurrent_calls
        },
        "audit": {
            "log_dir": config.audit.log_dir
        }
    })
}

pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": redacted_config_json(&config)
    })))
}

pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> Result<HttpResponse, AppError> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut current_config = state.get_config();
    current_config.update_from_json(&json_str).map_err(|e| AppError::Validation(e.to_string()))?;

    state
        .update_config(current_config.clone())
        .map_err(AppError::Validation)?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": redacted_config_json(&current_config)
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redaction_hides_credentials() {
        let mut config = AppConfig::default();
        config.providers.api_key = "secret-key".to_string();
        config.services.ledger_api_key = "other-secret".to_string();

        let rendered = redacted_config_json(&config).to_string();
        assert!(!rendered.contains("secret-key"));
        assert!(!rendered.contains("other-secret"));
        assert!(rendered.contains("\"api_key_set\":true"));
    }
}
