//! # Error Handling
//!
//! This module defines the application error taxonomy and how errors are
//! converted to HTTP responses.
//!
//! ## Error Categories:
//! - **Codec**: audio container framing or conversion failed
//! - **UnsupportedFormat**: synthesis audio arrived in a shape we refuse to
//!   resample (wrong sample width or channel count)
//! - **Provider**: a transcription/reasoning/synthesis call failed or timed out
//! - **Transport**: the media stream connection broke
//! - **Internal/Config/BadRequest/Validation**: the usual HTTP-surface errors
//!
//! ## Propagation policy:
//! `Codec`, `UnsupportedFormat` and `Provider` abort only the current audio
//! turn - the session keeps running and nothing is sent back for that turn.
//! Tool failures never reach this enum at all: they are captured as payloads
//! in `tools::ToolError` and narrated back to the caller. `Transport`
//! terminates the call session. Nothing is retried.

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Custom error types for the application.
///
/// Each variant holds a human-readable message. HTTP handlers return these
/// directly; the audio pipeline logs them and skips the turn.
#[derive(Debug)]
pub enum AppError {
    /// Audio container could not be constructed or parsed
    Codec(String),

    /// Synthesis audio has a sample width or channel count we do not resample
    UnsupportedFormat(String),

    /// A transcription, reasoning or synthesis provider call failed
    Provider(String),

    /// The media stream connection failed or was torn down unexpectedly
    Transport(String),

    /// Internal server errors
    Internal(String),

    /// Client sent invalid or malformed data
    BadRequest(String),

    /// Configuration file or environment variable problems
    Config(String),

    /// User input failed validation rules
    Validation(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Codec(msg) => write!(f, "Codec error: {}", msg),
            AppError::UnsupportedFormat(msg) => write!(f, "Unsupported audio format: {}", msg),
            AppError::Provider(msg) => write!(f, "Provider error: {}", msg),
            AppError::Transport(msg) => write!(f, "Transport error: {}", msg),
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::Config(msg) => write!(f, "Configuration error: {}", msg),
            AppError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

/// Converts errors into HTTP responses for the REST surface.
///
/// ## Status Code Mapping:
/// - Codec/UnsupportedFormat/Transport/Internal/Config → 500
/// - Provider → 502 (the upstream service failed, not us)
/// - BadRequest/Validation → 400
///
/// All errors return JSON with a consistent structure:
/// ```json
/// {
///   "error": {
///     "type": "provider_error",
///     "message": "speech-to-text call failed: status=503",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = match self {
            AppError::Codec(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "codec_error",
                msg.clone(),
            ),
            AppError::UnsupportedFormat(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "unsupported_format",
                msg.clone(),
            ),
            AppError::Provider(msg) => (
                actix_web::http::StatusCode::BAD_GATEWAY,
                "provider_error",
                msg.clone(),
            ),
            AppError::Transport(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "transport_error",
                msg.clone(),
            ),
            AppError::Internal(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                msg.clone(),
            ),
            AppError::BadRequest(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "bad_request",
                msg.clone(),
            ),
            AppError::Config(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "config_error",
                msg.clone(),
            ),
            AppError::Validation(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "validation_error",
                msg.clone(),
            ),
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

/// Automatic conversion from anyhow::Error to AppError.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// JSON parsing errors are almost always the client's fault, so they map to
/// BadRequest rather than an internal error.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

/// Configuration loading failures (missing files, invalid syntax, bad types).
impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

/// HTTP client failures from provider and financial-service calls.
///
/// Timeouts are called out explicitly in the message since they are the most
/// common degradation on a live call.
impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AppError::Provider(format!("request timed out: {}", err))
        } else {
            AppError::Provider(format!("request failed: {}", err))
        }
    }
}

/// Shorthand for `Result<T, AppError>`.
pub type AppResult<T> = Result<T, AppError>;
