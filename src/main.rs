//! # VoicePay Backend - Main Application Entry Point
//!
//! A voice-driven payment and expense assistant: the phone network webhooks
//! into `/incoming_call`, opens a bidirectional media stream against
//! `/ws/call`, and from then on every few seconds of caller speech runs
//! through transcription, reasoning (with optional financial tool calls) and
//! speech synthesis before streaming back out on the same call.
//!
//! ## Application Architecture:
//! - **config**: layered configuration (TOML file + environment variables)
//! - **state**: shared application state, metrics and the call registry
//! - **audit**: append-only trail of every turn's stages and artifacts
//! - **audio**: codec adapter, turn buffer and call session lifecycle
//! - **providers**: speech-to-text, chat completion, text-to-speech clients
//! - **tools**: the financial operations the reasoning stage may invoke
//! - **pipeline**: orchestrates one conversational turn end to end
//! - **websocket**: the stream session controller (one actor per call)
//! - **health/middleware/handlers**: the usual HTTP surface

mod audio;
mod audit;
mod config;
mod error;
mod handlers;
mod health;
mod middleware;
mod pipeline;
mod providers;
mod state;
mod tools;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer, middleware::Logger};
use anyhow::Result;
use config::AppConfig;
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Global shutdown signal, set by the signal handler task and polled by main.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[actix_web::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file (if it exists)
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting voicepay-backend v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);
    info!("Stream endpoint advertised as {}", config.server.public_stream_url);

    // The audit sink and conversation pipeline are built once and shared by
    // every call session
    let audit_sink = Arc::new(
        audit::FileAuditSink::new(&config.audit.log_dir)
            .map_err(|e| anyhow::anyhow!("audit sink init failed: {}", e))?,
    );
    let pipeline = pipeline::ConversationPipeline::from_config(&config, audit_sink.clone())
        .map_err(|e| anyhow::anyhow!("pipeline init failed: {}", e))?;
    let pipeline_data = web::Data::new(pipeline);

    let app_state = AppState::new(config.clone(), audit_sink);
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .app_data(pipeline_data.clone())
            .wrap(cors)
            .wrap(Logger::default())
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            // Telephony surface: call-setup webhook + media stream socket
            .route("/incoming_call", web::post().to(websocket::incoming_call))
            .route("/ws/call", web::get().to(websocket::call_stream))
            // Operational surface
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config)),
            )
            .route("/health", web::get().to(health::health_check))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    // Race the server against the shutdown signal
    tokio::select! {
        result = server_task => {
            match result {
                Ok(server_result) => {
                    if let Err(e) = server_result {
                        error!("Server error: {}", e);
                    }
                }
                Err(e) => {
                    error!("Server task error: {}", e);
                }
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Initialize the tracing (logging) system for the application.
///
/// Reads `RUST_LOG` when set; otherwise logs this crate at debug and
/// actix-web at info.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voicepay_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Listen for SIGTERM/SIGINT and flip the shutdown flag.
fn setup_signal_handlers() {
    tokio::spawn(async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
            .expect("Failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

/// Poll the shutdown flag without busy-waiting.
async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
