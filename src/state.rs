//! # Application State Management
//!
//! Shared state that every HTTP request handler and call session can reach.
//!
//! ## The Arc<RwLock<T>> Pattern:
//! - **Arc**: many handlers and websocket actors hold a reference at once
//! - **RwLock**: many readers or one writer at a time
//! - Reads clone the data out immediately so locks are never held across
//!   await points or response serialization.
//!
//! Besides configuration and metrics, the state carries the two process-wide
//! handles the call loop needs: the call registry (which sessions are live)
//! and the audit sink (the only shared mutable resource sessions write to).

use crate::audio::session::CallRegistry;
use crate::audit::AuditSink;
use crate::config::AppConfig;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// The main application state shared across all handlers and sessions.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// Performance metrics (constantly being updated by requests and turns)
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// Registry of live call sessions keyed by stream SID
    pub calls: Arc<CallRegistry>,

    /// Append-only audit sink shared by every session
    pub audit: Arc<dyn AuditSink>,

    /// When the server started
    pub start_time: Instant,
}

/// Metrics collected across all HTTP requests and call turns.
#[derive(Debug, Default)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Total number of request errors since server start
    pub error_count: u64,

    /// Current number of active call sessions
    pub active_calls: u32,

    /// Audio turns that completed with an outbound media event
    pub turns_processed: u64,

    /// Audio turns that ended silently (codec/provider failure or empty result)
    pub turns_failed: u64,

    /// Detailed metrics per API endpoint, keyed by "METHOD /path"
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Performance metrics for a specific API endpoint.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    /// Create a new AppState with the given configuration and audit sink.
    pub fn new(config: AppConfig, audit: Arc<dyn AuditSink>) -> Self {
        let max_calls = config.performance.max_concurrent_calls;
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            calls: Arc::new(CallRegistry::new(max_calls)),
            audit,
            start_time: Instant::now(),
        }
    }

    /// Get a copy of the current configuration.
    ///
    /// Cloning releases the read lock immediately so other threads are not
    /// blocked; AppConfig is cheap to clone.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap().clone()
    }

    /// Replace the configuration after validating it.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        match new_config.validate() {
            Ok(_) => {
                *self.config.write().unwrap() = new_config;
                Ok(())
            }
            Err(e) => Err(e.to_string()),
        }
    }

    /// Increment the total request counter (called by middleware for every request).
    pub fn increment_request_count(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.request_count += 1;
    }

    /// Increment the total error counter (called when any request fails).
    pub fn increment_error_count(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.error_count += 1;
    }

    /// Record detailed metrics for a specific endpoint.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap();

        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();
        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// A call session went live (transport sent its start event).
    pub fn increment_active_calls(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.active_calls += 1;
    }

    /// A call session ended. Guarded against underflow so an unmatched
    /// decrement can never panic the metrics path.
    pub fn decrement_active_calls(&self) {
        let mut metrics = self.metrics.write().unwrap();
        if metrics.active_calls > 0 {
            metrics.active_calls -= 1;
        }
    }

    /// Record the outcome of one audio turn.
    pub fn record_turn(&self, emitted_audio: bool) {
        let mut metrics = self.metrics.write().unwrap();
        if emitted_audio {
            metrics.turns_processed += 1;
        } else {
            metrics.turns_failed += 1;
        }
    }

    /// Get a snapshot of current metrics (used by the health endpoints).
    ///
    /// Clones the data so no lock is held while the HTTP response is built.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        let metrics = self.metrics.read().unwrap();
        AppMetrics {
            request_count: metrics.request_count,
            error_count: metrics.error_count,
            active_calls: metrics.active_calls,
            turns_processed: metrics.turns_processed,
            turns_failed: metrics.turns_failed,
            endpoint_metrics: metrics.endpoint_metrics.clone(),
        }
    }

    /// Get server uptime in seconds.
    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    /// Average response time for this endpoint in milliseconds.
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Error rate for this endpoint (0.0 to 1.0).
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;

    fn test_state() -> AppState {
        AppState::new(AppConfig::default(), Arc::new(MemoryAuditSink::new()))
    }

    #[test]
    fn test_turn_counters() {
        let state = test_state();
        state.record_turn(true);
        state.record_turn(false);
        state.record_turn(false);

        let snapshot = state.get_metrics_snapshot();
        assert_eq!(snapshot.turns_processed, 1);
        assert_eq!(snapshot.turns_failed, 2);
    }

    #[test]
    fn test_active_calls_never_underflow() {
        let state = test_state();
        state.decrement_active_calls();
        assert_eq!(state.get_metrics_snapshot().active_calls, 0);

        state.increment_active_calls();
        state.increment_active_calls();
        state.decrement_active_calls();
        assert_eq!(state.get_metrics_snapshot().active_calls, 1);
    }

    #[test]
    fn test_endpoint_metric_rates() {
        let state = test_state();
        state.record_endpoint_request("POST /incoming_call", 10, false);
        state.record_endpoint_request("POST /incoming_call", 30, true);

        let snapshot = state.get_metrics_snapshot();
        let metric = &snapshot.endpoint_metrics["POST /incoming_call"];
        assert_eq!(metric.request_count, 2);
        assert_eq!(metric.average_duration_ms(), 20.0);
        assert_eq!(metric.error_rate(), 0.5);
    }

    #[test]
    fn test_update_config_rejects_invalid() {
        let state = test_state();
        let mut bad = AppConfig::default();
        bad.server.port = 0;
        assert!(state.update_config(bad).is_err());
        // Original config untouched
        assert_eq!(state.get_config().server.port, 8080);
    }
}
