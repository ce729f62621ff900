//! # Application State
//!
//! Shared with every HTTP handler through `web::Data<AppState>`. The gateway and
//! the connection hub are already thread-safe, so they are shared as plain `Arc`s.
//! HTTP request metrics are the only state mutated from request handlers and sit
//! behind a `RwLock`.

use crate::config::AppConfig;
use crate::relay::Gateway;
use crate::websocket::ConnectionHub;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    /// Loaded once at startup, read-only afterwards.
    pub config: Arc<AppConfig>,
    pub gateway: Arc<Gateway>,
    pub hub: Arc<ConnectionHub>,
    pub http: Arc<RwLock<HttpMetrics>>,
    pub start_time: Instant,
}

/// HTTP request counters maintained by the metrics middleware.
#[derive(Debug, Default, Clone)]
pub struct HttpMetrics {
    pub request_count: u64,
    pub error_count: u64,
    /// Key: `"<METHOD> <path>"`.
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    pub fn new(config: AppConfig, gateway: Arc<Gateway>, hub: Arc<ConnectionHub>) -> Self {
        Self {
            config: Arc::new(config),
            gateway,
            hub,
            http: Arc::new(RwLock::new(HttpMetrics::default())),
            start_time: Instant::now(),
        }
    }

    /// Record one finished HTTP request.
    pub fn record_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.http.write().unwrap_or_else(PoisonError::into_inner);
        metrics.request_count += 1;
        if is_error {
            metrics.error_count += 1;
        }

        let endpoint_metric = metrics
            .endpoint_metrics
            .entry(endpoint.to_string())
            .or_default();
        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    pub fn http_snapshot(&self) -> HttpMetrics {
        self.http
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::audio::AudioFormat;
    use crate::recognition::SharedModel;
    use crate::relay::GatewayOptions;
    use crate::testing::ScriptedModel;

    pub(crate) fn test_state() -> AppState {
        let hub = Arc::new(ConnectionHub::new());
        let gateway = Gateway::new(
            SharedModel::new(Arc::new(ScriptedModel::default())),
            hub.clone(),
            GatewayOptions {
                format: AudioFormat::default(),
                capture_dir: None,
                workers: 1,
            },
        )
        .unwrap();
        AppState::new(AppConfig::default(), Arc::new(gateway), hub)
    }

    #[test]
    fn test_record_request_tracks_endpoint_and_errors() {
        let state = test_state();
        state.record_request("GET /health", 4, false);
        state.record_request("GET /health", 6, false);
        state.record_request("GET /nope", 1, true);

        let metrics = state.http_snapshot();
        assert_eq!(metrics.request_count, 3);
        assert_eq!(metrics.error_count, 1);

        let health = &metrics.endpoint_metrics["GET /health"];
        assert_eq!(health.average_duration_ms(), 5.0);
        assert_eq!(health.error_rate(), 0.0);
        assert_eq!(metrics.endpoint_metrics["GET /nope"].error_rate(), 1.0);
    }

    #[test]
    fn test_empty_endpoint_metric_rates_are_zero() {
        let metric = EndpointMetric::default();
        assert_eq!(metric.average_duration_ms(), 0.0);
        assert_eq!(metric.error_rate(), 0.0);
    }
}
