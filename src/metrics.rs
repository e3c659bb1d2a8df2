//! Prometheus metrics for the s3ep proxy.
//!
//! All metric types use atomics internally (no locks on the hot path). The
//! `Metrics` struct is `Clone`-cheap (Arc-based registry + Arc-based
//! collectors).

use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use prometheus::{
    Encoder, Gauge, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
    TEXT_FORMAT,
};
use std::sync::Arc;
use std::time::Instant;

use crate::api::handlers::AppState;

/// All Prometheus metrics for the s3ep proxy.
#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,

    // -- Process --
    pub process_start_time_seconds: Gauge,

    // -- HTTP Requests --
    pub http_requests_total: IntCounterVec,
    pub http_request_duration_seconds: HistogramVec,
    pub http_request_size_bytes: HistogramVec,
    pub http_response_size_bytes: HistogramVec,

    // -- Crypto Orchestrator --
    pub crypto_operations_total: IntCounterVec,
    pub crypto_integrity_failures_total: IntCounterVec,

    // -- Multipart sessions --
    pub multipart_sessions_active: Gauge,
    pub multipart_sessions_expired_total: IntCounterVec,

    // -- Auth --
    pub auth_attempts_total: IntCounterVec,
    pub auth_failures_total: IntCounterVec,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let process_start_time_seconds =
            Gauge::new("process_start_time_seconds", "Start time of the process").unwrap();
        registry
            .register(Box::new(process_start_time_seconds.clone()))
            .unwrap();

        #[cfg(target_os = "linux")]
        {
            let pc = prometheus::process_collector::ProcessCollector::for_self();
            let _ = registry.register(Box::new(pc));
        }

        let http_requests_total = IntCounterVec::new(
            Opts::new(
                "s3ep_http_requests_total",
                "Total HTTP requests by method, status, and operation",
            ),
            &["method", "status", "operation"],
        )
        .unwrap();
        registry
            .register(Box::new(http_requests_total.clone()))
            .unwrap();

        let body_size_buckets = prometheus::exponential_buckets(1024.0, 10.0, 6).unwrap();
        // [1KB, 10KB, 100KB, 1MB, 10MB, 100MB]

        let http_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "s3ep_http_request_duration_seconds",
                "HTTP request duration in seconds",
            ),
            &["method", "operation"],
        )
        .unwrap();
        registry
            .register(Box::new(http_request_duration_seconds.clone()))
            .unwrap();

        let http_request_size_bytes = HistogramVec::new(
            HistogramOpts::new(
                "s3ep_http_request_size_bytes",
                "HTTP request body size in bytes",
            )
            .buckets(body_size_buckets.clone()),
            &["method"],
        )
        .unwrap();
        registry
            .register(Box::new(http_request_size_bytes.clone()))
            .unwrap();

        let http_response_size_bytes = HistogramVec::new(
            HistogramOpts::new(
                "s3ep_http_response_size_bytes",
                "HTTP response body size in bytes",
            )
            .buckets(body_size_buckets),
            &["method"],
        )
        .unwrap();
        registry
            .register(Box::new(http_response_size_bytes.clone()))
            .unwrap();

        let crypto_operations_total = IntCounterVec::new(
            Opts::new(
                "s3ep_crypto_operations_total",
                "Envelope-encryption operations by algorithm and direction",
            ),
            &["algorithm", "direction"],
        )
        .unwrap();
        registry
            .register(Box::new(crypto_operations_total.clone()))
            .unwrap();

        let crypto_integrity_failures_total = IntCounterVec::new(
            Opts::new(
                "s3ep_crypto_integrity_failures_total",
                "GCM tag / chained-HMAC verification failures",
            ),
            &["algorithm"],
        )
        .unwrap();
        registry
            .register(Box::new(crypto_integrity_failures_total.clone()))
            .unwrap();

        let multipart_sessions_active = Gauge::new(
            "s3ep_multipart_sessions_active",
            "In-flight multipart crypto sessions (updated on scrape)",
        )
        .unwrap();
        registry
            .register(Box::new(multipart_sessions_active.clone()))
            .unwrap();

        let multipart_sessions_expired_total = IntCounterVec::new(
            Opts::new(
                "s3ep_multipart_sessions_expired_total",
                "Multipart sessions aborted by the idle sweeper",
            ),
            &["reason"],
        )
        .unwrap();
        registry
            .register(Box::new(multipart_sessions_expired_total.clone()))
            .unwrap();

        let auth_attempts_total = IntCounterVec::new(
            Opts::new("s3ep_auth_attempts_total", "Auth attempts by result"),
            &["result"],
        )
        .unwrap();
        registry
            .register(Box::new(auth_attempts_total.clone()))
            .unwrap();

        let auth_failures_total = IntCounterVec::new(
            Opts::new("s3ep_auth_failures_total", "Auth failures by reason"),
            &["reason"],
        )
        .unwrap();
        registry
            .register(Box::new(auth_failures_total.clone()))
            .unwrap();

        Metrics {
            registry,
            process_start_time_seconds,
            http_requests_total,
            http_request_duration_seconds,
            http_request_size_bytes,
            http_response_size_bytes,
            crypto_operations_total,
            crypto_integrity_failures_total,
            multipart_sessions_active,
            multipart_sessions_expired_total,
            auth_attempts_total,
            auth_failures_total,
        }
    }
}

/// Classify an S3 request into a bounded operation label.
pub fn classify_s3_operation(method: &str, path: &str) -> &'static str {
    match path {
        "/health" => return "health",
        "/metrics" => return "metrics",
        _ => {}
    }

    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    match (method, segments.len()) {
        ("GET", 0) => "list_buckets",
        ("HEAD", 0) => "head_root",
        ("GET", 1) => "list_objects",
        ("PUT", 1) => "create_bucket",
        ("DELETE", 1) => "delete_bucket",
        ("HEAD", 1) => "head_bucket",
        ("POST", 1) => "post_bucket",
        ("GET", _) => "get_object",
        ("PUT", _) => "put_object",
        ("DELETE", _) => "delete_object",
        ("HEAD", _) => "head_object",
        ("POST", _) => "post_object",
        _ => "unknown",
    }
}

/// Axum middleware that records HTTP request metrics.
pub async fn http_metrics_middleware(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let metrics = match &state.metrics {
        Some(m) => m,
        None => return next.run(request).await,
    };

    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let operation = classify_s3_operation(&method, &path);

    if let Some(cl) = request
        .headers()
        .get("content-length")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<f64>().ok())
    {
        metrics
            .http_request_size_bytes
            .with_label_values(&[&method])
            .observe(cl);
    }

    let start = Instant::now();
    let response = next.run(request).await;
    let duration = start.elapsed().as_secs_f64();

    let status = response.status().as_u16().to_string();

    metrics
        .http_requests_total
        .with_label_values(&[&method, &status, operation])
        .inc();
    metrics
        .http_request_duration_seconds
        .with_label_values(&[&method, operation])
        .observe(duration);

    if let Some(cl) = response
        .headers()
        .get("content-length")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<f64>().ok())
    {
        metrics
            .http_response_size_bytes
            .with_label_values(&[&method])
            .observe(cl);
    }

    response
}

/// Handler for GET /metrics — returns Prometheus text format.
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let metrics = match &state.metrics {
        Some(m) => m,
        None => {
            return (StatusCode::NOT_FOUND, "Metrics not enabled").into_response();
        }
    };

    let encoder = TextEncoder::new();
    let metric_families = metrics.registry.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode metrics: {e}"),
        )
            .into_response();
    }

    (StatusCode::OK, [("content-type", TEXT_FORMAT)], buffer).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_s3_operation() {
        assert_eq!(classify_s3_operation("GET", "/health"), "health");
        assert_eq!(classify_s3_operation("GET", "/metrics"), "metrics");
        assert_eq!(classify_s3_operation("GET", "/"), "list_buckets");
        assert_eq!(classify_s3_operation("HEAD", "/"), "head_root");
        assert_eq!(classify_s3_operation("GET", "/mybucket"), "list_objects");
        assert_eq!(classify_s3_operation("PUT", "/mybucket"), "create_bucket");
        assert_eq!(
            classify_s3_operation("DELETE", "/mybucket"),
            "delete_bucket"
        );
        assert_eq!(classify_s3_operation("HEAD", "/mybucket"), "head_bucket");
        assert_eq!(
            classify_s3_operation("GET", "/mybucket/mykey"),
            "get_object"
        );
        assert_eq!(
            classify_s3_operation("PUT", "/mybucket/mykey"),
            "put_object"
        );
        assert_eq!(
            classify_s3_operation("DELETE", "/mybucket/mykey"),
            "delete_object"
        );
        assert_eq!(
            classify_s3_operation("HEAD", "/mybucket/mykey"),
            "head_object"
        );
        assert_eq!(
            classify_s3_operation("POST", "/mybucket/mykey"),
            "post_object"
        );
        assert_eq!(
            classify_s3_operation("GET", "/mybucket/deep/nested/key"),
            "get_object"
        );
    }
}
