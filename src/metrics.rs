//! Ambient Prometheus metrics endpoint: a live view of the request/error
//! counters alongside the `MetricSnapshot` stream, for operators who want
//! to point an existing Prometheus scraper at a running load test.
//!
//! A registry/handler/server trio, trimmed to the request-level metrics
//! the core still produces once per-step/per-assertion counters fall
//! outside scope.

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use prometheus::{Encoder, Gauge, Histogram, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use std::env;
use std::sync::{Arc, Mutex};
use tracing::{error, info};

lazy_static::lazy_static! {
    pub static ref METRIC_NAMESPACE: String =
        env::var("METRIC_NAMESPACE").unwrap_or_else(|_| "loadforge".to_string());

    pub static ref REQUEST_TOTAL: IntCounter =
        IntCounter::with_opts(
            Opts::new("requests_total", "Total number of HTTP requests made")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref REQUEST_STATUS_CODES: IntCounterVec =
        IntCounterVec::new(
            Opts::new("requests_status_codes_total", "Number of HTTP requests by status code")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["status_code"]
        ).unwrap();

    pub static ref REQUEST_ERRORS_TOTAL: IntCounterVec =
        IntCounterVec::new(
            Opts::new("requests_errors_total", "Number of failed requests by error category")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["category"]
        ).unwrap();

    pub static ref CONCURRENT_REQUESTS: Gauge =
        Gauge::with_opts(
            Opts::new("concurrent_requests", "Number of HTTP requests currently in flight")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref ACTIVE_VIRTUAL_USERS: Gauge =
        Gauge::with_opts(
            Opts::new("active_virtual_users", "Observed active virtual users, summed over workers")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref REQUEST_DURATION_SECONDS: Histogram =
        Histogram::with_opts(
            prometheus::HistogramOpts::new(
                "request_duration_seconds",
                "HTTP request latencies in seconds."
            ).namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref RING_BUFFER_DROPPED_TOTAL: IntCounter =
        IntCounter::with_opts(
            Opts::new("ring_buffer_dropped_total", "Request records dropped to ring-buffer overflow")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();
}

/// Registers all metrics with the default Prometheus registry.
pub fn register_metrics() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    prometheus::default_registry().register(Box::new(REQUEST_TOTAL.clone()))?;
    prometheus::default_registry().register(Box::new(REQUEST_STATUS_CODES.clone()))?;
    prometheus::default_registry().register(Box::new(REQUEST_ERRORS_TOTAL.clone()))?;
    prometheus::default_registry().register(Box::new(CONCURRENT_REQUESTS.clone()))?;
    prometheus::default_registry().register(Box::new(ACTIVE_VIRTUAL_USERS.clone()))?;
    prometheus::default_registry().register(Box::new(REQUEST_DURATION_SECONDS.clone()))?;
    prometheus::default_registry().register(Box::new(RING_BUFFER_DROPPED_TOTAL.clone()))?;
    Ok(())
}

/// Feeds a single aggregator tick into the Prometheus gauges/counters, so
/// the `/metrics` endpoint reflects the same numbers as the latest
/// `MetricSnapshot` (minus the per-endpoint breakdown, which Prometheus
/// label cardinality makes a poor fit for an unbounded endpoint set).
pub fn observe_snapshot(snapshot: &crate::metrics_model::MetricSnapshot) {
    REQUEST_TOTAL.reset();
    REQUEST_TOTAL.inc_by(snapshot.requests_this_tick);
    ACTIVE_VIRTUAL_USERS.set(snapshot.active_users as f64);
    RING_BUFFER_DROPPED_TOTAL.inc_by(snapshot.dropped_records);

    for (status, count) in &snapshot.errors_by_status {
        REQUEST_STATUS_CODES.with_label_values(&[&status.to_string()]).inc_by(*count);
    }
    for (category, count) in &snapshot.errors_by_category {
        REQUEST_ERRORS_TOTAL.with_label_values(&[category]).inc_by(*count);
    }
    if let Some(avg_ms) = snapshot.latency_avg_ms {
        REQUEST_DURATION_SECONDS.observe(avg_ms / 1000.0);
    }
}

/// HTTP handler for the Prometheus metrics endpoint.
pub async fn metrics_handler(
    _req: Request<Body>,
    registry: Arc<Mutex<Registry>>,
) -> Result<Response<Body>, hyper::Error> {
    let encoder = TextEncoder::new();
    let metric_families = registry.lock().unwrap().gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();

    let response = Response::builder()
        .status(200)
        .header("Content-Type", encoder.format_type())
        .body(Body::from(buffer))
        .unwrap();

    Ok(response)
}

/// Starts the Prometheus metrics HTTP server.
pub async fn start_metrics_server(port: u16, registry: Arc<Mutex<Registry>>) {
    let addr = ([0, 0, 0, 0], port).into();

    let make_svc = make_service_fn(move |_conn| {
        let registry_clone = registry.clone();
        async move {
            Ok::<_, hyper::Error>(service_fn(move |req| {
                let registry_clone_inner = registry_clone.clone();
                async move { metrics_handler(req, registry_clone_inner).await }
            }))
        }
    });

    let server = Server::bind(&addr).serve(make_svc);
    info!(port = port, addr = %addr, "Metrics server listening");

    if let Err(e) = server.await {
        error!(error = %e, "Metrics server error");
    }
}

/// Gathers and encodes metrics as a string for final output.
pub fn gather_metrics_string(registry: &Arc<Mutex<Registry>>) -> String {
    let encoder = TextEncoder::new();
    let metric_families = registry.lock().unwrap().gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap_or_else(|e| {
        eprintln!("Error encoding metrics to UTF-8: {}", e);
        String::from("# ERROR ENCODING METRICS TO UTF-8")
    })
}
