//! HTTP client construction: a scenario task performs HTTP requests via an
//! injected client. Builds one `reqwest::Client` per worker process, shared
//! across all of that worker's virtual users, and wraps it in `LoadClient`:
//! pooled, per-request timeout, and an `on_request_complete(RequestMetric)`
//! callback invoked exactly once per attempt.

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tokio::sync::mpsc;
use tracing::trace;

use crate::connection_pool::{PoolConfig, GLOBAL_POOL_STATS};
use crate::errors::{CoreError, ErrorCategory};
use crate::metrics_model::{fnv1a_hash, EndpointLabel, Method, RequestMetric};
use crate::utils::parse_headers_with_escapes;

/// Configuration for building the HTTP client.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub request_timeout: Option<Duration>,
    pub custom_headers: Option<String>,
    pub pool_config: Option<PoolConfig>,
}

/// Result of building the client; retains the parsed headers for logging.
pub struct ClientBuildResult {
    pub client: reqwest::Client,
    pub parsed_headers: HeaderMap,
}

/// Builds a `reqwest::Client` configured with default headers, a connection
/// pool, and a request timeout.
pub fn build_client(config: &ClientConfig) -> Result<ClientBuildResult, CoreError> {
    let mut client_builder = reqwest::Client::builder();

    let parsed_headers = configure_custom_headers(config.custom_headers.as_deref())?;
    if !parsed_headers.is_empty() {
        client_builder = client_builder.default_headers(parsed_headers.clone());
    }

    let pool_config = config.pool_config.clone().unwrap_or_default();
    client_builder = pool_config.apply_to_builder(client_builder);

    if let Some(timeout) = config.request_timeout {
        client_builder = client_builder.timeout(timeout);
    }

    let client = client_builder
        .build()
        .map_err(|e| CoreError::configuration(format!("failed to build HTTP client: {e}")))?;

    Ok(ClientBuildResult {
        client,
        parsed_headers,
    })
}

fn configure_custom_headers(custom_headers_str: Option<&str>) -> Result<HeaderMap, CoreError> {
    let mut parsed_headers = HeaderMap::new();

    let headers_str = match custom_headers_str {
        Some(s) if !s.is_empty() => s,
        _ => return Ok(parsed_headers),
    };

    for header_pair_str in parse_headers_with_escapes(headers_str) {
        let header_pair_str = header_pair_str.trim();
        if header_pair_str.is_empty() {
            continue;
        }

        let parts: Vec<&str> = header_pair_str.splitn(2, ':').collect();
        if parts.len() != 2 {
            return Err(CoreError::configuration(format!(
                "invalid header format '{header_pair_str}', expected 'Name:Value'"
            )));
        }

        let name_str = parts[0].trim();
        let value_str = parts[1].trim();
        if name_str.is_empty() {
            return Err(CoreError::configuration(format!(
                "header name cannot be empty in '{header_pair_str}'"
            )));
        }

        let unescaped_value = value_str.replace("\\,", ",");
        let header_name = HeaderName::from_str(name_str)
            .map_err(|e| CoreError::configuration(format!("invalid header name '{name_str}': {e}")))?;
        let header_value = HeaderValue::from_str(&unescaped_value)
            .map_err(|e| CoreError::configuration(format!("invalid header value for '{name_str}': {e}")))?;

        parsed_headers.insert(header_name, header_value);
    }

    Ok(parsed_headers)
}

/// Sink for completed requests. Called exactly once per attempt, success or
/// failure, with the resulting `RequestMetric`.
pub type MetricSink = Arc<dyn Fn(RequestMetric) + Send + Sync>;

/// The HTTP client capability a scenario task is invoked with. Cheaply
/// `Clone`-able — every clone shares the same pooled `reqwest::Client` and
/// metric sink.
#[derive(Clone)]
pub struct LoadClient {
    http: reqwest::Client,
    base_url: String,
    worker_id: u8,
    on_complete: MetricSink,
    label_tx: mpsc::Sender<EndpointLabel>,
    seen_labels: Arc<Mutex<HashSet<u64>>>,
}

impl LoadClient {
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        worker_id: u8,
        on_complete: MetricSink,
        label_tx: mpsc::Sender<EndpointLabel>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            worker_id,
            on_complete,
            label_tx,
            seen_labels: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Lazily registers `name` the first time it's seen by this client,
    /// writing a label record to the one-shot channel. Best-effort: a full
    /// channel drops the registration and the aggregator falls back to
    /// displaying the bare hash.
    fn maybe_register_label(&self, name: &str, method: Method) {
        let hash = fnv1a_hash(name);
        let mut seen = self.seen_labels.lock().unwrap();
        if seen.insert(hash) {
            let _ = self.label_tx.try_send(EndpointLabel {
                hash,
                name: name.to_string(),
                method,
            });
        }
    }

    pub async fn get(&self, path: &str, name: &str) -> reqwest::Result<reqwest::Response> {
        self.execute(Method::Get, path, name, None).await
    }

    pub async fn post(&self, path: &str, name: &str, body: impl Into<reqwest::Body>) -> reqwest::Result<reqwest::Response> {
        self.execute(Method::Post, path, name, Some(body.into())).await
    }

    pub async fn put(&self, path: &str, name: &str, body: impl Into<reqwest::Body>) -> reqwest::Result<reqwest::Response> {
        self.execute(Method::Put, path, name, Some(body.into())).await
    }

    pub async fn patch(&self, path: &str, name: &str, body: impl Into<reqwest::Body>) -> reqwest::Result<reqwest::Response> {
        self.execute(Method::Patch, path, name, Some(body.into())).await
    }

    pub async fn delete(&self, path: &str, name: &str) -> reqwest::Result<reqwest::Response> {
        self.execute(Method::Delete, path, name, None).await
    }

    async fn execute(
        &self,
        method: Method,
        path: &str,
        name: &str,
        body: Option<reqwest::Body>,
    ) -> reqwest::Result<reqwest::Response> {
        self.maybe_register_label(name, method);

        let url = format!("{}{}", self.base_url, path);
        let mut request = self.http.request(to_reqwest_method(method), &url);
        if let Some(body) = body {
            request = request.body(body);
        }

        let started = Instant::now();
        let result = request.send().await;
        let latency_ms = started.elapsed().as_secs_f32() * 1000.0;
        let timestamp = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();

        let metric = match &result {
            Ok(response) => RequestMetric {
                timestamp,
                name_hash: fnv1a_hash(name),
                method,
                status_code: response.status().as_u16(),
                latency_ms,
                content_length: response.content_length().unwrap_or(0) as u32,
                worker_id: self.worker_id,
                error_category: ErrorCategory::from_status_code(response.status().as_u16()),
            },
            Err(error) => RequestMetric {
                timestamp,
                name_hash: fnv1a_hash(name),
                method,
                status_code: 0,
                latency_ms,
                content_length: 0,
                worker_id: self.worker_id,
                error_category: ErrorCategory::from_reqwest_error(error),
            },
        };

        trace!(name, status = metric.status_code, latency_ms, "request completed");
        GLOBAL_POOL_STATS.record_request(latency_ms.round() as u64);
        (self.on_complete)(metric);
        result
    }
}

fn to_reqwest_method(method: Method) -> reqwest::Method {
    match method {
        Method::Get => reqwest::Method::GET,
        Method::Post => reqwest::Method::POST,
        Method::Put => reqwest::Method::PUT,
        Method::Patch => reqwest::Method::PATCH,
        Method::Delete => reqwest::Method::DELETE,
        Method::Head => reqwest::Method::HEAD,
        Method::Options => reqwest::Method::OPTIONS,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_client_with_no_custom_config() {
        let result = build_client(&ClientConfig::default());
        assert!(result.is_ok());
    }

    #[test]
    fn parses_custom_headers() {
        let config = ClientConfig {
            custom_headers: Some("X-Api-Key:secret,X-Trace:abc".to_string()),
            ..Default::default()
        };
        let result = build_client(&config).unwrap();
        assert_eq!(result.parsed_headers.get("x-api-key").unwrap(), "secret");
        assert_eq!(result.parsed_headers.get("x-trace").unwrap(), "abc");
    }

    #[test]
    fn rejects_malformed_header() {
        let config = ClientConfig {
            custom_headers: Some("not-a-header".to_string()),
            ..Default::default()
        };
        assert!(build_client(&config).is_err());
    }

    #[test]
    fn applies_request_timeout() {
        let config = ClientConfig {
            request_timeout: Some(Duration::from_secs(5)),
            ..Default::default()
        };
        assert!(build_client(&config).is_ok());
    }

    #[tokio::test]
    async fn load_client_invokes_sink_exactly_once_on_success() {
        use std::sync::Mutex;
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ping"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let metrics = Arc::new(Mutex::new(Vec::new()));
        let metrics_clone = metrics.clone();
        let http = build_client(&ClientConfig::default()).unwrap().client;
        let (label_tx, _label_rx) = crate::label_registry::label_channel();
        let client = LoadClient::new(
            http,
            server.uri(),
            0,
            Arc::new(move |m| metrics_clone.lock().unwrap().push(m)),
            label_tx,
        );

        let response = client.get("/ping", "ping").await.unwrap();
        assert_eq!(response.status().as_u16(), 200);

        let recorded = metrics.lock().unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].status_code, 200);
        assert_eq!(recorded[0].error_category, ErrorCategory::None);
    }

    #[tokio::test]
    async fn load_client_invokes_sink_exactly_once_on_server_error() {
        use std::sync::Mutex;
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/boom"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let metrics = Arc::new(Mutex::new(Vec::new()));
        let metrics_clone = metrics.clone();
        let http = build_client(&ClientConfig::default()).unwrap().client;
        let (label_tx, _label_rx) = crate::label_registry::label_channel();
        let client = LoadClient::new(
            http,
            server.uri(),
            2,
            Arc::new(move |m| metrics_clone.lock().unwrap().push(m)),
            label_tx,
        );

        let response = client.get("/boom", "boom").await.unwrap();
        assert_eq!(response.status().as_u16(), 500);

        let recorded = metrics.lock().unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].error_category, ErrorCategory::Status5xx);
        assert_eq!(recorded[0].worker_id, 2);
    }

    #[tokio::test]
    async fn first_request_to_a_path_registers_its_label() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/checkout"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let http = build_client(&ClientConfig::default()).unwrap().client;
        let (label_tx, mut label_rx) = crate::label_registry::label_channel();
        let client = LoadClient::new(http, server.uri(), 0, Arc::new(|_m| {}), label_tx);

        client.get("/checkout", "checkout").await.unwrap();
        let label = label_rx.try_recv().expect("label should be registered on first use");
        assert_eq!(label.name, "checkout");
        assert_eq!(label.hash, fnv1a_hash("checkout"));

        client.get("/checkout", "checkout").await.unwrap();
        assert!(
            label_rx.try_recv().is_err(),
            "second request to the same name must not re-register"
        );
    }
}
