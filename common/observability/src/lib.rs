use axum::{
    body::Body,
    http::{header, HeaderValue, Request, StatusCode},
    middleware::Next,
    response::Response,
};
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounterVec, Opts, Registry, TextEncoder,
};
use tracing::{info_span, Instrument};
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

/// Initialise the fmt subscriber with an env-filter, falling back to the
/// given default level when RUST_LOG is unset.
pub fn init_tracing(default_level: &str) {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| default_level.to_string());
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Request-scoped correlation id, adopted from inbound headers or minted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestId(pub Uuid);

impl RequestId {
    pub fn from_headers(headers: &axum::http::HeaderMap) -> Self {
        let inbound = headers
            .get(REQUEST_ID_HEADER)
            .or_else(|| headers.get(CORRELATION_ID_HEADER))
            .and_then(|value| value.to_str().ok())
            .and_then(|value| Uuid::parse_str(value).ok());
        Self(inbound.unwrap_or_else(Uuid::new_v4))
    }
}

/// Axum middleware: adopt or mint a request id, expose it to handlers via
/// request extensions, stamp it on the response, and open a span around the
/// request so downstream logs carry the id.
pub async fn request_id_middleware(mut request: Request<Body>, next: Next) -> Response {
    let request_id = RequestId::from_headers(request.headers());
    request.extensions_mut().insert(request_id);

    let span = info_span!(
        "http_request",
        request_id = %request_id.0,
        method = %request.method(),
        path = %request.uri().path(),
    );

    let mut response = next.run(request).instrument(span).await;
    if let Ok(value) = HeaderValue::from_str(&request_id.0.to_string()) {
        response.headers_mut().insert("X-Request-Id", value);
    }
    response
}

/// HTTP-level metrics every service registers alongside its domain metrics.
#[derive(Clone)]
pub struct HttpMetrics {
    requests_total: IntCounterVec,
    errors_total: IntCounterVec,
    request_duration: Histogram,
}

impl HttpMetrics {
    pub fn register(registry: &Registry, service: &str) -> prometheus::Result<Self> {
        let requests_total = IntCounterVec::new(
            Opts::new("http_requests_total", "HTTP requests by method and status")
                .const_label("service", service),
            &["method", "status"],
        )?;
        let errors_total = IntCounterVec::new(
            Opts::new(
                "http_errors_total",
                "HTTP error responses (status >= 400) by error code",
            )
            .const_label("service", service),
            &["code", "status"],
        )?;
        let request_duration = Histogram::with_opts(
            HistogramOpts::new(
                "http_request_duration_seconds",
                "Request handling latency (seconds)",
            )
            .const_label("service", service)
            .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
        )?;
        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(errors_total.clone()))?;
        registry.register(Box::new(request_duration.clone()))?;
        Ok(Self {
            requests_total,
            errors_total,
            request_duration,
        })
    }

    pub fn record_request(&self, method: &str, status: StatusCode, duration_secs: f64) {
        self.requests_total
            .with_label_values(&[method, status.as_str()])
            .inc();
        self.request_duration.observe(duration_secs);
    }

    pub fn record_error(&self, code: &str, status: StatusCode) {
        self.errors_total
            .with_label_values(&[code, status.as_str()])
            .inc();
    }
}

/// Records request counts, latency, and error codes (via the `X-Error-Code`
/// header the error envelope sets) for every route it wraps.
pub async fn http_metrics_middleware(
    axum::extract::State(metrics): axum::extract::State<HttpMetrics>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let method = request.method().to_string();
    let started = std::time::Instant::now();
    let response = next.run(request).await;

    let status = response.status();
    metrics.record_request(&method, status, started.elapsed().as_secs_f64());
    if status.is_client_error() || status.is_server_error() {
        let code = response
            .headers()
            .get("X-Error-Code")
            .and_then(|value| value.to_str().ok())
            .unwrap_or("unknown")
            .to_string();
        metrics.record_error(&code, status);
    }
    response
}

/// Render a registry in the Prometheus text exposition format.
pub fn render_metrics(registry: &Registry) -> Result<Response, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    let response = Response::builder()
        .status(StatusCode::OK)
        .header(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; version=0.0.4"),
        )
        .body(Body::from(buffer))
        .expect("metrics response build");
    Ok(response)
}
