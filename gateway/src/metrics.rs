use anyhow::Result;
use axum::response::Response;
use common_observability::{render_metrics, HttpMetrics};
use prometheus::{Histogram, HistogramOpts, IntCounterVec, Opts, Registry};

#[derive(Clone)]
pub struct GatewayMetrics {
    registry: Registry,
    pub http: HttpMetrics,
    rate_checks: IntCounterVec,
    rate_rejections: IntCounterVec,
    auth_requests: IntCounterVec,
    cache_requests: IntCounterVec,
    entitlement_decisions: IntCounterVec,
    rate_limit_latency: Histogram,
}

impl GatewayMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let http = HttpMetrics::register(&registry, "gateway")?;

        let rate_checks = IntCounterVec::new(
            Opts::new("gateway_rate_limit_checks_total", "Rate limit checks"),
            &["category"],
        )?;
        let rate_rejections = IntCounterVec::new(
            Opts::new(
                "gateway_rate_limit_rejections_total",
                "Rate limit rejections",
            ),
            &["category"],
        )?;
        let auth_requests = IntCounterVec::new(
            Opts::new(
                "gateway_auth_requests_total",
                "Authentication attempts by method and result",
            ),
            &["method", "result"],
        )?;
        let cache_requests = IntCounterVec::new(
            Opts::new(
                "gateway_cache_requests_total",
                "Response cache lookups by class and result",
            ),
            &["class", "result"],
        )?;
        let entitlement_decisions = IntCounterVec::new(
            Opts::new(
                "gateway_entitlement_decisions_total",
                "Entitlement decisions by outcome",
            ),
            &["outcome"],
        )?;
        let rate_limit_latency = Histogram::with_opts(HistogramOpts::new(
            "gateway_rate_limiter_decision_seconds",
            "Time spent performing the rate limiter decision (seconds)",
        ))?;

        registry.register(Box::new(rate_checks.clone()))?;
        registry.register(Box::new(rate_rejections.clone()))?;
        registry.register(Box::new(auth_requests.clone()))?;
        registry.register(Box::new(cache_requests.clone()))?;
        registry.register(Box::new(entitlement_decisions.clone()))?;
        registry.register(Box::new(rate_limit_latency.clone()))?;

        Ok(Self {
            registry,
            http,
            rate_checks,
            rate_rejections,
            auth_requests,
            cache_requests,
            entitlement_decisions,
            rate_limit_latency,
        })
    }

    pub fn record_rate_check(&self, category: &str, allowed: bool) {
        self.rate_checks.with_label_values(&[category]).inc();
        if !allowed {
            self.rate_rejections.with_label_values(&[category]).inc();
        }
    }

    pub fn record_auth(&self, method: &str, allowed: bool) {
        let result = if allowed { "allowed" } else { "rejected" };
        self.auth_requests.with_label_values(&[method, result]).inc();
    }

    pub fn record_cache(&self, class: &str, hit: bool) {
        let result = if hit { "hit" } else { "miss" };
        self.cache_requests.with_label_values(&[class, result]).inc();
    }

    pub fn record_entitlement(&self, allowed: bool) {
        let outcome = if allowed { "allow" } else { "deny" };
        self.entitlement_decisions.with_label_values(&[outcome]).inc();
    }

    pub fn observe_rate_limiter_latency(&self, secs: f64) {
        self.rate_limit_latency.observe(secs);
    }

    pub fn render(&self) -> Result<Response> {
        Ok(render_metrics(&self.registry)?)
    }
}
