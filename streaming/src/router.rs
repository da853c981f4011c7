use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use common_auth::{JwksCache, JwksFetcher, JwtConfig, TokenVerifier};
use common_entitlements::{EntitlementEngine, MemoryRuleStore, PgRuleStore, RuleStore};
use common_observability::{http_metrics_middleware, request_id_middleware};
use serde_json::{json, Value};
use tracing::warn;

use crate::app_state::StreamingState;
use crate::bus::{BusConsumer, BusSource};
use crate::config::StreamingConfig;
use crate::metrics::StreamingMetrics;
use crate::registry::ConnectionRegistry;
use crate::sse::{sse_endpoint, sse_subscribe};
use crate::topics::TopicTable;
use crate::ws::ws_endpoint;

/// Wire the fabric together. The bus source defaults to the in-process
/// channel; builds with the `kafka` feature connect to the broker instead.
pub async fn build_state(config: StreamingConfig) -> Result<StreamingState> {
    let config = Arc::new(config);

    let jwks_url = config
        .jwks_url
        .clone()
        .unwrap_or_else(|| "http://127.0.0.1:9/jwks".to_string());
    let jwks = JwksCache::new(
        JwksFetcher::new(jwks_url),
        Duration::from_secs(config.jwks_ttl_seconds),
    );
    let mut jwt_config = JwtConfig::new();
    if let Some(issuer) = &config.jwt_issuer {
        jwt_config = jwt_config.with_issuer(issuer.clone());
    }
    if let Some(audience) = &config.jwt_audience {
        jwt_config = jwt_config.with_audience(audience.clone());
    }
    let verifier = Arc::new(TokenVerifier::new(jwt_config, jwks));

    let rule_store: Arc<dyn RuleStore> = match &config.rule_store_dsn {
        Some(dsn) => Arc::new(
            PgRuleStore::connect(dsn)
                .await
                .map_err(|err| anyhow::anyhow!("rule store: {err}"))?,
        ),
        None => Arc::new(MemoryRuleStore::new()),
    };
    let entitlements = Arc::new(EntitlementEngine::new(rule_store));

    let topics = Arc::new(match &config.topics_json {
        Some(raw) => TopicTable::from_json(raw).context("STREAMING_TOPICS_JSON failed to parse")?,
        None => TopicTable::defaults(),
    });

    let metrics = Arc::new(StreamingMetrics::new().map_err(|err| anyhow::anyhow!("{err}"))?);
    let registry = Arc::new(ConnectionRegistry::new(
        config.max_ws_connections,
        Duration::from_secs(config.heartbeat_timeout_seconds),
        config.queue_capacity,
        metrics.clone(),
    ));

    let (source, bus_injector) = build_bus_source(&config)?;
    let consumer = Arc::new(BusConsumer::new(source, registry.clone(), metrics.clone()));

    Ok(StreamingState {
        config,
        verifier,
        entitlements,
        registry,
        consumer,
        topics,
        metrics,
        bus_injector,
    })
}

#[cfg(feature = "kafka")]
fn build_bus_source(
    config: &StreamingConfig,
) -> Result<(Arc<dyn BusSource>, Option<tokio::sync::mpsc::Sender<crate::bus::BusMessage>>)> {
    let source =
        crate::bus::kafka::KafkaBusSource::connect(&config.kafka_bootstrap, &config.kafka_group_id)
            .context("failed to create Kafka consumer")?;
    Ok((Arc::new(source), None))
}

#[cfg(not(feature = "kafka"))]
fn build_bus_source(
    config: &StreamingConfig,
) -> Result<(Arc<dyn BusSource>, Option<tokio::sync::mpsc::Sender<crate::bus::BusMessage>>)> {
    warn!(
        bootstrap = %config.kafka_bootstrap,
        "kafka feature disabled; using in-process channel bus"
    );
    let (source, sender) = crate::bus::ChannelBusSource::new();
    Ok((Arc::new(source), Some(sender)))
}

pub fn spawn_background(state: &StreamingState) {
    state.registry.spawn_sweeper();
    state.consumer.clone().spawn();
}

async fn root(State(state): State<StreamingState>) -> Json<Value> {
    Json(json!({
        "service": "streaming",
        "message": "Market-Data Access Layer - Streaming Service",
        "version": env!("CARGO_PKG_VERSION"),
        "capabilities": ["websocket", "sse"],
        "topics": state.topics.names(),
    }))
}

async fn health(State(state): State<StreamingState>) -> Json<Value> {
    let rule_store_ok = state.entitlements.store().health().await;
    let status = if rule_store_ok { "ok" } else { "degraded" };
    Json(json!({
        "service": "streaming",
        "status": status,
        "dependencies": {
            "rule-store": if rule_store_ok { "ok" } else { "error" },
        },
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

async fn stats(State(state): State<StreamingState>) -> Json<Value> {
    Json(json!({
        "connections": state.registry.stats().await,
        "bus": {
            "subscribed_topics": state.consumer.subscribed_topics().await,
        },
        "supported_topics": state.topics.names(),
    }))
}

async fn metrics_endpoint(State(state): State<StreamingState>) -> Response {
    match state.metrics.render() {
        Ok(response) => response,
        Err(err) => {
            warn!(error = %err, "failed to render metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics unavailable").into_response()
        }
    }
}

pub fn build_router(state: StreamingState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/healthz", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/stats", get(stats))
        .route("/ws/stream", get(ws_endpoint))
        .route("/sse/stream", get(sse_endpoint))
        .route("/sse/subscribe", post(sse_subscribe))
        .layer(middleware::from_fn_with_state(
            state.metrics.http.clone(),
            http_metrics_middleware,
        ))
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}
