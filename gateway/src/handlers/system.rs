use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::warn;

use crate::app_state::AppState;
use crate::circuit_breaker::BreakerState;

pub async fn root() -> Json<Value> {
    Json(json!({
        "service": "gateway",
        "message": "Market-Data Access Layer - API Gateway",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Liveness plus a dependency roll-up derived from breaker states and the
/// rule store health probe.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let mut dependencies = serde_json::Map::new();
    for snapshot in state.breakers.snapshots() {
        let healthy = matches!(snapshot.state, BreakerState::Closed);
        dependencies.insert(
            snapshot.name,
            Value::String(if healthy { "ok" } else { "degraded" }.to_string()),
        );
    }
    let rule_store_ok = state.entitlements.store().health().await;
    dependencies.insert(
        "rule-store".to_string(),
        Value::String(if rule_store_ok { "ok" } else { "error" }.to_string()),
    );

    let status = if dependencies.values().all(|v| v == "ok") {
        "ok"
    } else {
        "degraded"
    };
    Json(json!({
        "service": "gateway",
        "status": status,
        "dependencies": dependencies,
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

pub async fn api_status() -> Json<Value> {
    Json(json!({
        "status": "operational",
        "version": env!("CARGO_PKG_VERSION"),
        "services": {
            "gateway": "ok",
            "auth": "ok",
            "entitlements": "ok",
            "streaming": "ok",
        },
    }))
}

pub async fn metrics_endpoint(State(state): State<AppState>) -> Response {
    match state.metrics.render() {
        Ok(response) => response,
        Err(err) => {
            warn!(error = %err, "failed to render metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics unavailable").into_response()
        }
    }
}
