use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::{Extension, Json};
use chrono::Utc;
use common_entitlements::RuleDraft;
use common_http_errors::{ApiError, ApiResult};
use common_observability::RequestId;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::app_state::AppState;
use crate::auth_middleware::{authenticate, enforce_rate_limit, process_request};

/// POST /api/v1/cache/warm — admin-gated warm of the hot-query catalog.
pub async fn warm_cache(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    enforce_rate_limit(&state, &headers, "/api/v1/cache/warm", request_id).await?;
    let user = process_request(&state, &headers, "cache", "admin", request_id).await?;

    let summary = state.warmer.warm(&state.cache, &user.user_id, &user.tenant_id).await;
    Ok(Json(json!({
        "message": "Cache warmed successfully",
        "user": user.user_id,
        "tenant": user.tenant_id,
        "summary": summary,
    })))
}

pub async fn circuit_breakers(State(state): State<AppState>) -> Json<Value> {
    let snapshots = state.breakers.snapshots();
    Json(json!({
        "circuit_breakers": snapshots,
        "count": snapshots.len(),
    }))
}

pub async fn rate_limits(State(state): State<AppState>) -> Json<Value> {
    let configured = state.rate_limiter.categories().configured().clone();
    match state.rate_limiter.global_stats().await {
        Ok(stats) => Json(json!({
            "rate_limits": stats,
            "configured_limits": configured,
            "window_seconds": state.rate_limiter.window_secs(),
        })),
        Err(err) => Json(json!({
            "error": err.to_string(),
            "configured_limits": configured,
        })),
    }
}

pub async fn cache_stats(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "classes": state.cache.stats(),
        "generated_at": Utc::now().to_rfc3339(),
    }))
}

pub async fn cache_catalog(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "cache_catalog": state.cache.catalog(),
        "hot_query_categories": state.warmer.catalog().categories(),
        "generated_at": Utc::now().to_rfc3339(),
    }))
}

/// GET /api/v1/metadata/routes — route metadata for API discovery.
pub async fn metadata_routes(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    enforce_rate_limit(&state, &headers, "/api/v1/metadata/routes", request_id).await?;
    let user = authenticate(&state, &headers, request_id).await?;

    let routes = crate::router::route_metadata();
    Ok(Json(json!({
        "count": routes.len(),
        "routes": routes,
        "generated_at": Utc::now().to_rfc3339(),
        "user": {
            "user_id": user.user_id,
            "tenant_id": user.tenant_id,
        },
    })))
}

// ---------------- Entitlement rule administration ----------------

/// Rule CRUD is policy administration; it is gated on the admin role from the
/// verified claims rather than on the engine it configures.
async fn require_admin(
    state: &AppState,
    headers: &HeaderMap,
    request_id: RequestId,
) -> ApiResult<common_auth::UserInfo> {
    let user = authenticate(state, headers, request_id).await?;
    if !user.roles.iter().any(|role| role == "admin") {
        return Err(
            ApiError::authorization("admin role required for rule administration")
                .with_trace_id(request_id.0),
        );
    }
    Ok(user)
}

pub async fn create_rule(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
    Json(draft): Json<RuleDraft>,
) -> ApiResult<Json<Value>> {
    enforce_rate_limit(&state, &headers, "/api/v1/entitlements/rules", request_id).await?;
    require_admin(&state, &headers, request_id).await?;

    let rule = state
        .entitlements
        .create_rule(draft)
        .await
        .map_err(|err| ApiError::from(err).with_trace_id(request_id.0))?;
    Ok(Json(json!({"rule": rule})))
}

#[derive(Deserialize)]
pub struct ListRulesParams {
    pub tenant_id: Option<String>,
}

pub async fn list_rules(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Query(params): Query<ListRulesParams>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    enforce_rate_limit(&state, &headers, "/api/v1/entitlements/rules", request_id).await?;
    require_admin(&state, &headers, request_id).await?;

    let rules = state
        .entitlements
        .list_rules(params.tenant_id.as_deref())
        .await
        .map_err(|err| ApiError::from(err).with_trace_id(request_id.0))?;
    Ok(Json(json!({"count": rules.len(), "rules": rules})))
}

pub async fn get_rule(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Path(rule_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    enforce_rate_limit(&state, &headers, "/api/v1/entitlements/rules", request_id).await?;
    require_admin(&state, &headers, request_id).await?;

    let rule = state
        .entitlements
        .get_rule(&rule_id)
        .await
        .map_err(|err| ApiError::from(err).with_trace_id(request_id.0))?;
    Ok(Json(json!({"rule": rule})))
}

pub async fn update_rule(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Path(rule_id): Path<String>,
    headers: HeaderMap,
    Json(draft): Json<RuleDraft>,
) -> ApiResult<Json<Value>> {
    enforce_rate_limit(&state, &headers, "/api/v1/entitlements/rules", request_id).await?;
    require_admin(&state, &headers, request_id).await?;

    let rule = state
        .entitlements
        .update_rule(&rule_id, draft)
        .await
        .map_err(|err| ApiError::from(err).with_trace_id(request_id.0))?;
    Ok(Json(json!({"rule": rule})))
}

pub async fn delete_rule(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Path(rule_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    enforce_rate_limit(&state, &headers, "/api/v1/entitlements/rules", request_id).await?;
    require_admin(&state, &headers, request_id).await?;

    state
        .entitlements
        .delete_rule(&rule_id)
        .await
        .map_err(|err| ApiError::from(err).with_trace_id(request_id.0))?;
    Ok(Json(json!({"deleted": rule_id})))
}

#[derive(Deserialize)]
pub struct RateLimitResetParams {
    pub client_id: String,
    pub endpoint: String,
}

/// POST /api/v1/rate-limits/reset — operator escape hatch.
pub async fn reset_rate_limit(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Query(params): Query<RateLimitResetParams>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    require_admin(&state, &headers, request_id).await?;
    state
        .rate_limiter
        .reset(&params.client_id, &params.endpoint)
        .await
        .map_err(|err| ApiError::internal(err).with_trace_id(request_id.0))?;
    Ok(Json(json!({"reset": true})))
}
