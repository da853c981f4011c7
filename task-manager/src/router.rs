use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use common_auth::{JwksCache, JwksFetcher, JwtConfig, TokenVerifier, UserInfo};
use common_http_errors::{ApiError, ApiResult};
use common_observability::{http_metrics_middleware, request_id_middleware};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use crate::config::TaskManagerConfig;
use crate::metrics::WorkflowMetrics;
use crate::model::{
    ProposalRequest, RftpRequest, TaskApproval, TaskCompletion, TaskProgress, TaskStart,
};
use crate::workflow::WorkflowEngine;

#[derive(Clone)]
pub struct TaskManagerState {
    pub config: Arc<TaskManagerConfig>,
    pub verifier: Arc<TokenVerifier>,
    pub engine: Arc<WorkflowEngine>,
    pub metrics: Arc<WorkflowMetrics>,
}

pub async fn build_state(config: TaskManagerConfig) -> Result<TaskManagerState> {
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

    let metrics = Arc::new(WorkflowMetrics::new().map_err(|err| anyhow::anyhow!("{err}"))?);
    let engine = Arc::new(WorkflowEngine::new(metrics.clone()));

    Ok(TaskManagerState {
        config,
        verifier,
        engine,
        metrics,
    })
}

async fn authenticate(state: &TaskManagerState, headers: &HeaderMap) -> ApiResult<UserInfo> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| raw.strip_prefix("Bearer ").map(str::trim))
        .ok_or_else(|| ApiError::authentication("Bearer token required"))?;
    state
        .verifier
        .user_info_from_token(token)
        .await
        .map_err(ApiError::from)
}

async fn health() -> Json<Value> {
    Json(json!({"status": "healthy", "service": "task-manager"}))
}

async fn metrics_endpoint(State(state): State<TaskManagerState>) -> Response {
    match state.metrics.render() {
        Ok(response) => response,
        Err(err) => {
            warn!(error = %err, "failed to render metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics unavailable").into_response()
        }
    }
}

async fn create_rftp(
    State(state): State<TaskManagerState>,
    headers: HeaderMap,
    Json(request): Json<RftpRequest>,
) -> ApiResult<Response> {
    authenticate(&state, &headers).await?;
    let record = state.engine.create_rftp(request).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "rftp_id": record.rftp_id,
            "status": record.status.as_str(),
            "created_at": record.created_at.to_rfc3339(),
        })),
    )
        .into_response())
}

async fn get_rftp(
    State(state): State<TaskManagerState>,
    Path(rftp_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    authenticate(&state, &headers).await?;
    let record = state.engine.get_rftp(&rftp_id).await?;
    Ok(Json(serde_json::to_value(record).unwrap_or(Value::Null)))
}

#[derive(Deserialize)]
struct ListFilters {
    status: Option<String>,
    task_type: Option<String>,
    assigned_to: Option<String>,
}

async fn list_rftps(
    State(state): State<TaskManagerState>,
    Query(filters): Query<ListFilters>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    authenticate(&state, &headers).await?;
    let records = state
        .engine
        .list_rftps(filters.status.as_deref(), filters.task_type.as_deref())
        .await;
    Ok(Json(serde_json::to_value(records).unwrap_or(Value::Null)))
}

async fn create_proposal(
    State(state): State<TaskManagerState>,
    headers: HeaderMap,
    Json(proposal): Json<ProposalRequest>,
) -> ApiResult<Response> {
    authenticate(&state, &headers).await?;
    let proposal_id = proposal.proposal_id.clone();
    let task = state.engine.submit_proposal(proposal).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "proposal_id": proposal_id,
            "task_id": task.task_id,
            "status": "created",
        })),
    )
        .into_response())
}

async fn get_proposal(
    State(state): State<TaskManagerState>,
    Path(proposal_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    authenticate(&state, &headers).await?;
    let record = state.engine.get_proposal(&proposal_id).await?;
    Ok(Json(serde_json::to_value(record).unwrap_or(Value::Null)))
}

async fn list_tasks(
    State(state): State<TaskManagerState>,
    Query(filters): Query<ListFilters>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    authenticate(&state, &headers).await?;
    let tasks = state
        .engine
        .list_tasks(
            filters.status.as_deref(),
            filters.task_type.as_deref(),
            filters.assigned_to.as_deref(),
        )
        .await;
    Ok(Json(serde_json::to_value(tasks).unwrap_or(Value::Null)))
}

async fn get_task(
    State(state): State<TaskManagerState>,
    Path(task_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    authenticate(&state, &headers).await?;
    let task = state.engine.get_task(&task_id).await?;
    Ok(Json(serde_json::to_value(task).unwrap_or(Value::Null)))
}

async fn approve_task(
    State(state): State<TaskManagerState>,
    Path(task_id): Path<String>,
    headers: HeaderMap,
    Json(approval): Json<TaskApproval>,
) -> ApiResult<Json<Value>> {
    authenticate(&state, &headers).await?;
    let task = state.engine.approve(&task_id, approval).await?;
    Ok(Json(json!({"task_id": task.task_id, "status": task.status.as_str()})))
}

async fn start_task(
    State(state): State<TaskManagerState>,
    Path(task_id): Path<String>,
    headers: HeaderMap,
    Json(start): Json<TaskStart>,
) -> ApiResult<Json<Value>> {
    authenticate(&state, &headers).await?;
    let task = state.engine.start(&task_id, start).await?;
    Ok(Json(json!({"task_id": task.task_id, "status": task.status.as_str()})))
}

async fn update_progress(
    State(state): State<TaskManagerState>,
    Path(task_id): Path<String>,
    headers: HeaderMap,
    Json(progress): Json<TaskProgress>,
) -> ApiResult<Json<Value>> {
    authenticate(&state, &headers).await?;
    let task = state.engine.update_progress(&task_id, progress).await?;
    Ok(Json(json!({
        "task_id": task.task_id,
        "status": task.status.as_str(),
        "progress_percentage": task.progress_percentage,
        "spent_budget": task.spent_budget,
        "spent_hours": task.spent_hours,
    })))
}

async fn complete_task(
    State(state): State<TaskManagerState>,
    Path(task_id): Path<String>,
    headers: HeaderMap,
    Json(completion): Json<TaskCompletion>,
) -> ApiResult<Json<Value>> {
    authenticate(&state, &headers).await?;
    let task = state.engine.complete(&task_id, completion).await?;
    Ok(Json(json!({"task_id": task.task_id, "status": task.status.as_str()})))
}

#[derive(Deserialize, Default)]
struct ReasonBody {
    reason: Option<String>,
}

async fn cancel_task(
    State(state): State<TaskManagerState>,
    Path(task_id): Path<String>,
    headers: HeaderMap,
    body: Option<Json<ReasonBody>>,
) -> ApiResult<Json<Value>> {
    authenticate(&state, &headers).await?;
    let reason = body.and_then(|Json(body)| body.reason);
    let task = state.engine.cancel(&task_id, reason).await?;
    Ok(Json(json!({"task_id": task.task_id, "status": task.status.as_str()})))
}

async fn terminate_task(
    State(state): State<TaskManagerState>,
    Path(task_id): Path<String>,
    headers: HeaderMap,
    body: Option<Json<ReasonBody>>,
) -> ApiResult<Json<Value>> {
    authenticate(&state, &headers).await?;
    let reason = body.and_then(|Json(body)| body.reason);
    let task = state.engine.terminate(&task_id, reason).await?;
    Ok(Json(json!({"task_id": task.task_id, "status": task.status.as_str()})))
}

async fn reject_task(
    State(state): State<TaskManagerState>,
    Path(task_id): Path<String>,
    headers: HeaderMap,
    body: Option<Json<ReasonBody>>,
) -> ApiResult<Json<Value>> {
    authenticate(&state, &headers).await?;
    let reason = body.and_then(|Json(body)| body.reason);
    let task = state.engine.reject(&task_id, reason).await?;
    Ok(Json(json!({"task_id": task.task_id, "status": task.status.as_str()})))
}

async fn dashboard(
    State(state): State<TaskManagerState>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    authenticate(&state, &headers).await?;
    let mut payload = state.engine.dashboard().await;
    if let Some(map) = payload.as_object_mut() {
        map.insert("generated_at".into(), json!(Utc::now().to_rfc3339()));
    }
    Ok(Json(payload))
}

pub fn build_router(state: TaskManagerState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/healthz", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/rftps", get(list_rftps).post(create_rftp))
        .route("/rftps/:rftp_id", get(get_rftp))
        .route("/proposals", post(create_proposal))
        .route("/proposals/:proposal_id", get(get_proposal))
        .route("/tasks", get(list_tasks))
        .route("/tasks/:task_id", get(get_task))
        .route("/tasks/:task_id/approve", post(approve_task))
        .route("/tasks/:task_id/start", post(start_task))
        .route("/tasks/:task_id/progress", post(update_progress))
        .route("/tasks/:task_id/complete", post(complete_task))
        .route("/tasks/:task_id/cancel", post(cancel_task))
        .route("/tasks/:task_id/terminate", post(terminate_task))
        .route("/tasks/:task_id/reject", post(reject_task))
        .route("/telemetry/dashboard", get(dashboard))
        .layer(middleware::from_fn_with_state(
            state.metrics.http.clone(),
            http_metrics_middleware,
        ))
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}
