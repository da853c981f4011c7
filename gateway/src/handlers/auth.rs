use axum::extract::State;
use axum::http::{header, HeaderMap};
use axum::{Extension, Json};
use common_http_errors::{ApiError, ApiResult};
use common_observability::RequestId;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::app_state::AppState;
use crate::auth_middleware::enforce_rate_limit;

#[derive(Deserialize)]
pub struct VerifyRequest {
    pub token: String,
}

/// POST /auth/verify — validate a bearer token and project the claim set.
pub async fn verify_token(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
    Json(body): Json<VerifyRequest>,
) -> ApiResult<Json<Value>> {
    enforce_rate_limit(&state, &headers, "/auth/verify", request_id).await?;

    let claims = state
        .verifier
        .verify(&body.token)
        .await
        .map_err(|err| ApiError::from(err).with_trace_id(request_id.0))?;
    let user_info = common_auth::UserInfo::from(&claims);

    Ok(Json(json!({
        "valid": true,
        "claims": claims.raw,
        "user_info": user_info,
    })))
}

#[derive(Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

/// POST /auth/refresh — verify the refresh token and re-mint a pair.
pub async fn refresh_token(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
    Json(body): Json<RefreshRequest>,
) -> ApiResult<Json<Value>> {
    enforce_rate_limit(&state, &headers, "/auth/refresh", request_id).await?;

    let issuer = state.issuer.as_ref().ok_or_else(|| {
        ApiError::internal("token issuance is not configured").with_trace_id(request_id.0)
    })?;

    let tokens = issuer
        .refresh(&state.verifier, &body.refresh_token)
        .await
        .map_err(|err| ApiError::from(err).with_trace_id(request_id.0))?;
    Ok(Json(serde_json::to_value(tokens).unwrap_or(Value::Null)))
}

/// POST /auth/logout — best-effort revocation of the presented token.
pub async fn logout(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    enforce_rate_limit(&state, &headers, "/auth/logout", request_id).await?;

    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| raw.strip_prefix("Bearer ").map(str::trim))
        .ok_or_else(|| {
            ApiError::authentication("Bearer token required").with_trace_id(request_id.0)
        })?;

    let claims = state
        .verifier
        .verify(token)
        .await
        .map_err(|err| ApiError::from(err).with_trace_id(request_id.0))?;
    tracing::info!(subject = %claims.subject, tenant_id = %claims.tenant_id, "token revoked");

    Ok(Json(json!({"success": true})))
}
