use std::time::Instant;

use axum::http::{header, HeaderMap, HeaderValue};
use axum::response::Response;
use common_auth::{UserInfo, AUTH_METHOD_API_KEY, AUTH_METHOD_BEARER};
use common_entitlements::CheckRequest;
use common_http_errors::{ApiError, ApiResult};
use common_observability::RequestId;
use serde_json::Value;
use tracing::warn;

use crate::app_state::AppState;
use crate::rate_limiter::{RateDecision, RateLimitCategories};

pub const API_KEY_HEADER: &str = "x-api-key";

/// Caller identity for rate limiting before authentication has run:
/// forwarded address, else the peer placeholder.
pub fn client_ip(headers: &HeaderMap) -> String {
    if let Some(forwarded) = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    if let Some(real_ip) = headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
    {
        return real_ip.to_string();
    }
    "unknown".to_string()
}

/// Step 2 of the pipeline. Runs before authentication, so the client id is
/// address-derived. Denials surface as the 429 envelope with retry metadata.
pub async fn enforce_rate_limit(
    state: &AppState,
    headers: &HeaderMap,
    path: &str,
    request_id: RequestId,
) -> ApiResult<RateDecision> {
    let category = RateLimitCategories::categorize(path);
    let client_id = client_ip(headers);

    let started = Instant::now();
    let decision = state.rate_limiter.check(&client_id, path, category).await;
    state
        .metrics
        .observe_rate_limiter_latency(started.elapsed().as_secs_f64());
    state.metrics.record_rate_check(category, decision.allowed);

    if !decision.allowed {
        warn!(
            client_id,
            endpoint = path,
            current_count = decision.current_count,
            limit = decision.limit,
            "rate limit exceeded"
        );
        return Err(ApiError::RateLimit {
            limit: decision.limit,
            current_count: decision.current_count,
            retry_after_seconds: decision.reset_in_seconds,
            trace_id: None,
        }
        .with_trace_id(request_id.0));
    }
    Ok(decision)
}

/// Step 3: API key first, bearer token second, 401 when neither is present.
pub async fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
    request_id: RequestId,
) -> ApiResult<UserInfo> {
    if let Some(api_key) = headers
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
    {
        let result = state.api_keys.authenticate(api_key);
        state.metrics.record_auth(AUTH_METHOD_API_KEY, result.is_ok());
        return result
            .map_err(|err| ApiError::from(err).with_trace_id(request_id.0));
    }

    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| raw.strip_prefix("Bearer ").map(str::trim));

    let Some(token) = bearer else {
        state.metrics.record_auth(AUTH_METHOD_BEARER, false);
        return Err(ApiError::authentication(
            "Authorization header or X-API-Key header required",
        )
        .with_trace_id(request_id.0));
    };

    let result = state.verifier.user_info_from_token(token).await;
    state.metrics.record_auth(AUTH_METHOD_BEARER, result.is_ok());
    result.map_err(|err| ApiError::from(err).with_trace_id(request_id.0))
}

/// Step 4: entitlement check. Deny maps to 403; a rule-store outage maps to
/// 503 so callers never mistake an outage for a policy decision.
pub async fn authorize(
    state: &AppState,
    user: &UserInfo,
    resource: &str,
    action: &str,
    extra_context: &[(&str, Value)],
    request_id: RequestId,
) -> ApiResult<()> {
    let mut request = CheckRequest::new(
        user.user_id.clone(),
        user.tenant_id.clone(),
        resource,
        action,
    )
    .with_roles(&user.roles);
    for (key, value) in extra_context {
        request = request.with_context(*key, value.clone());
    }

    let decision = state
        .entitlements
        .check(&request)
        .await
        .map_err(|err| ApiError::from(err).with_trace_id(request_id.0))?;
    state.metrics.record_entitlement(decision.allowed);

    if !decision.allowed {
        warn!(
            user_id = %user.user_id,
            tenant_id = %user.tenant_id,
            resource,
            action,
            reason = %decision.reason,
            "authorization denied"
        );
        return Err(ApiError::authorization(decision.reason).with_trace_id(request_id.0));
    }
    Ok(())
}

/// Convenience for the common authenticate-then-authorize sequence.
pub async fn process_request(
    state: &AppState,
    headers: &HeaderMap,
    resource: &str,
    action: &str,
    request_id: RequestId,
) -> ApiResult<UserInfo> {
    let user = authenticate(state, headers, request_id).await?;
    authorize(state, &user, resource, action, &[], request_id).await?;
    Ok(user)
}

/// Step 8: rate-limit headers on every limited route's response.
pub fn apply_rate_limit_headers(response: &mut Response, decision: &RateDecision) {
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&decision.limit.to_string()) {
        headers.insert("X-RateLimit-Limit", value);
    }
    if let Ok(value) = HeaderValue::from_str(&decision.remaining.to_string()) {
        headers.insert("X-RateLimit-Remaining", value);
    }
    if let Ok(value) = HeaderValue::from_str(&decision.reset_in_seconds.to_string()) {
        headers.insert("X-RateLimit-Reset", value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forwarded_header_wins() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "10.1.2.3, 10.0.0.1".parse().unwrap());
        headers.insert("x-real-ip", "10.9.9.9".parse().unwrap());
        assert_eq!(client_ip(&headers), "10.1.2.3");
    }

    #[test]
    fn real_ip_is_the_fallback() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", "10.9.9.9".parse().unwrap());
        assert_eq!(client_ip(&headers), "10.9.9.9");
    }

    #[test]
    fn unknown_when_no_addressing_headers() {
        assert_eq!(client_ip(&HeaderMap::new()), "unknown");
    }
}
