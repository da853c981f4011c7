use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use common_http_errors::{ApiError, ApiResult};
use common_observability::RequestId;
use serde::Deserialize;
use serde_json::json;

use crate::app_state::AppState;
use crate::auth_middleware::{
    apply_rate_limit_headers, enforce_rate_limit, process_request,
};
use crate::cache::CacheClass;
use crate::downstream::{fallback_payload, DownstreamError, MarketDataKind};
use crate::rate_limiter::RateDecision;

fn respond(body: serde_json::Value, rate: &RateDecision) -> Response {
    let mut response = Json(body).into_response();
    apply_rate_limit_headers(&mut response, rate);
    response
}

/// Shared path for the five reference/time-series routes: rate limit,
/// authenticate, authorise, cache lookup, downstream fetch under the breaker,
/// cache store.
async fn market_data_endpoint(
    state: AppState,
    request_id: RequestId,
    headers: HeaderMap,
    path: &str,
    kind: MarketDataKind,
    resource: &str,
) -> ApiResult<Response> {
    let rate = enforce_rate_limit(&state, &headers, path, request_id).await?;
    let user = process_request(&state, &headers, resource, "read", request_id).await?;

    let class = kind.cache_class();
    if let Some(cached) = state
        .cache
        .get(class, &user.tenant_id, &user.user_id, "all")
        .await
    {
        state.metrics.record_cache(class.name(), true);
        return Ok(respond(
            json!({
                kind.name(): cached,
                "cached": true,
                "user": user.user_id,
                "tenant": user.tenant_id,
            }),
            &rate,
        ));
    }
    state.metrics.record_cache(class.name(), false);

    match state.market.fetch(kind, &user.tenant_id).await {
        Ok(data) => {
            state
                .cache
                .set(class, &user.tenant_id, &user.user_id, "all", &data)
                .await;
            Ok(respond(
                json!({
                    kind.name(): data,
                    "cached": false,
                    "user": user.user_id,
                    "tenant": user.tenant_id,
                }),
                &rate,
            ))
        }
        Err(DownstreamError::Open(service)) => match fallback_payload(kind) {
            Some(payload) => Ok(respond(payload, &rate)),
            None => Err(ApiError::from(DownstreamError::Open(service))
                .with_trace_id(request_id.0)),
        },
        Err(err) => Err(ApiError::from(err).with_trace_id(request_id.0)),
    }
}

pub async fn get_instruments(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    market_data_endpoint(
        state,
        request_id,
        headers,
        "/api/v1/instruments",
        MarketDataKind::Instruments,
        "instrument",
    )
    .await
}

pub async fn get_curves(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    market_data_endpoint(
        state,
        request_id,
        headers,
        "/api/v1/curves",
        MarketDataKind::Curves,
        "curve",
    )
    .await
}

pub async fn get_products(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    market_data_endpoint(
        state,
        request_id,
        headers,
        "/api/v1/products",
        MarketDataKind::Products,
        "product",
    )
    .await
}

pub async fn get_pricing(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    market_data_endpoint(
        state,
        request_id,
        headers,
        "/api/v1/pricing",
        MarketDataKind::Pricing,
        "pricing",
    )
    .await
}

pub async fn get_historical(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    market_data_endpoint(
        state,
        request_id,
        headers,
        "/api/v1/historical",
        MarketDataKind::Historical,
        "historical",
    )
    .await
}

/// Static fallbacks stay routable so operators can eyeball the degraded
/// payloads directly.
pub async fn instruments_fallback() -> Json<serde_json::Value> {
    Json(fallback_payload(MarketDataKind::Instruments).expect("instruments fallback registered"))
}

pub async fn curves_fallback() -> Json<serde_json::Value> {
    Json(fallback_payload(MarketDataKind::Curves).expect("curves fallback registered"))
}

pub async fn get_served_latest_price(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Path(instrument_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let rate = enforce_rate_limit(
        &state,
        &headers,
        "/api/v1/served/latest-price",
        request_id,
    )
    .await?;
    let instrument = instrument_id.to_uppercase();
    let user = process_request(&state, &headers, "market_data", "read", request_id).await?;

    if let Some(cached) = state
        .cache
        .get(
            CacheClass::ServedLatestPrice,
            &user.tenant_id,
            &user.user_id,
            &instrument,
        )
        .await
    {
        state
            .metrics
            .record_cache(CacheClass::ServedLatestPrice.name(), true);
        return Ok(respond(
            json!({
                "projection": cached,
                "cached": true,
                "instrument_id": instrument,
                "tenant": user.tenant_id,
            }),
            &rate,
        ));
    }
    state
        .metrics
        .record_cache(CacheClass::ServedLatestPrice.name(), false);

    let projection = state
        .served
        .latest_price(&user.tenant_id, &instrument)
        .await
        .map_err(|err| ApiError::from(err).with_trace_id(request_id.0))?
        .ok_or_else(|| {
            ApiError::not_found("Served latest price not found").with_trace_id(request_id.0)
        })?;

    state
        .cache
        .set(
            CacheClass::ServedLatestPrice,
            &user.tenant_id,
            &user.user_id,
            &instrument,
            &projection,
        )
        .await;

    Ok(respond(
        json!({
            "projection": projection,
            "cached": false,
            "instrument_id": instrument,
            "tenant": user.tenant_id,
        }),
        &rate,
    ))
}

#[derive(Deserialize)]
pub struct SnapshotParams {
    pub horizon: Option<String>,
}

pub async fn get_served_curve_snapshot(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Path(instrument_id): Path<String>,
    Query(params): Query<SnapshotParams>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let rate = enforce_rate_limit(
        &state,
        &headers,
        "/api/v1/served/curve-snapshots",
        request_id,
    )
    .await?;
    let instrument = instrument_id.to_uppercase();
    let horizon = params
        .horizon
        .ok_or_else(|| {
            ApiError::validation("horizon query parameter is required")
                .with_trace_id(request_id.0)
        })?
        .to_lowercase();
    let user = process_request(&state, &headers, "market_data", "read", request_id).await?;

    let logical = format!("{instrument}:{horizon}");
    if let Some(cached) = state
        .cache
        .get(
            CacheClass::ServedCurveSnapshot,
            &user.tenant_id,
            &user.user_id,
            &logical,
        )
        .await
    {
        state
            .metrics
            .record_cache(CacheClass::ServedCurveSnapshot.name(), true);
        return Ok(respond(
            json!({
                "projection": cached,
                "cached": true,
                "instrument_id": instrument,
                "tenant": user.tenant_id,
                "horizon": horizon,
            }),
            &rate,
        ));
    }
    state
        .metrics
        .record_cache(CacheClass::ServedCurveSnapshot.name(), false);

    let projection = state
        .served
        .curve_snapshot(&user.tenant_id, &instrument, &horizon)
        .await
        .map_err(|err| ApiError::from(err).with_trace_id(request_id.0))?
        .ok_or_else(|| {
            ApiError::not_found("Served curve snapshot not found").with_trace_id(request_id.0)
        })?;

    state
        .cache
        .set(
            CacheClass::ServedCurveSnapshot,
            &user.tenant_id,
            &user.user_id,
            &logical,
            &projection,
        )
        .await;

    Ok(respond(
        json!({
            "projection": projection,
            "cached": false,
            "instrument_id": instrument,
            "tenant": user.tenant_id,
            "horizon": horizon,
        }),
        &rate,
    ))
}

pub async fn get_served_custom_projection(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Path((projection_type, instrument_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let rate =
        enforce_rate_limit(&state, &headers, "/api/v1/served/custom", request_id).await?;
    let instrument = instrument_id.to_uppercase();
    let projection_type = projection_type.to_lowercase();
    let user = process_request(&state, &headers, "market_data", "read", request_id).await?;

    let logical = format!("{projection_type}:{instrument}");
    if let Some(cached) = state
        .cache
        .get(
            CacheClass::ServedCustomProjection,
            &user.tenant_id,
            &user.user_id,
            &logical,
        )
        .await
    {
        state
            .metrics
            .record_cache(CacheClass::ServedCustomProjection.name(), true);
        return Ok(respond(
            json!({
                "projection": cached,
                "cached": true,
                "instrument_id": instrument,
                "tenant": user.tenant_id,
                "projection_type": projection_type,
            }),
            &rate,
        ));
    }
    state
        .metrics
        .record_cache(CacheClass::ServedCustomProjection.name(), false);

    let projection = state
        .served
        .custom_projection(&user.tenant_id, &projection_type, &instrument)
        .await
        .map_err(|err| ApiError::from(err).with_trace_id(request_id.0))?
        .ok_or_else(|| {
            ApiError::not_found("Served custom projection not found").with_trace_id(request_id.0)
        })?;

    state
        .cache
        .set(
            CacheClass::ServedCustomProjection,
            &user.tenant_id,
            &user.user_id,
            &logical,
            &projection,
        )
        .await;

    Ok(respond(
        json!({
            "projection": projection,
            "cached": false,
            "instrument_id": instrument,
            "tenant": user.tenant_id,
            "projection_type": projection_type,
        }),
        &rate,
    ))
}
