use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use common_http_errors::ApiError;
use reqwest::Client;
use serde_json::{json, Value};

use crate::cache::CacheClass;
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerManager};
use crate::warmer::WarmLoader;

pub const SERVED_DATA_SERVICE: &str = "served-data";
pub const MARKET_DATA_SERVICE: &str = "market-data";

const DATA_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum DownstreamError {
    #[error("circuit breaker for '{0}' is open")]
    Open(String),
    #[error("{service} unreachable: {message}")]
    Unreachable { service: String, message: String },
    #[error("{service} returned HTTP {status}")]
    Status { service: String, status: u16 },
}

impl From<DownstreamError> for ApiError {
    fn from(value: DownstreamError) -> Self {
        match value {
            DownstreamError::Open(service) => {
                ApiError::external(service, "temporarily unavailable", true)
            }
            DownstreamError::Unreachable { service, message } => {
                ApiError::external(service, message, true)
            }
            DownstreamError::Status { service, status } => {
                ApiError::external(service, format!("HTTP {status}"), false)
            }
        }
    }
}

/// Shared request path: breaker admission, the call with a deadline, one
/// retry on transient failure, outcome recording.
async fn guarded_get(
    client: &Client,
    breaker: &Arc<CircuitBreaker>,
    service: &str,
    url: &str,
) -> Result<Option<Value>, DownstreamError> {
    breaker
        .try_acquire()
        .map_err(|_| DownstreamError::Open(service.to_string()))?;

    let mut last_error = None;
    for attempt in 0..2 {
        match client.get(url).timeout(DATA_TIMEOUT).send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    breaker.record_success();
                    let value = response.json::<Value>().await.map_err(|err| {
                        DownstreamError::Unreachable {
                            service: service.to_string(),
                            message: err.to_string(),
                        }
                    })?;
                    return Ok(Some(value));
                }
                if status.as_u16() == 404 {
                    breaker.record_success();
                    return Ok(None);
                }
                if status.is_server_error() {
                    last_error = Some(DownstreamError::Status {
                        service: service.to_string(),
                        status: status.as_u16(),
                    });
                    if attempt == 0 {
                        continue;
                    }
                    breaker.record_failure();
                    return Err(last_error.unwrap());
                }
                // Downstream 4xx is an application error, not a breaker event.
                breaker.record_success();
                return Err(DownstreamError::Status {
                    service: service.to_string(),
                    status: status.as_u16(),
                });
            }
            Err(err) => {
                last_error = Some(DownstreamError::Unreachable {
                    service: service.to_string(),
                    message: err.to_string(),
                });
                if attempt == 0 {
                    continue;
                }
                breaker.record_failure();
                return Err(last_error.unwrap());
            }
        }
    }
    Err(last_error.unwrap_or(DownstreamError::Unreachable {
        service: service.to_string(),
        message: "unknown".into(),
    }))
}

/// Client for the served-projection downstream. Without a configured URL it
/// synthesises development payloads so the edge runs self-contained.
pub struct ServedDataClient {
    base_url: Option<String>,
    client: Client,
    breaker: Arc<CircuitBreaker>,
}

impl ServedDataClient {
    pub fn new(base_url: Option<String>, client: Client, breakers: &CircuitBreakerManager) -> Self {
        Self {
            base_url,
            client,
            breaker: breakers.get(SERVED_DATA_SERVICE),
        }
    }

    pub async fn latest_price(
        &self,
        tenant_id: &str,
        instrument_id: &str,
    ) -> Result<Option<Value>, DownstreamError> {
        match &self.base_url {
            Some(base) => {
                let url = format!("{base}/served/latest-price/{instrument_id}?tenant={tenant_id}");
                guarded_get(&self.client, &self.breaker, SERVED_DATA_SERVICE, &url).await
            }
            None => Ok(Some(json!({
                "instrument_id": instrument_id,
                "price": 52.5,
                "currency": "USD",
                "as_of": Utc::now().to_rfc3339(),
            }))),
        }
    }

    pub async fn curve_snapshot(
        &self,
        tenant_id: &str,
        instrument_id: &str,
        horizon: &str,
    ) -> Result<Option<Value>, DownstreamError> {
        match &self.base_url {
            Some(base) => {
                let url = format!(
                    "{base}/served/curve-snapshots/{instrument_id}?tenant={tenant_id}&horizon={horizon}"
                );
                guarded_get(&self.client, &self.breaker, SERVED_DATA_SERVICE, &url).await
            }
            None => Ok(Some(json!({
                "instrument_id": instrument_id,
                "horizon": horizon,
                "points": [
                    {"tenor": "1M", "value": 51.8},
                    {"tenor": "3M", "value": 52.1},
                    {"tenor": "6M", "value": 52.9},
                ],
                "as_of": Utc::now().to_rfc3339(),
            }))),
        }
    }

    pub async fn custom_projection(
        &self,
        tenant_id: &str,
        projection_type: &str,
        instrument_id: &str,
    ) -> Result<Option<Value>, DownstreamError> {
        match &self.base_url {
            Some(base) => {
                let url = format!(
                    "{base}/served/custom/{projection_type}/{instrument_id}?tenant={tenant_id}"
                );
                guarded_get(&self.client, &self.breaker, SERVED_DATA_SERVICE, &url).await
            }
            None => Ok(Some(json!({
                "instrument_id": instrument_id,
                "projection_type": projection_type,
                "value": 52.5,
                "as_of": Utc::now().to_rfc3339(),
            }))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketDataKind {
    Instruments,
    Curves,
    Products,
    Pricing,
    Historical,
}

impl MarketDataKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Instruments => "instruments",
            Self::Curves => "curves",
            Self::Products => "products",
            Self::Pricing => "pricing",
            Self::Historical => "historical",
        }
    }

    pub fn cache_class(&self) -> CacheClass {
        match self {
            Self::Instruments => CacheClass::Instruments,
            Self::Curves => CacheClass::Curves,
            Self::Products => CacheClass::Products,
            Self::Pricing => CacheClass::Pricing,
            Self::Historical => CacheClass::Historical,
        }
    }
}

/// Reference lists served when no market-data downstream is configured.
pub fn builtin_dataset(kind: MarketDataKind) -> Value {
    match kind {
        MarketDataKind::Instruments => json!([
            {"id": "EURUSD", "name": "Euro/US Dollar", "type": "forex"},
            {"id": "GBPUSD", "name": "British Pound/US Dollar", "type": "forex"},
            {"id": "USDJPY", "name": "US Dollar/Japanese Yen", "type": "forex"},
        ]),
        MarketDataKind::Curves => json!([
            {"id": "USD_CURVE", "name": "USD Yield Curve", "currency": "USD"},
            {"id": "EUR_CURVE", "name": "EUR Yield Curve", "currency": "EUR"},
            {"id": "GBP_CURVE", "name": "GBP Yield Curve", "currency": "GBP"},
        ]),
        MarketDataKind::Products => json!([
            {"id": "BRN", "name": "Brent Crude", "category": "energy"},
            {"id": "WTI", "name": "West Texas Intermediate", "category": "energy"},
            {"id": "TTF", "name": "Dutch TTF Gas", "category": "energy"},
        ]),
        MarketDataKind::Pricing => json!([
            {"instrument": "BRN", "price": 52.5, "currency": "USD"},
            {"instrument": "WTI", "price": 48.9, "currency": "USD"},
        ]),
        MarketDataKind::Historical => json!([
            {"instrument": "BRN", "date": "2026-07-30", "close": 52.1},
            {"instrument": "BRN", "date": "2026-07-31", "close": 52.5},
        ]),
    }
}

/// Static payloads served while the downstream recovers, marked so callers
/// can tell them from live data.
pub fn fallback_payload(kind: MarketDataKind) -> Option<Value> {
    let data = match kind {
        MarketDataKind::Instruments => json!([
            {"id": "EURUSD", "name": "Euro/US Dollar (Cached)", "type": "forex"},
            {"id": "GBPUSD", "name": "British Pound/US Dollar (Cached)", "type": "forex"},
            {"id": "USDJPY", "name": "US Dollar/Japanese Yen (Cached)", "type": "forex"},
        ]),
        MarketDataKind::Curves => json!([
            {"id": "USD_CURVE", "name": "USD Yield Curve (Cached)", "currency": "USD"},
            {"id": "EUR_CURVE", "name": "EUR Yield Curve (Cached)", "currency": "EUR"},
            {"id": "GBP_CURVE", "name": "GBP Yield Curve (Cached)", "currency": "GBP"},
        ]),
        _ => return None,
    };
    Some(json!({
        kind.name(): data,
        "fallback": true,
        "message": "Service temporarily unavailable, showing cached data",
    }))
}

pub struct MarketDataClient {
    base_url: Option<String>,
    client: Client,
    breaker: Arc<CircuitBreaker>,
}

impl MarketDataClient {
    pub fn new(base_url: Option<String>, client: Client, breakers: &CircuitBreakerManager) -> Self {
        Self {
            base_url,
            client,
            breaker: breakers.get(MARKET_DATA_SERVICE),
        }
    }

    pub async fn fetch(
        &self,
        kind: MarketDataKind,
        tenant_id: &str,
    ) -> Result<Value, DownstreamError> {
        match &self.base_url {
            Some(base) => {
                let url = format!("{base}/api/v1/{}?tenant={tenant_id}", kind.name());
                let value = guarded_get(&self.client, &self.breaker, MARKET_DATA_SERVICE, &url)
                    .await?
                    .ok_or(DownstreamError::Status {
                        service: MARKET_DATA_SERVICE.to_string(),
                        status: 404,
                    })?;
                Ok(value)
            }
            None => Ok(builtin_dataset(kind)),
        }
    }
}

/// Hot-query loader backed by the downstream clients.
pub struct DownstreamWarmLoader {
    pub market: Arc<MarketDataClient>,
    pub served: Arc<ServedDataClient>,
}

#[async_trait]
impl WarmLoader for DownstreamWarmLoader {
    async fn load(
        &self,
        class: CacheClass,
        tenant_id: &str,
        _user_id: &str,
        params: &Value,
    ) -> Result<(String, Value)> {
        let instrument = params
            .get("instrument")
            .and_then(Value::as_str)
            .unwrap_or("BRN")
            .to_uppercase();

        match class {
            CacheClass::Instruments => Ok((
                "all".to_string(),
                self.market.fetch(MarketDataKind::Instruments, tenant_id).await?,
            )),
            CacheClass::Curves => Ok((
                "all".to_string(),
                self.market.fetch(MarketDataKind::Curves, tenant_id).await?,
            )),
            CacheClass::Products => Ok((
                "all".to_string(),
                self.market.fetch(MarketDataKind::Products, tenant_id).await?,
            )),
            CacheClass::Pricing => Ok((
                "all".to_string(),
                self.market.fetch(MarketDataKind::Pricing, tenant_id).await?,
            )),
            CacheClass::Historical => Ok((
                "all".to_string(),
                self.market.fetch(MarketDataKind::Historical, tenant_id).await?,
            )),
            CacheClass::ServedLatestPrice => {
                let value = self
                    .served
                    .latest_price(tenant_id, &instrument)
                    .await?
                    .ok_or_else(|| anyhow::anyhow!("no projection for {instrument}"))?;
                Ok((instrument, value))
            }
            CacheClass::ServedCurveSnapshot => {
                let horizon = params
                    .get("horizon")
                    .and_then(Value::as_str)
                    .unwrap_or("1m")
                    .to_lowercase();
                let value = self
                    .served
                    .curve_snapshot(tenant_id, &instrument, &horizon)
                    .await?
                    .ok_or_else(|| anyhow::anyhow!("no snapshot for {instrument}"))?;
                Ok((format!("{instrument}:{horizon}"), value))
            }
            CacheClass::ServedCustomProjection => {
                let projection_type = params
                    .get("projection_type")
                    .and_then(Value::as_str)
                    .unwrap_or("volatility")
                    .to_lowercase();
                let value = self
                    .served
                    .custom_projection(tenant_id, &projection_type, &instrument)
                    .await?
                    .ok_or_else(|| anyhow::anyhow!("no projection for {instrument}"))?;
                Ok((format!("{projection_type}:{instrument}"), value))
            }
        }
    }
}

