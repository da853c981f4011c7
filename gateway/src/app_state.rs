use std::sync::Arc;

use common_auth::{ApiKeyTable, TokenIssuer, TokenVerifier};
use common_entitlements::EntitlementEngine;

use crate::cache::CacheManager;
use crate::circuit_breaker::CircuitBreakerManager;
use crate::config::GatewayConfig;
use crate::downstream::{MarketDataClient, ServedDataClient};
use crate::metrics::GatewayMetrics;
use crate::rate_limiter::RateLimiter;
use crate::warmer::CacheWarmer;

/// Everything a handler needs, injected once at startup. Caches, the breaker
/// table and the limiter are shared across workers behind their own locks or
/// store-level atomics.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub verifier: Arc<TokenVerifier>,
    pub issuer: Option<Arc<TokenIssuer>>,
    pub api_keys: Arc<ApiKeyTable>,
    pub entitlements: Arc<EntitlementEngine>,
    pub rate_limiter: Arc<RateLimiter>,
    pub cache: Arc<CacheManager>,
    pub warmer: Arc<CacheWarmer>,
    pub breakers: Arc<CircuitBreakerManager>,
    pub served: Arc<ServedDataClient>,
    pub market: Arc<MarketDataClient>,
    pub metrics: Arc<GatewayMetrics>,
}
