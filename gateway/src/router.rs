use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::http::{
    header::{ACCEPT, CONTENT_TYPE},
    HeaderName, HeaderValue, Method,
};
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use common_auth::{ApiKeyTable, JwksCache, JwksFetcher, JwtConfig, TokenIssuer, TokenVerifier, UserTable};
use common_entitlements::{EntitlementEngine, MemoryRuleStore, PgRuleStore, RuleStore};
use common_observability::{http_metrics_middleware, request_id_middleware};
use serde::Serialize;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{info, warn};

use crate::app_state::AppState;
use crate::cache::{CacheManager, MemoryCacheStore, RedisCacheStore};
use crate::circuit_breaker::{BreakerConfig, CircuitBreakerManager};
use crate::config::GatewayConfig;
use crate::downstream::{DownstreamWarmLoader, MarketDataClient, ServedDataClient};
use crate::handlers::{admin, auth, data, system};
use crate::metrics::GatewayMetrics;
use crate::rate_limiter::{
    MemoryRateLimiter, RateLimitCategories, RateLimiter, RedisRateLimiter,
};
use crate::warmer::{CacheWarmer, HotQueryCatalog};

/// Assemble the dependency struct from configuration. Redis-backed stores are
/// used when REDIS_URL is set, the in-memory twins otherwise; the same split
/// applies to the rule store.
pub async fn build_state(config: GatewayConfig) -> Result<AppState> {
    let config = Arc::new(config);

    let jwks_url = config
        .jwks_url
        .clone()
        .unwrap_or_else(|| "http://127.0.0.1:9/jwks".to_string());
    let jwks = JwksCache::new(
        JwksFetcher::new(jwks_url),
        Duration::from_secs(config.jwks_ttl_seconds),
    );
    let mut jwt_config = JwtConfig::new().with_leeway(config.jwt_leeway_seconds);
    if let Some(issuer) = &config.jwt_issuer {
        jwt_config = jwt_config.with_issuer(issuer.clone());
    }
    if let Some(audience) = &config.jwt_audience {
        jwt_config = jwt_config.with_audience(audience.clone());
    }
    let verifier = Arc::new(TokenVerifier::new(jwt_config, jwks));

    let issuer = match &config.signing_key_pem {
        Some(pem) => {
            let users = match &config.auth_users_json {
                Some(raw) => UserTable::from_json(raw)
                    .context("AUTH_USERS_JSON failed to parse")?,
                None => UserTable::default(),
            };
            let issuer = TokenIssuer::new(
                config.signing_kid.clone(),
                pem.as_bytes(),
                config.jwt_issuer.clone(),
                config.jwt_audience.clone(),
                users,
            )
            .context("failed to construct token issuer")?;
            warn!("JWT_DEV_PRIVATE_KEY_PEM configured; do not enable in production");
            Some(Arc::new(issuer))
        }
        None => None,
    };

    let api_keys = Arc::new(match &config.api_keys_json {
        Some(raw) => ApiKeyTable::from_json(raw).context("GATEWAY_API_KEYS_JSON failed to parse")?,
        None => ApiKeyTable::dev_defaults(),
    });

    let rule_store: Arc<dyn RuleStore> = match &config.rule_store_dsn {
        Some(dsn) => Arc::new(
            PgRuleStore::connect(dsn)
                .await
                .map_err(|err| anyhow::anyhow!("rule store: {err}"))?,
        ),
        None => Arc::new(MemoryRuleStore::new()),
    };
    let entitlements = Arc::new(EntitlementEngine::new(rule_store));

    let categories = RateLimitCategories::new(&config.rate_limit_overrides);
    let rate_limiter = match &config.redis_url {
        Some(url) => {
            let engine = RedisRateLimiter::connect(url, "gateway:rate").await?;
            Arc::new(RateLimiter::new(
                Arc::new(engine),
                categories,
                config.rate_limit_window_seconds,
            ))
        }
        None => Arc::new(RateLimiter::new(
            Arc::new(MemoryRateLimiter::new()),
            categories,
            config.rate_limit_window_seconds,
        )),
    };

    let cache = match &config.redis_url {
        Some(url) => {
            let store = RedisCacheStore::connect(url, "gateway:cache").await?;
            Arc::new(CacheManager::new(Box::new(store), &config.cache_ttl_overrides))
        }
        None => Arc::new(CacheManager::new(
            Box::new(MemoryCacheStore::new()),
            &config.cache_ttl_overrides,
        )),
    };

    let breakers = Arc::new(CircuitBreakerManager::new(BreakerConfig {
        failure_threshold: config.breaker_failure_threshold,
        cooldown: Duration::from_secs(config.breaker_cooldown_seconds),
        success_threshold: config.breaker_success_threshold,
    }));

    let http_client = reqwest::Client::builder()
        .build()
        .context("Failed to build HTTP client")?;
    let served = Arc::new(ServedDataClient::new(
        config.served_data_url.clone(),
        http_client.clone(),
        &breakers,
    ));
    let market = Arc::new(MarketDataClient::new(
        config.market_data_url.clone(),
        http_client,
        &breakers,
    ));

    let catalog = HotQueryCatalog::load(config.hot_queries_path.as_deref());
    let warmer = Arc::new(CacheWarmer::new(
        catalog,
        Arc::new(DownstreamWarmLoader {
            market: market.clone(),
            served: served.clone(),
        }),
        config.cache_warm_concurrency,
    ));

    let metrics = Arc::new(GatewayMetrics::new().map_err(|err| anyhow::anyhow!("{err}"))?);

    Ok(AppState {
        config,
        verifier,
        issuer,
        api_keys,
        entitlements,
        rate_limiter,
        cache,
        warmer,
        breakers,
        served,
        market,
        metrics,
    })
}

/// Background refresh of the JWKS cache, mirroring its TTL policy.
pub fn spawn_jwks_refresh(state: &AppState) {
    let jwks = state.verifier.jwks().clone();
    let interval_secs = state.config.jwks_refresh_seconds;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match jwks.refresh().await {
                Ok(count) => info!(count, "refreshed JWKS keys"),
                Err(err) => warn!(error = %err, "failed to refresh JWKS keys"),
            }
        }
    });
}

pub fn build_router(state: AppState) -> Router {
    let allowed_origins = [
        "http://localhost:3000",
        "http://localhost:5173",
    ];
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(
            allowed_origins
                .iter()
                .filter_map(|origin| origin.parse::<HeaderValue>().ok())
                .collect::<Vec<_>>(),
        ))
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            ACCEPT,
            CONTENT_TYPE,
            HeaderName::from_static("authorization"),
            HeaderName::from_static("x-api-key"),
            HeaderName::from_static("x-request-id"),
        ]);

    Router::new()
        .route("/", get(system::root))
        .route("/health", get(system::health))
        .route("/healthz", get(system::health))
        .route("/metrics", get(system::metrics_endpoint))
        .route("/api/v1/status", get(system::api_status))
        .route("/auth/verify", post(auth::verify_token))
        .route("/auth/refresh", post(auth::refresh_token))
        .route("/auth/logout", post(auth::logout))
        .route("/api/v1/instruments", get(data::get_instruments))
        .route("/api/v1/instruments/fallback", get(data::instruments_fallback))
        .route("/api/v1/curves", get(data::get_curves))
        .route("/api/v1/curves/fallback", get(data::curves_fallback))
        .route("/api/v1/products", get(data::get_products))
        .route("/api/v1/pricing", get(data::get_pricing))
        .route("/api/v1/historical", get(data::get_historical))
        .route(
            "/api/v1/served/latest-price/:instrument_id",
            get(data::get_served_latest_price),
        )
        .route(
            "/api/v1/served/curve-snapshots/:instrument_id",
            get(data::get_served_curve_snapshot),
        )
        .route(
            "/api/v1/served/custom/:projection_type/:instrument_id",
            get(data::get_served_custom_projection),
        )
        .route("/api/v1/cache/warm", post(admin::warm_cache))
        .route("/api/v1/cache/stats", get(admin::cache_stats))
        .route("/api/v1/cache/catalog", get(admin::cache_catalog))
        .route("/api/v1/circuit-breakers", get(admin::circuit_breakers))
        .route("/api/v1/rate-limits", get(admin::rate_limits))
        .route("/api/v1/rate-limits/reset", post(admin::reset_rate_limit))
        .route("/api/v1/metadata/routes", get(admin::metadata_routes))
        .route(
            "/api/v1/entitlements/rules",
            get(admin::list_rules).post(admin::create_rule),
        )
        .route(
            "/api/v1/entitlements/rules/:rule_id",
            get(admin::get_rule).put(admin::update_rule).delete(admin::delete_rule),
        )
        .layer(middleware::from_fn_with_state(
            state.metrics.http.clone(),
            http_metrics_middleware,
        ))
        .layer(middleware::from_fn(request_id_middleware))
        .layer(cors)
        .with_state(state)
}

#[derive(Debug, Clone, Serialize)]
pub struct RouteMeta {
    pub path: &'static str,
    pub methods: &'static [&'static str],
    pub name: &'static str,
}

/// Static route metadata for the discovery endpoint, sorted by path.
pub fn route_metadata() -> Vec<RouteMeta> {
    let mut routes = vec![
        RouteMeta { path: "/", methods: &["GET"], name: "root" },
        RouteMeta { path: "/health", methods: &["GET"], name: "health" },
        RouteMeta { path: "/healthz", methods: &["GET"], name: "health" },
        RouteMeta { path: "/metrics", methods: &["GET"], name: "metrics" },
        RouteMeta { path: "/api/v1/status", methods: &["GET"], name: "api_status" },
        RouteMeta { path: "/auth/verify", methods: &["POST"], name: "verify_token" },
        RouteMeta { path: "/auth/refresh", methods: &["POST"], name: "refresh_token" },
        RouteMeta { path: "/auth/logout", methods: &["POST"], name: "logout" },
        RouteMeta { path: "/api/v1/instruments", methods: &["GET"], name: "get_instruments" },
        RouteMeta { path: "/api/v1/instruments/fallback", methods: &["GET"], name: "instruments_fallback" },
        RouteMeta { path: "/api/v1/curves", methods: &["GET"], name: "get_curves" },
        RouteMeta { path: "/api/v1/curves/fallback", methods: &["GET"], name: "curves_fallback" },
        RouteMeta { path: "/api/v1/products", methods: &["GET"], name: "get_products" },
        RouteMeta { path: "/api/v1/pricing", methods: &["GET"], name: "get_pricing" },
        RouteMeta { path: "/api/v1/historical", methods: &["GET"], name: "get_historical" },
        RouteMeta { path: "/api/v1/served/latest-price/{instrument_id}", methods: &["GET"], name: "get_served_latest_price" },
        RouteMeta { path: "/api/v1/served/curve-snapshots/{instrument_id}", methods: &["GET"], name: "get_served_curve_snapshot" },
        RouteMeta { path: "/api/v1/served/custom/{projection_type}/{instrument_id}", methods: &["GET"], name: "get_served_custom_projection" },
        RouteMeta { path: "/api/v1/cache/warm", methods: &["POST"], name: "warm_cache" },
        RouteMeta { path: "/api/v1/cache/stats", methods: &["GET"], name: "cache_stats" },
        RouteMeta { path: "/api/v1/cache/catalog", methods: &["GET"], name: "cache_catalog" },
        RouteMeta { path: "/api/v1/circuit-breakers", methods: &["GET"], name: "circuit_breakers" },
        RouteMeta { path: "/api/v1/rate-limits", methods: &["GET"], name: "rate_limits" },
        RouteMeta { path: "/api/v1/rate-limits/reset", methods: &["POST"], name: "reset_rate_limit" },
        RouteMeta { path: "/api/v1/metadata/routes", methods: &["GET"], name: "metadata_routes" },
        RouteMeta { path: "/api/v1/entitlements/rules", methods: &["GET", "POST"], name: "rules" },
        RouteMeta { path: "/api/v1/entitlements/rules/{rule_id}", methods: &["GET", "PUT", "DELETE"], name: "rule" },
    ];
    routes.sort_by(|a, b| a.path.cmp(b.path));
    routes
}
