#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, Response};
use axum::Router;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{Duration as ChronoDuration, Utc};
use common_auth::{ApiKeyTable, JwksCache, JwksFetcher, JwtConfig, TokenVerifier};
use common_entitlements::{
    ConditionOperator, Effect, EntitlementEngine, MemoryRuleStore, RuleCondition, RuleDraft,
};
use gateway::app_state::AppState;
use gateway::cache::{CacheManager, MemoryCacheStore};
use gateway::circuit_breaker::{BreakerConfig, CircuitBreakerManager};
use gateway::config::GatewayConfig;
use gateway::downstream::{DownstreamWarmLoader, MarketDataClient, ServedDataClient};
use gateway::metrics::GatewayMetrics;
use gateway::rate_limiter::{MemoryRateLimiter, RateLimitCategories, RateLimiter};
use gateway::router::build_router;
use gateway::warmer::{CacheWarmer, HotQueryCatalog};
use http_body_util::BodyExt;
use jsonwebtoken::{encode, Algorithm, DecodingKey, EncodingKey, Header};
use rand_core::OsRng;
use rsa::pkcs1::EncodeRsaPrivateKey;
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use serde_json::{json, Value};
use tower::ServiceExt;

pub struct TestHarness {
    pub state: AppState,
    pub private_pem: String,
    pub kid: String,
}

pub struct TestOptions {
    pub rate_limit_overrides: HashMap<String, u32>,
    pub market_data_url: Option<String>,
    pub breaker: BreakerConfig,
}

impl Default for TestOptions {
    fn default() -> Self {
        Self {
            rate_limit_overrides: HashMap::new(),
            market_data_url: None,
            breaker: BreakerConfig::default(),
        }
    }
}

fn test_config(options: &TestOptions) -> GatewayConfig {
    GatewayConfig {
        host: "127.0.0.1".into(),
        port: 0,
        jwks_url: None,
        jwt_issuer: None,
        jwt_audience: None,
        jwt_leeway_seconds: 30,
        jwks_ttl_seconds: 3600,
        jwks_refresh_seconds: 300,
        redis_url: None,
        rule_store_dsn: None,
        served_data_url: None,
        market_data_url: options.market_data_url.clone(),
        rate_limit_window_seconds: 60,
        rate_limit_overrides: options.rate_limit_overrides.clone(),
        cache_ttl_overrides: HashMap::new(),
        hot_queries_path: None,
        cache_warm_concurrency: 2,
        api_keys_json: None,
        auth_users_json: None,
        signing_kid: "test-key".into(),
        signing_key_pem: None,
        breaker_failure_threshold: options.breaker.failure_threshold,
        breaker_cooldown_seconds: options.breaker.cooldown.as_secs(),
        breaker_success_threshold: options.breaker.success_threshold,
    }
}

pub async fn harness(options: TestOptions) -> TestHarness {
    let mut rng = OsRng;
    let private_key = RsaPrivateKey::new(&mut rng, 2048).expect("rsa keygen");
    let public_key = private_key.to_public_key();
    let n = URL_SAFE_NO_PAD.encode(public_key.n().to_bytes_be());
    let e = URL_SAFE_NO_PAD.encode(public_key.e().to_bytes_be());
    let private_pem = private_key
        .to_pkcs1_pem(rsa::pkcs1::LineEnding::LF)
        .expect("pem")
        .to_string();

    let kid = "test-key".to_string();
    let jwks = JwksCache::new(
        JwksFetcher::new("http://127.0.0.1:9/jwks"),
        Duration::from_secs(3600),
    );
    jwks.seed(
        kid.clone(),
        DecodingKey::from_rsa_components(&n, &e).expect("decoding key"),
    )
    .await;
    let verifier = Arc::new(TokenVerifier::new(JwtConfig::new(), jwks));

    let config = Arc::new(test_config(&options));
    let entitlements = Arc::new(EntitlementEngine::new(Arc::new(MemoryRuleStore::new())));
    let rate_limiter = Arc::new(RateLimiter::new(
        Arc::new(MemoryRateLimiter::new()),
        RateLimitCategories::new(&config.rate_limit_overrides),
        config.rate_limit_window_seconds,
    ));
    let cache = Arc::new(CacheManager::new(
        Box::new(MemoryCacheStore::new()),
        &config.cache_ttl_overrides,
    ));
    let breakers = Arc::new(CircuitBreakerManager::new(options.breaker.clone()));
    let http_client = reqwest::Client::new();
    let served = Arc::new(ServedDataClient::new(None, http_client.clone(), &breakers));
    let market = Arc::new(MarketDataClient::new(
        config.market_data_url.clone(),
        http_client,
        &breakers,
    ));
    let warmer = Arc::new(CacheWarmer::new(
        HotQueryCatalog::default(),
        Arc::new(DownstreamWarmLoader {
            market: market.clone(),
            served: served.clone(),
        }),
        config.cache_warm_concurrency,
    ));
    let metrics = Arc::new(GatewayMetrics::new().expect("metrics"));

    TestHarness {
        state: AppState {
            config,
            verifier,
            issuer: None,
            api_keys: Arc::new(ApiKeyTable::dev_defaults()),
            entitlements,
            rate_limiter,
            cache,
            warmer,
            breakers,
            served,
            market,
            metrics,
        },
        private_pem,
        kid,
    }
}

impl TestHarness {
    pub fn router(&self) -> Router {
        build_router(self.state.clone())
    }

    pub fn token_for(&self, user_id: &str, tenant_id: &str, roles: &[&str]) -> String {
        let claims = json!({
            "sub": user_id,
            "tenant_id": tenant_id,
            "realm_access": {"roles": roles},
            "exp": (Utc::now() + ChronoDuration::minutes(15)).timestamp(),
            "iat": Utc::now().timestamp(),
        });
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(self.kid.clone());
        let key = EncodingKey::from_rsa_pem(self.private_pem.as_bytes()).expect("encoding key");
        encode(&header, &claims, &key).expect("sign token")
    }

    /// Grant `effect` on `resource` for any caller carrying `role`.
    pub async fn seed_role_rule(
        &self,
        tenant: &str,
        resource: &str,
        role: &str,
        effect: Effect,
        priority: i32,
    ) {
        self.state
            .entitlements
            .create_rule(RuleDraft {
                name: format!("{role} {resource}"),
                description: None,
                resource: resource.to_string(),
                effect,
                conditions: vec![RuleCondition {
                    field: "roles".to_string(),
                    operator: ConditionOperator::Contains,
                    value: json!(role),
                    description: None,
                }],
                priority,
                enabled: true,
                tenant_id: Some(tenant.to_string()),
                user_id: None,
                expires_at: None,
            })
            .await
            .expect("seed rule");
    }
}

pub async fn send(router: &Router, request: Request<Body>) -> Response<Body> {
    router.clone().oneshot(request).await.expect("infallible")
}

pub async fn body_json(response: Response<Body>) -> Value {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body collect")
        .to_bytes();
    serde_json::from_slice(&bytes).expect("body is JSON")
}

pub fn get(path: &str) -> Request<Body> {
    Request::builder()
        .uri(path)
        .body(Body::empty())
        .expect("request")
}

pub fn get_bearer(path: &str, token: &str) -> Request<Body> {
    Request::builder()
        .uri(path)
        .header("Authorization", format!("Bearer {token}"))
        .body(Body::empty())
        .expect("request")
}
