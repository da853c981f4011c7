use std::collections::HashMap;
use std::env;

use anyhow::Result;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub jwks_url: Option<String>,
    pub jwt_issuer: Option<String>,
    pub jwt_audience: Option<String>,
    pub jwt_leeway_seconds: u32,
    pub jwks_ttl_seconds: u64,
    pub jwks_refresh_seconds: u64,
    pub redis_url: Option<String>,
    pub rule_store_dsn: Option<String>,
    pub served_data_url: Option<String>,
    pub market_data_url: Option<String>,
    pub rate_limit_window_seconds: u64,
    pub rate_limit_overrides: HashMap<String, u32>,
    pub cache_ttl_overrides: HashMap<String, u64>,
    pub hot_queries_path: Option<String>,
    pub cache_warm_concurrency: usize,
    pub api_keys_json: Option<String>,
    pub auth_users_json: Option<String>,
    pub signing_kid: String,
    pub signing_key_pem: Option<String>,
    pub breaker_failure_threshold: u32,
    pub breaker_cooldown_seconds: u64,
    pub breaker_success_threshold: u32,
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<T>().ok())
        .unwrap_or(default)
}

/// "endpoint=limit,endpoint=limit" pairs, e.g. "market_data=600".
fn parse_override_list(raw: &str) -> HashMap<String, u32> {
    raw.split(',')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            Some((key.trim().to_string(), value.trim().parse::<u32>().ok()?))
        })
        .collect()
}

fn parse_ttl_overrides(raw: &str) -> HashMap<String, u64> {
    raw.split(',')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            Some((key.trim().to_string(), value.trim().parse::<u64>().ok()?))
        })
        .collect()
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        let mut rate_limit_overrides = HashMap::new();
        // The market-data endpoint family ships with a raised default.
        rate_limit_overrides.insert("market_data".to_string(), 600);
        if let Ok(raw) = env::var("GATEWAY_RATE_LIMIT_OVERRIDES") {
            rate_limit_overrides.extend(parse_override_list(&raw));
        }

        let cache_ttl_overrides = env::var("GATEWAY_CACHE_TTL_OVERRIDES")
            .map(|raw| parse_ttl_overrides(&raw))
            .unwrap_or_default();

        Ok(Self {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env_parse("PORT", 8000),
            jwks_url: env::var("ACCESS_JWKS_URL").ok(),
            jwt_issuer: env::var("ACCESS_JWKS_ISSUER").ok(),
            jwt_audience: env::var("ACCESS_JWKS_AUDIENCE").ok(),
            jwt_leeway_seconds: env_parse("JWT_LEEWAY_SECONDS", 30),
            jwks_ttl_seconds: env_parse("JWKS_CACHE_TTL_SECONDS", 3600),
            jwks_refresh_seconds: env_parse("JWKS_REFRESH_SECONDS", 300).max(60),
            redis_url: env::var("REDIS_URL").ok(),
            rule_store_dsn: env::var("RULE_STORE_DSN").ok(),
            served_data_url: env::var("PROJECTION_SERVICE_URL").ok(),
            market_data_url: env::var("MARKET_DATA_SERVICE_URL").ok(),
            rate_limit_window_seconds: env_parse("GATEWAY_RATE_LIMIT_WINDOW_SECONDS", 60).max(1),
            rate_limit_overrides,
            cache_ttl_overrides,
            hot_queries_path: env::var("ACCESS_HOT_SERVED_QUERIES_FILE").ok(),
            cache_warm_concurrency: env_parse("CACHE_WARM_CONCURRENCY", 5).max(1),
            api_keys_json: env::var("GATEWAY_API_KEYS_JSON").ok(),
            auth_users_json: env::var("AUTH_USERS_JSON").ok(),
            signing_kid: env::var("JWT_SIGNING_KID").unwrap_or_else(|_| "local-dev".to_string()),
            signing_key_pem: env::var("JWT_DEV_PRIVATE_KEY_PEM").ok(),
            breaker_failure_threshold: env_parse("BREAKER_FAILURE_THRESHOLD", 5),
            breaker_cooldown_seconds: env_parse("BREAKER_COOLDOWN_SECONDS", 30),
            breaker_success_threshold: env_parse("BREAKER_SUCCESS_THRESHOLD", 2),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_list_parses_pairs() {
        let parsed = parse_override_list("market_data=600, bulk=5");
        assert_eq!(parsed.get("market_data"), Some(&600));
        assert_eq!(parsed.get("bulk"), Some(&5));
    }

    #[test]
    fn malformed_pairs_are_skipped() {
        let parsed = parse_override_list("broken,also=bad=pair,ok=10");
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed.get("ok"), Some(&10));
    }
}
