use std::env;

use anyhow::Result;

#[derive(Debug, Clone)]
pub struct TaskManagerConfig {
    pub host: String,
    pub port: u16,
    pub jwks_url: Option<String>,
    pub jwt_issuer: Option<String>,
    pub jwt_audience: Option<String>,
    pub jwks_ttl_seconds: u64,
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<T>().ok())
        .unwrap_or(default)
}

impl TaskManagerConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env_parse("PORT", 8002),
            jwks_url: env::var("ACCESS_JWKS_URL").ok(),
            jwt_issuer: env::var("ACCESS_JWKS_ISSUER").ok(),
            jwt_audience: env::var("ACCESS_JWKS_AUDIENCE").ok(),
            jwks_ttl_seconds: env_parse("JWKS_CACHE_TTL_SECONDS", 3600),
        })
    }
}
