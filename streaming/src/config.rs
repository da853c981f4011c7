use std::env;

use anyhow::Result;

#[derive(Debug, Clone)]
pub struct StreamingConfig {
    pub host: String,
    pub port: u16,
    pub jwks_url: Option<String>,
    pub jwt_issuer: Option<String>,
    pub jwt_audience: Option<String>,
    pub jwks_ttl_seconds: u64,
    pub rule_store_dsn: Option<String>,
    pub kafka_bootstrap: String,
    pub kafka_group_id: String,
    pub max_ws_connections: usize,
    pub max_sse_connections: usize,
    pub heartbeat_timeout_seconds: u64,
    pub queue_capacity: usize,
    pub topics_json: Option<String>,
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<T>().ok())
        .unwrap_or(default)
}

impl StreamingConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env_parse("PORT", 8001),
            jwks_url: env::var("ACCESS_JWKS_URL").ok(),
            jwt_issuer: env::var("ACCESS_JWKS_ISSUER").ok(),
            jwt_audience: env::var("ACCESS_JWKS_AUDIENCE").ok(),
            jwks_ttl_seconds: env_parse("JWKS_CACHE_TTL_SECONDS", 3600),
            rule_store_dsn: env::var("RULE_STORE_DSN").ok(),
            kafka_bootstrap: env::var("KAFKA_BOOTSTRAP")
                .unwrap_or_else(|_| "localhost:9092".to_string()),
            kafka_group_id: env::var("KAFKA_GROUP_ID")
                .unwrap_or_else(|_| "streaming-service".to_string()),
            max_ws_connections: env_parse("MAX_WS_CONNECTIONS", 5000),
            max_sse_connections: env_parse("MAX_SSE_CONNECTIONS", 1000),
            heartbeat_timeout_seconds: env_parse("WS_HEARTBEAT_TIMEOUT_SECONDS", 30).max(1),
            queue_capacity: env_parse("CONNECTION_QUEUE_CAPACITY", 1000).max(1),
            topics_json: env::var("STREAMING_TOPICS_JSON").ok(),
        })
    }
}
