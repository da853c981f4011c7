use std::sync::Arc;
use std::time::Duration;

use common_auth::{JwksCache, JwksFetcher, JwtConfig, TokenVerifier};
use common_entitlements::{
    ConditionOperator, Effect, EntitlementEngine, MemoryRuleStore, RuleCondition, RuleDraft,
};
use serde_json::json;
use streaming::app_state::StreamingState;
use streaming::bus::{BusConsumer, ChannelBusSource};
use streaming::config::StreamingConfig;
use streaming::metrics::StreamingMetrics;
use streaming::registry::ConnectionRegistry;
use streaming::topics::TopicTable;

pub struct FabricOptions {
    pub max_connections: usize,
    pub queue_capacity: usize,
    pub heartbeat_timeout: Duration,
}

impl Default for FabricOptions {
    fn default() -> Self {
        Self {
            max_connections: 100,
            queue_capacity: 8,
            heartbeat_timeout: Duration::from_secs(30),
        }
    }
}

fn test_config() -> StreamingConfig {
    StreamingConfig {
        host: "127.0.0.1".into(),
        port: 0,
        jwks_url: None,
        jwt_issuer: None,
        jwt_audience: None,
        jwks_ttl_seconds: 3600,
        rule_store_dsn: None,
        kafka_bootstrap: "localhost:9092".into(),
        kafka_group_id: "test".into(),
        max_ws_connections: 100,
        max_sse_connections: 100,
        heartbeat_timeout_seconds: 30,
        queue_capacity: 8,
        topics_json: None,
    }
}

pub async fn fabric(options: FabricOptions) -> StreamingState {
    let metrics = Arc::new(StreamingMetrics::new().expect("metrics"));
    let registry = Arc::new(ConnectionRegistry::new(
        options.max_connections,
        options.heartbeat_timeout,
        options.queue_capacity,
        metrics.clone(),
    ));
    let (source, sender) = ChannelBusSource::new();
    let consumer = Arc::new(BusConsumer::new(
        Arc::new(source),
        registry.clone(),
        metrics.clone(),
    ));

    let entitlements = Arc::new(EntitlementEngine::new(Arc::new(MemoryRuleStore::new())));
    let jwks = JwksCache::new(
        JwksFetcher::new("http://127.0.0.1:9/jwks"),
        Duration::from_secs(3600),
    );
    let verifier = Arc::new(TokenVerifier::new(JwtConfig::new(), jwks));

    StreamingState {
        config: Arc::new(test_config()),
        verifier,
        entitlements,
        registry,
        consumer,
        topics: Arc::new(TopicTable::defaults()),
        metrics,
        bus_injector: Some(sender),
    }
}

/// Allow `read` on `market_data` for tenant `t1` subscribers with the user
/// role, mirroring the entitlement topics map to.
pub async fn seed_market_data_rule(state: &StreamingState, tenant: &str) {
    state
        .entitlements
        .create_rule(RuleDraft {
            name: "stream market data".into(),
            description: None,
            resource: "market_data".into(),
            effect: Effect::Allow,
            conditions: vec![RuleCondition {
                field: "topic".into(),
                operator: ConditionOperator::StartsWith,
                value: json!("pricing."),
                description: None,
            }],
            priority: 100,
            enabled: true,
            tenant_id: Some(tenant.to_string()),
            user_id: None,
            expires_at: None,
        })
        .await
        .expect("seed rule");
}
