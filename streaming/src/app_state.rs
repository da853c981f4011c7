use std::sync::Arc;

use common_auth::TokenVerifier;
use common_entitlements::{CheckRequest, EntitlementEngine};
use serde_json::json;
use tracing::warn;

use tokio::sync::mpsc;

use crate::bus::{BusConsumer, BusMessage};
use crate::config::StreamingConfig;
use crate::metrics::StreamingMetrics;
use crate::registry::{ConnectionEntry, ConnectionRegistry};
use crate::topics::TopicTable;

#[derive(Clone)]
pub struct StreamingState {
    pub config: Arc<StreamingConfig>,
    pub verifier: Arc<TokenVerifier>,
    pub entitlements: Arc<EntitlementEngine>,
    pub registry: Arc<ConnectionRegistry>,
    pub consumer: Arc<BusConsumer>,
    pub topics: Arc<TopicTable>,
    pub metrics: Arc<StreamingMetrics>,
    /// Present when the in-process channel bus is active (kafka feature off);
    /// lets tests and local tooling inject bus messages.
    pub bus_injector: Option<mpsc::Sender<BusMessage>>,
}

impl StreamingState {
    /// Entitlement gate for one topic subscription. Store outages and
    /// evaluation denials both read as "not entitled" here; the caller gets
    /// a per-topic failure rather than a dropped connection.
    pub async fn topic_entitled(&self, entry: &ConnectionEntry, topic: &str) -> bool {
        let Some(info) = self.topics.get(topic) else {
            return false;
        };
        let request = CheckRequest::new(
            entry.user_id.clone(),
            entry.tenant_id.clone(),
            info.resource.clone(),
            info.action.clone(),
        )
        .with_context("topic", json!(topic))
        .with_context("connection_id", json!(entry.id));

        match self.entitlements.check(&request).await {
            Ok(decision) => decision.allowed,
            Err(err) => {
                warn!(error = %err, topic, connection_id = %entry.id, "entitlement check failed");
                false
            }
        }
    }
}
