use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::filter::{payload_matches, FilterMap};
use crate::metrics::StreamingMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    Ws,
    Sse,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("maximum connections ({0}) exceeded")]
    ConnectionLimit(usize),
    #[error("connection '{0}' not found")]
    NotFound(String),
}

pub struct ConnectionEntry {
    pub id: String,
    pub transport: Transport,
    pub user_id: String,
    pub tenant_id: String,
    pub created_at: DateTime<Utc>,
    last_heartbeat: std::sync::RwLock<Instant>,
    sender: mpsc::Sender<Value>,
    subscriptions: std::sync::RwLock<HashMap<String, FilterMap>>,
    pub dropped: AtomicU64,
}

impl ConnectionEntry {
    pub fn touch(&self) {
        let mut guard = self.last_heartbeat.write().expect("heartbeat lock poisoned");
        *guard = Instant::now();
    }

    pub fn heartbeat_age(&self) -> Duration {
        self.last_heartbeat
            .read()
            .expect("heartbeat lock poisoned")
            .elapsed()
    }

    pub fn subscribed_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self
            .subscriptions
            .read()
            .expect("subscriptions lock poisoned")
            .keys()
            .cloned()
            .collect();
        topics.sort();
        topics
    }

    /// Protocol responses share the connection's outbound queue so a single
    /// writer owns the transport.
    pub fn sender_for_protocol(&self) -> &mpsc::Sender<Value> {
        &self.sender
    }

    fn filters_for(&self, topic: &str) -> Option<FilterMap> {
        self.subscriptions
            .read()
            .expect("subscriptions lock poisoned")
            .get(topic)
            .cloned()
    }
}

/// Connection bookkeeping for the streaming fabric: the primary map plus
/// subject, tenant and topic indices, each behind its own lock. Destruction
/// cascades through every index before the id is released.
pub struct ConnectionRegistry {
    max_connections: usize,
    heartbeat_timeout: Duration,
    queue_capacity: usize,
    connections: RwLock<HashMap<String, Arc<ConnectionEntry>>>,
    by_user: RwLock<HashMap<String, HashSet<String>>>,
    by_tenant: RwLock<HashMap<String, HashSet<String>>>,
    by_topic: RwLock<HashMap<String, HashSet<String>>>,
    metrics: Arc<StreamingMetrics>,
}

impl ConnectionRegistry {
    pub fn new(
        max_connections: usize,
        heartbeat_timeout: Duration,
        queue_capacity: usize,
        metrics: Arc<StreamingMetrics>,
    ) -> Self {
        Self {
            max_connections,
            heartbeat_timeout,
            queue_capacity,
            connections: RwLock::new(HashMap::new()),
            by_user: RwLock::new(HashMap::new()),
            by_tenant: RwLock::new(HashMap::new()),
            by_topic: RwLock::new(HashMap::new()),
            metrics,
        }
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Register a connection. The id is handed back only after every index
    /// is updated; the receiver feeds the connection's writer task.
    pub async fn add_connection(
        &self,
        transport: Transport,
        user_id: &str,
        tenant_id: &str,
    ) -> Result<(Arc<ConnectionEntry>, mpsc::Receiver<Value>), RegistryError> {
        {
            let connections = self.connections.read().await;
            if connections.len() >= self.max_connections {
                return Err(RegistryError::ConnectionLimit(self.max_connections));
            }
        }

        let id = Uuid::new_v4().to_string();
        let (sender, receiver) = mpsc::channel(self.queue_capacity);
        let entry = Arc::new(ConnectionEntry {
            id: id.clone(),
            transport,
            user_id: user_id.to_string(),
            tenant_id: tenant_id.to_string(),
            created_at: Utc::now(),
            last_heartbeat: std::sync::RwLock::new(Instant::now()),
            sender,
            subscriptions: std::sync::RwLock::new(HashMap::new()),
            dropped: AtomicU64::new(0),
        });

        self.connections.write().await.insert(id.clone(), entry.clone());
        self.by_user
            .write()
            .await
            .entry(user_id.to_string())
            .or_default()
            .insert(id.clone());
        self.by_tenant
            .write()
            .await
            .entry(tenant_id.to_string())
            .or_default()
            .insert(id.clone());

        self.metrics.connection_opened(transport);
        info!(
            connection_id = %id,
            user_id,
            tenant_id,
            transport = ?transport,
            "connection registered"
        );
        Ok((entry, receiver))
    }

    /// Tear down a connection: every index entry goes before the id is
    /// forgotten, so no topic fan-out can observe a destroyed connection.
    pub async fn remove_connection(&self, connection_id: &str) {
        let Some(entry) = self.connections.write().await.remove(connection_id) else {
            return;
        };

        {
            let mut by_user = self.by_user.write().await;
            if let Some(ids) = by_user.get_mut(&entry.user_id) {
                ids.remove(connection_id);
                if ids.is_empty() {
                    by_user.remove(&entry.user_id);
                }
            }
        }
        {
            let mut by_tenant = self.by_tenant.write().await;
            if let Some(ids) = by_tenant.get_mut(&entry.tenant_id) {
                ids.remove(connection_id);
                if ids.is_empty() {
                    by_tenant.remove(&entry.tenant_id);
                }
            }
        }
        {
            let topics = entry.subscribed_topics();
            let mut by_topic = self.by_topic.write().await;
            for topic in topics {
                if let Some(ids) = by_topic.get_mut(&topic) {
                    ids.remove(connection_id);
                    if ids.is_empty() {
                        by_topic.remove(&topic);
                    }
                }
            }
        }

        self.metrics.connection_closed(entry.transport);
        info!(connection_id, "connection removed");
    }

    pub async fn get(&self, connection_id: &str) -> Option<Arc<ConnectionEntry>> {
        self.connections.read().await.get(connection_id).cloned()
    }

    pub async fn subscribe(
        &self,
        connection_id: &str,
        topic: &str,
        filters: FilterMap,
    ) -> Result<(), RegistryError> {
        let entry = self
            .get(connection_id)
            .await
            .ok_or_else(|| RegistryError::NotFound(connection_id.to_string()))?;
        entry
            .subscriptions
            .write()
            .expect("subscriptions lock poisoned")
            .insert(topic.to_string(), filters);
        self.by_topic
            .write()
            .await
            .entry(topic.to_string())
            .or_default()
            .insert(connection_id.to_string());
        debug!(connection_id, topic, "subscribed");
        Ok(())
    }

    pub async fn unsubscribe(&self, connection_id: &str, topic: &str) -> Result<(), RegistryError> {
        let entry = self
            .get(connection_id)
            .await
            .ok_or_else(|| RegistryError::NotFound(connection_id.to_string()))?;
        entry
            .subscriptions
            .write()
            .expect("subscriptions lock poisoned")
            .remove(topic);
        let mut by_topic = self.by_topic.write().await;
        if let Some(ids) = by_topic.get_mut(topic) {
            ids.remove(connection_id);
            if ids.is_empty() {
                by_topic.remove(topic);
            }
        }
        debug!(connection_id, topic, "unsubscribed");
        Ok(())
    }

    pub async fn touch(&self, connection_id: &str) {
        if let Some(entry) = self.get(connection_id).await {
            entry.touch();
        }
    }

    /// Fan one envelope out to a topic's subscribers. Filters run against the
    /// payload; a full queue drops the message for that subscriber only.
    pub async fn broadcast(&self, topic: &str, envelope: &Value) -> usize {
        let subscriber_ids: Vec<String> = {
            let by_topic = self.by_topic.read().await;
            match by_topic.get(topic) {
                Some(ids) => ids.iter().cloned().collect(),
                None => return 0,
            }
        };

        let payload = envelope.get("data").unwrap_or(envelope);
        let mut sent = 0;
        for connection_id in subscriber_ids {
            let Some(entry) = self.get(&connection_id).await else {
                continue;
            };
            if let Some(filters) = entry.filters_for(topic) {
                if !payload_matches(&filters, payload) {
                    continue;
                }
            }
            match entry.sender.try_send(envelope.clone()) {
                Ok(()) => {
                    sent += 1;
                    self.metrics.message_enqueued(entry.transport);
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    entry.dropped.fetch_add(1, Ordering::Relaxed);
                    self.metrics.message_dropped(entry.transport);
                    warn!(connection_id = %entry.id, topic, "outbound queue full, dropping message");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(connection_id = %entry.id, "send on closed connection");
                }
            }
        }
        sent
    }

    /// One sweep: remove connections whose heartbeat lapsed.
    pub async fn sweep_stale(&self) -> usize {
        let stale: Vec<String> = {
            let connections = self.connections.read().await;
            connections
                .values()
                .filter(|entry| entry.heartbeat_age() > self.heartbeat_timeout)
                .map(|entry| entry.id.clone())
                .collect()
        };
        let count = stale.len();
        for connection_id in stale {
            info!(connection_id, "removing stale connection");
            self.remove_connection(&connection_id).await;
        }
        count
    }

    /// Background sweeper; checks every 10 seconds.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(10));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let swept = registry.sweep_stale().await;
                if swept > 0 {
                    info!(swept, "heartbeat sweep removed stale connections");
                }
            }
        })
    }

    pub async fn connections_for_user(&self, user_id: &str) -> Vec<String> {
        self.by_user
            .read()
            .await
            .get(user_id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn connections_for_tenant(&self, tenant_id: &str) -> Vec<String> {
        self.by_tenant
            .read()
            .await
            .get(tenant_id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn topic_subscribers(&self, topic: &str) -> Vec<String> {
        self.by_topic
            .read()
            .await
            .get(topic)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn stats(&self) -> Value {
        let connections = self.connections.read().await;
        let by_transport = |transport: Transport| {
            connections
                .values()
                .filter(|entry| entry.transport == transport)
                .count()
        };
        let by_topic = self.by_topic.read().await;
        let mut topics: Vec<&String> = by_topic.keys().collect();
        topics.sort();
        json!({
            "total_connections": connections.len(),
            "max_connections": self.max_connections,
            "ws_connections": by_transport(Transport::Ws),
            "sse_connections": by_transport(Transport::Sse),
            "user_connections": self.by_user.read().await.len(),
            "tenant_connections": self.by_tenant.read().await.len(),
            "topic_subscribers": by_topic.len(),
            "topics": topics,
        })
    }
}
