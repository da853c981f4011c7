use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info};

use crate::metrics::StreamingMetrics;
use crate::registry::ConnectionRegistry;

#[derive(Debug, Clone)]
pub struct BusMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Value,
    pub timestamp: Option<i64>,
}

/// The message-bus boundary. The Kafka implementation sits behind the
/// `kafka` feature; the channel source backs tests and single-node runs.
#[async_trait]
pub trait BusSource: Send + Sync {
    async fn subscribe(&self, topic: &str) -> Result<()>;
    /// Wait briefly for the next batch; an empty vec means the wait timed out.
    async fn poll(&self) -> Result<Vec<BusMessage>>;
}

// ---------------- In-process channel source ----------------

pub struct ChannelBusSource {
    receiver: Mutex<mpsc::Receiver<BusMessage>>,
    topics: Mutex<HashSet<String>>,
}

impl ChannelBusSource {
    pub fn new() -> (Self, mpsc::Sender<BusMessage>) {
        let (sender, receiver) = mpsc::channel(1024);
        (
            Self {
                receiver: Mutex::new(receiver),
                topics: Mutex::new(HashSet::new()),
            },
            sender,
        )
    }
}

#[async_trait]
impl BusSource for ChannelBusSource {
    async fn subscribe(&self, topic: &str) -> Result<()> {
        self.topics.lock().await.insert(topic.to_string());
        Ok(())
    }

    async fn poll(&self) -> Result<Vec<BusMessage>> {
        let mut receiver = self.receiver.lock().await;
        let mut batch = Vec::new();
        match tokio::time::timeout(Duration::from_millis(250), receiver.recv()).await {
            Ok(Some(message)) => {
                batch.push(message);
                // Drain whatever else is already queued.
                while let Ok(message) = receiver.try_recv() {
                    batch.push(message);
                    if batch.len() >= 100 {
                        break;
                    }
                }
            }
            Ok(None) => anyhow::bail!("bus channel closed"),
            Err(_) => {}
        }
        Ok(batch)
    }
}

// ---------------- Kafka source (feature-gated) ----------------

#[cfg(feature = "kafka")]
pub mod kafka {
    use super::*;
    use rdkafka::consumer::{Consumer, StreamConsumer};
    use rdkafka::{ClientConfig, Message};

    pub struct KafkaBusSource {
        consumer: StreamConsumer,
        topics: Mutex<Vec<String>>,
    }

    impl KafkaBusSource {
        pub fn connect(bootstrap: &str, group_id: &str) -> Result<Self> {
            let consumer: StreamConsumer = ClientConfig::new()
                .set("bootstrap.servers", bootstrap)
                .set("group.id", group_id)
                .set("auto.offset.reset", "latest")
                .set("enable.auto.commit", "true")
                .set("session.timeout.ms", "30000")
                .set("heartbeat.interval.ms", "10000")
                .create()?;
            Ok(Self {
                consumer,
                topics: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl BusSource for KafkaBusSource {
        async fn subscribe(&self, topic: &str) -> Result<()> {
            let mut topics = self.topics.lock().await;
            if !topics.iter().any(|existing| existing == topic) {
                topics.push(topic.to_string());
            }
            let refs: Vec<&str> = topics.iter().map(String::as_str).collect();
            self.consumer.subscribe(&refs)?;
            Ok(())
        }

        async fn poll(&self) -> Result<Vec<BusMessage>> {
            match tokio::time::timeout(Duration::from_secs(1), self.consumer.recv()).await {
                Ok(Ok(message)) => {
                    let payload = message
                        .payload()
                        .and_then(|bytes| serde_json::from_slice::<Value>(bytes).ok())
                        .unwrap_or(Value::Null);
                    Ok(vec![BusMessage {
                        topic: message.topic().to_string(),
                        partition: message.partition(),
                        offset: message.offset(),
                        key: message
                            .key()
                            .map(|bytes| String::from_utf8_lossy(bytes).to_string()),
                        payload,
                        timestamp: message.timestamp().to_millis(),
                    }])
                }
                Ok(Err(err)) => Err(err.into()),
                Err(_) => Ok(Vec::new()),
            }
        }
    }
}

// ---------------- Consumer loop ----------------

/// Long-running poll loop that multiplexes bus messages into per-connection
/// queues. Topic subscription is lazy and idempotent; the mutex ensures only
/// one consumer-subscribe call per topic is ever in flight.
pub struct BusConsumer {
    source: Arc<dyn BusSource>,
    registry: Arc<ConnectionRegistry>,
    metrics: Arc<StreamingMetrics>,
    subscribed: Mutex<HashSet<String>>,
}

impl BusConsumer {
    pub fn new(
        source: Arc<dyn BusSource>,
        registry: Arc<ConnectionRegistry>,
        metrics: Arc<StreamingMetrics>,
    ) -> Self {
        Self {
            source,
            registry,
            metrics,
            subscribed: Mutex::new(HashSet::new()),
        }
    }

    pub async fn ensure_subscribed(&self, topic: &str) -> Result<()> {
        let mut subscribed = self.subscribed.lock().await;
        if subscribed.contains(topic) {
            return Ok(());
        }
        self.source.subscribe(topic).await?;
        subscribed.insert(topic.to_string());
        info!(topic, "subscribed to bus topic");
        Ok(())
    }

    pub async fn subscribed_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.subscribed.lock().await.iter().cloned().collect();
        topics.sort();
        topics
    }

    pub async fn dispatch(&self, message: BusMessage) -> usize {
        self.metrics.bus_message(&message.topic);
        let envelope = json!({
            "topic": message.topic,
            "data": message.payload,
            "timestamp": message.timestamp.unwrap_or_else(|| Utc::now().timestamp_millis()),
            "partition": message.partition,
            "offset": message.offset,
        });
        let sent = self.registry.broadcast(&message.topic, &envelope).await;
        debug!(topic = %envelope["topic"], sent, "bus message broadcast");
        sent
    }

    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match self.source.poll().await {
                    Ok(batch) => {
                        for message in batch {
                            self.dispatch(message).await;
                        }
                    }
                    Err(err) => {
                        error!(error = %err, "bus poll failed, backing off");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        })
    }
}
