use anyhow::Result;
use axum::response::Response;
use common_observability::{render_metrics, HttpMetrics};
use prometheus::{IntCounterVec, IntGaugeVec, Opts, Registry};

use crate::registry::Transport;

fn transport_label(transport: Transport) -> &'static str {
    match transport {
        Transport::Ws => "ws",
        Transport::Sse => "sse",
    }
}

#[derive(Clone)]
pub struct StreamingMetrics {
    registry: Registry,
    pub http: HttpMetrics,
    active_connections: IntGaugeVec,
    messages_enqueued: IntCounterVec,
    messages_dropped: IntCounterVec,
    bus_messages: IntCounterVec,
}

impl StreamingMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let http = HttpMetrics::register(&registry, "streaming")?;

        let active_connections = IntGaugeVec::new(
            Opts::new("streaming_active_connections", "Open connections"),
            &["transport"],
        )?;
        let messages_enqueued = IntCounterVec::new(
            Opts::new(
                "streaming_messages_enqueued_total",
                "Messages enqueued to subscriber queues",
            ),
            &["transport"],
        )?;
        let messages_dropped = IntCounterVec::new(
            Opts::new(
                "streaming_messages_dropped_total",
                "Messages dropped due to full subscriber queues",
            ),
            &["transport"],
        )?;
        let bus_messages = IntCounterVec::new(
            Opts::new("streaming_bus_messages_total", "Bus messages consumed"),
            &["topic"],
        )?;

        registry.register(Box::new(active_connections.clone()))?;
        registry.register(Box::new(messages_enqueued.clone()))?;
        registry.register(Box::new(messages_dropped.clone()))?;
        registry.register(Box::new(bus_messages.clone()))?;

        Ok(Self {
            registry,
            http,
            active_connections,
            messages_enqueued,
            messages_dropped,
            bus_messages,
        })
    }

    pub fn connection_opened(&self, transport: Transport) {
        self.active_connections
            .with_label_values(&[transport_label(transport)])
            .inc();
    }

    pub fn connection_closed(&self, transport: Transport) {
        self.active_connections
            .with_label_values(&[transport_label(transport)])
            .dec();
    }

    pub fn message_enqueued(&self, transport: Transport) {
        self.messages_enqueued
            .with_label_values(&[transport_label(transport)])
            .inc();
    }

    pub fn message_dropped(&self, transport: Transport) {
        self.messages_dropped
            .with_label_values(&[transport_label(transport)])
            .inc();
    }

    pub fn bus_message(&self, topic: &str) {
        self.bus_messages.with_label_values(&[topic]).inc();
    }

    pub fn render(&self) -> Result<Response> {
        Ok(render_metrics(&self.registry)?)
    }
}
