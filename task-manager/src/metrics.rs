use anyhow::Result;
use axum::response::Response;
use common_observability::{render_metrics, HttpMetrics};
use prometheus::{IntCounterVec, Opts, Registry};

#[derive(Clone)]
pub struct WorkflowMetrics {
    registry: Registry,
    pub http: HttpMetrics,
    workflow_events: IntCounterVec,
}

impl WorkflowMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let http = HttpMetrics::register(&registry, "task-manager")?;
        let workflow_events = IntCounterVec::new(
            Opts::new("task_workflow_events_total", "Workflow events by action"),
            &["action"],
        )?;
        registry.register(Box::new(workflow_events.clone()))?;
        Ok(Self {
            registry,
            http,
            workflow_events,
        })
    }

    pub fn record_event(&self, action: &str) {
        self.workflow_events.with_label_values(&[action]).inc();
    }

    pub fn render(&self) -> Result<Response> {
        Ok(render_metrics(&self.registry)?)
    }
}
