use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use common_http_errors::ApiError;
use serde_json::{json, Value};
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use crate::metrics::WorkflowMetrics;
use crate::model::{
    HistoryEntry, ProposalRecord, ProposalRequest, RftpRecord, RftpRequest, RftpStatus, Task,
    TaskApproval, TaskCompletion, TaskProgress, TaskStart, TaskStatus, WorkflowEvent,
};

const EVENT_BUFFER_CAPACITY: usize = 200;
const BUDGET_ALERT_THRESHOLD: f64 = 0.8;

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("RFTP not found")]
    RftpNotFound,
    #[error("Proposal not found")]
    ProposalNotFound,
    #[error("Task not found")]
    TaskNotFound,
    #[error("Proposal already exists")]
    ProposalExists,
    #[error("{0}")]
    IllegalTransition(String),
    #[error("{0}")]
    Validation(String),
}

impl From<WorkflowError> for ApiError {
    fn from(value: WorkflowError) -> Self {
        match value {
            WorkflowError::RftpNotFound
            | WorkflowError::ProposalNotFound
            | WorkflowError::TaskNotFound => ApiError::not_found(value.to_string()),
            WorkflowError::ProposalExists => ApiError::conflict(value.to_string()),
            WorkflowError::IllegalTransition(message) | WorkflowError::Validation(message) => {
                ApiError::validation(message)
            }
        }
    }
}

pub type WorkflowResult<T> = Result<T, WorkflowError>;

/// State machine and event log for the RFTP → proposal → task lifecycle.
/// Tables are in-memory with single-writer discipline per id; every state
/// change appends history and lands in the rolling telemetry buffer.
pub struct WorkflowEngine {
    rftps: RwLock<HashMap<String, RftpRecord>>,
    proposals: RwLock<HashMap<String, ProposalRecord>>,
    tasks: RwLock<HashMap<String, Task>>,
    events: Mutex<VecDeque<WorkflowEvent>>,
    metrics: Arc<WorkflowMetrics>,
}

impl WorkflowEngine {
    pub fn new(metrics: Arc<WorkflowMetrics>) -> Self {
        Self {
            rftps: RwLock::new(HashMap::new()),
            proposals: RwLock::new(HashMap::new()),
            tasks: RwLock::new(HashMap::new()),
            events: Mutex::new(VecDeque::with_capacity(EVENT_BUFFER_CAPACITY)),
            metrics,
        }
    }

    async fn emit_event(
        &self,
        entity_type: &'static str,
        entity_id: &str,
        action: &str,
        metadata: Value,
        timestamp: DateTime<Utc>,
    ) {
        let event = WorkflowEvent {
            timestamp,
            entity_type,
            entity_id: entity_id.to_string(),
            action: action.to_string(),
            metadata,
        };
        {
            let mut events = self.events.lock().await;
            if events.len() >= EVENT_BUFFER_CAPACITY {
                events.pop_front();
            }
            events.push_back(event);
        }
        self.metrics.record_event(action);
        info!(entity_type, entity_id, action, "workflow event");
    }

    pub async fn recent_events(&self, limit: usize) -> Vec<WorkflowEvent> {
        let events = self.events.lock().await;
        events.iter().rev().take(limit).rev().cloned().collect()
    }

    // ---------------- RFTP ----------------

    pub async fn create_rftp(&self, request: RftpRequest) -> WorkflowResult<RftpRecord> {
        if request.title.trim().is_empty() {
            return Err(WorkflowError::Validation("title is required".into()));
        }
        let now = Utc::now();
        let rftp_id = Uuid::new_v4().to_string();
        let mut record = RftpRecord {
            rftp_id: rftp_id.clone(),
            request,
            status: RftpStatus::Draft,
            created_at: now,
            updated_at: now,
            history: Vec::new(),
        };
        // Intake submits immediately; draft exists only as the initial state.
        record.status = RftpStatus::Submitted;
        record.history.push(HistoryEntry {
            event: RftpStatus::Submitted.as_str().to_string(),
            timestamp: now,
            metadata: json!({
                "requested_by": record.request.requested_by,
                "task_type": record.request.task_type.as_str(),
            }),
        });
        self.rftps.write().await.insert(rftp_id.clone(), record.clone());
        self.emit_event(
            "rftp",
            &rftp_id,
            "rftp_submitted",
            json!({"task_type": record.request.task_type.as_str()}),
            now,
        )
        .await;
        Ok(record)
    }

    async fn set_rftp_status(
        &self,
        rftp_id: &str,
        status: RftpStatus,
        metadata: Value,
        timestamp: DateTime<Utc>,
    ) -> WorkflowResult<()> {
        {
            let mut rftps = self.rftps.write().await;
            let record = rftps.get_mut(rftp_id).ok_or(WorkflowError::RftpNotFound)?;
            record.status = status;
            record.updated_at = timestamp;
            record.history.push(HistoryEntry {
                event: status.as_str().to_string(),
                timestamp,
                metadata: metadata.clone(),
            });
        }
        self.emit_event(
            "rftp",
            rftp_id,
            &format!("rftp_{}", status.as_str()),
            metadata,
            timestamp,
        )
        .await;
        Ok(())
    }

    pub async fn get_rftp(&self, rftp_id: &str) -> WorkflowResult<RftpRecord> {
        self.rftps
            .read()
            .await
            .get(rftp_id)
            .cloned()
            .ok_or(WorkflowError::RftpNotFound)
    }

    pub async fn list_rftps(
        &self,
        status: Option<&str>,
        task_type: Option<&str>,
    ) -> Vec<RftpRecord> {
        let rftps = self.rftps.read().await;
        let mut records: Vec<RftpRecord> = rftps
            .values()
            .filter(|record| {
                status
                    .map(|wanted| record.status.as_str() == wanted)
                    .unwrap_or(true)
                    && task_type
                        .map(|wanted| record.request.task_type.as_str() == wanted)
                        .unwrap_or(true)
            })
            .cloned()
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        records
    }

    // ---------------- Proposals ----------------

    /// Accepting a proposal instantiates the task in `proposed` and moves the
    /// RFTP under review.
    pub async fn submit_proposal(&self, proposal: ProposalRequest) -> WorkflowResult<Task> {
        if proposal.rftp_id.trim().is_empty() {
            return Err(WorkflowError::Validation(
                "Proposal must include rftp_id".into(),
            ));
        }
        if self.proposals.read().await.contains_key(&proposal.proposal_id) {
            return Err(WorkflowError::ProposalExists);
        }
        let rftp = self.get_rftp(&proposal.rftp_id).await?;

        let now = Utc::now();
        let task_id = Uuid::new_v4().to_string();
        let task = Task {
            task_id: task_id.clone(),
            proposal_id: proposal.proposal_id.clone(),
            rftp_id: proposal.rftp_id.clone(),
            title: rftp.request.title.clone(),
            description: rftp.request.description.clone(),
            task_type: rftp.request.task_type,
            jurisdiction: rftp.request.jurisdiction.clone(),
            status: TaskStatus::Proposed,
            assigned_to: None,
            budget: proposal.proposed_budget,
            hours: proposal.proposed_hours,
            deliverables: proposal.proposed_deliverables.clone(),
            timeline: proposal.proposed_timeline.clone(),
            created_by: proposal.created_by.clone(),
            created_at: now,
            approved_at: None,
            started_at: None,
            completed_at: None,
            progress_percentage: 0,
            spent_hours: 0.0,
            spent_budget: 0.0,
            due_date: rftp.request.due_date.clone(),
            artifacts: Vec::new(),
            workflow_history: Vec::new(),
            last_event_at: None,
        };
        self.tasks.write().await.insert(task_id.clone(), task);

        self.append_task_history(
            &task_id,
            "task_created",
            json!({
                "proposal_id": proposal.proposal_id,
                "task_type": rftp.request.task_type.as_str(),
            }),
            now,
        )
        .await?;
        self.append_task_history(
            &task_id,
            "task_status_proposed",
            json!({"proposal_id": proposal.proposal_id}),
            now,
        )
        .await?;

        self.proposals.write().await.insert(
            proposal.proposal_id.clone(),
            ProposalRecord {
                proposal: proposal.clone(),
                task_id: task_id.clone(),
                status: "submitted".to_string(),
                created_at: now,
            },
        );
        self.emit_event(
            "proposal",
            &proposal.proposal_id,
            "proposal_submitted",
            json!({"task_id": task_id, "rftp_id": proposal.rftp_id}),
            now,
        )
        .await;

        self.set_rftp_status(
            &proposal.rftp_id,
            RftpStatus::UnderReview,
            json!({"proposal_id": proposal.proposal_id}),
            now,
        )
        .await?;

        self.get_task(&task_id).await
    }

    pub async fn get_proposal(&self, proposal_id: &str) -> WorkflowResult<ProposalRecord> {
        self.proposals
            .read()
            .await
            .get(proposal_id)
            .cloned()
            .ok_or(WorkflowError::ProposalNotFound)
    }

    // ---------------- Tasks ----------------

    pub async fn get_task(&self, task_id: &str) -> WorkflowResult<Task> {
        self.tasks
            .read()
            .await
            .get(task_id)
            .cloned()
            .ok_or(WorkflowError::TaskNotFound)
    }

    pub async fn list_tasks(
        &self,
        status: Option<&str>,
        task_type: Option<&str>,
        assigned_to: Option<&str>,
    ) -> Vec<Task> {
        let tasks = self.tasks.read().await;
        let mut records: Vec<Task> = tasks
            .values()
            .filter(|task| {
                status
                    .map(|wanted| task.status.as_str() == wanted)
                    .unwrap_or(true)
                    && task_type
                        .map(|wanted| task.task_type.as_str() == wanted)
                        .unwrap_or(true)
                    && assigned_to
                        .map(|wanted| task.assigned_to.as_deref() == Some(wanted))
                        .unwrap_or(true)
            })
            .cloned()
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        records
    }

    async fn append_task_history(
        &self,
        task_id: &str,
        action: &str,
        metadata: Value,
        timestamp: DateTime<Utc>,
    ) -> WorkflowResult<()> {
        {
            let mut tasks = self.tasks.write().await;
            let task = tasks.get_mut(task_id).ok_or(WorkflowError::TaskNotFound)?;
            task.workflow_history.push(HistoryEntry {
                event: action.to_string(),
                timestamp,
                metadata: metadata.clone(),
            });
            task.last_event_at = Some(timestamp);
        }
        self.emit_event("task", task_id, action, metadata, timestamp).await;
        Ok(())
    }

    async fn set_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        metadata: Value,
        timestamp: DateTime<Utc>,
    ) -> WorkflowResult<()> {
        {
            let mut tasks = self.tasks.write().await;
            let task = tasks.get_mut(task_id).ok_or(WorkflowError::TaskNotFound)?;
            task.status = status;
        }
        self.append_task_history(
            task_id,
            &format!("task_status_{}", status.as_str()),
            metadata,
            timestamp,
        )
        .await
    }

    pub async fn approve(&self, task_id: &str, approval: TaskApproval) -> WorkflowResult<Task> {
        let now = Utc::now();
        let rftp_id = {
            let mut tasks = self.tasks.write().await;
            let task = tasks.get_mut(task_id).ok_or(WorkflowError::TaskNotFound)?;
            if !matches!(task.status, TaskStatus::Proposed | TaskStatus::Draft) {
                return Err(WorkflowError::IllegalTransition(
                    "Task cannot be approved from current status".into(),
                ));
            }
            task.budget = approval.approved_budget;
            task.hours = approval.approved_hours;
            task.approved_at = Some(now);
            task.rftp_id.clone()
        };

        {
            let mut proposals = self.proposals.write().await;
            if let Some(record) = proposals
                .values_mut()
                .find(|record| record.task_id == task_id)
            {
                record.status = "approved".to_string();
            }
        }

        self.set_rftp_status(
            &rftp_id,
            RftpStatus::Approved,
            json!({"task_id": task_id}),
            now,
        )
        .await?;
        self.set_task_status(
            task_id,
            TaskStatus::Accepted,
            json!({"approved_by": approval.approved_by}),
            now,
        )
        .await?;

        self.get_task(task_id).await
    }

    pub async fn start(&self, task_id: &str, start: TaskStart) -> WorkflowResult<Task> {
        if start.assigned_to.trim().is_empty() {
            return Err(WorkflowError::Validation("assigned_to is required".into()));
        }
        let now = Utc::now();
        {
            let mut tasks = self.tasks.write().await;
            let task = tasks.get_mut(task_id).ok_or(WorkflowError::TaskNotFound)?;
            if task.status != TaskStatus::Accepted {
                return Err(WorkflowError::IllegalTransition(
                    "Task must be accepted before starting".into(),
                ));
            }
            task.assigned_to = Some(start.assigned_to.clone());
            task.started_at = Some(now);
        }
        self.set_task_status(
            task_id,
            TaskStatus::InProgress,
            json!({"assigned_to": start.assigned_to}),
            now,
        )
        .await?;
        self.get_task(task_id).await
    }

    pub async fn update_progress(
        &self,
        task_id: &str,
        progress: TaskProgress,
    ) -> WorkflowResult<Task> {
        let now = Utc::now();
        let (updates, budget_alert) = {
            let mut tasks = self.tasks.write().await;
            let task = tasks.get_mut(task_id).ok_or(WorkflowError::TaskNotFound)?;
            if task.status != TaskStatus::InProgress {
                return Err(WorkflowError::IllegalTransition(
                    "Task must be in progress to record progress".into(),
                ));
            }

            let mut updates = serde_json::Map::new();
            if let Some(value) = progress.progress_percentage {
                task.progress_percentage = value.clamp(0, 100);
                updates.insert("progress_percentage".into(), json!(task.progress_percentage));
            }
            if let Some(value) = progress.spent_hours {
                task.spent_hours = value.max(0.0);
                updates.insert("spent_hours".into(), json!(task.spent_hours));
            }
            if let Some(value) = progress.spent_budget {
                task.spent_budget = value.max(0.0);
                updates.insert("spent_budget".into(), json!(task.spent_budget));
            }

            let budget_alert = task.budget > 0.0
                && task.spent_budget >= task.budget * BUDGET_ALERT_THRESHOLD;
            if budget_alert {
                warn!(
                    task_id,
                    spent = task.spent_budget,
                    budget = task.budget,
                    "budget utilization alert"
                );
            }
            (
                Value::Object(updates),
                budget_alert.then(|| (task.spent_budget, task.budget)),
            )
        };

        self.append_task_history(task_id, "task_progress_updated", updates, now)
            .await?;
        if let Some((spent, budget)) = budget_alert {
            self.append_task_history(
                task_id,
                "task_budget_alert",
                json!({"spent_budget": spent, "budget": budget}),
                now,
            )
            .await?;
        }
        self.get_task(task_id).await
    }

    pub async fn complete(
        &self,
        task_id: &str,
        completion: TaskCompletion,
    ) -> WorkflowResult<Task> {
        let now = Utc::now();
        let artifact_count = completion.artifacts.len();
        {
            let mut tasks = self.tasks.write().await;
            let task = tasks.get_mut(task_id).ok_or(WorkflowError::TaskNotFound)?;
            if task.status != TaskStatus::InProgress {
                return Err(WorkflowError::IllegalTransition(
                    "Task must be in progress to complete".into(),
                ));
            }
            task.completed_at = Some(now);
            task.progress_percentage = 100;
            task.artifacts = completion.artifacts;
        }
        self.append_task_history(
            task_id,
            "task_completed",
            json!({"artifact_count": artifact_count}),
            now,
        )
        .await?;
        self.set_task_status(task_id, TaskStatus::Completed, json!({"complete": true}), now)
            .await?;
        self.get_task(task_id).await
    }

    pub async fn reject(&self, task_id: &str, reason: Option<String>) -> WorkflowResult<Task> {
        self.terminal_transition(
            task_id,
            TaskStatus::Proposed,
            TaskStatus::Rejected,
            reason,
            "Task can only be rejected while proposed",
        )
        .await
    }

    pub async fn cancel(&self, task_id: &str, reason: Option<String>) -> WorkflowResult<Task> {
        self.terminal_transition(
            task_id,
            TaskStatus::Accepted,
            TaskStatus::Cancelled,
            reason,
            "Task can only be cancelled while accepted",
        )
        .await
    }

    pub async fn terminate(&self, task_id: &str, reason: Option<String>) -> WorkflowResult<Task> {
        self.terminal_transition(
            task_id,
            TaskStatus::InProgress,
            TaskStatus::Terminated,
            reason,
            "Task can only be terminated while in progress",
        )
        .await
    }

    async fn terminal_transition(
        &self,
        task_id: &str,
        from: TaskStatus,
        to: TaskStatus,
        reason: Option<String>,
        message: &str,
    ) -> WorkflowResult<Task> {
        let now = Utc::now();
        {
            let tasks = self.tasks.read().await;
            let task = tasks.get(task_id).ok_or(WorkflowError::TaskNotFound)?;
            if task.status != from {
                return Err(WorkflowError::IllegalTransition(message.to_string()));
            }
        }
        self.set_task_status(task_id, to, json!({"reason": reason}), now)
            .await?;
        self.get_task(task_id).await
    }

    // ---------------- Telemetry dashboard ----------------

    pub async fn dashboard(&self) -> Value {
        let tasks = self.tasks.read().await;
        let rftps = self.rftps.read().await;
        let proposals = self.proposals.read().await;

        let total_tasks = tasks.len();
        let count_status = |status: TaskStatus| {
            tasks.values().filter(|task| task.status == status).count()
        };
        let completed_tasks = count_status(TaskStatus::Completed);
        let in_progress_tasks = count_status(TaskStatus::InProgress);
        let accepted_tasks = count_status(TaskStatus::Accepted);
        let total_budget: f64 = tasks.values().map(|task| task.budget).sum();
        let spent_budget: f64 = tasks.values().map(|task| task.spent_budget).sum();

        let mut budget_by_type: HashMap<&'static str, (f64, f64)> = HashMap::new();
        for task in tasks.values() {
            let bucket = budget_by_type.entry(task.task_type.as_str()).or_insert((0.0, 0.0));
            bucket.0 += task.budget;
            bucket.1 += task.spent_budget;
        }
        let budget_by_type: HashMap<&'static str, Value> = budget_by_type
            .into_iter()
            .map(|(key, (budget, spent))| (key, json!({"budget": budget, "spent": spent})))
            .collect();

        let status_distribution: HashMap<&'static str, usize> = TaskStatus::all()
            .into_iter()
            .map(|status| (status.as_str(), count_status(status)))
            .collect();

        let at_risk_tasks: Vec<Value> = tasks
            .values()
            .filter(|task| task.at_risk())
            .map(|task| {
                json!({
                    "task_id": task.task_id,
                    "status": task.status.as_str(),
                    "progress_percentage": task.progress_percentage,
                    "spent_budget": task.spent_budget,
                    "budget": task.budget,
                })
            })
            .collect();

        drop(tasks);
        let recent_events = self.recent_events(10).await;

        json!({
            "summary": {
                "total_tasks": total_tasks,
                "completed_tasks": completed_tasks,
                "in_progress_tasks": in_progress_tasks,
                "completion_rate": if total_tasks > 0 {
                    completed_tasks as f64 / total_tasks as f64
                } else {
                    0.0
                },
                "total_budget": total_budget,
                "spent_budget": spent_budget,
                "budget_utilization": if total_budget > 0.0 {
                    spent_budget / total_budget
                } else {
                    0.0
                },
            },
            "budget_by_type": budget_by_type,
            "status_distribution": status_distribution,
            "workflow_funnel": {
                "rftps_submitted": rftps.len(),
                "proposals_active": proposals.len(),
                "tasks_accepted": accepted_tasks,
                "tasks_in_progress": in_progress_tasks,
                "tasks_completed": completed_tasks,
            },
            "recent_events": recent_events,
            "at_risk_tasks": at_risk_tasks,
        })
    }
}
