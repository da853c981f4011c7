use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RftpStatus {
    Draft,
    Submitted,
    UnderReview,
    Approved,
    Rejected,
}

impl RftpStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Submitted => "submitted",
            Self::UnderReview => "under_review",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Draft,
    Proposed,
    Accepted,
    InProgress,
    Completed,
    Cancelled,
    Terminated,
    Rejected,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Proposed => "proposed",
            Self::Accepted => "accepted",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Terminated => "terminated",
            Self::Rejected => "rejected",
        }
    }

    pub fn all() -> [TaskStatus; 8] {
        [
            Self::Draft,
            Self::Proposed,
            Self::Accepted,
            Self::InProgress,
            Self::Completed,
            Self::Cancelled,
            Self::Terminated,
            Self::Rejected,
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    IrpAnalysis,
    RpsCompliance,
    GhgAssessment,
    ReliabilityStudy,
    DerProgram,
    TransmissionPlanning,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IrpAnalysis => "irp_analysis",
            Self::RpsCompliance => "rps_compliance",
            Self::GhgAssessment => "ghg_assessment",
            Self::ReliabilityStudy => "reliability_study",
            Self::DerProgram => "der_program",
            Self::TransmissionPlanning => "transmission_planning",
        }
    }
}

/// Intake document of the workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RftpRequest {
    pub title: String,
    pub description: String,
    pub task_type: TaskType,
    pub jurisdiction: String,
    pub estimated_hours: u32,
    pub budget_ceiling: f64,
    pub requested_by: String,
    #[serde(default = "default_priority")]
    pub priority: String,
    #[serde(default)]
    pub due_date: Option<String>,
}

fn default_priority() -> String {
    "medium".to_string()
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub event: String,
    pub timestamp: DateTime<Utc>,
    pub metadata: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct RftpRecord {
    pub rftp_id: String,
    pub request: RftpRequest,
    pub status: RftpStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub history: Vec<HistoryEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposalRequest {
    pub proposal_id: String,
    pub rftp_id: String,
    pub proposed_hours: u32,
    pub proposed_budget: f64,
    pub proposed_deliverables: Vec<String>,
    #[serde(default)]
    pub proposed_timeline: HashMap<String, String>,
    pub technical_approach: String,
    #[serde(default)]
    pub assumptions: Vec<String>,
    #[serde(default)]
    pub risks: Vec<String>,
    pub created_by: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProposalRecord {
    pub proposal: ProposalRequest,
    pub task_id: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskApproval {
    pub approved_by: String,
    pub approved_budget: f64,
    pub approved_hours: u32,
    #[serde(default)]
    pub conditions: Vec<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskStart {
    pub assigned_to: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskProgress {
    #[serde(default)]
    pub progress_percentage: Option<i64>,
    #[serde(default)]
    pub spent_hours: Option<f64>,
    #[serde(default)]
    pub spent_budget: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskCompletion {
    #[serde(default)]
    pub artifacts: Vec<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub task_id: String,
    pub proposal_id: String,
    pub rftp_id: String,
    pub title: String,
    pub description: String,
    pub task_type: TaskType,
    pub jurisdiction: String,
    pub status: TaskStatus,
    pub assigned_to: Option<String>,
    pub budget: f64,
    pub hours: u32,
    pub deliverables: Vec<String>,
    pub timeline: HashMap<String, String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub progress_percentage: i64,
    pub spent_hours: f64,
    pub spent_budget: f64,
    pub due_date: Option<String>,
    pub artifacts: Vec<Value>,
    pub workflow_history: Vec<HistoryEntry>,
    pub last_event_at: Option<DateTime<Utc>>,
}

impl Task {
    /// At-risk: still active while spent budget exceeds 90% of approved.
    pub fn at_risk(&self) -> bool {
        matches!(self.status, TaskStatus::Accepted | TaskStatus::InProgress)
            && self.budget > 0.0
            && self.spent_budget > self.budget * 0.9
    }
}

/// One entry of the process-wide rolling event buffer.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowEvent {
    pub timestamp: DateTime<Utc>,
    pub entity_type: &'static str,
    pub entity_id: String,
    pub action: String,
    pub metadata: Value,
}
