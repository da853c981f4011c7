use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use task_manager::metrics::WorkflowMetrics;
use task_manager::model::{
    ProposalRequest, RftpRequest, TaskApproval, TaskCompletion, TaskProgress, TaskStart,
    TaskStatus, TaskType,
};
use task_manager::workflow::{WorkflowEngine, WorkflowError};

fn engine() -> WorkflowEngine {
    WorkflowEngine::new(Arc::new(WorkflowMetrics::new().expect("metrics")))
}

fn rftp_request() -> RftpRequest {
    RftpRequest {
        title: "IRP portfolio study".into(),
        description: "Analyse the 2030 resource plan".into(),
        task_type: TaskType::IrpAnalysis,
        jurisdiction: "CA".into(),
        estimated_hours: 120,
        budget_ceiling: 15_000.0,
        requested_by: "u1".into(),
        priority: "high".into(),
        due_date: None,
    }
}

fn proposal_for(rftp_id: &str, proposal_id: &str) -> ProposalRequest {
    ProposalRequest {
        proposal_id: proposal_id.into(),
        rftp_id: rftp_id.into(),
        proposed_hours: 80,
        proposed_budget: 10_000.0,
        proposed_deliverables: vec!["final report".into()],
        proposed_timeline: HashMap::from([("kickoff".into(), "2026-08-15".into())]),
        technical_approach: "scenario modelling".into(),
        assumptions: vec![],
        risks: vec![],
        created_by: "analyst-1".into(),
    }
}

#[tokio::test]
async fn full_lifecycle_with_exact_history_sequence() {
    let engine = engine();

    let rftp = engine.create_rftp(rftp_request()).await.unwrap();
    assert_eq!(rftp.status.as_str(), "submitted");

    let task = engine
        .submit_proposal(proposal_for(&rftp.rftp_id, "P-1"))
        .await
        .unwrap();
    assert_eq!(task.status, TaskStatus::Proposed);
    assert_eq!(
        engine.get_rftp(&rftp.rftp_id).await.unwrap().status.as_str(),
        "under_review"
    );

    let task = engine
        .approve(
            &task.task_id,
            TaskApproval {
                approved_by: "manager-1".into(),
                approved_budget: 10_000.0,
                approved_hours: 80,
                conditions: vec![],
                notes: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(task.status, TaskStatus::Accepted);
    assert_eq!(task.budget, 10_000.0);
    assert_eq!(
        engine.get_rftp(&rftp.rftp_id).await.unwrap().status.as_str(),
        "approved"
    );

    let task = engine
        .start(
            &task.task_id,
            TaskStart {
                assigned_to: "u1".into(),
            },
        )
        .await
        .unwrap();
    assert_eq!(task.status, TaskStatus::InProgress);
    assert_eq!(task.assigned_to.as_deref(), Some("u1"));

    // 9 500 of 10 000 spent: progress entry plus a budget alert.
    let task = engine
        .update_progress(
            &task.task_id,
            TaskProgress {
                progress_percentage: Some(80),
                spent_hours: None,
                spent_budget: Some(9_500.0),
            },
        )
        .await
        .unwrap();
    assert_eq!(task.spent_budget, 9_500.0);

    let events = engine.recent_events(50).await;
    assert!(
        events.iter().any(|event| event.action == "task_budget_alert"),
        "budget alert must land in the workflow event buffer"
    );

    let task = engine
        .complete(&task.task_id, TaskCompletion { artifacts: vec![json!({"name": "report.pdf"})] })
        .await
        .unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.progress_percentage, 100);

    let history: Vec<&str> = task
        .workflow_history
        .iter()
        .map(|entry| entry.event.as_str())
        .collect();
    assert_eq!(
        history,
        vec![
            "task_created",
            "task_status_proposed",
            "task_status_accepted",
            "task_status_in_progress",
            "task_progress_updated",
            "task_budget_alert",
            "task_completed",
            "task_status_completed",
        ]
    );

    // History timestamps never run backwards.
    for window in task.workflow_history.windows(2) {
        assert!(window[0].timestamp <= window[1].timestamp);
    }
}

#[tokio::test]
async fn illegal_transitions_are_rejected_without_mutation() {
    let engine = engine();
    let rftp = engine.create_rftp(rftp_request()).await.unwrap();
    let task = engine
        .submit_proposal(proposal_for(&rftp.rftp_id, "P-1"))
        .await
        .unwrap();

    // Cannot start or complete a merely proposed task.
    assert!(matches!(
        engine
            .start(&task.task_id, TaskStart { assigned_to: "u1".into() })
            .await,
        Err(WorkflowError::IllegalTransition(_))
    ));
    assert!(matches!(
        engine
            .complete(&task.task_id, TaskCompletion::default())
            .await,
        Err(WorkflowError::IllegalTransition(_))
    ));
    let unchanged = engine.get_task(&task.task_id).await.unwrap();
    assert_eq!(unchanged.status, TaskStatus::Proposed);
    assert_eq!(unchanged.workflow_history.len(), 2);

    // Start requires an assignee.
    engine
        .approve(
            &task.task_id,
            TaskApproval {
                approved_by: "m".into(),
                approved_budget: 1_000.0,
                approved_hours: 10,
                conditions: vec![],
                notes: None,
            },
        )
        .await
        .unwrap();
    assert!(matches!(
        engine
            .start(&task.task_id, TaskStart { assigned_to: "  ".into() })
            .await,
        Err(WorkflowError::Validation(_))
    ));
}

#[tokio::test]
async fn branch_transitions_respect_their_source_states() {
    let engine = engine();
    let rftp = engine.create_rftp(rftp_request()).await.unwrap();

    // reject: only from proposed.
    let task = engine
        .submit_proposal(proposal_for(&rftp.rftp_id, "P-reject"))
        .await
        .unwrap();
    let rejected = engine.reject(&task.task_id, Some("out of scope".into())).await.unwrap();
    assert_eq!(rejected.status, TaskStatus::Rejected);
    assert!(matches!(
        engine.cancel(&task.task_id, None).await,
        Err(WorkflowError::IllegalTransition(_))
    ));

    // cancel: only from accepted.
    let task = engine
        .submit_proposal(proposal_for(&rftp.rftp_id, "P-cancel"))
        .await
        .unwrap();
    engine
        .approve(
            &task.task_id,
            TaskApproval {
                approved_by: "m".into(),
                approved_budget: 1_000.0,
                approved_hours: 10,
                conditions: vec![],
                notes: None,
            },
        )
        .await
        .unwrap();
    let cancelled = engine.cancel(&task.task_id, None).await.unwrap();
    assert_eq!(cancelled.status, TaskStatus::Cancelled);

    // terminate: only from in_progress.
    let task = engine
        .submit_proposal(proposal_for(&rftp.rftp_id, "P-terminate"))
        .await
        .unwrap();
    engine
        .approve(
            &task.task_id,
            TaskApproval {
                approved_by: "m".into(),
                approved_budget: 1_000.0,
                approved_hours: 10,
                conditions: vec![],
                notes: None,
            },
        )
        .await
        .unwrap();
    engine
        .start(&task.task_id, TaskStart { assigned_to: "u1".into() })
        .await
        .unwrap();
    let terminated = engine.terminate(&task.task_id, Some("funding pulled".into())).await.unwrap();
    assert_eq!(terminated.status, TaskStatus::Terminated);
}

#[tokio::test]
async fn duplicate_proposal_conflicts() {
    let engine = engine();
    let rftp = engine.create_rftp(rftp_request()).await.unwrap();
    engine
        .submit_proposal(proposal_for(&rftp.rftp_id, "P-1"))
        .await
        .unwrap();
    assert!(matches!(
        engine.submit_proposal(proposal_for(&rftp.rftp_id, "P-1")).await,
        Err(WorkflowError::ProposalExists)
    ));
}

#[tokio::test]
async fn proposal_for_unknown_rftp_fails() {
    let engine = engine();
    assert!(matches!(
        engine.submit_proposal(proposal_for("missing", "P-1")).await,
        Err(WorkflowError::RftpNotFound)
    ));
}

#[tokio::test]
async fn dashboard_aggregates_funnel_and_at_risk() {
    let engine = engine();
    let rftp = engine.create_rftp(rftp_request()).await.unwrap();
    let task = engine
        .submit_proposal(proposal_for(&rftp.rftp_id, "P-1"))
        .await
        .unwrap();
    engine
        .approve(
            &task.task_id,
            TaskApproval {
                approved_by: "m".into(),
                approved_budget: 10_000.0,
                approved_hours: 80,
                conditions: vec![],
                notes: None,
            },
        )
        .await
        .unwrap();
    engine
        .start(&task.task_id, TaskStart { assigned_to: "u1".into() })
        .await
        .unwrap();
    engine
        .update_progress(
            &task.task_id,
            TaskProgress {
                progress_percentage: Some(50),
                spent_hours: Some(40.0),
                spent_budget: Some(9_500.0),
            },
        )
        .await
        .unwrap();

    let dashboard = engine.dashboard().await;
    assert_eq!(dashboard["summary"]["total_tasks"], 1);
    assert_eq!(dashboard["summary"]["in_progress_tasks"], 1);
    assert_eq!(dashboard["workflow_funnel"]["rftps_submitted"], 1);
    assert_eq!(dashboard["workflow_funnel"]["proposals_active"], 1);
    assert_eq!(dashboard["workflow_funnel"]["tasks_in_progress"], 1);
    assert_eq!(dashboard["status_distribution"]["in_progress"], 1);
    assert_eq!(dashboard["budget_by_type"]["irp_analysis"]["budget"], 10_000.0);

    let at_risk = dashboard["at_risk_tasks"].as_array().unwrap();
    assert_eq!(at_risk.len(), 1);
    assert_eq!(at_risk[0]["task_id"], task.task_id.as_str());
    assert!(!dashboard["recent_events"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn event_buffer_is_bounded() {
    let engine = engine();
    for _ in 0..250 {
        engine.create_rftp(rftp_request()).await.unwrap();
    }
    // 250 submissions emitted, the buffer retains the newest 200.
    let events = engine.recent_events(500).await;
    assert_eq!(events.len(), 200);
    assert_eq!(events.last().unwrap().action, "rftp_submitted");
}

#[tokio::test]
async fn progress_clamps_percentage() {
    let engine = engine();
    let rftp = engine.create_rftp(rftp_request()).await.unwrap();
    let task = engine
        .submit_proposal(proposal_for(&rftp.rftp_id, "P-1"))
        .await
        .unwrap();
    engine
        .approve(
            &task.task_id,
            TaskApproval {
                approved_by: "m".into(),
                approved_budget: 1_000.0,
                approved_hours: 10,
                conditions: vec![],
                notes: None,
            },
        )
        .await
        .unwrap();
    engine
        .start(&task.task_id, TaskStart { assigned_to: "u1".into() })
        .await
        .unwrap();
    let task = engine
        .update_progress(
            &task.task_id,
            TaskProgress {
                progress_percentage: Some(250),
                spent_hours: None,
                spent_budget: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(task.progress_percentage, 100);
}
