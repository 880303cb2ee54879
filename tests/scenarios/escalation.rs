//! Test: batches are routed to human review by the escalation triggers

use crate::helpers::*;
use payflow::agent::SimulatedAgent;
use payflow::core::{
    rules::{ClientConfig, HoldRecord},
    BatchStatus, StepStatus, StopIssuePolicy,
};
use payflow::execution::{EscalationTrigger, ExecutionEvent, StepMetrics};

fn hold(client_id: &str) -> HoldRecord {
    HoldRecord {
        plan_id: PLAN.to_string(),
        client_id: client_id.to_string(),
        hold_reason_cd: "MD".to_string(),
        hold_reason: "Missing data".to_string(),
        hold_as_of_date: None,
        addl_info: String::new(),
    }
}

#[tokio::test]
async fn test_multiple_holds_escalate_before_dispatch() {
    let rules = catalog(two_step_pipeline())
        .with_hold(hold("C-100"))
        .with_hold(hold("C-200"))
        .with_hold(hold("C-200"));
    let harness = Harness::new(rules, SimulatedAgent::new()).await;

    let state = harness.run("batch-holds").await;

    assert_eq!(state.status, BatchStatus::Escalated);
    assert!(state.escalation_reason.starts_with("2 client ids on hold"));
    assert!(harness.dispatched().await.is_empty());
    assert!(state.steps.iter().all(|s| s.status == StepStatus::Pending));

    let escalations = harness.escalations().await;
    assert_eq!(escalations.len(), 1);
    assert_eq!(escalations[0].trigger, EscalationTrigger::MultipleHolds);
}

#[tokio::test]
async fn test_single_hold_does_not_escalate() {
    let rules = catalog(two_step_pipeline()).with_hold(hold("C-100"));
    let harness = Harness::new(rules, SimulatedAgent::new()).await;

    let state = harness.run("batch-one-hold").await;

    assert_eq!(state.status, BatchStatus::Completed);
    assert!(harness.escalations().await.is_empty());
}

#[tokio::test]
async fn test_low_schema_confidence_stops_downstream_steps() {
    let agent = SimulatedAgent::new().with_metrics(
        "SCHEMA_MATCH",
        StepMetrics {
            schema_confidence: Some(0.42),
            ..StepMetrics::default()
        },
    );
    let harness = Harness::new(catalog(diamond_pipeline()), agent).await;

    let state = harness.run("batch-schema").await;

    assert_eq!(state.status, BatchStatus::Escalated);
    assert_eq!(state.escalation_reason, "schema match confidence 0.42 below 0.80");
    assert_eq!(step_status(&state, "SCHEMA_MATCH"), StepStatus::Completed);

    let names = harness.dispatched_names().await;
    assert!(!names.iter().any(|n| n == "CALC_MATCH" || n == "REPORT"));

    let escalated = count_events(&harness.events(), |e| {
        matches!(e, ExecutionEvent::BatchEscalated { .. })
    });
    assert_eq!(escalated, 1);
}

#[tokio::test]
async fn test_any_stop_issue_halts_when_policy_says_so() {
    let mut config = two_step_pipeline();
    config.stop_issue_policy = StopIssuePolicy::HaltBatch;
    let agent = SimulatedAgent::new().with_metrics(
        "VALIDATE",
        StepMetrics {
            stop_issue_records: Some(1),
            ..StepMetrics::default()
        },
    );
    let harness = Harness::new(catalog(config), agent).await;

    let state = harness.run("batch-stop").await;

    assert_eq!(state.status, BatchStatus::Escalated);
    assert_eq!(state.escalation_reason, "STOP-level issues affect 1 of 100 records");
    let escalations = harness.escalations().await;
    assert_eq!(escalations[0].trigger, EscalationTrigger::StopIssues);
    assert_eq!(escalations[0].affected_record_count, 1);
}

#[tokio::test]
async fn test_few_stop_issues_are_excluded_by_default() {
    let agent = SimulatedAgent::new().with_metrics(
        "VALIDATE",
        StepMetrics {
            stop_issue_records: Some(10),
            ..StepMetrics::default()
        },
    );
    let harness = Harness::new(catalog(two_step_pipeline()), agent).await;

    let state = harness.run("batch-stop-few").await;

    assert_eq!(state.status, BatchStatus::Completed);
}

#[tokio::test]
async fn test_passed_custodian_deadline_escalates() {
    let config = ClientConfig {
        custodian: Some("Schwab".to_string()),
        deadline_hour_utc: Some(0),
        contribution_baseline: None,
    };
    let rules = catalog(two_step_pipeline()).with_client_config(PLAN, FREQ, config);
    let harness = Harness::new(rules, SimulatedAgent::new()).await;

    let state = harness.run("batch-deadline").await;

    assert_eq!(state.status, BatchStatus::Escalated);
    let escalations = harness.escalations().await;
    assert_eq!(escalations[0].trigger, EscalationTrigger::DeadlineRisk);
    assert!(escalations[0].time_remaining_minutes.unwrap() <= 0);
    assert!(escalations[0].custodian_deadline.is_some());
}

#[tokio::test]
async fn test_contribution_anomaly_escalates() {
    let config = ClientConfig {
        contribution_baseline: Some(10_000.0),
        ..ClientConfig::default()
    };
    let rules = catalog(two_step_pipeline()).with_client_config(PLAN, FREQ, config);
    let agent = SimulatedAgent::new().with_metrics(
        "VALIDATE",
        StepMetrics {
            contribution_total: Some(45_000.0),
            ..StepMetrics::default()
        },
    );
    let harness = Harness::new(rules, agent).await;

    let state = harness.run("batch-anomaly").await;

    assert_eq!(state.status, BatchStatus::Escalated);
    assert_eq!(
        harness.escalations().await[0].trigger,
        EscalationTrigger::FinancialAnomaly
    );
}
