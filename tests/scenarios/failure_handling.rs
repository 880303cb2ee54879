//! Test: failed steps are retried, then fail the step and escalate or continue

use crate::helpers::*;
use payflow::agent::SimulatedAgent;
use payflow::core::{AgentRole, BatchStatus, PipelineStep, StepStatus};
use payflow::execution::{EscalationTrigger, ExecutionEvent};

/// Required step that never succeeds ends in human review
#[tokio::test]
async fn test_required_step_exhausts_retries_and_escalates() {
    let agent = SimulatedAgent::new().failing("VALIDATE");
    let harness = Harness::new(catalog(two_step_pipeline()), agent).await;

    let state = harness.run("batch-a").await;

    assert_eq!(state.status, BatchStatus::Escalated);
    assert_eq!(state.escalation_reason, "required step failed after 3 retries");
    assert_eq!(step_status(&state, "INGEST"), StepStatus::Completed);

    let validate = step(&state, "VALIDATE");
    assert_eq!(validate.status, StepStatus::Failed);
    assert_eq!(validate.retry_count, 2);
    assert!(validate.error_details.contains("simulated failure"));

    let names = harness.dispatched_names().await;
    assert_eq!(names.iter().filter(|n| *n == "VALIDATE").count(), 3);
    let attempts: Vec<u32> = harness
        .dispatched()
        .await
        .iter()
        .filter(|r| r.subroutine_name == "VALIDATE")
        .map(|r| r.attempt)
        .collect();
    assert_eq!(attempts, vec![1, 2, 3]);

    let escalations = harness.escalations().await;
    assert_eq!(escalations.len(), 1);
    assert_eq!(escalations[0].trigger, EscalationTrigger::RequiredStepFailed);
    assert_eq!(escalations[0].failed_step, "VALIDATE");
    assert_eq!(escalations[0].plan_id, PLAN);
}

#[tokio::test]
async fn test_retry_then_success() {
    let agent = SimulatedAgent::new().failing_times("VALIDATE", 2);
    let harness = Harness::new(catalog(two_step_pipeline()), agent).await;

    let state = harness.run("batch-retry").await;

    assert_eq!(state.status, BatchStatus::Completed);
    let validate = step(&state, "VALIDATE");
    assert_eq!(validate.status, StepStatus::Completed);
    assert_eq!(validate.retry_count, 2);
    assert!(validate.error_details.is_empty());
    assert!(harness.escalations().await.is_empty());

    let retries = count_events(&harness.events(), |e| {
        matches!(e, ExecutionEvent::StepFailed { will_retry: true, .. })
    });
    assert_eq!(retries, 2);
}

#[tokio::test]
async fn test_optional_step_failure_does_not_stop_batch() {
    let config = pipeline(vec![
        PipelineStep::new(100, "INGEST", AgentRole::Ingestion),
        PipelineStep::new(200, "VALIDATE", AgentRole::Validation).depends_on("INGEST"),
        PipelineStep::new(300, "ANALYTICS", AgentRole::Compliance)
            .depends_on("INGEST")
            .optional(),
    ]);
    let agent = SimulatedAgent::new().failing("ANALYTICS");
    let harness = Harness::new(catalog(config), agent).await;

    let state = harness.run("batch-optional").await;

    assert_eq!(state.status, BatchStatus::Completed);
    assert_eq!(step_status(&state, "ANALYTICS"), StepStatus::Failed);
    assert_eq!(step_status(&state, "VALIDATE"), StepStatus::Completed);
    assert!(harness.escalations().await.is_empty());
}

#[tokio::test]
async fn test_failed_optional_step_skips_required_dependents() {
    let config = pipeline(vec![
        PipelineStep::new(100, "INGEST", AgentRole::Ingestion),
        PipelineStep::new(200, "ENRICH", AgentRole::Transformation)
            .depends_on("INGEST")
            .optional(),
        PipelineStep::new(300, "CALC_MATCH", AgentRole::Transformation).depends_on("ENRICH"),
        PipelineStep::new(400, "REPORT", AgentRole::Compliance).depends_on("CALC_MATCH"),
    ]);
    let agent = SimulatedAgent::new().failing("ENRICH");
    let harness = Harness::new(catalog(config), agent).await;

    let state = harness.run("batch-upstream").await;

    assert_eq!(state.status, BatchStatus::Failed);
    assert_eq!(step_status(&state, "ENRICH"), StepStatus::Failed);
    assert_eq!(step_status(&state, "CALC_MATCH"), StepStatus::Skipped);
    assert_eq!(step_status(&state, "REPORT"), StepStatus::Skipped);

    let names = harness.dispatched_names().await;
    assert!(!names.iter().any(|n| n == "CALC_MATCH" || n == "REPORT"));
}
