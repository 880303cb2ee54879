//! Test: disabled steps are skipped without dispatch and satisfy their dependents

use crate::helpers::*;
use payflow::agent::SimulatedAgent;
use payflow::core::{AgentRole, BatchStatus, PipelineStep, StepStatus};
use payflow::execution::{ExecutionEvent, SkipReason};

#[tokio::test]
async fn test_disabled_step_skipped_and_dependents_run() {
    let config = pipeline(vec![
        PipelineStep::new(100, "INGEST", AgentRole::Ingestion),
        PipelineStep::new(200, "VALIDATE", AgentRole::Validation).depends_on("INGEST"),
        PipelineStep::new(300, "OPTIONAL_REPORT", AgentRole::Compliance)
            .depends_on("INGEST")
            .disabled(),
        PipelineStep::new(400, "CALC_MATCH", AgentRole::Transformation)
            .depends_on("VALIDATE")
            .depends_on("OPTIONAL_REPORT"),
    ]);
    let harness = Harness::new(catalog(config), SimulatedAgent::new()).await;

    let state = harness.run("batch-b").await;

    assert_eq!(state.status, BatchStatus::Completed);
    assert_eq!(step_status(&state, "OPTIONAL_REPORT"), StepStatus::Skipped);
    assert_eq!(step_status(&state, "CALC_MATCH"), StepStatus::Completed);

    let names = harness.dispatched_names().await;
    assert_eq!(names, vec!["INGEST", "VALIDATE", "CALC_MATCH"]);

    let skipped: Vec<SkipReason> = harness
        .events()
        .into_iter()
        .filter_map(|e| match e {
            ExecutionEvent::StepSkipped { reason, .. } => Some(reason),
            _ => None,
        })
        .collect();
    assert_eq!(skipped, vec![SkipReason::Disabled]);
}

#[tokio::test]
async fn test_disabled_first_step_never_dispatched() {
    let config = pipeline(vec![
        PipelineStep::new(100, "PRE_SCAN", AgentRole::Ingestion).disabled(),
        PipelineStep::new(200, "INGEST", AgentRole::Ingestion).depends_on("PRE_SCAN"),
    ]);
    let harness = Harness::new(catalog(config), SimulatedAgent::new()).await;

    let state = harness.run("batch-disabled-root").await;

    assert_eq!(state.status, BatchStatus::Completed);
    assert_eq!(harness.dispatched_names().await, vec!["INGEST"]);
    assert_eq!(step(&state, "PRE_SCAN").retry_count, 0);
    assert!(step(&state, "PRE_SCAN").last_dispatch_time.is_none());
}
