//! Test: steps run in step order and only after their dependencies

use crate::helpers::*;
use payflow::agent::SimulatedAgent;
use payflow::core::{BatchStatus, StepStatus};
use payflow::execution::ExecutionEvent;
use payflow::persistence::RulesCatalog;

#[tokio::test]
async fn test_diamond_dispatches_in_step_order() {
    let harness = Harness::new(catalog(diamond_pipeline()), SimulatedAgent::new()).await;

    let state = harness.run("batch-diamond").await;

    assert_eq!(state.status, BatchStatus::Completed);
    let orders: Vec<u32> = harness
        .dispatched()
        .await
        .iter()
        .map(|r| r.step_order)
        .collect();
    assert_eq!(orders, vec![100, 200, 300, 400, 500]);
    assert!(state.steps.iter().all(|s| s.status == StepStatus::Completed));
    assert_eq!(state.record_count, 100);
}

#[tokio::test]
async fn test_same_definition_same_dispatch_order() {
    let first = Harness::new(catalog(diamond_pipeline()), SimulatedAgent::new()).await;
    let second = Harness::new(catalog(diamond_pipeline()), SimulatedAgent::new()).await;

    first.run("batch-a").await;
    second.run("batch-b").await;

    assert_eq!(first.dispatched_names().await, second.dispatched_names().await);
}

#[tokio::test]
async fn test_no_step_dispatched_before_its_dependencies_complete() {
    let harness = Harness::new(catalog(diamond_pipeline()), SimulatedAgent::new()).await;
    harness.run("batch-deps").await;

    let events = harness.events();
    let completed = |name: &str| completed_at(&events, name);
    let dispatched = |name: &str| dispatched_at(&events, name);

    assert!(completed("INGEST") < dispatched("SCHEMA_MATCH"));
    assert!(completed("INGEST") < dispatched("VALIDATE"));
    assert!(completed("SCHEMA_MATCH") < dispatched("CALC_MATCH"));
    assert!(completed("VALIDATE") < dispatched("CALC_MATCH"));
    assert!(completed("CALC_MATCH") < dispatched("REPORT"));
}

#[tokio::test]
async fn test_batch_lifecycle_events() {
    let harness = Harness::new(catalog(two_step_pipeline()), SimulatedAgent::new()).await;
    let state = harness.run("batch-events").await;

    let events = harness.events();
    assert!(matches!(
        events.first(),
        Some(ExecutionEvent::BatchStarted { resumed: false, .. })
    ));
    assert!(matches!(
        events.last(),
        Some(ExecutionEvent::BatchFinished {
            status: BatchStatus::Completed,
            ..
        })
    ));
    assert_eq!(
        count_events(&events, |e| matches!(e, ExecutionEvent::StepAcknowledged { .. })),
        2
    );
    assert!(state.start_time.is_some());
    assert!(state.end_time.is_some());
}

fn completed_at(events: &[ExecutionEvent], name: &str) -> usize {
    events
        .iter()
        .position(|e| matches!(e, ExecutionEvent::StepCompleted { subroutine_name, .. } if subroutine_name == name))
        .unwrap_or_else(|| panic!("{} never completed", name))
}

fn dispatched_at(events: &[ExecutionEvent], name: &str) -> usize {
    events
        .iter()
        .position(|e| matches!(e, ExecutionEvent::StepDispatched { subroutine_name, .. } if subroutine_name == name))
        .unwrap_or_else(|| panic!("{} never dispatched", name))
}

#[tokio::test]
async fn test_demo_catalog_runs_to_completion() {
    let rules = RulesCatalog::from_yaml(include_str!("../../demos/rules.yaml")).unwrap();
    let harness = Harness::new(rules, SimulatedAgent::new()).await;

    let state = harness.run("batch-demo").await;

    assert_eq!(state.status, BatchStatus::Completed);
    assert_eq!(step_status(&state, "OPTIONAL_REPORT"), StepStatus::Skipped);
    assert_eq!(step_status(&state, "COMPLIANCE_CHECK"), StepStatus::Completed);
    assert_eq!(harness.dispatched().await.len(), 5);
}
