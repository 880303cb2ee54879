//! Test: duplicate and stale callbacks never change state twice

use crate::helpers::*;
use async_trait::async_trait;
use payflow::agent::SimulatedAgent;
use payflow::core::{BatchStatus, DispatchError, PipelineDefinition, StepStatus};
use payflow::execution::{
    BatchUpdate, CompletionRouter, EscalationPayload, ExecutionEvent, StepCompletion,
    StepRequest, StepTransport, StepUpdate,
};
use payflow::persistence::{InMemoryStateStore, StateStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Completes every step immediately, and delivers one step's completion twice
struct DuplicatingTransport {
    router: Arc<CompletionRouter>,
    duplicate_order: u32,
    escalations: Mutex<Vec<EscalationPayload>>,
}

#[async_trait]
impl StepTransport for DuplicatingTransport {
    async fn send_step_request(&self, request: StepRequest) -> Result<(), DispatchError> {
        let mut completion = StepCompletion::for_request(&request, StepStatus::Completed);
        completion.record_count = 250;

        let copies = if request.step_order == self.duplicate_order { 2 } else { 1 };
        for _ in 0..copies {
            self.router.deliver(completion.clone()).await;
        }
        Ok(())
    }

    async fn send_escalation(&self, payload: &EscalationPayload) -> Result<(), DispatchError> {
        self.escalations.lock().await.push(payload.clone());
        Ok(())
    }
}

#[tokio::test]
async fn test_duplicate_completion_is_discarded() {
    let router = Arc::new(CompletionRouter::new());
    let transport = Arc::new(DuplicatingTransport {
        router: router.clone(),
        duplicate_order: 200,
        escalations: Mutex::new(Vec::new()),
    });
    let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
    let (executor, events) =
        build_executor(catalog(diamond_pipeline()), store, transport.clone(), router).await;

    let state = executor.run("batch-d", PLAN, FREQ, SOURCE).await.unwrap();

    assert_eq!(state.status, BatchStatus::Completed);
    let schema = step(&state, "SCHEMA_MATCH");
    assert_eq!(schema.status, StepStatus::Completed);
    assert_eq!(schema.record_count, 250);
    assert_eq!(schema.retry_count, 0);

    let events = events.lock().unwrap().clone();
    let discarded: Vec<u32> = events
        .iter()
        .filter_map(|e| match e {
            ExecutionEvent::CompletionDiscarded { step_order, .. } => Some(*step_order),
            _ => None,
        })
        .collect();
    assert_eq!(discarded, vec![200]);
    assert_eq!(
        count_events(&events, |e| matches!(
            e,
            ExecutionEvent::StepCompleted { step_order: 200, .. }
        )),
        1
    );
    assert!(transport.escalations.lock().await.is_empty());
}

#[tokio::test]
async fn test_same_transition_twice_conflicts() {
    let harness = Harness::new(catalog(two_step_pipeline()), SimulatedAgent::new()).await;
    let manager = harness.executor.state_manager();
    let definition = PipelineDefinition::from_config(two_step_pipeline()).unwrap();
    manager
        .initialize_batch("batch-cas", PLAN, FREQ, SOURCE, definition.steps())
        .await
        .unwrap();

    manager
        .update_step_state("batch-cas", 100, StepStatus::Pending, StepStatus::Dispatched, StepUpdate::new())
        .await
        .unwrap();
    manager
        .update_step_state(
            "batch-cas",
            100,
            StepStatus::Dispatched,
            StepStatus::Completed,
            StepUpdate::new().counts(10, 0, 0),
        )
        .await
        .unwrap();
    let second = manager
        .update_step_state(
            "batch-cas",
            100,
            StepStatus::Dispatched,
            StepStatus::Completed,
            StepUpdate::new().counts(99, 0, 0),
        )
        .await;

    assert!(second.unwrap_err().is_conflict());
    let state = manager.get_batch_state("batch-cas").await.unwrap();
    assert_eq!(step(&state, "INGEST").record_count, 10);
}

#[tokio::test]
async fn test_stale_cached_state_is_reread_after_losing_a_write() {
    let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
    let ours = Harness::configured(
        catalog(two_step_pipeline()),
        SimulatedAgent::new(),
        store.clone(),
        fast_settings(),
    )
    .await;
    let theirs =
        Harness::with_store(catalog(two_step_pipeline()), SimulatedAgent::new(), store.clone()).await;

    let manager = ours.executor.state_manager();
    let definition = PipelineDefinition::from_config(two_step_pipeline()).unwrap();
    manager
        .initialize_batch("batch-shared", PLAN, FREQ, SOURCE, definition.steps())
        .await
        .unwrap();
    manager
        .update_batch_state(
            "batch-shared",
            BatchStatus::Received,
            BatchStatus::Processing,
            BatchUpdate::default(),
        )
        .await
        .unwrap();
    let cached = manager.get_batch_state("batch-shared").await.unwrap();
    assert_eq!(step_status(&cached, "INGEST"), StepStatus::Pending);

    // Another instance sends INGEST; our cache still says PENDING
    theirs
        .executor
        .state_manager()
        .update_step_state("batch-shared", 100, StepStatus::Pending, StepStatus::Dispatched, StepUpdate::new())
        .await
        .unwrap();

    let state = tokio::time::timeout(
        Duration::from_secs(10),
        ours.executor.run("batch-shared", PLAN, FREQ, SOURCE),
    )
    .await
    .expect("executor kept retrying against its cached state")
    .unwrap();

    assert_eq!(state.status, BatchStatus::Completed);
    assert_eq!(step(&state, "INGEST").retry_count, 1);

    let dispatched = ours.dispatched().await;
    assert_eq!(dispatched[0].subroutine_name, "INGEST");
    assert_eq!(dispatched[0].attempt, 2);
    assert_eq!(
        count_events(&ours.events(), |e| matches!(
            e,
            ExecutionEvent::StepRecovered { step_order: 100, .. }
        )),
        1
    );
}
