//! Test: transport outages and requests that never get an answer

use crate::helpers::*;
use async_trait::async_trait;
use payflow::agent::{LocalTransport, SimulatedAgent};
use payflow::core::{BatchState, BatchStatus, DispatchError, OrchestratorError, StepStatus};
use payflow::execution::{
    CompletionRouter, EscalationPayload, EscalationTrigger, ExecutionEvent, StepRequest,
    StepTransport,
};
use payflow::persistence::{InMemoryStateStore, StateStore};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Local transport with scripted outages and requests that vanish after being accepted
struct FaultyTransport {
    inner: LocalTransport,
    sends: Mutex<Vec<StepRequest>>,
    unavailable: Mutex<u32>,
    dropped: Mutex<HashMap<String, u32>>,
}

impl FaultyTransport {
    fn new(router: Arc<CompletionRouter>) -> Self {
        Self {
            inner: LocalTransport::new(Arc::new(SimulatedAgent::new()), router),
            sends: Mutex::new(Vec::new()),
            unavailable: Mutex::new(0),
            dropped: Mutex::new(HashMap::new()),
        }
    }

    /// Fail the next `times` sends with `Unavailable`
    fn unavailable_for(mut self, times: u32) -> Self {
        *self.unavailable.get_mut() = times;
        self
    }

    /// Accept the next `times` requests for `subroutine_name` and never answer them
    fn dropping(mut self, subroutine_name: &str, times: u32) -> Self {
        self.dropped
            .get_mut()
            .insert(subroutine_name.to_string(), times);
        self
    }

    /// Attempt numbers of every send for one step, failed sends included
    async fn attempts_of(&self, subroutine_name: &str) -> Vec<u32> {
        self.sends
            .lock()
            .await
            .iter()
            .filter(|r| r.subroutine_name == subroutine_name)
            .map(|r| r.attempt)
            .collect()
    }
}

#[async_trait]
impl StepTransport for FaultyTransport {
    async fn send_step_request(&self, request: StepRequest) -> Result<(), DispatchError> {
        self.sends.lock().await.push(request.clone());

        {
            let mut unavailable = self.unavailable.lock().await;
            if *unavailable > 0 {
                *unavailable -= 1;
                return Err(DispatchError::Unavailable("queue endpoint unreachable".to_string()));
            }
        }

        if let Some(left) = self.dropped.lock().await.get_mut(&request.subroutine_name) {
            if *left > 0 {
                *left -= 1;
                return Ok(());
            }
        }

        self.inner.send_step_request(request).await
    }

    async fn send_escalation(&self, payload: &EscalationPayload) -> Result<(), DispatchError> {
        self.inner.send_escalation(payload).await
    }
}

async fn run_with(
    transport: Arc<FaultyTransport>,
    router: Arc<CompletionRouter>,
    store: Arc<dyn StateStore>,
    batch_id: &str,
) -> (Result<BatchState, OrchestratorError>, Vec<ExecutionEvent>) {
    let (executor, events) = build_executor_with_settings(
        catalog(two_step_pipeline()),
        store,
        transport,
        router,
        fast_settings(),
    )
    .await;

    let result = tokio::time::timeout(
        Duration::from_secs(15),
        executor.run(batch_id, PLAN, FREQ, SOURCE),
    )
    .await
    .expect("batch run did not settle");
    let events = events.lock().unwrap().clone();
    (result, events)
}

#[tokio::test]
async fn test_unanswered_request_is_redispatched_after_staleness_timeout() {
    let router = Arc::new(CompletionRouter::new());
    let transport = Arc::new(FaultyTransport::new(router.clone()).dropping("VALIDATE", 1));
    let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());

    let (result, events) = run_with(transport.clone(), router, store, "batch-lost").await;
    let state = result.unwrap();

    assert_eq!(state.status, BatchStatus::Completed);
    assert_eq!(step(&state, "VALIDATE").retry_count, 1);
    assert_eq!(transport.attempts_of("VALIDATE").await, vec![1, 2]);
    assert_eq!(
        count_events(&events, |e| matches!(
            e,
            ExecutionEvent::StepRecovered { step_order: 200, .. }
        )),
        1
    );
}

#[tokio::test]
async fn test_required_step_that_never_answers_fails_and_escalates() {
    let router = Arc::new(CompletionRouter::new());
    let transport = Arc::new(FaultyTransport::new(router.clone()).dropping("VALIDATE", u32::MAX));
    let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());

    let (result, events) = run_with(transport.clone(), router, store, "batch-silent").await;
    let state = result.unwrap();

    assert_eq!(state.status, BatchStatus::Escalated);
    let validate = step(&state, "VALIDATE");
    assert_eq!(validate.status, StepStatus::Failed);
    assert_eq!(validate.error_details, "no completion after 3 attempts");
    assert_eq!(transport.attempts_of("VALIDATE").await, vec![1, 2, 3]);

    let escalations = transport.inner.escalations().await;
    assert_eq!(escalations.len(), 1);
    assert_eq!(escalations[0].trigger, EscalationTrigger::RequiredStepFailed);
    assert_eq!(escalations[0].failed_step, "VALIDATE");
    assert!(events
        .iter()
        .any(|e| matches!(e, ExecutionEvent::StepFailed { step_order: 200, will_retry: false, .. })));
}

#[tokio::test]
async fn test_brief_outage_is_retried_without_charging_an_attempt() {
    let router = Arc::new(CompletionRouter::new());
    let transport = Arc::new(FaultyTransport::new(router.clone()).unavailable_for(2));
    let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());

    let (result, _) = run_with(transport.clone(), router, store, "batch-blip").await;
    let state = result.unwrap();

    assert_eq!(state.status, BatchStatus::Completed);
    assert_eq!(transport.attempts_of("INGEST").await, vec![1, 1, 1]);
    assert_eq!(step(&state, "INGEST").retry_count, 0);
    assert_eq!(transport.inner.dispatched().await.len(), 2);
}

#[tokio::test]
async fn test_outage_leaves_step_pending_and_resume_sends_same_attempt() {
    let router = Arc::new(CompletionRouter::new());
    let transport = Arc::new(FaultyTransport::new(router.clone()).unavailable_for(u32::MAX));
    let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());

    let (result, _) = run_with(transport.clone(), router, store.clone(), "batch-outage").await;
    let err = result.unwrap_err();
    assert!(err.is_transient());
    assert_eq!(transport.attempts_of("INGEST").await, vec![1, 1, 1]);

    // Default staleness threshold: a step left DISPATCHED would stall the resume
    let harness = Harness::with_store(catalog(two_step_pipeline()), SimulatedAgent::new(), store).await;
    let stored = harness
        .executor
        .state_manager()
        .get_batch_state("batch-outage")
        .await
        .unwrap();
    let ingest = step(&stored, "INGEST");
    assert_eq!(ingest.status, StepStatus::Pending);
    assert_eq!(ingest.retry_count, 0);
    assert!(ingest.last_dispatch_time.is_none());

    let state = tokio::time::timeout(Duration::from_secs(5), harness.run("batch-outage"))
        .await
        .expect("resume waited on a step that was never sent");
    assert_eq!(state.status, BatchStatus::Completed);

    let dispatched = harness.dispatched().await;
    assert_eq!(dispatched[0].subroutine_name, "INGEST");
    assert_eq!(dispatched[0].attempt, 1);
    assert_eq!(step(&state, "INGEST").retry_count, 0);
}
