//! In-process transport that hands step requests straight to a handler

use crate::agent::StepHandler;
use crate::core::{error::DispatchError, StepStatus};
use crate::execution::{CompletionRouter, EscalationPayload, StepCompletion, StepRequest, StepTransport};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Transport that runs each request on a spawned task and routes the completion back
///
/// Every request and escalation is recorded, so tests and rehearsal runs can inspect
/// what would have been sent to the queues.
pub struct LocalTransport {
    handler: Arc<dyn StepHandler>,
    router: Arc<CompletionRouter>,
    acknowledge: bool,
    dispatched: Mutex<Vec<StepRequest>>,
    escalations: Mutex<Vec<EscalationPayload>>,
}

impl LocalTransport {
    pub fn new(handler: Arc<dyn StepHandler>, router: Arc<CompletionRouter>) -> Self {
        Self {
            handler,
            router,
            acknowledge: false,
            dispatched: Mutex::new(Vec::new()),
            escalations: Mutex::new(Vec::new()),
        }
    }

    /// Send a PROCESSING ack before each final completion
    pub fn with_acknowledgements(mut self) -> Self {
        self.acknowledge = true;
        self
    }

    /// Requests sent so far, in dispatch order
    pub async fn dispatched(&self) -> Vec<StepRequest> {
        self.dispatched.lock().await.clone()
    }

    /// Payloads published to the human-review queue
    pub async fn escalations(&self) -> Vec<EscalationPayload> {
        self.escalations.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl StepTransport for LocalTransport {
    async fn send_step_request(&self, request: StepRequest) -> Result<(), DispatchError> {
        self.dispatched.lock().await.push(request.clone());

        let handler = self.handler.clone();
        let router = self.router.clone();
        let acknowledge = self.acknowledge;

        tokio::spawn(async move {
            let mut expected = StepStatus::Dispatched;
            if acknowledge {
                router
                    .deliver(StepCompletion::for_request(&request, StepStatus::Processing))
                    .await;
                expected = StepStatus::Processing;
            }

            let outcome = handler.handle(&request).await;
            let mut completion =
                StepCompletion::for_request(&request, outcome.status).expecting(expected);
            completion.record_count = outcome.record_count;
            completion.error_count = outcome.error_count;
            completion.warning_count = outcome.warning_count;
            completion.error_details = outcome.error_details;
            completion.metrics = outcome.metrics;

            if !router.deliver(completion).await {
                debug!(
                    "No listener for completion of batch {} step {}",
                    request.batch_id, request.step_order
                );
            }
        });

        Ok(())
    }

    async fn send_escalation(&self, payload: &EscalationPayload) -> Result<(), DispatchError> {
        self.escalations.lock().await.push(payload.clone());
        Ok(())
    }
}
