//! Dispatch gateway - outbound step requests, inbound completion callbacks

use crate::core::{error::DispatchError, AgentRole, StepStatus};
use crate::execution::escalation::EscalationPayload;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// Request sent to an agent queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRequest {
    pub batch_id: String,
    pub step_order: u32,
    pub agent: AgentRole,
    pub subroutine_name: String,
    pub parameters: serde_json::Map<String, serde_json::Value>,
    /// 1-based dispatch attempt
    pub attempt: u32,
}

/// Business metrics an agent may report with a completion
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepMetrics {
    #[serde(default)]
    pub schema_confidence: Option<f64>,
    /// Records carrying STOP-level validation issues
    #[serde(default)]
    pub stop_issue_records: Option<u64>,
    #[serde(default)]
    pub contribution_total: Option<f64>,
}

fn default_expected_status() -> StepStatus {
    StepStatus::Dispatched
}

/// Completion callback from an agent, correlated by `(batch_id, step_order)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepCompletion {
    pub batch_id: String,
    pub step_order: u32,
    /// PROCESSING (interim ack), COMPLETED or FAILED
    pub status: StepStatus,
    /// Status the sender believes the step is in
    #[serde(default = "default_expected_status")]
    pub expected_status: StepStatus,
    /// Attempt this callback answers, when the agent echoes it
    #[serde(default)]
    pub attempt: Option<u32>,
    #[serde(default)]
    pub record_count: u64,
    #[serde(default)]
    pub error_count: u64,
    #[serde(default)]
    pub warning_count: u64,
    #[serde(default)]
    pub error_details: String,
    #[serde(default)]
    pub metrics: StepMetrics,
}

impl StepCompletion {
    /// A callback answering `request` with `status`
    pub fn for_request(request: &StepRequest, status: StepStatus) -> Self {
        Self {
            batch_id: request.batch_id.clone(),
            step_order: request.step_order,
            status,
            expected_status: StepStatus::Dispatched,
            attempt: Some(request.attempt),
            record_count: 0,
            error_count: 0,
            warning_count: 0,
            error_details: String::new(),
            metrics: StepMetrics::default(),
        }
    }

    pub fn expecting(mut self, expected: StepStatus) -> Self {
        self.expected_status = expected;
        self
    }
}

/// Outbound messaging transport
#[async_trait::async_trait]
pub trait StepTransport: Send + Sync {
    async fn send_step_request(&self, request: StepRequest) -> Result<(), DispatchError>;

    /// Publish to the human-review queue
    async fn send_escalation(&self, payload: &EscalationPayload) -> Result<(), DispatchError>;
}

/// Routes completion callbacks to the executor run that owns the batch
#[derive(Default)]
pub struct CompletionRouter {
    subscribers: Mutex<HashMap<String, mpsc::UnboundedSender<StepCompletion>>>,
}

impl CompletionRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a receiver for `batch_id`, replacing any previous one
    pub async fn subscribe(&self, batch_id: &str) -> mpsc::UnboundedReceiver<StepCompletion> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscribers = self.subscribers.lock().await;
        if subscribers.insert(batch_id.to_string(), tx).is_some() {
            warn!("Replacing existing completion subscriber for batch {}", batch_id);
        }
        rx
    }

    pub async fn unsubscribe(&self, batch_id: &str) {
        self.subscribers.lock().await.remove(batch_id);
    }

    /// Deliver a completion; false when no run is listening for its batch
    pub async fn deliver(&self, completion: StepCompletion) -> bool {
        let sender = {
            let subscribers = self.subscribers.lock().await;
            subscribers.get(&completion.batch_id).cloned()
        };

        match sender {
            Some(tx) => {
                let batch_id = completion.batch_id.clone();
                if tx.send(completion).is_err() {
                    warn!("Completion receiver for batch {} is gone", batch_id);
                    return false;
                }
                true
            }
            None => false,
        }
    }
}

/// Dispatch gateway
pub struct DispatchGateway {
    transport: Arc<dyn StepTransport>,
    router: Arc<CompletionRouter>,
}

impl DispatchGateway {
    pub fn new(transport: Arc<dyn StepTransport>, router: Arc<CompletionRouter>) -> Self {
        Self { transport, router }
    }

    pub async fn send_step_request(&self, request: StepRequest) -> Result<(), DispatchError> {
        debug!(
            "Dispatching {} (step {}) of batch {} to {} queue, attempt {}",
            request.subroutine_name,
            request.step_order,
            request.batch_id,
            request.agent,
            request.attempt
        );
        self.transport.send_step_request(request).await
    }

    pub async fn subscribe(&self, batch_id: &str) -> mpsc::UnboundedReceiver<StepCompletion> {
        self.router.subscribe(batch_id).await
    }

    pub async fn unsubscribe(&self, batch_id: &str) {
        self.router.unsubscribe(batch_id).await
    }

    /// Inbound completion callback
    ///
    /// A callback for a batch nobody is driving is dropped; the step is picked up by
    /// stale recovery when the batch is resumed.
    pub async fn on_step_completion(&self, completion: StepCompletion) -> bool {
        let batch_id = completion.batch_id.clone();
        let step_order = completion.step_order;
        let delivered = self.router.deliver(completion).await;
        if !delivered {
            warn!(
                "Dropping unroutable completion for batch {} step {}",
                batch_id, step_order
            );
        }
        delivered
    }

    /// Hand an escalation to the human-review queue
    pub async fn on_escalation(&self, payload: &EscalationPayload) -> Result<(), DispatchError> {
        info!(
            "Escalating batch {} to human review: {}",
            payload.batch_id, payload.reason
        );
        self.transport.send_escalation(payload).await
    }
}
