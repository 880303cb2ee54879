//! Error types for the orchestration core

use crate::core::state::{BatchStatus, StepStatus};
use thiserror::Error;

/// Infrastructure failures reported by a state store, cache, or rule store
#[derive(Debug, Error)]
pub enum StoreError {
    /// Backend is temporarily unreachable; callers may retry with backoff
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A stored item could not be decoded
    #[error("Corrupt item at {key}: {reason}")]
    Corrupt { key: String, reason: String },

    /// Any other backend error
    #[error("Store backend error: {0}")]
    Backend(String),
}

/// Failures of the outbound messaging transport
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Transport unavailable: {0}")]
    Unavailable(String),

    #[error("Request rejected by transport: {0}")]
    Rejected(String),
}

/// Errors surfaced by the orchestration core
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("No pipeline definition for plan '{plan_id}' ({pay_freq})")]
    PipelineNotFound { plan_id: String, pay_freq: String },

    #[error("Invalid pipeline definition for '{pipeline}': {reason}")]
    InvalidPipelineDefinition { pipeline: String, reason: String },

    /// A conditional write lost a race; re-read state and decide again
    #[error("Concurrent state conflict on {key}: expected {expected}, found {actual}")]
    ConcurrentStateConflict {
        key: String,
        expected: String,
        actual: String,
    },

    #[error("Batch '{0}' already exists")]
    BatchAlreadyExists(String),

    #[error("Batch '{0}' not found")]
    BatchNotFound(String),

    #[error("Step {step_order} not found in batch '{batch_id}'")]
    StepNotFound { batch_id: String, step_order: u32 },

    #[error("Illegal transition for {subject}: {from} -> {to}")]
    InvalidTransition {
        subject: String,
        from: String,
        to: String,
    },

    #[error("Batch '{0}' cannot be escalated without a reason")]
    MissingEscalationReason(String),

    #[error("No calculation rule '{calc_type}' for plan '{plan_id}' and no global default")]
    RuleNotFound { plan_id: String, calc_type: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl OrchestratorError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, OrchestratorError::ConcurrentStateConflict { .. })
    }

    /// Infrastructure errors that do not reflect a business failure
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            OrchestratorError::Store(StoreError::Unavailable(_))
                | OrchestratorError::Dispatch(DispatchError::Unavailable(_))
        )
    }

    pub(crate) fn step_transition(
        batch_id: &str,
        step_order: u32,
        from: StepStatus,
        to: StepStatus,
    ) -> Self {
        OrchestratorError::InvalidTransition {
            subject: format!("step {} of batch '{}'", step_order, batch_id),
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    pub(crate) fn batch_transition(batch_id: &str, from: BatchStatus, to: BatchStatus) -> Self {
        OrchestratorError::InvalidTransition {
            subject: format!("batch '{}'", batch_id),
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

pub type Result<T, E = OrchestratorError> = std::result::Result<T, E>;
