//! Agents that execute dispatched steps
//!
//! Production agents sit behind a message queue; this module provides the in-process
//! side: a [`StepHandler`] contract, a [`LocalTransport`] that feeds handlers directly,
//! and a [`SimulatedAgent`] for rehearsal runs.

pub mod local;
pub mod simulated;

use crate::core::StepStatus;
use crate::execution::{StepMetrics, StepRequest};
use async_trait::async_trait;

pub use local::LocalTransport;
pub use simulated::SimulatedAgent;

/// Result of executing one step request
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    /// COMPLETED or FAILED
    pub status: StepStatus,
    pub record_count: u64,
    pub error_count: u64,
    pub warning_count: u64,
    pub error_details: String,
    pub metrics: StepMetrics,
}

impl StepOutcome {
    pub fn completed(record_count: u64) -> Self {
        Self {
            status: StepStatus::Completed,
            record_count,
            error_count: 0,
            warning_count: 0,
            error_details: String::new(),
            metrics: StepMetrics::default(),
        }
    }

    pub fn failed(error_details: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Failed,
            record_count: 0,
            error_count: 1,
            warning_count: 0,
            error_details: error_details.into(),
            metrics: StepMetrics::default(),
        }
    }

    pub fn with_metrics(mut self, metrics: StepMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_warnings(mut self, warnings: u64) -> Self {
        self.warning_count = warnings;
        self
    }
}

/// Trait for step execution - allows for different agent implementations
#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn handle(&self, request: &StepRequest) -> StepOutcome;
}
