//! Execution state models

use crate::core::step::PipelineStep;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Overall batch status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    /// Batch registered by ingestion, not yet picked up
    Received,
    /// Executor is driving steps
    Processing,
    /// Every required step completed or was skipped
    Completed,
    /// Processing finished with a required step not completed
    Failed,
    /// Handed off to human review
    Escalated,
}

impl BatchStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchStatus::Completed | BatchStatus::Failed | BatchStatus::Escalated
        )
    }

    /// Check whether the state machine allows moving to `next`
    pub fn can_transition_to(&self, next: BatchStatus) -> bool {
        use BatchStatus::*;
        matches!(
            (self, next),
            (Received, Processing)
                | (Received, Failed)
                | (Received, Escalated)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Escalated)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Received => "RECEIVED",
            BatchStatus::Processing => "PROCESSING",
            BatchStatus::Completed => "COMPLETED",
            BatchStatus::Failed => "FAILED",
            BatchStatus::Escalated => "ESCALATED",
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RECEIVED" => Ok(BatchStatus::Received),
            "PROCESSING" => Ok(BatchStatus::Processing),
            "COMPLETED" => Ok(BatchStatus::Completed),
            "FAILED" => Ok(BatchStatus::Failed),
            "ESCALATED" => Ok(BatchStatus::Escalated),
            other => Err(format!("unknown batch status '{}'", other)),
        }
    }
}

/// Status of a single step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    /// Waiting for dependencies
    Pending,
    /// Request sent to the agent queue
    Dispatched,
    /// Agent acknowledged and is working on it
    Processing,
    Completed,
    Failed,
    /// Not executed (disabled, or an upstream step failed)
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped
        )
    }

    /// Satisfies a downstream dependency
    pub fn is_satisfied(&self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Skipped)
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(self, StepStatus::Dispatched | StepStatus::Processing)
    }

    /// Check whether the state machine allows moving to `next`.
    ///
    /// Re-dispatch edges (`* -> DISPATCHED` from an in-flight or failed step) are
    /// additionally guarded by the attempt budget, which the state manager checks.
    pub fn can_transition_to(&self, next: StepStatus) -> bool {
        use StepStatus::*;
        matches!(
            (self, next),
            (Pending, Dispatched)
                | (Pending, Skipped)
                | (Dispatched, Processing)
                | (Dispatched, Completed)
                | (Dispatched, Failed)
                | (Dispatched, Dispatched)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Dispatched)
                | (Failed, Dispatched)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "PENDING",
            StepStatus::Dispatched => "DISPATCHED",
            StepStatus::Processing => "PROCESSING",
            StepStatus::Completed => "COMPLETED",
            StepStatus::Failed => "FAILED",
            StepStatus::Skipped => "SKIPPED",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(StepStatus::Pending),
            "DISPATCHED" => Ok(StepStatus::Dispatched),
            "PROCESSING" => Ok(StepStatus::Processing),
            "COMPLETED" => Ok(StepStatus::Completed),
            "FAILED" => Ok(StepStatus::Failed),
            "SKIPPED" => Ok(StepStatus::Skipped),
            other => Err(format!("unknown step status '{}'", other)),
        }
    }
}

/// Execution state of one step of one batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepState {
    pub step_order: u32,
    pub subroutine_name: String,
    pub status: StepStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// When the step was last sent to its agent
    #[serde(default)]
    pub last_dispatch_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub record_count: u64,
    #[serde(default)]
    pub error_count: u64,
    #[serde(default)]
    pub warning_count: u64,
    pub agent_name: String,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub error_details: String,
}

impl StepState {
    /// Fresh state for a step that has never been evaluated
    pub fn pending(step: &PipelineStep) -> Self {
        Self {
            step_order: step.step_order,
            subroutine_name: step.subroutine_name.clone(),
            status: StepStatus::Pending,
            start_time: None,
            end_time: None,
            last_dispatch_time: None,
            duration_ms: 0,
            record_count: 0,
            error_count: 0,
            warning_count: 0,
            agent_name: step.agent.to_string(),
            retry_count: 0,
            error_details: String::new(),
        }
    }

    /// Number of dispatches made so far (0 while pending)
    pub fn attempts(&self) -> u32 {
        if self.last_dispatch_time.is_none() && self.status == StepStatus::Pending {
            0
        } else {
            self.retry_count + 1
        }
    }
}

/// Execution state of a whole batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchState {
    pub batch_id: String,
    pub plan_id: String,
    pub pay_freq: String,
    pub source_path: String,
    pub status: BatchStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Ordered by `step_order`
    #[serde(default)]
    pub steps: Vec<StepState>,
    #[serde(default)]
    pub record_count: u64,
    #[serde(default)]
    pub escalation_reason: String,
}

impl BatchState {
    pub fn new(batch_id: &str, plan_id: &str, pay_freq: &str, source_path: &str) -> Self {
        Self {
            batch_id: batch_id.to_string(),
            plan_id: plan_id.to_string(),
            pay_freq: pay_freq.to_string(),
            source_path: source_path.to_string(),
            status: BatchStatus::Received,
            start_time: None,
            end_time: None,
            steps: Vec::new(),
            record_count: 0,
            escalation_reason: String::new(),
        }
    }

    /// Get a step by order
    pub fn step(&self, step_order: u32) -> Option<&StepState> {
        self.steps.iter().find(|s| s.step_order == step_order)
    }

    /// Get a step by subroutine name
    pub fn step_named(&self, subroutine_name: &str) -> Option<&StepState> {
        self.steps
            .iter()
            .find(|s| s.subroutine_name == subroutine_name)
    }

    pub fn status_of(&self, step_order: u32) -> Option<StepStatus> {
        self.step(step_order).map(|s| s.status)
    }

    /// Steps currently dispatched or processing
    pub fn in_flight(&self) -> impl Iterator<Item = &StepState> {
        self.steps.iter().filter(|s| s.status.is_in_flight())
    }

    pub fn count_with(&self, status: StepStatus) -> usize {
        self.steps.iter().filter(|s| s.status == status).count()
    }

    /// Calculate progress (0.0 to 1.0)
    pub fn progress(&self) -> f64 {
        if self.steps.is_empty() {
            return 0.0;
        }
        let done = self.steps.iter().filter(|s| s.status.is_terminal()).count();
        done as f64 / self.steps.len() as f64
    }
}
