//! Execution scheduler - determines which steps to run next

use crate::core::{BatchState, BatchStatus, PipelineDefinition, PipelineStep, StepStatus};
use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;

/// Why a step is skipped instead of dispatched
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    Disabled,
    /// Named dependency failed, or was itself skipped because of a failure
    UpstreamFailed(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Disabled => f.write_str("disabled"),
            SkipReason::UpstreamFailed(name) => write!(f, "upstream step {} failed", name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepDecision {
    Dispatch,
    Skip(SkipReason),
}

/// Decision for one PENDING step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledStep {
    pub step_order: u32,
    pub decision: StepDecision,
}

/// Scheduler for one pipeline definition
///
/// Pure: decisions are derived from a state snapshot, the executor applies them.
pub struct ExecutionScheduler<'a> {
    definition: &'a PipelineDefinition,
}

impl<'a> ExecutionScheduler<'a> {
    pub fn new(definition: &'a PipelineDefinition) -> Self {
        Self { definition }
    }

    /// Decisions for every PENDING step that can be decided now, in ascending step order
    pub fn next_steps(&self, state: &BatchState) -> Vec<ScheduledStep> {
        let mut decisions = Vec::new();

        for step in self.definition.steps() {
            if state.status_of(step.step_order) != Some(StepStatus::Pending) {
                continue;
            }

            if let Some(blocker) = self.failed_dependency(step, state) {
                decisions.push(ScheduledStep {
                    step_order: step.step_order,
                    decision: StepDecision::Skip(SkipReason::UpstreamFailed(blocker)),
                });
                continue;
            }

            if !self.dependencies_satisfied(step, state) {
                continue;
            }

            let decision = if step.enabled {
                StepDecision::Dispatch
            } else {
                StepDecision::Skip(SkipReason::Disabled)
            };
            decisions.push(ScheduledStep {
                step_order: step.step_order,
                decision,
            });
        }

        decisions
    }

    fn dependencies_satisfied(&self, step: &PipelineStep, state: &BatchState) -> bool {
        self.definition
            .dependency_orders(step)
            .into_iter()
            .all(|order| state.status_of(order).is_some_and(|s| s.is_satisfied()))
    }

    /// First dependency that failed, or that an upstream failure skipped.
    ///
    /// An enabled step only ends up SKIPPED when something above it failed, so the
    /// skip carries the failure downstream.
    fn failed_dependency(&self, step: &PipelineStep, state: &BatchState) -> Option<String> {
        step.depends_on.iter().find_map(|name| {
            let dep = self.definition.step_named(name)?;
            let blocked = match state.status_of(dep.step_order)? {
                StepStatus::Failed => true,
                StepStatus::Skipped => dep.enabled,
                _ => false,
            };
            blocked.then(|| name.clone())
        })
    }

    /// In-flight steps whose last dispatch is at least `threshold` old
    pub fn stale_steps(
        &self,
        state: &BatchState,
        threshold: Duration,
        now: DateTime<Utc>,
    ) -> Vec<u32> {
        let threshold = chrono::Duration::from_std(threshold).unwrap_or(chrono::Duration::MAX);
        state
            .in_flight()
            .filter(|s| match s.last_dispatch_time.or(s.start_time) {
                Some(sent) => now - sent >= threshold,
                None => true,
            })
            .map(|s| s.step_order)
            .collect()
    }

    /// Every step of the definition has reached a terminal status
    pub fn is_finished(&self, state: &BatchState) -> bool {
        self.definition
            .steps()
            .iter()
            .all(|step| state.status_of(step.step_order).is_some_and(|s| s.is_terminal()))
    }

    /// Terminal batch status once nothing is left to run and nothing escalated
    ///
    /// A required step counts as done when it completed, or was skipped because it is
    /// disabled. A required step skipped by an upstream failure did not do its work.
    pub fn outcome(&self, state: &BatchState) -> BatchStatus {
        let all_required_done = self
            .definition
            .steps()
            .iter()
            .filter(|step| step.required)
            .all(|step| match state.status_of(step.step_order) {
                Some(StepStatus::Completed) => true,
                Some(StepStatus::Skipped) => !step.enabled,
                _ => false,
            });

        if all_required_done {
            BatchStatus::Completed
        } else {
            BatchStatus::Failed
        }
    }
}
