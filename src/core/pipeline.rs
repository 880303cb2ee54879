//! Pipeline domain model

use crate::core::{
    config::{pipeline_key, PipelineConfig, StopIssuePolicy},
    error::Result,
    step::PipelineStep,
};
use serde::{Deserialize, Serialize};

/// A validated pipeline definition with steps in ascending `step_order`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub plan_id: String,
    pub pay_freq: String,
    pub stop_issue_policy: StopIssuePolicy,
    steps: Vec<PipelineStep>,
}

impl PipelineDefinition {
    /// Validate a raw definition and order its steps
    pub fn from_config(config: PipelineConfig) -> Result<Self> {
        config.validate()?;

        let mut steps = config.steps;
        steps.sort_by_key(|s| s.step_order);

        Ok(Self {
            plan_id: config.plan_id,
            pay_freq: config.pay_freq,
            stop_issue_policy: config.stop_issue_policy,
            steps,
        })
    }

    pub fn key(&self) -> String {
        pipeline_key(&self.plan_id, &self.pay_freq)
    }

    /// Steps in ascending `step_order`
    pub fn steps(&self) -> &[PipelineStep] {
        &self.steps
    }

    pub fn step(&self, step_order: u32) -> Option<&PipelineStep> {
        self.steps.iter().find(|s| s.step_order == step_order)
    }

    pub fn step_named(&self, subroutine_name: &str) -> Option<&PipelineStep> {
        self.steps
            .iter()
            .find(|s| s.subroutine_name == subroutine_name)
    }

    /// Step orders of everything `step` depends on
    pub fn dependency_orders(&self, step: &PipelineStep) -> Vec<u32> {
        step.depends_on
            .iter()
            .filter_map(|name| self.step_named(name))
            .map(|s| s.step_order)
            .collect()
    }
}
