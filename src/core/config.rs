//! Pipeline definition records as stored in the rule store

use crate::core::error::{OrchestratorError, Result};
use crate::core::step::PipelineStep;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// What happens to records carrying STOP-level validation issues
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopIssuePolicy {
    /// Affected records are excluded downstream; escalate only above the ratio threshold
    #[default]
    ExcludeAffected,
    /// Any STOP-level issue blocks the whole batch
    HaltBatch,
}

/// Pipeline definition for one client and pay frequency, as loaded from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub plan_id: String,

    pub pay_freq: String,

    #[serde(default)]
    pub stop_issue_policy: StopIssuePolicy,

    pub steps: Vec<PipelineStep>,
}

impl PipelineConfig {
    /// Parse a pipeline definition from a YAML string
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        let config: PipelineConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Rule store key, `{planId}_{payFreq}`
    pub fn key(&self) -> String {
        pipeline_key(&self.plan_id, &self.pay_freq)
    }

    /// Validate the definition's step graph
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| OrchestratorError::InvalidPipelineDefinition {
            pipeline: self.key(),
            reason,
        };

        if self.steps.is_empty() {
            return Err(invalid("pipeline has no steps".to_string()));
        }

        let mut seen_orders = HashSet::new();
        let mut seen_names = HashSet::new();
        for step in &self.steps {
            if !seen_orders.insert(step.step_order) {
                return Err(invalid(format!("duplicate step order {}", step.step_order)));
            }
            if !seen_names.insert(step.subroutine_name.as_str()) {
                return Err(invalid(format!(
                    "duplicate subroutine name '{}'",
                    step.subroutine_name
                )));
            }
        }

        for step in &self.steps {
            for dep in &step.depends_on {
                if dep == &step.subroutine_name {
                    return Err(invalid(format!(
                        "step '{}' depends on itself",
                        step.subroutine_name
                    )));
                }
                if !seen_names.contains(dep.as_str()) {
                    return Err(invalid(format!(
                        "step '{}' depends on non-existent step '{}'",
                        step.subroutine_name, dep
                    )));
                }
            }
        }

        self.check_cycles().map_err(invalid)
    }

    /// Check for cycles in the dependency graph
    fn check_cycles(&self) -> std::result::Result<(), String> {
        let by_name: HashMap<&str, &PipelineStep> = self
            .steps
            .iter()
            .map(|s| (s.subroutine_name.as_str(), s))
            .collect();

        let mut visited = HashSet::new();
        let mut recursion_stack = HashSet::new();

        for step in &self.steps {
            if !visited.contains(step.subroutine_name.as_str()) {
                Self::dfs_check(
                    &step.subroutine_name,
                    &by_name,
                    &mut visited,
                    &mut recursion_stack,
                )?;
            }
        }

        Ok(())
    }

    fn dfs_check<'a>(
        name: &'a str,
        by_name: &HashMap<&'a str, &'a PipelineStep>,
        visited: &mut HashSet<&'a str>,
        recursion_stack: &mut HashSet<&'a str>,
    ) -> std::result::Result<(), String> {
        visited.insert(name);
        recursion_stack.insert(name);

        if let Some(step) = by_name.get(name) {
            for dep in &step.depends_on {
                if recursion_stack.contains(dep.as_str()) {
                    return Err(format!(
                        "cycle detected in dependency graph involving step '{}'",
                        dep
                    ));
                }
                if !visited.contains(dep.as_str()) {
                    Self::dfs_check(dep, by_name, visited, recursion_stack)?;
                }
            }
        }

        recursion_stack.remove(name);
        Ok(())
    }
}

pub fn pipeline_key(plan_id: &str, pay_freq: &str) -> String {
    format!("{}_{}", plan_id, pay_freq)
}
