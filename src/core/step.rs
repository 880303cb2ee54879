//! Step domain model

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt;

/// Agent role that executes a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentRole {
    #[serde(alias = "IDP")]
    Ingestion,
    #[serde(alias = "VALIDATOR")]
    Validation,
    #[serde(alias = "TRANSFORM")]
    Transformation,
    Compliance,
    Orchestration,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Ingestion => "INGESTION",
            AgentRole::Validation => "VALIDATION",
            AgentRole::Transformation => "TRANSFORMATION",
            AgentRole::Compliance => "COMPLIANCE",
            AgentRole::Orchestration => "ORCHESTRATION",
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_true() -> bool {
    true
}

/// A single step in a pipeline definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStep {
    /// Position in the pipeline, unique per definition
    pub step_order: u32,

    /// Name other steps use to depend on this one
    pub subroutine_name: String,

    /// Role that executes the step
    pub agent: AgentRole,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Whether a terminal failure of this step blocks the batch
    #[serde(default = "default_true")]
    pub required: bool,

    /// Subroutine names this step depends on
    #[serde(default)]
    pub depends_on: BTreeSet<String>,

    /// Passed through to the agent unmodified
    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
}

impl PipelineStep {
    pub fn new(step_order: u32, subroutine_name: &str, agent: AgentRole) -> Self {
        Self {
            step_order,
            subroutine_name: subroutine_name.to_string(),
            agent,
            enabled: true,
            required: true,
            depends_on: BTreeSet::new(),
            parameters: serde_json::Map::new(),
        }
    }

    pub fn depends_on(mut self, subroutine_name: &str) -> Self {
        self.depends_on.insert(subroutine_name.to_string());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn with_parameter(mut self, key: &str, value: serde_json::Value) -> Self {
        self.parameters.insert(key.to_string(), value);
        self
    }

    /// Check if all dependencies are in the satisfied set
    pub fn dependencies_met(&self, satisfied: &HashSet<&str>) -> bool {
        self.depends_on
            .iter()
            .all(|dep| satisfied.contains(dep.as_str()))
    }
}
