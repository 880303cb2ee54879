//! Process-wide orchestrator settings
//!
//! Built once at startup and shared read-only (`Arc<Settings>`). Every field has a
//! default, so an empty or partial YAML file is valid.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Orchestrator settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Total dispatches allowed for one step, first attempt included
    #[serde(default = "default_max_step_attempts")]
    pub max_step_attempts: u32,

    /// In-flight steps older than this are treated as lost
    #[serde(default = "default_staleness_threshold_secs")]
    pub staleness_threshold_secs: u64,

    #[serde(default = "default_pipeline_cache_ttl_secs")]
    pub pipeline_cache_ttl_secs: u64,

    #[serde(default = "default_state_cache_ttl_secs")]
    pub state_cache_ttl_secs: u64,

    #[serde(default = "default_rules_cache_ttl_secs")]
    pub rules_cache_ttl_secs: u64,

    /// Attempts for a transport call that fails with a transient error
    #[serde(default = "default_transient_retry_attempts")]
    pub transient_retry_attempts: u32,

    /// Base delay for exponential backoff between transient retries
    #[serde(default = "default_transient_backoff_ms")]
    pub transient_backoff_ms: u64,

    #[serde(default)]
    pub escalation: EscalationSettings,
}

/// Thresholds for the escalation triggers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationSettings {
    #[serde(default = "default_min_schema_confidence")]
    pub min_schema_confidence: f64,

    /// Fraction of records with STOP-level issues above which the batch escalates
    #[serde(default = "default_max_stop_issue_ratio")]
    pub max_stop_issue_ratio: f64,

    /// Distinct client ids allowed on hold before escalating
    #[serde(default = "default_max_held_clients")]
    pub max_held_clients: usize,

    #[serde(default = "default_deadline_buffer_minutes")]
    pub deadline_buffer_minutes: i64,

    /// Allowed relative deviation from the contribution baseline (2.0 = 200%)
    #[serde(default = "default_max_contribution_variance")]
    pub max_contribution_variance: f64,
}

fn default_max_step_attempts() -> u32 {
    3
}

fn default_staleness_threshold_secs() -> u64 {
    900
}

fn default_pipeline_cache_ttl_secs() -> u64 {
    3600
}

fn default_state_cache_ttl_secs() -> u64 {
    14400
}

fn default_rules_cache_ttl_secs() -> u64 {
    300
}

fn default_transient_retry_attempts() -> u32 {
    3
}

fn default_transient_backoff_ms() -> u64 {
    200
}

fn default_min_schema_confidence() -> f64 {
    0.80
}

fn default_max_stop_issue_ratio() -> f64 {
    0.50
}

fn default_max_held_clients() -> usize {
    1
}

fn default_deadline_buffer_minutes() -> i64 {
    30
}

fn default_max_contribution_variance() -> f64 {
    2.0
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_step_attempts: default_max_step_attempts(),
            staleness_threshold_secs: default_staleness_threshold_secs(),
            pipeline_cache_ttl_secs: default_pipeline_cache_ttl_secs(),
            state_cache_ttl_secs: default_state_cache_ttl_secs(),
            rules_cache_ttl_secs: default_rules_cache_ttl_secs(),
            transient_retry_attempts: default_transient_retry_attempts(),
            transient_backoff_ms: default_transient_backoff_ms(),
            escalation: EscalationSettings::default(),
        }
    }
}

impl Default for EscalationSettings {
    fn default() -> Self {
        Self {
            min_schema_confidence: default_min_schema_confidence(),
            max_stop_issue_ratio: default_max_stop_issue_ratio(),
            max_held_clients: default_max_held_clients(),
            deadline_buffer_minutes: default_deadline_buffer_minutes(),
            max_contribution_variance: default_max_contribution_variance(),
        }
    }
}

impl Settings {
    /// Load settings from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file {}", path.display()))?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        let settings: Settings = serde_yaml::from_str(yaml)?;
        if settings.max_step_attempts == 0 {
            anyhow::bail!("max_step_attempts must be at least 1");
        }
        Ok(settings)
    }

    pub fn staleness_threshold(&self) -> Duration {
        Duration::from_secs(self.staleness_threshold_secs)
    }

    /// Backoff before transient retry number `attempt` (1-based)
    pub fn transient_backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.transient_backoff_ms.saturating_mul(factor))
    }
}
