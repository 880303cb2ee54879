//! Business rule records read from the rule store

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Partition key for rules that apply to every client without an override
pub const GLOBAL_CLIENT_KEY: &str = "CLIENT#GLOBAL";

pub fn client_key(plan_id: &str) -> String {
    format!("CLIENT#{}", plan_id)
}

/// A calculation rule (match formula, ER contribution, compensation)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalculationRule {
    pub calc_type: String,
    pub formula: String,
    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
}

/// A validation rule for one category (SSN, dates, amounts, ...)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRule {
    pub category: String,
    pub rule_id: String,
    #[serde(default)]
    pub checks: Vec<serde_json::Value>,
    #[serde(default)]
    pub invalid_values: Vec<String>,
    #[serde(default)]
    pub thresholds: HashMap<String, serde_json::Value>,
}

/// A hold placed on one client id of a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HoldRecord {
    pub plan_id: String,
    pub client_id: String,
    #[serde(default)]
    pub hold_reason_cd: String,
    #[serde(default)]
    pub hold_reason: String,
    #[serde(default)]
    pub hold_as_of_date: Option<String>,
    #[serde(default)]
    pub addl_info: String,
}

/// IRS annual limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IrsLimits {
    pub year: i32,
    #[serde(default)]
    pub limit_402g_deferral: f64,
    #[serde(default)]
    pub limit_401a17_comp: f64,
    #[serde(default)]
    pub limit_415c_defined_contrib: f64,
    #[serde(default)]
    pub catchup_limit: f64,
}

/// Per-client processing configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub custodian: Option<String>,

    /// Hour of day (UTC) of the custodian funding cutoff
    #[serde(default)]
    pub deadline_hour_utc: Option<u32>,

    /// Historical contribution total used for anomaly detection
    #[serde(default)]
    pub contribution_baseline: Option<f64>,
}
