//! Escalation router - decides when a batch must go to human review

use crate::core::{error::Result, EscalationSettings, StopIssuePolicy};
use crate::execution::dispatch::DispatchGateway;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Escalation triggers, in priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationTrigger {
    RequiredStepFailed,
    LowSchemaConfidence,
    StopIssues,
    MultipleHolds,
    DeadlineRisk,
    FinancialAnomaly,
}

impl fmt::Display for EscalationTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EscalationTrigger::RequiredStepFailed => "required_step_failed",
            EscalationTrigger::LowSchemaConfidence => "low_schema_confidence",
            EscalationTrigger::StopIssues => "stop_issues",
            EscalationTrigger::MultipleHolds => "multiple_holds",
            EscalationTrigger::DeadlineRisk => "deadline_risk",
            EscalationTrigger::FinancialAnomaly => "financial_anomaly",
        };
        f.write_str(name)
    }
}

/// Context handed to human reviewers; written once
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationPayload {
    pub batch_id: String,
    pub plan_id: String,
    pub trigger: EscalationTrigger,
    pub reason: String,
    #[serde(default)]
    pub failed_step: String,
    #[serde(default)]
    pub error_details: String,
    pub record_count: u64,
    pub affected_record_count: u64,
    pub custodian_deadline: Option<DateTime<Utc>>,
    /// Minutes left before the custodian cutoff; negative once it has passed
    pub time_remaining_minutes: Option<i64>,
    pub raised_at: DateTime<Utc>,
}

/// A required step that ran out of attempts
#[derive(Debug, Clone, PartialEq)]
pub struct FailedStep {
    pub subroutine_name: String,
    pub attempts: u32,
    pub error_details: String,
}

/// Everything the triggers look at
#[derive(Debug, Clone, PartialEq)]
pub struct EscalationContext {
    pub batch_id: String,
    pub plan_id: String,
    pub failed_step: Option<FailedStep>,
    pub schema_confidence: Option<f64>,
    pub stop_issue_records: u64,
    pub record_count: u64,
    pub stop_issue_policy: StopIssuePolicy,
    /// Client ids of the plan currently under hold
    pub held_client_ids: Vec<String>,
    pub custodian_deadline: Option<DateTime<Utc>>,
    pub now: DateTime<Utc>,
    pub contribution_total: Option<f64>,
    pub contribution_baseline: Option<f64>,
}

impl EscalationContext {
    pub fn new(batch_id: &str, plan_id: &str) -> Self {
        Self {
            batch_id: batch_id.to_string(),
            plan_id: plan_id.to_string(),
            failed_step: None,
            schema_confidence: None,
            stop_issue_records: 0,
            record_count: 0,
            stop_issue_policy: StopIssuePolicy::default(),
            held_client_ids: Vec::new(),
            custodian_deadline: None,
            now: Utc::now(),
            contribution_total: None,
            contribution_baseline: None,
        }
    }

    fn minutes_remaining(&self) -> Option<i64> {
        self.custodian_deadline
            .map(|deadline| (deadline - self.now).num_minutes())
    }
}

/// Today's cutoff at `hour_utc`, on the date of `now`
///
/// The deadline never rolls over to the next day. Once the cutoff hour has passed, every
/// batch for that client sees negative minutes remaining and escalates with
/// `DeadlineRisk` before any step runs, until the date changes. `None` for an hour
/// outside `0..24`.
pub fn custodian_deadline(now: DateTime<Utc>, hour_utc: u32) -> Option<DateTime<Utc>> {
    let naive = now.date_naive().and_hms_opt(hour_utc, 0, 0)?;
    Some(Utc.from_utc_datetime(&naive))
}

pub struct EscalationRouter {
    settings: EscalationSettings,
    gateway: Arc<DispatchGateway>,
}

impl EscalationRouter {
    pub fn new(settings: EscalationSettings, gateway: Arc<DispatchGateway>) -> Self {
        Self { settings, gateway }
    }

    /// Evaluate the triggers in priority order; the first match wins
    pub fn evaluate(&self, ctx: &EscalationContext) -> Option<EscalationPayload> {
        let (trigger, reason) = self.first_match(ctx)?;
        debug!("Batch {} matched escalation trigger {}", ctx.batch_id, trigger);

        let failed = ctx.failed_step.as_ref().filter(|_| trigger == EscalationTrigger::RequiredStepFailed);
        Some(EscalationPayload {
            batch_id: ctx.batch_id.clone(),
            plan_id: ctx.plan_id.clone(),
            trigger,
            reason,
            failed_step: failed.map(|f| f.subroutine_name.clone()).unwrap_or_default(),
            error_details: failed.map(|f| f.error_details.clone()).unwrap_or_default(),
            record_count: ctx.record_count,
            affected_record_count: ctx.stop_issue_records,
            custodian_deadline: ctx.custodian_deadline,
            time_remaining_minutes: ctx.minutes_remaining(),
            raised_at: ctx.now,
        })
    }

    /// Evaluate and, on a match, publish to the human-review queue
    pub async fn route(&self, ctx: &EscalationContext) -> Result<Option<EscalationPayload>> {
        let Some(payload) = self.evaluate(ctx) else {
            return Ok(None);
        };
        self.gateway.on_escalation(&payload).await?;
        Ok(Some(payload))
    }

    fn first_match(&self, ctx: &EscalationContext) -> Option<(EscalationTrigger, String)> {
        let limits = &self.settings;

        if let Some(failed) = &ctx.failed_step {
            return Some((
                EscalationTrigger::RequiredStepFailed,
                format!("required step failed after {} retries", failed.attempts),
            ));
        }

        if let Some(confidence) = ctx.schema_confidence {
            if confidence < limits.min_schema_confidence {
                return Some((
                    EscalationTrigger::LowSchemaConfidence,
                    format!(
                        "schema match confidence {:.2} below {:.2}",
                        confidence, limits.min_schema_confidence
                    ),
                ));
            }
        }

        if ctx.stop_issue_records > 0 {
            let exceeded = match ctx.stop_issue_policy {
                StopIssuePolicy::HaltBatch => true,
                StopIssuePolicy::ExcludeAffected if ctx.record_count == 0 => true,
                StopIssuePolicy::ExcludeAffected => {
                    ctx.stop_issue_records as f64 / ctx.record_count as f64
                        > limits.max_stop_issue_ratio
                }
            };
            if exceeded {
                return Some((
                    EscalationTrigger::StopIssues,
                    format!(
                        "STOP-level issues affect {} of {} records",
                        ctx.stop_issue_records, ctx.record_count
                    ),
                ));
            }
        }

        let held: BTreeSet<&str> = ctx.held_client_ids.iter().map(String::as_str).collect();
        if held.len() > limits.max_held_clients {
            return Some((
                EscalationTrigger::MultipleHolds,
                format!(
                    "{} client ids on hold for plan {}: {}",
                    held.len(),
                    ctx.plan_id,
                    held.into_iter().collect::<Vec<_>>().join(", ")
                ),
            ));
        }

        if let Some(remaining) = ctx.minutes_remaining() {
            if remaining < limits.deadline_buffer_minutes {
                return Some((
                    EscalationTrigger::DeadlineRisk,
                    format!("custodian deadline at risk: {} minutes remaining", remaining),
                ));
            }
        }

        if let (Some(total), Some(baseline)) = (ctx.contribution_total, ctx.contribution_baseline) {
            if baseline > 0.0 {
                let variance = (total - baseline).abs() / baseline;
                if variance > limits.max_contribution_variance {
                    return Some((
                        EscalationTrigger::FinancialAnomaly,
                        format!(
                            "contribution total {:.2} deviates {:.0}% from baseline {:.2}",
                            total,
                            variance * 100.0,
                            baseline
                        ),
                    ));
                }
            }
        }

        None
    }
}
