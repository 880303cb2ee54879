//! CLI output formatting

use crate::{
    core::{BatchState, BatchStatus, StepState, StepStatus},
    execution::ExecutionEvent,
};
use console::Emoji;

// Re-export style
pub use console::style;

// Emojis for output
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
pub static SPINNER: Emoji<'_, '_> = Emoji("⏳ ", "~ ");
pub static INFO: Emoji<'_, '_> = Emoji("ℹ️  ", "i ");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "! ");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "> ");
pub static SKIP: Emoji<'_, '_> = Emoji("⏭️  ", "- ");

/// Format a step status for display
pub fn format_step_status(status: StepStatus) -> String {
    match status {
        StepStatus::Pending => style("PENDING").dim().to_string(),
        StepStatus::Dispatched => style("DISPATCHED").yellow().to_string(),
        StepStatus::Processing => style("PROCESSING").yellow().to_string(),
        StepStatus::Completed => style("COMPLETED").green().to_string(),
        StepStatus::Failed => style("FAILED").red().to_string(),
        StepStatus::Skipped => style("SKIPPED").dim().to_string(),
    }
}

/// Format a batch status for display
pub fn format_batch_status(status: BatchStatus) -> String {
    match status {
        BatchStatus::Received => style("RECEIVED").dim().to_string(),
        BatchStatus::Processing => style("PROCESSING").yellow().to_string(),
        BatchStatus::Completed => style("COMPLETED").green().to_string(),
        BatchStatus::Failed => style("FAILED").red().to_string(),
        BatchStatus::Escalated => style("ESCALATED").magenta().to_string(),
    }
}

fn status_icon(status: BatchStatus) -> &'static Emoji<'static, 'static> {
    match status {
        BatchStatus::Completed => &CHECK,
        BatchStatus::Failed => &CROSS,
        BatchStatus::Escalated => &WARN,
        BatchStatus::Processing => &SPINNER,
        BatchStatus::Received => &INFO,
    }
}

/// One line per step: order, name, status, attempts and counts
pub fn format_step_line(step: &StepState) -> String {
    let mut line = format!(
        "  {:>6}  {:<24} {:<12}",
        step.step_order,
        step.subroutine_name,
        format_step_status(step.status)
    );
    if step.attempts() > 1 {
        line.push_str(&format!(" attempts={}", step.attempts()));
    }
    if step.status == StepStatus::Completed {
        line.push_str(&format!(
            " records={} errors={} warnings={}",
            step.record_count, step.error_count, step.warning_count
        ));
    }
    if !step.error_details.is_empty() {
        line.push_str(&format!(" {}", style(&step.error_details).dim()));
    }
    line
}

/// Multi-line summary of a batch and its steps
pub fn format_batch_state(state: &BatchState) -> String {
    let mut lines = vec![format!(
        "{}Batch {} ({} / {}) {}",
        status_icon(state.status),
        style(&state.batch_id).bold(),
        state.plan_id,
        state.pay_freq,
        format_batch_status(state.status)
    )];

    lines.push(format!("  Source: {}", style(&state.source_path).dim()));
    if let Some(started) = state.start_time {
        lines.push(format!("  Started: {}", style(started.to_rfc3339()).dim()));
        if let Some(ended) = state.end_time {
            if let Ok(duration) = ended.signed_duration_since(started).to_std() {
                lines.push(format!("  Duration: {}", style(format_duration(duration)).dim()));
            }
        }
    }
    lines.push(format!(
        "  Progress: {} ({} records)",
        style(format!("{:.0}%", state.progress() * 100.0)).cyan(),
        state.record_count
    ));
    if !state.escalation_reason.is_empty() {
        lines.push(format!(
            "  Escalation: {}",
            style(&state.escalation_reason).magenta()
        ));
    }

    lines.extend(state.steps.iter().map(format_step_line));
    lines.join("\n")
}

/// Format an execution event for display
pub fn format_execution_event(event: &ExecutionEvent) -> String {
    match event {
        ExecutionEvent::BatchStarted {
            batch_id,
            pipeline,
            resumed,
        } => format!(
            "{}{} batch {} on {}",
            ROCKET,
            if *resumed { "Resuming" } else { "Starting" },
            style(batch_id).bold(),
            style(pipeline).cyan()
        ),
        ExecutionEvent::StepDispatched {
            step_order,
            subroutine_name,
            agent,
            attempt,
        } => {
            if *attempt > 1 {
                format!(
                    "{}{} {} → {} (attempt {})",
                    SPINNER,
                    style(step_order).dim(),
                    style(subroutine_name).cyan(),
                    style(agent).dim(),
                    attempt
                )
            } else {
                format!(
                    "{}{} {} → {}",
                    SPINNER,
                    style(step_order).dim(),
                    style(subroutine_name).cyan(),
                    style(agent).dim()
                )
            }
        }
        ExecutionEvent::StepAcknowledged {
            step_order,
            subroutine_name,
        } => format!(
            "{}{} {} processing",
            INFO,
            style(step_order).dim(),
            style(subroutine_name).dim()
        ),
        ExecutionEvent::StepCompleted {
            step_order,
            subroutine_name,
            record_count,
        } => format!(
            "{}{} {} ({} records)",
            CHECK,
            style(step_order).dim(),
            style(subroutine_name).green(),
            record_count
        ),
        ExecutionEvent::StepFailed {
            step_order,
            subroutine_name,
            error,
            attempt,
            will_retry,
        } => {
            let icon = if *will_retry { &WARN } else { &CROSS };
            let suffix = if *will_retry { ", retrying" } else { "" };
            format!(
                "{}{} {} failed on attempt {}{}: {}",
                icon,
                style(step_order).dim(),
                style(subroutine_name).red(),
                attempt,
                suffix,
                style(error).dim()
            )
        }
        ExecutionEvent::StepSkipped {
            step_order,
            subroutine_name,
            reason,
        } => format!(
            "{}{} {} skipped ({})",
            SKIP,
            style(step_order).dim(),
            style(subroutine_name).dim(),
            reason
        ),
        ExecutionEvent::StepRecovered {
            step_order,
            subroutine_name,
        } => format!(
            "{}{} {} re-dispatched after going stale",
            WARN,
            style(step_order).dim(),
            style(subroutine_name).yellow()
        ),
        ExecutionEvent::CompletionDiscarded { step_order, reason } => format!(
            "{}Ignored duplicate callback for step {}: {}",
            INFO,
            step_order,
            style(reason).dim()
        ),
        ExecutionEvent::BatchEscalated { batch_id, payload } => format!(
            "{}Batch {} escalated ({}): {}",
            WARN,
            style(batch_id).bold(),
            payload.trigger,
            style(&payload.reason).magenta()
        ),
        ExecutionEvent::BatchFinished { batch_id, status } => format!(
            "{}Batch {} {}",
            status_icon(*status),
            style(batch_id).bold(),
            format_batch_status(*status)
        ),
    }
}

pub fn format_duration(duration: std::time::Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{}.{:03}s", secs, duration.subsec_millis())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
