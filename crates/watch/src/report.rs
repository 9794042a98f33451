//! Text and JSON rendering for the terminal.
//!
//! Every function here is pure so the output format can be tested
//! without a backend.

use callcoach_core::progress::ProgressSnapshot;
use callcoach_progress::api::{CallDetail, Evaluation, HealthStatus, RetestResult};
use callcoach_progress::channel::AbandonReason;
use callcoach_progress::driver::JobOutcome;
use callcoach_progress::events::JobEvent;
use serde_json::json;

/// Width of the textual progress bar.
const BAR_WIDTH: usize = 20;

/// One line describing a lifecycle event.
pub fn format_event(event: &JobEvent) -> String {
    match event {
        JobEvent::Submitted { job_id, filename } => format!("[job {job_id}] accepted   {filename}"),
        JobEvent::Monitoring { job_id } => format!("[job {job_id}] monitoring"),
        JobEvent::Progress { snapshot } => format_progress(snapshot),
        JobEvent::ChannelAbandoned {
            job_id,
            attempts,
            reason,
        } => match reason {
            AbandonReason::ClosedByServer => {
                format!("[job {job_id}] server closed live updates, polling status")
            }
            AbandonReason::ReconnectsExhausted => format!(
                "[job {job_id}] live updates lost after {attempts} reconnect attempts, polling status"
            ),
        },
        JobEvent::Succeeded { job_id } => format!("[job {job_id}] analysis complete"),
        JobEvent::Failed { job_id, reason } => format!("[job {job_id}] FAILED: {reason}"),
        JobEvent::Cancelled { job_id } => format!("[job {job_id}] cancelled"),
    }
}

pub fn format_progress(snapshot: &ProgressSnapshot) -> String {
    let line = format!(
        "[job {}] {:<10} {} {:>3}%",
        snapshot.job_id,
        snapshot.phase.as_str(),
        progress_bar(snapshot.percent),
        snapshot.percent
    );
    match &snapshot.message {
        Some(message) if !message.is_empty() => format!("{line}  {message}"),
        _ => line,
    }
}

/// `[#####---------------]` for 25%.
pub fn progress_bar(percent: u8) -> String {
    let filled = usize::from(percent.min(100)) * BAR_WIDTH / 100;
    format!("[{}{}]", "#".repeat(filled), "-".repeat(BAR_WIDTH - filled))
}

/// Final line(s) for one job.
pub fn format_outcome(outcome: &JobOutcome) -> String {
    match outcome {
        JobOutcome::Succeeded { job_id, record } => match record {
            Some(record) => format_record(record),
            None => format!("call {job_id}: completed (record unavailable)"),
        },
        JobOutcome::Failed { job_id, reason, .. } => {
            format!("call {job_id}: failed: {reason}")
        }
        JobOutcome::Cancelled { job_id } => format!("call {job_id}: monitoring cancelled"),
    }
}

/// Summary of a refreshed call record.
pub fn format_record(record: &CallDetail) -> String {
    let mut parts = vec![format!("call {} ({})", record.id, record.filename)];
    if let Some(manager) = &record.manager {
        parts.push(format!("manager {manager}"));
    }
    if let Some(duration) = record.duration {
        parts.push(format!("duration {}", format_duration(duration)));
    }

    let mut summary = parts.join(", ");
    match record.latest_evaluation() {
        Some(evaluation) => {
            summary.push('\n');
            summary.push_str(&format_evaluation(evaluation));
        }
        None => summary.push_str(", not evaluated"),
    }
    summary
}

pub fn format_evaluation(evaluation: &Evaluation) -> String {
    let score = evaluation
        .total_score
        .map(|score| score.to_string())
        .unwrap_or_else(|| "n/a".to_string());
    let mut line = format!(
        "  score {score}, violations: {}{}",
        if evaluation.violations { "yes" } else { "no" },
        if evaluation.is_retest { " (retest)" } else { "" }
    );
    if let Some(comments) = evaluation.comments.as_deref().filter(|c| !c.is_empty()) {
        line.push_str("\n  ");
        line.push_str(comments);
    }
    line
}

pub fn format_retest(result: &RetestResult) -> String {
    format!(
        "call {} re-scored\n{}",
        result.call_id,
        format_evaluation(&result.evaluation)
    )
}

pub fn format_health(health: &HealthStatus) -> String {
    let state = if health.reachable { "ok" } else { "unreachable" };
    format!("{} {state}: {}", health.url, health.message)
}

/// `m:ss` for a duration in seconds.
pub fn format_duration(seconds: f64) -> String {
    let total = seconds.max(0.0).round() as u64;
    format!("{}:{:02}", total / 60, total % 60)
}

/// A JSON line for an event.
pub fn event_json(event: &JobEvent) -> String {
    serde_json::to_string(event).unwrap_or_else(|_| json!({ "event": "unrenderable" }).to_string())
}

/// A JSON line for an outcome.
pub fn outcome_json(outcome: &JobOutcome) -> String {
    let value = match outcome {
        JobOutcome::Succeeded { job_id, record } => json!({
            "outcome": "succeeded",
            "job_id": job_id,
            "total_score": record
                .as_ref()
                .and_then(|r| r.latest_evaluation())
                .and_then(|e| e.total_score),
        }),
        JobOutcome::Failed { job_id, reason, .. } => json!({
            "outcome": "failed",
            "job_id": job_id,
            "reason": reason,
        }),
        JobOutcome::Cancelled { job_id } => json!({
            "outcome": "cancelled",
            "job_id": job_id,
        }),
    };
    value.to_string()
}

/// Whether a run should exit successfully.
pub fn all_succeeded(outcomes: &[JobOutcome]) -> bool {
    outcomes.iter().all(JobOutcome::is_success)
}
