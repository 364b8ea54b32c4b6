//! `--report` mode: render a compact text view of the state file.

use std::path::Path;

use anyhow::Result;

use drover_core::state::{StateDocument, compact_text, now_ts, read_state};

/// Render the report for a state document.
pub fn render_report(state_path: &Path, document: &StateDocument) -> String {
    let mut blocked_rows: Vec<String> = Vec::new();
    let mut errored_rows: Vec<String> = Vec::new();

    for task in &document.tasks {
        let block_reason = compact_text(task.block_reason.as_deref(), 220);
        let last_error = compact_text(task.last_error.as_deref(), 220);
        if task.status == "blocked" {
            let reason = if !block_reason.is_empty() {
                block_reason
            } else if !last_error.is_empty() {
                last_error
            } else {
                "(no reason recorded)".to_string()
            };
            blocked_rows.push(format!(
                "- {} (attempts={}): {reason}",
                task.id, task.attempts
            ));
        } else if !last_error.is_empty() {
            errored_rows.push(format!(
                "- {} [{}] (attempts={}): {last_error}",
                task.id, task.status, task.attempts
            ));
        }
    }

    let cooldown_remaining = if document.orchestrator.quota_cooldown_until > 0.0 {
        (document.orchestrator.quota_cooldown_until - now_ts()).max(0.0) as i64
    } else {
        0
    };

    let mut lines: Vec<String> = Vec::new();
    lines.push(format!("state: {}", state_path.display()));
    lines.push(format!("updated_at: {}", document.updated_at));
    lines.push(format!(
        "summary: pending={} running={} completed={} blocked={}",
        document.summary.pending,
        document.summary.running,
        document.summary.completed,
        document.summary.blocked,
    ));
    lines.push(format!(
        "quota: failures_total={} cooldown_remaining_seconds={cooldown_remaining}",
        document.orchestrator.quota_failures_total,
    ));
    lines.push(String::new());
    lines.push("blocked tasks:".to_string());
    if blocked_rows.is_empty() {
        lines.push("- none".to_string());
    } else {
        lines.extend(blocked_rows);
    }
    lines.push(String::new());
    lines.push("latest task errors:".to_string());
    if errored_rows.is_empty() {
        lines.push("- none".to_string());
    } else {
        let shown = errored_rows.len().min(20);
        lines.extend(errored_rows.iter().take(20).cloned());
        if errored_rows.len() > shown {
            lines.push(format!("- ... {} more", errored_rows.len() - shown));
        }
    }
    lines.join("\n")
}

/// Load the state file and render the report.
///
/// A missing file renders a one-line notice; malformed contents are an
/// error so the caller can exit with a configuration-error code.
pub fn render_state_report(state_path: &Path) -> Result<String> {
    if !state_path.exists() {
        return Ok(format!("state file not found: {}", state_path.display()));
    }
    let document = read_state(state_path)?;
    Ok(render_report(state_path, &document))
}
