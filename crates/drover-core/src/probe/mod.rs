//! Optional pre-flight model probing.
//!
//! With `--probe-models`, every unique model in the escalation ladder is
//! probed once through the codex CLI before orchestration starts. Models
//! the account cannot use are dropped from the ladder. Probe failures are
//! treated conservatively: timeouts, quota hits, and inconclusive output
//! all count as supported, leaving transient problems to runtime retries.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Result, bail};
use tokio::process::Command;

use crate::classify::{detect_quota_or_rate_limit, is_model_unsupported};
use crate::profile::ModelProfile;
use crate::state::EventSink;

/// Probe one model. Returns `(supported, reason)`.
pub async fn probe_model_support(
    repo_root: &Path,
    model: &str,
    timeout: Duration,
) -> (bool, String) {
    let mut command = Command::new("codex");
    command
        .args([
            "exec",
            "-m",
            model,
            "-c",
            "model_reasoning_effort=low",
            "--cd",
        ])
        .arg(repo_root)
        .args(["--skip-git-repo-check", "--json", "Reply with OK"])
        .stdin(std::process::Stdio::null());

    let output = match tokio::time::timeout(timeout, command.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(error)) => {
            return (
                true,
                format!("probe could not run ({error}); treating as supported"),
            );
        }
        Err(_elapsed) => {
            return (
                true,
                format!(
                    "probe timed out after {}s; treating as supported",
                    timeout.as_secs()
                ),
            );
        }
    };

    let combined = format!(
        "{}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    if output.status.success() && combined.contains("\"turn.completed\"") {
        return (true, "supported".to_string());
    }
    if is_model_unsupported(&combined) {
        return (false, "unsupported by current account".to_string());
    }
    if let Some(reason) = detect_quota_or_rate_limit(&combined) {
        return (true, format!("probe hit {reason}; treating model as supported"));
    }
    (true, "probe inconclusive; treating as supported".to_string())
}

/// Probe each unique model in the ladder and drop unsupported ones.
///
/// Emits `model_probe_ok` / `model_probe_drop` per model. Fails if every
/// profile would be removed.
pub async fn filter_profiles_by_model_probe(
    repo_root: &Path,
    profiles: Vec<ModelProfile>,
    timeout: Duration,
    events: &EventSink,
) -> Result<Vec<ModelProfile>> {
    let mut model_status: BTreeMap<String, bool> = BTreeMap::new();
    for profile in &profiles {
        if model_status.contains_key(&profile.model) {
            continue;
        }
        let (supported, reason) = probe_model_support(repo_root, &profile.model, timeout).await;
        model_status.insert(profile.model.clone(), supported);
        let event_name = if supported {
            "model_probe_ok"
        } else {
            "model_probe_drop"
        };
        events.emit(
            event_name,
            format!("model probe {}: {reason}", profile.model),
            serde_json::json!({
                "model": profile.model,
                "supported": supported,
                "reason": reason,
            }),
        );
    }

    let filtered: Vec<ModelProfile> = profiles
        .into_iter()
        .filter(|p| model_status.get(&p.model).copied().unwrap_or(true))
        .collect();
    if filtered.is_empty() {
        bail!(
            "All models were removed by --probe-models. \
             Adjust --executor-profiles or authentication."
        );
    }
    Ok(filtered)
}
