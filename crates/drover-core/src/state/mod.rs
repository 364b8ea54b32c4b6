//! Durable runtime state: the JSON state document and its restore path.
//!
//! The state file is the sole resume source. It is rewritten atomically
//! (sibling temp file + rename) after every dispatch iteration, with tasks
//! sorted by id for stable diffs. On restore, entries are overlaid onto
//! the freshly loaded task set by id; unknown ids are ignored and any task
//! recorded as `running` is demoted to `pending` because the previous
//! worker process is no longer attached.

pub mod events;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::classify::FailureKind;
use crate::profile::ModelProfile;
use crate::runtime::{QuotaRuntime, TaskSet, TaskStatus};

pub use events::{EventSink, compact_text};

/// Current wall-clock time as fractional epoch seconds.
pub fn now_ts() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Current wall-clock time as `YYYY-MM-DDTHH:MM:SSZ`.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Format epoch seconds as `YYYY-MM-DDTHH:MM:SSZ`.
pub fn ts_iso(ts: f64) -> String {
    DateTime::<Utc>::from_timestamp(ts as i64, 0)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_else(|| "1970-01-01T00:00:00Z".to_string())
}

// ---------------------------------------------------------------------------
// Document schema
// ---------------------------------------------------------------------------

/// Profile as it appears on the wire. Plain strings so that restore stays
/// lenient about entries written by other ladder configurations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileSnapshot {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub reasoning: String,
}

impl From<&ModelProfile> for ProfileSnapshot {
    fn from(profile: &ModelProfile) -> Self {
        Self {
            model: profile.model.clone(),
            reasoning: profile.reasoning.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorSnapshot {
    #[serde(default)]
    pub quota_cooldown_until: f64,
    #[serde(default)]
    pub quota_last_detected_at: Option<f64>,
    #[serde(default)]
    pub quota_failures_total: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusSummary {
    #[serde(default)]
    pub pending: usize,
    #[serde(default)]
    pub running: usize,
    #[serde(default)]
    pub completed: usize,
    #[serde(default)]
    pub blocked: usize,
}

/// Per-task entry of the state document.
///
/// Every field is defaulted on read for forward compatibility; the writer
/// always emits the full schema.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub profile_index: usize,
    #[serde(default)]
    pub profile: Option<ProfileSnapshot>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub compile_failures_total: u32,
    #[serde(default)]
    pub runtime_failures_total: u32,
    #[serde(default)]
    pub quota_failures_total: u32,
    #[serde(default)]
    pub other_failures_total: u32,
    #[serde(default)]
    pub last_failure_kind: Option<String>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub block_reason: Option<String>,
    #[serde(default)]
    pub worktree_path: Option<String>,
    #[serde(default)]
    pub branch_name: Option<String>,
    #[serde(default)]
    pub prompt_file: Option<String>,
    #[serde(default)]
    pub log_file: Option<String>,
    #[serde(default)]
    pub next_eligible_at: Option<f64>,
    #[serde(default)]
    pub last_changed_files: Vec<String>,
    #[serde(default)]
    pub pid: Option<u32>,
}

/// The full persisted document.
///
/// `tasks` is deliberately non-defaulted: a document without a task list
/// is malformed and must fail the resume path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateDocument {
    #[serde(default)]
    pub updated_at: String,
    #[serde(default)]
    pub profiles: Vec<ProfileSnapshot>,
    #[serde(default)]
    pub orchestrator: OrchestratorSnapshot,
    #[serde(default)]
    pub summary: StatusSummary,
    pub tasks: Vec<TaskSnapshot>,
}

// ---------------------------------------------------------------------------
// Write
// ---------------------------------------------------------------------------

fn path_string(path: &Option<PathBuf>) -> Option<String> {
    path.as_ref().map(|p| p.display().to_string())
}

/// Build the document for the current runtime.
pub fn snapshot(
    tasks: &TaskSet,
    profiles: &[ModelProfile],
    quota: &QuotaRuntime,
    pids: &BTreeMap<String, u32>,
) -> StateDocument {
    let count = |status: TaskStatus| tasks.values().filter(|t| t.status() == status).count();

    let task_entries = tasks
        .iter()
        .map(|(task_id, task)| {
            let runtime = &task.runtime;
            let profile = profiles.get(runtime.profile_index);
            TaskSnapshot {
                id: task_id.clone(),
                status: runtime.status.to_string(),
                attempts: runtime.attempts,
                profile_index: runtime.profile_index,
                profile: profile.map(ProfileSnapshot::from),
                depends_on: task.spec.depends_on.clone(),
                compile_failures_total: runtime.compile_failures_total,
                runtime_failures_total: runtime.runtime_failures_total,
                quota_failures_total: runtime.quota_failures_total,
                other_failures_total: runtime.other_failures_total,
                last_failure_kind: runtime.last_failure_kind.map(|k| k.to_string()),
                last_error: runtime.last_error.clone(),
                block_reason: runtime.block_reason.clone(),
                worktree_path: path_string(&runtime.worktree_path),
                branch_name: runtime.branch_name.clone(),
                prompt_file: path_string(&runtime.prompt_file),
                log_file: path_string(&runtime.log_file),
                next_eligible_at: runtime.next_eligible_at,
                last_changed_files: runtime.last_changed_files.clone(),
                pid: pids.get(task_id).copied(),
            }
        })
        .collect();

    StateDocument {
        updated_at: now_iso(),
        profiles: profiles.iter().map(ProfileSnapshot::from).collect(),
        orchestrator: OrchestratorSnapshot {
            quota_cooldown_until: quota.cooldown_until,
            quota_last_detected_at: quota.last_detected_at,
            quota_failures_total: quota.total_failures,
        },
        summary: StatusSummary {
            pending: count(TaskStatus::Pending),
            running: count(TaskStatus::Running),
            completed: count(TaskStatus::Completed),
            blocked: count(TaskStatus::Blocked),
        },
        tasks: task_entries,
    }
}

/// Serialize the runtime and replace the state file atomically.
///
/// The document is written to a sibling `.tmp` file and renamed into
/// place so a crash mid-write leaves the previous snapshot intact.
pub fn write_state(
    path: &Path,
    tasks: &TaskSet,
    profiles: &[ModelProfile],
    quota: &QuotaRuntime,
    pids: &BTreeMap<String, u32>,
) -> Result<()> {
    let document = snapshot(tasks, profiles, quota, pids);
    let rendered = serde_json::to_string_pretty(&document).context("serialize state document")?;

    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, rendered)
        .with_context(|| format!("write state temp file {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("replace state file {}", path.display()))?;
    Ok(())
}

/// Parse a state document from disk.
pub fn read_state(path: &Path) -> Result<StateDocument> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read state file {}", path.display()))?;
    let document: StateDocument = serde_json::from_str(&raw)
        .with_context(|| format!("invalid state file format: {}", path.display()))?;
    Ok(document)
}

// ---------------------------------------------------------------------------
// Restore
// ---------------------------------------------------------------------------

/// Overlay a previously written state file onto a fresh runtime.
///
/// Missing file: emits `resume_skip` and leaves everything at defaults.
/// Malformed JSON (including a non-list `tasks` field) is a fatal startup
/// error. Unknown task ids in the file are ignored. `profile_index` is
/// recovered by `(model, reasoning)` lookup when possible, otherwise by
/// the stored index clamped to the ladder. Tasks recorded as `running`
/// are demoted to `pending` with an `infra` failure note, because the
/// worker they referred to is not attached to this process.
pub fn restore_runtime_state(
    state_path: &Path,
    tasks: &mut TaskSet,
    profiles: &[ModelProfile],
    quota: &mut QuotaRuntime,
    events: &EventSink,
) -> Result<()> {
    if !state_path.exists() {
        events.emit(
            "resume_skip",
            format!("no existing state file at {}", state_path.display()),
            serde_json::json!({}),
        );
        return Ok(());
    }

    let document = read_state(state_path)?;
    if profiles.is_empty() {
        bail!("cannot restore state with an empty profile ladder");
    }

    quota.cooldown_until = document.orchestrator.quota_cooldown_until;
    quota.last_detected_at = document.orchestrator.quota_last_detected_at;
    quota.total_failures = document.orchestrator.quota_failures_total;

    let profile_lookup: BTreeMap<(&str, &str), usize> = profiles
        .iter()
        .enumerate()
        .map(|(idx, p)| ((p.model.as_str(), p.reasoning.as_str()), idx))
        .collect();

    let mut restored = 0usize;
    let mut resumed_running = 0usize;
    for entry in &document.tasks {
        let Some(task) = tasks.get_mut(&entry.id) else {
            continue;
        };
        let runtime = &mut task.runtime;

        runtime.status = entry
            .status
            .parse::<TaskStatus>()
            .unwrap_or(TaskStatus::Pending);

        let by_profile = entry.profile.as_ref().and_then(|p| {
            profile_lookup
                .get(&(p.model.as_str(), p.reasoning.as_str()))
                .copied()
        });
        runtime.profile_index =
            by_profile.unwrap_or_else(|| entry.profile_index.min(profiles.len() - 1));

        runtime.attempts = entry.attempts;
        runtime.compile_failures_total = entry.compile_failures_total;
        runtime.runtime_failures_total = entry.runtime_failures_total;
        runtime.quota_failures_total = entry.quota_failures_total;
        runtime.other_failures_total = entry.other_failures_total;
        runtime.last_failure_kind = entry
            .last_failure_kind
            .as_deref()
            .and_then(|k| k.parse::<FailureKind>().ok());
        runtime.last_error = entry.last_error.clone();
        runtime.block_reason = entry.block_reason.clone();
        if let Some(path) = entry.worktree_path.as_deref().filter(|p| !p.is_empty()) {
            runtime.worktree_path = Some(PathBuf::from(path));
        }
        if let Some(branch) = entry.branch_name.as_deref().filter(|b| !b.is_empty()) {
            runtime.branch_name = Some(branch.to_string());
        }
        if let Some(path) = entry.prompt_file.as_deref().filter(|p| !p.is_empty()) {
            runtime.prompt_file = Some(PathBuf::from(path));
        }
        if let Some(path) = entry.log_file.as_deref().filter(|p| !p.is_empty()) {
            runtime.log_file = Some(PathBuf::from(path));
        }
        runtime.next_eligible_at = entry.next_eligible_at;
        runtime.last_changed_files = entry.last_changed_files.clone();

        if runtime.status == TaskStatus::Running {
            runtime.status = TaskStatus::Pending;
            resumed_running += 1;
            let note = "resumed from stale 'running' state; previous worker is not attached";
            runtime.last_error = match runtime.last_error.take() {
                Some(prior) => Some(format!("{prior}\n{note}")),
                None => Some(note.to_string()),
            };
            runtime.last_failure_kind =
                Some(runtime.last_failure_kind.unwrap_or(FailureKind::Infra));
        }

        restored += 1;
    }

    events.emit(
        "resume_loaded",
        format!(
            "restored {restored} task runtime entries from state \
             (running->pending={resumed_running})."
        ),
        serde_json::json!({
            "restored": restored,
            "running_to_pending": resumed_running,
            "state_file": state_path.display().to_string(),
        }),
    );

    Ok(())
}
