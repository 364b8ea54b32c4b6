//! Mutable runtime state owned by the dispatch loop.
//!
//! [`TaskRuntime`] and [`QuotaRuntime`] are mutated only on the dispatch
//! task; workers are external processes and never touch these structures.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use drover_manifest::TaskSpec;

use crate::classify::FailureKind;

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Blocked,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Blocked => "blocked",
        }
    }

    /// Terminal states: nothing further will happen to the task.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Blocked)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "blocked" => Ok(TaskStatus::Blocked),
            _ => Err(()),
        }
    }
}

/// Per-task mutable bookkeeping.
///
/// Counter invariants: `attempts`, `profile_index`, and the `*_total`
/// counters are monotone; the `*_level` counters reset on escalation or on
/// a non-matching failure kind.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRuntime {
    pub status: TaskStatus,
    pub attempts: u32,
    pub profile_index: usize,
    pub compile_failures_total: u32,
    pub runtime_failures_total: u32,
    pub quota_failures_total: u32,
    pub other_failures_total: u32,
    pub compile_failures_level: u32,
    pub runtime_failures_level: u32,
    pub last_failure_kind: Option<FailureKind>,
    pub last_error: Option<String>,
    pub block_reason: Option<String>,
    pub started_at: Option<f64>,
    pub finished_at: Option<f64>,
    pub worktree_path: Option<PathBuf>,
    pub branch_name: Option<String>,
    pub prompt_file: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
    pub next_eligible_at: Option<f64>,
    pub last_changed_files: Vec<String>,
}

impl Default for TaskRuntime {
    fn default() -> Self {
        Self {
            status: TaskStatus::Pending,
            attempts: 0,
            profile_index: 0,
            compile_failures_total: 0,
            runtime_failures_total: 0,
            quota_failures_total: 0,
            other_failures_total: 0,
            compile_failures_level: 0,
            runtime_failures_level: 0,
            last_failure_kind: None,
            last_error: None,
            block_reason: None,
            started_at: None,
            finished_at: None,
            worktree_path: None,
            branch_name: None,
            prompt_file: None,
            log_file: None,
            next_eligible_at: None,
            last_changed_files: Vec::new(),
        }
    }
}

/// An immutable spec paired with its runtime.
#[derive(Debug, Clone)]
pub struct TaskState {
    pub spec: TaskSpec,
    pub runtime: TaskRuntime,
}

impl TaskState {
    pub fn new(spec: TaskSpec) -> Self {
        Self {
            spec,
            runtime: TaskRuntime::default(),
        }
    }

    pub fn status(&self) -> TaskStatus {
        self.runtime.status
    }
}

/// The scheduler's working set, keyed (and therefore iterated) by task id.
pub type TaskSet = BTreeMap<String, TaskState>;

/// Build a [`TaskSet`] from loaded specs.
pub fn task_set(specs: BTreeMap<String, TaskSpec>) -> TaskSet {
    specs
        .into_iter()
        .map(|(id, spec)| (id, TaskState::new(spec)))
        .collect()
}

/// Process-wide quota bookkeeping.
///
/// `cooldown_until` is monotone under update: a new quota event may only
/// raise it, never shorten an active window.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QuotaRuntime {
    /// Epoch seconds; 0 when no cooldown is active.
    pub cooldown_until: f64,
    pub last_detected_at: Option<f64>,
    pub total_failures: u32,
}

/// Filesystem layout under the runtime directory.
#[derive(Debug, Clone)]
pub struct RuntimeDirs {
    pub root: PathBuf,
    pub prompts: PathBuf,
    pub logs: PathBuf,
    pub state_file: PathBuf,
    pub events_file: PathBuf,
    pub worktrees_root: PathBuf,
}

/// Create the runtime directory tree and return its layout.
pub fn ensure_dirs(
    repo_root: &Path,
    runtime_dir: &Path,
    worktree_root: Option<&Path>,
) -> std::io::Result<RuntimeDirs> {
    let root = if runtime_dir.is_absolute() {
        runtime_dir.to_path_buf()
    } else {
        repo_root.join(runtime_dir)
    };
    let worktrees_root = worktree_root
        .map(Path::to_path_buf)
        .unwrap_or_else(|| root.join("worktrees"));
    let prompts = root.join("prompts");
    let logs = root.join("logs");

    std::fs::create_dir_all(&root)?;
    std::fs::create_dir_all(&worktrees_root)?;
    std::fs::create_dir_all(&prompts)?;
    std::fs::create_dir_all(&logs)?;

    Ok(RuntimeDirs {
        state_file: root.join("state.json"),
        events_file: root.join("events.jsonl"),
        root,
        prompts,
        logs,
        worktrees_root,
    })
}
