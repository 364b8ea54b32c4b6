//! Worker supervision: prompt rendering, command templating, launch, and
//! post-exit processing.
//!
//! A worker is an opaque subprocess launched from a shell command
//! template. Its stdout and stderr are merged into a per-attempt log
//! file; the scheduler polls for exit and routes the outcome through the
//! policy engine.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio::process::{Child, Command};

use crate::classify::classify_failure;
use crate::policy::{self, PolicyConfig};
use crate::profile::ModelProfile;
use crate::runtime::{QuotaRuntime, RuntimeDirs, TaskSet, TaskState, TaskStatus};
use crate::scope::{disallowed_files, within_allowed_files};
use crate::state::{EventSink, now_ts};
use crate::validate::run_validation_commands;
use crate::worktree::WorktreeManager;

/// Lines of log tail read back for failure classification.
pub const LOG_TAIL_LINES: usize = 120;

/// Grace between SIGTERM and SIGKILL when terminating a worker.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// A launched worker process tracked by the dispatch loop.
#[derive(Debug)]
pub struct RunningWorker {
    pub pid: u32,
    pub child: Child,
}

// ---------------------------------------------------------------------------
// Prompt
// ---------------------------------------------------------------------------

/// Render the prompt handed to the worker for this attempt.
///
/// Contains the packet pointer, satisfied dependencies, the target
/// profile, a previous-failure block after the first attempt, the sorted
/// allowed files, the validation commands, and the required return
/// format.
pub fn build_prompt(task: &TaskState, profile: &ModelProfile) -> String {
    let spec = &task.spec;
    let runtime = &task.runtime;

    let escalation_note = match (&runtime.last_error, runtime.attempts > 1) {
        (Some(last_error), true) => {
            let kind = runtime
                .last_failure_kind
                .map(|k| k.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            format!(
                "\nPrevious attempt failed.\n\
                 - failure_kind: {kind}\n\
                 - summary: {last_error}\n\
                 Address this directly before making new changes.\n"
            )
        }
        _ => String::new(),
    };

    let allowed_block = if spec.allowed_files.is_empty() {
        "- (none parsed)".to_string()
    } else {
        spec.allowed_files
            .iter()
            .map(|path| format!("- `{path}`"))
            .collect::<Vec<_>>()
            .join("\n")
    };
    let validation_block = if spec.validation_commands.is_empty() {
        "- (none parsed)".to_string()
    } else {
        spec.validation_commands
            .iter()
            .map(|cmd| format!("- `{cmd}`"))
            .collect::<Vec<_>>()
            .join("\n")
    };
    let deps = if spec.depends_on.is_empty() {
        "none".to_string()
    } else {
        spec.depends_on.join(", ")
    };

    format!(
        "You are executing packet {task_id}.\n\
         Packet path: {packet}\n\
         Dependencies already satisfied: {deps}\n\
         Target model profile: model={model}, reasoning={reasoning}\n\
         {escalation_note}\n\
         Instructions:\n\
         1. Read and execute: `{packet}`.\n\
         2. Edit only the allowed files below.\n\
         3. Keep changes minimal and aligned with packet objective.\n\
         4. Run validation commands before exiting.\n\
         5. If blocked, explain the blocker with exact failing command/output.\n\
         \nAllowed files:\n{allowed_block}\n\
         \nValidation commands:\n{validation_block}\n\
         \nRequired return format:\n\
         [TASK] {task_id}\n\
         [STATE] completed|blocked\n\
         [FILES] ...\n\
         [VALIDATION] ran: ...\n\
         [EVIDENCE] key output lines + skipped step reason\n\
         [BLOCKERS] none|...\n",
        task_id = spec.task_id,
        packet = spec.packet_path.display(),
        model = profile.model,
        reasoning = profile.reasoning,
    )
}

// ---------------------------------------------------------------------------
// Command template
// ---------------------------------------------------------------------------

const TEMPLATE_PLACEHOLDERS: &str =
    "task_id, model, reasoning, worktree, prompt_file, log_file, packet_path plus *_q variants";

/// Expand `{placeholder}` spans in a worker command template.
///
/// For every base value a `*_q` variant carrying the shell-quoted form is
/// available. `{{` and `}}` are literal braces. An unknown or unclosed
/// placeholder is an error naming the allowed set.
pub fn render_template(template: &str, values: &BTreeMap<&str, String>) -> Result<String> {
    let mut expanded: BTreeMap<String, String> = BTreeMap::new();
    for (key, value) in values {
        expanded.insert((*key).to_string(), value.clone());
        let quoted = shlex::try_quote(value)
            .with_context(|| format!("value for placeholder {key} cannot be shell-quoted"))?;
        expanded.insert(format!("{key}_q"), quoted.into_owned());
    }

    let mut rendered = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                rendered.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                rendered.push('}');
            }
            '{' => {
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(c) => name.push(c),
                        None => bail!(
                            "Unclosed placeholder in worker command template. \
                             Allowed placeholders: {TEMPLATE_PLACEHOLDERS}."
                        ),
                    }
                }
                let Some(value) = expanded.get(&name) else {
                    bail!(
                        "Missing placeholder in worker command template: '{name}'. \
                         Allowed placeholders: {TEMPLATE_PLACEHOLDERS}."
                    );
                };
                rendered.push_str(value);
            }
            other => rendered.push(other),
        }
    }
    Ok(rendered)
}

// ---------------------------------------------------------------------------
// Launch
// ---------------------------------------------------------------------------

/// Launch one attempt for a ready task.
///
/// Increments `attempts`, marks the task running, and (outside dry-run)
/// provisions the worktree, writes the per-attempt prompt, renders the
/// worker command, and spawns it with stdout and stderr merged into the
/// per-attempt log file. In dry-run mode the task completes immediately
/// and no process is spawned.
#[allow(clippy::too_many_arguments)]
pub fn launch_task(
    manager: &WorktreeManager,
    dirs: &RuntimeDirs,
    task: &mut TaskState,
    profiles: &[ModelProfile],
    worker_template: &str,
    base_ref: &str,
    dry_run: bool,
    events: &EventSink,
) -> Result<Option<RunningWorker>> {
    let profile = profiles
        .get(task.runtime.profile_index)
        .context("profile_index out of ladder bounds")?
        .clone();

    task.runtime.attempts += 1;
    task.runtime.status = TaskStatus::Running;
    task.runtime.started_at = Some(now_ts());
    task.runtime.block_reason = None;
    task.runtime.next_eligible_at = None;

    if dry_run {
        task.runtime.status = TaskStatus::Completed;
        task.runtime.finished_at = Some(now_ts());
        events.emit(
            "task_completed",
            format!("{} completed in dry-run mode.", task.spec.task_id),
            serde_json::json!({
                "task_id": task.spec.task_id,
                "dry_run": true,
            }),
        );
        return Ok(None);
    }

    let worktree = manager
        .ensure_worktree(task, base_ref)
        .with_context(|| format!("failed to provision worktree for {}", task.spec.task_id))?;

    let attempt = task.runtime.attempts;
    let prompt = build_prompt(task, &profile);
    let prompt_file = dirs
        .prompts
        .join(format!("{}_attempt_{attempt:02}.txt", task.spec.task_id));
    let log_file = dirs
        .logs
        .join(format!("{}_attempt_{attempt:02}.log", task.spec.task_id));
    std::fs::write(&prompt_file, &prompt)
        .with_context(|| format!("failed to write prompt file {}", prompt_file.display()))?;

    task.runtime.prompt_file = Some(prompt_file.clone());
    task.runtime.log_file = Some(log_file.clone());

    let values = BTreeMap::from([
        ("task_id", task.spec.task_id.clone()),
        ("model", profile.model.clone()),
        ("reasoning", profile.reasoning.to_string()),
        ("worktree", worktree.display().to_string()),
        ("prompt_file", prompt_file.display().to_string()),
        ("log_file", log_file.display().to_string()),
        ("packet_path", task.spec.packet_path.display().to_string()),
    ]);
    let command = render_template(worker_template, &values)?;

    let mut log = std::fs::File::create(&log_file)
        .with_context(|| format!("failed to create log file {}", log_file.display()))?;
    {
        use std::io::Write;
        writeln!(log, "# launch: {command}")
            .with_context(|| format!("failed to write log header {}", log_file.display()))?;
    }
    let log_out = log
        .try_clone()
        .context("failed to duplicate log handle for stderr")?;

    let child = Command::new("sh")
        .arg("-c")
        .arg(&command)
        .current_dir(manager.repo_root())
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::from(log))
        .stderr(std::process::Stdio::from(log_out))
        .spawn()
        .with_context(|| format!("failed to spawn worker command: {command}"))?;
    let pid = child.id().context("worker process has no pid")?;

    events.emit(
        "task_launched",
        format!(
            "{} attempt {attempt} launched with {profile} (pid={pid}).",
            task.spec.task_id
        ),
        serde_json::json!({
            "task_id": task.spec.task_id,
            "attempt": attempt,
            "pid": pid,
            "profile": profile,
        }),
    );
    Ok(Some(RunningWorker { pid, child }))
}

// ---------------------------------------------------------------------------
// Reap
// ---------------------------------------------------------------------------

/// Read the last `max_lines` lines of a log file, lossily.
pub fn read_log_tail(path: &Path, max_lines: usize) -> String {
    let Ok(bytes) = std::fs::read(path) else {
        return String::new();
    };
    let text = String::from_utf8_lossy(&bytes);
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}

/// Route a finished worker through the scope gate, validation, and the
/// policy engine.
///
/// Non-zero exit: classify the log tail and retry or block. Zero exit:
/// record changed files, enforce the scope gate (violations block
/// without retry), run validation (failures classify and retry), and
/// otherwise complete the task.
#[allow(clippy::too_many_arguments)]
pub async fn handle_finished_worker(
    tasks: &mut TaskSet,
    task_id: &str,
    returncode: i32,
    manager: &WorktreeManager,
    profiles: &[ModelProfile],
    quota: &mut QuotaRuntime,
    config: &PolicyConfig,
    validation_timeout: Duration,
    events: &EventSink,
) {
    let (log_file, worktree, allowed_files, validation_commands) = {
        let Some(task) = tasks.get_mut(task_id) else {
            return;
        };
        task.runtime.finished_at = Some(now_ts());
        (
            task.runtime.log_file.clone(),
            task.runtime.worktree_path.clone(),
            task.spec.allowed_files.clone(),
            task.spec.validation_commands.clone(),
        )
    };

    let log_excerpt = log_file
        .as_deref()
        .map(|path| read_log_tail(path, LOG_TAIL_LINES))
        .unwrap_or_default();

    if returncode != 0 {
        let kind = classify_failure(&log_excerpt);
        let summary = format!("worker exited with code {returncode}; log tail:\n{log_excerpt}");
        policy::retry_or_block_task(
            tasks, task_id, kind, &summary, profiles, quota, config, events,
        );
        return;
    }

    let Some(worktree) = worktree else {
        if let Some(task) = tasks.get_mut(task_id) {
            policy::mark_task_blocked(task, "missing worktree path after worker exit", events);
        }
        return;
    };

    let changed_files = manager.changed_files(&worktree);
    if let Some(task) = tasks.get_mut(task_id) {
        task.runtime.last_changed_files = changed_files.clone();
    }

    if !within_allowed_files(&changed_files, &allowed_files) {
        let disallowed = disallowed_files(&changed_files, &allowed_files);
        let reason = format!(
            "scope gate failed (disallowed files): {}",
            disallowed.join(", ")
        );
        if let Some(task) = tasks.get_mut(task_id) {
            policy::mark_task_blocked(task, &reason, events);
        }
        return;
    }

    let (ok, validation_message) =
        run_validation_commands(&validation_commands, &worktree, validation_timeout).await;
    if !ok {
        let kind = classify_failure(&validation_message);
        let summary = format!("validation failed:\n{validation_message}");
        policy::retry_or_block_task(
            tasks, task_id, kind, &summary, profiles, quota, config, events,
        );
        return;
    }

    if let Some(task) = tasks.get_mut(task_id) {
        task.runtime.status = TaskStatus::Completed;
        task.runtime.last_failure_kind = None;
        task.runtime.last_error = None;
        task.runtime.compile_failures_level = 0;
        task.runtime.runtime_failures_level = 0;
        task.runtime.next_eligible_at = None;
    }
    events.emit(
        "task_completed",
        format!("{task_id} completed and passed validation."),
        serde_json::json!({
            "task_id": task_id,
            "changed_files": changed_files,
        }),
    );
}

// ---------------------------------------------------------------------------
// Termination
// ---------------------------------------------------------------------------

/// Stop a worker: graceful signal first, hard kill after the grace
/// window.
pub async fn terminate_worker(worker: &mut RunningWorker, grace: Duration) {
    #[cfg(unix)]
    {
        // SAFETY: pid came from a child this process spawned.
        let ret = unsafe { libc::kill(worker.pid as i32, libc::SIGTERM) };
        if ret != 0 {
            tracing::warn!(pid = worker.pid, "SIGTERM failed, proceeding to SIGKILL");
        }
    }
    #[cfg(not(unix))]
    {
        let _ = worker.child.start_kill();
    }

    if tokio::time::timeout(grace, worker.child.wait()).await.is_err() {
        tracing::debug!(pid = worker.pid, "worker did not exit after SIGTERM, killing");
        let _ = worker.child.kill().await;
    }
}
