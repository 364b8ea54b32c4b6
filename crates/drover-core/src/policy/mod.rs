//! Scheduling policy: readiness, dependency-block propagation, the
//! escalation ladder, quota cooldown, and the retry-vs-block decision.
//!
//! Every function here mutates [`TaskRuntime`](crate::runtime::TaskRuntime)
//! or [`QuotaRuntime`] synchronously on the dispatch task; none of them
//! block or spawn.

use crate::classify::FailureKind;
use crate::profile::ModelProfile;
use crate::runtime::{QuotaRuntime, TaskSet, TaskState, TaskStatus};
use crate::state::{EventSink, compact_text, now_ts, ts_iso};

/// Knobs consulted when routing a failure.
#[derive(Debug, Clone)]
pub struct PolicyConfig {
    pub max_attempts: u32,
    pub escalate_after_compile: u32,
    pub escalate_after_runtime: u32,
    pub quota_cooldown_seconds: u64,
    pub quota_max_failures_per_task: u32,
    pub quota_fail_fast: bool,
}

/// A task is ready iff it is pending, its eligibility time (if any) has
/// passed, and every dependency has completed.
pub fn task_ready(task: &TaskState, tasks: &TaskSet, now: f64) -> bool {
    if task.status() != TaskStatus::Pending {
        return false;
    }
    if let Some(eligible_at) = task.runtime.next_eligible_at {
        if now < eligible_at {
            return false;
        }
    }
    task.spec.depends_on.iter().all(|dep| {
        tasks
            .get(dep)
            .is_some_and(|d| d.status() == TaskStatus::Completed)
    })
}

/// All tasks are in a terminal state.
pub fn all_done(tasks: &TaskSet) -> bool {
    tasks.values().all(|t| t.status().is_terminal())
}

/// Block a task permanently and record why.
pub fn mark_task_blocked(task: &mut TaskState, reason: &str, events: &EventSink) {
    let runtime = &mut task.runtime;
    runtime.status = TaskStatus::Blocked;
    runtime.block_reason = Some(reason.to_string());
    runtime.finished_at = Some(now_ts());
    runtime.next_eligible_at = None;
    runtime.last_error = Some(reason.to_string());
    events.emit(
        "task_blocked",
        format!("{} blocked: {reason}", task.spec.task_id),
        serde_json::json!({
            "task_id": task.spec.task_id,
            "reason": reason,
        }),
    );
}

/// Raise the global cooldown for a quota event and return the new bound.
///
/// The window never shortens: an event inside an active cooldown only
/// extends it when `now + cooldown_seconds` is later than the current
/// bound.
pub fn activate_quota_cooldown(
    quota: &mut QuotaRuntime,
    cooldown_seconds: u64,
    error_summary: &str,
    events: &EventSink,
    task_id: &str,
) -> f64 {
    let now = now_ts();
    let new_until = now + cooldown_seconds as f64;
    let previous_until = quota.cooldown_until;
    quota.cooldown_until = previous_until.max(new_until);
    quota.last_detected_at = Some(now);
    quota.total_failures += 1;

    let previous = (previous_until > 0.0).then(|| ts_iso(previous_until));
    events.emit(
        "quota_cooldown",
        format!(
            "{task_id} hit quota/rate-limit; pausing new launches until {}.",
            ts_iso(quota.cooldown_until)
        ),
        serde_json::json!({
            "task_id": task_id,
            "cooldown_seconds": cooldown_seconds,
            "cooldown_until": ts_iso(quota.cooldown_until),
            "previous_cooldown_until": previous,
            "summary": compact_text(Some(error_summary), 500),
            "quota_failures_total": quota.total_failures,
        }),
    );
    quota.cooldown_until
}

/// Block every pending task with the given reason. Returns how many were
/// blocked.
pub fn block_all_pending_for_quota(tasks: &mut TaskSet, reason: &str, events: &EventSink) -> usize {
    let mut blocked = 0;
    for task in tasks.values_mut() {
        if task.status() != TaskStatus::Pending {
            continue;
        }
        mark_task_blocked(task, reason, events);
        blocked += 1;
    }
    blocked
}

/// Update failure counters for a non-quota failure and advance the ladder
/// if the matching level threshold was reached.
///
/// Compile and runtime failures accumulate per-profile level counters;
/// any other kind resets both levels. Returns whether an escalation
/// happened.
pub fn maybe_escalate(
    task: &mut TaskState,
    kind: FailureKind,
    profiles: &[ModelProfile],
    escalate_after_compile: u32,
    escalate_after_runtime: u32,
    events: &EventSink,
) -> bool {
    let runtime = &mut task.runtime;
    match kind {
        FailureKind::Compile => {
            runtime.compile_failures_total += 1;
            runtime.compile_failures_level += 1;
        }
        FailureKind::Runtime => {
            runtime.runtime_failures_total += 1;
            runtime.runtime_failures_level += 1;
        }
        _ => {
            runtime.other_failures_total += 1;
            runtime.compile_failures_level = 0;
            runtime.runtime_failures_level = 0;
            return false;
        }
    }

    let should_escalate = match kind {
        FailureKind::Compile => runtime.compile_failures_level >= escalate_after_compile,
        FailureKind::Runtime => runtime.runtime_failures_level >= escalate_after_runtime,
        _ => false,
    };
    if !should_escalate || runtime.profile_index + 1 >= profiles.len() {
        return false;
    }

    let old_profile = profiles[runtime.profile_index].clone();
    runtime.profile_index += 1;
    runtime.compile_failures_level = 0;
    runtime.runtime_failures_level = 0;
    let new_profile = &profiles[runtime.profile_index];
    events.emit(
        "escalation",
        format!(
            "{} escalated from {old_profile} to {new_profile} after repeated {kind} failures.",
            task.spec.task_id
        ),
        serde_json::json!({
            "task_id": task.spec.task_id,
            "kind": kind.as_str(),
            "from_profile": old_profile,
            "to_profile": new_profile,
        }),
    );
    true
}

/// Route a classified failure: quota handling (cooldown, fail-fast,
/// per-task threshold), otherwise escalation bookkeeping followed by the
/// retry-vs-block decision.
#[allow(clippy::too_many_arguments)]
pub fn retry_or_block_task(
    tasks: &mut TaskSet,
    task_id: &str,
    kind: FailureKind,
    error_summary: &str,
    profiles: &[ModelProfile],
    quota: &mut QuotaRuntime,
    config: &PolicyConfig,
    events: &EventSink,
) {
    let Some(task) = tasks.get_mut(task_id) else {
        return;
    };
    let runtime = &mut task.runtime;
    runtime.last_failure_kind = Some(kind);
    runtime.last_error = Some(error_summary.to_string());
    runtime.finished_at = Some(now_ts());
    runtime.next_eligible_at = None;

    if kind == FailureKind::Quota {
        runtime.quota_failures_total += 1;
        runtime.compile_failures_level = 0;
        runtime.runtime_failures_level = 0;
        let attempts = runtime.attempts;
        let quota_failures_total = runtime.quota_failures_total;

        let cooldown_until = activate_quota_cooldown(
            quota,
            config.quota_cooldown_seconds,
            error_summary,
            events,
            task_id,
        );

        if config.quota_fail_fast {
            let reason = format!(
                "quota/rate limit detected and --quota-fail-fast is enabled \
                 (cooldown_until={}).",
                ts_iso(cooldown_until)
            );
            let task = tasks.get_mut(task_id).expect("task present");
            mark_task_blocked(task, &reason, events);
            let blocked_count = block_all_pending_for_quota(tasks, &reason, events);
            events.emit(
                "quota_fail_fast",
                format!(
                    "{task_id} triggered fail-fast quota stop; blocked_pending={blocked_count}."
                ),
                serde_json::json!({
                    "task_id": task_id,
                    "blocked_pending": blocked_count,
                    "cooldown_until": ts_iso(cooldown_until),
                }),
            );
            return;
        }

        let task = tasks.get_mut(task_id).expect("task present");
        if quota_failures_total >= config.quota_max_failures_per_task {
            let reason = format!(
                "quota/rate-limit failure threshold reached ({quota_failures_total}/{}).",
                config.quota_max_failures_per_task
            );
            mark_task_blocked(task, &reason, events);
            return;
        }

        task.runtime.status = TaskStatus::Pending;
        task.runtime.next_eligible_at = Some(cooldown_until);
        events.emit(
            "task_retry",
            format!(
                "{task_id} scheduled to retry after quota/rate-limit \
                 (attempt {attempts}/{}, quota_failures={quota_failures_total}/{}, \
                 next_eligible_at={}).",
                config.max_attempts,
                config.quota_max_failures_per_task,
                ts_iso(cooldown_until)
            ),
            serde_json::json!({
                "task_id": task_id,
                "attempt": attempts,
                "failure_kind": kind.as_str(),
                "next_eligible_at": ts_iso(cooldown_until),
                "cooldown_until": ts_iso(cooldown_until),
                "quota_failures_total": quota_failures_total,
            }),
        );
        return;
    }

    maybe_escalate(
        task,
        kind,
        profiles,
        config.escalate_after_compile,
        config.escalate_after_runtime,
        events,
    );

    let task = tasks.get_mut(task_id).expect("task present");
    let attempts = task.runtime.attempts;
    if attempts >= config.max_attempts {
        let reason = format!("max attempts reached ({attempts}). Last failure kind={kind}.");
        mark_task_blocked(task, &reason, events);
        return;
    }

    task.runtime.status = TaskStatus::Pending;
    task.runtime.next_eligible_at = None;
    events.emit(
        "task_retry",
        format!(
            "{task_id} scheduled to retry after {kind} failure (attempt {attempts}/{}).",
            config.max_attempts
        ),
        serde_json::json!({
            "task_id": task_id,
            "attempt": attempts,
            "failure_kind": kind.as_str(),
        }),
    );
}

/// Block pending tasks whose dependencies are blocked, iterating to
/// fixpoint so chains of dependencies collapse in one call.
pub fn propagate_dependency_blocks(tasks: &mut TaskSet, events: &EventSink) {
    loop {
        let newly_blocked: Vec<(String, String)> = tasks
            .values()
            .filter(|task| task.status() == TaskStatus::Pending)
            .filter_map(|task| {
                task.spec
                    .depends_on
                    .iter()
                    .find(|dep| {
                        tasks
                            .get(*dep)
                            .is_some_and(|d| d.status() == TaskStatus::Blocked)
                    })
                    .map(|dep| (task.spec.task_id.clone(), dep.clone()))
            })
            .collect();

        if newly_blocked.is_empty() {
            return;
        }
        for (task_id, dep_id) in newly_blocked {
            let reason = format!("dependency {dep_id} is blocked");
            if let Some(task) = tasks.get_mut(&task_id) {
                mark_task_blocked(task, &reason, events);
            }
        }
    }
}
