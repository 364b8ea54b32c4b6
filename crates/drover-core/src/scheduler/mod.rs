//! The dispatch loop.
//!
//! A single task owns every piece of mutable runtime state and drives the
//! whole system: reap finished workers, propagate dependency blocks,
//! honor the quota cooldown, launch ready tasks up to capacity, persist
//! state, and stop when every task is terminal. Workers are external
//! processes; the only concurrency is OS process concurrency bounded by
//! `max_parallel`.
//!
//! Per-task faults never abort the loop: launch and reap failures are
//! classified as `infra` and routed through the policy engine.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::classify::FailureKind;
use crate::policy::{
    self, PolicyConfig, all_done, propagate_dependency_blocks, retry_or_block_task, task_ready,
};
use crate::profile::ModelProfile;
use crate::runtime::{QuotaRuntime, RuntimeDirs, TaskSet, TaskStatus};
use crate::state::{EventSink, now_ts, ts_iso, write_state};
use crate::worker::{
    RunningWorker, TERMINATE_GRACE, handle_finished_worker, launch_task, terminate_worker,
};
use crate::worktree::WorktreeManager;

/// Everything the dispatch loop needs to know.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_parallel: usize,
    pub poll_interval: Duration,
    pub max_attempts: u32,
    /// Per validation command.
    pub command_timeout: Duration,
    /// Hard wall-clock limit per worker; `None` disables it.
    pub worker_timeout: Option<Duration>,
    pub quota_cooldown_seconds: u64,
    pub quota_max_failures_per_task: u32,
    pub quota_fail_fast: bool,
    pub escalate_after_compile: u32,
    pub escalate_after_runtime: u32,
    /// Base ref new worktree branches start from.
    pub base_ref: String,
    pub dry_run: bool,
    pub worker_template: String,
}

impl SchedulerConfig {
    fn policy(&self) -> PolicyConfig {
        PolicyConfig {
            max_attempts: self.max_attempts,
            escalate_after_compile: self.escalate_after_compile,
            escalate_after_runtime: self.escalate_after_runtime,
            quota_cooldown_seconds: self.quota_cooldown_seconds,
            quota_max_failures_per_task: self.quota_max_failures_per_task,
            quota_fail_fast: self.quota_fail_fast,
        }
    }
}

/// How a scheduler run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerOutcome {
    /// Every task reached a terminal state.
    Finished { completed: usize, blocked: usize },
    /// The operator interrupted the run; workers were terminated and
    /// their tasks blocked.
    Interrupted,
}

fn pids_of(running: &BTreeMap<String, RunningWorker>) -> BTreeMap<String, u32> {
    running
        .iter()
        .map(|(id, worker)| (id.clone(), worker.pid))
        .collect()
}

/// Run the dispatch loop to completion or interruption.
#[allow(clippy::too_many_arguments)]
pub async fn run_scheduler(
    manager: &WorktreeManager,
    dirs: &RuntimeDirs,
    tasks: &mut TaskSet,
    profiles: &[ModelProfile],
    quota: &mut QuotaRuntime,
    config: &SchedulerConfig,
    events: &EventSink,
    cancel: CancellationToken,
) -> Result<SchedulerOutcome> {
    let policy_config = config.policy();
    let mut running: BTreeMap<String, RunningWorker> = BTreeMap::new();
    // Upper bound of the cooldown window already announced via
    // `quota_wait`; one event per distinct window.
    let mut quota_wait_announced = 0.0_f64;

    loop {
        // Interrupt: stop workers, block their tasks, persist, leave.
        if cancel.is_cancelled() {
            events.emit(
                "interrupt",
                "interrupt received. Shutting down workers.",
                serde_json::json!({}),
            );
            for worker in running.values_mut() {
                terminate_worker(worker, TERMINATE_GRACE).await;
            }
            let interrupted: Vec<String> = running.keys().cloned().collect();
            running.clear();
            for task_id in interrupted {
                if let Some(task) = tasks.get_mut(&task_id) {
                    policy::mark_task_blocked(
                        task,
                        "orchestrator interrupted by operator",
                        events,
                    );
                }
            }
            write_state(&dirs.state_file, tasks, profiles, quota, &pids_of(&running))?;
            return Ok(SchedulerOutcome::Interrupted);
        }

        // 1. Reap: enforce the worker timeout, then poll for exits.
        let mut timed_out: Vec<String> = Vec::new();
        let mut finished: Vec<(String, i32)> = Vec::new();
        for (task_id, worker) in running.iter_mut() {
            if let Some(timeout) = config.worker_timeout {
                let started = tasks
                    .get(task_id)
                    .and_then(|t| t.runtime.started_at)
                    .unwrap_or(0.0);
                if now_ts() - started > timeout.as_secs_f64() {
                    terminate_worker(worker, TERMINATE_GRACE).await;
                    timed_out.push(task_id.clone());
                    continue;
                }
            }
            match worker.child.try_wait() {
                Ok(Some(status)) => {
                    finished.push((task_id.clone(), status.code().unwrap_or(-1)));
                }
                Ok(None) => {}
                Err(error) => {
                    tracing::warn!(task_id = %task_id, %error, "failed to poll worker");
                    finished.push((task_id.clone(), -1));
                }
            }
        }

        for task_id in timed_out {
            running.remove(&task_id);
            let timeout_seconds = config
                .worker_timeout
                .map(|t| t.as_secs())
                .unwrap_or_default();
            retry_or_block_task(
                tasks,
                &task_id,
                FailureKind::Infra,
                &format!("worker timed out after {timeout_seconds}s"),
                profiles,
                quota,
                &policy_config,
                events,
            );
        }
        for (task_id, returncode) in finished {
            running.remove(&task_id);
            handle_finished_worker(
                tasks,
                &task_id,
                returncode,
                manager,
                profiles,
                quota,
                &policy_config,
                config.command_timeout,
                events,
            )
            .await;
        }

        // 2. Dependency blocks ripple before launch selection.
        propagate_dependency_blocks(tasks, events);

        // 3. Cooldown expiry, then capacity with cooldown override.
        let now = now_ts();
        if quota.cooldown_until > 0.0 && now >= quota.cooldown_until {
            events.emit(
                "quota_resume",
                "quota cooldown expired; scheduling resumes.",
                serde_json::json!({}),
            );
            quota.cooldown_until = 0.0;
            quota_wait_announced = 0.0;
        }

        let mut capacity = config.max_parallel.saturating_sub(running.len());
        if quota.cooldown_until > now {
            capacity = 0;
            if quota_wait_announced != quota.cooldown_until {
                events.emit(
                    "quota_wait",
                    format!(
                        "quota cooldown active; suppressing new launches until {}.",
                        ts_iso(quota.cooldown_until)
                    ),
                    serde_json::json!({
                        "cooldown_until": ts_iso(quota.cooldown_until),
                        "remaining_seconds": (quota.cooldown_until - now) as i64,
                    }),
                );
                quota_wait_announced = quota.cooldown_until;
            }
        }

        // 4. Launch ready tasks in ascending id order up to capacity.
        if capacity > 0 {
            let ready_ids: Vec<String> = tasks
                .values()
                .filter(|task| task_ready(task, tasks, now))
                .map(|task| task.spec.task_id.clone())
                .take(capacity)
                .collect();
            for task_id in ready_ids {
                let launch_result = {
                    let task = tasks.get_mut(&task_id).expect("ready task present");
                    launch_task(
                        manager,
                        dirs,
                        task,
                        profiles,
                        &config.worker_template,
                        &config.base_ref,
                        config.dry_run,
                        events,
                    )
                };
                match launch_result {
                    Ok(Some(worker)) => {
                        running.insert(task_id, worker);
                    }
                    Ok(None) => {}
                    Err(error) => {
                        retry_or_block_task(
                            tasks,
                            &task_id,
                            FailureKind::Infra,
                            &format!("worker launch failure: {error:#}"),
                            profiles,
                            quota,
                            &policy_config,
                            events,
                        );
                    }
                }
            }
        }

        // 5. Persist a consistent post-iteration snapshot before sleeping.
        write_state(&dirs.state_file, tasks, profiles, quota, &pids_of(&running))?;

        // 6. Termination.
        if all_done(tasks) && running.is_empty() {
            break;
        }
        if running.is_empty() {
            let now = now_ts();
            let has_ready = tasks.values().any(|task| task_ready(task, tasks, now));
            if !has_ready {
                propagate_dependency_blocks(tasks, events);
                if all_done(tasks) {
                    write_state(
                        &dirs.state_file,
                        tasks,
                        profiles,
                        quota,
                        &pids_of(&running),
                    )?;
                    break;
                }
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(config.poll_interval) => {}
            _ = cancel.cancelled() => {}
        }
    }

    let completed = tasks
        .values()
        .filter(|t| t.status() == TaskStatus::Completed)
        .count();
    let blocked = tasks
        .values()
        .filter(|t| t.status() == TaskStatus::Blocked)
        .count();
    Ok(SchedulerOutcome::Finished { completed, blocked })
}
