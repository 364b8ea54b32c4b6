//! Resume behavior across scheduler runs: demotion of stale running
//! entries, idempotent restore, and fast termination when everything is
//! already terminal.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use drover_core::classify::FailureKind;
use drover_core::profile::parse_profiles;
use drover_core::runtime::{QuotaRuntime, TaskStatus, ensure_dirs, task_set};
use drover_core::scheduler::{SchedulerConfig, SchedulerOutcome, run_scheduler};
use drover_core::state::{EventSink, read_state, restore_runtime_state, write_state};
use drover_core::worktree::WorktreeManager;
use drover_manifest::load_manifest;
use drover_test_utils::{ManifestTask, create_temp_repo, write_manifest, write_packet};

fn dry_run_config() -> SchedulerConfig {
    SchedulerConfig {
        max_parallel: 3,
        poll_interval: Duration::from_millis(10),
        max_attempts: 6,
        command_timeout: Duration::from_secs(30),
        worker_timeout: None,
        quota_cooldown_seconds: 900,
        quota_max_failures_per_task: 3,
        quota_fail_fast: false,
        escalate_after_compile: 2,
        escalate_after_runtime: 2,
        base_ref: "HEAD".to_string(),
        dry_run: true,
        worker_template: "true".to_string(),
    }
}

#[tokio::test]
async fn completed_run_restores_identically_and_terminates_at_once() {
    let (_guard, repo) = create_temp_repo();
    let p1 = write_packet(&repo, "w101", &["src/a.py"], &["echo ok"]);
    let p2 = write_packet(&repo, "w102", &["src/b.py"], &[]);
    let manifest = write_manifest(
        &repo,
        &[
            ManifestTask {
                id: "W101",
                packet: &p1,
                depends_on: &[],
            },
            ManifestTask {
                id: "W102",
                packet: &p2,
                depends_on: &["W101"],
            },
        ],
    );
    let dirs = ensure_dirs(&repo, Path::new("runtime"), None).unwrap();
    let events = EventSink::new(dirs.events_file.clone());
    let manager = WorktreeManager::new(&repo, dirs.worktrees_root.clone()).unwrap();
    let profiles = parse_profiles("m:low").unwrap();

    // First run to completion.
    let mut tasks = task_set(load_manifest(&repo, &manifest, false).unwrap());
    let mut quota = QuotaRuntime::default();
    run_scheduler(
        &manager,
        &dirs,
        &mut tasks,
        &profiles,
        &mut quota,
        &dry_run_config(),
        &events,
        CancellationToken::new(),
    )
    .await
    .unwrap();

    // Restore into a fresh task set.
    let mut restored = task_set(load_manifest(&repo, &manifest, false).unwrap());
    let mut restored_quota = QuotaRuntime::default();
    restore_runtime_state(
        &dirs.state_file,
        &mut restored,
        &profiles,
        &mut restored_quota,
        &events,
    )
    .unwrap();

    // No task was running at shutdown, so restore is exact modulo the
    // unpersisted wall-clock fields.
    for (task_id, task) in &tasks {
        let mut expected = task.runtime.clone();
        expected.started_at = None;
        expected.finished_at = None;
        let mut actual = restored[task_id].runtime.clone();
        actual.started_at = None;
        actual.finished_at = None;
        assert_eq!(actual, expected, "runtime mismatch for {task_id}");
    }

    // A resumed scheduler over all-terminal tasks stops immediately.
    let outcome = run_scheduler(
        &manager,
        &dirs,
        &mut restored,
        &profiles,
        &mut restored_quota,
        &dry_run_config(),
        &events,
        CancellationToken::new(),
    )
    .await
    .unwrap();
    assert_eq!(
        outcome,
        SchedulerOutcome::Finished {
            completed: 2,
            blocked: 0
        }
    );
    assert_eq!(restored["W101"].runtime.attempts, 1, "no relaunch on resume");
}

#[tokio::test]
async fn stale_running_entry_is_demoted_to_pending() {
    let (_guard, repo) = create_temp_repo();
    let p1 = write_packet(&repo, "w101", &["src/a.py"], &[]);
    let manifest = write_manifest(
        &repo,
        &[ManifestTask {
            id: "W101",
            packet: &p1,
            depends_on: &[],
        }],
    );
    let dirs = ensure_dirs(&repo, Path::new("runtime"), None).unwrap();
    let events = EventSink::new(dirs.events_file.clone());
    let profiles = parse_profiles("m:low").unwrap();

    // Simulate a crash: persist a state file with W101 mid-flight.
    let mut crashed = task_set(load_manifest(&repo, &manifest, false).unwrap());
    {
        let runtime = &mut crashed.get_mut("W101").unwrap().runtime;
        runtime.status = TaskStatus::Running;
        runtime.attempts = 2;
    }
    let pids = BTreeMap::from([("W101".to_string(), 12345u32)]);
    write_state(
        &dirs.state_file,
        &crashed,
        &profiles,
        &QuotaRuntime::default(),
        &pids,
    )
    .unwrap();

    let mut tasks = task_set(load_manifest(&repo, &manifest, false).unwrap());
    let mut quota = QuotaRuntime::default();
    restore_runtime_state(&dirs.state_file, &mut tasks, &profiles, &mut quota, &events).unwrap();

    let runtime = &tasks["W101"].runtime;
    assert_eq!(runtime.status, TaskStatus::Pending);
    assert_eq!(runtime.attempts, 2);
    assert_eq!(runtime.last_failure_kind, Some(FailureKind::Infra));
    assert!(
        runtime
            .last_error
            .as_deref()
            .unwrap()
            .contains("stale 'running' state")
    );
}

#[tokio::test]
async fn demoted_task_relaunches_and_completes() {
    let (_guard, repo) = create_temp_repo();
    let p1 = write_packet(&repo, "w101", &["src/a.py"], &[]);
    let manifest = write_manifest(
        &repo,
        &[ManifestTask {
            id: "W101",
            packet: &p1,
            depends_on: &[],
        }],
    );
    let dirs = ensure_dirs(&repo, Path::new("runtime"), None).unwrap();
    let events = EventSink::new(dirs.events_file.clone());
    let manager = WorktreeManager::new(&repo, dirs.worktrees_root.clone()).unwrap();
    let profiles = parse_profiles("m:low").unwrap();

    let mut crashed = task_set(load_manifest(&repo, &manifest, false).unwrap());
    crashed.get_mut("W101").unwrap().runtime.status = TaskStatus::Running;
    crashed.get_mut("W101").unwrap().runtime.attempts = 1;
    write_state(
        &dirs.state_file,
        &crashed,
        &profiles,
        &QuotaRuntime::default(),
        &BTreeMap::new(),
    )
    .unwrap();

    let mut tasks = task_set(load_manifest(&repo, &manifest, false).unwrap());
    let mut quota = QuotaRuntime::default();
    restore_runtime_state(&dirs.state_file, &mut tasks, &profiles, &mut quota, &events).unwrap();

    let outcome = run_scheduler(
        &manager,
        &dirs,
        &mut tasks,
        &profiles,
        &mut quota,
        &dry_run_config(),
        &events,
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(
        outcome,
        SchedulerOutcome::Finished {
            completed: 1,
            blocked: 0
        }
    );
    // One prior attempt plus the relaunch.
    assert_eq!(tasks["W101"].runtime.attempts, 2);
    let document = read_state(&dirs.state_file).unwrap();
    assert_eq!(document.tasks[0].status, "completed");
}

#[tokio::test]
async fn restored_cooldown_suppresses_launches_until_expiry() {
    let (_guard, repo) = create_temp_repo();
    let p1 = write_packet(&repo, "w101", &["src/a.py"], &[]);
    let manifest = write_manifest(
        &repo,
        &[ManifestTask {
            id: "W101",
            packet: &p1,
            depends_on: &[],
        }],
    );
    let dirs = ensure_dirs(&repo, Path::new("runtime"), None).unwrap();
    let events = EventSink::new(dirs.events_file.clone());
    let manager = WorktreeManager::new(&repo, dirs.worktrees_root.clone()).unwrap();
    let profiles = parse_profiles("m:low").unwrap();

    // A state file carrying an active cooldown.
    let tasks_for_write = task_set(load_manifest(&repo, &manifest, false).unwrap());
    let active = QuotaRuntime {
        cooldown_until: drover_core::state::now_ts() + 1.0,
        last_detected_at: Some(drover_core::state::now_ts()),
        total_failures: 1,
    };
    write_state(
        &dirs.state_file,
        &tasks_for_write,
        &profiles,
        &active,
        &BTreeMap::new(),
    )
    .unwrap();

    let mut tasks = task_set(load_manifest(&repo, &manifest, false).unwrap());
    let mut quota = QuotaRuntime::default();
    restore_runtime_state(&dirs.state_file, &mut tasks, &profiles, &mut quota, &events).unwrap();
    assert!(quota.cooldown_until > 0.0);

    let config = SchedulerConfig {
        poll_interval: Duration::from_millis(50),
        ..dry_run_config()
    };
    let outcome = run_scheduler(
        &manager,
        &dirs,
        &mut tasks,
        &profiles,
        &mut quota,
        &config,
        &events,
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(
        outcome,
        SchedulerOutcome::Finished {
            completed: 1,
            blocked: 0
        }
    );
    // The cooldown window was announced and then released before launch.
    let raw = std::fs::read_to_string(&dirs.events_file).unwrap();
    let names: Vec<String> = raw
        .lines()
        .map(|line| {
            serde_json::from_str::<serde_json::Value>(line).unwrap()["event"]
                .as_str()
                .unwrap()
                .to_string()
        })
        .collect();
    let wait_pos = names.iter().position(|n| n == "quota_wait").unwrap();
    let resume_pos = names.iter().position(|n| n == "quota_resume").unwrap();
    let launch_pos = names.iter().position(|n| n == "task_completed").unwrap();
    assert!(wait_pos < resume_pos);
    assert!(resume_pos < launch_pos);
}
