//! End-to-end scheduler tests with fake worker scripts.
//!
//! The worker command template points at a shell script standing in for
//! the real worker. Scripts edit files inside the task worktree, print
//! marker text for the failure classifier, and exit with chosen codes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use drover_core::classify::FailureKind;
use drover_core::runtime::{QuotaRuntime, RuntimeDirs, TaskSet, TaskStatus, ensure_dirs, task_set};
use drover_core::scheduler::{SchedulerConfig, SchedulerOutcome, run_scheduler};
use drover_core::state::{EventSink, read_state};
use drover_core::worktree::WorktreeManager;
use drover_manifest::load_manifest;
use drover_test_utils::{ManifestTask, create_temp_repo, write_manifest, write_packet, write_script};

struct Harness {
    _guard: tempfile::TempDir,
    repo: PathBuf,
    tasks: TaskSet,
    dirs: RuntimeDirs,
    events: EventSink,
    manager: WorktreeManager,
}

fn harness(manifest_tasks: &[(&str, &str)], packets: &[(&str, &[&str], &[&str])]) -> Harness {
    let (guard, repo) = create_temp_repo();
    let mut packet_paths: Vec<(String, String)> = Vec::new();
    for (name, allowed, validations) in packets {
        let rel = write_packet(&repo, name, allowed, validations);
        packet_paths.push(((*name).to_string(), rel));
    }
    let entries: Vec<ManifestTask<'_>> = manifest_tasks
        .iter()
        .map(|(id, packet_name)| ManifestTask {
            id,
            packet: &packet_paths
                .iter()
                .find(|(name, _)| name == packet_name)
                .unwrap()
                .1,
            depends_on: &[],
        })
        .collect();
    let manifest = write_manifest(&repo, &entries);
    let specs = load_manifest(&repo, &manifest, false).unwrap();
    let tasks = task_set(specs);
    let dirs = ensure_dirs(&repo, Path::new("runtime"), None).unwrap();
    let events = EventSink::new(dirs.events_file.clone());
    let manager = WorktreeManager::new(&repo, dirs.worktrees_root.clone()).unwrap();
    Harness {
        _guard: guard,
        repo,
        tasks,
        dirs,
        events,
        manager,
    }
}

fn config(worker_template: String) -> SchedulerConfig {
    SchedulerConfig {
        max_parallel: 3,
        poll_interval: Duration::from_millis(20),
        max_attempts: 6,
        command_timeout: Duration::from_secs(30),
        worker_timeout: None,
        quota_cooldown_seconds: 900,
        quota_max_failures_per_task: 3,
        quota_fail_fast: false,
        escalate_after_compile: 2,
        escalate_after_runtime: 2,
        base_ref: "HEAD".to_string(),
        dry_run: false,
        worker_template,
    }
}

/// Template that runs `script` with the worktree as its one argument.
fn script_template(script: &Path) -> String {
    format!("{} {{worktree_q}}", script.display())
}

async fn run(h: &mut Harness, config: &SchedulerConfig) -> SchedulerOutcome {
    let profiles = drover_core::profile::parse_profiles("m:low;m:high").unwrap();
    let mut quota = QuotaRuntime::default();
    run_scheduler(
        &h.manager,
        &h.dirs,
        &mut h.tasks,
        &profiles,
        &mut quota,
        config,
        &h.events,
        CancellationToken::new(),
    )
    .await
    .unwrap()
}

fn events_named(h: &Harness, name: &str) -> usize {
    let raw = std::fs::read_to_string(&h.dirs.events_file).unwrap_or_default();
    raw.lines()
        .filter(|line| {
            serde_json::from_str::<serde_json::Value>(line).unwrap()["event"] == name
        })
        .count()
}

#[tokio::test]
async fn successful_worker_passes_gate_and_validation() {
    let mut h = harness(
        &[("W101", "w101")],
        &[("w101", &["src/a.py"], &["test -f src/a.py", "echo ok"])],
    );
    let script = write_script(
        &h.repo,
        "worker.sh",
        "echo working\necho 'print(1)' >> \"$1\"/src/a.py\nexit 0\n",
    );

    let outcome = run(&mut h, &config(script_template(&script))).await;

    assert_eq!(
        outcome,
        SchedulerOutcome::Finished {
            completed: 1,
            blocked: 0
        }
    );
    let runtime = &h.tasks["W101"].runtime;
    assert_eq!(runtime.status, TaskStatus::Completed);
    assert_eq!(runtime.attempts, 1);
    assert_eq!(runtime.last_changed_files, vec!["src/a.py"]);
    assert!(runtime.last_error.is_none());

    // Per-attempt artifacts exist and carry the expected content.
    let prompt = std::fs::read_to_string(h.dirs.prompts.join("W101_attempt_01.txt")).unwrap();
    assert!(prompt.contains("You are executing packet W101."));
    let log = std::fs::read_to_string(h.dirs.logs.join("W101_attempt_01.log")).unwrap();
    assert!(log.starts_with("# launch: "));
    assert!(log.contains("working"));

    let document = read_state(&h.dirs.state_file).unwrap();
    assert_eq!(document.summary.completed, 1);
    assert_eq!(document.tasks[0].last_changed_files, vec!["src/a.py"]);
}

#[tokio::test]
async fn scope_violation_blocks_without_retry() {
    let mut h = harness(&[("W101", "w101")], &[("w101", &["src/a.py"], &[])]);
    let script = write_script(
        &h.repo,
        "worker.sh",
        "echo 'print(1)' >> \"$1\"/src/a.py\necho evil > \"$1\"/src/evil.py\nexit 0\n",
    );

    let outcome = run(&mut h, &config(script_template(&script))).await;

    assert_eq!(
        outcome,
        SchedulerOutcome::Finished {
            completed: 0,
            blocked: 1
        }
    );
    let runtime = &h.tasks["W101"].runtime;
    assert_eq!(runtime.status, TaskStatus::Blocked);
    assert_eq!(runtime.attempts, 1, "scope violations do not retry");
    let reason = runtime.block_reason.as_deref().unwrap();
    assert!(
        reason.starts_with("scope gate failed (disallowed files):"),
        "got: {reason}"
    );
    assert!(reason.contains("src/evil.py"));
    assert!(!reason.contains("src/a.py"), "allowed file is not listed");
    assert_eq!(
        runtime.last_changed_files,
        vec!["src/a.py".to_string(), "src/evil.py".to_string()]
    );
}

#[tokio::test]
async fn compile_failures_escalate_then_block_at_max_attempts() {
    let mut h = harness(&[("W101", "w101")], &[("w101", &["src/a.py"], &[])]);
    let script = write_script(
        &h.repo,
        "worker.sh",
        "echo 'error: failed to compile'\nexit 1\n",
    );
    let config = SchedulerConfig {
        max_attempts: 2,
        ..config(script_template(&script))
    };

    let outcome = run(&mut h, &config).await;

    assert_eq!(
        outcome,
        SchedulerOutcome::Finished {
            completed: 0,
            blocked: 1
        }
    );
    let runtime = &h.tasks["W101"].runtime;
    assert_eq!(runtime.status, TaskStatus::Blocked);
    assert_eq!(runtime.attempts, 2);
    assert_eq!(runtime.compile_failures_total, 2);
    assert_eq!(runtime.last_failure_kind, Some(FailureKind::Compile));
    assert_eq!(
        runtime.block_reason.as_deref(),
        Some("max attempts reached (2). Last failure kind=compile.")
    );
    // Second compile failure reached the threshold: one rung up.
    assert_eq!(runtime.profile_index, 1);
    assert_eq!(events_named(&h, "task_retry"), 1);
    assert_eq!(events_named(&h, "escalation"), 1);
}

#[tokio::test]
async fn validation_failure_is_classified_and_routed() {
    let mut h = harness(
        &[("W101", "w101")],
        &[("w101", &["src/a.py"], &["echo checking", "false"])],
    );
    let script = write_script(&h.repo, "worker.sh", "exit 0\n");
    let config = SchedulerConfig {
        max_attempts: 1,
        ..config(script_template(&script))
    };

    let outcome = run(&mut h, &config).await;

    assert_eq!(
        outcome,
        SchedulerOutcome::Finished {
            completed: 0,
            blocked: 1
        }
    );
    let runtime = &h.tasks["W101"].runtime;
    assert_eq!(runtime.status, TaskStatus::Blocked);
    assert_eq!(runtime.last_failure_kind, Some(FailureKind::Unknown));
    assert_eq!(
        runtime.block_reason.as_deref(),
        Some("max attempts reached (1). Last failure kind=unknown.")
    );
}

#[tokio::test]
async fn quota_fail_fast_blocks_all_pending_tasks() {
    let mut h = harness(
        &[("W101", "w101"), ("W102", "w102")],
        &[("w101", &["src/a.py"], &[]), ("w102", &["src/b.py"], &[])],
    );
    let script = write_script(
        &h.repo,
        "worker.sh",
        "echo '429 too many requests'\nexit 1\n",
    );
    let config = SchedulerConfig {
        max_parallel: 1,
        quota_fail_fast: true,
        ..config(script_template(&script))
    };

    let profiles = drover_core::profile::parse_profiles("m:low").unwrap();
    let mut quota = QuotaRuntime::default();
    let outcome = run_scheduler(
        &h.manager,
        &h.dirs,
        &mut h.tasks,
        &profiles,
        &mut quota,
        &config,
        &h.events,
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(
        outcome,
        SchedulerOutcome::Finished {
            completed: 0,
            blocked: 2
        }
    );
    assert_eq!(h.tasks["W101"].runtime.status, TaskStatus::Blocked);
    assert_eq!(h.tasks["W102"].runtime.status, TaskStatus::Blocked);
    assert_eq!(h.tasks["W101"].runtime.last_failure_kind, Some(FailureKind::Quota));
    assert!(quota.cooldown_until > drover_core::state::now_ts());
    assert_eq!(events_named(&h, "quota_fail_fast"), 1);

    let document = read_state(&h.dirs.state_file).unwrap();
    assert!(document.orchestrator.quota_cooldown_until > 0.0);
    assert_eq!(document.orchestrator.quota_failures_total, 1);
}

#[tokio::test]
async fn quota_cooldown_suppresses_launches_then_resumes() {
    let mut h = harness(&[("W101", "w101")], &[("w101", &["src/a.py"], &[])]);
    let script = write_script(
        &h.repo,
        "worker.sh",
        "echo 'rate limit reached'\nexit 1\n",
    );
    let config = SchedulerConfig {
        quota_cooldown_seconds: 1,
        quota_max_failures_per_task: 2,
        poll_interval: Duration::from_millis(50),
        ..config(script_template(&script))
    };

    let profiles = drover_core::profile::parse_profiles("m:low").unwrap();
    let mut quota = QuotaRuntime::default();
    let outcome = run_scheduler(
        &h.manager,
        &h.dirs,
        &mut h.tasks,
        &profiles,
        &mut quota,
        &config,
        &h.events,
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(
        outcome,
        SchedulerOutcome::Finished {
            completed: 0,
            blocked: 1
        }
    );
    let runtime = &h.tasks["W101"].runtime;
    assert_eq!(runtime.attempts, 2);
    assert_eq!(runtime.quota_failures_total, 2);
    assert!(
        runtime
            .block_reason
            .as_deref()
            .unwrap()
            .contains("threshold reached (2/2)")
    );
    assert_eq!(quota.total_failures, 2);

    // The cooldown window was announced once per window and released.
    assert!(events_named(&h, "quota_wait") >= 1);
    assert!(events_named(&h, "quota_resume") >= 1);
    assert_eq!(events_named(&h, "quota_cooldown"), 2);
}

#[tokio::test]
async fn worker_timeout_terminates_and_routes_as_infra() {
    let mut h = harness(&[("W101", "w101")], &[("w101", &["src/a.py"], &[])]);
    let script = write_script(&h.repo, "worker.sh", "sleep 30\n");
    let config = SchedulerConfig {
        worker_timeout: Some(Duration::from_secs(1)),
        max_attempts: 1,
        poll_interval: Duration::from_millis(50),
        ..config(script_template(&script))
    };

    let outcome = run(&mut h, &config).await;

    assert_eq!(
        outcome,
        SchedulerOutcome::Finished {
            completed: 0,
            blocked: 1
        }
    );
    let runtime = &h.tasks["W101"].runtime;
    assert_eq!(runtime.status, TaskStatus::Blocked);
    assert_eq!(runtime.last_failure_kind, Some(FailureKind::Infra));
    assert_eq!(
        runtime.block_reason.as_deref(),
        Some("max attempts reached (1). Last failure kind=infra.")
    );
}

#[tokio::test]
async fn launch_failure_is_contained_as_infra() {
    let mut h = harness(&[("W101", "w101")], &[("w101", &["src/a.py"], &[])]);
    let config = SchedulerConfig {
        max_attempts: 1,
        ..config("run {not_a_placeholder}".to_string())
    };

    let outcome = run(&mut h, &config).await;

    assert_eq!(
        outcome,
        SchedulerOutcome::Finished {
            completed: 0,
            blocked: 1
        }
    );
    let runtime = &h.tasks["W101"].runtime;
    assert_eq!(runtime.status, TaskStatus::Blocked);
    assert_eq!(runtime.last_failure_kind, Some(FailureKind::Infra));
}

#[tokio::test]
async fn retry_reuses_worktree_and_mentions_previous_failure() {
    let mut h = harness(&[("W101", "w101")], &[("w101", &["marker.txt"], &[])]);
    // Fails once, then succeeds because the marker persists in the
    // reused worktree.
    let script = write_script(
        &h.repo,
        "worker.sh",
        "if [ -f \"$1\"/marker.txt ]; then\n\
         exit 0\n\
         else\n\
         echo made marker > \"$1\"/marker.txt\n\
         echo 'transient blip'\n\
         exit 1\n\
         fi\n",
    );

    let outcome = run(&mut h, &config(script_template(&script))).await;

    assert_eq!(
        outcome,
        SchedulerOutcome::Finished {
            completed: 1,
            blocked: 0
        }
    );
    let runtime = &h.tasks["W101"].runtime;
    assert_eq!(runtime.attempts, 2);
    assert_eq!(runtime.status, TaskStatus::Completed);
    assert_eq!(runtime.last_changed_files, vec!["marker.txt"]);

    // Second attempt's prompt carries the previous-failure block.
    let prompt2 = std::fs::read_to_string(h.dirs.prompts.join("W101_attempt_02.txt")).unwrap();
    assert!(prompt2.contains("Previous attempt failed."));
    assert!(prompt2.contains("- failure_kind: unknown"));

    // Same worktree and branch across attempts.
    let document = read_state(&h.dirs.state_file).unwrap();
    assert_eq!(
        document.tasks[0].worktree_path.as_deref(),
        Some(
            h.dirs
                .worktrees_root
                .join("w101")
                .display()
                .to_string()
                .as_str()
        )
    );
    assert_eq!(
        document.tasks[0].branch_name.as_deref(),
        Some("drover/w101-w101")
    );
}

#[tokio::test]
async fn pre_cancelled_scheduler_interrupts_cleanly() {
    let mut h = harness(&[("W101", "w101")], &[("w101", &["src/a.py"], &[])]);
    let script = write_script(&h.repo, "worker.sh", "exit 0\n");
    let cancel = CancellationToken::new();
    cancel.cancel();

    let profiles = drover_core::profile::parse_profiles("m:low").unwrap();
    let mut quota = QuotaRuntime::default();
    let outcome = run_scheduler(
        &h.manager,
        &h.dirs,
        &mut h.tasks,
        &profiles,
        &mut quota,
        &config(script_template(&script)),
        &h.events,
        cancel,
    )
    .await
    .unwrap();

    assert_eq!(outcome, SchedulerOutcome::Interrupted);
    assert_eq!(events_named(&h, "interrupt"), 1);
    // State was persisted on the way out.
    read_state(&h.dirs.state_file).unwrap();
}
