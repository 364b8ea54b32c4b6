//! The `drover` binary.
//!
//! Wires the flag surface to the scheduler engine: argument validation,
//! manifest loading, config resolution, optional model probing, state
//! resume, interrupt handling, and exit codes.
//!
//! Exit codes: 0 success with no blocked tasks, 1 success with blocked
//! tasks, 2 startup or configuration error, 130 operator interrupt.

mod config;
mod report;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tokio_util::sync::CancellationToken;

use drover_core::probe::filter_profiles_by_model_probe;
use drover_core::profile::{ModelProfile, parse_profiles};
use drover_core::runtime::{QuotaRuntime, RuntimeDirs, TaskSet, ensure_dirs, task_set};
use drover_core::scheduler::{SchedulerConfig, SchedulerOutcome, run_scheduler};
use drover_core::state::{EventSink, restore_runtime_state};
use drover_core::worktree::{WorktreeManager, git_root};

#[derive(Debug, Parser)]
#[command(
    name = "drover",
    about = "Live orchestrator for packet tasks with model escalation"
)]
struct Cli {
    /// Path to the task manifest JSON, relative to the repository root.
    #[arg(long, default_value = "manifest.json")]
    manifest: PathBuf,

    /// Repository root (git top-level for worktree commands).
    #[arg(long, default_value = ".")]
    repo_root: PathBuf,

    /// Directory for prompts, logs, and state outputs.
    #[arg(long, default_value = "tmp/drover")]
    runtime_dir: PathBuf,

    /// Worktree root directory (default: <runtime-dir>/worktrees).
    #[arg(long)]
    worktree_root: Option<PathBuf>,

    /// Optional path override for state.json.
    #[arg(long)]
    state_file: Option<PathBuf>,

    /// Base ref for new worktree branches.
    #[arg(long, default_value = "HEAD")]
    base_ref: String,

    /// Max concurrent running workers.
    #[arg(long, default_value_t = 3)]
    max_parallel: usize,

    /// Seconds between scheduler iterations.
    #[arg(long, default_value_t = 3.0, allow_negative_numbers = true)]
    poll_interval: f64,

    /// Max launch attempts per task before blocking.
    #[arg(long, default_value_t = 6)]
    max_attempts: u32,

    /// Timeout per validation command execution, in seconds.
    #[arg(long, default_value_t = 1800)]
    command_timeout_seconds: u64,

    /// Hard timeout for a worker process, in seconds. 0 disables it.
    #[arg(long, default_value_t = 0)]
    worker_timeout_seconds: u64,

    /// Global cooldown window after a quota/rate-limit failure before new
    /// worker launches are allowed, in seconds.
    #[arg(long, default_value_t = 900)]
    quota_cooldown_seconds: u64,

    /// Block a task after this many quota/rate-limit failures.
    #[arg(long, default_value_t = 3)]
    quota_max_failures_per_task: u32,

    /// On the first quota/rate-limit failure, block all pending tasks
    /// immediately instead of waiting for retries.
    #[arg(long)]
    quota_fail_fast: bool,

    /// Escalate after this many compile failures at the current profile.
    #[arg(long, default_value_t = 2)]
    escalate_after_compile: u32,

    /// Escalate after this many runtime failures at the current profile.
    #[arg(long, default_value_t = 2)]
    escalate_after_runtime: u32,

    /// Escalation ladder as semicolon-separated model:reasoning entries,
    /// e.g. 'codex:low;codex:medium;codex:high'. Reasoning values:
    /// none|minimal|low|medium|high|xhigh (alias 'extrahigh' accepted).
    #[arg(long)]
    executor_profiles: Option<String>,

    /// Command template used to launch one worker. Supports placeholders
    /// {task_id},{model},{reasoning},{worktree},{prompt_file},{log_file},
    /// {packet_path} and *_q quoted variants.
    #[arg(long)]
    worker_command_template: Option<String>,

    /// Probe unique ladder models via the codex CLI and drop unsupported
    /// models before orchestration starts.
    #[arg(long)]
    probe_models: bool,

    /// Timeout per model probe request, in seconds.
    #[arg(long, default_value_t = 60)]
    probe_model_timeout_seconds: u64,

    /// Allow packets with no parsed 'Allowed Files' entries. By default
    /// empty allowed-file sets are rejected to fail closed.
    #[arg(long)]
    allow_empty_allowed_files: bool,

    /// Ignore existing runtime state and start fresh.
    #[arg(long)]
    no_resume: bool,

    /// Print a compact report from the current state file and exit.
    #[arg(long)]
    report: bool,

    /// Schedule tasks without launching workers or running validation.
    #[arg(long)]
    dry_run: bool,
}

fn validate_args(cli: &Cli) -> Result<()> {
    if cli.max_parallel < 1 {
        bail!("--max-parallel must be at least 1.");
    }
    if cli.max_attempts < 1 {
        bail!("--max-attempts must be at least 1.");
    }
    if cli.quota_cooldown_seconds < 1 {
        bail!("--quota-cooldown-seconds must be at least 1.");
    }
    if cli.quota_max_failures_per_task < 1 {
        bail!("--quota-max-failures-per-task must be at least 1.");
    }
    if cli.escalate_after_compile < 1 {
        bail!("--escalate-after-compile must be at least 1.");
    }
    if cli.escalate_after_runtime < 1 {
        bail!("--escalate-after-runtime must be at least 1.");
    }
    if cli.command_timeout_seconds < 1 {
        bail!("--command-timeout-seconds must be at least 1.");
    }
    if cli.poll_interval < 0.0 {
        bail!("--poll-interval must be >= 0.");
    }
    if cli.probe_model_timeout_seconds < 1 {
        bail!("--probe-model-timeout-seconds must be at least 1.");
    }
    Ok(())
}

/// State file location for `--report`, which must work without a live
/// repository: fall back to the raw `--repo-root` when it is not inside
/// a git repo.
fn resolve_report_state_path(cli: &Cli) -> PathBuf {
    if let Some(state_file) = &cli.state_file {
        return state_file.clone();
    }
    let base = if cli.runtime_dir.is_absolute() {
        cli.runtime_dir.clone()
    } else {
        let root = git_root(&cli.repo_root).unwrap_or_else(|_| cli.repo_root.clone());
        root.join(&cli.runtime_dir)
    };
    base.join("state.json")
}

fn run_report(cli: &Cli) -> ExitCode {
    let state_path = resolve_report_state_path(cli);
    match report::render_state_report(&state_path) {
        Ok(rendered) => {
            println!("{rendered}");
            if state_path.exists() {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(1)
            }
        }
        Err(error) => {
            eprintln!("report error: {error:#}");
            ExitCode::from(2)
        }
    }
}

/// Everything assembled during startup.
struct Startup {
    manager: WorktreeManager,
    dirs: RuntimeDirs,
    tasks: TaskSet,
    profiles: Vec<ModelProfile>,
    quota: QuotaRuntime,
    scheduler_config: SchedulerConfig,
    events: EventSink,
    manifest_path: PathBuf,
}

async fn prepare(cli: &Cli) -> Result<Startup> {
    validate_args(cli)?;

    let repo_root = git_root(&cli.repo_root)
        .with_context(|| format!("--repo-root {} is not a git repository", cli.repo_root.display()))?;
    let manifest_path = if cli.manifest.is_absolute() {
        cli.manifest.clone()
    } else {
        repo_root.join(&cli.manifest)
    };

    let specs = drover_manifest::load_manifest(
        &repo_root,
        &manifest_path,
        cli.allow_empty_allowed_files,
    )?;
    let mut tasks = task_set(specs);

    let file_config = config::load_config();
    let ladder = config::resolve_executor_profiles(
        cli.executor_profiles.as_deref(),
        file_config.as_ref(),
    );
    let mut profiles = parse_profiles(&ladder)?;
    let worker_template = config::resolve_worker_template(
        cli.worker_command_template.as_deref(),
        file_config.as_ref(),
    );

    let mut dirs = ensure_dirs(&repo_root, &cli.runtime_dir, cli.worktree_root.as_deref())?;
    if let Some(state_file) = &cli.state_file {
        dirs.state_file = state_file.clone();
        if let Some(parent) = dirs.state_file.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
            dirs.events_file = parent.join("events.jsonl");
        }
    }
    let events = EventSink::new(dirs.events_file.clone());

    let mut quota = QuotaRuntime::default();

    if cli.probe_models {
        profiles = filter_profiles_by_model_probe(
            &repo_root,
            profiles,
            Duration::from_secs(cli.probe_model_timeout_seconds),
            &events,
        )
        .await?;
    }

    if cli.no_resume {
        events.emit(
            "resume_skip",
            "--no-resume set; starting with fresh runtime state",
            serde_json::json!({}),
        );
    } else {
        restore_runtime_state(&dirs.state_file, &mut tasks, &profiles, &mut quota, &events)?;
    }

    let manager = WorktreeManager::new(repo_root, dirs.worktrees_root.clone())?;
    let scheduler_config = SchedulerConfig {
        max_parallel: cli.max_parallel,
        poll_interval: Duration::from_secs_f64(cli.poll_interval),
        max_attempts: cli.max_attempts,
        command_timeout: Duration::from_secs(cli.command_timeout_seconds),
        worker_timeout: match cli.worker_timeout_seconds {
            0 => None,
            seconds => Some(Duration::from_secs(seconds)),
        },
        quota_cooldown_seconds: cli.quota_cooldown_seconds,
        quota_max_failures_per_task: cli.quota_max_failures_per_task,
        quota_fail_fast: cli.quota_fail_fast,
        escalate_after_compile: cli.escalate_after_compile,
        escalate_after_runtime: cli.escalate_after_runtime,
        base_ref: cli.base_ref.clone(),
        dry_run: cli.dry_run,
        worker_template,
    };

    Ok(Startup {
        manager,
        dirs,
        tasks,
        profiles,
        quota,
        scheduler_config,
        events,
        manifest_path,
    })
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    if cli.report {
        return run_report(&cli);
    }

    let mut startup = match prepare(&cli).await {
        Ok(startup) => startup,
        Err(error) => {
            eprintln!("startup error: {error:#}");
            return ExitCode::from(2);
        }
    };

    startup.events.emit(
        "start",
        format!(
            "Live orchestrator started with {} tasks, max_parallel={}, dry_run={}.",
            startup.tasks.len(),
            cli.max_parallel,
            cli.dry_run
        ),
        serde_json::json!({
            "manifest": startup.manifest_path.display().to_string(),
        }),
    );

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    let outcome = run_scheduler(
        &startup.manager,
        &startup.dirs,
        &mut startup.tasks,
        &startup.profiles,
        &mut startup.quota,
        &startup.scheduler_config,
        &startup.events,
        cancel,
    )
    .await;

    match outcome {
        Ok(SchedulerOutcome::Finished { completed, blocked }) => {
            startup.events.emit(
                "finish",
                format!("Orchestration finished: completed={completed}, blocked={blocked}."),
                serde_json::json!({
                    "completed": completed,
                    "blocked": blocked,
                    "state_file": startup.dirs.state_file.display().to_string(),
                }),
            );
            if blocked == 0 {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(1)
            }
        }
        Ok(SchedulerOutcome::Interrupted) => ExitCode::from(130),
        Err(error) => {
            eprintln!("orchestrator error: {error:#}");
            ExitCode::from(1)
        }
    }
}
