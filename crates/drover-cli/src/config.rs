//! Operator configuration for drover.
//!
//! An optional TOML file at `~/.config/drover/config.toml` supplies
//! defaults for the worker command template and the escalation ladder.
//! Each value resolves through the chain: CLI flag > env var > config
//! file > built-in default.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Built-in worker command template: feed the prompt to the codex CLI in
/// the task's worktree.
pub const DEFAULT_WORKER_TEMPLATE: &str = "cat {prompt_file_q} | \
     codex exec -m {model_q} \
     -c model_reasoning_effort={reasoning_q} \
     --cd {worktree_q} --skip-git-repo-check -";

/// Built-in escalation ladder.
pub const DEFAULT_EXECUTOR_PROFILES: &str = "gpt-5.3-codex:low;\
     gpt-5.3-codex:medium;\
     gpt-5.3-codex:high;\
     gpt-5.3-codex:xhigh;\
     gpt-5.1-codex-max:high";

pub const WORKER_TEMPLATE_ENV: &str = "DROVER_WORKER_COMMAND_TEMPLATE";
pub const EXECUTOR_PROFILES_ENV: &str = "DROVER_EXECUTOR_PROFILES";

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub worker: WorkerSection,
    #[serde(default)]
    pub scheduler: SchedulerSection,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct WorkerSection {
    pub command_template: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SchedulerSection {
    pub executor_profiles: Option<String>,
}

/// The drover config directory.
///
/// Always XDG layout: `$XDG_CONFIG_HOME/drover` or `~/.config/drover`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("drover");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("drover")
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// Load the config file if it exists and parses.
pub fn load_config() -> Option<ConfigFile> {
    let contents = std::fs::read_to_string(config_path()).ok()?;
    match toml::from_str(&contents) {
        Ok(config) => Some(config),
        Err(error) => {
            tracing::warn!(%error, "ignoring malformed config file");
            None
        }
    }
}

fn resolve(
    cli_value: Option<&str>,
    env_var: &str,
    file_value: Option<String>,
    default: &str,
) -> String {
    if let Some(value) = cli_value {
        return value.to_string();
    }
    if let Ok(value) = std::env::var(env_var) {
        if !value.is_empty() {
            return value;
        }
    }
    if let Some(value) = file_value {
        return value;
    }
    default.to_string()
}

/// Resolve the worker command template.
pub fn resolve_worker_template(cli_value: Option<&str>, file: Option<&ConfigFile>) -> String {
    resolve(
        cli_value,
        WORKER_TEMPLATE_ENV,
        file.and_then(|f| f.worker.command_template.clone()),
        DEFAULT_WORKER_TEMPLATE,
    )
}

/// Resolve the escalation ladder spec.
pub fn resolve_executor_profiles(cli_value: Option<&str>, file: Option<&ConfigFile>) -> String {
    resolve(
        cli_value,
        EXECUTOR_PROFILES_ENV,
        file.and_then(|f| f.scheduler.executor_profiles.clone()),
        DEFAULT_EXECUTOR_PROFILES,
    )
}
