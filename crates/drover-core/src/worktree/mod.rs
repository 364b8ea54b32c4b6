//! Git worktree provisioning for task isolation.
//!
//! Each task gets its own worktree bound to a dedicated branch, giving
//! workers independent working directories over a shared object store.
//! Worktree paths and branch names are recorded on the task runtime at
//! first launch and reused across retries, so a task keeps accumulating
//! work in one place.
//!
//! All git operations run synchronously on the dispatch task; there is a
//! single writer, so no lock is needed around the shared object store.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Command;

use thiserror::Error;

use drover_manifest::TaskSpec;

use crate::runtime::TaskState;

/// Errors from the worktree layer.
#[derive(Debug, Error)]
pub enum WorktreeError {
    /// The configured repository path is not inside a git repository.
    #[error("not a git repository: {0}")]
    NotAGitRepo(PathBuf),

    /// A git command failed to execute at all.
    #[error("git command failed: {message}")]
    GitCommand {
        message: String,
        #[source]
        source: std::io::Error,
    },

    /// A git command exited with a non-zero status.
    #[error("git {command} failed (exit {code}): {stderr}")]
    GitExit {
        command: String,
        code: i32,
        stderr: String,
    },

    /// A recorded worktree path exists on disk but is not a git worktree.
    #[error("worktree path exists but is not a git repository: {0}")]
    NotAWorktree(PathBuf),
}

fn run_git(args: &[&str], cwd: &Path) -> Result<std::process::Output, WorktreeError> {
    Command::new("git")
        .args(args)
        .current_dir(cwd)
        .output()
        .map_err(|source| WorktreeError::GitCommand {
            message: format!("failed to run git {}", args.join(" ")),
            source,
        })
}

fn check_git(args: &[&str], cwd: &Path) -> Result<std::process::Output, WorktreeError> {
    let output = run_git(args, cwd)?;
    if !output.status.success() {
        return Err(WorktreeError::GitExit {
            command: args.join(" "),
            code: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        });
    }
    Ok(output)
}

/// Resolve the top-level directory of the repository containing `path`.
pub fn git_root(path: &Path) -> Result<PathBuf, WorktreeError> {
    let output = run_git(&["rev-parse", "--show-toplevel"], path)?;
    if !output.status.success() {
        return Err(WorktreeError::NotAGitRepo(path.to_path_buf()));
    }
    let top = String::from_utf8_lossy(&output.stdout).trim().to_string();
    Ok(PathBuf::from(top))
}

/// Lowercase, collapse non-alphanumerics to single dashes, trim.
fn slugify(value: &str) -> String {
    let mut slug = String::with_capacity(value.len());
    let mut last_dash = true;
    for ch in value.chars() {
        let lower = ch.to_ascii_lowercase();
        if lower.is_ascii_alphanumeric() {
            slug.push(lower);
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    let slug = slug.trim_end_matches('-').to_string();
    if slug.is_empty() { "task".to_string() } else { slug }
}

/// Provisions and inspects per-task worktrees under a base directory.
#[derive(Debug, Clone)]
pub struct WorktreeManager {
    repo_root: PathBuf,
    worktrees_root: PathBuf,
}

impl WorktreeManager {
    /// Create a manager rooted at `repo_root`.
    ///
    /// Returns [`WorktreeError::NotAGitRepo`] if `repo_root` is not a git
    /// repository.
    pub fn new(
        repo_root: impl Into<PathBuf>,
        worktrees_root: impl Into<PathBuf>,
    ) -> Result<Self, WorktreeError> {
        let repo_root = repo_root.into();
        let output = run_git(&["rev-parse", "--git-dir"], &repo_root)?;
        if !output.status.success() {
            return Err(WorktreeError::NotAGitRepo(repo_root));
        }
        Ok(Self {
            repo_root,
            worktrees_root: worktrees_root.into(),
        })
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    pub fn worktrees_root(&self) -> &Path {
        &self.worktrees_root
    }

    /// Conventional branch name for a task:
    /// `drover/<task_id_lower>-<packet-slug>`.
    pub fn branch_name(spec: &TaskSpec) -> String {
        let stem = spec
            .packet_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("packet");
        format!("drover/{}-{}", spec.task_id.to_lowercase(), slugify(stem))
    }

    /// Ensure the task has a worktree and branch, creating them on first
    /// launch and reusing the recorded ones on retries.
    ///
    /// New branches start at `base_ref`; an existing branch is checked out
    /// as-is so a retry resumes from the previous attempt's work.
    pub fn ensure_worktree(
        &self,
        task: &mut TaskState,
        base_ref: &str,
    ) -> Result<PathBuf, WorktreeError> {
        let branch = task
            .runtime
            .branch_name
            .clone()
            .unwrap_or_else(|| Self::branch_name(&task.spec));
        task.runtime.branch_name = Some(branch.clone());

        let worktree = task
            .runtime
            .worktree_path
            .clone()
            .unwrap_or_else(|| self.worktrees_root.join(task.spec.task_id.to_lowercase()));
        task.runtime.worktree_path = Some(worktree.clone());

        if worktree.exists() {
            let valid = run_git(&["rev-parse", "--is-inside-work-tree"], &worktree)?;
            if !valid.status.success() {
                return Err(WorktreeError::NotAWorktree(worktree));
            }
            return Ok(worktree);
        }

        let worktree_str = worktree.display().to_string();
        if self.branch_exists(&branch)? {
            check_git(&["worktree", "add", &worktree_str, &branch], &self.repo_root)?;
        } else {
            check_git(
                &["worktree", "add", "-b", &branch, &worktree_str, base_ref],
                &self.repo_root,
            )?;
        }
        tracing::info!(
            task_id = %task.spec.task_id,
            worktree = %worktree.display(),
            branch = %branch,
            "created worktree"
        );
        Ok(worktree)
    }

    /// Whether a local branch exists.
    pub fn branch_exists(&self, branch: &str) -> Result<bool, WorktreeError> {
        let output = run_git(
            &[
                "rev-parse",
                "--verify",
                "--quiet",
                &format!("refs/heads/{branch}"),
            ],
            &self.repo_root,
        )?;
        Ok(output.status.success())
    }

    /// The set of paths a worker touched in its worktree: tracked
    /// modifications, staged changes, and untracked files that are not
    /// ignored. Sorted, deduplicated, best-effort (a failing git query
    /// contributes nothing).
    pub fn changed_files(&self, worktree: &Path) -> Vec<String> {
        let mut files: BTreeSet<String> = BTreeSet::new();
        let queries: [&[&str]; 3] = [
            &["diff", "--name-only"],
            &["diff", "--cached", "--name-only"],
            &["ls-files", "--others", "--exclude-standard"],
        ];
        for args in queries {
            let Ok(output) = run_git(args, worktree) else {
                continue;
            };
            if !output.status.success() {
                continue;
            }
            for line in String::from_utf8_lossy(&output.stdout).lines() {
                let line = line.trim();
                if !line.is_empty() {
                    files.insert(line.to_string());
                }
            }
        }
        files.into_iter().collect()
    }
}
