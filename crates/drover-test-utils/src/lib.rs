//! Shared fixtures for drover integration tests.
//!
//! Provides temp git repositories with an initial commit, packet and
//! manifest writers, and fake worker scripts that stand in for the real
//! worker command.

use std::path::{Path, PathBuf};
use std::process::Command;

use tempfile::TempDir;

/// Run a git command in `dir`, panicking with stderr on failure.
pub fn git(dir: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap_or_else(|e| panic!("git {} failed to start: {e}", args.join(" ")));
    assert!(
        output.status.success(),
        "git {} failed: {}",
        args.join(" "),
        String::from_utf8_lossy(&output.stderr)
    );
}

/// Create a temporary git repository with one commit.
///
/// Returns the `TempDir` (keep it alive for the test's duration) and the
/// repository path.
pub fn create_temp_repo() -> (TempDir, PathBuf) {
    let dir = TempDir::new().expect("failed to create temp dir");
    let repo_path = dir.path().to_path_buf();

    git(&repo_path, &["init"]);
    git(&repo_path, &["config", "user.email", "test@drover.dev"]);
    git(&repo_path, &["config", "user.name", "Drover Test"]);
    std::fs::write(repo_path.join("README.md"), "# Test repo\n").unwrap();
    std::fs::write(repo_path.join(".gitignore"), "runtime/\n").unwrap();
    std::fs::create_dir_all(repo_path.join("src")).unwrap();
    std::fs::write(repo_path.join("src/a.py"), "print('a')\n").unwrap();
    git(&repo_path, &["add", "."]);
    git(&repo_path, &["commit", "-m", "Initial commit"]);

    (dir, repo_path)
}

/// Write a packet markdown file under `packets/` and return its
/// repo-relative path.
pub fn write_packet(
    repo_root: &Path,
    name: &str,
    allowed_files: &[&str],
    validation_commands: &[&str],
) -> String {
    let mut body = format!("# Packet {name}\n\n## Objective\n\nDo the work.\n\n## Allowed Files\n\n");
    for path in allowed_files {
        body.push_str(&format!("- `{path}`\n"));
    }
    body.push_str("\n## Validation Commands\n\n```bash\n");
    for command in validation_commands {
        body.push_str(command);
        body.push('\n');
    }
    body.push_str("```\n");

    let rel = format!("packets/{name}.md");
    let path = repo_root.join(&rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, body).unwrap();
    rel
}

/// A manifest entry for [`write_manifest`].
pub struct ManifestTask<'a> {
    pub id: &'a str,
    pub packet: &'a str,
    pub depends_on: &'a [&'a str],
}

/// Write a manifest JSON file and return its path.
pub fn write_manifest(repo_root: &Path, tasks: &[ManifestTask<'_>]) -> PathBuf {
    let entries: Vec<serde_json::Value> = tasks
        .iter()
        .map(|task| {
            serde_json::json!({
                "id": task.id,
                "packet": task.packet,
                "depends_on": task.depends_on,
            })
        })
        .collect();
    let path = repo_root.join("manifest.json");
    std::fs::write(
        &path,
        serde_json::to_string_pretty(&serde_json::json!({ "tasks": entries })).unwrap(),
    )
    .unwrap();
    path
}

/// Write an executable shell script and return its path.
///
/// Used to fake the worker command: the scheduler's worker template can
/// point at the script, which may edit files in the worktree, print
/// marker text, and exit with a chosen code.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
    path
}
