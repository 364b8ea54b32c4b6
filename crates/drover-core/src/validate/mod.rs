//! Validation runner: execute a task's acceptance commands in its
//! worktree.
//!
//! Commands run in order through the shell, each under the configured
//! per-command timeout. Execution stops at the first failure and the
//! diagnostic carries the 1-based index, the command text, the exit code
//! (or a timeout notice), and the trimmed combined output.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command;

/// How long to keep harvesting pipe output after a timeout kill. Bounded
/// because a killed shell may leave grandchildren holding the pipe open.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Outcome of running one command.
enum CommandOutcome {
    Exited { code: Option<i32>, output: String },
    TimedOut { partial: String },
    SpawnFailed { error: String },
}

/// Read a pipe incrementally into a shared buffer so partial output is
/// available even if the reader never reaches EOF.
async fn drain_into<R: tokio::io::AsyncRead + Unpin>(pipe: Option<R>, sink: Arc<Mutex<Vec<u8>>>) {
    let Some(mut pipe) = pipe else {
        return;
    };
    let mut chunk = [0u8; 4096];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                let mut buf = sink.lock().unwrap_or_else(|e| e.into_inner());
                buf.extend_from_slice(&chunk[..n]);
            }
        }
    }
}

fn buffered(sink: &Arc<Mutex<Vec<u8>>>) -> String {
    let buf = sink.lock().unwrap_or_else(|e| e.into_inner());
    String::from_utf8_lossy(&buf).into_owned()
}

async fn run_one(command: &str, cwd: &Path, timeout: Duration) -> CommandOutcome {
    let mut child = match Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(cwd)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(error) => {
            return CommandOutcome::SpawnFailed {
                error: error.to_string(),
            };
        }
    };

    // Read pipes on separate tasks so a full pipe buffer cannot deadlock
    // the wait.
    let stdout_buf = Arc::new(Mutex::new(Vec::new()));
    let stderr_buf = Arc::new(Mutex::new(Vec::new()));
    let stdout_task = tokio::spawn(drain_into(child.stdout.take(), Arc::clone(&stdout_buf)));
    let stderr_task = tokio::spawn(drain_into(child.stderr.take(), Arc::clone(&stderr_buf)));

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => {
            let _ = stdout_task.await;
            let _ = stderr_task.await;
            CommandOutcome::Exited {
                code: status.code(),
                output: format!("{}{}", buffered(&stdout_buf), buffered(&stderr_buf)),
            }
        }
        Ok(Err(error)) => {
            let _ = child.kill().await;
            CommandOutcome::SpawnFailed {
                error: error.to_string(),
            }
        }
        Err(_elapsed) => {
            let _ = child.kill().await;
            // Grandchildren may still hold the pipes; harvest briefly.
            let _ = tokio::time::timeout(DRAIN_GRACE, stdout_task).await;
            let _ = tokio::time::timeout(DRAIN_GRACE, stderr_task).await;
            CommandOutcome::TimedOut {
                partial: format!("{}{}", buffered(&stdout_buf), buffered(&stderr_buf)),
            }
        }
    }
}

/// Run `commands` in order inside `worktree`.
///
/// Returns `(ok, diagnostic)`. A task with no commands trivially
/// succeeds.
pub async fn run_validation_commands(
    commands: &[String],
    worktree: &Path,
    timeout: Duration,
) -> (bool, String) {
    if commands.is_empty() {
        return (true, "No validation commands parsed from packet.".to_string());
    }

    for (idx, command) in commands.iter().enumerate() {
        let index = idx + 1;
        match run_one(command, worktree, timeout).await {
            CommandOutcome::Exited { code: Some(0), .. } => continue,
            CommandOutcome::Exited { code, output } => {
                let code_text = code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string());
                return (
                    false,
                    format!("[{index}] `{command}` failed ({code_text})\n{}", output.trim()),
                );
            }
            CommandOutcome::TimedOut { partial } => {
                return (
                    false,
                    format!(
                        "[{index}] `{command}` timed out after {}s\n{}",
                        timeout.as_secs(),
                        partial.trim()
                    ),
                );
            }
            CommandOutcome::SpawnFailed { error } => {
                return (
                    false,
                    format!("[{index}] `{command}` could not be executed\n{error}"),
                );
            }
        }
    }

    (true, "All packet validation commands passed.".to_string())
}
