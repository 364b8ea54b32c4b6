//! Manifest loading: JSON task list -> validated [`TaskSpec`] set.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::{ManifestError, TaskSpec};

#[derive(Debug, Deserialize)]
struct ManifestDoc {
    tasks: Vec<ManifestEntry>,
}

#[derive(Debug, Deserialize)]
struct ManifestEntry {
    id: String,
    packet: String,
    #[serde(default)]
    backlog: Option<String>,
    #[serde(default)]
    depends_on: Vec<String>,
    #[serde(default)]
    can_run_in_parallel_with: Vec<String>,
}

fn read_file(path: &Path) -> Result<String, ManifestError> {
    std::fs::read_to_string(path).map_err(|source| ManifestError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Load a manifest and parse every packet it references.
///
/// Relative packet and backlog paths are resolved against `repo_root`.
/// Fails closed on duplicate ids, missing packets, unknown dependency
/// references, dependency cycles, and (unless `allow_empty_allowed_files`
/// is set) packets whose `Allowed Files` section parsed empty.
pub fn load_manifest(
    repo_root: &Path,
    manifest_path: &Path,
    allow_empty_allowed_files: bool,
) -> Result<BTreeMap<String, TaskSpec>, ManifestError> {
    let raw = read_file(manifest_path)?;
    let doc: ManifestDoc =
        serde_json::from_str(&raw).map_err(|source| ManifestError::InvalidFormat {
            path: manifest_path.to_path_buf(),
            source,
        })?;

    let mut tasks: BTreeMap<String, TaskSpec> = BTreeMap::new();
    for entry in doc.tasks {
        let task_id = entry.id;
        if tasks.contains_key(&task_id) {
            return Err(ManifestError::DuplicateTask(task_id));
        }

        let packet_path = resolve(repo_root, &entry.packet);
        if !packet_path.exists() {
            return Err(ManifestError::PacketNotFound {
                task_id,
                path: packet_path,
            });
        }
        let packet_text = read_file(&packet_path)?;
        let allowed_files = crate::packet::parse_allowed_files(&packet_text);
        if allowed_files.is_empty() && !allow_empty_allowed_files {
            return Err(ManifestError::EmptyAllowedFiles(task_id));
        }
        let validation_commands = crate::packet::parse_validation_commands(&packet_text);

        let spec = TaskSpec {
            task_id: task_id.clone(),
            packet_path,
            backlog_path: entry.backlog.as_deref().map(|b| resolve(repo_root, b)),
            depends_on: entry.depends_on,
            can_run_in_parallel_with: entry.can_run_in_parallel_with,
            allowed_files,
            validation_commands,
        };
        tasks.insert(task_id, spec);
    }

    for task in tasks.values() {
        let missing: Vec<&str> = task
            .depends_on
            .iter()
            .filter(|dep| !tasks.contains_key(*dep))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(ManifestError::UnknownDependency {
                task_id: task.task_id.clone(),
                missing: missing.join(", "),
            });
        }
    }

    check_acyclic(&tasks)?;

    Ok(tasks)
}

fn resolve(repo_root: &Path, rel: &str) -> PathBuf {
    let path = Path::new(rel);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        repo_root.join(path)
    }
}

/// Verify the dependency graph is a DAG via iterative depth-first search.
fn check_acyclic(tasks: &BTreeMap<String, TaskSpec>) -> Result<(), ManifestError> {
    let mut done: BTreeSet<&str> = BTreeSet::new();
    let mut on_path: BTreeSet<&str> = BTreeSet::new();

    for root in tasks.keys() {
        if done.contains(root.as_str()) {
            continue;
        }
        // Stack of (task_id, next dependency index to visit).
        let mut stack: Vec<(&str, usize)> = vec![(root.as_str(), 0)];
        on_path.insert(root.as_str());
        while let Some((id, next)) = stack.pop() {
            let deps = &tasks[id].depends_on;
            if next < deps.len() {
                stack.push((id, next + 1));
                let dep = deps[next].as_str();
                if on_path.contains(dep) {
                    return Err(ManifestError::DependencyCycle(dep.to_string()));
                }
                if !done.contains(dep) {
                    on_path.insert(dep);
                    stack.push((dep, 0));
                }
            } else {
                on_path.remove(id);
                done.insert(id);
            }
        }
    }
    Ok(())
}
