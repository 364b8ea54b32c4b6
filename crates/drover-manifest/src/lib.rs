//! Manifest and packet parsing for drover.
//!
//! A manifest is a JSON document listing task entries; each entry points at
//! a packet (a markdown work order) that contributes the task's allowed
//! file set and validation commands. Loading produces the immutable
//! [`TaskSpec`] set the scheduler works from.

mod manifest;
mod packet;

use std::collections::BTreeSet;
use std::path::PathBuf;

use thiserror::Error;

pub use manifest::load_manifest;
pub use packet::{parse_allowed_files, parse_validation_commands};

/// Errors raised while loading a manifest and its packets.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid manifest format: {path}: {source}")]
    InvalidFormat {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("duplicate task id in manifest: {0}")]
    DuplicateTask(String),

    #[error("packet path not found for {task_id}: {path}")]
    PacketNotFound { task_id: String, path: PathBuf },

    #[error("task {task_id} depends on unknown tasks: {missing}")]
    UnknownDependency { task_id: String, missing: String },

    #[error("dependency cycle involving task {0}")]
    DependencyCycle(String),

    #[error(
        "packet {0} has no parsed 'Allowed Files'. \
         Failing closed; pass --allow-empty-allowed-files to override."
    )]
    EmptyAllowedFiles(String),
}

/// One task as declared by the manifest, immutable after load.
///
/// `depends_on` is the only ordering input the scheduler honors;
/// `can_run_in_parallel_with` is advisory and carried for operators only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSpec {
    /// Unique manifest id, e.g. `W101`.
    pub task_id: String,
    /// Absolute path to the packet markdown document.
    pub packet_path: PathBuf,
    /// Optional backlog document referenced by the packet.
    pub backlog_path: Option<PathBuf>,
    /// Ids of tasks that must complete before this one may launch.
    pub depends_on: Vec<String>,
    /// Advisory co-scheduling hints; not enforced.
    pub can_run_in_parallel_with: Vec<String>,
    /// Repository-relative paths the worker may touch.
    pub allowed_files: BTreeSet<String>,
    /// Shell commands run in order to accept the task's work.
    pub validation_commands: Vec<String>,
}
