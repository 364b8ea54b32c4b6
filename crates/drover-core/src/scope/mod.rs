//! Scope gate: is a set of changed paths contained in a task's allowed
//! set?

use std::collections::BTreeSet;

/// Returns `true` iff every changed path is a member of `allowed`.
///
/// An empty allowed set disables containment entirely; the manifest loader
/// rejects empty sets unless the operator opted in with
/// `--allow-empty-allowed-files`, so reaching here with an empty set means
/// the escape hatch is active.
pub fn within_allowed_files(changed_files: &[String], allowed_files: &BTreeSet<String>) -> bool {
    if allowed_files.is_empty() {
        return true;
    }
    changed_files.iter().all(|path| allowed_files.contains(path))
}

/// The changed paths outside the allowed set, in input order.
pub fn disallowed_files(changed_files: &[String], allowed_files: &BTreeSet<String>) -> Vec<String> {
    changed_files
        .iter()
        .filter(|path| !allowed_files.contains(*path))
        .cloned()
        .collect()
}
