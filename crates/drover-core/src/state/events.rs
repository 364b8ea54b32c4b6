//! Structured event log: append-only JSONL plus a human-readable line on
//! stdout.
//!
//! Events are advisory. A failed append is logged and swallowed; losing
//! events never corrupts the state file.

use std::io::Write;
use std::path::PathBuf;

use serde_json::{Map, Value};

use super::now_iso;

/// Collapse whitespace and truncate to `max_chars`, ellipsizing.
pub fn compact_text(value: Option<&str>, max_chars: usize) -> String {
    let Some(value) = value else {
        return String::new();
    };
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= max_chars {
        return collapsed;
    }
    let head: String = collapsed.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{head}...")
}

/// Appends one JSON object per event to a `.jsonl` file.
#[derive(Debug, Clone)]
pub struct EventSink {
    path: PathBuf,
}

impl EventSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Record one event.
    ///
    /// `extra` must be a JSON object (or null); its fields are merged next
    /// to `time`, `event`, and `message`. Keys serialize sorted, so the log
    /// is byte-stable for identical inputs.
    pub fn emit(&self, event: &str, message: impl Into<String>, extra: Value) {
        let message = message.into();
        let time = now_iso();

        let mut payload = Map::new();
        payload.insert("time".to_string(), Value::String(time.clone()));
        payload.insert("event".to_string(), Value::String(event.to_string()));
        payload.insert("message".to_string(), Value::String(message.clone()));
        if let Value::Object(fields) = extra {
            for (key, value) in fields {
                payload.insert(key, value);
            }
        }

        let line = Value::Object(payload).to_string();
        if let Err(error) = self.append_line(&line) {
            tracing::warn!(path = %self.path.display(), %error, "failed to append event");
        }

        println!("[{time}] {event}: {message}");
    }

    fn append_line(&self, line: &str) -> std::io::Result<()> {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{line}")
    }
}
