//! Line protocol shared with the supervisor and log viewers.
//!
//! Two line formats go to stdout and to the append-only session log:
//!
//! ```text
//! [AGENT] Using tool: bash
//! [TRACE] {"type":"tool_start","timestamp":"2026-01-01T00:00:00Z","data":{...}}
//! ```
//!
//! Diagnostics that are not part of the protocol go through `tracing`,
//! which the binary routes to stderr.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;

/// Kinds of structured trace records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceKind {
    SessionStart,
    Thinking,
    Text,
    ToolStart,
    ToolEnd,
    FileEdit,
    Todo,
    ContextUsage,
    StopRequested,
    SessionError,
    SessionEnd,
}

#[derive(Serialize)]
struct TraceRecord<'a> {
    #[serde(rename = "type")]
    kind: TraceKind,
    timestamp: String,
    data: &'a Value,
}

/// Writes protocol lines to stdout and the session log file.
pub struct SessionLog {
    prefix: String,
    path: Option<PathBuf>,
    file: Mutex<Option<File>>,
}

impl SessionLog {
    /// Open the sink. A log file that cannot be opened degrades to stdout only.
    pub fn open(prefix: impl Into<String>, path: Option<&Path>) -> Self {
        let file = path.and_then(|path| match open_append(path) {
            Ok(file) => Some(file),
            Err(e) => {
                tracing::warn!("Session log {} unavailable: {}", path.display(), e);
                None
            }
        });

        Self {
            prefix: prefix.into(),
            path: path.map(Path::to_path_buf),
            file: Mutex::new(file),
        }
    }

    /// Stdout-only sink.
    pub fn stdout(prefix: impl Into<String>) -> Self {
        Self::open(prefix, None)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Write a human-readable `[PREFIX] message` line.
    pub fn info(&self, message: impl AsRef<str>) {
        let line = format!("[{}] {}", self.prefix, message.as_ref());
        self.write_line(&line);
    }

    /// Write a `[TRACE] {json}` record.
    pub fn trace(&self, kind: TraceKind, data: Value) {
        let record = TraceRecord {
            kind,
            timestamp: Utc::now().to_rfc3339(),
            data: &data,
        };
        match serde_json::to_string(&record) {
            Ok(json) => self.write_line(&format!("[TRACE] {}", json)),
            Err(e) => tracing::warn!("Failed to serialize trace record: {}", e),
        }
    }

    fn write_line(&self, line: &str) {
        println!("{}", line);

        let mut guard = self
            .file
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(file) = guard.as_mut() {
            if let Err(e) = writeln!(file, "{}", line) {
                tracing::warn!("Session log write failed, continuing on stdout: {}", e);
                *guard = None;
            }
        }
    }
}

fn open_append(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// First line of `text`, cut to `max` characters with a trailing `...`.
pub fn first_line(text: &str, max: usize) -> String {
    let line = text.trim().lines().next().unwrap_or_default();
    truncate(line, max)
}

/// Cut `text` to `max` characters with a trailing `...`.
pub fn truncate(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_lines_are_appended_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("session.log");

        let log = SessionLog::open("AGENT", Some(&path));
        log.info("Starting");
        log.trace(TraceKind::ToolStart, json!({ "tool": "bash" }));

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "[AGENT] Starting");
        assert!(lines[1].starts_with("[TRACE] "));

        let record: Value = serde_json::from_str(&lines[1]["[TRACE] ".len()..]).unwrap();
        assert_eq!(record["type"], "tool_start");
        assert_eq!(record["data"]["tool"], "bash");
        assert!(
            chrono::DateTime::parse_from_rfc3339(record["timestamp"].as_str().unwrap()).is_ok()
        );
    }

    #[test]
    fn test_existing_log_is_not_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.log");
        std::fs::write(&path, "[OTHER] earlier run\n").unwrap();

        SessionLog::open("AGENT", Some(&path)).info("later run");

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "[OTHER] earlier run\n[AGENT] later run\n");
    }

    #[test]
    fn test_unwritable_log_degrades_to_stdout() {
        let dir = tempfile::tempdir().unwrap();
        // A directory cannot be opened for appending.
        let log = SessionLog::open("AGENT", Some(dir.path()));
        log.info("still works");
        assert_eq!(log.path(), Some(dir.path()));
    }

    #[test]
    fn test_truncation() {
        assert_eq!(truncate("abcdef", 3), "abc...");
        assert_eq!(truncate("abc", 3), "abc");
        assert_eq!(truncate("héllo", 2), "hé...");
        assert_eq!(first_line("  first\nsecond", 10), "first");
        assert_eq!(first_line("", 10), "");
    }
}
