//! One line of a node's JSONL log

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single JSONL record.
///
/// Lines are self-contained, so several nodes can log into one directory
/// and a reader can merge them by `ts`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    /// RFC 3339 timestamp with millisecond precision, UTC
    pub ts: String,
    pub level: String,
    /// Name of the node that wrote the line
    pub node: String,
    pub target: String,
    pub msg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Value>,
    /// Enclosing spans, root first, joined with " > "
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span: Option<String>,
}

impl LogLine {
    pub fn now(
        level: impl Into<String>,
        node: impl Into<String>,
        target: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self {
            ts: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            level: level.into(),
            node: node.into(),
            target: target.into(),
            msg: msg.into(),
            fields: None,
            span: None,
        }
    }

    /// Field value by name, if the event recorded one
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.as_ref().and_then(|f| f.get(name))
    }
}

/// Read every line of one JSONL file. Unparseable lines are skipped.
pub fn read_entries(path: impl AsRef<Path>) -> std::io::Result<Vec<LogLine>> {
    let content = fs::read_to_string(path)?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect())
}

/// Read every `.jsonl` file in `dir`, merged by timestamp
pub fn read_dir_entries(dir: impl AsRef<Path>) -> std::io::Result<Vec<LogLine>> {
    let dir = dir.as_ref();
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut lines = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().is_some_and(|e| e == "jsonl") {
            lines.extend(read_entries(&path)?);
        }
    }
    lines.sort_by(|a, b| a.ts.cmp(&b.ts));
    Ok(lines)
}
