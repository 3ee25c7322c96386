//! Human-readable status strings for open tool invocations

use serde_json::Value;
use std::path::Path;
use unicode_width::UnicodeWidthChar;

/// Name of the tool that spawns a subagent.
pub const DELEGATION_TOOL: &str = "Task";

/// Truncation limits, in display columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayLimits {
    pub bash_command_max: usize,
    pub task_description_max: usize,
}

impl Default for DisplayLimits {
    fn default() -> Self {
        Self {
            bash_command_max: 30,
            task_description_max: 40,
        }
    }
}

/// Cut `s` to at most `max` display columns, appending `…` when anything was dropped.
pub fn truncate_display(s: &str, max: usize) -> String {
    let mut width = 0;
    for (idx, ch) in s.char_indices() {
        width += ch.width().unwrap_or(0);
        if width > max {
            return format!("{}\u{2026}", &s[..idx]);
        }
    }
    s.to_string()
}

/// Final path component of a string field, or empty when absent.
fn base_name(input: &Value, key: &str) -> String {
    input
        .get(key)
        .and_then(|v| v.as_str())
        .and_then(|p| Path::new(p).file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn str_field<'a>(input: &'a Value, key: &str) -> &'a str {
    input.get(key).and_then(|v| v.as_str()).unwrap_or("")
}

/// Format the status shown while `tool_name` runs with `input`.
pub fn format_tool_status(tool_name: &str, input: &Value, limits: &DisplayLimits) -> String {
    match tool_name {
        "Read" => format!("Reading {}", base_name(input, "file_path")),
        "Edit" => format!("Editing {}", base_name(input, "file_path")),
        "Write" => format!("Writing {}", base_name(input, "file_path")),
        "Bash" => {
            let cmd = str_field(input, "command");
            format!("Running: {}", truncate_display(cmd, limits.bash_command_max))
        }
        "Glob" => "Searching files".to_string(),
        "Grep" => "Searching code".to_string(),
        "WebFetch" => "Fetching web content".to_string(),
        "WebSearch" => "Searching the web".to_string(),
        DELEGATION_TOOL => {
            let desc = str_field(input, "description");
            if desc.is_empty() {
                "Running subtask".to_string()
            } else {
                format!(
                    "Subtask: {}",
                    truncate_display(desc, limits.task_description_max)
                )
            }
        }
        "AskUserQuestion" => "Waiting for your answer".to_string(),
        "EnterPlanMode" => "Planning".to_string(),
        "NotebookEdit" => "Editing notebook".to_string(),
        other => format!("Using {other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn status(name: &str, input: Value) -> String {
        format_tool_status(name, &input, &DisplayLimits::default())
    }

    #[test]
    fn file_tools_use_basename() {
        assert_eq!(
            status("Read", json!({"file_path": "/home/u/project/src/main.rs"})),
            "Reading main.rs"
        );
        assert_eq!(status("Edit", json!({"file_path": "lib.rs"})), "Editing lib.rs");
        assert_eq!(
            status("Write", json!({"file_path": "/tmp/out/notes.md"})),
            "Writing notes.md"
        );
    }

    #[test]
    fn file_tool_without_path() {
        assert_eq!(status("Read", json!({})), "Reading ");
        assert_eq!(status("Read", Value::Null), "Reading ");
    }

    #[test]
    fn bash_short_command() {
        assert_eq!(
            status("Bash", json!({"command": "ls -la /tmp"})),
            "Running: ls -la /tmp"
        );
    }

    #[test]
    fn bash_long_command_is_truncated() {
        let cmd = "cargo test --workspace --all-features -- --nocapture";
        let out = status("Bash", json!({ "command": cmd }));
        assert_eq!(out, format!("Running: {}\u{2026}", &cmd[..30]));
    }

    #[test]
    fn bash_exact_limit_is_kept() {
        let cmd = "a".repeat(30);
        assert_eq!(status("Bash", json!({ "command": cmd })), format!("Running: {cmd}"));
    }

    #[test]
    fn task_description() {
        assert_eq!(
            status("Task", json!({"description": "Explore the codebase"})),
            "Subtask: Explore the codebase"
        );
        assert_eq!(status("Task", json!({})), "Running subtask");

        let long = "Investigate every flaky integration test in the repository";
        let out = status("Task", json!({ "description": long }));
        assert!(out.starts_with("Subtask: Investigate"));
        assert!(out.ends_with('\u{2026}'));
    }

    #[test]
    fn fixed_phrases() {
        assert_eq!(status("Glob", json!({"pattern": "*.rs"})), "Searching files");
        assert_eq!(status("Grep", json!({"pattern": "fn"})), "Searching code");
        assert_eq!(status("WebFetch", json!({})), "Fetching web content");
        assert_eq!(status("WebSearch", json!({})), "Searching the web");
        assert_eq!(status("AskUserQuestion", json!({})), "Waiting for your answer");
        assert_eq!(status("EnterPlanMode", json!({})), "Planning");
        assert_eq!(status("NotebookEdit", json!({})), "Editing notebook");
        assert_eq!(status("mcp__github__create_pr", json!({})), "Using mcp__github__create_pr");
    }

    #[test]
    fn truncate_counts_wide_chars() {
        // Each CJK char is two columns wide.
        assert_eq!(truncate_display("日本語テキスト", 6), "日本語\u{2026}");
        assert_eq!(truncate_display("short", 10), "short");
        assert_eq!(truncate_display("", 3), "");
    }
}
