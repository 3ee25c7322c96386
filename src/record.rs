//! Transcript record decoding
//!
//! Each line of a transcript is one JSON object. Only the four record kinds
//! the activity engine reacts to are decoded, and only the fields it reads.
//! Everything else is a [`ParseError`] the caller skips.

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

/// Why a line could not be turned into a [`Record`]
#[derive(Error, Debug)]
pub enum ParseError {
    /// Invalid JSON, a partial write, or a known record with an unexpected shape
    #[error("malformed record: {0}")]
    Malformed(#[from] serde_json::Error),
    /// Well-formed record of a kind the engine ignores
    #[error("unsupported record type")]
    UnsupportedType,
}

/// One decoded transcript record
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Assistant(AssistantRecord),
    User(UserRecord),
    System(SystemRecord),
    Progress(ProgressRecord),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AssistantRecord {
    pub message: BlockMessage,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UserRecord {
    pub message: UserMessage,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SystemRecord {
    #[serde(default)]
    pub subtype: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProgressRecord {
    #[serde(rename = "parentToolUseID")]
    pub parent_tool_use_id: String,
    pub data: ProgressData,
}

/// A message whose content is always a block list
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BlockMessage {
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UserMessage {
    pub content: UserContent,
}

/// User content is either a prompt string or a block list
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum UserContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    ToolUse {
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        input: Value,
    },
    Text {
        #[serde(default)]
        text: String,
    },
    ToolResult {
        #[serde(default)]
        tool_use_id: Option<String>,
    },
    /// thinking, image, and anything newer
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProgressData {
    #[serde(rename = "type", default)]
    pub kind: Option<ProgressKind>,
    #[serde(default)]
    pub message: Option<NestedMessage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressKind {
    BashProgress,
    McpProgress,
    AgentProgress,
    #[serde(other)]
    Other,
}

/// Message relayed from a subagent inside a progress record
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NestedMessage {
    Assistant { message: BlockMessage },
    User { message: UserMessage },
    #[serde(other)]
    Other,
}

/// Envelope used to route on `type` before decoding the body.
#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Envelope {
    Assistant(AssistantRecord),
    User(UserRecord),
    System(SystemRecord),
    Progress(ProgressRecord),
    #[serde(other)]
    Unsupported,
}

/// Decode one transcript line.
pub fn parse(line: &str) -> Result<Record, ParseError> {
    let record = match serde_json::from_str::<Envelope>(line)? {
        Envelope::Assistant(r) => Record::Assistant(r),
        Envelope::User(r) => Record::User(r),
        Envelope::System(r) => Record::System(r),
        Envelope::Progress(r) => Record::Progress(r),
        Envelope::Unsupported => return Err(ParseError::UnsupportedType),
    };
    Ok(record)
}

impl SystemRecord {
    /// `turn_duration` is written once per completed turn.
    pub fn ends_turn(&self) -> bool {
        self.subtype.as_deref() == Some("turn_duration")
    }
}

impl ProgressData {
    /// Shell or MCP output streaming from an already running tool.
    pub fn is_execution_step(&self) -> bool {
        matches!(
            self.kind,
            Some(ProgressKind::BashProgress | ProgressKind::McpProgress)
        )
    }
}

impl ContentBlock {
    /// `(id, name, input)` for a tool-use block with a non-empty id.
    pub fn as_tool_use(&self) -> Option<(&str, &str, &Value)> {
        match self {
            Self::ToolUse { id, name, input } => {
                let id = id.as_deref().filter(|id| !id.is_empty())?;
                Some((id, name.as_deref().unwrap_or(""), input))
            }
            _ => None,
        }
    }

    /// Id of the tool a result block completes.
    pub fn as_tool_result(&self) -> Option<&str> {
        match self {
            Self::ToolResult { tool_use_id } => tool_use_id.as_deref(),
            _ => None,
        }
    }
}

impl UserContent {
    /// Tool-result ids carried by this content (empty for a prompt string).
    pub fn tool_results(&self) -> Vec<&str> {
        match self {
            Self::Text(_) => Vec::new(),
            Self::Blocks(blocks) => blocks.iter().filter_map(ContentBlock::as_tool_result).collect(),
        }
    }

    fn has_tool_result(&self) -> bool {
        match self {
            Self::Text(_) => false,
            Self::Blocks(blocks) => blocks
                .iter()
                .any(|b| matches!(b, ContentBlock::ToolResult { .. })),
        }
    }

    /// True when this content starts a new human turn.
    ///
    /// A non-blank prompt string, or a block list without any tool result.
    pub fn is_new_prompt(&self) -> bool {
        match self {
            Self::Text(text) => !text.trim().is_empty(),
            Self::Blocks(_) => !self.has_tool_result(),
        }
    }
}

impl BlockMessage {
    pub fn has_tool_use(&self) -> bool {
        self.content
            .iter()
            .any(|b| matches!(b, ContentBlock::ToolUse { .. }))
    }

    pub fn has_text(&self) -> bool {
        self.content
            .iter()
            .any(|b| matches!(b, ContentBlock::Text { .. }))
    }

    pub fn tool_uses(&self) -> impl Iterator<Item = (&str, &str, &Value)> {
        self.content.iter().filter_map(ContentBlock::as_tool_use)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse_value(value: Value) -> Result<Record, ParseError> {
        parse(&serde_json::to_string(&value).unwrap())
    }

    // ==================== assistant ====================

    #[test]
    fn assistant_tool_use() {
        let record = parse_value(json!({
            "type": "assistant",
            "uuid": "abc",
            "message": {
                "role": "assistant",
                "content": [
                    {"type": "thinking", "thinking": "hmm"},
                    {"type": "tool_use", "id": "t1", "name": "Bash", "input": {"command": "ls -la /tmp"}}
                ]
            }
        }))
        .unwrap();

        let Record::Assistant(a) = record else {
            panic!("expected assistant record");
        };
        assert!(a.message.has_tool_use());
        assert!(!a.message.has_text());
        let uses: Vec<_> = a.message.tool_uses().collect();
        assert_eq!(uses.len(), 1);
        assert_eq!(uses[0].0, "t1");
        assert_eq!(uses[0].1, "Bash");
        assert_eq!(uses[0].2["command"], "ls -la /tmp");
    }

    #[test]
    fn assistant_tool_use_without_id_is_not_listed() {
        let record = parse_value(json!({
            "type": "assistant",
            "message": {"content": [{"type": "tool_use", "name": "Read"}, {"type": "tool_use", "id": "", "name": "Read"}]}
        }))
        .unwrap();
        let Record::Assistant(a) = record else {
            panic!("expected assistant record");
        };
        assert!(a.message.has_tool_use());
        assert_eq!(a.message.tool_uses().count(), 0);
    }

    #[test]
    fn assistant_text_only() {
        let record = parse_value(json!({
            "type": "assistant",
            "message": {"content": [{"type": "text", "text": "Done."}]}
        }))
        .unwrap();
        let Record::Assistant(a) = record else {
            panic!("expected assistant record");
        };
        assert!(a.message.has_text());
        assert!(!a.message.has_tool_use());
    }

    // ==================== user ====================

    #[test]
    fn user_prompt_string() {
        let record = parse_value(json!({
            "type": "user",
            "message": {"role": "user", "content": "fix the login bug"}
        }))
        .unwrap();
        let Record::User(u) = record else {
            panic!("expected user record");
        };
        assert!(u.message.content.is_new_prompt());
        assert!(u.message.content.tool_results().is_empty());
    }

    #[test]
    fn user_blank_string_is_not_a_prompt() {
        let record = parse_value(json!({"type": "user", "message": {"content": "   "}})).unwrap();
        let Record::User(u) = record else {
            panic!("expected user record");
        };
        assert!(!u.message.content.is_new_prompt());
    }

    #[test]
    fn user_tool_results() {
        let record = parse_value(json!({
            "type": "user",
            "message": {"content": [
                {"type": "tool_result", "tool_use_id": "t1", "content": "ok"},
                {"type": "tool_result", "tool_use_id": "t2", "is_error": true}
            ]}
        }))
        .unwrap();
        let Record::User(u) = record else {
            panic!("expected user record");
        };
        assert!(!u.message.content.is_new_prompt());
        assert_eq!(u.message.content.tool_results(), vec!["t1", "t2"]);
    }

    #[test]
    fn user_text_blocks_are_a_prompt() {
        let record = parse_value(json!({
            "type": "user",
            "message": {"content": [{"type": "text", "text": "hello"}]}
        }))
        .unwrap();
        let Record::User(u) = record else {
            panic!("expected user record");
        };
        assert!(u.message.content.is_new_prompt());
    }

    // ==================== system / progress ====================

    #[test]
    fn system_turn_duration() {
        let record = parse_value(json!({"type": "system", "subtype": "turn_duration", "durationMs": 1200})).unwrap();
        let Record::System(s) = record else {
            panic!("expected system record");
        };
        assert!(s.ends_turn());

        let record = parse_value(json!({"type": "system", "subtype": "compact_boundary"})).unwrap();
        let Record::System(s) = record else {
            panic!("expected system record");
        };
        assert!(!s.ends_turn());
    }

    #[test]
    fn progress_bash() {
        let record = parse_value(json!({
            "type": "progress",
            "parentToolUseID": "t1",
            "data": {"type": "bash_progress", "output": "..."}
        }))
        .unwrap();
        let Record::Progress(p) = record else {
            panic!("expected progress record");
        };
        assert_eq!(p.parent_tool_use_id, "t1");
        assert!(p.data.is_execution_step());
        assert!(p.data.message.is_none());
    }

    #[test]
    fn progress_nested_assistant() {
        let record = parse_value(json!({
            "type": "progress",
            "parentToolUseID": "task_1",
            "data": {
                "type": "agent_progress",
                "message": {
                    "type": "assistant",
                    "message": {"content": [{"type": "tool_use", "id": "sub_1", "name": "Read", "input": {"file_path": "/a/b.rs"}}]}
                }
            }
        }))
        .unwrap();
        let Record::Progress(p) = record else {
            panic!("expected progress record");
        };
        assert!(!p.data.is_execution_step());
        match p.data.message {
            Some(NestedMessage::Assistant { message }) => {
                assert_eq!(message.tool_uses().count(), 1);
            }
            other => panic!("unexpected nested message: {other:?}"),
        }
    }

    #[test]
    fn progress_unknown_kind_still_decodes() {
        let record = parse_value(json!({
            "type": "progress",
            "parentToolUseID": "t1",
            "data": {"type": "hook_progress", "hookEvent": "PostToolUse"}
        }))
        .unwrap();
        let Record::Progress(p) = record else {
            panic!("expected progress record");
        };
        assert_eq!(p.data.kind, Some(ProgressKind::Other));
    }

    // ==================== errors ====================

    #[test]
    fn unknown_type_is_unsupported() {
        let err = parse(r#"{"type":"summary","summary":"x"}"#).unwrap_err();
        assert!(matches!(err, ParseError::UnsupportedType));
    }

    #[test]
    fn partial_line_is_malformed() {
        let err = parse(r#"{"type":"assistant","message":{"con"#).unwrap_err();
        assert!(matches!(err, ParseError::Malformed(_)));
    }

    #[test]
    fn missing_field_is_malformed() {
        let err = parse(r#"{"type":"assistant"}"#).unwrap_err();
        assert!(matches!(err, ParseError::Malformed(_)));
        let err = parse(r#"{"type":"progress","data":{}}"#).unwrap_err();
        assert!(matches!(err, ParseError::Malformed(_)));
        let err = parse(r#"{"message":{"content":[]}}"#).unwrap_err();
        assert!(matches!(err, ParseError::Malformed(_)));
    }
}
