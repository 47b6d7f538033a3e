//! Shared data model for the Swival agent runtime.
//!
//! Everything the other crates exchange lives here: conversation messages,
//! tool call/result shapes, tool specs, the abstract LLM completion contract,
//! error kinds, and the token estimation heuristic. No I/O happens in this
//! crate.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub type Result<T> = anyhow::Result<T>;

/// Scratch directory kept inside the base directory.
pub fn runtime_dir(base: &Path) -> PathBuf {
    base.join(".swival")
}

// ── Messages ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// How far compaction has already touched a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompactionState {
    Raw,
    Shrunk,
    SummaryPlaceholder,
}

/// A tool call as emitted by the model. `arguments` is the raw JSON string;
/// parsing happens at dispatch time so invalid JSON can be reported back to
/// the model instead of failing the turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// One entry of the conversation. Mutated only by the context manager
/// (content replacement on compaction); never re-ordered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Tool name on tool-result messages, used by head-preserving summarizers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    /// Turn index this message belongs to. The system prompt is turn 0.
    pub turn: u32,
    pub compaction: CompactionState,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            tool_name: None,
            turn: 0,
            compaction: CompactionState::Raw,
        }
    }

    pub fn user(content: impl Into<String>, turn: u32) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            tool_name: None,
            turn,
            compaction: CompactionState::Raw,
        }
    }

    pub fn assistant(
        content: impl Into<String>,
        tool_calls: Vec<ToolCallRequest>,
        turn: u32,
    ) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls,
            tool_call_id: None,
            tool_name: None,
            turn,
            compaction: CompactionState::Raw,
        }
    }

    pub fn tool_result(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
        turn: u32,
    ) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.into()),
            tool_name: Some(tool_name.into()),
            turn,
            compaction: CompactionState::Raw,
        }
    }

    /// Synthetic recap message standing in for a collapsed span.
    pub fn recap(content: impl Into<String>, turn: u32) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            tool_name: None,
            turn,
            compaction: CompactionState::SummaryPlaceholder,
        }
    }
}

// ── Knowledge-channel records ───────────────────────────────────────────

/// Proactive summary of a batch of completed turns. Consolidated by
/// pairwise merge once the channel grows past its token budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointSummary {
    pub turn_range: (u32, u32),
    pub text: String,
}

/// Immutable recap of a collapsed snapshot scope. Rendered into every
/// subsequent system prompt, so it survives all compaction levels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRecap {
    pub label: String,
    pub summary: String,
    pub turn_range: (u32, u32),
}

// ── Tool specs ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "server")]
pub enum ToolOrigin {
    Builtin,
    Mcp(String),
}

/// Contract of one callable tool: qualified name plus its JSON schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub schema: serde_json::Value,
    pub origin: ToolOrigin,
}

/// Qualified name for an MCP-backed tool.
pub fn mcp_tool_name(server: &str, tool: &str) -> String {
    format!("mcp__{server}__{tool}")
}

/// Split a qualified MCP tool name back into (server, tool).
pub fn split_mcp_tool_name(name: &str) -> Option<(&str, &str)> {
    let rest = name.strip_prefix("mcp__")?;
    let sep = rest.find("__")?;
    Some((&rest[..sep], &rest[sep + 2..]))
}

// ── Tool errors ─────────────────────────────────────────────────────────

/// Stable error kinds surfaced to the model and the report. The `as_str`
/// names are part of the report contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ToolErrorKind {
    PathEscape,
    RootForbidden,
    ReadOnlyViolation,
    UnreadTarget,
    CommandNotAllowed,
    SchemeNotAllowed,
    PrivateAddress,
    RedirectLimit,
    BinaryContent,
    InvalidToolArguments,
    McpDegraded,
    McpTimeout,
    UnknownTool,
    Failed,
}

impl ToolErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolErrorKind::PathEscape => "PathEscape",
            ToolErrorKind::RootForbidden => "RootForbidden",
            ToolErrorKind::ReadOnlyViolation => "ReadOnlyViolation",
            ToolErrorKind::UnreadTarget => "UnreadTarget",
            ToolErrorKind::CommandNotAllowed => "CommandNotAllowed",
            ToolErrorKind::SchemeNotAllowed => "SchemeNotAllowed",
            ToolErrorKind::PrivateAddress => "PrivateAddress",
            ToolErrorKind::RedirectLimit => "RedirectLimit",
            ToolErrorKind::BinaryContent => "BinaryContent",
            ToolErrorKind::InvalidToolArguments => "InvalidToolArguments",
            ToolErrorKind::McpDegraded => "McpDegraded",
            ToolErrorKind::McpTimeout => "McpTimeout",
            ToolErrorKind::UnknownTool => "UnknownTool",
            ToolErrorKind::Failed => "Failed",
        }
    }
}

/// A tool failure carried back into the model's view as a value, never
/// raised past the loop boundary.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{}: {message}", .kind.as_str())]
pub struct ToolError {
    pub kind: ToolErrorKind,
    pub message: String,
}

impl ToolError {
    pub fn new(kind: ToolErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::Failed, message)
    }
}

impl From<std::io::Error> for ToolError {
    fn from(err: std::io::Error) -> Self {
        ToolError::failed(err.to_string())
    }
}

// ── LLM completion contract ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SamplingParams {
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub seed: Option<u64>,
}

/// Abstract completion request. The wire format of any particular provider
/// is the client's concern.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSpec>,
    pub max_tokens: u32,
    pub sampling: SamplingParams,
}

#[derive(Debug, Clone, Default)]
pub struct LlmResponse {
    pub text: String,
    pub finish_reason: String,
    pub tool_calls: Vec<ToolCallRequest>,
}

/// Completion failure. Context overflow is first-class so the loop can route
/// it into compaction instead of propagating it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LlmError {
    #[error("context overflow: {0}")]
    ContextOverflow(String),
    #[error("provider error: {0}")]
    Provider(String),
    #[error("cancelled: {0}")]
    Cancelled(String),
}

// ── Token estimation ────────────────────────────────────────────────────

/// Per-message framing overhead in tokens (role tags, separators).
pub const MESSAGE_OVERHEAD_TOKENS: usize = 8;

/// Deterministic heuristic: ~4 chars per token. Stable within a run.
pub fn estimate_tokens(text: &str) -> usize {
    text.len() / 4
}

pub fn estimate_message_tokens(msg: &Message) -> usize {
    let mut total = MESSAGE_OVERHEAD_TOKENS + estimate_tokens(&msg.content);
    for call in &msg.tool_calls {
        total += MESSAGE_OVERHEAD_TOKENS
            + estimate_tokens(&call.name)
            + estimate_tokens(&call.arguments);
    }
    total
}

pub fn estimate_conversation_tokens(messages: &[Message]) -> usize {
    messages.iter().map(estimate_message_tokens).sum()
}

// ── Canonical JSON ──────────────────────────────────────────────────────

/// Serialize a JSON value with object keys sorted at every level. Used to
/// key guardrail tracking so argument order does not defeat detection.
pub fn canonical_json(value: &serde_json::Value) -> String {
    fn sort(value: &serde_json::Value) -> serde_json::Value {
        match value {
            serde_json::Value::Object(map) => {
                let sorted: std::collections::BTreeMap<_, _> =
                    map.iter().map(|(k, v)| (k.clone(), sort(v))).collect();
                serde_json::to_value(sorted).unwrap_or(serde_json::Value::Null)
            }
            serde_json::Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(sort).collect())
            }
            other => other.clone(),
        }
    }
    sort(value).to_string()
}

/// Truncate on a char boundary, appending an ellipsis marker when cut.
pub fn truncate_chars(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &text[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn mcp_name_round_trip() {
        let name = mcp_tool_name("files", "read");
        assert_eq!(name, "mcp__files__read");
        assert_eq!(split_mcp_tool_name(&name), Some(("files", "read")));
        assert_eq!(split_mcp_tool_name("read_file"), None);
    }

    #[test]
    fn tool_error_displays_kind_name() {
        let err = ToolError::new(ToolErrorKind::UnreadTarget, "read it first");
        assert_eq!(err.to_string(), "UnreadTarget: read it first");
    }

    #[test]
    fn canonical_json_sorts_keys() {
        let a = json!({"b": 1, "a": {"d": 2, "c": 3}});
        let b = json!({"a": {"c": 3, "d": 2}, "b": 1});
        assert_eq!(canonical_json(&a), canonical_json(&b));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let text = "héllo wörld";
        let cut = truncate_chars(text, 2);
        assert!(cut.ends_with('…'));
        assert!(cut.len() <= 2 + '…'.len_utf8());
    }

    proptest! {
        #[test]
        fn estimation_is_monotone_in_length(base in "[a-z ]{0,200}", extra in "[a-z ]{1,50}") {
            let longer = format!("{base}{extra}");
            prop_assert!(estimate_tokens(&longer) >= estimate_tokens(&base));
        }

        #[test]
        fn canonical_json_is_stable(
            keys in prop::collection::btree_map("[a-z]{1,6}", any::<i64>(), 0..8)
        ) {
            let value = serde_json::to_value(&keys).unwrap();
            prop_assert_eq!(canonical_json(&value), canonical_json(&value));
        }
    }
}
