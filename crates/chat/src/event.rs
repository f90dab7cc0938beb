//! Chat event payload decoding.
//!
//! Payloads are missing-field-heavy and occasionally carry malformed
//! content blocks; decoding is lenient per block (skip-and-continue) so one
//! bad element never drops a whole streaming update.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle stage of one chat event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatEventState {
    Delta,
    Final,
    Aborted,
    Error,
}

impl ChatEventState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Delta)
    }
}

/// One typed content block within a chat message payload.
///
/// Only `text` blocks are surfaced to the visible message; the rest are
/// retained on the in-flight run for inspection tooling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "thinking")]
    Thinking { text: String },
    #[serde(rename = "toolCall")]
    ToolCall {
        id: Option<String>,
        name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        arguments: Option<Value>,
    },
    #[serde(rename = "toolResult")]
    ToolResult {
        id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        output: Option<Value>,
    },
}

/// One decoded `chat` event.
#[derive(Debug, Clone)]
pub struct ChatEventPayload {
    pub run_id: String,
    pub session_key: String,
    pub state: ChatEventState,
    pub blocks: Vec<ContentBlock>,
    pub model: Option<String>,
    /// Chat-stream error text. Deliberately a plain string, distinct from
    /// the structured `ErrorShape` on request/response frames.
    pub error_message: Option<String>,
}

impl ChatEventPayload {
    /// Decode a raw `chat` event payload. Returns `None` when the payload
    /// is unusable (missing run/session identity or state).
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        let run_id = value.get("runId")?.as_str()?.to_string();
        let session_key = value.get("sessionKey")?.as_str()?.to_string();
        let state: ChatEventState =
            serde_json::from_value(value.get("state")?.clone()).ok()?;

        let message = value.get("message");
        let blocks = message
            .and_then(|m| m.get("content"))
            .map(decode_blocks)
            .unwrap_or_default();
        let model = message
            .and_then(|m| m.get("model"))
            .and_then(Value::as_str)
            .map(String::from);
        let error_message = value
            .get("errorMessage")
            .and_then(Value::as_str)
            .map(String::from);

        Some(Self {
            run_id,
            session_key,
            state,
            blocks,
            model,
            error_message,
        })
    }

    /// Visible text: `text` blocks joined with a blank line. `thinking`,
    /// `toolCall`, and `toolResult` blocks are intentionally omitted.
    #[must_use]
    pub fn visible_text(&self) -> String {
        visible_text(&self.blocks)
    }
}

/// Decode a content value: an ordered block list, or a bare string treated
/// as one implicit text block. Malformed array elements are skipped.
#[must_use]
pub fn decode_blocks(content: &Value) -> Vec<ContentBlock> {
    match content {
        Value::String(text) => vec![ContentBlock::Text { text: text.clone() }],
        Value::Array(items) => items
            .iter()
            .filter_map(|item| serde_json::from_value(item.clone()).ok())
            .collect(),
        _ => Vec::new(),
    }
}

#[must_use]
pub fn visible_text(blocks: &[ContentBlock]) -> String {
    blocks
        .iter()
        .filter_map(|block| match block {
            ContentBlock::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}
