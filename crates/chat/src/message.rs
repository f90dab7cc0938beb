//! Message records owned by the aggregator.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Role {
    User,
    Assistant,
    System,
    /// Exists for history fidelity; never surfaced to presentation layers.
    ToolCall,
    /// Exists for history fidelity; never surfaced to presentation layers.
    ToolResult,
}

impl Role {
    /// Whether presentation layers should render this message at all.
    #[must_use]
    pub fn is_surfaced(self) -> bool {
        matches!(self, Self::User | Self::Assistant | Self::System)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageStatus {
    /// User message written locally, `chat.send` not yet acknowledged.
    Sending,
    /// User message acknowledged by the gateway.
    Sent,
    /// Assistant message with a live run behind it.
    Streaming,
    /// Terminal success.
    Complete,
    /// Terminal failure; `error` carries the reason.
    Error,
}

impl MessageStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Sent | Self::Complete | Self::Error)
    }
}

/// One chat message. Mutated in place by the aggregator while its run is
/// streaming; presentation layers read clones and never write back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub status: MessageStatus,
    #[serde(rename = "sessionKey")]
    pub session_key: String,
    #[serde(rename = "runId", skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Bumped on every content replacement so consumers can throttle
    /// redraw-driven work without diffing text.
    pub revision: u64,
}

impl ChatMessage {
    #[must_use]
    pub fn user(session_key: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role: Role::User,
            content: content.into(),
            status: MessageStatus::Sending,
            session_key: session_key.into(),
            run_id: None,
            model: None,
            error: None,
            revision: 0,
        }
    }

    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.status == MessageStatus::Streaming
    }
}
