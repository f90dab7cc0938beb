//! Typed call surface over one gateway connection.
//!
//! Thin wrappers around `GatewayConnection::call` for the methods this
//! client consumes. Where the protocol fixes a shape the wrapper types it;
//! where schemas vary (config payloads, history), callers get the raw
//! value.

use serde_json::{Value, json};

use tether_protocol::{AgentSummary, SessionSummary, methods};

use crate::{connection::GatewayConnection, error::ClientError};

#[derive(Clone)]
pub struct GatewayClient {
    conn: GatewayConnection,
}

impl GatewayClient {
    #[must_use]
    pub fn new(conn: GatewayConnection) -> Self {
        Self { conn }
    }

    #[must_use]
    pub fn connection(&self) -> &GatewayConnection {
        &self.conn
    }

    // ── Chat ─────────────────────────────────────────────────────────

    /// Send a user message. The message is recorded locally in `Sending`
    /// state before the call goes out and settled to `Sent`/`Error` from
    /// the response, so presentation layers can render optimistically.
    pub async fn send_chat(&self, session_key: &str, text: &str) -> Result<(), ClientError> {
        let chat = self.conn.chat();
        let message_id = chat.append_user(session_key, text);
        let params = json!({ "sessionKey": session_key, "text": text });
        match self.conn.call(methods::CHAT_SEND, Some(params)).await {
            Ok(_) => {
                chat.mark_user_sent(session_key, &message_id);
                Ok(())
            },
            Err(err) => {
                chat.mark_user_failed(session_key, &message_id, &err.to_string());
                Err(err)
            },
        }
    }

    /// Server-side history for a session; schema varies per gateway
    /// version, so the payload is returned as-is.
    pub async fn chat_history(&self, session_key: &str) -> Result<Option<Value>, ClientError> {
        self.conn
            .call(
                methods::CHAT_HISTORY,
                Some(json!({ "sessionKey": session_key })),
            )
            .await
    }

    /// Abort an in-flight run. The aggregator settles the message when the
    /// gateway emits the terminal `aborted` chat event.
    pub async fn abort_chat(&self, session_key: &str, run_id: &str) -> Result<(), ClientError> {
        self.conn
            .call(
                methods::CHAT_ABORT,
                Some(json!({ "sessionKey": session_key, "runId": run_id })),
            )
            .await
            .map(|_| ())
    }

    // ── Sessions ─────────────────────────────────────────────────────

    /// List sessions; the result also refreshes the local session store.
    pub async fn list_sessions(&self) -> Result<Vec<SessionSummary>, ClientError> {
        let payload = self.conn.call(methods::SESSIONS_LIST, None).await?;
        let sessions: Vec<SessionSummary> = payload
            .as_ref()
            .and_then(|p| p.get("sessions"))
            .and_then(|list| serde_json::from_value(list.clone()).ok())
            .unwrap_or_default();
        self.conn.chat().seed_sessions(&sessions);
        Ok(sessions)
    }

    pub async fn patch_session(
        &self,
        session_key: &str,
        label: Option<&str>,
    ) -> Result<Option<Value>, ClientError> {
        let mut params = json!({ "key": session_key });
        if let Some(label) = label {
            params["label"] = json!(label);
        }
        self.conn.call(methods::SESSIONS_PATCH, Some(params)).await
    }

    pub async fn delete_session(&self, session_key: &str) -> Result<(), ClientError> {
        self.conn
            .call(methods::SESSIONS_DELETE, Some(json!({ "key": session_key })))
            .await
            .map(|_| ())
    }

    // ── Agents ───────────────────────────────────────────────────────

    /// List agents; the result also refreshes the connection's agent set.
    pub async fn list_agents(&self) -> Result<Vec<AgentSummary>, ClientError> {
        let payload = self.conn.call(methods::AGENTS_LIST, None).await?;
        let agents: Vec<AgentSummary> = payload
            .as_ref()
            .and_then(|p| p.get("agents"))
            .and_then(|list| serde_json::from_value(list.clone()).ok())
            .unwrap_or_default();
        self.conn.set_agents(agents.clone());
        Ok(agents)
    }

    pub async fn agent_identity(&self, agent_id: &str) -> Result<Option<Value>, ClientError> {
        self.conn
            .call(methods::AGENT_IDENTITY, Some(json!({ "agentId": agent_id })))
            .await
    }

    // ── Config ───────────────────────────────────────────────────────

    pub async fn config_get(&self) -> Result<Option<Value>, ClientError> {
        self.conn.call(methods::CONFIG_GET, None).await
    }

    pub async fn config_schema(&self) -> Result<Option<Value>, ClientError> {
        self.conn.call(methods::CONFIG_SCHEMA, None).await
    }

    pub async fn config_patch(&self, patch: Value) -> Result<Option<Value>, ClientError> {
        self.conn
            .call(methods::CONFIG_PATCH, Some(json!({ "patch": patch })))
            .await
    }
}
