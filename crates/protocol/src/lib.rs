//! Gateway WebSocket/RPC protocol definitions, client side.
//!
//! All communication uses JSON frames over a persistent duplex channel.
//!
//! Frame types:
//! - `req`   — client → gateway RPC call
//! - `res`   — gateway → client RPC result
//! - `event` — gateway → client server-push
//!
//! The handshake is challenge/response: the gateway pushes a
//! `connect.challenge` event carrying a nonce, the client answers with a
//! `connect` request, and the gateway resolves it with a hello payload
//! containing server info, negotiated features, an initial state snapshot,
//! and policy limits.

use serde::{Deserialize, Serialize};

pub mod codec;

pub use codec::{DecodeError, decode_frame, encode_frame};

// ── Constants ────────────────────────────────────────────────────────────────

/// Oldest protocol revision this client can speak.
pub const PROTOCOL_MIN: u32 = 1;
/// Newest protocol revision this client can speak.
pub const PROTOCOL_MAX: u32 = 2;

pub const HANDSHAKE_TIMEOUT_MS: u64 = 10_000; // 10s
pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 30_000; // 30s

pub const MAX_PAYLOAD_BYTES: usize = 524_288; // 512 KB
pub const MAX_BUFFERED_BYTES: usize = 1_572_864; // 1.5 MB
pub const TICK_INTERVAL_MS: u64 = 30_000; // 30s

// ── Error codes ──────────────────────────────────────────────────────────────

pub mod error_codes {
    pub const UNKNOWN_METHOD: &str = "UNKNOWN_METHOD";
    pub const UNAUTHORIZED: &str = "UNAUTHORIZED";
    pub const FORBIDDEN: &str = "FORBIDDEN";
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const CONFLICT: &str = "CONFLICT";
    pub const RATE_LIMITED: &str = "RATE_LIMITED";
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const INTERNAL: &str = "INTERNAL";
    pub const PROTOCOL_ERROR: &str = "PROTOCOL_ERROR";
    pub const PAYLOAD_TOO_LARGE: &str = "PAYLOAD_TOO_LARGE";
}

// ── Methods and events ───────────────────────────────────────────────────────

pub mod methods {
    pub const CONNECT: &str = "connect";
    pub const CHAT_SEND: &str = "chat.send";
    pub const CHAT_HISTORY: &str = "chat.history";
    pub const CHAT_ABORT: &str = "chat.abort";
    pub const SESSIONS_LIST: &str = "sessions.list";
    pub const SESSIONS_PATCH: &str = "sessions.patch";
    pub const SESSIONS_DELETE: &str = "sessions.delete";
    pub const AGENTS_LIST: &str = "agents.list";
    pub const AGENT_IDENTITY: &str = "agent.identity";
    pub const CONFIG_GET: &str = "config.get";
    pub const CONFIG_SCHEMA: &str = "config.schema";
    pub const CONFIG_PATCH: &str = "config.patch";
}

pub mod events {
    pub const CHALLENGE: &str = "connect.challenge";
    pub const CHAT: &str = "chat";
    pub const TICK: &str = "tick";
    pub const PRESENCE: &str = "presence";
    pub const SHUTDOWN: &str = "shutdown";
}

pub const KNOWN_EVENTS: &[&str] = &[
    events::CHALLENGE,
    events::CHAT,
    events::TICK,
    events::PRESENCE,
    events::SHUTDOWN,
];

pub mod roles {
    pub const OPERATOR: &str = "operator";
}

pub mod scopes {
    pub const READ: &str = "operator.read";
    pub const WRITE: &str = "operator.write";
}

// ── Error shape ──────────────────────────────────────────────────────────────

/// Structured error carried by `ok:false` responses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorShape {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
    #[serde(rename = "retryAfterMs", skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl ErrorShape {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
            retryable: None,
            retry_after_ms: None,
        }
    }

    /// Authentication rejections are terminal for the connection — retrying
    /// with the same credentials would loop forever.
    #[must_use]
    pub fn is_auth_error(&self) -> bool {
        self.code == error_codes::UNAUTHORIZED || self.code == error_codes::FORBIDDEN
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.retryable.unwrap_or(false)
    }
}

// ── Frames ───────────────────────────────────────────────────────────────────

/// Discriminated union of all wire frame types.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum Frame {
    #[serde(rename = "req")]
    Request(RequestBody),
    #[serde(rename = "res")]
    Response(ResponseBody),
    #[serde(rename = "event")]
    Event(EventBody),
}

impl Frame {
    pub fn request(
        id: impl Into<String>,
        method: impl Into<String>,
        params: Option<serde_json::Value>,
    ) -> Self {
        Self::Request(RequestBody {
            id: id.into(),
            method: method.into(),
            params,
        })
    }

    pub fn event(name: impl Into<String>, payload: Option<serde_json::Value>) -> Self {
        Self::Event(EventBody {
            event: name.into(),
            payload,
        })
    }
}

/// Client → gateway RPC request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestBody {
    pub id: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

/// Gateway → client RPC result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseBody {
    pub id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
}

impl ResponseBody {
    pub fn ok(id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            ok: true,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn err(id: impl Into<String>, error: ErrorShape) -> Self {
        Self {
            id: id.into(),
            ok: false,
            payload: None,
            error: Some(error),
        }
    }
}

/// Gateway → client server-push event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventBody {
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

// ── Connect handshake ────────────────────────────────────────────────────────

/// Payload of the `connect.challenge` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengePayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

/// Parameters sent by the client in the initial `connect` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectParams {
    #[serde(rename = "minProtocol")]
    pub min_protocol: u32,
    #[serde(rename = "maxProtocol")]
    pub max_protocol: u32,
    pub client: ClientInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scopes: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<ConnectAuth>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    #[serde(rename = "userAgent", skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub id: String,
    #[serde(rename = "displayName", skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub version: String,
    pub platform: String,
    pub mode: String,
}

/// Device identity block proving possession of a locally held key.
///
/// All fields except `id` are optional: a token-only client omits the key
/// material entirely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: String,
    #[serde(rename = "publicKey", skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(rename = "signedAt", skip_serializing_if = "Option::is_none")]
    pub signed_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectAuth {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

// ── Hello payload ────────────────────────────────────────────────────────────

/// Payload of a successful `connect` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloPayload {
    pub protocol: u32,
    pub server: ServerInfo,
    pub features: Features,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<HelloAuth>,
    #[serde(default)]
    pub policy: Policy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(rename = "connId")]
    pub conn_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Features {
    pub methods: Vec<String>,
    pub events: Vec<String>,
}

/// Server-issued credentials returned from a successful handshake. The
/// surrounding application persists the device token; the core only passes
/// it through.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloAuth {
    #[serde(rename = "deviceToken")]
    pub device_token: String,
    pub role: String,
    pub scopes: Vec<String>,
    #[serde(rename = "issuedAtMs", skip_serializing_if = "Option::is_none")]
    pub issued_at_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    #[serde(rename = "maxPayload")]
    pub max_payload: usize,
    #[serde(rename = "maxBufferedBytes")]
    pub max_buffered_bytes: usize,
    #[serde(rename = "tickIntervalMs")]
    pub tick_interval_ms: u64,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            max_payload: MAX_PAYLOAD_BYTES,
            max_buffered_bytes: MAX_BUFFERED_BYTES,
            tick_interval_ms: TICK_INTERVAL_MS,
        }
    }
}

// ── Snapshot ─────────────────────────────────────────────────────────────────

/// Initial bulk state delivered with the hello payload: the agents the
/// gateway hosts and the sessions it knows about.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub agents: Vec<AgentSummary>,
    pub sessions: Vec<SessionSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentSummary {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSummary {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(rename = "messageCount", skip_serializing_if = "Option::is_none")]
    pub message_count: Option<u64>,
    #[serde(rename = "lastActivityMs", skip_serializing_if = "Option::is_none")]
    pub last_activity_ms: Option<u64>,
}

impl Snapshot {
    /// Lenient decode: a malformed element in either list is skipped rather
    /// than failing the whole snapshot.
    #[must_use]
    pub fn from_value(value: &serde_json::Value) -> Self {
        Self {
            agents: lenient_list(value.get("agents")),
            sessions: lenient_list(value.get("sessions")),
        }
    }
}

fn lenient_list<T: serde::de::DeserializeOwned>(value: Option<&serde_json::Value>) -> Vec<T> {
    value
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| serde_json::from_value(item.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn connect_params_wire_field_names() {
        let params = ConnectParams {
            min_protocol: PROTOCOL_MIN,
            max_protocol: PROTOCOL_MAX,
            client: ClientInfo {
                id: "desktop-1".into(),
                display_name: Some("Desktop".into()),
                version: "0.3.1".into(),
                platform: "macos".into(),
                mode: "operator".into(),
            },
            role: Some(roles::OPERATOR.into()),
            scopes: Some(vec![scopes::READ.into(), scopes::WRITE.into()]),
            auth: Some(ConnectAuth {
                token: Some("tok".into()),
                password: None,
            }),
            device: None,
            locale: Some("en".into()),
            user_agent: None,
        };
        let json = serde_json::to_value(&params).unwrap();
        assert_eq!(json["minProtocol"], 1);
        assert_eq!(json["maxProtocol"], 2);
        assert_eq!(json["client"]["displayName"], "Desktop");
        assert_eq!(json["auth"]["token"], "tok");
        assert!(!json.as_object().unwrap().contains_key("userAgent"));
        assert!(!json.as_object().unwrap().contains_key("device"));
    }

    #[test]
    fn hello_payload_defaults_policy() {
        let json = serde_json::json!({
            "protocol": 2,
            "server": { "version": "0.9.0", "connId": "c-1" },
            "features": { "methods": ["chat.send"], "events": ["chat"] },
        });
        let hello: HelloPayload = serde_json::from_value(json).unwrap();
        assert_eq!(hello.protocol, 2);
        assert_eq!(hello.policy.max_payload, MAX_PAYLOAD_BYTES);
        assert!(hello.snapshot.is_none());
        assert!(hello.auth.is_none());
    }

    #[test]
    fn response_err_shape_round_trip() {
        let body = ResponseBody::err(
            "r1",
            ErrorShape {
                code: error_codes::RATE_LIMITED.into(),
                message: "slow down".into(),
                details: None,
                retryable: Some(true),
                retry_after_ms: Some(1500),
            },
        );
        let json = serde_json::to_string(&Frame::Response(body)).unwrap();
        let parsed: Frame = serde_json::from_str(&json).unwrap();
        match parsed {
            Frame::Response(res) => {
                assert!(!res.ok);
                let err = res.error.unwrap();
                assert!(err.is_retryable());
                assert_eq!(err.retry_after_ms, Some(1500));
            },
            other => panic!("expected response frame, got {other:?}"),
        }
    }

    #[test]
    fn auth_error_codes_are_terminal() {
        assert!(ErrorShape::new(error_codes::UNAUTHORIZED, "no").is_auth_error());
        assert!(ErrorShape::new(error_codes::FORBIDDEN, "no").is_auth_error());
        assert!(!ErrorShape::new(error_codes::TIMEOUT, "slow").is_auth_error());
    }

    #[test]
    fn snapshot_skips_malformed_elements() {
        let value = serde_json::json!({
            "agents": [
                { "id": "main", "name": "Main" },
                42,
                { "name": "missing id" },
            ],
            "sessions": [
                { "key": "s-1", "messageCount": 7 },
                "bogus",
            ],
        });
        let snapshot = Snapshot::from_value(&value);
        assert_eq!(snapshot.agents.len(), 1);
        assert_eq!(snapshot.agents[0].id, "main");
        assert_eq!(snapshot.sessions.len(), 1);
        assert_eq!(snapshot.sessions[0].message_count, Some(7));
    }

    #[test]
    fn snapshot_tolerates_missing_lists() {
        let snapshot = Snapshot::from_value(&serde_json::json!({}));
        assert!(snapshot.agents.is_empty());
        assert!(snapshot.sessions.is_empty());
    }
}
