//! Gateway profiles and agent bindings.
//!
//! Profiles are owned and persisted by the surrounding application; the
//! client reads immutable snapshots, one per connection attempt.

use serde::{Deserialize, Serialize};

/// Durable configuration for one gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayProfile {
    pub id: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub tls: bool,
    /// Bearer token presented during the handshake.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Custom WebSocket path; defaults to `/ws`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl GatewayProfile {
    /// WebSocket URL for this profile.
    #[must_use]
    pub fn url(&self) -> String {
        let scheme = if self.tls { "wss" } else { "ws" };
        let path = self.path.as_deref().unwrap_or("/ws");
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        format!("{scheme}://{}:{}{path}", self.host, self.port)
    }
}

/// Maps one gateway-hosted agent to a local display identity and a rail
/// slot. Many bindings may point at the same connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentBinding {
    #[serde(rename = "gatewayId")]
    pub gateway_id: String,
    #[serde(rename = "agentId")]
    pub agent_id: String,
    #[serde(rename = "displayName")]
    pub display_name: String,
    /// Ordering position in the agent rail.
    pub position: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(tls: bool, path: Option<&str>) -> GatewayProfile {
        GatewayProfile {
            id: "gw-1".into(),
            name: "Local".into(),
            host: "127.0.0.1".into(),
            port: 8787,
            tls,
            token: None,
            path: path.map(String::from),
        }
    }

    #[test]
    fn url_scheme_follows_tls_flag() {
        assert_eq!(profile(false, None).url(), "ws://127.0.0.1:8787/ws");
        assert_eq!(profile(true, None).url(), "wss://127.0.0.1:8787/ws");
    }

    #[test]
    fn custom_path_is_normalized() {
        assert_eq!(
            profile(false, Some("gateway/ws")).url(),
            "ws://127.0.0.1:8787/gateway/ws"
        );
        assert_eq!(
            profile(false, Some("/socket")).url(),
            "ws://127.0.0.1:8787/socket"
        );
    }
}
