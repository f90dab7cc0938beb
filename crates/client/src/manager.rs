//! Connection set manager.
//!
//! One connection state machine per configured gateway profile, started
//! and reconnected independently — a failure on one gateway never affects
//! another. Resolves agent bindings to the live connection serving them,
//! failing fast when that connection is not up.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use tracing::info;

use crate::{
    calls::GatewayClient,
    connection::{ConnectOptions, ConnectionState, GatewayConnection},
    error::ClientError,
    identity::DeviceIdentity,
    profile::{AgentBinding, GatewayProfile},
    transport::Dialer,
};

pub struct ConnectionManager {
    options: ConnectOptions,
    identity: Option<Arc<DeviceIdentity>>,
    /// Profile id → machine. Mutated only when profiles are added/removed.
    connections: RwLock<HashMap<String, GatewayConnection>>,
    bindings: RwLock<Vec<AgentBinding>>,
}

impl ConnectionManager {
    #[must_use]
    pub fn new(options: ConnectOptions, identity: Option<Arc<DeviceIdentity>>) -> Self {
        Self {
            options,
            identity,
            connections: RwLock::new(HashMap::new()),
            bindings: RwLock::new(Vec::new()),
        }
    }

    // ── Profiles ─────────────────────────────────────────────────────

    /// Create (but do not start) the machine for a profile. Re-adding an
    /// existing id replaces the machine; the old one is disconnected.
    pub fn add_profile(&self, profile: GatewayProfile) -> GatewayConnection {
        let conn = GatewayConnection::new(
            profile.clone(),
            self.options.clone(),
            self.identity.clone(),
        );
        self.install(profile.id, conn.clone());
        conn
    }

    /// Test seam: add a profile over an injected transport.
    pub fn add_profile_with_dialer(
        &self,
        profile: GatewayProfile,
        dialer: Arc<dyn Dialer>,
    ) -> GatewayConnection {
        let conn = GatewayConnection::with_dialer(
            profile.clone(),
            self.options.clone(),
            self.identity.clone(),
            dialer,
        );
        self.install(profile.id, conn.clone());
        conn
    }

    fn install(&self, id: String, conn: GatewayConnection) {
        let previous = match self.connections.write() {
            Ok(mut connections) => connections.insert(id.clone(), conn),
            Err(_) => return,
        };
        if let Some(previous) = previous {
            previous.disconnect();
        }
        info!(gateway = %id, "gateway profile installed");
    }

    pub fn remove_profile(&self, gateway_id: &str) {
        let removed = self
            .connections
            .write()
            .ok()
            .and_then(|mut connections| connections.remove(gateway_id));
        if let Some(conn) = removed {
            conn.disconnect();
            info!(gateway = %gateway_id, "gateway profile removed");
        }
        if let Ok(mut bindings) = self.bindings.write() {
            bindings.retain(|b| b.gateway_id != gateway_id);
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Start every configured connection. Idempotent: machines already
    /// running (connected, connecting, or backing off) are left alone.
    pub fn connect_all(&self) {
        let connections: Vec<GatewayConnection> = self
            .connections
            .read()
            .map(|map| map.values().cloned().collect())
            .unwrap_or_default();
        for conn in connections {
            conn.connect();
        }
    }

    pub fn disconnect_all(&self) {
        let connections: Vec<GatewayConnection> = self
            .connections
            .read()
            .map(|map| map.values().cloned().collect())
            .unwrap_or_default();
        for conn in connections {
            conn.disconnect();
        }
    }

    // ── Lookup ───────────────────────────────────────────────────────

    #[must_use]
    pub fn connection(&self, gateway_id: &str) -> Option<GatewayConnection> {
        self.connections
            .read()
            .ok()
            .and_then(|connections| connections.get(gateway_id).cloned())
    }

    #[must_use]
    pub fn is_connected(&self, gateway_id: &str) -> bool {
        self.connection(gateway_id)
            .is_some_and(|conn| conn.state() == ConnectionState::Connected)
    }

    /// Typed call surface for a gateway. Fails fast with `NotConnected`
    /// rather than queuing silently, so calling layers can surface
    /// connection status accurately.
    pub fn client(&self, gateway_id: &str) -> Result<GatewayClient, ClientError> {
        let conn = self
            .connection(gateway_id)
            .ok_or_else(|| ClientError::NotConnected(gateway_id.to_string()))?;
        if conn.state() != ConnectionState::Connected {
            return Err(ClientError::NotConnected(gateway_id.to_string()));
        }
        Ok(GatewayClient::new(conn))
    }

    // ── Bindings ─────────────────────────────────────────────────────

    pub fn add_binding(&self, binding: AgentBinding) {
        if let Ok(mut bindings) = self.bindings.write() {
            bindings.retain(|b| {
                b.gateway_id != binding.gateway_id || b.agent_id != binding.agent_id
            });
            bindings.push(binding);
            bindings.sort_by_key(|b| b.position);
        }
    }

    pub fn remove_binding(&self, gateway_id: &str, agent_id: &str) {
        if let Ok(mut bindings) = self.bindings.write() {
            bindings.retain(|b| b.gateway_id != gateway_id || b.agent_id != agent_id);
        }
    }

    /// Bindings in rail order.
    #[must_use]
    pub fn bindings(&self) -> Vec<AgentBinding> {
        self.bindings
            .read()
            .map(|bindings| bindings.clone())
            .unwrap_or_default()
    }

    /// Resolve a binding to the client that can serve its agent.
    pub fn resolve(&self, binding: &AgentBinding) -> Result<GatewayClient, ClientError> {
        self.client(&binding.gateway_id)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::time::Duration;

    use tether_protocol::{self as proto, Frame, events};

    use super::*;
    use crate::{
        backoff::ReconnectPolicy,
        transport::memory::{MemoryDialer, MemoryPeer},
    };

    fn manager() -> ConnectionManager {
        ConnectionManager::new(
            ConnectOptions {
                handshake_timeout: Duration::from_millis(500),
                call_timeout: Duration::from_millis(500),
                reconnect: ReconnectPolicy {
                    initial: Duration::from_millis(10),
                    max: Duration::from_millis(40),
                },
                ..ConnectOptions::default()
            },
            None,
        )
    }

    fn profile(id: &str) -> GatewayProfile {
        GatewayProfile {
            id: id.into(),
            name: id.into(),
            host: "127.0.0.1".into(),
            port: 0,
            tls: false,
            token: None,
            path: None,
        }
    }

    fn binding(gateway: &str, agent: &str, position: u32) -> AgentBinding {
        AgentBinding {
            gateway_id: gateway.into(),
            agent_id: agent.into(),
            display_name: agent.into(),
            position,
        }
    }

    async fn serve_handshake(peer: &mut MemoryPeer) {
        let frame = Frame::event(events::CHALLENGE, Some(serde_json::json!({"nonce": "n"})));
        peer.to_client
            .send(proto::encode_frame(&frame).unwrap())
            .unwrap();
        let raw = tokio::time::timeout(Duration::from_secs(2), peer.from_client.recv())
            .await
            .expect("no connect request")
            .unwrap();
        let Frame::Request(req) = proto::decode_frame(&raw).unwrap() else {
            panic!("expected connect request");
        };
        let hello = serde_json::json!({
            "protocol": 2,
            "server": { "version": "0.9.0", "connId": "c" },
            "features": { "methods": [], "events": [] },
        });
        let frame = Frame::Response(proto::ResponseBody::ok(req.id, hello));
        peer.to_client
            .send(proto::encode_frame(&frame).unwrap())
            .unwrap();
    }

    async fn wait_connected(conn: &GatewayConnection) {
        let mut rx = conn.watch_state();
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if *rx.borrow() == ConnectionState::Connected {
                    return;
                }
                rx.changed().await.expect("state channel closed");
            }
        })
        .await
        .expect("never connected");
    }

    #[tokio::test]
    async fn gateways_connect_and_fail_independently() {
        let mgr = manager();
        let (dialer_a, mut peer_a) = MemoryDialer::new();
        let (dialer_b, peer_b) = MemoryDialer::new();
        let conn_a = mgr.add_profile_with_dialer(profile("gw-a"), Arc::new(dialer_a));
        let _conn_b = mgr.add_profile_with_dialer(profile("gw-b"), Arc::new(dialer_b));

        mgr.connect_all();
        serve_handshake(&mut peer_a).await;
        wait_connected(&conn_a).await;

        // gw-b never completed its handshake; gw-a is unaffected.
        drop(peer_b);
        assert!(mgr.is_connected("gw-a"));
        assert!(!mgr.is_connected("gw-b"));
        assert!(mgr.client("gw-a").is_ok());
        assert!(matches!(
            mgr.client("gw-b"),
            Err(ClientError::NotConnected(id)) if id == "gw-b"
        ));

        mgr.disconnect_all();
    }

    #[tokio::test]
    async fn connect_all_is_idempotent() {
        let mgr = manager();
        let (dialer, mut peer) = MemoryDialer::new();
        let conn = mgr.add_profile_with_dialer(profile("gw-a"), Arc::new(dialer));

        mgr.connect_all();
        serve_handshake(&mut peer).await;
        wait_connected(&conn).await;

        // A second sweep must not restart the connected machine (a restart
        // would dial again and fail: the dialer queue is empty).
        mgr.connect_all();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(conn.state(), ConnectionState::Connected);

        mgr.disconnect_all();
    }

    #[test]
    fn unknown_gateway_fails_fast() {
        let mgr = manager();
        assert!(matches!(
            mgr.client("nope"),
            Err(ClientError::NotConnected(_))
        ));
        assert!(!mgr.is_connected("nope"));
    }

    #[tokio::test]
    async fn bindings_resolve_through_their_gateway() {
        let mgr = manager();
        let (dialer, mut peer) = MemoryDialer::new();
        let conn = mgr.add_profile_with_dialer(profile("gw-a"), Arc::new(dialer));
        mgr.add_binding(binding("gw-a", "main", 1));
        mgr.add_binding(binding("gw-a", "helper", 0));

        // Rail order follows position, not insertion.
        let bindings = mgr.bindings();
        assert_eq!(bindings[0].agent_id, "helper");
        assert_eq!(bindings[1].agent_id, "main");

        // Not connected yet: resolution fails fast.
        assert!(mgr.resolve(&bindings[0]).is_err());

        mgr.connect_all();
        serve_handshake(&mut peer).await;
        wait_connected(&conn).await;
        assert!(mgr.resolve(&bindings[0]).is_ok());

        mgr.disconnect_all();
    }

    #[tokio::test]
    async fn remove_profile_disconnects_and_drops_bindings() {
        let mgr = manager();
        let (dialer, mut peer) = MemoryDialer::new();
        let conn = mgr.add_profile_with_dialer(profile("gw-a"), Arc::new(dialer));
        mgr.add_binding(binding("gw-a", "main", 0));

        mgr.connect_all();
        serve_handshake(&mut peer).await;
        wait_connected(&conn).await;

        mgr.remove_profile("gw-a");
        assert!(mgr.connection("gw-a").is_none());
        assert!(mgr.bindings().is_empty());
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn rebinding_an_agent_replaces_the_slot() {
        let mgr = manager();
        mgr.add_binding(binding("gw-a", "main", 0));
        mgr.add_binding(binding("gw-a", "main", 5));
        let bindings = mgr.bindings();
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].position, 5);
    }
}
