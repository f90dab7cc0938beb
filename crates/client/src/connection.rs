//! Per-gateway connection state machine.
//!
//! One supervisor task owns one transport connection's lifecycle:
//! connecting → awaiting challenge → handshaking → connected →
//! reconnecting → …, until explicit disconnect. A single reader task
//! drains the inbound frame stream serially (events on one connection are
//! never reordered); outbound writes go through an mpsc into a writer
//! task, and callers suspend on oneshot completions — never on the reader.

use std::{
    sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock},
    time::Duration,
};

use {
    serde_json::Value,
    tokio::sync::{mpsc, watch},
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use {
    tether_chat::{ChatEventPayload, ChatStore},
    tether_protocol::{
        self as proto, AgentSummary, DecodeError, EventBody, Frame, HelloAuth, HelloPayload,
        Snapshot, events, methods,
    },
};

use crate::{
    backoff::{Backoff, ReconnectPolicy},
    correlator::Correlator,
    error::ClientError,
    events::{EventHandler, EventRouter},
    identity::DeviceIdentity,
    profile::GatewayProfile,
    transport::{Dialer, FrameSource, WsDialer},
};

/// Consecutive undecodable frames tolerated before the connection is torn
/// down as corrupt.
const PROTOCOL_ERROR_THRESHOLD: u32 = 8;

// ── State ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    AwaitingChallenge,
    Handshaking,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::AwaitingChallenge => "awaitingChallenge",
            Self::Handshaking => "handshaking",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Options ──────────────────────────────────────────────────────────────────

/// Client identity and tunables shared by every connection attempt.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub client: proto::ClientInfo,
    pub role: String,
    pub scopes: Vec<String>,
    pub locale: Option<String>,
    pub user_agent: Option<String>,
    pub call_timeout: Duration,
    pub handshake_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            client: proto::ClientInfo {
                id: "tether-desktop".into(),
                display_name: None,
                version: env!("CARGO_PKG_VERSION").into(),
                platform: std::env::consts::OS.into(),
                mode: "operator".into(),
            },
            role: proto::roles::OPERATOR.into(),
            scopes: vec![proto::scopes::READ.into(), proto::scopes::WRITE.into()],
            locale: None,
            user_agent: None,
            call_timeout: Duration::from_millis(proto::DEFAULT_CALL_TIMEOUT_MS),
            handshake_timeout: Duration::from_millis(proto::HANDSHAKE_TIMEOUT_MS),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Negotiated handshake results, available once `Connected`.
#[derive(Debug, Clone)]
pub struct HelloInfo {
    pub protocol: u32,
    pub server: proto::ServerInfo,
    pub features: proto::Features,
    pub policy: proto::Policy,
    pub auth: Option<HelloAuth>,
}

// ── Connection ───────────────────────────────────────────────────────────────

/// Handle to one gateway connection. Cheap to clone; all clones share the
/// same machine.
#[derive(Clone)]
pub struct GatewayConnection {
    inner: Arc<ConnInner>,
}

struct ConnInner {
    profile: GatewayProfile,
    options: ConnectOptions,
    identity: Option<Arc<DeviceIdentity>>,
    dialer: Arc<dyn Dialer>,
    state_tx: watch::Sender<ConnectionState>,
    correlator: Correlator,
    router: EventRouter,
    chat: Arc<ChatStore>,
    agents: StdRwLock<Vec<AgentSummary>>,
    hello: StdRwLock<Option<HelloInfo>>,
    last_error: StdRwLock<Option<ClientError>>,
    outbound: StdRwLock<Option<mpsc::UnboundedSender<String>>>,
    lifecycle: StdMutex<Option<CancellationToken>>,
}

impl GatewayConnection {
    /// Connection over the real WebSocket transport.
    #[must_use]
    pub fn new(
        profile: GatewayProfile,
        options: ConnectOptions,
        identity: Option<Arc<DeviceIdentity>>,
    ) -> Self {
        let dialer = Arc::new(WsDialer::new(profile.url()));
        Self::with_dialer(profile, options, identity, dialer)
    }

    /// Connection over an injected transport (tests).
    #[must_use]
    pub fn with_dialer(
        profile: GatewayProfile,
        options: ConnectOptions,
        identity: Option<Arc<DeviceIdentity>>,
        dialer: Arc<dyn Dialer>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(ConnInner {
                profile,
                options,
                identity,
                dialer,
                state_tx,
                correlator: Correlator::new(),
                router: EventRouter::new(),
                chat: Arc::new(ChatStore::new()),
                agents: StdRwLock::new(Vec::new()),
                hello: StdRwLock::new(None),
                last_error: StdRwLock::new(None),
                outbound: StdRwLock::new(None),
                lifecycle: StdMutex::new(None),
            }),
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Start (or keep) the supervisor for this connection. Idempotent: a
    /// no-op while a supervisor is already running.
    pub fn connect(&self) {
        let Ok(mut lifecycle) = self.inner.lifecycle.lock() else {
            return;
        };
        if let Some(token) = lifecycle.as_ref()
            && !token.is_cancelled()
        {
            return;
        }
        let token = CancellationToken::new();
        *lifecycle = Some(token.clone());
        drop(lifecycle);

        self.inner.record_error(None);
        let inner = Arc::clone(&self.inner);
        tokio::spawn(supervise(inner, token));
    }

    /// Explicit user-initiated disconnect: cancels the supervisor and any
    /// scheduled reconnect, resolves every pending call with a cancellation
    /// error, and clears this connection's event subscriptions.
    pub fn disconnect(&self) {
        let token = self
            .inner
            .lifecycle
            .lock()
            .ok()
            .and_then(|mut lifecycle| lifecycle.take());
        if let Some(token) = token {
            token.cancel();
        }
        self.inner.clear_outbound();
        self.inner.correlator.fail_all(&ClientError::Cancelled);
        self.inner.router.clear();
        self.inner.set_state(ConnectionState::Disconnected);
    }

    // ── Calls ────────────────────────────────────────────────────────

    /// Issue an RPC call and suspend until resolution, timeout, or
    /// cancellation. Fails fast when the connection is not `Connected`.
    pub async fn call(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Option<Value>, ClientError> {
        self.call_with_timeout(method, params, self.inner.options.call_timeout)
            .await
    }

    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Option<Value>, ClientError> {
        if self.state() != ConnectionState::Connected {
            return Err(ClientError::NotConnected(self.inner.profile.id.clone()));
        }

        let (id, rx) = self.inner.correlator.register(method);
        let frame = Frame::request(id.clone(), method, params);
        let text =
            proto::encode_frame(&frame).map_err(|e| ClientError::Protocol(e.to_string()))?;
        if let Err(err) = self.inner.send_text(text) {
            self.inner.correlator.cancel(&id);
            return Err(err);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::Cancelled),
            Err(_) => {
                // Timeout affects only this call, not connection health.
                self.inner.correlator.cancel(&id);
                Err(ClientError::Timeout(timeout))
            },
        }
    }

    // ── Subscriptions ────────────────────────────────────────────────

    pub fn on_event(&self, event: &str, handler: EventHandler) {
        self.inner.router.subscribe(event, handler);
    }

    pub fn on_unmatched_event(&self, handler: EventHandler) {
        self.inner.router.subscribe_unmatched(handler);
    }

    // ── Observers ────────────────────────────────────────────────────

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    /// Watch channel for state transitions, for presentation layers that
    /// render connection status.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    #[must_use]
    pub fn profile(&self) -> &GatewayProfile {
        &self.inner.profile
    }

    /// Message store fed by this connection's `chat` events.
    #[must_use]
    pub fn chat(&self) -> Arc<ChatStore> {
        Arc::clone(&self.inner.chat)
    }

    #[must_use]
    pub fn agents(&self) -> Vec<AgentSummary> {
        self.inner
            .agents
            .read()
            .map(|agents| agents.clone())
            .unwrap_or_default()
    }

    pub(crate) fn set_agents(&self, agents: Vec<AgentSummary>) {
        if let Ok(mut slot) = self.inner.agents.write() {
            *slot = agents;
        }
    }

    #[must_use]
    pub fn hello(&self) -> Option<HelloInfo> {
        self.inner.hello.read().ok().and_then(|h| h.clone())
    }

    /// Most recent failure, notably the terminal auth error that parks the
    /// machine in `Disconnected`.
    #[must_use]
    pub fn last_error(&self) -> Option<ClientError> {
        self.inner.last_error.read().ok().and_then(|e| e.clone())
    }

    #[must_use]
    pub fn pending_calls(&self) -> usize {
        self.inner.correlator.len()
    }
}

impl ConnInner {
    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state();
        if previous == next {
            return;
        }
        debug!(gateway = %self.profile.id, from = %previous, to = %next, "connection state");
        let _ = self.state_tx.send_replace(next);
    }

    fn record_error(&self, error: Option<ClientError>) {
        if let Ok(mut slot) = self.last_error.write() {
            *slot = error;
        }
    }

    fn set_outbound(&self, tx: mpsc::UnboundedSender<String>) {
        if let Ok(mut slot) = self.outbound.write() {
            *slot = Some(tx);
        }
    }

    fn clear_outbound(&self) {
        if let Ok(mut slot) = self.outbound.write() {
            *slot = None;
        }
    }

    fn send_text(&self, text: String) -> Result<(), ClientError> {
        let sender = self
            .outbound
            .read()
            .ok()
            .and_then(|slot| slot.clone())
            .ok_or_else(|| ClientError::NotConnected(self.profile.id.clone()))?;
        sender
            .send(text)
            .map_err(|_| ClientError::NotConnected(self.profile.id.clone()))
    }

    fn connect_params(&self, nonce: Option<&str>) -> proto::ConnectParams {
        let auth = self.profile.token.as_ref().map(|token| proto::ConnectAuth {
            token: Some(token.clone()),
            password: None,
        });
        let device = match (&self.identity, nonce) {
            (Some(identity), Some(nonce)) => {
                Some(identity.sign_challenge(nonce, &self.options.client.id))
            },
            (Some(identity), None) => Some(identity.bare_info()),
            (None, _) => None,
        };
        proto::ConnectParams {
            min_protocol: proto::PROTOCOL_MIN,
            max_protocol: proto::PROTOCOL_MAX,
            client: self.options.client.clone(),
            role: Some(self.options.role.clone()),
            scopes: (!self.options.scopes.is_empty()).then(|| self.options.scopes.clone()),
            auth,
            device,
            locale: self.options.locale.clone(),
            user_agent: self.options.user_agent.clone(),
        }
    }

    /// Route one inbound event: chat is the hot path into the aggregator,
    /// everything is also offered to subscribers.
    fn handle_event(&self, event: &EventBody) {
        if event.event == events::CHAT {
            match event.payload.as_ref().and_then(ChatEventPayload::from_value) {
                Some(payload) => self.chat.apply(&payload),
                None => warn!(gateway = %self.profile.id, "undecodable chat event payload"),
            }
        }
        self.router.dispatch(&event.event, event.payload.as_ref());
    }

    fn apply_hello(&self, hello: HelloPayload) {
        if let Some(snapshot_value) = &hello.snapshot {
            let snapshot = Snapshot::from_value(snapshot_value);
            self.chat.seed_sessions(&snapshot.sessions);
            if let Ok(mut agents) = self.agents.write() {
                *agents = snapshot.agents;
            }
        }
        info!(
            gateway = %self.profile.id,
            protocol = hello.protocol,
            server_version = %hello.server.version,
            conn_id = %hello.server.conn_id,
            "gateway connected"
        );
        if let Ok(mut slot) = self.hello.write() {
            *slot = Some(HelloInfo {
                protocol: hello.protocol,
                server: hello.server,
                features: hello.features,
                policy: hello.policy,
                auth: hello.auth,
            });
        }
    }
}

// ── Supervisor ───────────────────────────────────────────────────────────────

enum SessionEnd {
    /// Explicit disconnect observed; the caller already settled state.
    Cancelled,
    /// Handshake rejected with an auth error: terminal, no reconnect.
    AuthRejected(ClientError),
    /// Anything else: schedule a reconnect.
    Retry {
        error: ClientError,
        was_connected: bool,
    },
}

fn retry(error: ClientError, was_connected: bool) -> SessionEnd {
    SessionEnd::Retry {
        error,
        was_connected,
    }
}

async fn supervise(inner: Arc<ConnInner>, cancel: CancellationToken) {
    // Cancelling on exit lets a later `connect()` start a fresh supervisor.
    let _guard = cancel.clone().drop_guard();
    let mut backoff = Backoff::new(inner.options.reconnect.clone());

    loop {
        if cancel.is_cancelled() {
            return;
        }
        inner.set_state(ConnectionState::Connecting);
        let end = run_session(&inner, &cancel).await;

        // Leaving `Connected` (or failing to reach it) settles everything
        // still in flight so callers never hang.
        inner.clear_outbound();
        inner.correlator.fail_all(&ClientError::Cancelled);

        // An explicit disconnect may race a session failure; the disconnect
        // already settled state, so don't overwrite it.
        if cancel.is_cancelled() {
            return;
        }

        match end {
            SessionEnd::Cancelled => return,
            SessionEnd::AuthRejected(error) => {
                warn!(gateway = %inner.profile.id, error = %error, "authentication rejected, not retrying");
                inner.record_error(Some(error));
                inner.set_state(ConnectionState::Disconnected);
                return;
            },
            SessionEnd::Retry {
                error,
                was_connected,
            } => {
                if was_connected {
                    backoff.reset();
                }
                inner.record_error(Some(error.clone()));
                inner.set_state(ConnectionState::Reconnecting);
                let delay = backoff.next_delay();
                debug!(
                    gateway = %inner.profile.id,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "scheduling reconnect"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {},
                }
            },
        }
    }
}

async fn run_session(inner: &Arc<ConnInner>, cancel: &CancellationToken) -> SessionEnd {
    // Dial the transport.
    let dialed = tokio::select! {
        _ = cancel.cancelled() => return SessionEnd::Cancelled,
        dialed = inner.dialer.dial() => dialed,
    };
    let (mut sink, mut source) = match dialed {
        Ok(pair) => pair,
        Err(e) => return retry(ClientError::Transport(e.to_string()), false),
    };

    // Writer task: drains the outbound queue into the sink. It exits when
    // the queue's last sender drops (session teardown) or a write fails.
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
    inner.set_outbound(outbound_tx);
    let writer_cancel = cancel.child_token();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = writer_cancel.cancelled() => {
                    sink.close().await;
                    return;
                },
                queued = outbound_rx.recv() => match queued {
                    Some(text) => {
                        if sink.send(text).await.is_err() {
                            return;
                        }
                    },
                    None => {
                        sink.close().await;
                        return;
                    },
                },
            }
        }
    });

    drive(inner, cancel, source.as_mut()).await
}

/// Handshake and frame loop for one established transport.
async fn drive(
    inner: &Arc<ConnInner>,
    cancel: &CancellationToken,
    source: &mut dyn FrameSource,
) -> SessionEnd {
    let mut proto_errors: u32 = 0;
    let handshake_deadline = tokio::time::sleep(inner.options.handshake_timeout);
    tokio::pin!(handshake_deadline);

    // Phase 1: transport is up, wait for the gateway's challenge.
    inner.set_state(ConnectionState::AwaitingChallenge);
    let nonce = loop {
        tokio::select! {
            _ = cancel.cancelled() => return SessionEnd::Cancelled,
            _ = &mut handshake_deadline => {
                return retry(
                    ClientError::Transport("handshake timed out awaiting challenge".into()),
                    false,
                );
            },
            frame = source.next() => {
                match decode_inbound(inner, frame, &mut proto_errors, false) {
                    InboundStep::End(end) => return end,
                    InboundStep::Challenge(nonce) => break nonce,
                    InboundStep::Continue => {},
                }
            },
        }
    };

    // Phase 2: answer with a `connect` request carrying identity and proof.
    inner.set_state(ConnectionState::Handshaking);
    let params = inner.connect_params(nonce.as_deref());
    let (connect_id, mut connect_rx) = inner.correlator.register(methods::CONNECT);
    let params_value = match serde_json::to_value(&params) {
        Ok(value) => value,
        Err(e) => return retry(ClientError::Protocol(e.to_string()), false),
    };
    let frame = Frame::request(connect_id.clone(), methods::CONNECT, Some(params_value));
    let text = match proto::encode_frame(&frame) {
        Ok(text) => text,
        Err(e) => return retry(ClientError::Protocol(e.to_string()), false),
    };
    if let Err(err) = inner.send_text(text) {
        return retry(err, false);
    }

    // Phase 3: keep pumping frames until the hello response resolves.
    let hello_payload = loop {
        tokio::select! {
            _ = cancel.cancelled() => return SessionEnd::Cancelled,
            _ = &mut handshake_deadline => {
                inner.correlator.cancel(&connect_id);
                return retry(
                    ClientError::Transport("handshake timed out awaiting hello".into()),
                    false,
                );
            },
            resolved = &mut connect_rx => {
                match resolved {
                    Ok(Ok(payload)) => break payload,
                    Ok(Err(err)) if err.is_auth() => return SessionEnd::AuthRejected(err),
                    Ok(Err(err)) => return retry(err, false),
                    Err(_) => return retry(ClientError::Cancelled, false),
                }
            },
            frame = source.next() => {
                match decode_inbound(inner, frame, &mut proto_errors, false) {
                    InboundStep::End(end) => return end,
                    // A duplicate challenge mid-handshake is ignored.
                    InboundStep::Challenge(_) | InboundStep::Continue => {},
                }
            },
        }
    };

    // Apply the snapshot before flipping to Connected so no caller ever
    // observes `Connected` with a stale or empty store.
    let hello: HelloPayload = match hello_payload
        .ok_or_else(|| ClientError::Protocol("hello payload missing".into()))
        .and_then(|value| {
            serde_json::from_value(value).map_err(|e| ClientError::Protocol(e.to_string()))
        }) {
        Ok(hello) => hello,
        Err(err) => return retry(err, false),
    };
    inner.apply_hello(hello);
    inner.set_state(ConnectionState::Connected);

    // Phase 4: steady-state frame loop.
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return SessionEnd::Cancelled,
            frame = source.next() => {
                match decode_inbound(inner, frame, &mut proto_errors, true) {
                    InboundStep::End(end) => return end,
                    InboundStep::Challenge(_) | InboundStep::Continue => {},
                }
            },
        }
    }
}

enum InboundStep {
    /// Session is over; propagate.
    End(SessionEnd),
    /// `connect.challenge` arrived, carrying this nonce.
    Challenge(Option<String>),
    Continue,
}

/// Decode and process one inbound frame. Shared between the handshake
/// phases and the steady-state loop; `was_connected` only affects how a
/// teardown is reported to the reconnect policy.
fn decode_inbound(
    inner: &Arc<ConnInner>,
    frame: Option<Result<String, crate::transport::TransportError>>,
    proto_errors: &mut u32,
    was_connected: bool,
) -> InboundStep {
    let text = match frame {
        None => {
            return InboundStep::End(retry(
                ClientError::Transport("connection closed by gateway".into()),
                was_connected,
            ));
        },
        Some(Err(e)) => {
            return InboundStep::End(retry(ClientError::Transport(e.to_string()), was_connected));
        },
        Some(Ok(text)) => text,
    };

    match proto::decode_frame(&text) {
        Ok(Frame::Response(response)) => {
            *proto_errors = 0;
            inner.correlator.resolve(response);
            InboundStep::Continue
        },
        Ok(Frame::Event(event)) => {
            *proto_errors = 0;
            if event.event == events::CHALLENGE {
                let nonce = event
                    .payload
                    .as_ref()
                    .and_then(|p| p.get("nonce"))
                    .and_then(Value::as_str)
                    .map(String::from);
                return InboundStep::Challenge(nonce);
            }
            if event.event == events::SHUTDOWN {
                // Let subscribers see the announcement, then tear down.
                inner.router.dispatch(&event.event, event.payload.as_ref());
                return InboundStep::End(retry(
                    ClientError::Transport("gateway announced shutdown".into()),
                    was_connected,
                ));
            }
            inner.handle_event(&event);
            InboundStep::Continue
        },
        Ok(Frame::Request(request)) => {
            *proto_errors = 0;
            debug!(method = %request.method, "ignoring server-initiated request frame");
            InboundStep::Continue
        },
        Err(DecodeError::UnknownFrameType { frame_type }) => {
            // Forward-compat: newer gateways may speak frames we don't.
            debug!(frame_type, "ignoring unknown frame type");
            InboundStep::Continue
        },
        Err(e) => {
            *proto_errors += 1;
            warn!(
                gateway = %inner.profile.id,
                error = %e,
                consecutive = *proto_errors,
                "dropping malformed frame"
            );
            if *proto_errors >= PROTOCOL_ERROR_THRESHOLD {
                return InboundStep::End(retry(
                    ClientError::Protocol("too many malformed frames".into()),
                    was_connected,
                ));
            }
            InboundStep::Continue
        },
    }
}
