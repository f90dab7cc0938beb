//! Transport abstraction and the WebSocket implementation.
//!
//! The connection machine talks to a pair of trait objects (sink + source)
//! so the handshake and frame loop can be driven by an in-memory transport
//! in tests. Production dials `tokio-tungstenite` and splits the stream.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt, stream::{SplitSink, SplitStream}};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::debug;

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("transport io: {0}")]
    Io(String),

    #[error("transport closed")]
    Closed,
}

/// Outbound half: text frames in, wire out.
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, text: String) -> Result<(), TransportError>;
    async fn close(&mut self);
}

/// Inbound half. `None` means the peer closed cleanly.
#[async_trait]
pub trait FrameSource: Send {
    async fn next(&mut self) -> Option<Result<String, TransportError>>;
}

/// Establishes one transport connection per call.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self) -> Result<(Box<dyn FrameSink>, Box<dyn FrameSource>), TransportError>;
}

// ── WebSocket implementation ─────────────────────────────────────────────────

/// Stream type returned by `tokio_tungstenite::connect_async`.
pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct WsDialer {
    url: String,
}

impl WsDialer {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Dialer for WsDialer {
    async fn dial(&self) -> Result<(Box<dyn FrameSink>, Box<dyn FrameSource>), TransportError> {
        let (stream, _response) = connect_async(&self.url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (sink, source) = stream.split();
        Ok((Box::new(WsSink { sink }), Box::new(WsSource { source })))
    }
}

struct WsSink {
    sink: SplitSink<WsStream, Message>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.sink
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.sink.send(Message::Close(None)).await;
        let _ = self.sink.close().await;
    }
}

struct WsSource {
    source: SplitStream<WsStream>,
}

#[async_trait]
impl FrameSource for WsSource {
    async fn next(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            match self.source.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.to_string())),
                Ok(Message::Close(_)) => return None,
                Ok(Message::Binary(_)) => {
                    debug!("ignoring binary frame");
                },
                // Pings are answered by tungstenite on the next write flush.
                Ok(_) => {},
                Err(e) => return Some(Err(TransportError::Io(e.to_string()))),
            }
        }
    }
}

// ── In-memory transport (test seam) ──────────────────────────────────────────
