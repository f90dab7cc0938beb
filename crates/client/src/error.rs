//! Client-side error taxonomy.
//!
//! Transport failures drive reconnection, auth failures are terminal for
//! their connection, and application/timeout errors resolve a single call
//! without touching connection health.

use thiserror::Error;

use tether_protocol::ErrorShape;

#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// Connection refused, dropped mid-stream, or TLS failure.
    #[error("transport: {0}")]
    Transport(String),

    /// Malformed or unexpected wire data.
    #[error("protocol: {0}")]
    Protocol(String),

    /// Handshake rejected with UNAUTHORIZED/FORBIDDEN. Terminal until
    /// credentials change.
    #[error("authentication rejected: {}", .0.message)]
    Auth(ErrorShape),

    /// Method-level `ok:false` response.
    #[error("{}: {}", .0.code, .0.message)]
    Application(ErrorShape),

    /// No response within the call deadline.
    #[error("call timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The owning connection went away while the call was pending, or the
    /// caller cancelled it.
    #[error("call cancelled")]
    Cancelled,

    /// Fail-fast for calls issued against a connection that is not
    /// currently `Connected`.
    #[error("gateway `{0}` is not connected")]
    NotConnected(String),
}

impl ClientError {
    #[must_use]
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }

    /// Server-advertised retryability hint, where one exists.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Application(shape) => shape.is_retryable(),
            Self::Transport(_) | Self::Timeout(_) => true,
            _ => false,
        }
    }
}
