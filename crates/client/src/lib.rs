//! Gateway protocol client.
//!
//! Maintains one persistent WebSocket connection per configured gateway
//! profile: challenge/response handshake, request/response correlation,
//! ordered event dispatch, exponential-backoff reconnection, and a typed
//! call surface. Chat events stream into `tether-chat`'s aggregator.
//!
//! Presentation layers interact with this crate three ways: issue typed
//! calls, watch connection state, and read the aggregated message store.
//! They never touch the wire.

pub mod backoff;
pub mod calls;
pub mod connection;
pub mod correlator;
pub mod error;
pub mod events;
pub mod identity;
pub mod manager;
pub mod profile;
pub mod transport;

pub use {
    backoff::ReconnectPolicy,
    calls::GatewayClient,
    connection::{ConnectOptions, ConnectionState, GatewayConnection, HelloInfo},
    error::ClientError,
    identity::DeviceIdentity,
    manager::ConnectionManager,
    profile::{AgentBinding, GatewayProfile},
    transport::{Dialer, TransportError, WsDialer},
};
