//! Streaming chat engine.
//!
//! Consumes `chat` events pushed by a gateway and turns them into coherent,
//! stateful message records. The wire protocol streams *cumulative* text —
//! every delta carries the full accumulated text so far — so aggregation is
//! idempotent replacement, never concatenation.

pub mod aggregator;
pub mod event;
pub mod message;

pub use {
    aggregator::ChatStore,
    event::{ChatEventPayload, ChatEventState, ContentBlock},
    message::{ChatMessage, MessageStatus, Role},
};
