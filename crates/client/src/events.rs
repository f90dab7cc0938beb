//! Server-push event dispatch.
//!
//! Dispatch is synchronous per frame inside the connection's reader task,
//! so events on one connection are never reordered or handled concurrently
//! with each other. Unrecognized event names go to a catch-all sink rather
//! than vanishing.

use std::{collections::HashMap, sync::Mutex};

use serde_json::Value;
use tracing::debug;

/// Handler invoked with the event name and its payload, if any.
pub type EventHandler = std::sync::Arc<dyn Fn(&str, Option<&Value>) + Send + Sync>;

#[derive(Default)]
struct RouterInner {
    handlers: HashMap<String, Vec<EventHandler>>,
    unmatched: Vec<EventHandler>,
}

#[derive(Default)]
pub struct EventRouter {
    inner: Mutex<RouterInner>,
}

impl EventRouter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, event: &str, handler: EventHandler) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.handlers.entry(event.to_string()).or_default().push(handler);
        }
    }

    /// Diagnostics sink for event names nothing subscribed to.
    pub fn subscribe_unmatched(&self, handler: EventHandler) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.unmatched.push(handler);
        }
    }

    /// Drop every subscription (explicit disconnect).
    pub fn clear(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.handlers.clear();
            inner.unmatched.clear();
        }
    }

    pub fn dispatch(&self, event: &str, payload: Option<&Value>) {
        // Handlers are cloned out so a handler may subscribe/unsubscribe
        // without deadlocking.
        let (targets, fallback) = {
            let Ok(inner) = self.inner.lock() else {
                return;
            };
            match inner.handlers.get(event) {
                Some(handlers) if !handlers.is_empty() => (handlers.clone(), false),
                _ => (inner.unmatched.clone(), true),
            }
        };

        if fallback {
            debug!(event, "no subscriber, routing to catch-all sink");
        }
        for handler in targets {
            handler(event, payload);
        }
    }
}
