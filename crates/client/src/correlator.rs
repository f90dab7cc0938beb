//! Request/response correlation.
//!
//! Every outbound call gets a fresh UUID and a single-resolution completion
//! slot. Responses resolve their pending entry; unmatched ids are dropped
//! (servers may echo retried ids), and connection teardown fails everything
//! that is still outstanding so callers never hang.

use std::{
    collections::HashMap,
    sync::Mutex,
    time::Instant,
};

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use tether_protocol::{ErrorShape, ResponseBody, error_codes};

use crate::error::ClientError;

pub type CallResult = Result<Option<Value>, ClientError>;

struct PendingCall {
    method: String,
    tx: oneshot::Sender<CallResult>,
    created_at: Instant,
}

/// Pending-call table for one connection. Lock is never held across an
/// await point.
#[derive(Default)]
pub struct Correlator {
    pending: Mutex<HashMap<String, PendingCall>>,
}

impl Correlator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new pending call; returns its fresh id and the receiver
    /// the caller suspends on.
    pub fn register(&self, method: &str) -> (String, oneshot::Receiver<CallResult>) {
        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(id.clone(), PendingCall {
                method: method.to_string(),
                tx,
                created_at: Instant::now(),
            });
        }
        (id, rx)
    }

    /// Resolve the matching pending call from a response frame. Returns
    /// false for unmatched ids, which are not an error.
    pub fn resolve(&self, response: ResponseBody) -> bool {
        let Some(call) = self
            .pending
            .lock()
            .ok()
            .and_then(|mut pending| pending.remove(&response.id))
        else {
            debug!(id = %response.id, "response for unknown call, dropping as stale");
            return false;
        };

        let result = if response.ok {
            Ok(response.payload)
        } else {
            let shape = response
                .error
                .unwrap_or_else(|| ErrorShape::new(error_codes::INTERNAL, "missing error shape"));
            if shape.is_auth_error() {
                Err(ClientError::Auth(shape))
            } else {
                Err(ClientError::Application(shape))
            }
        };

        debug!(
            id = %response.id,
            method = %call.method,
            elapsed_ms = call.created_at.elapsed().as_millis() as u64,
            "call resolved"
        );
        let _ = call.tx.send(result);
        true
    }

    /// Remove one call without resolving it (caller gave up). The paired
    /// receiver observes the dropped sender.
    pub fn cancel(&self, id: &str) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(id);
        }
    }

    /// Resolve every outstanding call with the given error. Used when the
    /// owning connection leaves `Connected`.
    pub fn fail_all(&self, error: &ClientError) {
        let drained: Vec<PendingCall> = self
            .pending
            .lock()
            .map(|mut pending| pending.drain().map(|(_, call)| call).collect())
            .unwrap_or_default();
        for call in drained {
            let _ = call.tx.send(Err(error.clone()));
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.lock().map(|pending| pending.len()).unwrap_or(0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ok_response_resolves_with_payload() {
        let correlator = Correlator::new();
        let (id, rx) = correlator.register("sessions.list");
        assert!(correlator.resolve(ResponseBody::ok(id, serde_json::json!({"sessions": []}))));

        let payload = rx.await.unwrap().unwrap().unwrap();
        assert!(payload["sessions"].is_array());
        assert!(correlator.is_empty());
    }

    #[tokio::test]
    async fn err_response_resolves_with_application_error() {
        let correlator = Correlator::new();
        let (id, rx) = correlator.register("chat.send");
        let mut shape = ErrorShape::new(error_codes::RATE_LIMITED, "slow down");
        shape.retryable = Some(true);
        correlator.resolve(ResponseBody::err(id, shape));

        match rx.await.unwrap() {
            Err(ClientError::Application(shape)) => {
                assert_eq!(shape.code, error_codes::RATE_LIMITED);
                assert!(shape.is_retryable());
            },
            other => panic!("expected application error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn auth_codes_surface_as_auth_error() {
        let correlator = Correlator::new();
        let (id, rx) = correlator.register("connect");
        correlator.resolve(ResponseBody::err(
            id,
            ErrorShape::new(error_codes::UNAUTHORIZED, "bad token"),
        ));
        assert!(matches!(rx.await.unwrap(), Err(ClientError::Auth(_))));
    }

    #[test]
    fn unmatched_response_is_a_noop() {
        let correlator = Correlator::new();
        let (_id, _rx) = correlator.register("agents.list");
        assert!(!correlator.resolve(ResponseBody::ok("nope", serde_json::json!({}))));
        assert_eq!(correlator.len(), 1);
    }

    #[test]
    fn ids_are_unique_while_pending() {
        let correlator = Correlator::new();
        let mut ids = std::collections::HashSet::new();
        let receivers: Vec<_> = (0..64)
            .map(|_| {
                let (id, rx) = correlator.register("config.get");
                assert!(ids.insert(id), "duplicate pending id");
                rx
            })
            .collect();
        assert_eq!(correlator.len(), receivers.len());
    }

    #[tokio::test]
    async fn fail_all_cancels_everything() {
        let correlator = Correlator::new();
        let (_id1, rx1) = correlator.register("chat.send");
        let (_id2, rx2) = correlator.register("chat.history");
        correlator.fail_all(&ClientError::Cancelled);

        assert!(matches!(rx1.await.unwrap(), Err(ClientError::Cancelled)));
        assert!(matches!(rx2.await.unwrap(), Err(ClientError::Cancelled)));
        assert!(correlator.is_empty());
    }

    #[tokio::test]
    async fn cancel_drops_the_sender() {
        let correlator = Correlator::new();
        let (id, rx) = correlator.register("chat.send");
        correlator.cancel(&id);
        assert!(rx.await.is_err());
        assert!(correlator.is_empty());
    }
}
