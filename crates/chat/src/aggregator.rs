//! Streaming message aggregator.
//!
//! One state machine per `(sessionKey, runId)`. Deltas carry the full
//! accumulated text, so every update replaces message content wholesale;
//! terminal events (`final`, `aborted`, `error`) discard the run, and run
//! ids are never resurrected afterwards.

use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};

use tether_protocol::SessionSummary;

use crate::{
    event::{ChatEventPayload, ChatEventState, ContentBlock},
    message::{ChatMessage, MessageStatus, Role},
};

type RunKey = (String, String); // (session_key, run_id)

/// In-flight run state. Retains the full block list (thinking/tool blocks
/// included) for inspection tooling even though only text is surfaced.
#[derive(Debug)]
struct ChatRun {
    message_id: String,
    last_text: String,
    blocks: Vec<ContentBlock>,
}

#[derive(Default)]
struct StoreInner {
    /// Ordered message list per session key.
    messages: HashMap<String, Vec<ChatMessage>>,
    /// Session metadata, seeded from the handshake snapshot and kept in
    /// insertion order.
    sessions: Vec<SessionSummary>,
    runs: HashMap<RunKey, ChatRun>,
    /// Run ids that already reached a terminal state; late events for these
    /// must not resurrect anything.
    finished: HashSet<RunKey>,
}

/// Per-connection message store. All operations are short synchronous
/// critical sections (the mutex is never held across an await point).
#[derive(Default)]
pub struct ChatStore {
    inner: std::sync::Mutex<StoreInner>,
}

impl ChatStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // ── Event ingestion ──────────────────────────────────────────────

    /// Apply one decoded `chat` event.
    pub fn apply(&self, payload: &ChatEventPayload) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        let key: RunKey = (payload.session_key.clone(), payload.run_id.clone());

        if inner.finished.contains(&key) {
            debug!(
                run_id = %payload.run_id,
                state = ?payload.state,
                "dropping chat event for finished run"
            );
            return;
        }

        match payload.state {
            ChatEventState::Delta => Self::apply_delta(&mut inner, &key, payload),
            ChatEventState::Final => Self::apply_final(&mut inner, &key, payload),
            ChatEventState::Aborted => Self::apply_aborted(&mut inner, &key, payload),
            ChatEventState::Error => Self::apply_error(&mut inner, &key, payload),
        }
    }

    fn apply_delta(inner: &mut StoreInner, key: &RunKey, payload: &ChatEventPayload) {
        let text = payload.visible_text();
        if let Some(run) = inner.runs.get_mut(key) {
            run.last_text = text.clone();
            run.blocks = payload.blocks.clone();
            let message_id = run.message_id.clone();
            // Full replacement: the wire sends cumulative text, appending
            // here would duplicate content.
            Self::update_message(inner, &key.0, &message_id, |msg| {
                msg.content = text;
                msg.revision += 1;
            });
            return;
        }

        let message = ChatMessage {
            id: uuid::Uuid::new_v4().to_string(),
            role: Role::Assistant,
            content: text.clone(),
            status: MessageStatus::Streaming,
            session_key: key.0.clone(),
            run_id: Some(key.1.clone()),
            model: payload.model.clone(),
            error: None,
            revision: 1,
        };
        inner.runs.insert(key.clone(), ChatRun {
            message_id: message.id.clone(),
            last_text: text,
            blocks: payload.blocks.clone(),
        });
        inner.messages.entry(key.0.clone()).or_default().push(message);
    }

    fn apply_final(inner: &mut StoreInner, key: &RunKey, payload: &ChatEventPayload) {
        let final_text = payload.visible_text();
        if let Some(run) = inner.runs.remove(key) {
            let text = if final_text.is_empty() {
                run.last_text
            } else {
                final_text
            };
            Self::update_message(inner, &key.0, &run.message_id, |msg| {
                msg.content = text;
                msg.status = MessageStatus::Complete;
                msg.revision += 1;
            });
        } else {
            // A final with no preceding deltas: synthesize the complete
            // message directly.
            let message = ChatMessage {
                id: uuid::Uuid::new_v4().to_string(),
                role: Role::Assistant,
                content: final_text,
                status: MessageStatus::Complete,
                session_key: key.0.clone(),
                run_id: Some(key.1.clone()),
                model: payload.model.clone(),
                error: None,
                revision: 1,
            };
            inner.messages.entry(key.0.clone()).or_default().push(message);
        }
        inner.finished.insert(key.clone());
    }

    fn apply_aborted(inner: &mut StoreInner, key: &RunKey, payload: &ChatEventPayload) {
        let Some(run) = inner.runs.remove(key) else {
            debug!(run_id = %payload.run_id, "abort for unknown run, dropping");
            return;
        };
        // An aborted run keeps whatever text had streamed so far.
        Self::update_message(inner, &key.0, &run.message_id, |msg| {
            msg.status = MessageStatus::Complete;
            msg.revision += 1;
        });
        inner.finished.insert(key.clone());
    }

    fn apply_error(inner: &mut StoreInner, key: &RunKey, payload: &ChatEventPayload) {
        let Some(run) = inner.runs.remove(key) else {
            // Nothing to attach the error to.
            warn!(run_id = %payload.run_id, "chat error for unknown run, dropping");
            return;
        };
        let error = payload
            .error_message
            .clone()
            .unwrap_or_else(|| "run failed".to_string());
        Self::update_message(inner, &key.0, &run.message_id, |msg| {
            msg.status = MessageStatus::Error;
            msg.error = Some(error);
            msg.revision += 1;
        });
        inner.finished.insert(key.clone());
    }

    fn update_message(
        inner: &mut StoreInner,
        session_key: &str,
        message_id: &str,
        mutate: impl FnOnce(&mut ChatMessage),
    ) {
        if let Some(msg) = inner
            .messages
            .get_mut(session_key)
            .and_then(|list| list.iter_mut().find(|m| m.id == message_id))
        {
            mutate(msg);
        }
    }

    // ── User-side lifecycle ──────────────────────────────────────────

    /// Append a locally authored user message in `Sending` state. Returns
    /// the message id for later settlement.
    pub fn append_user(&self, session_key: &str, content: &str) -> String {
        let message = ChatMessage::user(session_key, content);
        let id = message.id.clone();
        if let Ok(mut inner) = self.inner.lock() {
            inner
                .messages
                .entry(session_key.to_string())
                .or_default()
                .push(message);
        }
        id
    }

    pub fn mark_user_sent(&self, session_key: &str, message_id: &str) {
        if let Ok(mut inner) = self.inner.lock() {
            Self::update_message(&mut inner, session_key, message_id, |msg| {
                msg.status = MessageStatus::Sent;
            });
        }
    }

    pub fn mark_user_failed(&self, session_key: &str, message_id: &str, error: &str) {
        if let Ok(mut inner) = self.inner.lock() {
            Self::update_message(&mut inner, session_key, message_id, |msg| {
                msg.status = MessageStatus::Error;
                msg.error = Some(error.to_string());
            });
        }
    }

    // ── Session seeding and reads ────────────────────────────────────

    /// Seed session metadata from a handshake snapshot. Existing entries
    /// with the same key are replaced; message history is left untouched.
    pub fn seed_sessions(&self, sessions: &[SessionSummary]) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        for session in sessions {
            if let Some(existing) = inner.sessions.iter_mut().find(|s| s.key == session.key) {
                *existing = session.clone();
            } else {
                inner.sessions.push(session.clone());
            }
            inner.messages.entry(session.key.clone()).or_default();
        }
    }

    #[must_use]
    pub fn sessions(&self) -> Vec<SessionSummary> {
        self.inner
            .lock()
            .map(|inner| inner.sessions.clone())
            .unwrap_or_default()
    }

    /// Snapshot of one session's messages, oldest first.
    #[must_use]
    pub fn messages(&self, session_key: &str) -> Vec<ChatMessage> {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.messages.get(session_key).cloned())
            .unwrap_or_default()
    }

    /// True iff any run for this session has not yet reached a terminal
    /// state.
    #[must_use]
    pub fn is_streaming(&self, session_key: &str) -> bool {
        self.inner
            .lock()
            .map(|inner| inner.runs.keys().any(|(session, _)| session == session_key))
            .unwrap_or(false)
    }

    /// Retained block list for an in-flight run (inspection tooling).
    #[must_use]
    pub fn run_blocks(&self, session_key: &str, run_id: &str) -> Option<Vec<ContentBlock>> {
        self.inner
            .lock()
            .ok()?
            .runs
            .get(&(session_key.to_string(), run_id.to_string()))
            .map(|run| run.blocks.clone())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn delta(run: &str, text: &str) -> ChatEventPayload {
        event(run, ChatEventState::Delta, Some(text), None)
    }

    fn event(
        run: &str,
        state: ChatEventState,
        text: Option<&str>,
        error: Option<&str>,
    ) -> ChatEventPayload {
        ChatEventPayload {
            run_id: run.into(),
            session_key: "main".into(),
            state,
            blocks: text
                .map(|t| vec![ContentBlock::Text { text: t.into() }])
                .unwrap_or_default(),
            model: Some("sonnet".into()),
            error_message: error.map(String::from),
        }
    }

    #[test]
    fn deltas_replace_content_never_append() {
        let store = ChatStore::new();
        store.apply(&delta("r1", "Hel"));
        store.apply(&delta("r1", "Hello"));
        store.apply(&delta("r1", "Hello wor"));

        let messages = store.messages("main");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "Hello wor");
        assert_eq!(messages[0].status, MessageStatus::Streaming);
        assert_eq!(messages[0].revision, 3);
    }

    #[test]
    fn delta_then_final_yields_one_complete_message() {
        let store = ChatStore::new();
        store.apply(&delta("r1", "Hel"));
        store.apply(&delta("r1", "Hello"));
        store.apply(&event("r1", ChatEventState::Final, Some("Hello world"), None));

        let messages = store.messages("main");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "Hello world");
        assert_eq!(messages[0].status, MessageStatus::Complete);
        assert!(!store.is_streaming("main"));
    }

    #[test]
    fn final_without_text_keeps_last_delta() {
        let store = ChatStore::new();
        store.apply(&delta("r1", "partial answer"));
        store.apply(&event("r1", ChatEventState::Final, None, None));

        let messages = store.messages("main");
        assert_eq!(messages[0].content, "partial answer");
        assert_eq!(messages[0].status, MessageStatus::Complete);
    }

    #[test]
    fn final_without_prior_delta_synthesizes_message() {
        let store = ChatStore::new();
        store.apply(&event("r9", ChatEventState::Final, Some("done"), None));

        let messages = store.messages("main");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "done");
        assert_eq!(messages[0].status, MessageStatus::Complete);
        assert_eq!(messages[0].run_id.as_deref(), Some("r9"));
    }

    #[test]
    fn error_flips_message_and_blocks_resurrection() {
        let store = ChatStore::new();
        store.apply(&delta("r1", "Hel"));
        store.apply(&event("r1", ChatEventState::Error, None, Some("boom")));

        let messages = store.messages("main");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].status, MessageStatus::Error);
        assert_eq!(messages[0].error.as_deref(), Some("boom"));

        // Neither a late delta nor a late final resurrects the run.
        store.apply(&delta("r1", "Hello again"));
        store.apply(&event("r1", ChatEventState::Final, Some("Hello again"), None));
        let messages = store.messages("main");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].status, MessageStatus::Error);
        assert_eq!(messages[0].content, "Hel");
    }

    #[test]
    fn error_without_run_is_dropped() {
        let store = ChatStore::new();
        store.apply(&event("ghost", ChatEventState::Error, None, Some("boom")));
        assert!(store.messages("main").is_empty());
    }

    #[test]
    fn abort_completes_with_streamed_text() {
        let store = ChatStore::new();
        store.apply(&delta("r1", "half an ans"));
        store.apply(&event("r1", ChatEventState::Aborted, None, None));

        let messages = store.messages("main");
        assert_eq!(messages[0].content, "half an ans");
        assert_eq!(messages[0].status, MessageStatus::Complete);
        assert!(!store.is_streaming("main"));
    }

    #[test]
    fn is_streaming_tracks_open_runs() {
        let store = ChatStore::new();
        assert!(!store.is_streaming("main"));
        store.apply(&delta("r1", "a"));
        assert!(store.is_streaming("main"));
        store.apply(&event("r1", ChatEventState::Final, Some("a"), None));
        assert!(!store.is_streaming("main"));
    }

    #[test]
    fn user_message_lifecycle() {
        let store = ChatStore::new();
        let id = store.append_user("main", "hi there");
        assert_eq!(store.messages("main")[0].status, MessageStatus::Sending);

        store.mark_user_sent("main", &id);
        assert_eq!(store.messages("main")[0].status, MessageStatus::Sent);

        let id2 = store.append_user("main", "second");
        store.mark_user_failed("main", &id2, "not connected");
        let messages = store.messages("main");
        assert_eq!(messages[1].status, MessageStatus::Error);
        assert_eq!(messages[1].error.as_deref(), Some("not connected"));
    }

    #[test]
    fn runs_are_isolated_per_session() {
        let store = ChatStore::new();
        let mut other = delta("r1", "other session");
        other.session_key = "scratch".into();
        store.apply(&delta("r1", "main session"));
        store.apply(&other);

        assert_eq!(store.messages("main").len(), 1);
        assert_eq!(store.messages("scratch").len(), 1);
        assert!(store.is_streaming("main"));
        assert!(store.is_streaming("scratch"));
    }

    #[test]
    fn seed_sessions_replaces_existing_metadata() {
        let store = ChatStore::new();
        store.seed_sessions(&[SessionSummary {
            key: "main".into(),
            label: Some("Main".into()),
            message_count: Some(1),
            last_activity_ms: None,
        }]);
        store.seed_sessions(&[SessionSummary {
            key: "main".into(),
            label: Some("Renamed".into()),
            message_count: Some(2),
            last_activity_ms: None,
        }]);
        let sessions = store.sessions();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].label.as_deref(), Some("Renamed"));
    }

    #[test]
    fn run_blocks_retained_for_inspection() {
        let store = ChatStore::new();
        let mut payload = delta("r1", "visible");
        payload.blocks.push(ContentBlock::Thinking {
            text: "hidden".into(),
        });
        store.apply(&payload);

        let blocks = store.run_blocks("main", "r1").unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(store.messages("main")[0].content, "visible");
    }
}
