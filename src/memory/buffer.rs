//! Conversation buffering and flushing
//!
//! User turns are buffered as soon as they arrive. Assistant replies stream
//! in as part updates and are only buffered once the message completes.
//! Buffered turns are written to the graph as one episode per flush.

use super::session_store::SessionStore;
use crate::graph::{GraphClient, SOURCE_MESSAGE};
use crate::host::{HostClient, HostMessage, MessageRole};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub const USER_PREFIX: &str = "User: ";
pub const ASSISTANT_PREFIX: &str = "Assistant: ";

const MESSAGE_SEPARATOR: &str = "\n\n";

pub fn format_user_message(text: &str) -> String {
    format!("{USER_PREFIX}{text}")
}

pub fn format_assistant_message(text: &str) -> String {
    format!("{ASSISTANT_PREFIX}{text}")
}

/// True when the newest buffered turn has no assistant reply after it
pub fn ends_with_user_turn(messages: &[String]) -> bool {
    messages.last().is_some_and(|m| m.starts_with(USER_PREFIX))
}

pub fn join_messages(messages: &[String]) -> String {
    messages.join(MESSAGE_SEPARATOR)
}

/// Put messages from a failed flush back in front of anything buffered since
pub fn restore_unflushed(pending: &mut Vec<String>, unflushed: Vec<String>) {
    let newer = std::mem::replace(pending, unflushed);
    pending.extend(newer);
}

/// Streamed assistant text keyed by session and message id.
///
/// Part updates carry no role, so only messages registered with
/// [`AssistantBuffer::track`] are buffered. Finished message keys are kept
/// so late parts and repeated completions are ignored; that set grows by one
/// key per reply until the session is forgotten.
#[derive(Debug, Default)]
pub struct AssistantBuffer {
    tracked: HashSet<String>,
    pending: HashMap<String, String>,
    finalized: HashSet<String>,
}

impl AssistantBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(session_id: &str, message_id: &str) -> String {
        format!("{session_id}:{message_id}")
    }

    /// Register an assistant message so its parts get buffered
    pub fn track(&mut self, session_id: &str, message_id: &str) {
        let key = Self::key(session_id, message_id);
        if !self.finalized.contains(&key) {
            self.tracked.insert(key);
        }
    }

    /// Store the latest text for a streaming message; later parts replace
    /// earlier ones.
    pub fn buffer_part(&mut self, session_id: &str, message_id: &str, text: &str) -> bool {
        let key = Self::key(session_id, message_id);
        if !self.tracked.contains(&key) {
            return false;
        }
        self.pending.insert(key, text.to_string());
        true
    }

    pub fn is_finalized(&self, session_id: &str, message_id: &str) -> bool {
        self.finalized.contains(&Self::key(session_id, message_id))
    }

    /// Close out a message. Returns the buffered text the first time when
    /// there is any; a repeated call is a no-op.
    pub fn finalize(&mut self, session_id: &str, message_id: &str) -> Option<String> {
        let key = Self::key(session_id, message_id);
        if !self.finalized.insert(key.clone()) {
            return None;
        }
        self.tracked.remove(&key);
        let text = self.pending.remove(&key).unwrap_or_default();
        let text = text.trim();
        if text.is_empty() {
            debug!(session_id, message_id, "Assistant message finished without text");
            return None;
        }
        Some(text.to_string())
    }

    /// Claim a reply that was recovered from the host instead of streamed.
    /// False when the message already went through [`finalize`](Self::finalize).
    pub fn claim(&mut self, session_id: &str, message_id: &str) -> bool {
        let key = Self::key(session_id, message_id);
        if !self.finalized.insert(key.clone()) {
            return false;
        }
        self.tracked.remove(&key);
        self.pending.remove(&key);
        true
    }

    /// Forget everything kept for a session
    pub fn forget_session(&mut self, session_id: &str) {
        let prefix = format!("{session_id}:");
        self.tracked.retain(|key| !key.starts_with(&prefix));
        self.pending.retain(|key, _| !key.starts_with(&prefix));
        self.finalized.retain(|key| !key.starts_with(&prefix));
    }
}

/// Result of one flush attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Session is not tracked
    NoSession,
    Empty,
    /// Joined size under the gate; messages stay buffered
    BelowThreshold { bytes: usize },
    Flushed { messages: usize, bytes: usize },
    /// Write failed; messages were put back
    Failed,
}

/// Newest finished assistant reply after the last user message.
///
/// Returns the message id and the formatted text. Replies that come before
/// the last user message answer an earlier turn and are never picked.
pub fn reply_to_last_user_turn(messages: &[HostMessage]) -> Option<(String, String)> {
    let last_user = messages
        .iter()
        .rposition(|m| m.info.role == MessageRole::User)?;
    messages[last_user + 1..]
        .iter()
        .rev()
        .filter(|m| {
            m.info.role == MessageRole::Assistant && m.info.is_completed() && !m.info.is_summary()
        })
        .map(|m| (m.info.id.clone(), m.text()))
        .find(|(_, text)| !text.is_empty())
        .map(|(id, text)| (id, format_assistant_message(&text)))
}

/// Writes buffered turns to the graph
pub struct FlushController<'a> {
    graph: &'a dyn GraphClient,
    host: &'a dyn HostClient,
    replies: &'a Mutex<AssistantBuffer>,
}

impl<'a> FlushController<'a> {
    pub fn new(
        graph: &'a dyn GraphClient,
        host: &'a dyn HostClient,
        replies: &'a Mutex<AssistantBuffer>,
    ) -> Self {
        Self {
            graph,
            host,
            replies,
        }
    }

    /// Flush the session's buffer as one episode if it holds at least
    /// `min_bytes`. No lock is held across the graph or host calls.
    pub async fn flush(
        &self,
        store: &Mutex<SessionStore>,
        session_id: &str,
        description: &str,
        min_bytes: usize,
    ) -> FlushOutcome {
        let needs_reply = {
            let store = store.lock().await;
            let Some(state) = store.get(session_id) else {
                return FlushOutcome::NoSession;
            };
            if state.pending_messages.is_empty() {
                return FlushOutcome::Empty;
            }
            ends_with_user_turn(&state.pending_messages)
        };

        if needs_reply {
            if let Some((message_id, reply)) = self.missing_reply(session_id).await {
                if self.replies.lock().await.claim(session_id, &message_id) {
                    let mut store = store.lock().await;
                    if let Some(state) = store.get_mut(session_id) {
                        debug!(
                            session_id,
                            message_id = %message_id,
                            "Recovered assistant reply from host"
                        );
                        state.pending_messages.push(reply);
                    }
                }
            }
        }

        let (messages, body, group_id) = {
            let mut store = store.lock().await;
            let Some(state) = store.get_mut(session_id) else {
                return FlushOutcome::NoSession;
            };
            if state.pending_messages.is_empty() {
                return FlushOutcome::Empty;
            }
            let body = join_messages(&state.pending_messages);
            if body.len() < min_bytes {
                debug!(session_id, bytes = body.len(), min_bytes, "Buffer below flush threshold");
                return FlushOutcome::BelowThreshold { bytes: body.len() };
            }
            let messages = std::mem::take(&mut state.pending_messages);
            (messages, body, state.project_group.clone())
        };

        let name = format!("Conversation {}", Utc::now().format("%Y-%m-%d %H:%M:%S"));
        match self
            .graph
            .add_episode(&name, &body, &group_id, SOURCE_MESSAGE, description)
            .await
        {
            Ok(()) => {
                info!(
                    session_id,
                    messages = messages.len(),
                    bytes = body.len(),
                    "Flushed conversation to memory"
                );
                FlushOutcome::Flushed {
                    messages: messages.len(),
                    bytes: body.len(),
                }
            }
            Err(e) => {
                warn!(session_id, "Flush failed, keeping messages buffered: {}", e);
                let mut store = store.lock().await;
                if let Some(state) = store.get_mut(session_id) {
                    restore_unflushed(&mut state.pending_messages, messages);
                }
                FlushOutcome::Failed
            }
        }
    }

    async fn missing_reply(&self, session_id: &str) -> Option<(String, String)> {
        match self.host.session_messages(session_id).await {
            Ok(messages) => reply_to_last_user_turn(&messages),
            Err(e) => {
                warn!(session_id, "Fetching assistant reply failed: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_parts_overwrite_and_finalize_once() {
        let mut buffer = AssistantBuffer::new();
        buffer.track("s1", "m1");
        assert!(buffer.buffer_part("s1", "m1", "Hel"));
        assert!(buffer.buffer_part("s1", "m1", "Hello there"));

        assert_eq!(buffer.finalize("s1", "m1"), Some("Hello there".to_string()));
        assert!(buffer.is_finalized("s1", "m1"));
        assert_eq!(buffer.finalize("s1", "m1"), None);

        // Late part for a finalized message is ignored
        buffer.track("s1", "m1");
        assert!(!buffer.buffer_part("s1", "m1", "again"));
        assert_eq!(buffer.finalize("s1", "m1"), None);
    }

    #[test]
    fn test_untracked_parts_are_ignored() {
        let mut buffer = AssistantBuffer::new();
        assert!(!buffer.buffer_part("s1", "user-msg", "what the user typed"));
        assert_eq!(buffer.finalize("s1", "user-msg"), None);
    }

    #[test]
    fn test_empty_reply_is_still_finalized() {
        let mut buffer = AssistantBuffer::new();
        assert_eq!(buffer.finalize("s1", "m2"), None);
        assert!(buffer.is_finalized("s1", "m2"));
    }

    #[test]
    fn test_forget_session() {
        let mut buffer = AssistantBuffer::new();
        buffer.track("s1", "m1");
        buffer.track("s2", "m1");
        buffer.buffer_part("s1", "m1", "a");
        buffer.buffer_part("s2", "m1", "b");
        buffer.forget_session("s1");
        assert_eq!(buffer.finalize("s1", "m1"), None);
        assert_eq!(buffer.finalize("s2", "m1"), Some("b".to_string()));
    }

    #[test]
    fn test_claim_skips_finalized_reply() {
        let mut buffer = AssistantBuffer::new();
        buffer.track("s1", "m1");
        buffer.buffer_part("s1", "m1", "streamed");
        assert_eq!(buffer.finalize("s1", "m1"), Some("streamed".to_string()));
        assert!(!buffer.claim("s1", "m1"));

        buffer.track("s1", "m2");
        buffer.buffer_part("s1", "m2", "half");
        assert!(buffer.claim("s1", "m2"));
        assert_eq!(buffer.finalize("s1", "m2"), None);
    }

    #[test]
    fn test_forget_session_drops_finished_keys() {
        let mut buffer = AssistantBuffer::new();
        buffer.finalize("s1", "m1");
        buffer.finalize("s2", "m1");
        buffer.forget_session("s1");
        assert!(!buffer.is_finalized("s1", "m1"));
        assert!(buffer.is_finalized("s2", "m1"));
    }

    fn message(id: &str, role: MessageRole, text: &str, completed: bool) -> HostMessage {
        let mut info = json!({
            "id": id,
            "sessionID": "s1",
            "role": role,
            "time": { "created": 1 },
        });
        if completed {
            info["time"]["completed"] = json!(2);
        }
        serde_json::from_value(json!({
            "info": info,
            "parts": [{ "type": "text", "text": text }],
        }))
        .unwrap()
    }

    #[test]
    fn test_reply_must_follow_last_user_turn() {
        let history = vec![
            message("u1", MessageRole::User, "first question", true),
            message("a1", MessageRole::Assistant, "old answer one", true),
            message("u2", MessageRole::User, "second question", true),
        ];
        assert_eq!(reply_to_last_user_turn(&history), None);

        let mut history = history;
        history.push(message("a2", MessageRole::Assistant, "still streaming", false));
        assert_eq!(reply_to_last_user_turn(&history), None);

        history.push(message("a3", MessageRole::Assistant, "new answer", true));
        assert_eq!(
            reply_to_last_user_turn(&history),
            Some(("a3".to_string(), "Assistant: new answer".to_string()))
        );

        assert_eq!(reply_to_last_user_turn(&history[1..2]), None);
    }

    #[test]
    fn test_restore_preserves_order() {
        let mut pending = vec!["User: c".to_string()];
        restore_unflushed(&mut pending, vec!["User: a".into(), "Assistant: b".into()]);
        assert_eq!(pending, vec!["User: a", "Assistant: b", "User: c"]);
    }

    #[test]
    fn test_turn_helpers() {
        let messages = vec![format_user_message("hi"), format_assistant_message("hello")];
        assert!(!ends_with_user_turn(&messages));
        assert!(ends_with_user_turn(&messages[..1]));
        assert!(!ends_with_user_turn(&[]));
        assert_eq!(join_messages(&messages), "User: hi\n\nAssistant: hello");
    }
}
