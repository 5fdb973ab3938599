//! Per-session state and parent resolution.
//!
//! State lives in memory for the lifetime of the process. Only main sessions
//! get state; a session with a parent is a subagent and is never tracked.
//! Parent lookups are cached per session, and a cached `None` (confirmed
//! top-level) is distinct from a missing entry (not looked up yet).

use super::injection::Injection;
use crate::host::{HostClient, DEFAULT_CONTEXT_LIMIT};
use crate::MemoryConfig;
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Memory state for one main session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionState {
    pub project_group: String,
    pub user_group: String,
    /// Whether the first full injection has happened
    pub injected: bool,
    /// Fact ids of the last injection; the drift baseline
    pub last_injected_ids: HashSet<String>,
    /// Fact ids already shown in the conversation
    pub visible_fact_ids: HashSet<String>,
    /// Injection waiting for the transform hook
    pub pending_injection: Option<Injection>,
    pub message_count: usize,
    /// Role-prefixed turns waiting to be flushed, oldest first
    pub pending_messages: Vec<String>,
    /// Context window in tokens
    pub context_limit: usize,
    pub is_main: bool,
    /// Set when the last drift check fired
    pub drifted: bool,
    pub last_user_message: Option<String>,
}

impl SessionState {
    pub fn new(config: &MemoryConfig) -> Self {
        Self {
            project_group: config.project_group_id(),
            user_group: config.user_group_id(),
            injected: false,
            last_injected_ids: HashSet::new(),
            visible_fact_ids: HashSet::new(),
            pending_injection: None,
            message_count: 0,
            pending_messages: Vec::new(),
            context_limit: DEFAULT_CONTEXT_LIMIT,
            is_main: true,
            drifted: false,
            last_user_message: None,
        }
    }

    /// Make `injection` the new drift baseline and mark its facts visible
    pub fn record_injection(&mut self, injection: &Injection) {
        self.injected = true;
        self.last_injected_ids = injection.project_fact_ids().iter().cloned().collect();
        self.visible_fact_ids
            .extend(injection.fact_ids().iter().cloned());
    }

    /// Compaction drops the visible history, so injected facts are no
    /// longer on screen and the next turn starts over with a full injection.
    pub fn reset_after_compaction(&mut self) {
        self.injected = false;
        self.drifted = false;
        self.last_injected_ids.clear();
        self.visible_fact_ids.clear();
        self.pending_injection = None;
    }
}

/// Outcome of resolving a session id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Top-level session; state exists
    Main,
    /// Child session; no state is kept
    Subagent,
    /// Parent lookup failed; try again on a later event
    Unresolved,
}

#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: HashMap<String, SessionState>,
    parents: HashMap<String, Option<String>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// `Some(parent)` once looked up; `None` when never resolved
    pub fn cached_parent(&self, session_id: &str) -> Option<Option<String>> {
        self.parents.get(session_id).cloned()
    }

    /// Cache a parent lookup. A subagent loses any state it had.
    pub fn record_parent(&mut self, session_id: &str, parent: Option<String>) {
        if parent.is_some() && self.sessions.remove(session_id).is_some() {
            debug!(session_id, "Dropped state for subagent session");
        }
        self.parents.insert(session_id.to_string(), parent);
    }

    /// State for a known main session, created on first use
    pub fn admit(&mut self, session_id: &str, config: &MemoryConfig) -> &mut SessionState {
        self.sessions.entry(session_id.to_string()).or_insert_with(|| {
            info!(session_id, "Tracking new session");
            SessionState::new(config)
        })
    }

    pub fn get(&self, session_id: &str) -> Option<&SessionState> {
        self.sessions.get(session_id)
    }

    pub fn get_mut(&mut self, session_id: &str) -> Option<&mut SessionState> {
        self.sessions.get_mut(session_id)
    }

    pub fn is_subagent(&self, session_id: &str) -> bool {
        matches!(self.parents.get(session_id), Some(Some(_)))
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Resolve `session_id`, creating state for a main session.
///
/// The parent lookup runs without holding the lock; a failed lookup caches
/// nothing so the next event retries it.
pub async fn resolve_session(
    store: &Mutex<SessionStore>,
    host: &dyn HostClient,
    config: &MemoryConfig,
    session_id: &str,
) -> Resolution {
    let cached = store.lock().await.cached_parent(session_id);
    let parent = match cached {
        Some(parent) => parent,
        None => match host.session_parent(session_id).await {
            Ok(parent) => {
                store.lock().await.record_parent(session_id, parent.clone());
                parent
            }
            Err(e) => {
                warn!(session_id, "Could not resolve session parent: {}", e);
                return Resolution::Unresolved;
            }
        },
    };

    match parent {
        Some(parent) => {
            debug!(session_id, parent = %parent, "Subagent session, not tracked");
            Resolution::Subagent
        }
        None => {
            store.lock().await.admit(session_id, config);
            Resolution::Main
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostMessage;
    use crate::{MemoryError, Result};
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ParentLookup {
        parent: Option<&'static str>,
        fail: bool,
        calls: AtomicUsize,
    }

    impl ParentLookup {
        fn new(parent: Option<&'static str>, fail: bool) -> Self {
            Self {
                parent,
                fail,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl HostClient for ParentLookup {
        async fn session_parent(&self, _: &str) -> Result<Option<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(MemoryError::Host("unreachable".into()));
            }
            Ok(self.parent.map(String::from))
        }

        async fn session_messages(&self, _: &str) -> Result<Vec<HostMessage>> {
            Ok(Vec::new())
        }

        async fn model_context_limit(&self, _: &str, _: &str) -> Result<Option<usize>> {
            Ok(None)
        }
    }

    fn config() -> MemoryConfig {
        MemoryConfig::new(PathBuf::from("/work/demo")).with_user_id("alice")
    }

    #[tokio::test]
    async fn test_main_session_created_once() {
        let store = Mutex::new(SessionStore::new());
        let host = ParentLookup::new(None, false);

        assert_eq!(resolve_session(&store, &host, &config(), "s1").await, Resolution::Main);
        assert_eq!(resolve_session(&store, &host, &config(), "s1").await, Resolution::Main);
        assert_eq!(host.calls.load(Ordering::SeqCst), 1);

        let store = store.lock().await;
        let state = store.get("s1").unwrap();
        assert!(state.is_main);
        assert_eq!(state.project_group, "opencode_demo");
        assert_eq!(state.user_group, "opencode_user_alice");
        assert_eq!(state.context_limit, DEFAULT_CONTEXT_LIMIT);
    }

    #[tokio::test]
    async fn test_subagent_never_gets_state() {
        let store = Mutex::new(SessionStore::new());
        let host = ParentLookup::new(Some("parent"), false);

        assert_eq!(
            resolve_session(&store, &host, &config(), "child").await,
            Resolution::Subagent
        );
        let store = store.lock().await;
        assert!(store.get("child").is_none());
        assert!(store.is_subagent("child"));
    }

    #[tokio::test]
    async fn test_failed_lookup_is_retried() {
        let store = Mutex::new(SessionStore::new());
        let host = ParentLookup::new(None, true);

        assert_eq!(
            resolve_session(&store, &host, &config(), "s1").await,
            Resolution::Unresolved
        );
        assert_eq!(
            resolve_session(&store, &host, &config(), "s1").await,
            Resolution::Unresolved
        );
        assert_eq!(host.calls.load(Ordering::SeqCst), 2);

        let store = store.lock().await;
        assert!(store.is_empty());
        assert_eq!(store.cached_parent("s1"), None);
    }

    #[test]
    fn test_record_parent_discards_existing_state() {
        let mut store = SessionStore::new();
        store.admit("s1", &config());
        store.record_parent("s1", Some("root".into()));
        assert!(store.get("s1").is_none());
        assert_eq!(store.cached_parent("s1"), Some(Some("root".to_string())));
    }

    #[test]
    fn test_compaction_reset() {
        let mut state = SessionState::new(&config());
        let injection = Injection::new("ctx".into(), vec!["f1".into(), "f2".into()]);
        state.record_injection(&injection);
        state.pending_messages.push("User: hi".into());
        assert!(state.injected);
        assert_eq!(state.visible_fact_ids.len(), 2);

        state.reset_after_compaction();
        assert!(!state.injected);
        assert!(state.last_injected_ids.is_empty());
        assert!(state.visible_fact_ids.is_empty());
        assert_eq!(state.pending_messages, vec!["User: hi".to_string()]);
    }
}
