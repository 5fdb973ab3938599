//! Hook entry points
//!
//! `MemoryEngine` is the one long-lived component. It owns the session
//! store, the streamed-reply buffer, and the model limit cache, and is the
//! only thing the bridge talks to. Every collaborator failure is logged and
//! turned into "skip this for now"; no hook returns an error to the host.

use crate::graph::GraphClient;
use crate::host::{
    joined_text, HostClient, HostMessage, HostPart, MessageInfo, MessageRole, DEFAULT_CONTEXT_LIMIT,
};
use crate::memory::{
    format_assistant_message, format_user_message, persist_summary, resolve_session,
    AssistantBuffer, CompactionContextBuilder, DriftDetector, FactClassifier, FlushController,
    FlushOutcome, Injection, InjectionPipeline, InjectionRequest, Resolution, SessionState,
    SessionStore,
};
use crate::{MemoryConfig, MemoryError, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Episode description for idle flushes
pub const IDLE_FLUSH_DESCRIPTION: &str = "session idle";

/// Episode description for the flush that precedes compaction
pub const COMPACTION_FLUSH_DESCRIPTION: &str = "pre-compaction";

/// Context strings needed before the last user message is added to the
/// compaction query
const MIN_COMPACTION_CONTEXT: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRef {
    #[serde(rename = "providerID")]
    pub provider_id: String,
    #[serde(rename = "modelID")]
    pub model_id: String,
}

/// Input of the chat message hook
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessageInput {
    #[serde(rename = "sessionID")]
    pub session_id: String,
    #[serde(rename = "messageID", default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelRef>,
}

impl ChatMessageInput {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            message_id: None,
            model: None,
        }
    }
}

/// What the chat hook did for a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    /// Subagent, unresolved session, or no text
    Skipped,
    /// Turn buffered; nothing injected
    Buffered,
    /// Memory prepended to the outgoing parts
    Injected { facts: usize },
    /// Memory stored for the transform hook
    Deferred { facts: usize },
}

/// A streamed message part as carried by `message.part.updated`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PartUpdate {
    #[serde(rename = "sessionID")]
    pub session_id: String,
    #[serde(rename = "messageID")]
    pub message_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub synthetic: bool,
}

/// Lifecycle events from the host
#[derive(Debug, Clone, PartialEq)]
pub enum HostEvent {
    SessionCreated { session_id: String },
    SessionIdle { session_id: String },
    SessionCompacted { session_id: String, summary: Option<String> },
    MessageUpdated { info: MessageInfo },
    MessagePartUpdated { part: PartUpdate },
    /// Event kinds the engine does not act on
    Other(String),
}

#[derive(Deserialize)]
struct SessionRef {
    id: String,
}

#[derive(Deserialize)]
struct SessionCreatedProps {
    info: SessionRef,
}

#[derive(Deserialize)]
struct SessionIdProps {
    #[serde(rename = "sessionID")]
    session_id: String,
    #[serde(default)]
    summary: Option<String>,
}

#[derive(Deserialize)]
struct MessageUpdatedProps {
    info: MessageInfo,
}

#[derive(Deserialize)]
struct PartUpdatedProps {
    part: PartUpdate,
}

impl HostEvent {
    /// Decode a `{type, properties}` event envelope
    pub fn from_value(value: Value) -> Result<Self> {
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| MemoryError::Protocol("event without a type".to_string()))?
            .to_string();
        let properties = value.get("properties").cloned().unwrap_or(Value::Null);

        let event = match kind.as_str() {
            "session.created" => {
                let props: SessionCreatedProps = serde_json::from_value(properties)?;
                Self::SessionCreated {
                    session_id: props.info.id,
                }
            }
            "session.idle" => {
                let props: SessionIdProps = serde_json::from_value(properties)?;
                Self::SessionIdle {
                    session_id: props.session_id,
                }
            }
            "session.compacted" => {
                let props: SessionIdProps = serde_json::from_value(properties)?;
                Self::SessionCompacted {
                    session_id: props.session_id,
                    summary: props.summary.filter(|s| !s.trim().is_empty()),
                }
            }
            "message.updated" => {
                let props: MessageUpdatedProps = serde_json::from_value(properties)?;
                Self::MessageUpdated { info: props.info }
            }
            "message.part.updated" => {
                let props: PartUpdatedProps = serde_json::from_value(properties)?;
                Self::MessagePartUpdated { part: props.part }
            }
            _ => Self::Other(kind),
        };
        Ok(event)
    }
}

/// Snapshot of the per-turn inputs taken under the store lock
struct TurnContext {
    injected: bool,
    project_group: String,
    user_group: String,
    last_injected_ids: HashSet<String>,
    visible_fact_ids: HashSet<String>,
    context_limit: usize,
}

pub struct MemoryEngine {
    config: MemoryConfig,
    graph: Arc<dyn GraphClient>,
    host: Arc<dyn HostClient>,
    sessions: Mutex<SessionStore>,
    replies: Mutex<AssistantBuffer>,
    model_limits: Mutex<HashMap<(String, String), usize>>,
    classifier: FactClassifier,
    drift: DriftDetector,
}

impl MemoryEngine {
    pub fn new(
        config: MemoryConfig,
        graph: Arc<dyn GraphClient>,
        host: Arc<dyn HostClient>,
    ) -> Self {
        let classifier = FactClassifier::new(&config.decision_keywords);
        let drift = DriftDetector::new(config.drift_threshold, config.drift_search_limit);
        Self {
            config,
            graph,
            host,
            sessions: Mutex::new(SessionStore::new()),
            replies: Mutex::new(AssistantBuffer::new()),
            model_limits: Mutex::new(HashMap::new()),
            classifier,
            drift,
        }
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub async fn resolve_session(&self, session_id: &str) -> Resolution {
        let resolution =
            resolve_session(&self.sessions, self.host.as_ref(), &self.config, session_id).await;
        if resolution == Resolution::Subagent {
            self.replies.lock().await.forget_session(session_id);
        }
        resolution
    }

    pub async fn is_subagent(&self, session_id: &str) -> bool {
        self.sessions.lock().await.is_subagent(session_id)
    }

    /// Copy of a session's state
    pub async fn session_state(&self, session_id: &str) -> Option<SessionState> {
        self.sessions.lock().await.get(session_id).cloned()
    }

    /// Turn start: buffer the user turn, then inject on the first turn or
    /// when the conversation has drifted from the last injection.
    pub async fn on_chat_message(
        &self,
        input: &ChatMessageInput,
        parts: &mut Vec<HostPart>,
    ) -> TurnOutcome {
        let session_id = input.session_id.as_str();
        if self.resolve_session(session_id).await != Resolution::Main {
            return TurnOutcome::Skipped;
        }
        let text = joined_text(parts);
        if text.is_empty() {
            return TurnOutcome::Skipped;
        }

        if let Some(model) = &input.model {
            self.update_context_limit(session_id, &model.provider_id, &model.model_id)
                .await;
        }

        let turn = {
            let mut store = self.sessions.lock().await;
            let Some(state) = store.get_mut(session_id) else {
                return TurnOutcome::Skipped;
            };
            state.message_count += 1;
            state.pending_messages.push(format_user_message(&text));
            state.last_user_message = Some(text.clone());
            TurnContext {
                injected: state.injected,
                project_group: state.project_group.clone(),
                user_group: state.user_group.clone(),
                last_injected_ids: state.last_injected_ids.clone(),
                visible_fact_ids: state.visible_fact_ids.clone(),
                context_limit: state.context_limit,
            }
        };

        let budget = self
            .config
            .budget_for(turn.context_limit, self.config.injection_budget_percent);
        let pipeline = InjectionPipeline::new(self.graph.as_ref(), &self.config);

        let injection = if !turn.injected {
            let user_group = self
                .config
                .include_user_scope
                .then_some(turn.user_group.as_str());
            pipeline
                .retrieve(&InjectionRequest {
                    query: &text,
                    project_group: &turn.project_group,
                    user_group,
                    budget,
                    visible: &turn.visible_fact_ids,
                    now: Utc::now(),
                })
                .await
        } else {
            let groups = [turn.project_group.clone()];
            let check = self
                .drift
                .check(self.graph.as_ref(), &text, &groups, &turn.last_injected_ids)
                .await;
            let drifted = check.is_some_and(|c| c.is_drifted());
            if let Some(state) = self.sessions.lock().await.get_mut(session_id) {
                state.drifted = drifted;
            }
            if !drifted {
                return TurnOutcome::Buffered;
            }
            info!(session_id, ?check, "Conversation drifted, re-injecting project memory");
            pipeline
                .retrieve(&InjectionRequest {
                    query: &text,
                    project_group: &turn.project_group,
                    user_group: None,
                    budget,
                    visible: &turn.visible_fact_ids,
                    now: Utc::now(),
                })
                .await
        };

        match injection {
            Some(injection) => self.deliver(session_id, injection, parts).await,
            None => TurnOutcome::Buffered,
        }
    }

    async fn deliver(
        &self,
        session_id: &str,
        injection: Injection,
        parts: &mut Vec<HostPart>,
    ) -> TurnOutcome {
        let facts = injection.fact_ids().len();
        let mut store = self.sessions.lock().await;
        let Some(state) = store.get_mut(session_id) else {
            return TurnOutcome::Buffered;
        };
        state.record_injection(&injection);
        if self.config.inject_via_transform {
            state.pending_injection = Some(injection);
            TurnOutcome::Deferred { facts }
        } else {
            parts.insert(0, HostPart::synthetic_text(injection.text()));
            TurnOutcome::Injected { facts }
        }
    }

    /// Apply a deferred injection to the last user message. Each injection
    /// is applied at most once.
    pub async fn on_transform(&self, session_id: &str, messages: &mut [HostMessage]) -> bool {
        let injection = {
            let mut store = self.sessions.lock().await;
            match store.get_mut(session_id) {
                Some(state) => state.pending_injection.take(),
                None => None,
            }
        };
        let Some(injection) = injection else {
            return false;
        };

        let Some(message) = messages
            .iter_mut()
            .rev()
            .find(|m| m.info.role == MessageRole::User)
        else {
            debug!(session_id, "No user message to carry the injection");
            return false;
        };

        let target = message
            .parts
            .iter_mut()
            .find(|p| p.is_text() && !p.synthetic && p.text.is_some());
        match target {
            Some(part) => {
                let original = part.text.take().unwrap_or_default();
                part.text = Some(format!("{}\n\n{}", injection.text(), original));
            }
            None => message.parts.insert(0, HostPart::synthetic_text(injection.text())),
        }
        debug!(session_id, facts = injection.fact_ids().len(), "Applied deferred injection");
        true
    }

    pub async fn on_event(&self, event: HostEvent) {
        match event {
            HostEvent::SessionCreated { session_id } => {
                self.resolve_session(&session_id).await;
            }
            HostEvent::SessionIdle { session_id } => {
                if self.resolve_session(&session_id).await == Resolution::Main {
                    self.flush(
                        &session_id,
                        IDLE_FLUSH_DESCRIPTION,
                        self.config.idle_flush_min_bytes,
                    )
                    .await;
                }
            }
            HostEvent::SessionCompacted { session_id, summary } => {
                self.handle_compacted(&session_id, summary).await;
            }
            HostEvent::MessageUpdated { info } => {
                self.handle_message_updated(info).await;
            }
            HostEvent::MessagePartUpdated { part } => {
                if part.kind != "text" || part.synthetic {
                    return;
                }
                let Some(text) = part.text.as_deref() else {
                    return;
                };
                if self.is_subagent(&part.session_id).await {
                    return;
                }
                self.replies
                    .lock()
                    .await
                    .buffer_part(&part.session_id, &part.message_id, text);
            }
            HostEvent::Other(kind) => {
                debug!(kind = %kind, "Ignoring host event");
            }
        }
    }

    async fn handle_message_updated(&self, info: MessageInfo) {
        let session_id = info.session_id.clone();
        if self.resolve_session(&session_id).await != Resolution::Main {
            return;
        }
        if let (Some(provider), Some(model)) = (&info.provider_id, &info.model_id) {
            self.update_context_limit(&session_id, provider, model).await;
        }
        if info.role != MessageRole::Assistant || info.is_summary() {
            return;
        }

        let reply = {
            let mut replies = self.replies.lock().await;
            if !info.is_completed() {
                replies.track(&session_id, &info.id);
                return;
            }
            replies.finalize(&session_id, &info.id)
        };
        if let Some(text) = reply {
            if let Some(state) = self.sessions.lock().await.get_mut(&session_id) {
                state.pending_messages.push(format_assistant_message(&text));
            }
        }
    }

    async fn handle_compacted(&self, session_id: &str, summary: Option<String>) {
        if self.resolve_session(session_id).await != Resolution::Main {
            return;
        }
        let summary = match summary {
            Some(summary) => Some(summary),
            None => self.latest_summary(session_id).await,
        };
        let project_group = {
            let mut store = self.sessions.lock().await;
            let Some(state) = store.get_mut(session_id) else {
                return;
            };
            state.reset_after_compaction();
            state.project_group.clone()
        };
        match summary {
            Some(summary) => {
                persist_summary(self.graph.as_ref(), &summary, &project_group, Utc::now()).await;
            }
            None => debug!(session_id, "Compaction finished without a summary"),
        }
    }

    /// Text of the newest summary message the host holds for a session
    async fn latest_summary(&self, session_id: &str) -> Option<String> {
        match self.host.session_messages(session_id).await {
            Ok(messages) => messages
                .iter()
                .rev()
                .find(|m| m.info.is_summary())
                .map(|m| m.text())
                .filter(|t| !t.is_empty()),
            Err(e) => {
                warn!(session_id, "Fetching compaction summary failed: {}", e);
                None
            }
        }
    }

    /// Before compaction: flush everything, then append the memory digest
    pub async fn on_compacting(&self, session_id: &str, context: &mut Vec<String>) -> bool {
        if self.resolve_session(session_id).await != Resolution::Main {
            return false;
        }
        self.flush(session_id, COMPACTION_FLUSH_DESCRIPTION, 0).await;

        let (project_group, user_group, context_limit, last_user) = {
            let store = self.sessions.lock().await;
            let Some(state) = store.get(session_id) else {
                return false;
            };
            (
                state.project_group.clone(),
                state.user_group.clone(),
                state.context_limit,
                state.last_user_message.clone(),
            )
        };

        let mut query_context = context.clone();
        if query_context.len() < MIN_COMPACTION_CONTEXT {
            query_context.extend(last_user);
        }
        let budget = self
            .config
            .budget_for(context_limit, self.config.compaction_budget_percent);
        let user_group = self
            .config
            .include_user_scope
            .then_some(user_group.as_str());

        let builder =
            CompactionContextBuilder::new(self.graph.as_ref(), &self.config, &self.classifier);
        match builder
            .build(&query_context, &project_group, user_group, budget, Utc::now())
            .await
        {
            Some(digest) => {
                context.push(digest);
                true
            }
            None => false,
        }
    }

    pub async fn flush(
        &self,
        session_id: &str,
        description: &str,
        min_bytes: usize,
    ) -> FlushOutcome {
        FlushController::new(self.graph.as_ref(), self.host.as_ref(), &self.replies)
            .flush(&self.sessions, session_id, description, min_bytes)
            .await
    }

    /// Context window for a model; cached per provider and model
    pub async fn resolve_context_limit(&self, provider_id: &str, model_id: &str) -> usize {
        let key = (provider_id.to_string(), model_id.to_string());
        if let Some(limit) = self.model_limits.lock().await.get(&key) {
            return *limit;
        }
        match self.host.model_context_limit(provider_id, model_id).await {
            Ok(limit) => {
                let limit = limit.unwrap_or(DEFAULT_CONTEXT_LIMIT);
                self.model_limits.lock().await.insert(key, limit);
                limit
            }
            Err(e) => {
                warn!(provider_id, model_id, "Context limit lookup failed: {}", e);
                DEFAULT_CONTEXT_LIMIT
            }
        }
    }

    async fn update_context_limit(&self, session_id: &str, provider_id: &str, model_id: &str) {
        let limit = self.resolve_context_limit(provider_id, model_id).await;
        if let Some(state) = self.sessions.lock().await.get_mut(session_id) {
            state.context_limit = limit;
        }
    }
}
