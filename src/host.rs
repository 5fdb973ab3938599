//! Host session/message query surface
//!
//! The agent host exposes its sessions over HTTP. The engine only needs three
//! things from it: a session's parent, a session's messages (for the assistant
//! fallback on flush), and a model's context window.

use crate::{MemoryError, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::debug;

/// Context window assumed when the host cannot tell us
pub const DEFAULT_CONTEXT_LIMIT: usize = 200_000;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageTime {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<i64>,
}

/// Message metadata as reported by the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageInfo {
    pub id: String,
    #[serde(rename = "sessionID", default)]
    pub session_id: String,
    pub role: MessageRole,
    #[serde(rename = "providerID", default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    #[serde(rename = "modelID", default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    /// `true` on the assistant message that carries a compaction summary
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<Value>,
    #[serde(default)]
    pub time: MessageTime,
}

impl MessageInfo {
    pub fn is_summary(&self) -> bool {
        self.summary.as_ref().and_then(|v| v.as_bool()) == Some(true)
    }

    pub fn is_completed(&self) -> bool {
        self.time.completed.is_some()
    }
}

/// One part of a message. Unknown fields round-trip untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostPart {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub synthetic: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl HostPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: "text".to_string(),
            text: Some(text.into()),
            synthetic: false,
            extra: Map::new(),
        }
    }

    /// A text part the host shows to the model but not as user input
    pub fn synthetic_text(text: impl Into<String>) -> Self {
        Self {
            synthetic: true,
            ..Self::text(text)
        }
    }

    pub fn is_text(&self) -> bool {
        self.kind == "text"
    }
}

/// A message with its parts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostMessage {
    pub info: MessageInfo,
    #[serde(default)]
    pub parts: Vec<HostPart>,
}

impl HostMessage {
    /// Text of all non-synthetic text parts, joined by newlines
    pub fn text(&self) -> String {
        joined_text(&self.parts)
    }
}

/// Join the user-visible text parts of a message
pub fn joined_text(parts: &[HostPart]) -> String {
    parts
        .iter()
        .filter(|p| p.is_text() && !p.synthetic)
        .filter_map(|p| p.text.as_deref())
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Queries the engine makes against the host
#[async_trait]
pub trait HostClient: Send + Sync {
    /// Parent session id, `None` for a top-level session
    async fn session_parent(&self, session_id: &str) -> Result<Option<String>>;

    async fn session_messages(&self, session_id: &str) -> Result<Vec<HostMessage>>;

    /// Context window in tokens, `None` if the host does not know the model
    async fn model_context_limit(&self, provider_id: &str, model_id: &str) -> Result<Option<usize>>;
}

/// `HostClient` over the host's HTTP API
pub struct HttpHostClient {
    client: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct SessionInfo {
    #[serde(rename = "parentID", default)]
    parent_id: Option<String>,
}

impl HttpHostClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| MemoryError::Host(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn get_json(&self, path: &str) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        debug!("Host GET {}", url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| MemoryError::Host(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(MemoryError::Host(format!("GET {path} returned {status}")));
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| MemoryError::Host(format!("GET {path}: {e}")))
    }
}

#[async_trait]
impl HostClient for HttpHostClient {
    async fn session_parent(&self, session_id: &str) -> Result<Option<String>> {
        let value = self.get_json(&format!("/session/{session_id}")).await?;
        let info: SessionInfo = serde_json::from_value(value)?;
        Ok(info.parent_id.filter(|p| !p.is_empty()))
    }

    async fn session_messages(&self, session_id: &str) -> Result<Vec<HostMessage>> {
        let value = self
            .get_json(&format!("/session/{session_id}/message"))
            .await?;
        let items = value.as_array().cloned().unwrap_or_default();
        Ok(items
            .into_iter()
            .filter_map(|item| serde_json::from_value::<HostMessage>(item).ok())
            .collect())
    }

    async fn model_context_limit(
        &self,
        provider_id: &str,
        model_id: &str,
    ) -> Result<Option<usize>> {
        let value = self.get_json("/config/providers").await?;
        Ok(context_limit_from_providers(&value, provider_id, model_id))
    }
}

/// Look up `providers[id == provider].models[model].limit.context`
fn context_limit_from_providers(value: &Value, provider_id: &str, model_id: &str) -> Option<usize> {
    let providers = value
        .get("providers")
        .and_then(|p| p.as_array())
        .or_else(|| value.as_array())?;
    providers
        .iter()
        .find(|p| p.get("id").and_then(|id| id.as_str()) == Some(provider_id))?
        .get("models")?
        .get(model_id)?
        .get("limit")?
        .get("context")?
        .as_u64()
        .filter(|limit| *limit > 0)
        .map(|limit| limit as usize)
}
