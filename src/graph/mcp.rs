//! MCP client for the graph memory service
//!
//! Speaks MCP over streamable HTTP: JSON-RPC requests are POSTed to one
//! endpoint and answered either as `application/json` or as an SSE stream.
//! Tool results are normalized here so the core never inspects wire shapes.

use super::{EntityNode, Episode, Fact, GraphClient, NodeRef};
use crate::protocol::{self, tools, JsonRpcRequest, JsonRpcResponse, MCP_SESSION_HEADER};
use crate::{MemoryError, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const MAX_CONNECT_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY_MS: u64 = 200;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CLIENT_NAME: &str = "graphiti-memory";
const SESSION_EXPIRED: &str = "session expired (404)";

/// MCP-over-HTTP graph client
pub struct McpGraphClient {
    client: Client,
    endpoint: String,
    session_id: RwLock<Option<String>>,
    initialized: AtomicBool,
    next_id: AtomicU64,
}

impl McpGraphClient {
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(Duration::from_secs(10))
            .user_agent(concat!("graphiti-memory/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| MemoryError::Graph(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            session_id: RwLock::new(None),
            initialized: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
        })
    }

    fn retry_backoff(attempt: u32) -> Duration {
        let exp = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(RETRY_BASE_DELAY_MS.saturating_mul(exp))
    }

    fn next_request_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Run the MCP initialize handshake, retrying with backoff.
    pub async fn connect(&self) -> Result<()> {
        let mut last_err = None;
        for attempt in 0..MAX_CONNECT_ATTEMPTS {
            if attempt > 0 {
                let delay = Self::retry_backoff(attempt);
                warn!(
                    "Graph service connect failed (attempt {}/{}), retrying in {:?}",
                    attempt, MAX_CONNECT_ATTEMPTS, delay
                );
                tokio::time::sleep(delay).await;
            }

            match self.initialize().await {
                Ok(()) => {
                    info!("Connected to graph service at {}", self.endpoint);
                    return Ok(());
                }
                Err(e) => last_err = Some(e),
            }
        }

        Err(last_err.unwrap_or_else(|| {
            MemoryError::Graph("all connect attempts exhausted".to_string())
        }))
    }

    async fn initialize(&self) -> Result<()> {
        self.initialized.store(false, Ordering::Release);
        *self.session_id.write().await = None;

        let request = protocol::create_initialize_request(
            self.next_request_id(),
            CLIENT_NAME,
            env!("CARGO_PKG_VERSION"),
        );
        let (response, session) = self.post(&request).await?;
        if let Some(err) = response.error {
            return Err(MemoryError::Graph(format!(
                "initialize rejected: {}",
                err.message
            )));
        }
        *self.session_id.write().await = session;

        self.notify(&protocol::create_initialized_notification())
            .await?;
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    async fn notify(&self, notification: &JsonRpcRequest) -> Result<()> {
        let response = self.request_builder().await.json(notification).send().await;
        let response = response.map_err(map_reqwest_error)?;
        if !response.status().is_success() {
            return Err(MemoryError::Graph(format!(
                "notification rejected with {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn request_builder(&self) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream");
        if let Some(session) = self.session_id.read().await.as_deref() {
            builder = builder.header(MCP_SESSION_HEADER, session);
        }
        builder
    }

    /// POST one request and decode the JSON-RPC reply
    async fn post(&self, request: &JsonRpcRequest) -> Result<(JsonRpcResponse, Option<String>)> {
        let response = self
            .request_builder()
            .await
            .json(request)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(MemoryError::Graph(SESSION_EXPIRED.to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MemoryError::Graph(format!(
                "graph service returned {status}: {}",
                truncate_detail(body.trim(), 300)
            )));
        }

        let session = response
            .headers()
            .get(MCP_SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let is_sse = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));

        let body = response.text().await.map_err(map_reqwest_error)?;
        let parsed = if is_sse {
            protocol::extract_sse_response(&body).ok_or_else(|| {
                MemoryError::Protocol("event stream carried no JSON-RPC response".to_string())
            })?
        } else {
            serde_json::from_str::<JsonRpcResponse>(&body)?
        };

        Ok((parsed, session))
    }

    /// Call a tool, reconnecting once if the MCP session expired.
    async fn call_tool(&self, tool: &str, arguments: Value) -> Result<Value> {
        if !self.initialized.load(Ordering::Acquire) {
            if let Err(e) = self.initialize().await {
                debug!("Graph service initialize before {} failed: {}", tool, e);
            }
        }

        let request =
            protocol::create_tool_call_request(self.next_request_id(), tool, arguments.clone());
        let response = match self.post(&request).await {
            Ok((response, _)) => response,
            Err(MemoryError::Graph(msg)) if msg == SESSION_EXPIRED => {
                warn!("Graph service session expired, reconnecting");
                self.initialize().await?;
                let retry =
                    protocol::create_tool_call_request(self.next_request_id(), tool, arguments);
                self.post(&retry).await?.0
            }
            Err(e) => return Err(e),
        };

        if let Some(err) = response.error {
            return Err(MemoryError::Graph(format!("{tool} failed: {}", err.message)));
        }
        tool_payload(response.result.unwrap_or(Value::Null))
    }
}

#[async_trait]
impl GraphClient for McpGraphClient {
    async fn search_facts(
        &self,
        query: &str,
        group_ids: &[String],
        max_facts: usize,
    ) -> Result<Vec<Fact>> {
        let payload = self
            .call_tool(
                tools::SEARCH_FACTS,
                serde_json::json!({
                    "query": query,
                    "group_ids": group_ids,
                    "max_facts": max_facts,
                }),
            )
            .await?;
        Ok(parse_facts(&payload))
    }

    async fn search_entities(
        &self,
        query: &str,
        group_ids: &[String],
        max_entities: usize,
    ) -> Result<Vec<EntityNode>> {
        let payload = self
            .call_tool(
                tools::SEARCH_NODES,
                serde_json::json!({
                    "query": query,
                    "group_ids": group_ids,
                    "max_nodes": max_entities,
                }),
            )
            .await?;
        Ok(parse_entities(&payload))
    }

    async fn get_episodes(&self, group_id: &str, last_n: usize) -> Result<Vec<Episode>> {
        let payload = self
            .call_tool(
                tools::GET_EPISODES,
                serde_json::json!({
                    "group_id": group_id,
                    "last_n": last_n,
                }),
            )
            .await?;
        Ok(parse_episodes(&payload))
    }

    async fn add_episode(
        &self,
        name: &str,
        body: &str,
        group_id: &str,
        source: &str,
        source_description: &str,
    ) -> Result<()> {
        self.call_tool(
            tools::ADD_MEMORY,
            serde_json::json!({
                "name": name,
                "episode_body": body,
                "group_id": group_id,
                "source": source,
                "source_description": source_description,
            }),
        )
        .await?;
        Ok(())
    }
}

fn map_reqwest_error(e: reqwest::Error) -> MemoryError {
    if e.is_timeout() {
        MemoryError::Graph(format!("timeout: {e}"))
    } else if e.is_connect() {
        MemoryError::Graph(format!("network: {e}"))
    } else {
        MemoryError::Graph(e.to_string())
    }
}

fn truncate_detail(detail: &str, max_chars: usize) -> String {
    if detail.chars().count() <= max_chars {
        return detail.to_string();
    }
    let mut truncated = detail.chars().take(max_chars).collect::<String>();
    truncated.push_str("... [truncated]");
    truncated
}

// ─── Result normalization ───────────────────────────────────────────

/// Unwrap a `tools/call` result into its JSON payload.
///
/// Payloads arrive as `structuredContent` or as JSON text inside the first
/// `content` item. `isError` or an `error` field becomes an error.
fn tool_payload(result: Value) -> Result<Value> {
    let first_text = result
        .get("content")
        .and_then(|c| c.as_array())
        .and_then(|items| {
            items
                .iter()
                .find_map(|item| item.get("text").and_then(|t| t.as_str()))
        })
        .map(String::from);

    if result.get("isError").and_then(|v| v.as_bool()) == Some(true) {
        return Err(MemoryError::Graph(
            first_text.unwrap_or_else(|| "tool reported an error".to_string()),
        ));
    }

    let structured = result
        .get("structuredContent")
        .filter(|v| !v.is_null())
        .cloned();
    let payload = match structured {
        Some(structured) => structured,
        None => match first_text {
            Some(text) => serde_json::from_str(&text).unwrap_or(Value::String(text)),
            None => result,
        },
    };

    if let Some(err) = payload.get("error") {
        let message = err
            .as_str()
            .map(String::from)
            .or_else(|| err.get("message").and_then(|m| m.as_str()).map(String::from))
            .unwrap_or_else(|| err.to_string());
        return Err(MemoryError::Graph(message));
    }

    Ok(payload)
}

/// Items of a list payload: a bare array, or an array under one of `keys`
/// (optionally nested under `result`). Anything else is empty.
fn list_items<'a>(payload: &'a Value, keys: &[&str]) -> &'a [Value] {
    if let Some(items) = payload.as_array() {
        return items;
    }
    let Some(obj) = payload.as_object() else {
        return &[];
    };
    for key in keys {
        if let Some(items) = obj.get(*key).and_then(|v| v.as_array()) {
            return items;
        }
    }
    match obj.get("result") {
        Some(inner) if inner.is_array() || inner.is_object() => list_items(inner, keys),
        _ => &[],
    }
}

#[derive(Debug, Deserialize)]
struct WireNodeRef {
    #[serde(alias = "id")]
    uuid: String,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct WireFact {
    #[serde(alias = "id")]
    uuid: String,
    #[serde(alias = "text")]
    fact: String,
    #[serde(default)]
    valid_at: Option<String>,
    #[serde(default)]
    invalid_at: Option<String>,
    #[serde(default)]
    source_node_uuid: Option<String>,
    #[serde(default)]
    source_node_name: Option<String>,
    #[serde(default)]
    target_node_uuid: Option<String>,
    #[serde(default)]
    target_node_name: Option<String>,
    #[serde(default)]
    source_node: Option<WireNodeRef>,
    #[serde(default)]
    target_node: Option<WireNodeRef>,
}

impl From<WireFact> for Fact {
    fn from(wire: WireFact) -> Self {
        let node = |nested: Option<WireNodeRef>, id: Option<String>, name: Option<String>| {
            nested
                .map(|n| NodeRef {
                    id: n.uuid,
                    name: n.name,
                })
                .or_else(|| {
                    id.map(|id| NodeRef {
                        id,
                        name: name.unwrap_or_default(),
                    })
                })
        };
        Fact {
            source: node(wire.source_node, wire.source_node_uuid, wire.source_node_name),
            target: node(wire.target_node, wire.target_node_uuid, wire.target_node_name),
            id: wire.uuid,
            text: wire.fact,
            valid_at: wire.valid_at,
            invalid_at: wire.invalid_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireNode {
    #[serde(alias = "id")]
    uuid: String,
    name: String,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    labels: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct WireEpisode {
    #[serde(alias = "id")]
    uuid: String,
    #[serde(default)]
    name: String,
    #[serde(default, alias = "episode_body", alias = "body")]
    content: String,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    source_description: Option<String>,
    #[serde(default)]
    created_at: Option<String>,
}

fn parse_facts(payload: &Value) -> Vec<Fact> {
    list_items(payload, &["facts"])
        .iter()
        .filter_map(|item| serde_json::from_value::<WireFact>(item.clone()).ok())
        .map(Fact::from)
        .collect()
}

fn parse_entities(payload: &Value) -> Vec<EntityNode> {
    list_items(payload, &["nodes", "entities"])
        .iter()
        .filter_map(|item| serde_json::from_value::<WireNode>(item.clone()).ok())
        .map(|n| EntityNode {
            id: n.uuid,
            name: n.name,
            summary: n.summary.filter(|s| !s.trim().is_empty()),
            labels: n.labels,
        })
        .collect()
}

fn parse_episodes(payload: &Value) -> Vec<Episode> {
    list_items(payload, &["episodes"])
        .iter()
        .filter_map(|item| serde_json::from_value::<WireEpisode>(item.clone()).ok())
        .map(|e| Episode {
            id: e.uuid,
            name: e.name,
            body: e.content,
            source: e.source,
            source_description: e.source_description,
            created_at: e.created_at,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_payload_from_text_content() {
        let result = json!({
            "content": [{
                "type": "text",
                "text": "{\"facts\": [{\"uuid\": \"f1\", \"fact\": \"A uses B\"}]}"
            }]
        });
        let payload = tool_payload(result).unwrap();
        let facts = parse_facts(&payload);
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].id, "f1");
        assert_eq!(facts[0].text, "A uses B");
    }

    #[test]
    fn test_payload_prefers_structured_content() {
        let result = json!({
            "content": [{ "type": "text", "text": "ignored" }],
            "structuredContent": {
                "result": { "nodes": [{ "uuid": "n1", "name": "Postgres", "summary": "" }] }
            }
        });
        let payload = tool_payload(result).unwrap();
        let nodes = parse_entities(&payload);
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].name, "Postgres");
        assert_eq!(nodes[0].summary, None);
    }

    #[test]
    fn test_is_error_and_error_field() {
        let result = json!({ "isError": true, "content": [{ "type": "text", "text": "boom" }] });
        assert!(matches!(tool_payload(result), Err(MemoryError::Graph(m)) if m == "boom"));

        let result = json!({ "structuredContent": { "error": "no such group" } });
        assert!(matches!(tool_payload(result), Err(MemoryError::Graph(m)) if m == "no such group"));
    }

    #[test]
    fn test_bare_array_and_unknown_shapes() {
        let payload = json!([
            { "uuid": "f1", "fact": "one", "source_node_uuid": "n1", "source_node_name": "A" },
            { "unexpected": true },
            { "id": "f2", "text": "two", "target_node": { "uuid": "n2", "name": "B" } }
        ]);
        let facts = parse_facts(&payload);
        assert_eq!(facts.len(), 2);
        assert_eq!(facts[0].source.as_ref().unwrap().id, "n1");
        assert_eq!(facts[1].target.as_ref().unwrap().name, "B");

        assert!(parse_facts(&json!("Facts retrieved")).is_empty());
        assert!(parse_facts(&json!({ "message": "nothing" })).is_empty());
    }

    #[test]
    fn test_parse_episodes() {
        let payload = json!({ "episodes": [{
            "uuid": "e1",
            "name": "Compaction summary",
            "content": "We chose Postgres",
            "source_description": "session snapshot",
            "created_at": "2026-01-01T00:00:00Z"
        }] });
        let episodes = parse_episodes(&payload);
        assert_eq!(episodes.len(), 1);
        assert_eq!(episodes[0].body, "We chose Postgres");
        assert!(episodes[0].created().is_some());
    }

    #[test]
    fn test_backoff_grows() {
        assert!(McpGraphClient::retry_backoff(2) > McpGraphClient::retry_backoff(1));
    }
}
