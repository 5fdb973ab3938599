//! JSONL bridge between the host plugin and the memory engine
//!
//! The host forwards each hook invocation as one JSON-RPC request per line
//! on stdin. Requests are handled in arrival order, one at a time, and every
//! request with an id gets exactly one response line on stdout. Lines that
//! cannot be handled produce an error response; the loop never stops on bad
//! input, only on EOF or `shutdown`.

use crate::hooks::{ChatMessageInput, HostEvent, MemoryEngine, TurnOutcome};
use crate::host::{HostMessage, HostPart};
use crate::protocol::{bridge, error_codes, JsonRpcRequest, JsonRpcResponse};
use crate::Result;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize)]
struct ChatMessageParams {
    input: ChatMessageInput,
    #[serde(default)]
    parts: Vec<HostPart>,
}

#[derive(Debug, Deserialize)]
struct EventParams {
    event: Value,
}

#[derive(Debug, Deserialize)]
struct CompactingParams {
    #[serde(rename = "sessionID")]
    session_id: String,
    #[serde(default)]
    context: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct TransformParams {
    #[serde(rename = "sessionID")]
    session_id: String,
    #[serde(default)]
    messages: Vec<HostMessage>,
}

/// What to do after a line was handled
#[derive(Debug)]
pub struct Dispatch {
    pub response: Option<JsonRpcResponse>,
    pub shutdown: bool,
}

impl Dispatch {
    fn reply(response: JsonRpcResponse) -> Self {
        Self {
            response: Some(response),
            shutdown: false,
        }
    }
}

fn outcome_label(outcome: TurnOutcome) -> &'static str {
    match outcome {
        TurnOutcome::Skipped => "skipped",
        TurnOutcome::Buffered => "buffered",
        TurnOutcome::Injected { .. } => "injected",
        TurnOutcome::Deferred { .. } => "deferred",
    }
}

/// Dispatches bridge requests to the engine
pub struct Interceptor {
    engine: Arc<MemoryEngine>,
}

impl Interceptor {
    pub fn new(engine: Arc<MemoryEngine>) -> Self {
        Self { engine }
    }

    /// Serve requests from `reader` until EOF or `shutdown`
    pub async fn run<R, W>(&self, reader: R, mut writer: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = reader.lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            debug!("From host: {}", preview(&line));

            let dispatch = self.handle_line(&line).await;
            if let Some(response) = dispatch.response {
                let mut encoded = serde_json::to_string(&response)?;
                encoded.push('\n');
                writer.write_all(encoded.as_bytes()).await?;
                writer.flush().await?;
            }
            if dispatch.shutdown {
                info!("Shutdown requested by host");
                break;
            }
        }
        Ok(())
    }

    /// Handle one line of input
    pub async fn handle_line(&self, line: &str) -> Dispatch {
        let value: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(e) => {
                warn!("Unparsable line from host: {}", e);
                return Dispatch::reply(JsonRpcResponse::failure(
                    None,
                    error_codes::PARSE_ERROR,
                    format!("parse error: {e}"),
                ));
            }
        };
        let id = value.get("id").cloned();
        let request: JsonRpcRequest = match serde_json::from_value(value) {
            Ok(request) => request,
            Err(e) => {
                return Dispatch::reply(JsonRpcResponse::failure(
                    id,
                    error_codes::INVALID_REQUEST,
                    format!("invalid request: {e}"),
                ));
            }
        };

        let id = request.id.clone();
        let shutdown = request.method == bridge::SHUTDOWN;
        let result = self.dispatch(&request).await;

        // Notifications get no reply, errors included
        let response = id.is_some().then(|| match result {
            Ok(result) => JsonRpcResponse::success(id, result),
            Err(error) => JsonRpcResponse::failure(id, error.code, error.message),
        });
        Dispatch { response, shutdown }
    }

    async fn dispatch(&self, request: &JsonRpcRequest) -> std::result::Result<Value, BridgeError> {
        match request.method.as_str() {
            bridge::CHAT_MESSAGE => {
                let mut params: ChatMessageParams = params(request)?;
                let outcome = self
                    .engine
                    .on_chat_message(&params.input, &mut params.parts)
                    .await;
                Ok(json!({
                    "outcome": outcome_label(outcome),
                    "parts": params.parts,
                }))
            }
            bridge::EVENT => {
                let params: EventParams = params(request)?;
                let event = HostEvent::from_value(params.event)
                    .map_err(|e| BridgeError::invalid_params(e.to_string()))?;
                self.engine.on_event(event).await;
                Ok(json!({}))
            }
            bridge::COMPACTING => {
                let mut params: CompactingParams = params(request)?;
                let added = self
                    .engine
                    .on_compacting(&params.session_id, &mut params.context)
                    .await;
                Ok(json!({
                    "added": added,
                    "context": params.context,
                }))
            }
            bridge::TRANSFORM => {
                let mut params: TransformParams = params(request)?;
                let applied = self
                    .engine
                    .on_transform(&params.session_id, &mut params.messages)
                    .await;
                Ok(json!({
                    "applied": applied,
                    "messages": params.messages,
                }))
            }
            bridge::SHUTDOWN => Ok(Value::Null),
            other => Err(BridgeError {
                code: error_codes::METHOD_NOT_FOUND,
                message: format!("unknown method: {other}"),
            }),
        }
    }
}

#[derive(Debug)]
struct BridgeError {
    code: i32,
    message: String,
}

impl BridgeError {
    fn invalid_params(message: impl Into<String>) -> Self {
        Self {
            code: error_codes::INVALID_PARAMS,
            message: message.into(),
        }
    }
}

fn params<T: DeserializeOwned>(request: &JsonRpcRequest) -> std::result::Result<T, BridgeError> {
    let value = request.params.clone().unwrap_or(Value::Null);
    serde_json::from_value(value)
        .map_err(|e| BridgeError::invalid_params(format!("{}: {e}", request.method)))
}

fn preview(line: &str) -> &str {
    match line.char_indices().nth(100) {
        Some((idx, _)) => &line[..idx],
        None => line,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{EntityNode, Episode, Fact, GraphClient};
    use crate::host::HostClient;
    use crate::MemoryConfig;
    use async_trait::async_trait;
    use std::path::PathBuf;

    struct EmptyGraph;

    #[async_trait]
    impl GraphClient for EmptyGraph {
        async fn search_facts(&self, _: &str, _: &[String], _: usize) -> Result<Vec<Fact>> {
            Ok(Vec::new())
        }
        async fn search_entities(
            &self,
            _: &str,
            _: &[String],
            _: usize,
        ) -> Result<Vec<EntityNode>> {
            Ok(Vec::new())
        }
        async fn get_episodes(&self, _: &str, _: usize) -> Result<Vec<Episode>> {
            Ok(Vec::new())
        }
        async fn add_episode(&self, _: &str, _: &str, _: &str, _: &str, _: &str) -> Result<()> {
            Ok(())
        }
    }

    struct TopLevelHost;

    #[async_trait]
    impl HostClient for TopLevelHost {
        async fn session_parent(&self, _: &str) -> Result<Option<String>> {
            Ok(None)
        }
        async fn session_messages(&self, _: &str) -> Result<Vec<HostMessage>> {
            Ok(Vec::new())
        }
        async fn model_context_limit(&self, _: &str, _: &str) -> Result<Option<usize>> {
            Ok(None)
        }
    }

    fn interceptor() -> Interceptor {
        let engine = MemoryEngine::new(
            MemoryConfig::new(PathBuf::from("/work/demo")),
            Arc::new(EmptyGraph),
            Arc::new(TopLevelHost),
        );
        Interceptor::new(Arc::new(engine))
    }

    fn error_code(dispatch: &Dispatch) -> Option<i32> {
        dispatch
            .response
            .as_ref()
            .and_then(|r| r.error.as_ref())
            .map(|e| e.code)
    }

    #[tokio::test]
    async fn test_error_codes() {
        let bridge = interceptor();
        assert_eq!(
            error_code(&bridge.handle_line("{not json").await),
            Some(error_codes::PARSE_ERROR)
        );
        assert_eq!(
            error_code(&bridge.handle_line(r#"{"id":1,"method":"hook/nope"}"#).await),
            Some(error_codes::METHOD_NOT_FOUND)
        );
        let missing_session = r#"{"id":2,"method":"hook/compacting","params":{}}"#;
        assert_eq!(
            error_code(&bridge.handle_line(missing_session).await),
            Some(error_codes::INVALID_PARAMS)
        );
        assert_eq!(
            error_code(&bridge.handle_line(r#"{"id":3}"#).await),
            Some(error_codes::INVALID_REQUEST)
        );
    }

    #[tokio::test]
    async fn test_notification_gets_no_reply() {
        let bridge = interceptor();
        let line = json!({
            "method": "hook/event",
            "params": {
                "event": {"type": "session.created", "properties": {"info": {"id": "s1"}}}
            }
        })
        .to_string();
        let dispatch = bridge.handle_line(&line).await;
        assert!(dispatch.response.is_none());
        assert!(!dispatch.shutdown);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let bridge = interceptor();
        let chat = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "hook/chatMessage",
            "params": {
                "input": {"sessionID": "s1"},
                "parts": [{"type": "text", "text": "hello"}]
            }
        });
        let input = format!(
            "{chat}\n\n{}\n{}\n",
            r#"{"jsonrpc":"2.0","id":2,"method":"shutdown"}"#,
            r#"{"jsonrpc":"2.0","id":3,"method":"hook/event","params":{}}"#,
        );
        let mut output = Vec::new();
        bridge.run(input.as_bytes(), &mut output).await.unwrap();

        let lines: Vec<Value> = String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["id"], 1);
        assert_eq!(lines[0]["result"]["outcome"], "buffered");
        assert_eq!(lines[0]["result"]["parts"][0]["text"], "hello");
        assert_eq!(lines[1]["id"], 2);
    }
}
