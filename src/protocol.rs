//! Protocol definitions
//!
//! JSON-RPC envelopes shared by the MCP graph client and the host bridge,
//! plus the method and tool names both sides speak.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

/// MCP protocol revision sent during initialize
pub const MCP_PROTOCOL_VERSION: &str = "2025-03-26";

/// Header carrying the MCP session id on streamable HTTP
pub const MCP_SESSION_HEADER: &str = "mcp-session-id";

/// JSON-RPC request structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// JSON-RPC response structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

fn default_version() -> String {
    JSONRPC_VERSION.to_string()
}

/// Standard JSON-RPC error codes
pub mod error_codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
}

/// MCP methods used against the graph service
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "notifications/initialized";
    pub const TOOLS_CALL: &str = "tools/call";
}

/// Graph service tool names
pub mod tools {
    pub const SEARCH_FACTS: &str = "search_memory_facts";
    pub const SEARCH_NODES: &str = "search_nodes";
    pub const GET_EPISODES: &str = "get_episodes";
    pub const ADD_MEMORY: &str = "add_memory";
}

/// Methods the host sends over the JSONL bridge
pub mod bridge {
    pub const CHAT_MESSAGE: &str = "hook/chatMessage";
    pub const EVENT: &str = "hook/event";
    pub const COMPACTING: &str = "hook/compacting";
    pub const TRANSFORM: &str = "hook/transform";
    pub const SHUTDOWN: &str = "shutdown";
}

impl JsonRpcResponse {
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: default_version(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Option<Value>, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: default_version(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }
}

/// Create an MCP initialize request
pub fn create_initialize_request(id: u64, client_name: &str, version: &str) -> JsonRpcRequest {
    JsonRpcRequest {
        jsonrpc: default_version(),
        method: methods::INITIALIZE.to_string(),
        id: Some(Value::from(id)),
        params: Some(serde_json::json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": client_name,
                "version": version
            }
        })),
    }
}

/// Create the initialized notification sent after a successful initialize
pub fn create_initialized_notification() -> JsonRpcRequest {
    JsonRpcRequest {
        jsonrpc: default_version(),
        method: methods::INITIALIZED.to_string(),
        id: None,
        params: None,
    }
}

/// Create a tools/call request
pub fn create_tool_call_request(id: u64, tool: &str, arguments: Value) -> JsonRpcRequest {
    JsonRpcRequest {
        jsonrpc: default_version(),
        method: methods::TOOLS_CALL.to_string(),
        id: Some(Value::from(id)),
        params: Some(serde_json::json!({
            "name": tool,
            "arguments": arguments
        })),
    }
}

/// Pull the JSON-RPC message out of an SSE body (`data:` lines).
///
/// Returns the last `data:` payload that parses as a response carrying an id;
/// notifications interleaved on the stream are skipped.
pub fn extract_sse_response(body: &str) -> Option<JsonRpcResponse> {
    let mut found = None;
    let mut data = String::new();

    let flush = |data: &mut String, found: &mut Option<JsonRpcResponse>| {
        if data.is_empty() {
            return;
        }
        if let Ok(resp) = serde_json::from_str::<JsonRpcResponse>(data) {
            if resp.id.is_some() {
                *found = Some(resp);
            }
        }
        data.clear();
    };

    for line in body.lines() {
        let line = line.trim_end_matches('\r');
        if let Some(rest) = line.strip_prefix("data:") {
            if !data.is_empty() {
                data.push('\n');
            }
            data.push_str(rest.trim_start());
        } else if line.is_empty() {
            flush(&mut data, &mut found);
        }
    }
    flush(&mut data, &mut found);

    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_call_request_shape() {
        let req = create_tool_call_request(
            7,
            tools::SEARCH_FACTS,
            serde_json::json!({ "query": "auth", "max_facts": 5 }),
        );
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["jsonrpc"], "2.0");
        assert_eq!(json["method"], "tools/call");
        assert_eq!(json["id"], 7);
        assert_eq!(json["params"]["name"], "search_memory_facts");
        assert_eq!(json["params"]["arguments"]["max_facts"], 5);
    }

    #[test]
    fn test_notification_has_no_id() {
        let json = serde_json::to_value(create_initialized_notification()).unwrap();
        assert!(json.get("id").is_none());
        assert!(json.get("params").is_none());
    }

    #[test]
    fn test_extract_sse_response_skips_notifications() {
        let body = "event: message\n\
data: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\",\"params\":{}}\n\
\n\
event: message\n\
data: {\"jsonrpc\":\"2.0\",\"id\":3,\"result\":{\"ok\":true}}\n\
\n";
        let resp = extract_sse_response(body).unwrap();
        assert_eq!(resp.id, Some(Value::from(3)));
        assert_eq!(resp.result.unwrap()["ok"], true);
    }

    #[test]
    fn test_extract_sse_response_without_data() {
        assert!(extract_sse_response(": keep-alive\n\n").is_none());
    }
}
