use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// JSON-RPC error codes used on the wire.
pub const CODE_AUTH: i64 = -32600;
pub const CODE_METHOD_NOT_FOUND: i64 = -32601;
pub const CODE_INTERNAL: i64 = -32603;
pub const CODE_BAD_REQUEST: i64 = -32000;

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcRequest {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    #[serde(default)]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcResponse {
    pub fn result(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Option<Value>, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }

    pub fn error_with_data(
        id: Option<Value>,
        code: i64,
        message: impl Into<String>,
        data: Value,
    ) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: Some(data),
            }),
        }
    }
}

/// Wrap pretty JSON into the MCP tool-result content block.
pub fn tool_result_text(text: String) -> Value {
    serde_json::json!({
        "content": [{ "type": "text", "text": text }]
    })
}

/// True iff the body is a `tools/call` for a `tavily_*` tool, or a batch
/// containing at least one. Gates the preflight credit check.
pub fn has_tavily_tools_call(body: &Value) -> bool {
    match body {
        Value::Array(items) => items.iter().any(is_tavily_tools_call),
        other => is_tavily_tools_call(other),
    }
}

fn is_tavily_tools_call(item: &Value) -> bool {
    item.get("method").and_then(Value::as_str) == Some("tools/call")
        && item
            .pointer("/params/name")
            .and_then(Value::as_str)
            .is_some_and(|name| name.starts_with("tavily_"))
}

/// Tool definitions surfaced by `tools/list`.
pub fn tool_definitions() -> Value {
    serde_json::json!([
        {
            "name": "tavily_search",
            "description": "Web search via the Tavily API",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "Search query" },
                    "max_results": { "type": "number" },
                    "search_depth": { "type": "string", "enum": ["basic", "advanced"] }
                },
                "required": ["query"]
            }
        },
        {
            "name": "tavily_extract",
            "description": "Extract page content for a list of URLs via the Tavily API",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "urls": { "type": "array", "items": { "type": "string" } }
                },
                "required": ["urls"]
            }
        },
        {
            "name": "brave_web_search",
            "description": "Web search, routed across the configured providers",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "Search query" },
                    "count": { "type": "number", "description": "Results per page (1-20)" },
                    "offset": { "type": "number", "description": "Page offset (0-9)" }
                },
                "required": ["query"]
            }
        },
        {
            "name": "brave_local_search",
            "description": "Local search, routed across the configured providers",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "Search query" },
                    "count": { "type": "number" }
                },
                "required": ["query"]
            }
        }
    ])
}
