use super::context::RequestContext;
use super::protocol::{
    self, has_tavily_tools_call, tool_definitions, tool_result_text, JsonRpcRequest,
    JsonRpcResponse, CODE_BAD_REQUEST, CODE_METHOD_NOT_FOUND, PROTOCOL_VERSION,
};
use crate::crypto;
use crate::error::BridgeError;
use crate::normalize;
use crate::pool::Preflight;
use crate::routing::SearchKind;
use crate::server::BridgeState;
use crate::store::UsageOutcome;
use crate::upstream::{SearchRequest, TavilyOp};
use crate::usage::ToolCallLog;
use serde_json::Value;
use tracing::{debug, warn};

/// Transport-agnostic view of one MCP HTTP exchange. The hyper layer and
/// the test suite both build this directly.
#[derive(Debug, Default)]
pub struct McpHttpRequest {
    pub method: String,
    pub authorization: Option<String>,
    pub session_id: Option<String>,
    pub accept: Option<String>,
    /// Per-request routing override, from `x-search-source-mode`.
    pub mode_override: Option<String>,
    pub body: bytes::Bytes,
}

#[derive(Debug)]
pub struct McpHttpResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub body: String,
    /// Set on `initialize`, echoed as the `mcp-session-id` header.
    pub session_id: Option<String>,
}

const CONTENT_JSON: &str = "application/json";
const CONTENT_SSE: &str = "text/event-stream";

const KNOWN_TOOLS: &[&str] = &[
    "tavily_search",
    "tavily_extract",
    "brave_web_search",
    "brave_local_search",
];

/// Entry point for both transports: authenticate, dispatch, frame.
pub async fn handle_http(state: &BridgeState, req: McpHttpRequest) -> McpHttpResponse {
    match req.method.as_str() {
        "GET" => handle_get(&req),
        "POST" => handle_post(state, req).await,
        _ => plain_error(405, "method not allowed"),
    }
}

fn handle_get(req: &McpHttpRequest) -> McpHttpResponse {
    // The bridge only emits SSE as reply framing on POST; a bare
    // event-stream subscription has nothing to stream.
    if accepts_only_sse(req.accept.as_deref()) {
        return plain_error(405, "SSE subscription not supported, POST JSON-RPC instead");
    }
    McpHttpResponse {
        status: 200,
        content_type: CONTENT_JSON,
        body: serde_json::json!({
            "name": "tavily-bridge",
            "version": env!("CARGO_PKG_VERSION"),
            "protocolVersion": PROTOCOL_VERSION,
        })
        .to_string(),
        session_id: None,
    }
}

async fn handle_post(state: &BridgeState, req: McpHttpRequest) -> McpHttpResponse {
    let sse = prefers_sse(req.accept.as_deref());

    // Authentication precedes any body inspection.
    let ctx = match authenticate(state, req.authorization.as_deref()).await {
        Ok(ctx) => ctx,
        Err(e) => {
            metrics::counter!("bridge_mcp_auth_failures_total").increment(1);
            let resp = JsonRpcResponse::error(None, e.rpc_code(), e.to_string());
            return framed(e.http_status(), &resp_json(&resp), sse, None);
        }
    };

    let body: Value = match serde_json::from_slice(&req.body) {
        Ok(v) => v,
        Err(_) => {
            let resp =
                JsonRpcResponse::error(None, CODE_BAD_REQUEST, "Bad Request: malformed JSON");
            return framed(400, &resp_json(&resp), sse, None);
        }
    };

    // Preflight the Provider-T credit pool before burning a tool call.
    if has_tavily_tools_call(&body) {
        if let Some(pool) = &state.tavily_pool {
            match pool.preflight().await {
                Preflight::Ok => {}
                Preflight::NoKeys => {
                    let resp = JsonRpcResponse::error(
                        None,
                        CODE_BAD_REQUEST,
                        "No keys configured",
                    );
                    return framed(503, &resp_json(&resp), sse, None);
                }
                Preflight::QuotaExhausted { retry_after_ms } => {
                    let resp = JsonRpcResponse::error_with_data(
                        None,
                        CODE_BAD_REQUEST,
                        "Upstream quota exhausted",
                        serde_json::json!({ "retryAfterMs": retry_after_ms }),
                    );
                    return framed(429, &resp_json(&resp), sse, None);
                }
                Preflight::Unavailable { retry_after_ms } => {
                    let resp = JsonRpcResponse::error_with_data(
                        None,
                        CODE_BAD_REQUEST,
                        "Upstream temporarily unavailable",
                        serde_json::json!({ "retryAfterMs": retry_after_ms }),
                    );
                    return framed(503, &resp_json(&resp), sse, None);
                }
            }
        }
    }

    let mode_override = req.mode_override.as_deref();
    match body {
        Value::Array(items) => {
            if items.is_empty() {
                let resp =
                    JsonRpcResponse::error(None, CODE_BAD_REQUEST, "Bad Request: empty batch");
                return framed(400, &resp_json(&resp), sse, None);
            }
            let mut responses = Vec::with_capacity(items.len());
            let mut session_id = None;
            for item in items {
                let (resp, _status, minted) =
                    dispatch_element(state, &ctx, item, req.session_id.as_deref(), mode_override)
                        .await;
                if minted.is_some() {
                    session_id = minted;
                }
                responses.push(resp);
            }
            let body = serde_json::to_string(&responses).unwrap_or_else(|_| "[]".into());
            framed(200, &body, sse, session_id)
        }
        single => {
            let (resp, status, minted) =
                dispatch_element(state, &ctx, single, req.session_id.as_deref(), mode_override)
                    .await;
            framed(status, &resp_json(&resp), sse, minted)
        }
    }
}

/// Dispatch one JSON-RPC element. Returns the response, its standalone HTTP
/// status, and a freshly minted session id for `initialize`.
async fn dispatch_element(
    state: &BridgeState,
    ctx: &RequestContext,
    element: Value,
    session_id: Option<&str>,
    mode_override: Option<&str>,
) -> (JsonRpcResponse, u16, Option<String>) {
    let request: JsonRpcRequest = match serde_json::from_value(element) {
        Ok(r) => r,
        Err(_) => {
            return (
                JsonRpcResponse::error(None, CODE_BAD_REQUEST, "Bad Request: invalid request"),
                400,
                None,
            )
        }
    };
    let id = request.id.clone();

    match request.method.as_str() {
        "initialize" => {
            let minted = state.sessions.create();
            debug!("mcp: session initialized, session={}", minted);
            let result = serde_json::json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": { "tools": {} },
                "serverInfo": {
                    "name": "tavily-bridge",
                    "version": env!("CARGO_PKG_VERSION"),
                },
            });
            (JsonRpcResponse::result(id, result), 200, Some(minted))
        }
        method => {
            // Everything past initialize runs inside a session.
            match session_id {
                None => {
                    return (
                        JsonRpcResponse::error(
                            id,
                            CODE_BAD_REQUEST,
                            "Bad Request: No valid session ID provided",
                        ),
                        400,
                        None,
                    )
                }
                Some(sid) if !state.sessions.touch(sid) => {
                    return (
                        JsonRpcResponse::error(id, CODE_BAD_REQUEST, "Session not found"),
                        400,
                        None,
                    )
                }
                Some(_) => {}
            }

            match method {
                "tools/list" => (
                    JsonRpcResponse::result(
                        id,
                        serde_json::json!({ "tools": tool_definitions() }),
                    ),
                    200,
                    None,
                ),
                "tools/call" => {
                    let (resp, status) =
                        handle_tools_call(state, ctx, id, request.params, mode_override).await;
                    (resp, status, None)
                }
                other => (
                    JsonRpcResponse::error(
                        id,
                        CODE_METHOD_NOT_FOUND,
                        format!("Method not found: {other}"),
                    ),
                    400,
                    None,
                ),
            }
        }
    }
}

async fn handle_tools_call(
    state: &BridgeState,
    ctx: &RequestContext,
    id: Option<Value>,
    params: Option<Value>,
    mode_override: Option<&str>,
) -> (JsonRpcResponse, u16) {
    let params = params.unwrap_or(Value::Null);
    let Some(name) = params.get("name").and_then(Value::as_str) else {
        return (
            JsonRpcResponse::error(id, CODE_BAD_REQUEST, "Bad Request: missing tool name"),
            400,
        );
    };
    let name = name.to_string();
    if !KNOWN_TOOLS.contains(&name.as_str()) {
        return (
            JsonRpcResponse::error(id, CODE_METHOD_NOT_FOUND, format!("Unknown tool: {name}")),
            400,
        );
    }
    let args = params
        .get("arguments")
        .cloned()
        .unwrap_or_else(|| Value::Object(Default::default()));

    let outcome = dispatch_tool(state, &name, &args, mode_override).await;

    let query = args.get("query").and_then(Value::as_str);
    match outcome {
        Ok((result, key_id)) => {
            state.usage.log_tool_call(
                ctx,
                ToolCallLog {
                    tool_name: &name,
                    outcome: UsageOutcome::Success,
                    upstream_key_id: key_id,
                    query,
                    args: &args,
                    error_message: None,
                },
            );
            record_tool_metrics(&name, 200);
            (JsonRpcResponse::result(id, result), 200)
        }
        Err(e) => {
            warn!("mcp: tool call failed, tool={}, error={}", name, e);
            state.usage.log_tool_call(
                ctx,
                ToolCallLog {
                    tool_name: &name,
                    outcome: UsageOutcome::Error,
                    upstream_key_id: None,
                    query,
                    args: &args,
                    error_message: Some(e.to_string()),
                },
            );
            let status = e.http_status();
            record_tool_metrics(&name, status);
            let code = match e {
                BridgeError::BadRequest(_) => CODE_BAD_REQUEST,
                _ => protocol::CODE_INTERNAL,
            };
            (JsonRpcResponse::error(id, code, e.to_string()), status)
        }
    }
}

/// Route a tool by name: `tavily_*` goes straight to Provider-T, `brave_*`
/// through the mode resolver.
async fn dispatch_tool(
    state: &BridgeState,
    name: &str,
    args: &Value,
    mode_override: Option<&str>,
) -> Result<(Value, Option<String>), BridgeError> {
    match name {
        "tavily_search" | "tavily_extract" => {
            let Some(tavily) = &state.tavily else {
                return Err(BridgeError::UpstreamUnavailable);
            };
            let op = if name == "tavily_search" {
                require_query(args)?;
                TavilyOp::Search
            } else {
                TavilyOp::Extract
            };
            let outcome = tavily.invoke(op, args).await?;
            let text = serde_json::to_string_pretty(&outcome.body)
                .unwrap_or_else(|_| "{}".to_string());
            Ok((tool_result_text(text), outcome.key_id))
        }
        "brave_web_search" | "brave_local_search" => {
            let kind = if name == "brave_web_search" {
                SearchKind::Web
            } else {
                SearchKind::Local
            };
            let req = search_request_from_args(args)?;
            let routed = state.router.search(kind, &req, mode_override).await?;
            let text = normalize::to_pretty_json(&routed.results);
            Ok((tool_result_text(text), routed.key_id))
        }
        other => Err(BridgeError::BadRequest(format!("Unknown tool: {other}"))),
    }
}

fn require_query(args: &Value) -> Result<(), BridgeError> {
    match args.get("query").and_then(Value::as_str) {
        Some(q) if !q.trim().is_empty() => Ok(()),
        _ => Err(BridgeError::BadRequest(
            "Bad Request: query is required".into(),
        )),
    }
}

fn search_request_from_args(args: &Value) -> Result<SearchRequest, BridgeError> {
    require_query(args)?;
    let query = args.get("query").and_then(Value::as_str).unwrap_or_default();

    let mut req = SearchRequest::new(query);
    req.count = args.get("count").and_then(Value::as_i64);
    req.offset = args.get("offset").and_then(Value::as_i64);
    if let Value::Object(map) = args {
        for (k, v) in map {
            if !matches!(k.as_str(), "query" | "count" | "offset") {
                req.extra.insert(k.clone(), v.clone());
            }
        }
    }
    Ok(req)
}

/// `Authorization: Bearer <prefix>.<secret>` → `RequestContext`.
async fn authenticate(
    state: &BridgeState,
    header: Option<&str>,
) -> Result<RequestContext, BridgeError> {
    let header = header.ok_or_else(|| BridgeError::Auth("missing bearer token".into()))?;
    let token = header
        .strip_prefix("Bearer ")
        .or_else(|| header.strip_prefix("bearer "))
        .ok_or_else(|| BridgeError::Auth("malformed authorization header".into()))?
        .trim();

    let (prefix, secret) = token
        .split_once('.')
        .ok_or_else(|| BridgeError::Auth("malformed token".into()))?;

    let record = state
        .store
        .find_token_by_prefix(prefix)
        .await
        .map_err(|e| BridgeError::Internal(e.to_string()))?
        .ok_or_else(|| BridgeError::Auth("unknown token".into()))?;

    if !record.is_usable(crate::store::unix_ms()) {
        return Err(BridgeError::Auth("token revoked or expired".into()));
    }

    let presented = crypto::sha256_hex(secret);
    if !crypto::constant_time_eq(presented.as_bytes(), record.secret_hash.as_bytes()) {
        return Err(BridgeError::Auth("invalid token".into()));
    }

    Ok(RequestContext::new(record.id, record.prefix, token))
}

fn record_tool_metrics(tool: &str, status: u16) {
    let mut buf = itoa::Buffer::new();
    let status_str = buf.format(status);
    metrics::counter!(
        "bridge_mcp_tool_calls_total",
        "tool" => tool.to_string(),
        "status_code" => status_str.to_owned(),
    )
    .increment(1);
}

fn resp_json(resp: &JsonRpcResponse) -> String {
    serde_json::to_string(resp).unwrap_or_else(|_| "{}".into())
}

/// Frame a reply as plain JSON or a line-framed SSE message.
fn framed(status: u16, body: &str, sse: bool, session_id: Option<String>) -> McpHttpResponse {
    if sse {
        McpHttpResponse {
            status,
            content_type: CONTENT_SSE,
            body: format!("event: message\ndata: {body}\n\n"),
            session_id,
        }
    } else {
        McpHttpResponse {
            status,
            content_type: CONTENT_JSON,
            body: body.to_string(),
            session_id,
        }
    }
}

fn plain_error(status: u16, message: &str) -> McpHttpResponse {
    McpHttpResponse {
        status,
        content_type: CONTENT_JSON,
        body: serde_json::json!({ "error": message }).to_string(),
        session_id: None,
    }
}

/// SSE framing is used only when the client asks for event-stream without
/// also accepting JSON.
fn prefers_sse(accept: Option<&str>) -> bool {
    accepts_only_sse(accept)
}

fn accepts_only_sse(accept: Option<&str>) -> bool {
    match accept {
        Some(a) => a.contains("text/event-stream") && !a.contains("application/json"),
        None => false,
    }
}
