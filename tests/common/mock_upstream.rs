//! Mock upstream MCP server for integration tests.
//!
//! Speaks just enough JSON-RPC over HTTP: initialize / initialized, ping,
//! tools/list, tools/call (an `add` tool and a `search` tool). Resource
//! and prompt listing answer -32601 so capability discovery records empty
//! sequences. An unauthorized variant answers 401 to everything.

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use serde_json::{json, Value};
use tokio::net::TcpListener;

#[derive(Clone)]
struct MockState {
    /// Prefixed to every tool result so tests can tell which server
    /// serviced a call.
    marker: String,
    unauthorized: bool,
}

pub struct MockUpstream {
    pub port: u16,
    pub url: String,
    handle: tokio::task::JoinHandle<()>,
}

impl Drop for MockUpstream {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

impl MockUpstream {
    /// Plain upstream; `marker` tags tool results ("" for none).
    pub async fn start(marker: &str) -> MockUpstream {
        Self::start_inner(marker, false).await
    }

    /// Upstream that rejects everything with 401.
    pub async fn start_unauthorized() -> MockUpstream {
        Self::start_inner("", true).await
    }

    async fn start_inner(marker: &str, unauthorized: bool) -> MockUpstream {
        let state = MockState {
            marker: marker.to_string(),
            unauthorized,
        };
        let router = Router::new()
            .route("/mcp", post(handle))
            .with_state(state);

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock upstream");
        let port = listener.local_addr().expect("local addr").port();
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });

        MockUpstream {
            port,
            url: format!("http://127.0.0.1:{}/mcp", port),
            handle,
        }
    }
}

async fn handle(State(state): State<MockState>, body: Bytes) -> Response {
    if state.unauthorized {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let message: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(_) => return StatusCode::BAD_REQUEST.into_response(),
    };

    let method = message.get("method").and_then(Value::as_str).unwrap_or("");
    let id = message.get("id").cloned();

    // Notifications get 202 and no body.
    let Some(id) = id else {
        return StatusCode::ACCEPTED.into_response();
    };

    let result = match method {
        "initialize" => json!({
            "protocolVersion": "2025-06-18",
            "capabilities": { "tools": {} },
            "serverInfo": { "name": "mock-upstream", "version": "0.0.0" }
        }),
        "ping" => json!({}),
        "tools/list" => json!({
            "tools": [
                {
                    "name": "add",
                    "description": "Add two integers",
                    "inputSchema": {
                        "type": "object",
                        "properties": {
                            "a": { "type": "integer" },
                            "b": { "type": "integer" }
                        },
                        "required": ["a", "b"]
                    }
                },
                {
                    "name": "search",
                    "description": "Canned search",
                    "inputSchema": {
                        "type": "object",
                        "properties": { "q": { "type": "string" } }
                    }
                }
            ]
        }),
        "tools/call" => {
            let params = message.get("params").cloned().unwrap_or_else(|| json!({}));
            let name = params.get("name").and_then(Value::as_str).unwrap_or("");
            let args = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
            match name {
                "add" => {
                    let a = args.get("a").and_then(Value::as_i64).unwrap_or(0);
                    let b = args.get("b").and_then(Value::as_i64).unwrap_or(0);
                    json!({
                        "content": [
                            { "type": "text", "text": format!("{}{}", state.marker, a + b) }
                        ]
                    })
                }
                "search" => json!({
                    "content": [ { "type": "text", "text": "X,Y,Z" } ]
                }),
                other => {
                    return rpc_error(&id, -32602, &format!("unknown tool {}", other));
                }
            }
        }
        // Not supported: discovery must record empty sequences.
        "resources/list" | "resources/templates/list" | "prompts/list" => {
            return rpc_error(&id, -32601, "method not found");
        }
        other => {
            return rpc_error(&id, -32601, &format!("method not found: {}", other));
        }
    };

    json_body(&json!({ "jsonrpc": "2.0", "id": id, "result": result }))
}

fn rpc_error(id: &Value, code: i64, message: &str) -> Response {
    json_body(&json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message }
    }))
}

fn json_body(value: &Value) -> Response {
    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        value.to_string(),
    )
        .into_response()
}
