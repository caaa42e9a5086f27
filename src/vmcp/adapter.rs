//! Inbound MCP protocol adapter.
//!
//! Terminates JSON-RPC over HTTP for each vMCP. Two route shapes exist per
//! vMCP: the streamable form (answers with an SSE `message` frame when the
//! client accepts `text/event-stream`) and the plain JSON form. Every
//! inbound request yields exactly one response envelope and one usage-log
//! row.

use std::{collections::HashMap, sync::Arc};

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use dashmap::DashMap;
use serde_json::{json, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    app_context::AppContext,
    error::{GatewayError, GatewayResult},
    protocols::{
        jsonrpc::{JsonRpcError, JsonRpcId, JsonRpcMessage, JsonRpcRequest, JsonRpcResponse},
        mcp::{
            CallToolParams, GetPromptParams, Implementation, InitializeParams, InitializeResult,
            ListPromptsResult, ListResourceTemplatesResult, ListResourcesResult, ListToolsResult,
            ReadResourceParams, PROTOCOL_VERSION_LATEST, SUPPORTED_PROTOCOL_VERSIONS,
        },
    },
    store::UsageEntry,
    vmcp::{composer::Composer, context::InvocationContext},
};

const SESSION_ID_HEADER: &str = "mcp-session-id";
const ENV_OVERRIDE_HEADER: &str = "x-vmcp-env";

/// Inbound connection lifecycle, tracked per issued session id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    InitResponded,
    Ready,
}

/// Per-process adapter state: the session table shared by every vMCP
/// route.
#[derive(Default)]
pub struct McpAdapter {
    sessions: DashMap<String, ConnState>,
}

impl McpAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Service one decoded JSON-RPC message for one vMCP. `None` means the
    /// message was a notification and gets `202 Accepted`.
    pub async fn handle_message(
        &self,
        app: &AppContext,
        composer: &Composer,
        headers: &HeaderMap,
        message: JsonRpcMessage,
    ) -> Option<JsonRpcResponse> {
        match message {
            JsonRpcMessage::Request(request) => {
                Some(self.handle_request(app, composer, headers, request).await)
            }
            JsonRpcMessage::Notification(notification) => {
                if notification.method == "notifications/initialized" {
                    if let Some(session_id) = header_str(headers, SESSION_ID_HEADER) {
                        if let Some(mut state) = self.sessions.get_mut(session_id) {
                            *state = ConnState::Ready;
                        }
                    }
                }
                None
            }
            JsonRpcMessage::Response(_) => None,
        }
    }

    async fn handle_request(
        &self,
        app: &AppContext,
        composer: &Composer,
        headers: &HeaderMap,
        request: JsonRpcRequest,
    ) -> JsonRpcResponse {
        if request.jsonrpc != "2.0" {
            return JsonRpcResponse::err(
                request.id,
                JsonRpcError {
                    code: -32600,
                    message: "invalid jsonrpc version".to_string(),
                    data: None,
                },
            );
        }

        // Lifecycle enforcement applies only to clients that present a
        // session id we issued; stateless HTTP clients are tolerated.
        if let Some(session_id) = header_str(headers, SESSION_ID_HEADER) {
            if let Some(state) = self.sessions.get(session_id) {
                let gated = !matches!(request.method.as_str(), "initialize" | "ping");
                if gated && *state != ConnState::Ready {
                    return JsonRpcResponse::err(
                        request.id,
                        JsonRpcError {
                            code: -32002,
                            message: "not initialized".to_string(),
                            data: None,
                        },
                    );
                }
            }
        }

        let started_at = Utc::now();
        let started = std::time::Instant::now();
        let method = request.method.clone();
        let id = request.id.clone();

        let ctx = self.build_context(app, composer, headers);
        let outcome = self.dispatch(composer, &ctx, request).await;

        let (response, tool_name, server_name, outcome_label) = match outcome {
            Ok((result, tool_name)) => (
                JsonRpcResponse::ok(id, result),
                tool_name,
                None,
                "ok".to_string(),
            ),
            Err(e) => {
                let scrub = |text: &str| ctx.scrub_secrets(text);
                let data = e.error_data(scrub);
                debug!("request '{}' failed: {}", method, e.kind());
                let server = e.server().map(|s| s.to_string());
                (
                    JsonRpcResponse::err(
                        id,
                        JsonRpcError {
                            code: e.jsonrpc_code(),
                            message: ctx.scrub_secrets(&e.to_string()),
                            data: Some(data),
                        },
                    ),
                    None,
                    server,
                    e.kind().to_string(),
                )
            }
        };

        let entry = UsageEntry {
            id: Uuid::new_v4().to_string(),
            vmcp_id: composer.vmcp().id.clone(),
            method,
            tool_name,
            server_name,
            started_at,
            duration_ms: started.elapsed().as_millis() as u64,
            outcome: outcome_label,
        };
        if let Err(e) = app.usage_log.append(entry).await {
            warn!("usage log append failed: {}", e);
        }

        response
    }

    /// Route one request to the composer. Returns the result value plus
    /// the tool/prompt/resource name for the usage log.
    async fn dispatch(
        &self,
        composer: &Composer,
        ctx: &InvocationContext,
        request: JsonRpcRequest,
    ) -> GatewayResult<(Value, Option<String>)> {
        match request.method.as_str() {
            "initialize" => {
                let params: InitializeParams = parse_params(request.params)?;
                let negotiated = if SUPPORTED_PROTOCOL_VERSIONS
                    .contains(&params.protocol_version.as_str())
                {
                    params.protocol_version
                } else {
                    PROTOCOL_VERSION_LATEST.to_string()
                };

                let session_id = Uuid::new_v4().to_string();
                self.sessions
                    .insert(session_id.clone(), ConnState::InitResponded);

                let result = InitializeResult {
                    protocol_version: negotiated,
                    capabilities: json!({
                        "tools": { "listChanged": false },
                        "resources": {},
                        "prompts": {},
                    }),
                    server_info: Implementation {
                        name: "vmcp-gateway".to_string(),
                        version: env!("CARGO_PKG_VERSION").to_string(),
                    },
                    instructions: composer.vmcp().description.clone(),
                };
                let mut value = serde_json::to_value(result)
                    .map_err(|e| GatewayError::Internal(e.to_string()))?;
                // The transport layer surfaces this as the mcp-session-id
                // response header.
                value["_sessionId"] = json!(session_id);
                Ok((value, None))
            }
            "ping" => Ok((json!({}), None)),
            "tools/list" => {
                let tools = composer.list_tools(ctx).await?;
                let result = ListToolsResult {
                    tools,
                    next_cursor: None,
                };
                Ok((to_value(result)?, None))
            }
            "tools/call" => {
                let params: CallToolParams = parse_params(request.params)?;
                let args = params.arguments.unwrap_or_else(|| json!({}));
                let result = composer.call_tool(&params.name, args, ctx).await?;
                Ok((to_value(result)?, Some(params.name)))
            }
            "resources/list" => {
                let resources = composer.list_resources(ctx).await?;
                let result = ListResourcesResult {
                    resources,
                    next_cursor: None,
                };
                Ok((to_value(result)?, None))
            }
            "resources/templates/list" => {
                let resource_templates = composer.list_resource_templates(ctx).await?;
                let result = ListResourceTemplatesResult {
                    resource_templates,
                    next_cursor: None,
                };
                Ok((to_value(result)?, None))
            }
            "resources/read" => {
                let params: ReadResourceParams = parse_params(request.params)?;
                let result = composer.read_resource(&params.uri, ctx).await?;
                Ok((to_value(result)?, Some(params.uri)))
            }
            "prompts/list" => {
                let prompts = composer.list_prompts(ctx).await?;
                let result = ListPromptsResult {
                    prompts,
                    next_cursor: None,
                };
                Ok((to_value(result)?, None))
            }
            "prompts/get" => {
                let params: GetPromptParams = parse_params(request.params)?;
                let args = params.arguments.unwrap_or_else(|| json!({}));
                let result = composer.get_prompt(&params.name, args, ctx).await?;
                Ok((to_value(result)?, Some(params.name)))
            }
            // The system prompt is its own operation, always rendered
            // locally.
            "system_prompt/get" => {
                let args = request
                    .params
                    .and_then(|p| p.get("arguments").cloned())
                    .unwrap_or_else(|| json!({}));
                let text = composer.system_prompt(args, ctx).await?;
                Ok((json!({ "text": text }), None))
            }
            other => Err(GatewayError::MethodNotFound(other.to_string())),
        }
    }

    fn build_context(
        &self,
        app: &AppContext,
        composer: &Composer,
        headers: &HeaderMap,
    ) -> InvocationContext {
        let overrides = header_str(headers, ENV_OVERRIDE_HEADER)
            .and_then(|raw| serde_json::from_str::<HashMap<String, String>>(raw).ok());
        let env = composer.build_env(overrides.as_ref());
        InvocationContext::new(
            composer.vmcp().id.clone(),
            env,
            app.request_deadline(composer.vmcp()),
            app.template_max_depth(),
        )
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(params: Option<Value>) -> GatewayResult<T> {
    let value = params.unwrap_or_else(|| json!({}));
    serde_json::from_value(value).map_err(|e| GatewayError::BadArguments(e.to_string()))
}

fn to_value<T: serde::Serialize>(value: T) -> GatewayResult<Value> {
    serde_json::to_value(value).map_err(|e| GatewayError::Internal(e.to_string()))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|h| h.to_str().ok())
}

// ============================================================================
// Axum handlers
// ============================================================================

#[derive(Clone)]
pub struct AdapterState {
    pub app: Arc<AppContext>,
    pub adapter: Arc<McpAdapter>,
}

/// `POST /private/{vmcp_name}/vmcp` — streamable form.
pub async fn handle_streamable(
    State(state): State<AdapterState>,
    Path(vmcp_name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    serve(state, vmcp_name, headers, body, true).await
}

/// `POST /private/{vmcp_name}/rpc` — plain JSON-RPC over HTTP.
pub async fn handle_rpc(
    State(state): State<AdapterState>,
    Path(vmcp_name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    serve(state, vmcp_name, headers, body, false).await
}

async fn serve(
    state: AdapterState,
    vmcp_name: String,
    headers: HeaderMap,
    body: Bytes,
    streamable: bool,
) -> Response {
    let message: JsonRpcMessage = match serde_json::from_slice(&body) {
        Ok(message) => message,
        Err(e) => {
            let response = JsonRpcResponse::err(
                JsonRpcId::Number(0),
                JsonRpcError {
                    code: -32700,
                    message: format!("parse error: {}", e),
                    data: None,
                },
            );
            return json_response(StatusCode::BAD_REQUEST, &response);
        }
    };

    let composer = match state.app.composer_for_name(&vmcp_name).await {
        Ok(composer) => composer,
        Err(e) => {
            let id = match &message {
                JsonRpcMessage::Request(r) => r.id.clone(),
                _ => JsonRpcId::Number(0),
            };
            let response = JsonRpcResponse::err(
                id,
                JsonRpcError {
                    code: e.jsonrpc_code(),
                    message: e.to_string(),
                    data: Some(e.error_data(|s| s.to_string())),
                },
            );
            return json_response(StatusCode::NOT_FOUND, &response);
        }
    };

    match state
        .adapter
        .handle_message(&state.app, &composer, &headers, message)
        .await
    {
        None => StatusCode::ACCEPTED.into_response(),
        Some(mut response) => {
            // Session id issued by initialize travels back as a header.
            let session_id = response
                .result
                .as_mut()
                .and_then(|r| r.as_object_mut())
                .and_then(|o| o.remove("_sessionId"))
                .and_then(|v| v.as_str().map(|s| s.to_string()));

            let wants_sse = streamable
                && header_str(&headers, header::ACCEPT.as_str())
                    .map(|accept| accept.contains("text/event-stream"))
                    .unwrap_or(false);

            let mut http_response = if wants_sse {
                sse_response(&response)
            } else {
                json_response(StatusCode::OK, &response)
            };
            if let Some(session_id) = session_id {
                if let Ok(value) = header::HeaderValue::from_str(&session_id) {
                    http_response
                        .headers_mut()
                        .insert(SESSION_ID_HEADER, value);
                }
            }
            http_response
        }
    }
}

fn json_response(status: StatusCode, response: &JsonRpcResponse) -> Response {
    let body = serde_json::to_string(response).unwrap_or_else(|_| "{}".to_string());
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response()
}

/// One-frame SSE body: `event: message\ndata: <json>\n\n`.
fn sse_response(response: &JsonRpcResponse) -> Response {
    let payload = serde_json::to_string(response).unwrap_or_else(|_| "{}".to_string());
    let body = format!("event: message\ndata: {}\n\n", payload);
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/event-stream")],
        body,
    )
        .into_response()
}
