//! Upstream session: one logical channel to one upstream MCP server.
//!
//! HTTP sessions are plain request/response JSON-RPC. SSE sessions hold a
//! long-lived event stream for server-to-client messages and POST to the
//! advertised endpoint for client-to-server traffic; responses are matched
//! back to callers by JSON-RPC id through a correlation table. A failed
//! operation triggers at most one implicit reconnect.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use dashmap::DashMap;
use futures_util::StreamExt;
use parking_lot::Mutex;
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue, ACCEPT},
    StatusCode,
};
use serde_json::{json, Value};
use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    protocols::{
        jsonrpc::{JsonRpcId, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse},
        mcp::{
            CallToolResult, GetPromptResult, Implementation, InitializeParams, InitializeResult,
            Prompt, ReadResourceResult, Resource, ResourceTemplate, Tool,
            PROTOCOL_VERSION_LATEST,
        },
    },
    upstream::{
        auth::AuthState,
        error::{UpstreamError, UpstreamResult},
        inventory::CapabilitySnapshot,
        sse::SseDecoder,
        TransportKind, UpstreamServerConfig,
    },
    vmcp::context::{Interrupted, InvocationContext},
};

const SESSION_ID_HEADER: &str = "mcp-session-id";
const PROTOCOL_VERSION_HEADER: &str = "mcp-protocol-version";
const JSONRPC_METHOD_NOT_FOUND: i64 = -32601;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    AuthRequired,
    Error,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Disconnected => "disconnected",
            SessionState::AuthRequired => "auth_required",
            SessionState::Error => "error",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct SessionLimits {
    pub max_concurrency: usize,
    pub queue_bound: usize,
    pub heartbeat_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_concurrency: 16,
            queue_bound: 64,
            heartbeat_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// State shared with the SSE reader task.
struct Shared {
    server_name: String,
    state: Mutex<SessionState>,
    last_error: Mutex<Option<String>>,
    on_capabilities_changed: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

impl Shared {
    fn set_state(&self, state: SessionState) {
        *self.state.lock() = state;
    }

    fn fail(&self, detail: String) {
        warn!("upstream '{}' errored: {}", self.server_name, detail);
        *self.last_error.lock() = Some(detail);
        *self.state.lock() = SessionState::Error;
    }

    fn capabilities_changed(&self) {
        if let Some(callback) = self.on_capabilities_changed.lock().as_ref() {
            callback();
        }
    }
}

/// The live SSE channel of a connected SSE session.
struct SseChannel {
    post_endpoint: Url,
    pending: Arc<DashMap<String, oneshot::Sender<JsonRpcResponse>>>,
    reader: tokio::task::JoinHandle<()>,
    /// Serializes writes to the channel.
    post_lock: tokio::sync::Mutex<()>,
}

impl Drop for SseChannel {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

pub struct UpstreamSession {
    config: UpstreamServerConfig,
    limits: SessionLimits,
    http: reqwest::Client,
    auth: AuthState,
    shared: Arc<Shared>,
    session_id: Mutex<Option<String>>,
    protocol_version: Mutex<String>,
    last_auth_url: Mutex<Option<String>>,
    connect_lock: tokio::sync::Mutex<()>,
    limiter: Arc<Semaphore>,
    waiting: AtomicUsize,
    sse: Mutex<Option<Arc<SseChannel>>>,
}

impl UpstreamSession {
    pub fn new(config: UpstreamServerConfig, limits: SessionLimits) -> UpstreamResult<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(limits.connect_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| UpstreamError::Config(format!("build http client: {}", e)))?;

        let auth = AuthState::new(config.auth.clone());
        let limiter = Arc::new(Semaphore::new(limits.max_concurrency));

        Ok(Self {
            shared: Arc::new(Shared {
                server_name: config.name.clone(),
                state: Mutex::new(SessionState::Idle),
                last_error: Mutex::new(None),
                on_capabilities_changed: Mutex::new(None),
            }),
            config,
            limits,
            http,
            auth,
            session_id: Mutex::new(None),
            protocol_version: Mutex::new(PROTOCOL_VERSION_LATEST.to_string()),
            last_auth_url: Mutex::new(None),
            connect_lock: tokio::sync::Mutex::new(()),
            limiter,
            waiting: AtomicUsize::new(0),
            sse: Mutex::new(None),
        })
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &UpstreamServerConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.lock()
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error.lock().clone()
    }

    pub fn authorization_url(&self) -> Option<String> {
        self.last_auth_url.lock().clone()
    }

    /// Install the callback invoked when the upstream announces a
    /// capability-list change over its SSE stream.
    pub fn set_capabilities_changed_callback<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.shared.on_capabilities_changed.lock() = Some(Box::new(callback));
    }

    // ======================================================================
    // Lifecycle
    // ======================================================================

    /// Open the channel and run the MCP handshake. Legal from any terminal
    /// state; idempotent when already connected.
    pub async fn connect(&self, ctx: &InvocationContext) -> UpstreamResult<()> {
        let _guard = self.connect_lock.lock().await;
        if self.state() == SessionState::Connected {
            return Ok(());
        }
        if !self.config.enabled {
            return Err(UpstreamError::Unavailable(format!(
                "server '{}' is disabled",
                self.config.name
            )));
        }

        self.shared.set_state(SessionState::Connecting);
        let outcome = match self.config.transport {
            TransportKind::Http => self.http_handshake(ctx).await,
            TransportKind::Sse => self.sse_connect(ctx).await,
        };

        match outcome {
            Ok(()) => {
                self.shared.set_state(SessionState::Connected);
                *self.shared.last_error.lock() = None;
                info!(
                    "connected to upstream '{}' via {:?}",
                    self.config.name, self.config.transport
                );
                Ok(())
            }
            Err(UpstreamError::AuthRequired { authorization_url }) => {
                self.shared.set_state(SessionState::AuthRequired);
                Err(UpstreamError::AuthRequired { authorization_url })
            }
            Err(e) => {
                self.shared.fail(e.to_string());
                Err(e)
            }
        }
    }

    /// Tear the channel down.
    pub fn disconnect(&self) {
        let channel = self.sse.lock().take();
        drop(channel);
        *self.session_id.lock() = None;
        self.shared.set_state(SessionState::Disconnected);
        debug!("disconnected from upstream '{}'", self.config.name);
    }

    /// Wipe stored tokens and force `disconnected`.
    pub fn clear_auth(&self) {
        self.auth.clear();
        *self.last_auth_url.lock() = None;
        self.disconnect();
    }

    /// Apply this session's auth policy (including any held OAuth token)
    /// to an arbitrary outgoing header map. Used by HTTP custom tools that
    /// borrow an upstream's credentials.
    pub fn apply_auth_headers(&self, headers: &mut HeaderMap) -> UpstreamResult<()> {
        self.auth.apply(headers)
    }

    /// Finish a pending OAuth flow with the authorization code.
    pub async fn complete_authorization(&self, code: &str) -> UpstreamResult<()> {
        self.auth.complete_authorization(&self.http, code).await?;
        *self.last_auth_url.lock() = None;
        self.shared.set_state(SessionState::Disconnected);
        Ok(())
    }

    // ======================================================================
    // MCP operations
    // ======================================================================

    pub async fn ping(&self, ctx: &InvocationContext) -> UpstreamResult<()> {
        self.request(ctx, "ping", None).await.map(|_| ())
    }

    pub async fn list_tools(&self, ctx: &InvocationContext) -> UpstreamResult<Vec<Tool>> {
        self.list_paged(ctx, "tools/list", "tools").await
    }

    pub async fn list_resources(&self, ctx: &InvocationContext) -> UpstreamResult<Vec<Resource>> {
        self.list_paged(ctx, "resources/list", "resources").await
    }

    pub async fn list_resource_templates(
        &self,
        ctx: &InvocationContext,
    ) -> UpstreamResult<Vec<ResourceTemplate>> {
        self.list_paged(ctx, "resources/templates/list", "resourceTemplates")
            .await
    }

    pub async fn list_prompts(&self, ctx: &InvocationContext) -> UpstreamResult<Vec<Prompt>> {
        self.list_paged(ctx, "prompts/list", "prompts").await
    }

    pub async fn call_tool(
        &self,
        ctx: &InvocationContext,
        name: &str,
        arguments: Option<Value>,
    ) -> UpstreamResult<CallToolResult> {
        let mut params = json!({ "name": name });
        if let Some(args) = arguments {
            params["arguments"] = args;
        }
        let value = self.request(ctx, "tools/call", Some(params)).await?;
        serde_json::from_value(value)
            .map_err(|e| self.protocol_error(format!("malformed tools/call result: {}", e)))
    }

    pub async fn read_resource(
        &self,
        ctx: &InvocationContext,
        uri: &str,
    ) -> UpstreamResult<ReadResourceResult> {
        let value = self
            .request(ctx, "resources/read", Some(json!({ "uri": uri })))
            .await?;
        serde_json::from_value(value)
            .map_err(|e| self.protocol_error(format!("malformed resources/read result: {}", e)))
    }

    pub async fn get_prompt(
        &self,
        ctx: &InvocationContext,
        name: &str,
        arguments: Option<Value>,
    ) -> UpstreamResult<GetPromptResult> {
        let mut params = json!({ "name": name });
        if let Some(args) = arguments {
            params["arguments"] = args;
        }
        let value = self.request(ctx, "prompts/get", Some(params)).await?;
        serde_json::from_value(value)
            .map_err(|e| self.protocol_error(format!("malformed prompts/get result: {}", e)))
    }

    /// Discover every capability kind in one pass. A kind the upstream does
    /// not implement records an empty sequence, not an error.
    pub async fn discover_all(
        &self,
        ctx: &InvocationContext,
    ) -> UpstreamResult<CapabilitySnapshot> {
        let tools = self.list_tools(ctx).await?;

        let resources = self
            .optional_kind(self.list_resources(ctx).await, "resources")?
            .unwrap_or_default();
        let resource_templates = self
            .optional_kind(
                self.list_resource_templates(ctx).await,
                "resource templates",
            )?
            .unwrap_or_default();
        let prompts = self
            .optional_kind(self.list_prompts(ctx).await, "prompts")?
            .unwrap_or_default();

        Ok(CapabilitySnapshot {
            tools,
            resources,
            resource_templates,
            prompts,
        })
    }

    /// Collapse "kind not supported" into `None`; deadline and auth
    /// problems still propagate.
    fn optional_kind<T>(
        &self,
        result: UpstreamResult<Vec<T>>,
        kind: &str,
    ) -> UpstreamResult<Option<Vec<T>>> {
        match result {
            Ok(items) => Ok(Some(items)),
            Err(UpstreamError::ToolError { code, .. }) if code == JSONRPC_METHOD_NOT_FOUND => {
                debug!("upstream '{}' does not support {}", self.config.name, kind);
                Ok(None)
            }
            Err(
                e @ (UpstreamError::Timeout
                | UpstreamError::Cancelled
                | UpstreamError::AuthRequired { .. }),
            ) => Err(e),
            Err(e) => {
                warn!(
                    "failed to list {} on '{}': {}",
                    kind, self.config.name, e
                );
                Ok(None)
            }
        }
    }

    // ======================================================================
    // Request plumbing
    // ======================================================================

    async fn list_paged<T: serde::de::DeserializeOwned>(
        &self,
        ctx: &InvocationContext,
        method: &str,
        field: &str,
    ) -> UpstreamResult<Vec<T>> {
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let page = self.request(ctx, method, params).await?;

            let list = page
                .get(field)
                .and_then(Value::as_array)
                .ok_or_else(|| {
                    self.protocol_error(format!("{} result missing '{}'", method, field))
                })?;
            for item in list {
                let parsed = serde_json::from_value(item.clone()).map_err(|e| {
                    self.protocol_error(format!("malformed {} entry: {}", method, e))
                })?;
                items.push(parsed);
            }

            cursor = page
                .get("nextCursor")
                .and_then(Value::as_str)
                .map(String::from);
            if cursor.is_none() {
                break;
            }
        }

        Ok(items)
    }

    /// One upstream JSON-RPC call with connection management: acquire a
    /// concurrency slot, make sure the session is connected, send, and on a
    /// transport failure reconnect once and retry once.
    async fn request(
        &self,
        ctx: &InvocationContext,
        method: &str,
        params: Option<Value>,
    ) -> UpstreamResult<Value> {
        let _permit = self.acquire_slot(ctx).await?;
        self.ensure_connected(ctx).await?;

        let result = match self.send_request(ctx, method, params.clone()).await {
            Err(UpstreamError::Unavailable(detail)) => {
                debug!(
                    "call to '{}' failed ({}); attempting implicit reconnect",
                    self.config.name, detail
                );
                self.shared.set_state(SessionState::Disconnected);
                self.connect(ctx).await?;
                self.send_request(ctx, method, params).await
            }
            other => other,
        };

        if self.config.close_after_use {
            self.disconnect();
        }
        result
    }

    async fn send_request(
        &self,
        ctx: &InvocationContext,
        method: &str,
        params: Option<Value>,
    ) -> UpstreamResult<Value> {
        let request = JsonRpcRequest::new(
            JsonRpcId::String(uuid::Uuid::new_v4().to_string()),
            method,
            params,
        );

        let response = match self.config.transport {
            TransportKind::Http => self.http_send(ctx, &request).await?,
            TransportKind::Sse => self.sse_send(ctx, request.clone()).await?,
        };

        if let Some(error) = response.error {
            return Err(UpstreamError::ToolError {
                code: error.code,
                message: error.message,
                data: error.data,
            });
        }
        response
            .result
            .ok_or_else(|| self.protocol_error("response carried neither result nor error".into()))
    }

    fn protocol_error(&self, detail: String) -> UpstreamError {
        self.shared.fail(detail.clone());
        UpstreamError::Protocol(detail)
    }

    async fn ensure_connected(&self, ctx: &InvocationContext) -> UpstreamResult<()> {
        match self.state() {
            SessionState::Connected => Ok(()),
            SessionState::AuthRequired => Err(UpstreamError::AuthRequired {
                authorization_url: self.authorization_url(),
            }),
            _ => self.connect(ctx).await,
        }
    }

    async fn acquire_slot(&self, ctx: &InvocationContext) -> UpstreamResult<OwnedSemaphorePermit> {
        if let Ok(permit) = Arc::clone(&self.limiter).try_acquire_owned() {
            return Ok(permit);
        }

        let queued = self.waiting.fetch_add(1, Ordering::AcqRel);
        if queued >= self.limits.queue_bound {
            self.waiting.fetch_sub(1, Ordering::AcqRel);
            return Err(UpstreamError::Saturated);
        }

        let acquired = ctx.run(Arc::clone(&self.limiter).acquire_owned()).await;
        self.waiting.fetch_sub(1, Ordering::AcqRel);
        match acquired {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(UpstreamError::Unavailable("session closed".to_string())),
            Err(Interrupted::DeadlineExceeded) => Err(UpstreamError::Timeout),
            Err(Interrupted::Cancelled) => Err(UpstreamError::Cancelled),
        }
    }

    fn request_headers(&self) -> UpstreamResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        for (key, value) in &self.config.headers {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|_| UpstreamError::Config(format!("invalid header name: {}", key)))?;
            let header_value = HeaderValue::from_str(value)
                .map_err(|_| UpstreamError::Config(format!("invalid header value for {}", key)))?;
            headers.insert(name, header_value);
        }

        self.auth.apply(&mut headers)?;

        let version = self.protocol_version.lock().clone();
        if let Ok(value) = HeaderValue::from_str(&version) {
            headers.insert(HeaderName::from_static(PROTOCOL_VERSION_HEADER), value);
        }
        if let Some(session_id) = self.session_id.lock().as_ref() {
            if let Ok(value) = HeaderValue::from_str(session_id) {
                headers.insert(HeaderName::from_static(SESSION_ID_HEADER), value);
            }
        }
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/json, text/event-stream"),
        );
        Ok(headers)
    }

    /// Transition to `auth_required`, surfacing an authorization URL when
    /// the server is OAuth-configured.
    fn auth_challenge(&self) -> UpstreamError {
        let authorization_url = if self.auth.is_oauth() {
            match self.auth.begin_authorization() {
                Ok(url) => Some(url),
                Err(e) => {
                    warn!(
                        "could not build authorization url for '{}': {}",
                        self.config.name, e
                    );
                    None
                }
            }
        } else {
            None
        };
        *self.last_auth_url.lock() = authorization_url.clone();
        self.shared.set_state(SessionState::AuthRequired);
        UpstreamError::AuthRequired { authorization_url }
    }

    // ======================================================================
    // HTTP transport
    // ======================================================================

    async fn http_handshake(&self, ctx: &InvocationContext) -> UpstreamResult<()> {
        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION_LATEST.to_string(),
            capabilities: json!({}),
            client_info: Implementation {
                name: "vmcp-gateway".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        };
        let request = JsonRpcRequest::new(
            JsonRpcId::String(uuid::Uuid::new_v4().to_string()),
            "initialize",
            Some(serde_json::to_value(params).map_err(|e| {
                UpstreamError::Config(format!("serialize initialize params: {}", e))
            })?),
        );

        let response = self.http_send(ctx, &request).await?;
        if let Some(error) = response.error {
            return Err(UpstreamError::Protocol(format!(
                "initialize rejected ({}): {}",
                error.code, error.message
            )));
        }
        let result: InitializeResult = response
            .result
            .ok_or_else(|| UpstreamError::Protocol("initialize missing result".to_string()))
            .and_then(|v| {
                serde_json::from_value(v).map_err(|e| {
                    UpstreamError::Protocol(format!("malformed initialize result: {}", e))
                })
            })?;
        *self.protocol_version.lock() = result.protocol_version;

        self.http_notify(
            ctx,
            JsonRpcNotification::new("notifications/initialized", None),
        )
        .await
    }

    async fn http_send(
        &self,
        ctx: &InvocationContext,
        request: &JsonRpcRequest,
    ) -> UpstreamResult<JsonRpcResponse> {
        let mut refreshed = false;
        loop {
            let headers = self.request_headers()?;
            let send = self
                .http
                .post(&self.config.url)
                .headers(headers)
                .json(request)
                .send();

            let response = match ctx.run(send).await {
                Err(Interrupted::DeadlineExceeded) => return Err(UpstreamError::Timeout),
                Err(Interrupted::Cancelled) => return Err(UpstreamError::Cancelled),
                Ok(Err(e)) => {
                    return Err(UpstreamError::Unavailable(format!("http request: {}", e)))
                }
                Ok(Ok(r)) => r,
            };

            let status = response.status();
            if status == StatusCode::UNAUTHORIZED {
                if !refreshed && self.auth.try_refresh(&self.http).await? {
                    refreshed = true;
                    continue;
                }
                return Err(self.auth_challenge());
            }
            if status == StatusCode::NOT_FOUND && self.session_id.lock().is_some() {
                // Upstream forgot our session; re-handshake via the
                // implicit-reconnect path.
                *self.session_id.lock() = None;
                return Err(UpstreamError::Unavailable(
                    "upstream session expired".to_string(),
                ));
            }
            if !status.is_success() {
                return Err(UpstreamError::Unavailable(format!("http status {}", status)));
            }

            if let Some(session_id) = response
                .headers()
                .get(SESSION_ID_HEADER)
                .and_then(|h| h.to_str().ok())
            {
                *self.session_id.lock() = Some(session_id.to_string());
            }

            let content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|h| h.to_str().ok())
                .unwrap_or("")
                .to_string();
            let body = match ctx.run(response.text()).await {
                Err(Interrupted::DeadlineExceeded) => return Err(UpstreamError::Timeout),
                Err(Interrupted::Cancelled) => return Err(UpstreamError::Cancelled),
                Ok(Err(e)) => {
                    return Err(UpstreamError::Unavailable(format!("read response: {}", e)))
                }
                Ok(Ok(b)) => b,
            };

            let payload = if content_type.starts_with("text/event-stream") {
                crate::upstream::sse::first_message_payload(&body).ok_or_else(|| {
                    self.protocol_error("event-stream response carried no message".to_string())
                })?
            } else {
                body
            };

            let message: JsonRpcMessage = serde_json::from_str(&payload).map_err(|e| {
                self.protocol_error(format!("malformed json-rpc response: {}", e))
            })?;
            let JsonRpcMessage::Response(response) = message else {
                return Err(self.protocol_error("expected a json-rpc response".to_string()));
            };
            return Ok(response);
        }
    }

    async fn http_notify(
        &self,
        ctx: &InvocationContext,
        notification: JsonRpcNotification,
    ) -> UpstreamResult<()> {
        let headers = self.request_headers()?;
        let send = self
            .http
            .post(&self.config.url)
            .headers(headers)
            .json(&JsonRpcMessage::Notification(notification))
            .send();

        let response = match ctx.run(send).await {
            Err(Interrupted::DeadlineExceeded) => return Err(UpstreamError::Timeout),
            Err(Interrupted::Cancelled) => return Err(UpstreamError::Cancelled),
            Ok(Err(e)) => return Err(UpstreamError::Unavailable(format!("http request: {}", e))),
            Ok(Ok(r)) => r,
        };
        // 202 is the expected answer; any success is tolerated.
        if response.status().is_success() {
            Ok(())
        } else {
            Err(UpstreamError::Unavailable(format!(
                "notification failed: {}",
                response.status()
            )))
        }
    }

    // ======================================================================
    // SSE transport
    // ======================================================================

    async fn sse_connect(&self, ctx: &InvocationContext) -> UpstreamResult<()> {
        let base = Url::parse(&self.config.url)
            .map_err(|e| UpstreamError::Config(format!("invalid url: {}", e)))?;

        let mut refreshed = false;
        let response = loop {
            let mut headers = self.request_headers()?;
            headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
            let send = self.http.get(base.clone()).headers(headers).send();

            let response = match ctx.run(send).await {
                Err(Interrupted::DeadlineExceeded) => return Err(UpstreamError::Timeout),
                Err(Interrupted::Cancelled) => return Err(UpstreamError::Cancelled),
                Ok(Err(e)) => {
                    return Err(UpstreamError::Unavailable(format!("sse connect: {}", e)))
                }
                Ok(Ok(r)) => r,
            };

            let status = response.status();
            if status == StatusCode::UNAUTHORIZED {
                if !refreshed && self.auth.try_refresh(&self.http).await? {
                    refreshed = true;
                    continue;
                }
                return Err(self.auth_challenge());
            }
            if !status.is_success() {
                return Err(UpstreamError::Unavailable(format!("sse status {}", status)));
            }
            break response;
        };

        let pending: Arc<DashMap<String, oneshot::Sender<JsonRpcResponse>>> =
            Arc::new(DashMap::new());
        let (endpoint_tx, endpoint_rx) = oneshot::channel();
        let reader = tokio::spawn(run_sse_reader(
            Box::pin(response.bytes_stream()),
            Arc::clone(&pending),
            Arc::clone(&self.shared),
            self.limits.heartbeat_timeout,
            endpoint_tx,
        ));

        // The server advertises its message endpoint first.
        let endpoint_raw = match ctx
            .run(tokio::time::timeout(
                self.limits.connect_timeout,
                endpoint_rx,
            ))
            .await
        {
            Err(Interrupted::DeadlineExceeded) => {
                reader.abort();
                return Err(UpstreamError::Timeout);
            }
            Err(Interrupted::Cancelled) => {
                reader.abort();
                return Err(UpstreamError::Cancelled);
            }
            Ok(Err(_elapsed)) => {
                reader.abort();
                return Err(UpstreamError::Timeout);
            }
            Ok(Ok(Err(_closed))) => {
                reader.abort();
                return Err(UpstreamError::Protocol(
                    "sse stream ended before advertising an endpoint".to_string(),
                ));
            }
            Ok(Ok(Ok(raw))) => raw,
        };

        let post_endpoint = base
            .join(&endpoint_raw)
            .map_err(|e| UpstreamError::Protocol(format!("bad endpoint event: {}", e)))?;

        *self.sse.lock() = Some(Arc::new(SseChannel {
            post_endpoint,
            pending,
            reader,
            post_lock: tokio::sync::Mutex::new(()),
        }));

        // Handshake over the fresh channel.
        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION_LATEST.to_string(),
            capabilities: json!({}),
            client_info: Implementation {
                name: "vmcp-gateway".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        };
        let request = JsonRpcRequest::new(
            JsonRpcId::String(uuid::Uuid::new_v4().to_string()),
            "initialize",
            Some(serde_json::to_value(params).map_err(|e| {
                UpstreamError::Config(format!("serialize initialize params: {}", e))
            })?),
        );
        let response = self.sse_send(ctx, request).await?;
        if let Some(error) = response.error {
            return Err(UpstreamError::Protocol(format!(
                "initialize rejected ({}): {}",
                error.code, error.message
            )));
        }
        let result: InitializeResult = response
            .result
            .ok_or_else(|| UpstreamError::Protocol("initialize missing result".to_string()))
            .and_then(|v| {
                serde_json::from_value(v).map_err(|e| {
                    UpstreamError::Protocol(format!("malformed initialize result: {}", e))
                })
            })?;
        *self.protocol_version.lock() = result.protocol_version;

        self.sse_notify(ctx, JsonRpcNotification::new("notifications/initialized", None))
            .await
    }

    async fn sse_send(
        &self,
        ctx: &InvocationContext,
        request: JsonRpcRequest,
    ) -> UpstreamResult<JsonRpcResponse> {
        let channel = self
            .sse
            .lock()
            .clone()
            .ok_or_else(|| UpstreamError::Unavailable("sse channel not open".to_string()))?;

        let id_key = request.id.to_string();
        let (tx, rx) = oneshot::channel();
        channel.pending.insert(id_key.clone(), tx);

        let posted = {
            let _write = channel.post_lock.lock().await;
            let headers = self.request_headers()?;
            let send = self
                .http
                .post(channel.post_endpoint.clone())
                .headers(headers)
                .json(&request)
                .send();
            ctx.run(send).await
        };

        match posted {
            Err(Interrupted::DeadlineExceeded) => {
                channel.pending.remove(&id_key);
                return Err(UpstreamError::Timeout);
            }
            Err(Interrupted::Cancelled) => {
                channel.pending.remove(&id_key);
                return Err(UpstreamError::Cancelled);
            }
            Ok(Err(e)) => {
                channel.pending.remove(&id_key);
                return Err(UpstreamError::Unavailable(format!("sse post: {}", e)));
            }
            Ok(Ok(response)) => {
                let status = response.status();
                if status == StatusCode::UNAUTHORIZED {
                    channel.pending.remove(&id_key);
                    return Err(self.auth_challenge());
                }
                if !status.is_success() {
                    channel.pending.remove(&id_key);
                    return Err(UpstreamError::Unavailable(format!(
                        "sse post status {}",
                        status
                    )));
                }
            }
        }

        match ctx.run(rx).await {
            Err(Interrupted::DeadlineExceeded) => {
                channel.pending.remove(&id_key);
                Err(UpstreamError::Timeout)
            }
            Err(Interrupted::Cancelled) => {
                channel.pending.remove(&id_key);
                Err(UpstreamError::Cancelled)
            }
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(UpstreamError::Unavailable(
                "sse channel closed while waiting for response".to_string(),
            )),
        }
    }

    async fn sse_notify(
        &self,
        ctx: &InvocationContext,
        notification: JsonRpcNotification,
    ) -> UpstreamResult<()> {
        let channel = self
            .sse
            .lock()
            .clone()
            .ok_or_else(|| UpstreamError::Unavailable("sse channel not open".to_string()))?;

        let _write = channel.post_lock.lock().await;
        let headers = self.request_headers()?;
        let send = self
            .http
            .post(channel.post_endpoint.clone())
            .headers(headers)
            .json(&JsonRpcMessage::Notification(notification))
            .send();

        match ctx.run(send).await {
            Err(Interrupted::DeadlineExceeded) => Err(UpstreamError::Timeout),
            Err(Interrupted::Cancelled) => Err(UpstreamError::Cancelled),
            Ok(Err(e)) => Err(UpstreamError::Unavailable(format!("sse post: {}", e))),
            Ok(Ok(response)) if response.status().is_success() => Ok(()),
            Ok(Ok(response)) => Err(UpstreamError::Unavailable(format!(
                "notification failed: {}",
                response.status()
            ))),
        }
    }
}

/// Reader loop for one SSE stream: decodes frames, resolves pending calls
/// by id, reacts to list-changed notifications, and enforces the heartbeat
/// liveness bound.
async fn run_sse_reader<S>(
    mut stream: S,
    pending: Arc<DashMap<String, oneshot::Sender<JsonRpcResponse>>>,
    shared: Arc<Shared>,
    heartbeat_timeout: Duration,
    endpoint_tx: oneshot::Sender<String>,
) where
    S: futures_util::Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Unpin + Send + 'static,
{
    let mut decoder = SseDecoder::new();
    let mut endpoint_tx = Some(endpoint_tx);

    loop {
        let chunk = match tokio::time::timeout(heartbeat_timeout, stream.next()).await {
            Err(_) => {
                shared.fail("sse heartbeat timeout".to_string());
                break;
            }
            Ok(None) => {
                shared.set_state(SessionState::Disconnected);
                break;
            }
            Ok(Some(Err(e))) => {
                shared.fail(format!("sse stream error: {}", e));
                break;
            }
            Ok(Some(Ok(chunk))) => chunk,
        };

        let decoded = decoder.feed(&chunk);
        for event in decoded.events {
            if event.event == "endpoint" {
                if let Some(tx) = endpoint_tx.take() {
                    let _ = tx.send(event.data);
                }
                continue;
            }
            if !event.is_message() {
                continue;
            }
            match serde_json::from_str::<JsonRpcMessage>(&event.data) {
                Ok(JsonRpcMessage::Response(response)) => {
                    if let Some((_, tx)) = pending.remove(&response.id.to_string()) {
                        let _ = tx.send(response);
                    } else {
                        debug!(
                            "upstream '{}' answered unknown request id {}",
                            shared.server_name, response.id
                        );
                    }
                }
                Ok(JsonRpcMessage::Notification(notification)) => {
                    if notification.method.ends_with("list_changed") {
                        debug!(
                            "upstream '{}' announced {}",
                            shared.server_name, notification.method
                        );
                        shared.capabilities_changed();
                    }
                }
                Ok(JsonRpcMessage::Request(_)) => {
                    // Server-to-client requests (sampling etc.) are not
                    // supported; ignored rather than fatal.
                }
                Err(e) => {
                    shared.fail(format!("malformed sse message: {}", e));
                }
            }
        }
    }

    // Dropping the endpoint sender and the pending senders wakes every
    // waiter with a channel error.
    drop(endpoint_tx);
    pending.clear();
}
