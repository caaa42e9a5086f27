//! HTTP tool engine.
//!
//! Method, URL, headers, and body are rendered through the template engine
//! before the request goes out, so they may embed `@param`/`@config` (and
//! any other expression form). The configured auth binding is applied after
//! rendering.

use std::{sync::Arc, time::Duration};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION},
    Method,
};
use serde_json::Value;

use crate::{
    error::{GatewayError, GatewayResult},
    protocols::mcp::{CallToolResult, ContentBlock, ResourceContents},
    template::{render, TargetResolver},
    tools::{excerpt, HttpTool, HttpToolAuth, ResponseKind, ToolError},
    upstream::UpstreamRegistry,
    vmcp::context::{Interrupted, InvocationContext},
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const TOTAL_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_REDIRECTS: usize = 5;

pub struct HttpEngine {
    client: reqwest::Client,
    /// Lets a tool borrow the auth of a registered upstream.
    registry: Option<Arc<UpstreamRegistry>>,
}

impl HttpEngine {
    pub fn new(registry: Option<Arc<UpstreamRegistry>>) -> GatewayResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .build()
            .map_err(|e| GatewayError::Internal(format!("build http tool client: {}", e)))?;
        Ok(Self { client, registry })
    }

    pub async fn execute(
        &self,
        tool: &HttpTool,
        args: &Value,
        resolver: &dyn TargetResolver,
        ctx: &InvocationContext,
    ) -> GatewayResult<CallToolResult> {
        let method = Method::from_bytes(tool.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| {
                GatewayError::Internal(format!("tool '{}': invalid method '{}'", tool.name, tool.method))
            })?;

        let url = render(&tool.url, args, resolver, ctx).await?;
        let url = reqwest::Url::parse(&url).map_err(|e| {
            GatewayError::Internal(format!("tool '{}': rendered url invalid: {}", tool.name, e))
        })?;

        let mut headers = HeaderMap::new();
        for (key, value_template) in &tool.headers {
            let rendered = render(value_template, args, resolver, ctx).await?;
            let name = HeaderName::from_bytes(key.as_bytes()).map_err(|_| {
                GatewayError::Internal(format!("tool '{}': invalid header '{}'", tool.name, key))
            })?;
            let value = HeaderValue::from_str(&rendered).map_err(|_| {
                GatewayError::Internal(format!(
                    "tool '{}': invalid value for header '{}'",
                    tool.name, key
                ))
            })?;
            headers.insert(name, value);
        }
        self.apply_auth(tool, &mut headers)?;

        let mut request = self
            .client
            .request(method, url.clone())
            .headers(headers)
            .timeout(TOTAL_TIMEOUT.min(ctx.remaining()));
        if let Some(body_template) = &tool.body {
            let body = render(body_template, args, resolver, ctx).await?;
            request = request.body(body);
        }

        let response = match ctx.run(request.send()).await {
            Err(Interrupted::DeadlineExceeded) => return Err(ToolError::Timeout.into()),
            Err(Interrupted::Cancelled) => return Err(GatewayError::Cancelled),
            Ok(Err(e)) if e.is_timeout() => return Err(ToolError::Timeout.into()),
            Ok(Err(e)) => {
                return Err(ToolError::Crash {
                    detail: format!("request failed: {}", e),
                }
                .into())
            }
            Ok(Ok(r)) => r,
        };

        let status = response.status();
        let mime = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|h| h.to_str().ok())
            .map(|s| s.split(';').next().unwrap_or(s).trim().to_string());

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ToolError::HttpStatus {
                status: status.as_u16(),
                excerpt: excerpt(&body),
            }
            .into());
        }

        match tool.response_kind {
            ResponseKind::Text => {
                let body = read_text(response, ctx).await?;
                Ok(CallToolResult::text(body))
            }
            ResponseKind::Json => {
                let body = read_text(response, ctx).await?;
                let value: Value = serde_json::from_str(&body).map_err(|e| ToolError::BadOutput {
                    detail: format!("response is not valid json: {}", e),
                })?;
                Ok(CallToolResult {
                    content: vec![ContentBlock::text(value.to_string())],
                    structured_content: Some(value),
                    is_error: None,
                })
            }
            ResponseKind::Binary => {
                let bytes = match ctx.run(response.bytes()).await {
                    Err(Interrupted::DeadlineExceeded) => return Err(ToolError::Timeout.into()),
                    Err(Interrupted::Cancelled) => return Err(GatewayError::Cancelled),
                    Ok(Err(e)) => {
                        return Err(ToolError::BadOutput {
                            detail: format!("read body: {}", e),
                        }
                        .into())
                    }
                    Ok(Ok(b)) => b,
                };
                Ok(CallToolResult {
                    content: vec![ContentBlock::Resource {
                        resource: ResourceContents::Blob {
                            uri: url.to_string(),
                            mime_type: mime,
                            blob: BASE64.encode(&bytes),
                        },
                    }],
                    structured_content: None,
                    is_error: None,
                })
            }
        }
    }

    fn apply_auth(&self, tool: &HttpTool, headers: &mut HeaderMap) -> GatewayResult<()> {
        match &tool.auth {
            HttpToolAuth::None => Ok(()),
            HttpToolAuth::Bearer { token } => {
                set_header(headers, AUTHORIZATION, &format!("Bearer {}", token))
            }
            HttpToolAuth::ApiKey { header, key } => {
                let name = HeaderName::from_bytes(header.as_bytes()).map_err(|_| {
                    GatewayError::Internal(format!("invalid auth header '{}'", header))
                })?;
                set_header(headers, name, key)
            }
            HttpToolAuth::Basic { username, password } => {
                let encoded = BASE64.encode(format!("{}:{}", username, password));
                set_header(headers, AUTHORIZATION, &format!("Basic {}", encoded))
            }
            HttpToolAuth::CustomHeader { name, value } => {
                let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
                    GatewayError::Internal(format!("invalid auth header '{}'", name))
                })?;
                set_header(headers, header_name, value)
            }
            HttpToolAuth::Upstream { server_id } => {
                let session = self
                    .registry
                    .as_ref()
                    .and_then(|r| r.get(server_id))
                    .ok_or_else(|| {
                        GatewayError::Internal(format!(
                            "auth references unknown upstream '{}'",
                            server_id
                        ))
                    })?;
                session
                    .apply_auth_headers(headers)
                    .map_err(|e| GatewayError::upstream(session.name().to_string(), e))
            }
        }
    }
}

fn set_header(headers: &mut HeaderMap, name: HeaderName, value: &str) -> GatewayResult<()> {
    let header_value = HeaderValue::from_str(value)
        .map_err(|_| GatewayError::Internal("invalid auth header value".to_string()))?;
    headers.insert(name, header_value);
    Ok(())
}

async fn read_text(
    response: reqwest::Response,
    ctx: &InvocationContext,
) -> GatewayResult<String> {
    match ctx.run(response.text()).await {
        Err(Interrupted::DeadlineExceeded) => Err(ToolError::Timeout.into()),
        Err(Interrupted::Cancelled) => Err(GatewayError::Cancelled),
        Ok(Err(e)) => Err(ToolError::BadOutput {
            detail: format!("read body: {}", e),
        }
        .into()),
        Ok(Ok(text)) => Ok(text),
    }
}
