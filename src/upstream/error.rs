//! Upstream error taxonomy.

use serde_json::Value;

pub type UpstreamResult<T> = Result<T, UpstreamError>;

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    /// The session is not connected and one implicit reconnect attempt
    /// did not bring it back.
    #[error("upstream unavailable: {0}")]
    Unavailable(String),

    /// The context deadline expired while the call was in flight.
    #[error("upstream call timed out")]
    Timeout,

    /// The upstream produced a malformed response. The session is marked
    /// errored.
    #[error("upstream protocol violation: {0}")]
    Protocol(String),

    /// The upstream returned an MCP-level error for this call; passed
    /// through verbatim.
    #[error("upstream tool error {code}: {message}")]
    ToolError {
        code: i64,
        message: String,
        data: Option<Value>,
    },

    /// Authentication is required; the caller can recover by visiting the
    /// authorization URL.
    #[error("upstream authorization required")]
    AuthRequired { authorization_url: Option<String> },

    /// The per-upstream queue is full; the client may retry.
    #[error("upstream saturated")]
    Saturated,

    /// The server configuration is unusable (bad URL, bad header name...).
    #[error("upstream configuration error: {0}")]
    Config(String),

    /// The inbound caller went away mid-call.
    #[error("call cancelled")]
    Cancelled,
}

impl UpstreamError {
    pub fn kind(&self) -> &'static str {
        match self {
            UpstreamError::Unavailable(_) => "UpstreamUnavailable",
            UpstreamError::Timeout => "UpstreamTimeout",
            UpstreamError::Protocol(_) => "UpstreamProtocol",
            UpstreamError::ToolError { .. } => "UpstreamToolError",
            UpstreamError::AuthRequired { .. } => "AuthRequired",
            UpstreamError::Saturated => "UpstreamSaturated",
            UpstreamError::Config(_) => "UpstreamConfig",
            UpstreamError::Cancelled => "Cancelled",
        }
    }
}
