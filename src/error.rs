//! Gateway-wide error taxonomy and its JSON-RPC mapping.

use serde_json::{json, Value};

use crate::{template::TemplateError, tools::ToolError, upstream::UpstreamError};

pub type GatewayResult<T> = Result<T, GatewayError>;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("bad arguments: {0}")]
    BadArguments(String),

    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("unknown resource: {0}")]
    UnknownResource(String),

    #[error("unknown prompt: {0}")]
    UnknownPrompt(String),

    #[error("unknown vmcp: {0}")]
    UnknownVmcp(String),

    #[error("method not found: {0}")]
    MethodNotFound(String),

    #[error("upstream '{server}' failed: {source}")]
    Upstream {
        server: String,
        #[source]
        source: UpstreamError,
    },

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("request cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn upstream(server: impl Into<String>, source: UpstreamError) -> Self {
        GatewayError::Upstream {
            server: server.into(),
            source,
        }
    }

    /// The stable error-kind label carried in every error envelope.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::BadArguments(_) => "BadArguments",
            GatewayError::UnknownTool(_) => "UnknownTool",
            GatewayError::UnknownResource(_) => "UnknownResource",
            GatewayError::UnknownPrompt(_) => "UnknownPrompt",
            GatewayError::UnknownVmcp(_) => "UnknownVmcp",
            GatewayError::MethodNotFound(_) => "MethodNotFound",
            GatewayError::Upstream { source, .. } => source.kind(),
            GatewayError::Tool(e) => e.kind(),
            GatewayError::Template(e) => e.kind(),
            GatewayError::Cancelled => "Cancelled",
            GatewayError::Internal(_) => "Internal",
        }
    }

    /// JSON-RPC error code for the envelope.
    pub fn jsonrpc_code(&self) -> i64 {
        match self {
            GatewayError::BadArguments(_) => -32602,
            GatewayError::UnknownTool(_)
            | GatewayError::UnknownResource(_)
            | GatewayError::UnknownPrompt(_)
            | GatewayError::UnknownVmcp(_)
            | GatewayError::MethodNotFound(_) => -32601,
            GatewayError::Template(TemplateError::Syntax { .. }) => -32602,
            _ => -32000,
        }
    }

    /// Server name for upstream-originated errors.
    pub fn server(&self) -> Option<&str> {
        match self {
            GatewayError::Upstream { server, .. } => Some(server),
            GatewayError::Template(e) => e.root_server(),
            _ => None,
        }
    }

    /// Authorization URL when the error is an auth challenge.
    pub fn authorization_url(&self) -> Option<&str> {
        match self {
            GatewayError::Upstream {
                source:
                    UpstreamError::AuthRequired {
                        authorization_url: Some(url),
                    },
                ..
            } => Some(url),
            GatewayError::Template(e) => e.root_authorization_url(),
            _ => None,
        }
    }

    /// Build the structured `data` payload of the JSON-RPC error object.
    /// `scrub` is applied to the human-readable detail so secret values
    /// never leave the gateway.
    pub fn error_data(&self, scrub: impl Fn(&str) -> String) -> Value {
        let mut data = json!({
            "kind": self.kind(),
            "detail": scrub(&self.to_string()),
        });
        if let Some(server) = self.server() {
            data["server"] = json!(server);
        }
        if let Some(url) = self.authorization_url() {
            data["authorization_url"] = json!(url);
        }
        data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_arguments_maps_to_invalid_params() {
        let err = GatewayError::BadArguments("missing field".to_string());
        assert_eq!(err.jsonrpc_code(), -32602);
        assert_eq!(err.kind(), "BadArguments");
    }

    #[test]
    fn unknown_kinds_map_to_method_not_found() {
        assert_eq!(GatewayError::UnknownTool("x".into()).jsonrpc_code(), -32601);
        assert_eq!(
            GatewayError::UnknownPrompt("x".into()).jsonrpc_code(),
            -32601
        );
    }

    #[test]
    fn upstream_error_data_names_the_server() {
        let err = GatewayError::upstream(
            "mathB",
            UpstreamError::Unavailable("connection refused".to_string()),
        );
        let data = err.error_data(|s| s.to_string());
        assert_eq!(data["kind"], "UpstreamUnavailable");
        assert_eq!(data["server"], "mathB");
    }

    #[test]
    fn auth_required_carries_authorization_url() {
        let err = GatewayError::upstream(
            "github",
            UpstreamError::AuthRequired {
                authorization_url: Some("https://auth.example.com/authorize?x=1".to_string()),
            },
        );
        let data = err.error_data(|s| s.to_string());
        assert_eq!(data["kind"], "AuthRequired");
        assert_eq!(
            data["authorization_url"],
            "https://auth.example.com/authorize?x=1"
        );
    }

    #[test]
    fn detail_is_scrubbed() {
        let err = GatewayError::Internal("token sk-123 leaked".to_string());
        let data = err.error_data(|s| s.replace("sk-123", "***"));
        assert_eq!(data["detail"], "internal error: token *** leaked");
    }
}
