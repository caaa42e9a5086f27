//! JSON-RPC 2.0 envelope types shared by the inbound adapter and the
//! upstream client.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcId {
    Number(i64),
    String(String),
}

impl std::fmt::Display for JsonRpcId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JsonRpcId::Number(n) => write!(f, "{}", n),
            JsonRpcId::String(s) => write!(f, "{}", s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: JsonRpcId,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: JsonRpcId, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: JsonRpcId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn ok(id: JsonRpcId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: JsonRpcId, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// Any JSON-RPC message. Requests carry an `id` and a `method`,
/// notifications only a `method`, responses an `id` and `result`/`error` --
/// the untagged order below disambiguates on those fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    Request(JsonRpcRequest),
    Notification(JsonRpcNotification),
    Response(JsonRpcResponse),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_roundtrip() {
        let req = JsonRpcRequest::new(
            JsonRpcId::Number(7),
            "tools/list",
            Some(serde_json::json!({"cursor": null})),
        );
        let v = serde_json::to_value(&req).expect("serialize");
        assert_eq!(v["jsonrpc"], "2.0");
        assert_eq!(v["id"], 7);
        let msg: JsonRpcMessage = serde_json::from_value(v).expect("deserialize");
        assert!(matches!(msg, JsonRpcMessage::Request(r) if r.method == "tools/list"));
    }

    #[test]
    fn notification_is_not_a_request() {
        let raw = serde_json::json!({"jsonrpc": "2.0", "method": "notifications/initialized"});
        let msg: JsonRpcMessage = serde_json::from_value(raw).expect("deserialize");
        assert!(matches!(msg, JsonRpcMessage::Notification(_)));
    }

    #[test]
    fn response_with_error() {
        let resp = JsonRpcResponse::err(
            JsonRpcId::String("abc".to_string()),
            JsonRpcError {
                code: -32601,
                message: "method not found".to_string(),
                data: None,
            },
        );
        let v = serde_json::to_value(&resp).expect("serialize");
        assert!(v.get("result").is_none());
        let msg: JsonRpcMessage = serde_json::from_value(v).expect("deserialize");
        assert!(matches!(msg, JsonRpcMessage::Response(r) if r.error.is_some()));
    }

    #[test]
    fn string_and_number_ids() {
        let n: JsonRpcId = serde_json::from_value(serde_json::json!(3)).expect("number id");
        assert_eq!(n, JsonRpcId::Number(3));
        let s: JsonRpcId = serde_json::from_value(serde_json::json!("x-1")).expect("string id");
        assert_eq!(s, JsonRpcId::String("x-1".to_string()));
    }
}
