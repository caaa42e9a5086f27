//! Custom tools: the three tool kinds a vMCP can carry and the engines
//! that execute them.

pub mod http;
pub mod prompt;
pub mod script;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::protocols::mcp::Tool;

pub use http::HttpEngine;
pub use prompt::PromptEngine;
pub use script::ScriptEngine;

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("tool execution timed out")]
    Timeout,

    #[error("tool crashed: {detail}")]
    Crash { detail: String },

    #[error("tool produced unusable output: {detail}")]
    BadOutput { detail: String },

    #[error("tool http request returned {status}: {excerpt}")]
    HttpStatus { status: u16, excerpt: String },
}

impl ToolError {
    pub fn kind(&self) -> &'static str {
        match self {
            ToolError::Timeout => "ToolTimeout",
            ToolError::Crash { .. } => "ToolCrash",
            ToolError::BadOutput { .. } => "ToolBadOutput",
            ToolError::HttpStatus { .. } => "ToolHttpStatus",
        }
    }
}

/// Cap applied to body and stderr excerpts carried inside errors.
pub const EXCERPT_LIMIT: usize = 512;

pub fn excerpt(text: &str) -> String {
    if text.len() <= EXCERPT_LIMIT {
        return text.to_string();
    }
    let mut end = EXCERPT_LIMIT;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

// ============================================================================
// Tool definitions
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CustomTool {
    Script(ScriptTool),
    Http(HttpTool),
    Prompt(PromptTool),
}

impl CustomTool {
    pub fn name(&self) -> &str {
        match self {
            CustomTool::Script(t) => &t.name,
            CustomTool::Http(t) => &t.name,
            CustomTool::Prompt(t) => &t.name,
        }
    }

    pub fn input_schema(&self) -> &Value {
        match self {
            CustomTool::Script(t) => &t.input_schema,
            CustomTool::Http(t) => &t.input_schema,
            CustomTool::Prompt(t) => &t.input_schema,
        }
    }

    /// MCP descriptor advertised for this tool.
    pub fn describe(&self) -> Tool {
        let (name, description, schema) = match self {
            CustomTool::Script(t) => (&t.name, &t.description, &t.input_schema),
            CustomTool::Http(t) => (&t.name, &t.description, &t.input_schema),
            CustomTool::Prompt(t) => (&t.name, &t.description, &t.input_schema),
        };
        Tool {
            name: name.clone(),
            title: None,
            description: description.clone(),
            input_schema: schema.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ScriptLanguage {
    #[default]
    Python,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptTool {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_object_schema")]
    pub input_schema: Value,
    pub source: String,
    #[serde(default)]
    pub language: ScriptLanguage,
    /// Environment variables of the vMCP the script may read.
    #[serde(default)]
    pub env_reads: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpTool {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_object_schema")]
    pub input_schema: Value,
    pub method: String,
    /// URL template; may embed `@param`/`@config` expressions.
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub auth: HttpToolAuth,
    #[serde(default)]
    pub response_kind: ResponseKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HttpToolAuth {
    #[default]
    None,
    Bearer {
        token: String,
    },
    ApiKey {
        header: String,
        key: String,
    },
    Basic {
        username: String,
        password: String,
    },
    CustomHeader {
        name: String,
        value: String,
    },
    /// Borrow the auth of a registered upstream server (OAuth included).
    Upstream {
        server_id: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResponseKind {
    #[default]
    Json,
    Text,
    Binary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptTool {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_object_schema")]
    pub input_schema: Value,
    /// Templated body; rendered output is the tool result.
    pub template: String,
}

fn default_object_schema() -> Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

// ============================================================================
// Input-schema enforcement
// ============================================================================

/// Check required fields before any engine or upstream is touched. Extra
/// fields pass through untouched.
pub fn check_required_args(schema: &Value, args: &Value) -> Result<(), String> {
    let Some(required) = schema.get("required").and_then(Value::as_array) else {
        return Ok(());
    };
    let empty = serde_json::Map::new();
    let provided = args.as_object().unwrap_or(&empty);
    let missing: Vec<&str> = required
        .iter()
        .filter_map(Value::as_str)
        .filter(|name| !provided.contains_key(*name))
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(format!("missing required argument(s): {}", missing.join(", ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn describe_exposes_schema() {
        let tool = CustomTool::Prompt(PromptTool {
            name: "brief".to_string(),
            description: Some("summarize".to_string()),
            input_schema: json!({"type": "object", "properties": {"topic": {"type": "string"}}}),
            template: "Summarize: @param.topic".to_string(),
        });
        let descriptor = tool.describe();
        assert_eq!(descriptor.name, "brief");
        assert_eq!(descriptor.description.as_deref(), Some("summarize"));
        assert!(descriptor.input_schema.get("properties").is_some());
    }

    #[test]
    fn required_args_enforced() {
        let schema = json!({
            "type": "object",
            "properties": {"a": {"type": "integer"}, "b": {"type": "integer"}},
            "required": ["a", "b"]
        });
        assert!(check_required_args(&schema, &json!({"a": 1, "b": 2})).is_ok());
        let err = check_required_args(&schema, &json!({"a": 1})).unwrap_err();
        assert!(err.contains("b"));
    }

    #[test]
    fn extra_args_pass_through() {
        let schema = json!({"type": "object", "required": ["a"]});
        assert!(check_required_args(&schema, &json!({"a": 1, "extra": true})).is_ok());
    }

    #[test]
    fn schema_without_required_accepts_anything() {
        let schema = json!({"type": "object"});
        assert!(check_required_args(&schema, &json!({})).is_ok());
        assert!(check_required_args(&schema, &json!(null)).is_ok());
    }

    #[test]
    fn excerpt_caps_long_text() {
        let long = "x".repeat(2000);
        let e = excerpt(&long);
        assert!(e.len() <= EXCERPT_LIMIT + 3);
        assert!(e.ends_with("..."));
        assert_eq!(excerpt("short"), "short");
    }

    #[test]
    fn custom_tool_serde_tagging() {
        let yaml = r#"
kind: http
name: greet
method: GET
url: "https://api.example.com/hello?n=@param.name"
response_kind: text
"#;
        let tool: CustomTool = serde_yaml::from_str(yaml).expect("parse");
        match &tool {
            CustomTool::Http(h) => {
                assert_eq!(h.method, "GET");
                assert_eq!(h.response_kind, ResponseKind::Text);
                assert!(matches!(h.auth, HttpToolAuth::None));
            }
            other => panic!("expected http tool, got {:?}", other),
        }
        assert_eq!(tool.name(), "greet");
    }
}
