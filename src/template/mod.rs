//! Template engine.
//!
//! Two layers, evaluated in order: the `@`-prefixed expression layer
//! (`@param`, `@config`, `@tool(...)`, `@resource(...)`, `@prompt(...)`),
//! then a mustache-style text-template pass over the parameter namespace.

pub mod eval;
pub mod parser;
pub mod text;

pub use eval::{render, TargetResolver};
pub use parser::{parse, Segment, Spanned};

use crate::error::GatewayError;

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("template syntax error at byte {offset}: {detail}")]
    Syntax { offset: usize, detail: String },

    #[error("missing config variable '{0}'")]
    MissingConfig(String),

    #[error("unknown {kind} '{name}'")]
    UnknownTarget { kind: &'static str, name: String },

    #[error("template recursion limit of {max_depth} exceeded")]
    Recursion { max_depth: usize },

    /// A nested `@tool`/`@resource`/`@prompt` invocation failed; the error
    /// keeps its own class and gains the expression location.
    #[error("in expression at byte {offset}: {source}")]
    Nested {
        offset: usize,
        #[source]
        source: Box<GatewayError>,
    },
}

impl TemplateError {
    pub fn kind(&self) -> &'static str {
        match self {
            TemplateError::Syntax { .. } => "TemplateSyntax",
            TemplateError::MissingConfig(_) => "TemplateMissingConfig",
            TemplateError::UnknownTarget { .. } => "TemplateUnknownTarget",
            TemplateError::Recursion { .. } => "TemplateRecursion",
            TemplateError::Nested { source, .. } => source.kind(),
        }
    }

    /// Server attribution of the innermost failure, if any.
    pub fn root_server(&self) -> Option<&str> {
        match self {
            TemplateError::Nested { source, .. } => source.server(),
            _ => None,
        }
    }

    pub fn root_authorization_url(&self) -> Option<&str> {
        match self {
            TemplateError::Nested { source, .. } => source.authorization_url(),
            _ => None,
        }
    }
}

/// Canonical JSON text: object keys recursively sorted, compact encoding.
/// Used as the memo-cache key component for nested invocations.
pub fn canonical_json(value: &serde_json::Value) -> String {
    fn sort(value: &serde_json::Value) -> serde_json::Value {
        match value {
            serde_json::Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                let mut out = serde_json::Map::new();
                for key in keys {
                    out.insert(key.clone(), sort(&map[key]));
                }
                serde_json::Value::Object(out)
            }
            serde_json::Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(sort).collect())
            }
            other => other.clone(),
        }
    }
    sort(value).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_json_sorts_keys_recursively() {
        let v = serde_json::json!({"b": 1, "a": {"z": 2, "y": [ {"q": 3, "p": 4} ]}});
        assert_eq!(
            canonical_json(&v),
            r#"{"a":{"y":[{"p":4,"q":3}],"z":2},"b":1}"#
        );
    }

    #[test]
    fn canonical_json_is_stable_across_insertion_order() {
        let a = serde_json::json!({"x": 1, "y": 2});
        let b = serde_json::json!({"y": 2, "x": 1});
        assert_eq!(canonical_json(&a), canonical_json(&b));
    }

    #[test]
    fn nested_error_keeps_inner_kind() {
        let inner = GatewayError::UnknownTool("search".to_string());
        let err = TemplateError::Nested {
            offset: 12,
            source: Box::new(inner),
        };
        assert_eq!(err.kind(), "UnknownTool");
    }
}
