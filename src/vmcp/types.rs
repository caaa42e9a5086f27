//! vMCP data model: a named, persistent composition of upstream
//! capabilities, custom tools, custom resources, custom prompts, a
//! templated system prompt, and environment bindings.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::{
    protocols::mcp::{PromptArgument, Resource},
    tools::CustomTool,
    vmcp::context::EnvVar,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmcpDefinition {
    pub id: String,
    /// Unique per owner.
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Ordered upstream server ids. Order decides merge order and which
    /// server wins bare capability names.
    #[serde(default)]
    pub upstreams: Vec<String>,
    #[serde(default)]
    pub custom_tools: Vec<CustomTool>,
    #[serde(default)]
    pub custom_resources: Vec<CustomResource>,
    #[serde(default)]
    pub custom_prompts: Vec<CustomPrompt>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, EnvVar>,
    /// Per-vMCP override of the end-to-end request deadline.
    #[serde(default)]
    pub request_deadline_ms: Option<u64>,
    #[serde(default)]
    pub is_public: bool,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl VmcpDefinition {
    /// Custom capability names must be unique before the merge: the
    /// exposed surface keys custom tools and prompts by name and custom
    /// resources by URI (plus the alias used by `@resource.alias`).
    pub fn validate(&self) -> Result<(), String> {
        let mut tool_names = HashSet::new();
        for tool in &self.custom_tools {
            if !tool_names.insert(tool.name()) {
                return Err(format!("duplicate custom tool name '{}'", tool.name()));
            }
        }

        let mut prompt_names = HashSet::new();
        for prompt in &self.custom_prompts {
            if !prompt_names.insert(prompt.name.as_str()) {
                return Err(format!("duplicate custom prompt name '{}'", prompt.name));
            }
        }

        let mut uris = HashSet::new();
        let mut aliases = HashSet::new();
        for resource in &self.custom_resources {
            if !uris.insert(resource.uri.as_str()) {
                return Err(format!("duplicate custom resource uri '{}'", resource.uri));
            }
            if !aliases.insert(resource.name.as_str()) {
                return Err(format!(
                    "duplicate custom resource name '{}'",
                    resource.name
                ));
            }
        }

        Ok(())
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            description: None,
            upstreams: Vec::new(),
            custom_tools: Vec::new(),
            custom_resources: Vec::new(),
            custom_prompts: Vec::new(),
            system_prompt: None,
            env: HashMap::new(),
            request_deadline_ms: None,
            is_public: false,
            tags: Vec::new(),
        }
    }
}

/// A resource served by the vMCP itself rather than an upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomResource {
    pub name: String,
    pub uri: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
    pub body: ResourceBody,
}

/// Where the bytes of a custom resource live.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResourceBody {
    Text { text: String },
    /// Base64-encoded inline bytes.
    Inline { data: String },
    /// Bytes held by the blob store.
    Blob { blob_id: String },
}

impl CustomResource {
    pub fn descriptor(&self) -> Resource {
        Resource {
            uri: self.uri.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            mime_type: self.mime_type.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomPrompt {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub arguments: Option<Vec<PromptArgument>>,
    /// Templated body with embedded expression forms.
    pub template: String,
}

impl CustomPrompt {
    pub fn descriptor(&self) -> crate::protocols::mcp::Prompt {
        crate::protocols::mcp::Prompt {
            name: self.name.clone(),
            description: self.description.clone(),
            arguments: self.arguments.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn definition_yaml_roundtrip() {
        let yaml = r#"
id: v-1
name: demo
upstreams: [s1, s2]
system_prompt: "You are @config.ROLE"
env:
  ROLE:
    value: helpful
custom_prompts:
  - name: brief
    template: "Summarize: @param.topic"
custom_resources:
  - name: notes
    uri: "vmcp://resources/notes"
    mime_type: text/plain
    body:
      kind: text
      text: "note body"
"#;
        let def: VmcpDefinition = serde_yaml::from_str(yaml).expect("parse");
        assert_eq!(def.upstreams, vec!["s1", "s2"]);
        assert_eq!(def.custom_prompts[0].name, "brief");
        assert!(matches!(
            def.custom_resources[0].body,
            ResourceBody::Text { .. }
        ));
        assert!(!def.env["ROLE"].secret);
    }

    #[test]
    fn named_generates_distinct_ids() {
        let a = VmcpDefinition::named("a");
        let b = VmcpDefinition::named("b");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn duplicate_custom_tool_names_are_rejected() {
        use crate::tools::{CustomTool, PromptTool};

        let mut def = VmcpDefinition::named("v");
        for _ in 0..2 {
            def.custom_tools.push(CustomTool::Prompt(PromptTool {
                name: "twin".to_string(),
                description: None,
                input_schema: serde_json::json!({"type": "object"}),
                template: "x".to_string(),
            }));
        }
        let err = def.validate().unwrap_err();
        assert!(err.contains("twin"));
    }

    #[test]
    fn duplicate_custom_prompt_names_are_rejected() {
        let mut def = VmcpDefinition::named("v");
        for _ in 0..2 {
            def.custom_prompts.push(CustomPrompt {
                name: "brief".to_string(),
                description: None,
                arguments: None,
                template: "x".to_string(),
            });
        }
        assert!(def.validate().is_err());
    }

    #[test]
    fn duplicate_custom_resource_uris_and_names_are_rejected() {
        let mut def = VmcpDefinition::named("v");
        def.custom_resources.push(CustomResource {
            name: "notes".to_string(),
            uri: "vmcp://resources/notes".to_string(),
            description: None,
            mime_type: None,
            body: ResourceBody::Text {
                text: "a".to_string(),
            },
        });
        def.custom_resources.push(CustomResource {
            name: "other".to_string(),
            uri: "vmcp://resources/notes".to_string(),
            description: None,
            mime_type: None,
            body: ResourceBody::Text {
                text: "b".to_string(),
            },
        });
        assert!(def.validate().unwrap_err().contains("uri"));

        def.custom_resources[1].uri = "vmcp://resources/other".to_string();
        def.custom_resources[1].name = "notes".to_string();
        assert!(def.validate().is_err());

        def.custom_resources[1].name = "other".to_string();
        assert!(def.validate().is_ok());
    }
}
