//! vMCP composer: presents one MCP surface for one vMCP and dispatches
//! execution to upstream sessions or custom-tool engines.
//!
//! Collision rules: custom tools always own their bare name; upstream
//! capabilities are merged in the vMCP's upstream order, the first
//! occurrence of a name wins, and later collisions are exposed with an
//! `@<server_name>` suffix (resources collide on URI the same way).

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    error::{GatewayError, GatewayResult},
    protocols::mcp::{
        CallToolResult, ContentBlock, GetPromptResult, Prompt, ReadResourceResult, Resource,
        ResourceContents, ResourceTemplate, Tool,
    },
    store::{BlobStore, ServerStore},
    template::{eval, TargetResolver},
    tools::{check_required_args, CustomTool, HttpEngine, PromptEngine, ScriptEngine},
    upstream::{UpstreamError, UpstreamRegistry, UpstreamServerConfig},
    vmcp::{
        context::InvocationContext,
        types::{ResourceBody, VmcpDefinition},
    },
};

/// Where an exposed capability lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    /// Index into the vMCP's own list (tools, resources, or prompts
    /// depending on the map).
    Custom(usize),
    Upstream {
        server_id: String,
        server_name: String,
        local_name: String,
    },
}

/// The merged capability surface plus the reverse maps, valid for one
/// combination of upstream snapshot generations.
pub struct ExposedSurface {
    /// (server_id, snapshot generation) per upstream included in the
    /// merge; `None` generation means the upstream was skipped.
    generations: Vec<(String, Option<u64>)>,
    pub tools: Vec<Tool>,
    pub resources: Vec<Resource>,
    pub resource_templates: Vec<ResourceTemplate>,
    pub prompts: Vec<Prompt>,
    tool_origins: HashMap<String, Origin>,
    resource_origins: HashMap<String, Origin>,
    prompt_origins: HashMap<String, Origin>,
}

impl ExposedSurface {
    pub fn tool_origin(&self, exposed_name: &str) -> Option<&Origin> {
        self.tool_origins.get(exposed_name)
    }

    pub fn resource_origin(&self, exposed_uri: &str) -> Option<&Origin> {
        self.resource_origins.get(exposed_uri)
    }

    pub fn prompt_origin(&self, exposed_name: &str) -> Option<&Origin> {
        self.prompt_origins.get(exposed_name)
    }
}

pub struct Composer {
    vmcp: VmcpDefinition,
    registry: Arc<UpstreamRegistry>,
    server_store: Arc<dyn ServerStore>,
    blob_store: Arc<dyn BlobStore>,
    script_engine: Arc<ScriptEngine>,
    http_engine: Arc<HttpEngine>,
    surface: Mutex<Option<Arc<ExposedSurface>>>,
}

impl Composer {
    pub fn new(
        vmcp: VmcpDefinition,
        registry: Arc<UpstreamRegistry>,
        server_store: Arc<dyn ServerStore>,
        blob_store: Arc<dyn BlobStore>,
        script_engine: Arc<ScriptEngine>,
        http_engine: Arc<HttpEngine>,
    ) -> Self {
        Self {
            vmcp,
            registry,
            server_store,
            blob_store,
            script_engine,
            http_engine,
            surface: Mutex::new(None),
        }
    }

    pub fn vmcp(&self) -> &VmcpDefinition {
        &self.vmcp
    }

    /// Drop the cached surface; the next read rebuilds it. Called when the
    /// set of registered servers changes underneath existing composers.
    pub fn invalidate_surface(&self) {
        *self.surface.lock() = None;
    }

    // ======================================================================
    // Read surface
    // ======================================================================

    pub async fn list_tools(&self, ctx: &InvocationContext) -> GatewayResult<Vec<Tool>> {
        Ok(self.surface(ctx).await?.tools.clone())
    }

    pub async fn list_resources(&self, ctx: &InvocationContext) -> GatewayResult<Vec<Resource>> {
        Ok(self.surface(ctx).await?.resources.clone())
    }

    pub async fn list_resource_templates(
        &self,
        ctx: &InvocationContext,
    ) -> GatewayResult<Vec<ResourceTemplate>> {
        Ok(self.surface(ctx).await?.resource_templates.clone())
    }

    pub async fn list_prompts(&self, ctx: &InvocationContext) -> GatewayResult<Vec<Prompt>> {
        Ok(self.surface(ctx).await?.prompts.clone())
    }

    // ======================================================================
    // Execution
    // ======================================================================

    pub async fn call_tool(
        &self,
        exposed_name: &str,
        args: Value,
        ctx: &InvocationContext,
    ) -> GatewayResult<CallToolResult> {
        let surface = self.surface(ctx).await?;
        let origin = surface
            .tool_origin(exposed_name)
            .ok_or_else(|| GatewayError::UnknownTool(exposed_name.to_string()))?
            .clone();

        match origin {
            Origin::Custom(index) => {
                let tool = self.vmcp.custom_tools.get(index).ok_or_else(|| {
                    GatewayError::Internal(format!("custom tool index {} out of range", index))
                })?;
                check_required_args(tool.input_schema(), &args)
                    .map_err(GatewayError::BadArguments)?;
                self.execute_custom(tool, &args, ctx).await
            }
            Origin::Upstream {
                server_id,
                server_name,
                local_name,
            } => {
                // Schema check against the cached descriptor, before the
                // upstream is touched.
                if let Some(descriptor) = surface
                    .tools
                    .iter()
                    .find(|t| t.name == exposed_name)
                {
                    check_required_args(&descriptor.input_schema, &args)
                        .map_err(GatewayError::BadArguments)?;
                }

                let session = self.open_session(&server_id).await?;
                session
                    .call_tool(ctx, &local_name, Some(args))
                    .await
                    .map_err(|e| GatewayError::upstream(server_name, e))
            }
        }
    }

    pub async fn read_resource(
        &self,
        exposed_uri: &str,
        ctx: &InvocationContext,
    ) -> GatewayResult<ReadResourceResult> {
        let surface = self.surface(ctx).await?;
        let origin = surface
            .resource_origin(exposed_uri)
            .ok_or_else(|| GatewayError::UnknownResource(exposed_uri.to_string()))?
            .clone();

        match origin {
            Origin::Custom(index) => {
                let resource = self.vmcp.custom_resources.get(index).ok_or_else(|| {
                    GatewayError::Internal(format!("custom resource index {} out of range", index))
                })?;
                self.read_custom_resource(resource).await
            }
            Origin::Upstream {
                server_id,
                server_name,
                local_name,
            } => {
                let session = self.open_session(&server_id).await?;
                session
                    .read_resource(ctx, &local_name)
                    .await
                    .map_err(|e| GatewayError::upstream(server_name, e))
            }
        }
    }

    pub async fn get_prompt(
        &self,
        exposed_name: &str,
        args: Value,
        ctx: &InvocationContext,
    ) -> GatewayResult<GetPromptResult> {
        let surface = self.surface(ctx).await?;
        let origin = surface
            .prompt_origin(exposed_name)
            .ok_or_else(|| GatewayError::UnknownPrompt(exposed_name.to_string()))?
            .clone();

        match origin {
            Origin::Custom(index) => {
                let prompt = self.vmcp.custom_prompts.get(index).ok_or_else(|| {
                    GatewayError::Internal(format!("custom prompt index {} out of range", index))
                })?;
                let text = eval::render(&prompt.template, &args, self, ctx).await?;
                let mut result = GetPromptResult::user_text(text);
                result.description = prompt.description.clone();
                Ok(result)
            }
            Origin::Upstream {
                server_id,
                server_name,
                local_name,
            } => {
                let session = self.open_session(&server_id).await?;
                session
                    .get_prompt(ctx, &local_name, Some(args))
                    .await
                    .map_err(|e| GatewayError::upstream(server_name, e))
            }
        }
    }

    /// Render the vMCP's system prompt; empty string when unset.
    pub async fn system_prompt(
        &self,
        args: Value,
        ctx: &InvocationContext,
    ) -> GatewayResult<String> {
        match &self.vmcp.system_prompt {
            Some(template) if !template.is_empty() => {
                eval::render(template, &args, self, ctx).await
            }
            _ => Ok(String::new()),
        }
    }

    // ======================================================================
    // Environment binding
    // ======================================================================

    /// Merge vMCP-level defaults with request-supplied overrides. Override
    /// values are never secret: they arrived on the wire.
    pub fn build_env(
        &self,
        overrides: Option<&HashMap<String, String>>,
    ) -> HashMap<String, crate::vmcp::context::EnvVar> {
        let mut env = self.vmcp.env.clone();
        if let Some(overrides) = overrides {
            for (name, value) in overrides {
                env.insert(
                    name.clone(),
                    crate::vmcp::context::EnvVar {
                        value: value.clone(),
                        secret: false,
                    },
                );
            }
        }
        env
    }

    // ======================================================================
    // Surface construction
    // ======================================================================

    /// Return the cached surface when every constituent snapshot is still
    /// at the generation it was built from, otherwise rebuild.
    async fn surface(&self, ctx: &InvocationContext) -> GatewayResult<Arc<ExposedSurface>> {
        let cache = self.registry.cache();

        // Discovery pass: make sure every reachable upstream has a fresh
        // snapshot. Failures degrade to skipping that upstream.
        let mut upstreams: Vec<(UpstreamServerConfig, Option<u64>)> = Vec::new();
        for server_id in &self.vmcp.upstreams {
            let record = match self.server_store.get(server_id).await {
                Ok(Some(record)) => record,
                Ok(None) => {
                    warn!("vmcp '{}' references unknown upstream '{}'", self.vmcp.name, server_id);
                    continue;
                }
                Err(e) => return Err(GatewayError::Internal(e.to_string())),
            };
            if !record.config.enabled {
                continue;
            }

            if let Err(e) = self.registry.ensure_discovered(&record.config, ctx).await {
                debug!(
                    "skipping upstream '{}' for vmcp '{}': {}",
                    record.config.name, self.vmcp.name, e
                );
                upstreams.push((record.config, None));
                continue;
            }
            // A fresh snapshot is what makes the upstream mergeable. The
            // live session may legitimately be gone again already
            // (close_after_use servers reconnect per call).
            let generation = if cache.is_fresh(server_id) {
                cache.generation_of(server_id)
            } else {
                None
            };
            upstreams.push((record.config, generation));
        }

        let generations: Vec<(String, Option<u64>)> = upstreams
            .iter()
            .map(|(config, generation)| (config.id.clone(), *generation))
            .collect();

        if let Some(cached) = self.surface.lock().as_ref() {
            if cached.generations == generations {
                return Ok(Arc::clone(cached));
            }
        }

        let surface = Arc::new(self.build_surface(&upstreams, generations));
        *self.surface.lock() = Some(Arc::clone(&surface));
        Ok(surface)
    }

    fn build_surface(
        &self,
        upstreams: &[(UpstreamServerConfig, Option<u64>)],
        generations: Vec<(String, Option<u64>)>,
    ) -> ExposedSurface {
        let cache = self.registry.cache();

        let mut tools = Vec::new();
        let mut tool_origins = HashMap::new();
        let mut resources = Vec::new();
        let mut resource_origins = HashMap::new();
        let mut resource_templates = Vec::new();
        let mut prompts = Vec::new();
        let mut prompt_origins = HashMap::new();

        // Custom capabilities own their bare names up front.
        let mut taken_tools: HashSet<String> = self
            .vmcp
            .custom_tools
            .iter()
            .map(|t| t.name().to_string())
            .collect();
        let mut taken_uris: HashSet<String> = self
            .vmcp
            .custom_resources
            .iter()
            .map(|r| r.uri.clone())
            .collect();
        let mut taken_prompts: HashSet<String> = self
            .vmcp
            .custom_prompts
            .iter()
            .map(|p| p.name.clone())
            .collect();

        for (config, generation) in upstreams {
            if generation.is_none() {
                continue;
            }
            let Some(cached) = cache.get(&config.id) else {
                continue;
            };
            let snapshot = &cached.snapshot;

            for tool in &snapshot.tools {
                let exposed =
                    claim_name(&mut taken_tools, &tool.name, &config.name);
                tool_origins.insert(
                    exposed.clone(),
                    Origin::Upstream {
                        server_id: config.id.clone(),
                        server_name: config.name.clone(),
                        local_name: tool.name.clone(),
                    },
                );
                let mut descriptor = tool.clone();
                descriptor.name = exposed;
                tools.push(descriptor);
            }

            for resource in &snapshot.resources {
                let exposed =
                    claim_name(&mut taken_uris, &resource.uri, &config.name);
                resource_origins.insert(
                    exposed.clone(),
                    Origin::Upstream {
                        server_id: config.id.clone(),
                        server_name: config.name.clone(),
                        local_name: resource.uri.clone(),
                    },
                );
                let mut descriptor = resource.clone();
                descriptor.uri = exposed;
                resources.push(descriptor);
            }

            resource_templates.extend(snapshot.resource_templates.iter().cloned());

            for prompt in &snapshot.prompts {
                let exposed =
                    claim_name(&mut taken_prompts, &prompt.name, &config.name);
                prompt_origins.insert(
                    exposed.clone(),
                    Origin::Upstream {
                        server_id: config.id.clone(),
                        server_name: config.name.clone(),
                        local_name: prompt.name.clone(),
                    },
                );
                let mut descriptor = prompt.clone();
                descriptor.name = exposed;
                prompts.push(descriptor);
            }
        }

        // Custom capabilities are appended after the upstream merge; their
        // bare names were reserved before it.
        for (index, tool) in self.vmcp.custom_tools.iter().enumerate() {
            tool_origins.insert(tool.name().to_string(), Origin::Custom(index));
            tools.push(tool.describe());
        }
        for (index, resource) in self.vmcp.custom_resources.iter().enumerate() {
            resource_origins.insert(resource.uri.clone(), Origin::Custom(index));
            resources.push(resource.descriptor());
        }
        for (index, prompt) in self.vmcp.custom_prompts.iter().enumerate() {
            prompt_origins.insert(prompt.name.clone(), Origin::Custom(index));
            prompts.push(prompt.descriptor());
        }

        ExposedSurface {
            generations,
            tools,
            resources,
            resource_templates,
            prompts,
            tool_origins,
            resource_origins,
            prompt_origins,
        }
    }

    // ======================================================================
    // Dispatch helpers
    // ======================================================================

    async fn open_session(
        &self,
        server_id: &str,
    ) -> GatewayResult<Arc<crate::upstream::UpstreamSession>> {
        let record = self
            .server_store
            .get(server_id)
            .await
            .map_err(|e| GatewayError::Internal(e.to_string()))?
            .ok_or_else(|| {
                GatewayError::upstream(
                    server_id.to_string(),
                    UpstreamError::Unavailable("server not registered".to_string()),
                )
            })?;
        self.registry
            .get_or_open(&record.config)
            .map_err(|e| GatewayError::upstream(record.config.name.clone(), e))
    }

    async fn execute_custom(
        &self,
        tool: &CustomTool,
        args: &Value,
        ctx: &InvocationContext,
    ) -> GatewayResult<CallToolResult> {
        match tool {
            CustomTool::Script(script) => self.script_engine.execute(script, args, ctx).await,
            CustomTool::Http(http) => self.http_engine.execute(http, args, self, ctx).await,
            CustomTool::Prompt(prompt) => PromptEngine::execute(prompt, args, self, ctx).await,
        }
    }

    async fn read_custom_resource(
        &self,
        resource: &crate::vmcp::types::CustomResource,
    ) -> GatewayResult<ReadResourceResult> {
        let contents = match &resource.body {
            ResourceBody::Text { text } => ResourceContents::Text {
                uri: resource.uri.clone(),
                mime_type: resource.mime_type.clone(),
                text: text.clone(),
            },
            ResourceBody::Inline { data } => ResourceContents::Blob {
                uri: resource.uri.clone(),
                mime_type: resource.mime_type.clone(),
                blob: data.clone(),
            },
            ResourceBody::Blob { blob_id } => {
                let blob = self
                    .blob_store
                    .get(blob_id)
                    .await
                    .map_err(|e| GatewayError::Internal(e.to_string()))?
                    .ok_or_else(|| GatewayError::UnknownResource(resource.uri.clone()))?;
                ResourceContents::Blob {
                    uri: resource.uri.clone(),
                    mime_type: Some(blob.mime.clone()),
                    blob: BASE64.encode(&blob.bytes),
                }
            }
        };
        Ok(ReadResourceResult {
            contents: vec![contents],
        })
    }

    fn custom_resource_by_alias(&self, alias: &str) -> Option<(usize, &str)> {
        self.vmcp
            .custom_resources
            .iter()
            .enumerate()
            .find(|(_, r)| r.name == alias)
            .map(|(index, r)| (index, r.uri.as_str()))
    }
}

/// Claim an exposed name: bare when free, `name@server` on collision, with
/// a deterministic numeric tail if even that is taken (duplicate names
/// within one upstream).
fn claim_name(taken: &mut HashSet<String>, name: &str, server_name: &str) -> String {
    if taken.insert(name.to_string()) {
        return name.to_string();
    }
    let suffixed = format!("{}@{}", name, server_name);
    if taken.insert(suffixed.clone()) {
        return suffixed;
    }
    let mut n = 2;
    loop {
        let candidate = format!("{}@{}#{}", name, server_name, n);
        if taken.insert(candidate.clone()) {
            return candidate;
        }
        n += 1;
    }
}

#[async_trait]
impl TargetResolver for Composer {
    async fn invoke_tool(
        &self,
        name: &str,
        args: Value,
        ctx: &InvocationContext,
    ) -> Result<CallToolResult, GatewayError> {
        self.call_tool(name, args, ctx).await
    }

    async fn fetch_resource(
        &self,
        target: &str,
        ctx: &InvocationContext,
    ) -> Result<ReadResourceResult, GatewayError> {
        // `@resource.alias` names a custom resource; anything else is a URI.
        if let Some((index, _uri)) = self.custom_resource_by_alias(target) {
            let resource = &self.vmcp.custom_resources[index];
            return self.read_custom_resource(resource).await;
        }
        self.read_resource(target, ctx).await
    }

    async fn render_prompt(
        &self,
        name: &str,
        args: Value,
        ctx: &InvocationContext,
    ) -> Result<String, GatewayError> {
        let result = self.get_prompt(name, args, ctx).await?;
        let parts: Vec<String> = result
            .messages
            .iter()
            .map(|m| match &m.content {
                ContentBlock::Text { text } => text.clone(),
                other => eval::render_tool_result(&CallToolResult {
                    content: vec![other.clone()],
                    structured_content: None,
                    is_error: None,
                }),
            })
            .collect();
        Ok(parts.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        store::{MemoryBlobStore, MemoryServerStore},
        tools::PromptTool,
        upstream::{inventory::CapabilitySnapshot, SessionLimits},
        vmcp::types::CustomResource,
    };
    use serde_json::json;
    use std::time::Duration;

    fn make_composer(vmcp: VmcpDefinition) -> Composer {
        let registry = Arc::new(UpstreamRegistry::new(SessionLimits::default()));
        Composer::new(
            vmcp,
            Arc::clone(&registry),
            Arc::new(MemoryServerStore::new()),
            Arc::new(MemoryBlobStore::new()),
            Arc::new(ScriptEngine::new("python3", Duration::from_secs(5), 2)),
            Arc::new(HttpEngine::new(Some(registry)).expect("engine")),
        )
    }

    fn ctx() -> InvocationContext {
        InvocationContext::new("v1", Default::default(), Duration::from_secs(5), 8)
    }

    fn tool_descriptor(name: &str) -> Tool {
        Tool {
            name: name.to_string(),
            title: None,
            description: None,
            input_schema: json!({"type": "object", "properties": {}}),
        }
    }

    #[test]
    fn claim_name_collision_chain() {
        let mut taken = HashSet::new();
        assert_eq!(claim_name(&mut taken, "add", "mathA"), "add");
        assert_eq!(claim_name(&mut taken, "add", "mathB"), "add@mathB");
        assert_eq!(claim_name(&mut taken, "add", "mathB"), "add@mathB#2");
        assert_eq!(claim_name(&mut taken, "add", "mathB"), "add@mathB#3");
    }

    #[tokio::test]
    async fn empty_vmcp_lists_nothing() {
        let composer = make_composer(VmcpDefinition::named("empty"));
        let tools = composer.list_tools(&ctx()).await.expect("list");
        assert!(tools.is_empty());
        let prompts = composer.list_prompts(&ctx()).await.expect("list");
        assert!(prompts.is_empty());
    }

    #[tokio::test]
    async fn custom_tools_are_listed_and_unique() {
        let mut vmcp = VmcpDefinition::named("v");
        vmcp.custom_tools.push(CustomTool::Prompt(PromptTool {
            name: "brief".to_string(),
            description: None,
            input_schema: json!({"type": "object"}),
            template: "hello".to_string(),
        }));
        let composer = make_composer(vmcp);

        let tools = composer.list_tools(&ctx()).await.expect("list");
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "brief");

        // Uniqueness invariant over exposed names.
        let names: HashSet<_> = tools.iter().map(|t| t.name.clone()).collect();
        assert_eq!(names.len(), tools.len());
    }

    #[tokio::test]
    async fn unknown_tool_is_reported_as_such() {
        let composer = make_composer(VmcpDefinition::named("v"));
        let err = composer
            .call_tool("nope", json!({}), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::UnknownTool(_)));
    }

    #[tokio::test]
    async fn bad_arguments_never_reach_the_engine() {
        let mut vmcp = VmcpDefinition::named("v");
        vmcp.custom_tools.push(CustomTool::Prompt(PromptTool {
            name: "greet".to_string(),
            description: None,
            input_schema: json!({
                "type": "object",
                "properties": {"name": {"type": "string"}},
                "required": ["name"]
            }),
            template: "hi @param.name".to_string(),
        }));
        let composer = make_composer(vmcp);

        let err = composer
            .call_tool("greet", json!({}), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::BadArguments(_)));

        let ok = composer
            .call_tool("greet", json!({"name": "Ada", "extra": 1}), &ctx())
            .await
            .expect("extra args pass through");
        assert_eq!(eval::render_tool_result(&ok), "hi Ada");
    }

    #[tokio::test]
    async fn custom_prompt_renders_via_template_engine() {
        let mut vmcp = VmcpDefinition::named("v");
        vmcp.custom_prompts.push(crate::vmcp::types::CustomPrompt {
            name: "brief".to_string(),
            description: Some("a brief".to_string()),
            arguments: None,
            template: "Summarize: @param.topic".to_string(),
        });
        let composer = make_composer(vmcp);

        let result = composer
            .get_prompt("brief", json!({"topic": "rafts"}), &ctx())
            .await
            .expect("prompt");
        assert_eq!(result.description.as_deref(), Some("a brief"));
        match &result.messages[0].content {
            ContentBlock::Text { text } => assert_eq!(text, "Summarize: rafts"),
            other => panic!("expected text, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn system_prompt_defaults_to_empty() {
        let composer = make_composer(VmcpDefinition::named("v"));
        let rendered = composer
            .system_prompt(json!({}), &ctx())
            .await
            .expect("render");
        assert_eq!(rendered, "");
    }

    #[tokio::test]
    async fn system_prompt_renders_config() {
        let mut vmcp = VmcpDefinition::named("v");
        vmcp.system_prompt = Some("You are @config.ROLE.".to_string());
        vmcp.env.insert(
            "ROLE".to_string(),
            crate::vmcp::context::EnvVar {
                value: "helpful".to_string(),
                secret: false,
            },
        );
        let composer = make_composer(vmcp);
        let env = composer.build_env(None);
        let context =
            InvocationContext::new("v1", env, Duration::from_secs(5), 8);
        let rendered = composer
            .system_prompt(json!({}), &context)
            .await
            .expect("render");
        assert_eq!(rendered, "You are helpful.");
    }

    #[tokio::test]
    async fn custom_resource_read_and_alias() {
        let mut vmcp = VmcpDefinition::named("v");
        vmcp.custom_resources.push(CustomResource {
            name: "notes".to_string(),
            uri: "vmcp://resources/notes".to_string(),
            description: None,
            mime_type: Some("text/plain".to_string()),
            body: ResourceBody::Text {
                text: "note body".to_string(),
            },
        });
        let composer = make_composer(vmcp);

        let resources = composer.list_resources(&ctx()).await.expect("list");
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].uri, "vmcp://resources/notes");

        let read = composer
            .read_resource("vmcp://resources/notes", &ctx())
            .await
            .expect("read");
        assert!(matches!(
            &read.contents[0],
            ResourceContents::Text { text, .. } if text == "note body"
        ));

        // Alias resolution through the template seam.
        let via_alias = composer
            .fetch_resource("notes", &ctx())
            .await
            .expect("alias read");
        assert_eq!(read.contents, via_alias.contents);
    }

    #[tokio::test]
    async fn env_overrides_merge_over_defaults() {
        let mut vmcp = VmcpDefinition::named("v");
        vmcp.env.insert(
            "A".to_string(),
            crate::vmcp::context::EnvVar {
                value: "default".to_string(),
                secret: false,
            },
        );
        let composer = make_composer(vmcp);

        let mut overrides = HashMap::new();
        overrides.insert("A".to_string(), "override".to_string());
        overrides.insert("B".to_string(), "new".to_string());
        let env = composer.build_env(Some(&overrides));
        assert_eq!(env["A"].value, "override");
        assert_eq!(env["B"].value, "new");
    }

    #[tokio::test]
    async fn surface_is_cached_until_generations_move() {
        let registry = Arc::new(UpstreamRegistry::new(SessionLimits::default()));
        let server_store = Arc::new(MemoryServerStore::new());
        let mut vmcp = VmcpDefinition::named("v");
        vmcp.custom_tools.push(CustomTool::Prompt(PromptTool {
            name: "t".to_string(),
            description: None,
            input_schema: json!({"type": "object"}),
            template: "x".to_string(),
        }));
        let composer = Composer::new(
            vmcp,
            Arc::clone(&registry),
            server_store,
            Arc::new(MemoryBlobStore::new()),
            Arc::new(ScriptEngine::new("python3", Duration::from_secs(5), 2)),
            Arc::new(HttpEngine::new(Some(Arc::clone(&registry))).expect("engine")),
        );

        let first = composer.surface(&ctx()).await.expect("surface");
        let second = composer.surface(&ctx()).await.expect("surface");
        assert!(Arc::ptr_eq(&first, &second), "surface is reused");

        // Identical descriptor sequences on repeated list calls.
        let a = composer.list_tools(&ctx()).await.expect("list");
        let b = composer.list_tools(&ctx()).await.expect("list");
        assert_eq!(a, b);
    }

    #[test]
    fn build_surface_orders_upstreams_then_custom() {
        let registry = Arc::new(UpstreamRegistry::new(SessionLimits::default()));
        registry.cache().store(
            "s1",
            CapabilitySnapshot {
                tools: vec![tool_descriptor("add"), tool_descriptor("sub")],
                ..Default::default()
            },
        );
        registry.cache().store(
            "s2",
            CapabilitySnapshot {
                tools: vec![tool_descriptor("add")],
                ..Default::default()
            },
        );

        let mut vmcp = VmcpDefinition::named("v");
        vmcp.upstreams = vec!["s1".to_string(), "s2".to_string()];
        vmcp.custom_tools.push(CustomTool::Prompt(PromptTool {
            name: "sub".to_string(),
            description: None,
            input_schema: json!({"type": "object"}),
            template: "custom sub".to_string(),
        }));

        let composer = Composer::new(
            vmcp,
            Arc::clone(&registry),
            Arc::new(MemoryServerStore::new()),
            Arc::new(MemoryBlobStore::new()),
            Arc::new(ScriptEngine::new("python3", Duration::from_secs(5), 2)),
            Arc::new(HttpEngine::new(Some(Arc::clone(&registry))).expect("engine")),
        );

        let upstreams = vec![
            (
                UpstreamServerConfig::new("s1", "mathA", "http://a/mcp"),
                registry.cache().generation_of("s1"),
            ),
            (
                UpstreamServerConfig::new("s2", "mathB", "http://b/mcp"),
                registry.cache().generation_of("s2"),
            ),
        ];
        let generations = upstreams
            .iter()
            .map(|(c, g)| (c.id.clone(), *g))
            .collect();
        let surface = composer.build_surface(&upstreams, generations);

        let names: Vec<&str> = surface.tools.iter().map(|t| t.name.as_str()).collect();
        // mathA's add wins bare; mathB's collides; custom "sub" owns the
        // bare name so mathA's sub is suffixed; custom tools come last.
        assert_eq!(names, vec!["add", "sub@mathA", "add@mathB", "sub"]);

        // Reverse map recovers exactly one origin per exposed name.
        assert_eq!(
            surface.tool_origin("add"),
            Some(&Origin::Upstream {
                server_id: "s1".to_string(),
                server_name: "mathA".to_string(),
                local_name: "add".to_string(),
            })
        );
        assert_eq!(
            surface.tool_origin("add@mathB").map(|o| match o {
                Origin::Upstream { server_name, .. } => server_name.as_str(),
                _ => "custom",
            }),
            Some("mathB")
        );
        assert_eq!(surface.tool_origin("sub"), Some(&Origin::Custom(0)));
    }
}
