//! Control surface.
//!
//! Language-level management API wrapped by an external HTTP layer:
//! register/remove upstream servers, vMCP CRUD, per-server connection and
//! auth lifecycle, capability refresh, environment variables, and
//! share/fork.

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::Utc;
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::{
    app_context::AppContext,
    error::{GatewayError, GatewayResult},
    store::{ServerRecord, VmcpRecord},
    upstream::{inventory::CapabilitySnapshot, UpstreamServerConfig},
    vmcp::{context::InvocationContext, types::VmcpDefinition},
};

pub struct GatewayService {
    app: Arc<AppContext>,
}

impl GatewayService {
    pub fn new(app: Arc<AppContext>) -> Self {
        Self { app }
    }

    /// Short-lived context for management operations (no vMCP, default
    /// environment, admin deadline).
    fn admin_context(&self) -> InvocationContext {
        InvocationContext::new(
            "control",
            HashMap::new(),
            Duration::from_millis(self.app.config.default_request_deadline_ms),
            self.app.config.template_max_depth,
        )
    }

    fn internal(e: impl std::fmt::Display) -> GatewayError {
        GatewayError::Internal(e.to_string())
    }

    // ======================================================================
    // Upstream servers
    // ======================================================================

    pub async fn register_server(&self, config: UpstreamServerConfig) -> GatewayResult<()> {
        self.app
            .server_store
            .insert(ServerRecord::new(config.clone()))
            .await
            .map_err(Self::internal)?;
        self.app.invalidate_all_surfaces();
        info!("registered upstream server '{}' ({})", config.name, config.id);
        Ok(())
    }

    /// Close the session first, then drop the row.
    pub async fn remove_server(&self, server_id: &str) -> GatewayResult<bool> {
        self.app.registry.close(server_id);
        let removed = self
            .app
            .server_store
            .remove(server_id)
            .await
            .map_err(Self::internal)?;
        self.app.invalidate_all_surfaces();
        Ok(removed)
    }

    pub async fn connect_server(&self, server_id: &str) -> GatewayResult<()> {
        let record = self.require_server(server_id).await?;
        let session = self
            .app
            .registry
            .get_or_open(&record.config)
            .map_err(|e| GatewayError::upstream(record.config.name.clone(), e))?;

        let ctx = self.admin_context();
        let outcome = session.connect(&ctx).await;
        self.persist_status(server_id).await?;
        outcome.map_err(|e| GatewayError::upstream(record.config.name, e))
    }

    pub async fn disconnect_server(&self, server_id: &str) -> GatewayResult<()> {
        if let Some(session) = self.app.registry.get(server_id) {
            session.disconnect();
        }
        self.app.registry.clear_cache(server_id);
        self.persist_status(server_id).await
    }

    pub async fn clear_server_auth(&self, server_id: &str) -> GatewayResult<()> {
        self.require_server(server_id).await?;
        if let Some(session) = self.app.registry.get(server_id) {
            session.clear_auth();
        }
        self.app.registry.cache().clear(server_id);
        self.persist_status(server_id).await
    }

    pub async fn clear_server_cache(&self, server_id: &str) -> GatewayResult<()> {
        self.app.registry.clear_cache(server_id);
        self.persist_status(server_id).await
    }

    /// Discover right now and atomically replace the snapshot.
    pub async fn refresh_capabilities(
        &self,
        server_id: &str,
    ) -> GatewayResult<CapabilitySnapshot> {
        let record = self.require_server(server_id).await?;
        let ctx = self.admin_context();
        let snapshot = self
            .app
            .registry
            .refresh(&record.config, &ctx)
            .await
            .map_err(|e| GatewayError::upstream(record.config.name.clone(), e))?;
        self.app
            .server_store
            .touch_capabilities(server_id, Utc::now())
            .await
            .map_err(Self::internal)?;
        self.persist_status(server_id).await?;
        Ok(snapshot)
    }

    /// Finish a pending OAuth authorization-code flow.
    pub async fn complete_server_authorization(
        &self,
        server_id: &str,
        code: &str,
    ) -> GatewayResult<()> {
        let record = self.require_server(server_id).await?;
        let session = self
            .app
            .registry
            .get_or_open(&record.config)
            .map_err(|e| GatewayError::upstream(record.config.name.clone(), e))?;
        session
            .complete_authorization(code)
            .await
            .map_err(|e| GatewayError::upstream(record.config.name, e))?;
        self.persist_status(server_id).await
    }

    pub async fn server_status(&self, server_id: &str) -> GatewayResult<ServerRecord> {
        self.persist_status(server_id).await?;
        self.require_server(server_id).await
    }

    async fn require_server(&self, server_id: &str) -> GatewayResult<ServerRecord> {
        self.app
            .server_store
            .get(server_id)
            .await
            .map_err(Self::internal)?
            .ok_or_else(|| {
                GatewayError::Internal(format!("server '{}' is not registered", server_id))
            })
    }

    /// Mirror the live session state into the persisted row.
    async fn persist_status(&self, server_id: &str) -> GatewayResult<()> {
        if let Some(session) = self.app.registry.get(server_id) {
            self.app
                .server_store
                .set_status(server_id, session.state().as_str(), session.last_error())
                .await
                .map_err(Self::internal)?;
        }
        Ok(())
    }

    // ======================================================================
    // vMCPs
    // ======================================================================

    pub async fn create_vmcp(&self, definition: VmcpDefinition) -> GatewayResult<()> {
        definition.validate().map_err(GatewayError::BadArguments)?;
        self.app
            .vmcp_store
            .insert(VmcpRecord::new(definition))
            .await
            .map_err(Self::internal)
    }

    pub async fn update_vmcp(&self, definition: VmcpDefinition) -> GatewayResult<()> {
        definition.validate().map_err(GatewayError::BadArguments)?;
        let id = definition.id.clone();
        self.app
            .vmcp_store
            .update(definition)
            .await
            .map_err(Self::internal)?;
        self.app.invalidate_composer(&id);
        Ok(())
    }

    pub async fn delete_vmcp(&self, vmcp_id: &str) -> GatewayResult<bool> {
        let removed = self
            .app
            .vmcp_store
            .remove(vmcp_id)
            .await
            .map_err(Self::internal)?;
        self.app.invalidate_composer(vmcp_id);
        Ok(removed)
    }

    /// Replace the environment map of a vMCP.
    pub async fn save_env(
        &self,
        vmcp_id: &str,
        env: HashMap<String, crate::vmcp::context::EnvVar>,
    ) -> GatewayResult<()> {
        let mut definition = self.require_vmcp(vmcp_id).await?;
        definition.env = env;
        self.update_vmcp(definition).await
    }

    /// Toggle public visibility.
    pub async fn share_vmcp(&self, vmcp_id: &str, public: bool) -> GatewayResult<()> {
        let mut definition = self.require_vmcp(vmcp_id).await?;
        definition.is_public = public;
        self.update_vmcp(definition).await
    }

    /// Copy a vMCP under a new name and id. Secret environment values do
    /// not travel into the fork.
    pub async fn fork_vmcp(
        &self,
        vmcp_id: &str,
        new_name: &str,
    ) -> GatewayResult<VmcpDefinition> {
        let source = self.require_vmcp(vmcp_id).await?;
        let mut fork = source.clone();
        fork.id = Uuid::new_v4().to_string();
        fork.name = new_name.to_string();
        fork.is_public = false;
        fork.env.retain(|_, var| !var.secret);
        self.create_vmcp(fork.clone()).await?;
        Ok(fork)
    }

    /// Render a vMCP's system prompt with the given arguments.
    pub async fn render_system_prompt(
        &self,
        vmcp_name: &str,
        args: Value,
    ) -> GatewayResult<String> {
        let composer = self.app.composer_for_name(vmcp_name).await?;
        let env = composer.build_env(None);
        let ctx = InvocationContext::new(
            composer.vmcp().id.clone(),
            env,
            self.app.request_deadline(composer.vmcp()),
            self.app.template_max_depth(),
        );
        composer.system_prompt(args, &ctx).await
    }

    async fn require_vmcp(&self, vmcp_id: &str) -> GatewayResult<VmcpDefinition> {
        Ok(self
            .app
            .vmcp_store
            .get(vmcp_id)
            .await
            .map_err(Self::internal)?
            .ok_or_else(|| GatewayError::UnknownVmcp(vmcp_id.to_string()))?
            .definition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::GatewayConfig, vmcp::context::EnvVar};

    async fn service() -> GatewayService {
        let app = AppContext::new(GatewayConfig::default())
            .await
            .expect("app context");
        GatewayService::new(app)
    }

    #[tokio::test]
    async fn vmcp_crud_and_fork_drops_secrets() {
        let service = service().await;

        let mut definition = VmcpDefinition::named("original");
        definition.env.insert(
            "PUBLIC".to_string(),
            EnvVar {
                value: "v".to_string(),
                secret: false,
            },
        );
        definition.env.insert(
            "TOKEN".to_string(),
            EnvVar {
                value: "secret-value".to_string(),
                secret: true,
            },
        );
        let id = definition.id.clone();
        service.create_vmcp(definition).await.expect("create");

        let fork = service.fork_vmcp(&id, "copy").await.expect("fork");
        assert_eq!(fork.name, "copy");
        assert_ne!(fork.id, id);
        assert!(fork.env.contains_key("PUBLIC"));
        assert!(!fork.env.contains_key("TOKEN"), "secrets must not travel");
        assert!(!fork.is_public);

        assert!(service.delete_vmcp(&id).await.expect("delete"));
        assert!(!service.delete_vmcp(&id).await.expect("delete again"));
    }

    #[tokio::test]
    async fn duplicate_custom_tool_names_are_rejected_on_create() {
        use crate::tools::{CustomTool, PromptTool};

        let service = service().await;
        let mut definition = VmcpDefinition::named("dups");
        for _ in 0..2 {
            definition.custom_tools.push(CustomTool::Prompt(PromptTool {
                name: "twin".to_string(),
                description: None,
                input_schema: serde_json::json!({"type": "object"}),
                template: "x".to_string(),
            }));
        }
        let err = service.create_vmcp(definition).await.unwrap_err();
        assert!(matches!(err, GatewayError::BadArguments(_)));
    }

    #[tokio::test]
    async fn share_toggles_visibility() {
        let service = service().await;
        let definition = VmcpDefinition::named("shared");
        let id = definition.id.clone();
        service.create_vmcp(definition).await.expect("create");

        service.share_vmcp(&id, true).await.expect("share");
        let record = service
            .app
            .vmcp_store
            .get(&id)
            .await
            .expect("get")
            .expect("present");
        assert!(record.definition.is_public);
    }

    #[tokio::test]
    async fn save_env_replaces_the_map() {
        let service = service().await;
        let definition = VmcpDefinition::named("env-test");
        let id = definition.id.clone();
        service.create_vmcp(definition).await.expect("create");

        let mut env = HashMap::new();
        env.insert(
            "KEY".to_string(),
            EnvVar {
                value: "val".to_string(),
                secret: false,
            },
        );
        service.save_env(&id, env).await.expect("save");

        let record = service
            .app
            .vmcp_store
            .get(&id)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(record.definition.env["KEY"].value, "val");
    }

    #[tokio::test]
    async fn register_and_remove_server() {
        let service = service().await;
        let config = UpstreamServerConfig::new("s1", "srv", "http://127.0.0.1:1/mcp");
        service.register_server(config).await.expect("register");

        let record = service.require_server("s1").await.expect("present");
        assert_eq!(record.status, "disconnected");

        assert!(service.remove_server("s1").await.expect("remove"));
        assert!(service.require_server("s1").await.is_err());
    }

    #[tokio::test]
    async fn system_prompt_renders_through_service() {
        let service = service().await;
        let mut definition = VmcpDefinition::named("sp");
        definition.system_prompt = Some("Hello @param.who".to_string());
        service.create_vmcp(definition).await.expect("create");

        let text = service
            .render_system_prompt("sp", serde_json::json!({"who": "world"}))
            .await
            .expect("render");
        assert_eq!(text, "Hello world");
    }
}
