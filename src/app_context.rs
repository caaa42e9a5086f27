//! Shared application state.

use std::{sync::Arc, time::Duration};

use dashmap::DashMap;

use crate::{
    config::GatewayConfig,
    error::{GatewayError, GatewayResult},
    store::{
        MemoryBlobStore, MemoryServerStore, MemoryUsageLog, MemoryVmcpStore, ServerRecord,
        ServerStore, UsageLogStore, VmcpRecord, VmcpStore,
    },
    store::BlobStore,
    tools::{HttpEngine, ScriptEngine},
    upstream::{SessionLimits, UpstreamRegistry},
    vmcp::{composer::Composer, types::VmcpDefinition},
};

pub struct AppContext {
    pub config: GatewayConfig,
    pub registry: Arc<UpstreamRegistry>,
    pub server_store: Arc<dyn ServerStore>,
    pub vmcp_store: Arc<dyn VmcpStore>,
    pub usage_log: Arc<dyn UsageLogStore>,
    pub blob_store: Arc<dyn BlobStore>,
    pub script_engine: Arc<ScriptEngine>,
    pub http_engine: Arc<HttpEngine>,
    /// vmcp id -> composer; rebuilt whenever the definition changes.
    composers: DashMap<String, Arc<Composer>>,
}

impl AppContext {
    pub async fn new(config: GatewayConfig) -> GatewayResult<Arc<Self>> {
        let limits = SessionLimits {
            max_concurrency: config.max_upstream_concurrency,
            queue_bound: config.queue_bound,
            heartbeat_timeout: Duration::from_secs(config.heartbeat_timeout_secs),
            ..Default::default()
        };
        let registry = Arc::new(UpstreamRegistry::new(limits));
        let script_engine = Arc::new(ScriptEngine::new(
            config.python_bin.clone(),
            Duration::from_secs(config.script_timeout_secs),
            config.max_concurrent_scripts,
        ));
        let http_engine = Arc::new(HttpEngine::new(Some(Arc::clone(&registry)))?);

        let server_store: Arc<dyn ServerStore> = Arc::new(MemoryServerStore::new());
        let vmcp_store: Arc<dyn VmcpStore> = Arc::new(MemoryVmcpStore::new());

        // Seed the stores from the startup configuration.
        for server in &config.servers {
            server_store
                .insert(ServerRecord::new(server.clone()))
                .await
                .map_err(|e| GatewayError::Internal(e.to_string()))?;
        }
        for vmcp in &config.vmcps {
            vmcp_store
                .insert(VmcpRecord::new(vmcp.clone()))
                .await
                .map_err(|e| GatewayError::Internal(e.to_string()))?;
        }

        Ok(Arc::new(Self {
            config,
            registry,
            server_store,
            vmcp_store,
            usage_log: Arc::new(MemoryUsageLog::new()),
            blob_store: Arc::new(MemoryBlobStore::new()),
            script_engine,
            http_engine,
            composers: DashMap::new(),
        }))
    }

    /// Composer for a vMCP referenced by name (the URL path segment).
    pub async fn composer_for_name(&self, name: &str) -> GatewayResult<Arc<Composer>> {
        let record = self
            .vmcp_store
            .find_by_name(name)
            .await
            .map_err(|e| GatewayError::Internal(e.to_string()))?
            .ok_or_else(|| GatewayError::UnknownVmcp(name.to_string()))?;
        Ok(self.composer_for(record.definition))
    }

    pub async fn composer_for_id(&self, id: &str) -> GatewayResult<Arc<Composer>> {
        let record = self
            .vmcp_store
            .get(id)
            .await
            .map_err(|e| GatewayError::Internal(e.to_string()))?
            .ok_or_else(|| GatewayError::UnknownVmcp(id.to_string()))?;
        Ok(self.composer_for(record.definition))
    }

    fn composer_for(&self, definition: VmcpDefinition) -> Arc<Composer> {
        if let Some(existing) = self.composers.get(&definition.id) {
            return Arc::clone(existing.value());
        }
        let composer = Arc::new(Composer::new(
            definition.clone(),
            Arc::clone(&self.registry),
            Arc::clone(&self.server_store),
            Arc::clone(&self.blob_store),
            Arc::clone(&self.script_engine),
            Arc::clone(&self.http_engine),
        ));
        self.composers
            .insert(definition.id.clone(), Arc::clone(&composer));
        composer
    }

    /// Forget the composer of one vMCP (after update or delete).
    pub fn invalidate_composer(&self, vmcp_id: &str) {
        self.composers.remove(vmcp_id);
    }

    /// Drop every cached surface (after server registry changes).
    pub fn invalidate_all_surfaces(&self) {
        for entry in self.composers.iter() {
            entry.value().invalidate_surface();
        }
    }

    /// End-to-end deadline for one inbound request to this vMCP.
    pub fn request_deadline(&self, vmcp: &VmcpDefinition) -> Duration {
        Duration::from_millis(
            vmcp.request_deadline_ms
                .unwrap_or(self.config.default_request_deadline_ms),
        )
    }

    pub fn template_max_depth(&self) -> usize {
        self.config.template_max_depth
    }
}
