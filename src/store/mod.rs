//! Storage contracts.
//!
//! One trait per concern, injected as `Arc<dyn ...>`. The reference build
//! wires the in-memory implementations; an external persistence layer can
//! supply relational ones behind the same traits.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{upstream::UpstreamServerConfig, vmcp::types::VmcpDefinition};

pub use memory::{MemoryBlobStore, MemoryServerStore, MemoryUsageLog, MemoryVmcpStore};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("storage backend failure: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

// ============================================================================
// Upstream servers
// ============================================================================

/// Persisted row for one upstream server: its configuration plus the
/// last-known connection status.
#[derive(Debug, Clone)]
pub struct ServerRecord {
    pub config: UpstreamServerConfig,
    pub status: String,
    pub last_error: Option<String>,
    pub last_capabilities_update: Option<DateTime<Utc>>,
}

impl ServerRecord {
    pub fn new(config: UpstreamServerConfig) -> Self {
        Self {
            config,
            status: "disconnected".to_string(),
            last_error: None,
            last_capabilities_update: None,
        }
    }
}

#[async_trait]
pub trait ServerStore: Send + Sync {
    async fn insert(&self, record: ServerRecord) -> StoreResult<()>;
    async fn get(&self, id: &str) -> StoreResult<Option<ServerRecord>>;
    async fn list(&self) -> StoreResult<Vec<ServerRecord>>;
    async fn update(&self, record: ServerRecord) -> StoreResult<()>;
    async fn set_status(
        &self,
        id: &str,
        status: &str,
        last_error: Option<String>,
    ) -> StoreResult<()>;
    async fn touch_capabilities(&self, id: &str, at: DateTime<Utc>) -> StoreResult<()>;
    async fn remove(&self, id: &str) -> StoreResult<bool>;
}

// ============================================================================
// vMCPs
// ============================================================================

#[derive(Debug, Clone)]
pub struct VmcpRecord {
    pub definition: VmcpDefinition,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl VmcpRecord {
    pub fn new(definition: VmcpDefinition) -> Self {
        let now = Utc::now();
        Self {
            definition,
            created_at: now,
            updated_at: now,
        }
    }
}

#[async_trait]
pub trait VmcpStore: Send + Sync {
    async fn insert(&self, record: VmcpRecord) -> StoreResult<()>;
    async fn get(&self, id: &str) -> StoreResult<Option<VmcpRecord>>;
    async fn find_by_name(&self, name: &str) -> StoreResult<Option<VmcpRecord>>;
    async fn list(&self) -> StoreResult<Vec<VmcpRecord>>;
    async fn update(&self, definition: VmcpDefinition) -> StoreResult<()>;
    async fn remove(&self, id: &str) -> StoreResult<bool>;
}

// ============================================================================
// Usage log
// ============================================================================

/// Append-only record of one serviced inbound request.
#[derive(Debug, Clone)]
pub struct UsageEntry {
    pub id: String,
    pub vmcp_id: String,
    pub method: String,
    pub tool_name: Option<String>,
    pub server_name: Option<String>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub outcome: String,
}

#[async_trait]
pub trait UsageLogStore: Send + Sync {
    async fn append(&self, entry: UsageEntry) -> StoreResult<()>;
    async fn list_for(&self, vmcp_id: &str) -> StoreResult<Vec<UsageEntry>>;
}

// ============================================================================
// Blobs
// ============================================================================

#[derive(Debug, Clone)]
pub struct BlobRecord {
    pub blob_id: String,
    pub filename: String,
    pub mime: String,
    pub bytes: Vec<u8>,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, blob: BlobRecord) -> StoreResult<()>;
    async fn get(&self, blob_id: &str) -> StoreResult<Option<BlobRecord>>;
    async fn delete(&self, blob_id: &str) -> StoreResult<bool>;
    async fn rename(&self, blob_id: &str, filename: &str) -> StoreResult<bool>;
    async fn list(&self) -> StoreResult<Vec<BlobRecord>>;
}
