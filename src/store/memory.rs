//! In-memory storage implementations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;

use super::{
    BlobRecord, BlobStore, ServerRecord, ServerStore, StoreError, StoreResult, UsageEntry,
    UsageLogStore, VmcpRecord, VmcpStore,
};
use crate::vmcp::types::VmcpDefinition;

#[derive(Default)]
pub struct MemoryServerStore {
    rows: DashMap<String, ServerRecord>,
}

impl MemoryServerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ServerStore for MemoryServerStore {
    async fn insert(&self, record: ServerRecord) -> StoreResult<()> {
        let id = record.config.id.clone();
        if self.rows.contains_key(&id) {
            return Err(StoreError::Conflict(format!("server '{}' exists", id)));
        }
        self.rows.insert(id, record);
        Ok(())
    }

    async fn get(&self, id: &str) -> StoreResult<Option<ServerRecord>> {
        Ok(self.rows.get(id).map(|r| r.clone()))
    }

    async fn list(&self) -> StoreResult<Vec<ServerRecord>> {
        let mut rows: Vec<ServerRecord> = self.rows.iter().map(|r| r.clone()).collect();
        rows.sort_by(|a, b| a.config.name.cmp(&b.config.name));
        Ok(rows)
    }

    async fn update(&self, record: ServerRecord) -> StoreResult<()> {
        self.rows.insert(record.config.id.clone(), record);
        Ok(())
    }

    async fn set_status(
        &self,
        id: &str,
        status: &str,
        last_error: Option<String>,
    ) -> StoreResult<()> {
        if let Some(mut row) = self.rows.get_mut(id) {
            row.status = status.to_string();
            row.last_error = last_error;
        }
        Ok(())
    }

    async fn touch_capabilities(&self, id: &str, at: DateTime<Utc>) -> StoreResult<()> {
        if let Some(mut row) = self.rows.get_mut(id) {
            row.last_capabilities_update = Some(at);
        }
        Ok(())
    }

    async fn remove(&self, id: &str) -> StoreResult<bool> {
        Ok(self.rows.remove(id).is_some())
    }
}

#[derive(Default)]
pub struct MemoryVmcpStore {
    rows: DashMap<String, VmcpRecord>,
}

impl MemoryVmcpStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VmcpStore for MemoryVmcpStore {
    async fn insert(&self, record: VmcpRecord) -> StoreResult<()> {
        let id = record.definition.id.clone();
        if self.rows.contains_key(&id) {
            return Err(StoreError::Conflict(format!("vmcp '{}' exists", id)));
        }
        let name = record.definition.name.clone();
        if self
            .rows
            .iter()
            .any(|r| r.definition.name == name)
        {
            return Err(StoreError::Conflict(format!(
                "vmcp name '{}' is taken",
                name
            )));
        }
        self.rows.insert(id, record);
        Ok(())
    }

    async fn get(&self, id: &str) -> StoreResult<Option<VmcpRecord>> {
        Ok(self.rows.get(id).map(|r| r.clone()))
    }

    async fn find_by_name(&self, name: &str) -> StoreResult<Option<VmcpRecord>> {
        Ok(self
            .rows
            .iter()
            .find(|r| r.definition.name == name)
            .map(|r| r.clone()))
    }

    async fn list(&self) -> StoreResult<Vec<VmcpRecord>> {
        let mut rows: Vec<VmcpRecord> = self.rows.iter().map(|r| r.clone()).collect();
        rows.sort_by(|a, b| a.definition.name.cmp(&b.definition.name));
        Ok(rows)
    }

    async fn update(&self, definition: VmcpDefinition) -> StoreResult<()> {
        match self.rows.get_mut(&definition.id) {
            Some(mut row) => {
                row.definition = definition;
                row.updated_at = Utc::now();
                Ok(())
            }
            None => Err(StoreError::Conflict(format!(
                "vmcp '{}' does not exist",
                definition.id
            ))),
        }
    }

    async fn remove(&self, id: &str) -> StoreResult<bool> {
        Ok(self.rows.remove(id).is_some())
    }
}

/// Append-only usage log.
#[derive(Default)]
pub struct MemoryUsageLog {
    entries: Mutex<Vec<UsageEntry>>,
}

impl MemoryUsageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl UsageLogStore for MemoryUsageLog {
    async fn append(&self, entry: UsageEntry) -> StoreResult<()> {
        self.entries.lock().push(entry);
        Ok(())
    }

    async fn list_for(&self, vmcp_id: &str) -> StoreResult<Vec<UsageEntry>> {
        Ok(self
            .entries
            .lock()
            .iter()
            .filter(|e| e.vmcp_id == vmcp_id)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: DashMap<String, BlobRecord>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, blob: BlobRecord) -> StoreResult<()> {
        self.blobs.insert(blob.blob_id.clone(), blob);
        Ok(())
    }

    async fn get(&self, blob_id: &str) -> StoreResult<Option<BlobRecord>> {
        Ok(self.blobs.get(blob_id).map(|b| b.clone()))
    }

    async fn delete(&self, blob_id: &str) -> StoreResult<bool> {
        Ok(self.blobs.remove(blob_id).is_some())
    }

    async fn rename(&self, blob_id: &str, filename: &str) -> StoreResult<bool> {
        match self.blobs.get_mut(blob_id) {
            Some(mut blob) => {
                blob.filename = filename.to_string();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list(&self) -> StoreResult<Vec<BlobRecord>> {
        let mut blobs: Vec<BlobRecord> = self.blobs.iter().map(|b| b.clone()).collect();
        blobs.sort_by(|a, b| a.blob_id.cmp(&b.blob_id));
        Ok(blobs)
    }
}
