//! Capability cache.
//!
//! Holds the most recent capability snapshot per upstream. Snapshots are
//! replaced atomically: readers clone an `Arc`, writers swap the pointer
//! under a short lock. The composer reads this cache, never the session.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::protocols::mcp::{Prompt, Resource, ResourceTemplate, Tool};

/// Everything one upstream advertised at a point in time.
#[derive(Debug, Clone, Default)]
pub struct CapabilitySnapshot {
    pub tools: Vec<Tool>,
    pub resources: Vec<Resource>,
    pub resource_templates: Vec<ResourceTemplate>,
    pub prompts: Vec<Prompt>,
}

pub struct CachedCapabilities {
    pub snapshot: CapabilitySnapshot,
    pub discovered_at: DateTime<Utc>,
    /// Monotonic generation; bumps on every replacement so downstream
    /// reverse maps know when to rebuild.
    pub generation: u64,
    stale: AtomicBool,
}

impl CachedCapabilities {
    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Acquire)
    }

    pub fn mark_stale(&self) {
        self.stale.store(true, Ordering::Release);
    }
}

#[derive(Default)]
pub struct CapabilityCache {
    entries: RwLock<HashMap<String, Arc<CachedCapabilities>>>,
    generation: AtomicU64,
}

impl CapabilityCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock-free-ish snapshot read: clones the Arc under a read lock.
    pub fn get(&self, server_id: &str) -> Option<Arc<CachedCapabilities>> {
        self.entries.read().get(server_id).cloned()
    }

    /// Atomically replace the snapshot for a server. Returns the new
    /// generation.
    pub fn store(&self, server_id: &str, snapshot: CapabilitySnapshot) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let cached = Arc::new(CachedCapabilities {
            snapshot,
            discovered_at: Utc::now(),
            generation,
            stale: AtomicBool::new(false),
        });
        self.entries
            .write()
            .insert(server_id.to_string(), cached);
        generation
    }

    /// Flag the snapshot so the next read path re-discovers.
    pub fn mark_stale(&self, server_id: &str) {
        if let Some(entry) = self.entries.read().get(server_id) {
            entry.mark_stale();
        }
    }

    /// Drop the snapshot entirely (clear-cache, disconnect).
    pub fn clear(&self, server_id: &str) {
        self.entries.write().remove(server_id);
    }

    pub fn clear_all(&self) {
        self.entries.write().clear();
    }

    /// True when a usable (present and not stale) snapshot exists.
    pub fn is_fresh(&self, server_id: &str) -> bool {
        self.entries
            .read()
            .get(server_id)
            .map(|e| !e.is_stale())
            .unwrap_or(false)
    }

    pub fn generation_of(&self, server_id: &str) -> Option<u64> {
        self.entries.read().get(server_id).map(|e| e.generation)
    }
}
