//! Upstream registry: server id -> live session.
//!
//! Sessions are opened lazily and shared; opening an already-open session
//! is idempotent. Structural changes hold a short map lock, reads clone an
//! `Arc` to the session.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info};

use crate::{
    upstream::{
        error::{UpstreamError, UpstreamResult},
        inventory::{CapabilityCache, CapabilitySnapshot},
        session::{SessionLimits, SessionState, UpstreamSession},
        UpstreamServerConfig,
    },
    vmcp::context::InvocationContext,
};

pub struct UpstreamRegistry {
    sessions: DashMap<String, Arc<UpstreamSession>>,
    cache: Arc<CapabilityCache>,
    limits: SessionLimits,
}

impl UpstreamRegistry {
    pub fn new(limits: SessionLimits) -> Self {
        Self {
            sessions: DashMap::new(),
            cache: Arc::new(CapabilityCache::new()),
            limits,
        }
    }

    pub fn cache(&self) -> Arc<CapabilityCache> {
        Arc::clone(&self.cache)
    }

    /// Fetch the session for a server id, creating it from the supplied
    /// configuration when it does not exist yet.
    pub fn get_or_open(
        &self,
        config: &UpstreamServerConfig,
    ) -> UpstreamResult<Arc<UpstreamSession>> {
        if let Some(existing) = self.sessions.get(&config.id) {
            return Ok(Arc::clone(existing.value()));
        }

        let session = Arc::new(UpstreamSession::new(config.clone(), self.limits.clone())?);
        let cache = Arc::clone(&self.cache);
        let server_id = config.id.clone();
        session.set_capabilities_changed_callback(move || {
            cache.mark_stale(&server_id);
        });

        // A racing open keeps the first session; the loser is dropped
        // before it ever connects.
        let entry = self
            .sessions
            .entry(config.id.clone())
            .or_insert_with(|| Arc::clone(&session));
        Ok(Arc::clone(entry.value()))
    }

    /// Session for an id that must already be open.
    pub fn get(&self, server_id: &str) -> Option<Arc<UpstreamSession>> {
        self.sessions.get(server_id).map(|e| Arc::clone(e.value()))
    }

    /// Close and forget one session. Must precede removal of the server
    /// from persistence.
    pub fn close(&self, server_id: &str) {
        if let Some((_, session)) = self.sessions.remove(server_id) {
            session.disconnect();
            info!("closed upstream session '{}'", session.name());
        }
        self.cache.clear(server_id);
    }

    pub fn close_all(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        debug!("closing {} upstream session(s)", ids.len());
        for id in ids {
            self.close(&id);
        }
    }

    pub fn status_of(&self, server_id: &str) -> Option<SessionState> {
        self.get(server_id).map(|s| s.state())
    }

    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&str, &Arc<UpstreamSession>),
    {
        for entry in self.sessions.iter() {
            f(entry.key(), entry.value());
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Make sure a usable snapshot exists for this server: connect if
    /// needed, discover once, and store the result atomically. No-op when a
    /// fresh snapshot is already cached.
    pub async fn ensure_discovered(
        &self,
        config: &UpstreamServerConfig,
        ctx: &InvocationContext,
    ) -> UpstreamResult<()> {
        if self.cache.is_fresh(&config.id) {
            return Ok(());
        }
        let session = self.get_or_open(config)?;
        let snapshot = session.discover_all(ctx).await?;
        self.cache.store(&config.id, snapshot);
        Ok(())
    }

    /// Re-discover capabilities right now, replacing the snapshot.
    pub async fn refresh(
        &self,
        config: &UpstreamServerConfig,
        ctx: &InvocationContext,
    ) -> UpstreamResult<CapabilitySnapshot> {
        let session = self.get_or_open(config)?;
        let snapshot = session.discover_all(ctx).await?;
        self.cache.store(&config.id, snapshot.clone());
        Ok(snapshot)
    }

    /// Drop the snapshot and push the session toward `disconnected`.
    pub fn clear_cache(&self, server_id: &str) {
        self.cache.clear(server_id);
        if let Some(session) = self.get(server_id) {
            session.disconnect();
        }
    }

    /// Wipe stored credentials for a server.
    pub fn clear_auth(&self, server_id: &str) -> UpstreamResult<()> {
        let session = self
            .get(server_id)
            .ok_or_else(|| UpstreamError::Unavailable(format!("no session for {}", server_id)))?;
        session.clear_auth();
        self.cache.clear(server_id);
        Ok(())
    }
}
