//! Upstream MCP client side: sessions, the registry that pools them, the
//! capability cache, and the authentication policies they share.

pub mod auth;
pub mod error;
pub mod inventory;
pub mod registry;
pub mod session;
pub mod sse;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::upstream::auth::AuthPolicy;

pub use error::{UpstreamError, UpstreamResult};
pub use registry::UpstreamRegistry;
pub use session::{SessionLimits, SessionState, UpstreamSession};

/// Transport used to reach an upstream server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Http,
    Sse,
}

/// Persisted configuration of one upstream MCP server.
#[derive(Clone, Serialize, Deserialize)]
pub struct UpstreamServerConfig {
    pub id: String,
    pub name: String,
    pub transport: TransportKind,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub auth: AuthPolicy,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Tear the session down after each operation instead of keeping the
    /// channel alive.
    #[serde(default)]
    pub close_after_use: bool,
}

fn default_enabled() -> bool {
    true
}

impl std::fmt::Debug for UpstreamServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamServerConfig")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("transport", &self.transport)
            .field("url", &self.url)
            .field("headers", &self.headers.keys().collect::<Vec<_>>())
            .field("auth", &self.auth)
            .field("enabled", &self.enabled)
            .finish()
    }
}

impl UpstreamServerConfig {
    pub fn new(id: impl Into<String>, name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            transport: TransportKind::Http,
            url: url.into(),
            headers: HashMap::new(),
            auth: AuthPolicy::None,
            enabled: true,
            close_after_use: false,
        }
    }
}
