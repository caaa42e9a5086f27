//! Gateway configuration.
//!
//! Defaults come from the serde default functions below, a YAML file can
//! override them, and well-known environment variables override both.

use serde::{Deserialize, Serialize};

use crate::{upstream::UpstreamServerConfig, vmcp::types::VmcpDefinition};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Validation failed: {reason}")]
    ValidationFailed { reason: String },

    #[error("Invalid value for field '{field}': {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Port the inbound MCP surface listens on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Bind host.
    #[serde(default = "default_host")]
    pub host: String,

    /// Directory for file-backed state (blob payloads, logs).
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Relational store URL. The reference build wires the in-memory store;
    /// the value is kept so an external persistence layer can consume it.
    #[serde(default)]
    pub database_url: Option<String>,

    /// Global bound on concurrently running script tools.
    #[serde(default = "default_max_concurrent_scripts")]
    pub max_concurrent_scripts: usize,

    /// Maximum in-flight outbound calls per upstream.
    #[serde(default = "default_max_upstream_concurrency")]
    pub max_upstream_concurrency: usize,

    /// Queued calls allowed per upstream beyond the in-flight bound.
    #[serde(default = "default_queue_bound")]
    pub queue_bound: usize,

    /// End-to-end deadline for one inbound request, milliseconds.
    #[serde(default = "default_request_deadline_ms")]
    pub default_request_deadline_ms: u64,

    /// Recursion bound for nested template evaluation.
    #[serde(default = "default_template_max_depth")]
    pub template_max_depth: usize,

    /// Wall-clock bound for one script tool run, seconds.
    #[serde(default = "default_script_timeout_secs")]
    pub script_timeout_secs: u64,

    /// SSE liveness: silence beyond this marks the session errored, seconds.
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,

    /// Interpreter used by script tools.
    #[serde(default = "default_python_bin")]
    pub python_bin: String,

    /// Upstream servers registered at startup.
    #[serde(default)]
    pub servers: Vec<UpstreamServerConfig>,

    /// vMCP definitions loaded at startup.
    #[serde(default)]
    pub vmcps: Vec<VmcpDefinition>,
}

fn default_port() -> u16 {
    8200
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_max_concurrent_scripts() -> usize {
    8
}

fn default_max_upstream_concurrency() -> usize {
    16
}

fn default_queue_bound() -> usize {
    64
}

fn default_request_deadline_ms() -> u64 {
    120_000
}

fn default_template_max_depth() -> usize {
    8
}

fn default_script_timeout_secs() -> u64 {
    30
}

fn default_heartbeat_timeout_secs() -> u64 {
    60
}

fn default_python_bin() -> String {
    "python3".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            data_dir: default_data_dir(),
            database_url: None,
            max_concurrent_scripts: default_max_concurrent_scripts(),
            max_upstream_concurrency: default_max_upstream_concurrency(),
            queue_bound: default_queue_bound(),
            default_request_deadline_ms: default_request_deadline_ms(),
            template_max_depth: default_template_max_depth(),
            script_timeout_secs: default_script_timeout_secs(),
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
            python_bin: default_python_bin(),
            servers: Vec::new(),
            vmcps: Vec::new(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &str) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_string(),
            source,
        })?;
        let config: Self = serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment-variable overrides on top of the current values.
    pub fn apply_env(mut self) -> ConfigResult<Self> {
        if let Some(port) = env_parse::<u16>("PORT")? {
            self.port = port;
        }
        if let Ok(dir) = std::env::var("DATA_DIR") {
            self.data_dir = dir;
        }
        if let Ok(url) = std::env::var("DATABASE_URL") {
            self.database_url = Some(url);
        }
        if let Some(n) = env_parse::<usize>("MAX_CONCURRENT_SCRIPTS")? {
            self.max_concurrent_scripts = n;
        }
        if let Some(n) = env_parse::<usize>("MAX_UPSTREAM_CONCURRENCY")? {
            self.max_upstream_concurrency = n;
        }
        if let Some(n) = env_parse::<u64>("DEFAULT_REQUEST_DEADLINE_MS")? {
            self.default_request_deadline_ms = n;
        }
        if let Some(n) = env_parse::<usize>("TEMPLATE_MAX_DEPTH")? {
            self.template_max_depth = n;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_concurrent_scripts == 0 {
            return Err(ConfigError::ValidationFailed {
                reason: "max_concurrent_scripts must be at least 1".to_string(),
            });
        }
        if self.max_upstream_concurrency == 0 {
            return Err(ConfigError::ValidationFailed {
                reason: "max_upstream_concurrency must be at least 1".to_string(),
            });
        }
        if self.default_request_deadline_ms == 0 {
            return Err(ConfigError::ValidationFailed {
                reason: "default_request_deadline_ms must be positive".to_string(),
            });
        }
        if self.template_max_depth == 0 {
            return Err(ConfigError::ValidationFailed {
                reason: "template_max_depth must be at least 1".to_string(),
            });
        }
        let mut names = std::collections::HashSet::new();
        for vmcp in &self.vmcps {
            if !names.insert(vmcp.name.as_str()) {
                return Err(ConfigError::ValidationFailed {
                    reason: format!("duplicate vmcp name '{}'", vmcp.name),
                });
            }
            vmcp.validate()
                .map_err(|reason| ConfigError::ValidationFailed {
                    reason: format!("vmcp '{}': {}", vmcp.name, reason),
                })?;
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> ConfigResult<Option<T>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                field: key.to_string(),
                value: raw,
                reason: "not parseable".to_string(),
            }),
        Err(_) => Ok(None),
    }
}
