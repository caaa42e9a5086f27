//! Virtual MCP aggregation gateway.
//!
//! Speaks the Model Context Protocol to downstream clients and composes,
//! per named vMCP, a unified tool/resource/prompt surface multiplexed over
//! many upstream MCP servers plus user-defined custom tools.

pub mod app_context;
pub mod config;
pub mod error;
pub mod observability;
pub mod protocols;
pub mod server;
pub mod store;
pub mod template;
pub mod tools;
pub mod upstream;
pub mod vmcp;

pub use app_context::AppContext;
pub use config::GatewayConfig;
pub use error::{GatewayError, GatewayResult};
