//! vMCP composition: the data model, the per-request context, the
//! composer, the inbound protocol adapter, and the control surface.

pub mod adapter;
pub mod composer;
pub mod context;
pub mod service;
pub mod types;

pub use composer::{Composer, ExposedSurface, Origin};
pub use context::InvocationContext;
pub use service::GatewayService;
pub use types::VmcpDefinition;
