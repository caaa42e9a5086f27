//! HTTP server wiring for the inbound MCP surface.

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tokio::signal;
use tracing::info;

use crate::{
    app_context::AppContext,
    error::{GatewayError, GatewayResult},
    vmcp::adapter::{handle_rpc, handle_streamable, AdapterState, McpAdapter},
};

pub fn build_router(app: Arc<AppContext>) -> Router {
    let state = AdapterState {
        app,
        adapter: Arc::new(McpAdapter::new()),
    };

    Router::new()
        .route("/private/{vmcp_name}/vmcp", post(handle_streamable))
        .route("/private/{vmcp_name}/rpc", post(handle_rpc))
        .route("/health", get(|| async { "ok" }))
        .with_state(state)
}

pub async fn run(app: Arc<AppContext>) -> GatewayResult<()> {
    let addr = format!("{}:{}", app.config.host, app.config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| GatewayError::Internal(format!("bind {}: {}", addr, e)))?;
    let local = listener
        .local_addr()
        .map_err(|e| GatewayError::Internal(e.to_string()))?;
    info!("vmcp gateway listening on {}", local);

    let router = build_router(Arc::clone(&app));
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| GatewayError::Internal(format!("server error: {}", e)))?;

    info!("shutting down; closing upstream sessions");
    app.registry.close_all();
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
