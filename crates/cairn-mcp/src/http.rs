//! HTTP transport for remote AI agents.
//!
//! Serves the MCP protocol through rmcp's StreamableHttpService.
//!
//! ## Endpoints
//!
//! - `POST /mcp` - JSON-RPC requests
//! - `GET /mcp` - SSE stream for server-initiated messages
//! - `GET /health` - Health check with provider status
//! - `GET /` - Server info

use crate::server::CairnServer;
use axum::{
    extract::State,
    response::{Html, IntoResponse, Json},
    routing::get,
    Router,
};
use cairn_core::SandboxService;
use rmcp::transport::streamable_http_server::{
    session::local::LocalSessionManager, StreamableHttpServerConfig, StreamableHttpService,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Build the HTTP router for the MCP server.
///
/// The returned router can be served directly with axum or composed
/// into a larger application.
pub fn build_router(server: CairnServer) -> Router {
    tracing::debug!("Building HTTP router");

    let service = server.service();
    let session_manager = Arc::new(LocalSessionManager::default());
    let mcp_service = StreamableHttpService::new(
        move || Ok(server.clone()),
        session_manager,
        StreamableHttpServerConfig::default(),
    );

    let router = Router::new()
        .route("/health", get(health_handler))
        .route("/", get(root_handler))
        .with_state(service)
        // MCP endpoint
        .fallback_service(mcp_service)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    tracing::debug!("HTTP router built with routes: /, /health, /mcp");
    router
}

/// Health check endpoint. Reports cached provider health, no probing.
async fn health_handler(State(service): State<Arc<SandboxService>>) -> impl IntoResponse {
    tracing::trace!("Health check request");
    let providers: serde_json::Map<String, serde_json::Value> = service
        .list_provider_health()
        .into_iter()
        .map(|(name, status)| (name, serde_json::Value::String(status.to_string())))
        .collect();
    Json(serde_json::json!({
        "status": "healthy",
        "service": "cairn-mcp",
        "sandboxes": service.list_instances().len(),
        "providers": providers,
    }))
}

/// Root endpoint with server info.
async fn root_handler() -> impl IntoResponse {
    tracing::trace!("Root page request");
    Html(
        r#"<!DOCTYPE html>
<html>
<head>
    <title>Cairn MCP Server</title>
    <style>
        body { font-family: system-ui; max-width: 800px; margin: 50px auto; padding: 20px; }
        code { background: #f4f4f4; padding: 2px 6px; border-radius: 3px; }
        pre { background: #f4f4f4; padding: 16px; border-radius: 6px; overflow-x: auto; }
    </style>
</head>
<body>
    <h1>Cairn MCP Server</h1>
    <p>Model Context Protocol server for sandboxes on local and remote providers.</p>

    <h2>Endpoints</h2>
    <ul>
        <li><code>POST /mcp</code> - MCP JSON-RPC requests</li>
        <li><code>GET /mcp</code> - SSE stream for server messages</li>
        <li><code>GET /health</code> - Health check</li>
    </ul>

    <h2>Example</h2>
    <pre>curl -X POST http://localhost:8080/mcp \
  -H "Content-Type: application/json" \
  -d '{"jsonrpc":"2.0","id":1,"method":"tools/list"}'</pre>

    <h2>Available Tools</h2>
    <ul>
        <li><code>create_sandbox</code>, <code>destroy_sandbox</code>, <code>list_sandboxes</code>, <code>sandbox_state</code></li>
        <li><code>run_command</code>, <code>command_history</code></li>
        <li><code>list_files</code>, <code>upload_file</code>, <code>download_file</code></li>
        <li><code>create_snapshot</code>, <code>restore_snapshot</code>, <code>list_snapshots</code></li>
        <li><code>provider_health</code></li>
    </ul>
</body>
</html>"#,
    )
}

/// Start the HTTP server.
///
/// Runs until the provided shutdown future resolves.
pub async fn serve(
    server: CairnServer,
    addr: std::net::SocketAddr,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), std::io::Error> {
    let router = build_router(server);

    tracing::info!(%addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::debug!(%addr, "TCP listener bound");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}
