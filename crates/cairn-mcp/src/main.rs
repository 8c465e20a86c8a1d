//! Cairn MCP Server entry point.
//!
//! Starts the MCP server on stdio, HTTP, or both (the default).

use cairn_core::SandboxService;
use cairn_mcp::{http, CairnServer, ServerConfig, TransportMode};
use rmcp::transport::stdio;
use rmcp::ServiceExt;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr, stdout is the MCP transport
    tracing_subscriber::registry()
        .with(
            EnvFilter::from_default_env()
                .add_directive("cairn_mcp=info".parse()?)
                .add_directive("cairn_core=info".parse()?),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::info!("Starting Cairn MCP Server");

    let config = ServerConfig::from_env();
    tracing::info!(
        transport = ?config.transport_mode,
        http_addr = %config.http_addr,
        default_provider = %config.service.default_provider,
        "Configuration loaded"
    );

    // The service owns a private runtime; build it off the async workers.
    let service_config = config.service.clone();
    let service = tokio::task::spawn_blocking(move || SandboxService::new(service_config))
        .await??;
    let service = Arc::new(service);
    let server = CairnServer::new(Arc::clone(&service));

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let mut handles = Vec::new();

    if config.transport_mode.http_enabled() {
        let http_server = server.clone();
        let http_addr = config.http_addr;
        let mut shutdown_rx = shutdown_tx.subscribe();

        handles.push(tokio::spawn(async move {
            let shutdown = async move {
                let _ = shutdown_rx.recv().await;
            };
            if let Err(e) = http::serve(http_server, http_addr, shutdown).await {
                tracing::error!(error = %e, "HTTP server error");
            }
        }));
        tracing::info!(addr = %config.http_addr, "HTTP transport enabled");
    }

    if config.transport_mode.stdio_enabled() {
        let stdio_server = server.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();

        handles.push(tokio::spawn(async move {
            match stdio_server.serve(stdio()).await {
                Ok(service) => {
                    tokio::select! {
                        result = service.waiting() => {
                            if let Err(e) = result {
                                tracing::error!(error = %e, "Stdio service error");
                            }
                        }
                        _ = async { shutdown_rx.recv().await } => {
                            tracing::info!("Stdio transport shutting down");
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to start stdio transport");
                }
            }
        }));
        tracing::info!("Stdio transport enabled");
    }

    match config.transport_mode {
        TransportMode::Both => {
            tracing::info!(http_addr = %config.http_addr, "Server ready (stdio + HTTP)")
        }
        TransportMode::Http => {
            tracing::info!(http_addr = %config.http_addr, "Server ready (HTTP only)")
        }
        TransportMode::Stdio => tracing::info!("Server ready (stdio only)"),
    }

    signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal, cleaning up...");

    let _ = shutdown_tx.send(());

    // Destroys every live sandbox and drains the bridge.
    let cleanup = Arc::clone(&service);
    if tokio::task::spawn_blocking(move || cleanup.shutdown()).await? {
        tracing::info!("All sandboxes cleaned up");
    } else {
        tracing::warn!("Shutdown grace expired with operations still in flight");
    }

    for handle in handles {
        let _ = handle.await;
    }

    // Drop the last service handle off the async workers as well.
    drop(server);
    tokio::task::spawn_blocking(move || drop(service)).await?;

    tracing::info!("Server shutdown complete");
    Ok(())
}
