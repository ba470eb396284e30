//! VIGIL API Server Entry Point
//!
//! Loads the server configuration, builds the engine and starts the Axum
//! HTTP server.

use axum::Router;
use vigil_api::telemetry::{init_tracing, TelemetryConfig};
use vigil_api::{bootstrap, create_api_router, ApiError, ApiResult, ServerConfig};

#[tokio::main]
async fn main() -> ApiResult<()> {
    init_tracing(&TelemetryConfig::default())?;

    let config = ServerConfig::load(std::env::args().skip(1))?;
    let engine = bootstrap(&config).await?;
    tracing::info!(
        dispatch_mode = %engine.config.dispatch_mode,
        agents = config.agents.len(),
        gateway = ?config.tool.as_ref().map(|t| t.base_url.as_str()),
        "Engine ready"
    );

    let app: Router = create_api_router(engine.control.clone());

    let addr = config.bind_addr()?;
    tracing::info!(%addr, "Starting VIGIL API server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ApiError::internal_error(format!("Failed to bind {}: {}", addr, e)))?;

    let server = axum::serve(listener, app);
    tokio::select! {
        result = server => {
            result.map_err(|e| ApiError::internal_error(format!("Server error: {}", e)))?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
    }

    Ok(())
}
