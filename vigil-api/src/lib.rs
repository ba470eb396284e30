//! VIGIL API - HTTP Control Surface
//!
//! Exposes the execution engine's control operations over REST (Axum).
//! Caller identity comes from the `x-vigil-user` header; errors are JSON
//! `{code, message, details?}` with a status derived from the code.

pub mod config;
pub mod error;
pub mod extract;
pub mod routes;
pub mod telemetry;
pub mod types;

use axum::Router;
use std::sync::Arc;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::trace::TraceLayer;
use vigil_core::VigilResult;
use vigil_engine::{ControlApi, Engine, EngineBuilder};
use vigil_storage::{ExecutionStore, InMemoryFileStore, InMemoryStore};
use vigil_tools::{HttpToolInvoker, RetryingInvoker, ToolInvoker};

pub use config::{AgentSeed, ServerConfig, ToolEndpointConfig};
pub use error::{ApiError, ApiResult, ErrorCode};
pub use extract::{Caller, CALLER_HEADER};
pub use routes::ApiState;
pub use types::*;

/// Requests served at once before callers queue.
const MAX_CONCURRENT_REQUESTS: usize = 256;

/// Name the gateway invoker is registered under and the fallback for
/// actions naming an unregistered tool.
pub const GATEWAY_TOOL: &str = "gateway";

/// Full router with tracing and a concurrency limit.
pub fn create_api_router(control: ControlApi) -> Router {
    routes::create_router(Arc::new(ApiState::new(control)))
        .layer(ConcurrencyLimitLayer::new(MAX_CONCURRENT_REQUESTS))
        .layer(TraceLayer::new_for_http())
}

/// Build an engine over in-memory stores and register the configured
/// gateway and agents.
pub async fn bootstrap(config: &ServerConfig) -> VigilResult<Engine> {
    let store = Arc::new(InMemoryStore::new());
    let files = Arc::new(InMemoryFileStore::new());

    let mut builder = EngineBuilder::new(store.clone(), files).with_config(config.engine.clone());
    if let Some(tool) = &config.tool {
        let invoker = gateway_invoker(tool, config)?;
        builder = builder
            .with_tool(GATEWAY_TOOL, invoker.clone())
            .with_default_tool(invoker);
    }
    let engine = builder.build()?;

    for seed in config.agents.iter().cloned() {
        let agent = seed.into_agent();
        store.agent_insert(&agent).await?;
        tracing::info!(
            agent_id = %agent.agent_id,
            owner_user_id = %agent.owner_user_id,
            name = %agent.name,
            "Registered agent"
        );
    }

    Ok(engine)
}

fn gateway_invoker(
    tool: &ToolEndpointConfig,
    config: &ServerConfig,
) -> VigilResult<Arc<dyn ToolInvoker>> {
    let http = HttpToolInvoker::new(GATEWAY_TOOL, tool.http_config())?;
    let invoker: Arc<dyn ToolInvoker> = match tool.retry_config(&config.engine) {
        Some(retry) => Arc::new(RetryingInvoker::new(http, retry)),
        None => Arc::new(http),
    };
    Ok(invoker)
}
