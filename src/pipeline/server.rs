use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;
use tracing::info;

use super::agent::{AgentCapability, ClaudeAgent};
use super::api::{self, AppState, SharedState};
use super::db::{DbHandle, PlannerDb};
use super::orchestrator::Orchestrator;
use super::reaper;
use crate::config::AppConfig;

pub fn build_router(state: SharedState) -> Router {
    api::api_router().with_state(state)
}

/// Start the planner server: open the database, spawn the reaper loop, and
/// serve the API until shutdown.
pub async fn start_server(config: AppConfig) -> Result<()> {
    if let Some(parent) = config.server.db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }
    }

    let db = DbHandle::new(
        PlannerDb::new(&config.server.db_path).context("Failed to initialize planner database")?,
    );
    let agent: Arc<dyn AgentCapability> = Arc::new(ClaudeAgent::new());
    let orchestrator = Orchestrator::new(
        db.clone(),
        agent,
        config.pipeline.clone(),
        config.reaper.clone(),
    );

    let reaper_handle = reaper::spawn(db, config.reaper.clone());

    let state = Arc::new(AppState { orchestrator });
    let mut app = build_router(state);
    if config.server.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let host = if config.server.dev_mode {
        "0.0.0.0"
    } else {
        "127.0.0.1"
    };
    let addr = format!("{}:{}", host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    info!("plansmith running at http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    reaper_handle.abort();
    info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    info!("shutting down");
}
