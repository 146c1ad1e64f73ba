use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::api::{self, AppState, SharedState};
use super::ws;
use crate::analysis::AnthropicRequester;
use crate::config::FixloopConfig;
use crate::extract::Extractor;
use crate::lifecycle::{InMemoryStore, Orchestrator, OrchestratorSettings};
use crate::repo::RepositoryPool;
use crate::repo::git::{CommitIdentity, GitRepositoryFactory};

/// Listener settings for `fixloop serve`.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Permissive CORS for a UI served from another origin.
    pub dev_mode: bool,
}

impl ServerConfig {
    pub fn from_config(config: &FixloopConfig, dev_mode: bool) -> Self {
        Self {
            host: config.toml.server.host.clone(),
            port: config.toml.server.port,
            dev_mode,
        }
    }
}

/// Build the full application router: API routes plus the event socket.
pub fn build_router(state: SharedState) -> Router {
    api::api_router()
        .route("/ws", get(ws::ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Wire the production collaborators: git working copies under the
/// configured workspace, the Anthropic client and an in-memory registry.
pub fn build_state(config: &FixloopConfig) -> Result<SharedState> {
    let workspace_root = config.workspace_root();
    std::fs::create_dir_all(&workspace_root).with_context(|| {
        format!(
            "Failed to create workspace directory {}",
            workspace_root.display()
        )
    })?;

    let identity = CommitIdentity {
        name: config.toml.git.author_name.clone(),
        email: config.toml.git.author_email.clone(),
    };
    let factory = GitRepositoryFactory::new(workspace_root, config.github_token.clone(), identity);
    let requester = AnthropicRequester::new(&config.toml.analysis, config.anthropic_api_key.clone())
        .context("Failed to build analysis client")?;
    let extractor = Extractor::from_names(&config.toml.extract.producers)?;

    let orchestrator = Orchestrator::new(
        Arc::new(InMemoryStore::new()),
        Arc::new(RepositoryPool::new(Arc::new(factory))),
        Arc::new(requester),
        extractor,
        OrchestratorSettings::from_config(config),
    );

    Ok(Arc::new(AppState {
        orchestrator: Arc::new(orchestrator),
        shutdown: CancellationToken::new(),
    }))
}

/// Run the HTTP server until Ctrl+C. In-flight proposal requests and applies
/// are cancelled on shutdown.
pub async fn start_server(config: &FixloopConfig, server: ServerConfig) -> Result<()> {
    for warning in config.validate() {
        tracing::warn!("{}", warning);
    }

    let state = build_state(config)?;
    let shutdown = state.shutdown.clone();

    let mut app = build_router(state);
    if server.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let addr = format!("{}:{}", server.host, server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!(addr = %local_addr, workspace = %config.workspace_root().display(), "fixloop listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await
        .context("Server error")?;

    tracing::info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for Ctrl+C; shutting down");
    }
    tracing::info!("shutting down");
    shutdown.cancel();
}
