mod generate_api;

use crate::config::{Config, ProviderKind};
use crate::pipeline::Pipeline;
use axum::{
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

use generate_api::{generate_code_stream, list_models};

pub struct ServerState {
    pub pipeline: Pipeline,
    pub providers: Vec<ProviderInfo>,
    pub default_model: String,
    /// Capacity of each request's event channel.
    pub event_buffer: usize,
}

/// Public view of a configured provider. Never carries credentials.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderInfo {
    pub id: String,
    pub kind: ProviderKind,
    pub url: String,
}

impl ServerState {
    pub fn new(pipeline: Pipeline, config: &Config) -> Self {
        Self {
            pipeline,
            providers: config
                .providers
                .iter()
                .map(|p| ProviderInfo {
                    id: p.id.clone(),
                    kind: p.kind,
                    url: p.url.clone(),
                })
                .collect(),
            default_model: config.generation.default_model.clone(),
            event_buffer: config.server.event_buffer,
        }
    }
}

pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/api/generate-code-stream", post(generate_code_stream))
        .route("/api/models", get(list_models))
        .route("/api/health", get(health_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub struct ServerHandle {
    pub task: tokio::task::JoinHandle<anyhow::Result<()>>,
    pub port: u16,
}

pub async fn prepare_server(state: Arc<ServerState>, host: &str, port: u16) -> anyhow::Result<ServerHandle> {
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(format!("{}:{}", host, port)).await?;
    let actual_port = listener.local_addr()?.port();

    let task = tokio::spawn(async move {
        axum::serve(listener, app).await?;
        Ok(())
    });

    Ok(ServerHandle {
        task,
        port: actual_port,
    })
}

pub async fn start_server(state: Arc<ServerState>, host: &str, port: u16) -> anyhow::Result<()> {
    let handle = prepare_server(state, host, port).await?;
    info!("Server running on http://{}:{}", host, handle.port);
    handle.task.await??;
    Ok(())
}

async fn health_handler() -> impl IntoResponse {
    axum::Json(json!({ "ok": true }))
}
