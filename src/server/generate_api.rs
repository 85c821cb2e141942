use crate::pipeline::events::EventSink;
use crate::pipeline::request::GenerateRequest;
use crate::server::ServerState;
use axum::{
    extract::State,
    http::StatusCode,
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    Json,
};
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::warn;

/// Runs the pipeline in its own task and relays events as SSE frames. When the
/// client goes away the receiver is dropped and the pipeline stops at its next
/// emit.
pub(crate) async fn generate_code_stream(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<GenerateRequest>,
) -> Response {
    if request.prompt.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "prompt is required").into_response();
    }

    let (sink, rx) = EventSink::channel(state.event_buffer);
    let pipeline = state.pipeline.clone();
    tokio::spawn(async move {
        if let Err(e) = pipeline.run_generation(&request, &sink).await {
            warn!("Generation ended without completing: {:#}", e);
        }
    });

    let stream = ReceiverStream::new(rx)
        .map(|event| Ok::<_, Infallible>(Event::default().data(event.to_json())));
    Sse::new(stream).into_response()
}

pub(crate) async fn list_models(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(json!({
        "providers": state.providers,
        "defaultModel": state.default_model,
    }))
}
