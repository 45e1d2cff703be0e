//! The chat endpoint: request parsing, allow-listing, SSE framing.
//!
//! Streaming responses frame text deltas in the OpenAI-compatible envelope
//! and carry `status`/`source` as named SSE events; the stream terminates
//! with a `finish_reason: "stop"` chunk and `data: [DONE]`. Non-streaming
//! callers get one `chat.completion` JSON body. Upstream failures surface
//! as an inline error chunk and a clean stream close.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;

use stream_event::{ChatEvent, ChunkMeta, ChunkUsage, EventsToSse, SSE_DONE};
use trellis::{ChatRequest, EventSink, GatewayError};

use crate::app::AppState;
use crate::auth::check_bearer;

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn completion_id() -> String {
    format!("chatcmpl-{}", uuid::Uuid::new_v4().simple())
}

fn error_status(error: &GatewayError) -> StatusCode {
    match error {
        GatewayError::Unauthorized => StatusCode::UNAUTHORIZED,
        GatewayError::Validation(_) => StatusCode::BAD_REQUEST,
        GatewayError::InstanceNotAllowed(_) => StatusCode::FORBIDDEN,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub async fn chat_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let config = &state.pipeline.config;
    if let Err(status) = check_bearer(&headers, &config.bearer_token) {
        return status.into_response();
    }

    let request: ChatRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                axum::Json(json!({ "error": format!("invalid request body: {e}") })),
            )
                .into_response();
        }
    };

    // Allow-list: the declared source instance, or the peer address.
    let identity = request
        .owui_instance
        .clone()
        .unwrap_or_else(|| peer.ip().to_string());
    if !config.allowed_instances.allows(&identity) {
        warn!(identity = %identity, "source instance rejected");
        return (
            StatusCode::FORBIDDEN,
            axum::Json(json!({ "error": format!("instance not allowed: {identity}") })),
        )
            .into_response();
    }

    if request.stream {
        stream_response(state, request).await
    } else {
        json_response(state, request).await
    }
}

async fn json_response(state: Arc<AppState>, request: ChatRequest) -> Response {
    let sink = EventSink::discard();
    match state.pipeline.process(&request, &sink).await {
        Ok(outcome) => {
            let usage = &outcome.usage;
            axum::Json(json!({
                "id": completion_id(),
                "object": "chat.completion",
                "created": unix_now(),
                "model": request.config.llm_model,
                "choices": [{
                    "index": 0,
                    "message": { "role": "assistant", "content": outcome.content },
                    "finish_reason": outcome.stop_reason.as_str(),
                }],
                "usage": {
                    "prompt_tokens": usage.input_tokens,
                    "completion_tokens": usage.output_tokens,
                    "total_tokens": usage.total(),
                }
            }))
            .into_response()
        }
        Err(error) => (
            error_status(&error),
            axum::Json(json!({ "error": error.to_string() })),
        )
            .into_response(),
    }
}

async fn stream_response(state: Arc<AppState>, request: ChatRequest) -> Response {
    let meta = ChunkMeta {
        id: completion_id(),
        model: request.config.llm_model.clone(),
        created: unix_now(),
    };
    let (event_tx, mut event_rx) = mpsc::channel::<ChatEvent>(256);
    let (body_tx, body_rx) = mpsc::channel::<Result<Bytes, std::convert::Infallible>>(256);

    // The pipeline task owns the sink; dropping it closes the event stream.
    let pipeline = state.pipeline.clone();
    let worker = tokio::spawn(async move {
        let sink = EventSink::new(event_tx);
        pipeline.process(&request, &sink).await
    });

    // Framing task: events in emission order, then the terminal chunks.
    tokio::spawn(async move {
        let mut adapter = EventsToSse::new(meta);
        let mut client_gone = false;
        while let Some(event) = event_rx.recv().await {
            if client_gone {
                // Keep draining so the pipeline never blocks on a dead client.
                continue;
            }
            if let Some(frame) = adapter.feed(&event) {
                if body_tx.send(Ok(Bytes::from(frame))).await.is_err() {
                    client_gone = true;
                }
            }
        }

        let result = worker.await;
        if client_gone {
            return;
        }
        match result {
            Ok(Ok(outcome)) => {
                adapter.set_usage(ChunkUsage {
                    prompt_tokens: outcome.usage.input_tokens as u32,
                    completion_tokens: outcome.usage.output_tokens as u32,
                    total_tokens: outcome.usage.total() as u32,
                });
            }
            Ok(Err(error)) => {
                // Inline error chunk, then a clean close.
                if let Some(frame) = adapter.feed(&ChatEvent::Text {
                    content: format!("\n\n[error] {error}"),
                }) {
                    let _ = body_tx.send(Ok(Bytes::from(frame))).await;
                }
            }
            Err(join_error) => {
                warn!(error = %join_error, "chat worker panicked");
            }
        }
        let _ = body_tx.send(Ok(Bytes::from(adapter.finish()))).await;
        let _ = body_tx.send(Ok(Bytes::from(SSE_DONE))).await;
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(ReceiverStream::new(body_rx)))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
