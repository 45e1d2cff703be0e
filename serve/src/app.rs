//! Axum app: shared state and the route table.

use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Request};
use axum::http::HeaderValue;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post, put};
use axum::Router;

use trellis::ChatPipeline;

use crate::{chat, process, recall_api, static_files};

/// Permissive CORS headers, applied when `ENABLE_CORS` is set.
async fn cors_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        "access-control-allow-origin",
        HeaderValue::from_static("*"),
    );
    headers.insert(
        "access-control-allow-headers",
        HeaderValue::from_static("authorization, content-type, x-access-token"),
    );
    headers.insert(
        "access-control-allow-methods",
        HeaderValue::from_static("GET, POST, PUT, DELETE, OPTIONS"),
    );
    response
}

/// Shared state for every handler.
pub struct AppState {
    pub pipeline: Arc<ChatPipeline>,
}

impl AppState {
    pub fn new(pipeline: Arc<ChatPipeline>) -> Arc<Self> {
        Arc::new(Self { pipeline })
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let enable_cors = state.pipeline.config.enable_cors;
    let router = Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/api/v1/chat", post(chat::chat_handler))
        .route(
            "/process",
            post(process::process_handler).put(process::process_handler),
        )
        .route(
            "/api/v1/file-recall/instances",
            post(recall_api::create_instance).get(recall_api::list_instances),
        )
        .route(
            "/api/v1/file-recall/instances/:id",
            put(recall_api::update_instance).delete(recall_api::delete_instance),
        )
        .route(
            "/api/v1/file-recall/:id/files",
            get(recall_api::list_files),
        )
        .route(
            "/api/v1/file-recall/:id/stats",
            get(recall_api::instance_stats),
        )
        .route(
            "/api/v1/file-recall/:id/upload",
            post(recall_api::upload).layer(DefaultBodyLimit::disable()),
        )
        .route(
            "/api/v1/file-recall/:id/files/:file_id",
            axum::routing::delete(recall_api::delete_file),
        )
        .route(
            "/:user/:folder/volume/*path",
            get(static_files::serve_volume_file),
        )
        .layer(DefaultBodyLimit::max(64 * 1024 * 1024))
        .with_state(state);
    if enable_cors {
        router.layer(middleware::from_fn(cors_headers))
    } else {
        router
    }
}
