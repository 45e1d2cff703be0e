//! `/process`: document-extraction passthrough.
//!
//! The gateway forwards the raw body to the configured extraction
//! collaborator and relays its JSON. The request shape is preserved so
//! extraction traffic stays visible in the gateway's logs.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::{debug, warn};

use crate::app::AppState;
use crate::auth::check_bearer;

pub async fn process_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let config = &state.pipeline.config;
    if let Err(status) = check_bearer(&headers, &config.bearer_token) {
        return status.into_response();
    }
    let Some(extract_url) = config.extract_api_url.clone() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            axum::Json(json!({ "error": "no extraction backend configured" })),
        )
            .into_response();
    };

    debug!(bytes = body.len(), "forwarding /process to extraction backend");
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();
    let result = reqwest::Client::new()
        .post(&extract_url)
        .header(header::CONTENT_TYPE, content_type)
        .body(body.to_vec())
        .send()
        .await;

    match result {
        Ok(resp) => {
            let status =
                StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
            let bytes = resp.bytes().await.unwrap_or_default();
            (
                status,
                [(header::CONTENT_TYPE, "application/json")],
                bytes.to_vec(),
            )
                .into_response()
        }
        Err(e) => {
            warn!(error = %e, "extraction backend unreachable");
            (
                StatusCode::BAD_GATEWAY,
                axum::Json(json!({ "error": format!("extraction backend: {e}") })),
            )
                .into_response()
        }
    }
}
