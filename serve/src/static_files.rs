//! Static serving of conversation volumes:
//! `GET /:user/:folder/volume/*path`, pinned under the data root.

use std::path::{Component, Path as FsPath, PathBuf};
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::app::AppState;

fn mime_for(path: &FsPath) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("pdf") => "application/pdf",
        Some("md") => "text/markdown; charset=utf-8",
        Some("txt") => "text/plain; charset=utf-8",
        Some("html") => "text/html; charset=utf-8",
        Some("json") => "application/json",
        Some("csv") => "text/csv",
        _ => "application/octet-stream",
    }
}

/// Rejects any path component that could climb out of the data root.
fn safe_component(segment: &str) -> bool {
    !segment.is_empty()
        && FsPath::new(segment)
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
}

pub async fn serve_volume_file(
    State(state): State<Arc<AppState>>,
    Path((user, folder, rest)): Path<(String, String, String)>,
) -> Response {
    if !safe_component(&user) || !safe_component(&folder) {
        return StatusCode::FORBIDDEN.into_response();
    }
    let mut full: PathBuf = state.pipeline.config.data_root.clone();
    full.push(&user);
    full.push(&folder);
    full.push("volume");
    for segment in rest.split('/') {
        if !safe_component(segment) || segment == ".." {
            return StatusCode::FORBIDDEN.into_response();
        }
        full.push(segment);
    }

    // Belt and braces: the resolved path must stay under the data root.
    let root = match state.pipeline.config.data_root.canonicalize() {
        Ok(root) => root,
        Err(_) => return StatusCode::NOT_FOUND.into_response(),
    };
    let resolved = match full.canonicalize() {
        Ok(resolved) => resolved,
        Err(_) => return StatusCode::NOT_FOUND.into_response(),
    };
    if !resolved.starts_with(&root) {
        return StatusCode::FORBIDDEN.into_response();
    }

    match tokio::fs::read(&resolved).await {
        Ok(bytes) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, mime_for(&resolved))],
            bytes,
        )
            .into_response(),
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: traversal-shaped segments are rejected, plain names pass.
    #[test]
    fn component_safety() {
        assert!(safe_component("alice"));
        assert!(safe_component("report.pdf"));
        assert!(!safe_component(".."));
        assert!(!safe_component(""));
        assert!(!safe_component("/etc"));
    }

    /// **Scenario**: common extensions map to their media types.
    #[test]
    fn mime_mapping() {
        assert_eq!(mime_for(FsPath::new("a.png")), "image/png");
        assert_eq!(mime_for(FsPath::new("r.pdf")), "application/pdf");
        assert_eq!(mime_for(FsPath::new("x.bin")), "application/octet-stream");
    }
}
