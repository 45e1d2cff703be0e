//! File-recall HTTP API: admin instance CRUD (gateway bearer) and
//! per-instance operations (`X-Access-Token`).

use std::sync::Arc;

use axum::extract::{Multipart, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use trellis::recall::{ALLOWED_EXTENSIONS, MAX_BATCH_FILES, MAX_FILE_BYTES};
use trellis::{GatewayError, RecallInstanceRow};

use crate::app::AppState;
use crate::auth::{access_token, check_bearer};

fn error_response(error: GatewayError) -> Response {
    let status = match &error {
        GatewayError::Validation(message) if message.contains("already exists") => {
            StatusCode::CONFLICT
        }
        GatewayError::Validation(_) => StatusCode::BAD_REQUEST,
        GatewayError::Recall(message) if message.contains("no such") => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "error": error.to_string() }))).into_response()
}

fn instance_json(row: &RecallInstanceRow, with_token: bool) -> serde_json::Value {
    let mut value = json!({
        "id": row.id,
        "name": row.name,
        "vector_store_id": row.vector_store_id,
        "created_at": row.created_at,
    });
    if with_token {
        value["access_token"] = json!(row.access_token);
    }
    value
}

/// Admin guard: gateway bearer required.
fn admin(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    check_bearer(headers, &state.pipeline.config.bearer_token)
        .map_err(|status| status.into_response())
}

/// Instance guard: the instance must exist (404) and the presented access
/// token must match (403).
async fn instance_auth(
    state: &AppState,
    headers: &HeaderMap,
    id: &str,
) -> Result<RecallInstanceRow, Response> {
    let row = match state.pipeline.store.get_recall_instance(id).await {
        Ok(Some(row)) => row,
        Ok(None) => {
            return Err((
                StatusCode::NOT_FOUND,
                Json(json!({ "error": format!("no such instance: {id}") })),
            )
                .into_response())
        }
        Err(e) => return Err(error_response(e.into())),
    };
    match access_token(headers) {
        Some(token) if token == row.access_token => Ok(row),
        _ => Err(StatusCode::FORBIDDEN.into_response()),
    }
}

#[derive(Deserialize)]
pub struct CreateInstanceBody {
    pub id: String,
    pub name: String,
    pub openai_api_key: String,
}

pub async fn create_instance(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateInstanceBody>,
) -> Response {
    if let Err(resp) = admin(&state, &headers) {
        return resp;
    }
    match state
        .pipeline
        .recall
        .create_instance(&body.id, &body.name, &body.openai_api_key)
        .await
    {
        // The one time the token is shown: at creation.
        Ok(row) => (StatusCode::CREATED, Json(instance_json(&row, true))).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn list_instances(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = admin(&state, &headers) {
        return resp;
    }
    match state.pipeline.store.list_recall_instances().await {
        Ok(rows) => Json(json!({
            "instances": rows.iter().map(|r| instance_json(r, true)).collect::<Vec<_>>()
        }))
        .into_response(),
        Err(e) => error_response(e.into()),
    }
}

#[derive(Deserialize)]
pub struct UpdateInstanceBody {
    pub name: Option<String>,
    pub openai_api_key: Option<String>,
}

pub async fn update_instance(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<UpdateInstanceBody>,
) -> Response {
    if let Err(resp) = admin(&state, &headers) {
        return resp;
    }
    match state
        .pipeline
        .store
        .update_recall_instance(&id, body.name, body.openai_api_key)
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(trellis::StoreError::NotFound(_)) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => error_response(e.into()),
    }
}

pub async fn delete_instance(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if let Err(resp) = admin(&state, &headers) {
        return resp;
    }
    match state.pipeline.recall.delete_instance(&id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn list_files(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    let _row = match instance_auth(&state, &headers, &id).await {
        Ok(row) => row,
        Err(resp) => return resp,
    };
    match state.pipeline.store.list_recall_files(&id).await {
        Ok(files) => Json(json!({
            "files": files.iter().map(|f| json!({
                "id": f.id,
                "filename": f.filename,
                "size": f.size,
                "sha256": f.sha256,
                "status": f.status,
                "error": f.error,
                "created_at": f.created_at,
            })).collect::<Vec<_>>()
        }))
        .into_response(),
        Err(e) => error_response(e.into()),
    }
}

pub async fn instance_stats(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    let row = match instance_auth(&state, &headers, &id).await {
        Ok(row) => row,
        Err(resp) => return resp,
    };
    match state.pipeline.store.recall_stats(&id).await {
        Ok((file_count, total_size_bytes)) => Json(json!({
            "file_count": file_count,
            "total_size_bytes": total_size_bytes,
            "supported_types": ALLOWED_EXTENSIONS,
            "vector_store_id": row.vector_store_id,
        }))
        .into_response(),
        Err(e) => error_response(e.into()),
    }
}

pub async fn upload(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    mut multipart: Multipart,
) -> Response {
    if let Err(resp) = instance_auth(&state, &headers, &id).await {
        return resp;
    }

    let mut results = Vec::new();
    let mut count = 0usize;
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "multipart read failed");
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "error": format!("multipart: {e}") })),
                )
                    .into_response();
            }
        };
        let filename = field.file_name().unwrap_or("unnamed").to_string();
        count += 1;
        if count > MAX_BATCH_FILES {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": format!("too many files (max {MAX_BATCH_FILES})") })),
            )
                .into_response();
        }
        let bytes = match field.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => {
                results.push(json!({
                    "filename": filename,
                    "action": "error",
                    "message": format!("read failed: {e}"),
                }));
                continue;
            }
        };
        if bytes.len() as u64 > MAX_FILE_BYTES {
            results.push(json!({
                "filename": filename,
                "action": "error",
                "message": format!("file exceeds {} MiB limit", MAX_FILE_BYTES / (1024 * 1024)),
            }));
            continue;
        }
        match state
            .pipeline
            .recall
            .upload(&id, &filename, bytes.to_vec())
            .await
        {
            Ok(result) => results.push(json!({
                "filename": result.filename,
                "action": result.action,
                "message": result.message,
            })),
            Err(e) => results.push(json!({
                "filename": filename,
                "action": "error",
                "message": e.to_string(),
            })),
        }
    }

    Json(json!({ "results": results })).into_response()
}

pub async fn delete_file(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((id, file_id)): Path<(String, String)>,
) -> Response {
    if let Err(resp) = instance_auth(&state, &headers, &id).await {
        return resp;
    }
    match state.pipeline.recall.delete_file(&id, &file_id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}
