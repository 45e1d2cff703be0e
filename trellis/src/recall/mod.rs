//! File recall: multi-tenant document indexes with content-addressed dedup.
//!
//! Each instance binds one upstream vector-store credential and holds a
//! random bearer token for its own endpoints. Uploads are deduplicated by
//! SHA-256 within an instance, stored locally under a hash-prefix name, and
//! pushed upstream (the vector store itself is created lazily on first
//! upload). Deletion is best-effort upstream, authoritative locally.

mod vector_api;

pub use vector_api::VectorStoreClient;

use std::path::{Path, PathBuf};

use rand::RngCore;
use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::error::GatewayError;
use crate::store::{RecallFileRow, RecallInstanceRow, Store};

/// Extensions the upstream index accepts.
pub const ALLOWED_EXTENSIONS: &[&str] = &[
    "c", "cpp", "css", "csv", "doc", "docx", "go", "html", "java", "js", "json", "md", "pdf",
    "php", "pptx", "py", "rb", "sh", "tex", "ts", "txt", "xml",
];

/// Upload cap per batch entry.
pub const MAX_FILE_BYTES: u64 = 100 * 1024 * 1024;
/// Files per upload batch.
pub const MAX_BATCH_FILES: usize = 100;

/// Outcome of one file within an upload batch.
#[derive(Debug, Clone, Serialize)]
pub struct UploadResult {
    pub filename: String,
    /// `uploaded`, `skipped`, or `error`.
    pub action: &'static str,
    pub message: String,
}

/// Validates an instance id against the slug grammar.
pub fn valid_slug(id: &str) -> bool {
    // Compiled per call; instance CRUD is rare.
    Regex::new(r"^[a-z0-9](-?[a-z0-9]+)*$")
        .map(|re| re.is_match(id))
        .unwrap_or(false)
}

/// 256-bit random access token, hex-encoded.
pub fn new_access_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn extension_of(filename: &str) -> Option<String> {
    Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

/// The recall service: store rows + local bytes + upstream index.
pub struct RecallService {
    store: Store,
    /// Local storage root (`{data-root}/file-recall`).
    root: PathBuf,
}

impl RecallService {
    pub fn new(store: Store, root: impl Into<PathBuf>) -> Self {
        Self {
            store,
            root: root.into(),
        }
    }

    fn client_for(&self, instance: &RecallInstanceRow) -> VectorStoreClient {
        VectorStoreClient::new(instance.api_key.clone())
    }

    fn local_path(&self, instance_id: &str, storage_name: &str) -> PathBuf {
        self.root.join(instance_id).join(storage_name)
    }

    /// Creates an instance; the returned row includes the generated token.
    pub async fn create_instance(
        &self,
        id: &str,
        name: &str,
        api_key: &str,
    ) -> Result<RecallInstanceRow, GatewayError> {
        if !valid_slug(id) {
            return Err(GatewayError::Validation(format!(
                "instance id must match ^[a-z0-9](-?[a-z0-9]+)*$: {id}"
            )));
        }
        let row = RecallInstanceRow {
            id: id.to_string(),
            name: name.to_string(),
            api_key: api_key.to_string(),
            vector_store_id: None,
            access_token: new_access_token(),
            created_at: 0,
        };
        self.store
            .create_recall_instance(row.clone())
            .await
            .map_err(|e| {
                if e.to_string().contains("already exists") {
                    GatewayError::Validation(format!("instance {id} already exists"))
                } else {
                    GatewayError::Store(e)
                }
            })?;
        info!(instance = id, "recall instance created");
        Ok(row)
    }

    /// Loads an instance, or a recall error when missing.
    pub async fn instance(&self, id: &str) -> Result<RecallInstanceRow, GatewayError> {
        self.store
            .get_recall_instance(id)
            .await?
            .ok_or_else(|| GatewayError::Recall(format!("no such instance: {id}")))
    }

    /// Uploads one file into an instance, deduplicating by content hash.
    pub async fn upload(
        &self,
        instance_id: &str,
        filename: &str,
        bytes: Vec<u8>,
    ) -> Result<UploadResult, GatewayError> {
        let skipped = |message: String| UploadResult {
            filename: filename.to_string(),
            action: "skipped",
            message,
        };
        let failed = |message: String| UploadResult {
            filename: filename.to_string(),
            action: "error",
            message,
        };

        let Some(extension) = extension_of(filename) else {
            return Ok(failed("file has no extension".to_string()));
        };
        if !ALLOWED_EXTENSIONS.contains(&extension.as_str()) {
            return Ok(failed(format!("unsupported file type: .{extension}")));
        }
        if bytes.len() as u64 > MAX_FILE_BYTES {
            return Ok(failed(format!(
                "file exceeds {} MiB limit",
                MAX_FILE_BYTES / (1024 * 1024)
            )));
        }

        let sha256 = hex::encode(Sha256::digest(&bytes));
        if let Some(existing) = self
            .store
            .get_recall_file_by_hash(instance_id, &sha256)
            .await?
        {
            if existing.status == "ready" {
                return Ok(skipped(format!(
                    "identical content already indexed as {}",
                    existing.filename
                )));
            }
            // A stale failed attempt: clear it and retry below.
            self.store.delete_recall_file(&existing.id).await?;
            let stale = self.local_path(instance_id, &existing.storage_name);
            let _ = tokio::fs::remove_file(&stale).await;
        }

        let storage_name = format!("{}.{extension}", &sha256[..16]);
        let local = self.local_path(instance_id, &storage_name);
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&local, &bytes).await?;

        let file_id = uuid::Uuid::new_v4().to_string();
        self.store
            .insert_recall_file(RecallFileRow {
                id: file_id.clone(),
                instance_id: instance_id.to_string(),
                filename: filename.to_string(),
                storage_name: storage_name.clone(),
                sha256,
                size: bytes.len() as i64,
                media_type: String::new(),
                upstream_file_id: None,
                upstream_vector_file_id: None,
                status: "processing".to_string(),
                error: None,
                created_at: 0,
            })
            .await?;

        match self.push_upstream(instance_id, filename, bytes).await {
            Ok((upstream_file, upstream_vector_file)) => {
                self.store
                    .mark_recall_file_ready(&file_id, &upstream_file, &upstream_vector_file)
                    .await?;
                Ok(UploadResult {
                    filename: filename.to_string(),
                    action: "uploaded",
                    message: "indexed".to_string(),
                })
            }
            Err(e) => {
                warn!(instance = instance_id, file = filename, error = %e, "upload failed");
                self.store
                    .mark_recall_file_error(&file_id, &e.to_string())
                    .await?;
                let _ = tokio::fs::remove_file(&local).await;
                Ok(failed(e.to_string()))
            }
        }
    }

    /// Uploads bytes upstream and attaches them to the instance's vector
    /// store, creating the store on first use.
    async fn push_upstream(
        &self,
        instance_id: &str,
        filename: &str,
        bytes: Vec<u8>,
    ) -> Result<(String, String), GatewayError> {
        let instance = self.instance(instance_id).await?;
        let client = self.client_for(&instance);

        let vector_store_id = match &instance.vector_store_id {
            Some(id) => id.clone(),
            None => {
                let id = client
                    .create_vector_store(&format!("trellis-{instance_id}"))
                    .await?;
                self.store
                    .set_recall_vector_store(instance_id, &id)
                    .await?;
                id
            }
        };

        let upstream_file = client.upload_file(filename, bytes).await?;
        let upstream_vector_file = client.add_file(&vector_store_id, &upstream_file).await?;
        Ok((upstream_file, upstream_vector_file))
    }

    /// Delegated semantic search; returns `(text, hits)` for shaping.
    pub async fn search(
        &self,
        instance_id: &str,
        query: &str,
        max_results: u32,
    ) -> Result<serde_json::Value, GatewayError> {
        let instance = self.instance(instance_id).await?;
        let Some(vector_store_id) = &instance.vector_store_id else {
            return Ok(serde_json::json!({ "data": [] }));
        };
        self.client_for(&instance)
            .search(vector_store_id, query, max_results)
            .await
    }

    /// Removes one file upstream (best effort) and locally.
    pub async fn delete_file(
        &self,
        instance_id: &str,
        file_id: &str,
    ) -> Result<(), GatewayError> {
        let instance = self.instance(instance_id).await?;
        let Some(file) = self.store.get_recall_file(instance_id, file_id).await? else {
            return Err(GatewayError::Recall(format!("no such file: {file_id}")));
        };

        let client = self.client_for(&instance);
        if let (Some(store_id), Some(vector_file)) =
            (&instance.vector_store_id, &file.upstream_vector_file_id)
        {
            if let Err(e) = client.remove_file(store_id, vector_file).await {
                warn!(error = %e, "detach from vector store failed");
            }
        }
        if let Some(upstream_file) = &file.upstream_file_id {
            if let Err(e) = client.delete_file(upstream_file).await {
                warn!(error = %e, "upstream file delete failed");
            }
        }

        let _ = tokio::fs::remove_file(self.local_path(instance_id, &file.storage_name)).await;
        self.store.delete_recall_file(&file.id).await?;
        Ok(())
    }

    /// Deletes an instance: best-effort upstream vector store removal, then
    /// local files and rows (rows cascade).
    pub async fn delete_instance(&self, instance_id: &str) -> Result<(), GatewayError> {
        let instance = self.instance(instance_id).await?;
        if let Some(store_id) = &instance.vector_store_id {
            if let Err(e) = self.client_for(&instance).delete_vector_store(store_id).await {
                warn!(error = %e, instance = instance_id, "upstream store delete failed");
            }
        }
        let _ = tokio::fs::remove_dir_all(self.root.join(instance_id)).await;
        self.store.delete_recall_instance(instance_id).await?;
        info!(instance = instance_id, "recall instance deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: the slug grammar accepts kebab ids and rejects the rest.
    #[test]
    fn slug_grammar() {
        for ok in ["acme", "acme-2", "a", "a1-b2-c3"] {
            assert!(valid_slug(ok), "{ok}");
        }
        for bad in ["", "-acme", "acme-", "Acme", "a--b", "a_b", "a.b"] {
            assert!(!valid_slug(bad), "{bad}");
        }
    }

    /// **Scenario**: access tokens are 64 hex chars (256 bits) and unique.
    #[test]
    fn access_token_shape() {
        let a = new_access_token();
        let b = new_access_token();
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    /// **Scenario**: extension gating is case-insensitive and rejects
    /// unknown types before any I/O.
    #[test]
    fn extension_gate() {
        assert_eq!(extension_of("Report.PDF").as_deref(), Some("pdf"));
        assert!(ALLOWED_EXTENSIONS.contains(&"pdf"));
        assert!(!ALLOWED_EXTENSIONS.contains(&"exe"));
        assert_eq!(extension_of("no_extension"), None);
    }

    /// **Scenario**: instance creation validates the slug and generates a
    /// token; duplicates are rejected as validation errors.
    #[tokio::test]
    async fn create_instance_flow() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("t.db")).unwrap();
        let service = RecallService::new(store, dir.path().join("file-recall"));

        let err = service.create_instance("Bad Slug", "x", "sk").await.unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));

        let row = service.create_instance("acme", "Acme", "sk").await.unwrap();
        assert_eq!(row.access_token.len(), 64);

        let err = service.create_instance("acme", "Again", "sk").await.unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }
}
