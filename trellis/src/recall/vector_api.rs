//! Upstream Files / Vector Stores API client (OpenAI-compatible).
//!
//! One client per instance credential. All calls are thin JSON/multipart
//! wrappers; the recall service owns retrying policy (none) and row state.

use serde_json::{json, Value};
use tracing::trace;

use crate::error::GatewayError;

const DEFAULT_BASE_URL: &str = "https://api.openai.com";

/// Files + vector stores client bound to one API key.
pub struct VectorStoreClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl VectorStoreClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    /// Overrides the API base URL (tests, compatible servers).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn check(resp: reqwest::Response, what: &str) -> Result<Value, GatewayError> {
        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            return Err(GatewayError::Recall(format!(
                "{what} failed with {status}: {detail}"
            )));
        }
        resp.json()
            .await
            .map_err(|e| GatewayError::Recall(format!("{what} response: {e}")))
    }

    /// Uploads file bytes; returns the upstream file id.
    pub async fn upload_file(
        &self,
        filename: &str,
        bytes: Vec<u8>,
    ) -> Result<String, GatewayError> {
        let part = reqwest::multipart::Part::bytes(bytes).file_name(filename.to_string());
        let form = reqwest::multipart::Form::new()
            .text("purpose", "assistants")
            .part("file", part);
        let resp = self
            .client
            .post(format!("{}/v1/files", self.base_url))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| GatewayError::Recall(format!("file upload: {e}")))?;
        let value = Self::check(resp, "file upload").await?;
        value["id"]
            .as_str()
            .map(String::from)
            .ok_or_else(|| GatewayError::Recall("file upload returned no id".to_string()))
    }

    /// Creates a vector store; returns its id.
    pub async fn create_vector_store(&self, name: &str) -> Result<String, GatewayError> {
        let resp = self
            .client
            .post(format!("{}/v1/vector_stores", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&json!({ "name": name }))
            .send()
            .await
            .map_err(|e| GatewayError::Recall(format!("create vector store: {e}")))?;
        let value = Self::check(resp, "create vector store").await?;
        value["id"]
            .as_str()
            .map(String::from)
            .ok_or_else(|| GatewayError::Recall("vector store returned no id".to_string()))
    }

    /// Attaches an uploaded file to a vector store; returns the vector-file id.
    pub async fn add_file(
        &self,
        vector_store_id: &str,
        file_id: &str,
    ) -> Result<String, GatewayError> {
        let resp = self
            .client
            .post(format!(
                "{}/v1/vector_stores/{vector_store_id}/files",
                self.base_url
            ))
            .bearer_auth(&self.api_key)
            .json(&json!({ "file_id": file_id }))
            .send()
            .await
            .map_err(|e| GatewayError::Recall(format!("attach file: {e}")))?;
        let value = Self::check(resp, "attach file").await?;
        value["id"]
            .as_str()
            .map(String::from)
            .ok_or_else(|| GatewayError::Recall("attach returned no id".to_string()))
    }

    /// Semantic search over a vector store.
    pub async fn search(
        &self,
        vector_store_id: &str,
        query: &str,
        max_results: u32,
    ) -> Result<Value, GatewayError> {
        let resp = self
            .client
            .post(format!(
                "{}/v1/vector_stores/{vector_store_id}/search",
                self.base_url
            ))
            .bearer_auth(&self.api_key)
            .json(&json!({ "query": query, "max_num_results": max_results }))
            .send()
            .await
            .map_err(|e| GatewayError::Recall(format!("vector search: {e}")))?;
        Self::check(resp, "vector search").await
    }

    async fn delete(&self, path: String, what: &str) -> Result<(), GatewayError> {
        let resp = self
            .client
            .delete(format!("{}{path}", self.base_url))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| GatewayError::Recall(format!("{what}: {e}")))?;
        let status = resp.status();
        if !status.is_success() && status.as_u16() != 404 {
            return Err(GatewayError::Recall(format!("{what} failed with {status}")));
        }
        trace!(what, "upstream delete");
        Ok(())
    }

    /// Detaches a file from a vector store.
    pub async fn remove_file(
        &self,
        vector_store_id: &str,
        file_id: &str,
    ) -> Result<(), GatewayError> {
        self.delete(
            format!("/v1/vector_stores/{vector_store_id}/files/{file_id}"),
            "detach file",
        )
        .await
    }

    /// Deletes an uploaded file.
    pub async fn delete_file(&self, file_id: &str) -> Result<(), GatewayError> {
        self.delete(format!("/v1/files/{file_id}"), "delete file").await
    }

    /// Deletes a whole vector store.
    pub async fn delete_vector_store(&self, vector_store_id: &str) -> Result<(), GatewayError> {
        self.delete(
            format!("/v1/vector_stores/{vector_store_id}"),
            "delete vector store",
        )
        .await
    }
}
