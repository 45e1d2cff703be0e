//! Thin client for the web search / extraction / research backend.
//!
//! The backend is consumed as three JSON endpoints (`/search`, `/extract`,
//! `/research`) behind one bearer credential. Responses come back as loose
//! JSON; the tools shape them into model text and citations.

use serde_json::{json, Value};
use tracing::trace;

use crate::error::ToolError;

const DEFAULT_BASE_URL: &str = "https://api.tavily.com";

/// Search backend client, one per request configuration.
pub struct SearchApi {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl SearchApi {
    pub fn new(api_key: impl Into<String>, base_url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        }
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value, ToolError> {
        let url = format!("{}{}", self.base_url, path);
        trace!(url = %url, "search api request");
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ToolError::execution(format!("search api: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            return Err(ToolError::execution(format!(
                "search api returned {status}: {detail}"
            )));
        }
        resp.json()
            .await
            .map_err(|e| ToolError::execution(format!("search api response: {e}")))
    }

    /// Web search. `include_content` requests full page text (credit
    /// expensive upstream); `include_images` adds an image result list.
    pub async fn search(
        &self,
        query: &str,
        max_results: u32,
        include_content: bool,
        include_images: bool,
    ) -> Result<Value, ToolError> {
        self.post(
            "/search",
            json!({
                "query": query,
                "max_results": max_results,
                "include_raw_content": include_content,
                "include_images": include_images,
            }),
        )
        .await
    }

    /// Batch page extraction to markdown.
    pub async fn extract(&self, urls: &[String]) -> Result<Value, ToolError> {
        self.post("/extract", json!({ "urls": urls })).await
    }

    /// Long-form deep research; a single long-running call.
    pub async fn research(&self, query: &str) -> Result<Value, ToolError> {
        self.post("/research", json!({ "query": query })).await
    }
}
