//! Web tools: `web_search` and `web_scrape`.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use stream_event::Citation;

use crate::error::ToolError;
use crate::provider::EventSink;
use crate::tools::search_api::SearchApi;
use crate::tools::{Tool, ToolOutcome, ToolSpec};

/// Result-count clamp for web search.
const MAX_RESULTS: u64 = 10;
const DEFAULT_RESULTS: u64 = 3;
/// Batch extraction refuses more URLs than this.
const MAX_SCRAPE_URLS: usize = 20;

fn citation_from_result(result: &Value) -> Citation {
    let mut citation = Citation::link(
        result["title"].as_str().unwrap_or("(untitled)"),
        result["url"].as_str().unwrap_or_default(),
    );
    citation.document = result["content"]
        .as_str()
        .or_else(|| result["raw_content"].as_str())
        .map(String::from);
    citation.metadata = result.get("score").cloned().map(|s| json!({ "score": s }));
    citation
}

/// Searches the web and returns ranked snippets plus citations.
pub struct WebSearchTool {
    api: Arc<SearchApi>,
}

impl WebSearchTool {
    pub fn new(api: Arc<SearchApi>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "web_search".to_string(),
            description: "Search the web for current information. Returns ranked results \
                          with snippets and source URLs."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "The search query" },
                    "num_results": {
                        "type": "integer",
                        "description": "How many results to return (1-10, default 3)"
                    },
                    "include_full_content": {
                        "type": "boolean",
                        "description": "Fetch full page text for each result (slower)"
                    },
                    "include_images": { "type": "boolean" }
                },
                "required": ["query"]
            }),
        }
    }

    fn describe_start(&self, args: &Value) -> String {
        format!(
            "Searching: {}…",
            args["query"].as_str().unwrap_or_default()
        )
    }

    async fn call(&self, args: Value, _sink: &EventSink) -> Result<ToolOutcome, ToolError> {
        let query = args["query"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidInput("missing query".to_string()))?;
        let num_results = args["num_results"]
            .as_u64()
            .unwrap_or(DEFAULT_RESULTS)
            .clamp(1, MAX_RESULTS) as u32;
        let include_content = args["include_full_content"].as_bool().unwrap_or(false);
        let include_images = args["include_images"].as_bool().unwrap_or(false);

        let response = self
            .api
            .search(query, num_results, include_content, include_images)
            .await?;
        let results = response["results"].as_array().cloned().unwrap_or_default();

        let mut text = String::new();
        let mut sources = Vec::new();
        for (i, result) in results.iter().enumerate() {
            let title = result["title"].as_str().unwrap_or("(untitled)");
            let url = result["url"].as_str().unwrap_or_default();
            let snippet = result["content"].as_str().unwrap_or_default();
            text.push_str(&format!("[{}] {title}\n  URL: {url}\n", i + 1));
            if !snippet.is_empty() {
                text.push_str(&format!("  {}\n", snippet.replace('\n', " ")));
            }
            if include_content {
                if let Some(full) = result["raw_content"].as_str() {
                    text.push_str(&format!("  {}\n", full.replace('\n', " ")));
                }
            }
            sources.push(citation_from_result(result));
        }
        if include_images {
            if let Some(images) = response["images"].as_array() {
                for image in images {
                    if let Some(url) = image.as_str().or_else(|| image["url"].as_str()) {
                        text.push_str(&format!("Image: {url}\n"));
                    }
                }
            }
        }
        if text.is_empty() {
            text = "No results found.".to_string();
        }

        let count = results.len();
        Ok(ToolOutcome::ok(text)
            .with_sources(sources)
            .with_status_done(format!("Found {count} results")))
    }
}

/// Extracts up to twenty pages as markdown.
pub struct WebScrapeTool {
    api: Arc<SearchApi>,
}

impl WebScrapeTool {
    pub fn new(api: Arc<SearchApi>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl Tool for WebScrapeTool {
    fn name(&self) -> &str {
        "web_scrape"
    }

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "web_scrape".to_string(),
            description: "Extract the readable content of specific web pages as markdown. \
                          Up to 20 URLs per call."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "urls": {
                        "type": "array",
                        "items": { "type": "string" },
                        "description": "Pages to extract"
                    }
                },
                "required": ["urls"]
            }),
        }
    }

    fn describe_start(&self, args: &Value) -> String {
        let count = args["urls"].as_array().map(|a| a.len()).unwrap_or(0);
        format!("Reading {count} page(s)…")
    }

    async fn call(&self, args: Value, _sink: &EventSink) -> Result<ToolOutcome, ToolError> {
        let urls: Vec<String> = args["urls"]
            .as_array()
            .ok_or_else(|| ToolError::InvalidInput("missing urls".to_string()))?
            .iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect();
        if urls.is_empty() {
            return Err(ToolError::InvalidInput("urls is empty".to_string()));
        }
        if urls.len() > MAX_SCRAPE_URLS {
            return Err(ToolError::InvalidInput(format!(
                "too many urls: {} (max {MAX_SCRAPE_URLS})",
                urls.len()
            )));
        }

        let response = self.api.extract(&urls).await?;
        let results = response["results"].as_array().cloned().unwrap_or_default();

        let mut text = String::new();
        let mut sources = Vec::new();
        for result in &results {
            let url = result["url"].as_str().unwrap_or_default();
            let content = result["raw_content"]
                .as_str()
                .or_else(|| result["content"].as_str())
                .unwrap_or("(no content)");
            text.push_str(&format!("## {url}\n\n{content}\n\n"));
            sources.push(Citation::link(url, url));
        }
        if let Some(failed) = response["failed_results"].as_array() {
            for failure in failed {
                if let Some(url) = failure["url"].as_str() {
                    text.push_str(&format!("Failed to extract: {url}\n"));
                }
            }
        }

        Ok(ToolOutcome::ok(text)
            .with_sources(sources)
            .with_status_done(format!("Extracted {} page(s)", results.len())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: result counts clamp to [1, 10] around the default of 3.
    #[test]
    fn num_results_clamped() {
        for (given, expect) in [(0u64, 1u64), (3, 3), (25, 10)] {
            let clamped = given.clamp(1, MAX_RESULTS);
            assert_eq!(clamped, expect);
        }
        assert_eq!(DEFAULT_RESULTS, 3);
    }

    /// **Scenario**: scrape refuses more than twenty URLs before any I/O.
    #[tokio::test]
    async fn scrape_rejects_oversized_batches() {
        let tool = WebScrapeTool::new(Arc::new(SearchApi::new("k", None)));
        let urls: Vec<Value> = (0..21).map(|i| json!(format!("https://e.com/{i}"))).collect();
        let (tx, _rx) = tokio::sync::mpsc::channel(4);
        let err = tool
            .call(json!({ "urls": urls }), &EventSink::new(tx))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("too many urls"));
    }

    /// **Scenario**: citations carry title, url, and snippet document.
    #[test]
    fn citation_shaping() {
        let citation = citation_from_result(&json!({
            "title": "Tacos", "url": "https://tacos.example", "content": "al pastor",
            "score": 0.97
        }));
        assert_eq!(citation.source.name, "Tacos");
        assert_eq!(citation.source.url.as_deref(), Some("https://tacos.example"));
        assert_eq!(citation.document.as_deref(), Some("al pastor"));
    }
}
