//! Document recall tool: semantic search over the conversation's configured
//! file-recall instance.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use stream_event::Citation;

use crate::error::ToolError;
use crate::provider::EventSink;
use crate::recall::RecallService;
use crate::tools::{Tool, ToolOutcome, ToolSpec};

const DEFAULT_RESULTS: u64 = 5;
const MAX_RESULTS: u64 = 20;

/// Searches the instance's vector store and cites matching documents.
pub struct FileRecallSearchTool {
    recall: Arc<RecallService>,
    instance_id: String,
}

impl FileRecallSearchTool {
    pub fn new(recall: Arc<RecallService>, instance_id: impl Into<String>) -> Self {
        Self {
            recall,
            instance_id: instance_id.into(),
        }
    }
}

#[async_trait]
impl Tool for FileRecallSearchTool {
    fn name(&self) -> &str {
        "file_recall_search"
    }

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "file_recall_search".to_string(),
            description: "Search the organization's indexed documents for passages relevant \
                          to a query."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string" },
                    "max_results": { "type": "integer", "description": "1-20, default 5" }
                },
                "required": ["query"]
            }),
        }
    }

    fn describe_start(&self, args: &Value) -> String {
        format!(
            "Searching documents: {}…",
            args["query"].as_str().unwrap_or_default()
        )
    }

    async fn call(&self, args: Value, _sink: &EventSink) -> Result<ToolOutcome, ToolError> {
        let query = args["query"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidInput("missing query".to_string()))?;
        let max_results = args["max_results"]
            .as_u64()
            .unwrap_or(DEFAULT_RESULTS)
            .clamp(1, MAX_RESULTS) as u32;

        let response = self
            .recall
            .search(&self.instance_id, query, max_results)
            .await
            .map_err(|e| ToolError::execution(e.to_string()))?;
        let hits = response["data"].as_array().cloned().unwrap_or_default();

        if hits.is_empty() {
            return Ok(ToolOutcome::ok("No matching documents found.")
                .with_status_done("No documents matched"));
        }

        let mut text = String::new();
        let mut sources = Vec::new();
        for hit in &hits {
            let filename = hit["filename"].as_str().unwrap_or("(document)");
            let score = hit["score"].as_f64().unwrap_or(0.0);
            text.push_str(&format!("## {filename} (score {score:.2})\n"));
            if let Some(chunks) = hit["content"].as_array() {
                for chunk in chunks {
                    if let Some(passage) = chunk["text"].as_str() {
                        text.push_str(passage);
                        text.push('\n');
                    }
                }
            }
            text.push('\n');
            let mut citation = Citation {
                source: stream_event::CitationSource {
                    name: filename.to_string(),
                    url: None,
                },
                document: None,
                metadata: Some(json!({ "score": score })),
            };
            citation.document = hit["content"]
                .as_array()
                .and_then(|c| c.first())
                .and_then(|c| c["text"].as_str())
                .map(String::from);
            sources.push(citation);
        }

        Ok(ToolOutcome::ok(text)
            .with_sources(sources)
            .with_status_done(format!("Found {} document(s)", hits.len())))
    }
}
