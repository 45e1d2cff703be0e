//! Deep research tool: long-form reports persisted into the conversation
//! volume.
//!
//! The backend call can run for minutes; progress goes out as status events.
//! On completion the report is written under `volume/research/` as markdown,
//! converted to PDF when a converter command is configured, and the download
//! link is appended to the model-visible result plus an extra citation.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::warn;

use stream_event::{ChatEvent, Citation, StatusUpdate};

use crate::error::ToolError;
use crate::provider::EventSink;
use crate::store::now_millis;
use crate::tools::search_api::SearchApi;
use crate::tools::{Tool, ToolOutcome, ToolSpec};

/// Deep research over the search backend, with volume-persisted artifacts.
pub struct DeepResearchTool {
    api: Arc<SearchApi>,
    /// Host-side volume root of the conversation.
    volume: PathBuf,
    /// Public URL prefix for the volume (`{base}/{user}/{conv}/volume`).
    volume_url: String,
    /// Optional markdown-to-PDF converter, invoked as `cmd <in.md> <out.pdf>`.
    pdf_command: Option<String>,
}

impl DeepResearchTool {
    pub fn new(
        api: Arc<SearchApi>,
        volume: PathBuf,
        volume_url: String,
        pdf_command: Option<String>,
    ) -> Self {
        Self {
            api,
            volume,
            volume_url,
            pdf_command,
        }
    }

    fn report_stem(query: &str) -> String {
        let slug: String = query
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_lowercase()
                } else {
                    '-'
                }
            })
            .collect::<String>()
            .split('-')
            .filter(|s| !s.is_empty())
            .take(6)
            .collect::<Vec<_>>()
            .join("-");
        let stem = if slug.is_empty() { "report" } else { slug.as_str() };
        format!("{}-{}", stem, now_millis())
    }

    async fn render_pdf(&self, markdown: &PathBuf, pdf: &PathBuf) -> bool {
        let Some(command) = &self.pdf_command else {
            return false;
        };
        let result = tokio::process::Command::new(command)
            .arg(markdown)
            .arg("-o")
            .arg(pdf)
            .output()
            .await;
        match result {
            Ok(output) if output.status.success() => true,
            Ok(output) => {
                warn!(
                    command = %command,
                    stderr = %String::from_utf8_lossy(&output.stderr),
                    "pdf conversion failed"
                );
                false
            }
            Err(e) => {
                warn!(command = %command, error = %e, "pdf converter not runnable");
                false
            }
        }
    }
}

#[async_trait]
impl Tool for DeepResearchTool {
    fn name(&self) -> &str {
        "deep_research"
    }

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "deep_research".to_string(),
            description: "Run an in-depth, multi-source research task and produce a long-form \
                          report. Takes several minutes; use only when the user asks for \
                          thorough research."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "The research question" }
                },
                "required": ["query"]
            }),
        }
    }

    fn describe_start(&self, args: &Value) -> String {
        format!(
            "Researching: {}…",
            args["query"].as_str().unwrap_or_default()
        )
    }

    async fn call(&self, args: Value, sink: &EventSink) -> Result<ToolOutcome, ToolError> {
        let query = args["query"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidInput("missing query".to_string()))?;

        sink.emit(ChatEvent::Status {
            status: StatusUpdate::begin("Deep research running; this can take several minutes…"),
        })
        .await;
        let response = self.api.research(query).await?;
        let report = response["report"]
            .as_str()
            .or_else(|| response["answer"].as_str())
            .ok_or_else(|| ToolError::execution("research backend returned no report"))?;

        let mut sources: Vec<Citation> = Vec::new();
        if let Some(raw) = response["sources"].as_array() {
            for source in raw {
                sources.push(Citation::link(
                    source["title"].as_str().unwrap_or("(source)"),
                    source["url"].as_str().unwrap_or_default(),
                ));
            }
        }

        // Persist the report into the conversation volume.
        let research_dir = self.volume.join("research");
        tokio::fs::create_dir_all(&research_dir)
            .await
            .map_err(|e| ToolError::execution(format!("create research dir: {e}")))?;
        let stem = Self::report_stem(query);
        let md_path = research_dir.join(format!("{stem}.md"));
        tokio::fs::write(&md_path, report)
            .await
            .map_err(|e| ToolError::execution(format!("write report: {e}")))?;

        let mut download_url = format!("{}/research/{stem}.md", self.volume_url);
        let pdf_path = research_dir.join(format!("{stem}.pdf"));
        if self.render_pdf(&md_path, &pdf_path).await {
            download_url = format!("{}/research/{stem}.pdf", self.volume_url);
        }

        sources.push(Citation::link("Research report", download_url.clone()));
        let result = format!("{report}\n\nDownload the full report: {download_url}");
        Ok(ToolOutcome::ok(result)
            .with_sources(sources)
            .with_status_done("Research complete"))
    }
}
