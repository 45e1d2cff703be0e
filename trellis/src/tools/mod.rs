//! Tool registry and executor.
//!
//! Tools are registered per request (the toggle map decides which), rendered
//! into each provider's definition shape, and dispatched by name. Every
//! execution emits a start and a complete status event with human-friendly
//! text, and is timed and recorded in the tool_calls table. Tool failures
//! are never fatal to the turn: they come back as error payloads the model
//! can react to.

pub mod image;
pub mod memory;
pub mod recall;
pub mod research;
pub mod sandbox;
pub mod search_api;
pub mod web;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use stream_event::{ChatEvent, Citation, StatusUpdate};

use crate::error::ToolError;
use crate::provider::EventSink;
use crate::store::Store;

/// Tool definition: name, description, JSON-schema parameters.
#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

impl ToolSpec {
    /// Anthropic Messages shape: flat `input_schema`.
    pub fn to_anthropic(&self) -> Value {
        json!({
            "name": self.name,
            "description": self.description,
            "input_schema": self.input_schema,
        })
    }

    /// OpenAI Responses shape: flat function with `parameters`.
    pub fn to_openai(&self) -> Value {
        json!({
            "type": "function",
            "name": self.name,
            "description": self.description,
            "parameters": self.input_schema,
        })
    }

    /// Ollama / Chat Completions shape: nested `function` object.
    pub fn to_ollama(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.input_schema,
            }
        })
    }
}

/// Successful-or-failed result of one tool execution.
#[derive(Debug, Clone, Default)]
pub struct ToolOutcome {
    /// Text handed back to the model.
    pub result: String,
    /// Citations to surface through the SSE channel.
    pub sources: Vec<Citation>,
    /// Set when the tool failed; the model sees it as an error result.
    pub error: Option<String>,
    /// Optional completion notice ("Found 3 results").
    pub status_done: Option<String>,
}

impl ToolOutcome {
    pub fn ok(result: impl Into<String>) -> Self {
        Self {
            result: result.into(),
            ..Default::default()
        }
    }

    pub fn err(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn with_sources(mut self, sources: Vec<Citation>) -> Self {
        self.sources = sources;
        self
    }

    pub fn with_status_done(mut self, text: impl Into<String>) -> Self {
        self.status_done = Some(text.into());
        self
    }
}

/// One executable tool.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn spec(&self) -> ToolSpec;

    /// Start-of-execution notice shown to the user.
    fn describe_start(&self, _args: &Value) -> String {
        format!("Running {}…", self.name())
    }

    /// Executes the tool. Long-running tools stream progress through `sink`.
    async fn call(&self, args: Value, sink: &EventSink) -> Result<ToolOutcome, ToolError>;
}

/// Per-request tool set, dispatchable by name.
///
/// Built once per request from the feature toggles; immutable afterwards.
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a tool, replacing any previous one with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    /// Definitions for all registered tools, in stable name order.
    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools.values().map(|t| t.spec()).collect()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// The serialized payload placed into a tool-result block.
#[derive(Debug, Clone)]
pub struct ExecutedTool {
    payload: Value,
    error: bool,
}

impl ExecutedTool {
    pub fn payload_json(&self) -> String {
        self.payload.to_string()
    }

    pub fn is_error(&self) -> bool {
        self.error
    }
}

/// Dispatches tool calls: status events, timing, recording, payload shaping.
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    store: Option<Store>,
    request_id: i64,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>, store: Option<Store>, request_id: i64) -> Self {
        Self {
            registry,
            store,
            request_id,
        }
    }

    /// Executor with no tools (requests with tools disabled).
    pub fn empty() -> Self {
        Self::new(Arc::new(ToolRegistry::new()), None, 0)
    }

    /// Executor with an echo tool, for loop tests.
    #[doc(hidden)]
    pub fn for_tests() -> Self {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));
        Self::new(Arc::new(registry), None, 0)
    }

    /// Executes one tool call end to end and shapes its result payload.
    pub async fn execute(&self, name: &str, args: Value, sink: &EventSink) -> ExecutedTool {
        let started = Instant::now();
        let outcome = match self.registry.get(name) {
            Some(tool) => {
                sink.emit(ChatEvent::Status {
                    status: StatusUpdate::begin(tool.describe_start(&args)),
                })
                .await;
                match tool.call(args.clone(), sink).await {
                    Ok(outcome) => outcome,
                    Err(e) => ToolOutcome::err(e.to_string()),
                }
            }
            None => ToolOutcome::err(format!("unknown tool: {name}")),
        };
        let elapsed_ms = started.elapsed().as_millis() as i64;

        for citation in &outcome.sources {
            sink.emit(ChatEvent::Source {
                citation: citation.clone(),
            })
            .await;
        }
        let done_text = outcome
            .status_done
            .clone()
            .unwrap_or_else(|| match &outcome.error {
                Some(_) => format!("{name} failed"),
                None => format!("{name} complete"),
            });
        sink.emit(ChatEvent::Status {
            status: StatusUpdate::finish(done_text),
        })
        .await;

        let success = outcome.error.is_none();
        let mut payload = json!({ "result": outcome.result });
        if !outcome.sources.is_empty() {
            payload["sources"] = json!(outcome.sources);
        }
        if let Some(error) = &outcome.error {
            payload["error"] = json!(error);
        }

        if let Some(store) = &self.store {
            let recorded_result = if success {
                outcome.result.clone()
            } else {
                outcome.error.clone().unwrap_or_default()
            };
            if let Err(e) = store
                .add_tool_call(self.request_id, name, &args, &recorded_result, success, elapsed_ms)
                .await
            {
                warn!(error = %e, tool = name, "failed to record tool call");
            }
        }
        debug!(tool = name, success, elapsed_ms, "tool executed");

        ExecutedTool {
            payload,
            error: !success,
        }
    }
}

/// Minimal tool used by loop tests: returns its `text` argument.
struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "echo".to_string(),
            description: "Echoes the given text back".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": { "text": { "type": "string" } },
                "required": ["text"]
            }),
        }
    }

    async fn call(&self, args: Value, _sink: &EventSink) -> Result<ToolOutcome, ToolError> {
        let text = args
            .get("text")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidInput("missing text".to_string()))?;
        Ok(ToolOutcome::ok(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn sink_pair() -> (EventSink, mpsc::Receiver<ChatEvent>) {
        let (tx, rx) = mpsc::channel(64);
        (EventSink::new(tx), rx)
    }

    /// **Scenario**: the three renderings wrap the same schema differently.
    #[test]
    fn spec_rendering_variants() {
        let spec = ToolSpec {
            name: "web_search".into(),
            description: "Search the web".into(),
            input_schema: json!({"type": "object"}),
        };
        let a = spec.to_anthropic();
        assert_eq!(a["name"], "web_search");
        assert!(a.get("input_schema").is_some());

        let o = spec.to_openai();
        assert_eq!(o["type"], "function");
        assert_eq!(o["name"], "web_search");
        assert!(o.get("parameters").is_some());

        let l = spec.to_ollama();
        assert_eq!(l["function"]["name"], "web_search");
    }

    /// **Scenario**: executing a known tool emits begin/finish status events
    /// and returns the result payload.
    #[tokio::test]
    async fn execute_emits_status_and_payload() {
        let executor = ToolExecutor::for_tests();
        let (sink, mut rx) = sink_pair();
        let executed = executor
            .execute("echo", json!({"text": "pong"}), &sink)
            .await;
        assert!(!executed.is_error());
        let payload: Value = serde_json::from_str(&executed.payload_json()).unwrap();
        assert_eq!(payload["result"], "pong");
        drop(sink);

        let mut statuses = Vec::new();
        while let Some(ev) = rx.recv().await {
            if let ChatEvent::Status { status } = ev {
                statuses.push(status.done);
            }
        }
        assert_eq!(statuses, vec![false, true]);
    }

    /// **Scenario**: an unknown tool is an error payload, not a crash.
    #[tokio::test]
    async fn unknown_tool_is_error_payload() {
        let executor = ToolExecutor::empty();
        let (sink, _rx) = sink_pair();
        let executed = executor.execute("nope", json!({}), &sink).await;
        assert!(executed.is_error());
        let payload: Value = serde_json::from_str(&executed.payload_json()).unwrap();
        assert!(payload["error"].as_str().unwrap().contains("nope"));
    }

    /// **Scenario**: invalid arguments surface as an error payload too.
    #[tokio::test]
    async fn invalid_args_become_error_payload() {
        let executor = ToolExecutor::for_tests();
        let (sink, _rx) = sink_pair();
        let executed = executor.execute("echo", json!({}), &sink).await;
        assert!(executed.is_error());
    }
}
