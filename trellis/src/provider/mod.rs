//! Provider abstraction and the tool-use loop.
//!
//! The three wire shapes (Anthropic Messages, OpenAI Responses, Ollama chat)
//! hide behind [`ProviderAdapter`]: translate the canonical transcript, run
//! one model turn, stream one model turn. The bounded tool-use loop lives
//! above the adapters: it sends a turn, executes any requested tools in
//! declaration order, appends the results, and re-invokes, summing usage
//! across every iteration.

pub mod anthropic;
pub mod mock;
pub mod ollama;
pub mod openai;

pub use anthropic::AnthropicAdapter;
pub use mock::{MockAdapter, ScriptedTurn};
pub use ollama::OllamaAdapter;
pub use openai::OpenAiAdapter;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use stream_event::ChatEvent;

use crate::error::GatewayError;
use crate::message::{ChatMessage, ContentBlock, Role};
use crate::tools::{ToolExecutor, ToolSpec};

/// Default bound on model↔tool iterations within one turn.
pub const DEFAULT_MAX_ITERATIONS: u32 = 5;

/// Token counters for one call or one whole request (summed).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
}

impl TokenUsage {
    /// Adds another call's counters into this aggregate.
    pub fn merge(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_read_tokens += other.cache_read_tokens;
        self.cache_write_tokens += other.cache_write_tokens;
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Why the model stopped emitting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Natural end of the assistant turn.
    EndTurn,
    /// The model requested tool execution.
    ToolUse,
    /// Output token limit reached.
    MaxTokens,
    /// Anything else the provider reported.
    Other,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EndTurn => "stop",
            Self::ToolUse => "tool_use",
            Self::MaxTokens => "length",
            Self::Other => "other",
        }
    }
}

/// One model turn as the loop sees it.
pub struct TurnRequest<'a> {
    pub model: &'a str,
    /// Full working transcript (system prompt first).
    pub messages: &'a [ChatMessage],
    pub tools: &'a [ToolSpec],
    /// Zero-based loop iteration; adapters refresh cache markers when > 0.
    pub iteration: u32,
    /// Previous response id, for adapters with response chaining.
    pub chain: Option<&'a str>,
    /// Index of the first message not yet delivered on the chain.
    pub tail: usize,
    pub max_tokens: u32,
}

/// The adapter's view of one completed model turn.
#[derive(Debug, Clone)]
pub struct TurnResponse {
    /// Assistant blocks, including `ToolUse` requests.
    pub content: Vec<ContentBlock>,
    pub stop_reason: StopReason,
    pub usage: TokenUsage,
    /// Response id for chained follow-ups, when the wire supports it.
    pub response_id: Option<String>,
}

impl TurnResponse {
    /// Concatenated text of the assistant blocks.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for block in &self.content {
            if let ContentBlock::Text { text } = block {
                out.push_str(text);
            }
        }
        out
    }

    fn tool_uses(&self) -> Vec<(String, String, serde_json::Value)> {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { id, name, input } => {
                    Some((id.clone(), name.clone(), input.clone()))
                }
                _ => None,
            })
            .collect()
    }
}

/// Ordered event sink for one chat turn.
///
/// Send failures mean the client went away; the turn keeps running so the
/// request record stays accurate, and later sends fail fast without
/// blocking.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<ChatEvent>,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<ChatEvent>) -> Self {
        Self { tx }
    }

    /// Creates a sink whose receiver is drained and discarded (non-streaming
    /// callers that only want the final outcome).
    pub fn discard() -> Self {
        let (tx, mut rx) = mpsc::channel(64);
        tokio::spawn(async move { while rx.recv().await.is_some() {} });
        Self { tx }
    }

    /// Emits one event, respecting backpressure while the client listens.
    pub async fn emit(&self, event: ChatEvent) {
        let _ = self.tx.send(event).await;
    }

    /// Emits incremental assistant text.
    pub async fn text(&self, content: impl Into<String>) {
        self.emit(ChatEvent::Text {
            content: content.into(),
        })
        .await;
    }
}

/// Final outcome of one chat turn (after the tool loop).
#[derive(Debug, Clone)]
pub struct ChatOutcome {
    /// Final assistant text.
    pub content: String,
    pub stop_reason: StopReason,
    /// Usage summed across every loop iteration.
    pub usage: TokenUsage,
    /// Number of model invocations performed.
    pub iterations: u32,
}

/// One wire protocol: translate, run, stream.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Provider key ("anthropic", "openai", "ollama").
    fn name(&self) -> &'static str;

    /// One non-streaming model turn.
    async fn run_once(&self, req: &TurnRequest<'_>) -> Result<TurnResponse, GatewayError>;

    /// One streaming model turn: text deltas go to the sink as they arrive;
    /// the complete response is still returned. The default falls back to
    /// `run_once` and emits the text in one piece.
    async fn stream_once(
        &self,
        req: &TurnRequest<'_>,
        sink: &EventSink,
    ) -> Result<TurnResponse, GatewayError> {
        let resp = self.run_once(req).await?;
        let text = resp.text();
        if !text.is_empty() {
            sink.text(text).await;
        }
        Ok(resp)
    }
}

/// Drives the bounded tool-use loop for one chat turn.
///
/// Tool calls within one assistant turn execute sequentially in declaration
/// order; the `ToolCall` marker is emitted strictly before each execution.
/// Exceeding `max_iterations` is fatal for the request.
#[allow(clippy::too_many_arguments)]
pub async fn drive_chat(
    adapter: &dyn ProviderAdapter,
    model: &str,
    messages: Vec<ChatMessage>,
    tools: &[ToolSpec],
    executor: &ToolExecutor,
    sink: &EventSink,
    stream: bool,
    max_iterations: u32,
) -> Result<ChatOutcome, GatewayError> {
    let mut transcript = messages;
    let mut usage = TokenUsage::default();
    let mut chain: Option<String> = None;
    let mut sent_watermark = 0usize;

    for iteration in 0..max_iterations {
        let req = TurnRequest {
            model,
            messages: &transcript,
            tools,
            iteration,
            chain: chain.as_deref(),
            tail: sent_watermark,
            max_tokens: 8192,
        };
        let resp = if stream {
            adapter.stream_once(&req, sink).await?
        } else {
            adapter.run_once(&req).await?
        };
        usage.merge(&resp.usage);
        if resp.response_id.is_some() {
            chain = resp.response_id.clone();
        }
        debug!(
            provider = adapter.name(),
            iteration,
            stop_reason = resp.stop_reason.as_str(),
            input_tokens = resp.usage.input_tokens,
            output_tokens = resp.usage.output_tokens,
            "model turn complete"
        );

        let tool_uses = resp.tool_uses();
        let final_text = resp.text();
        transcript.push(ChatMessage {
            role: Role::Assistant,
            content: resp.content,
        });
        sent_watermark = transcript.len();

        if resp.stop_reason != StopReason::ToolUse || tool_uses.is_empty() {
            return Ok(ChatOutcome {
                content: final_text,
                stop_reason: resp.stop_reason,
                usage,
                iterations: iteration + 1,
            });
        }

        let mut results = ChatMessage {
            role: Role::Tool,
            content: Vec::new(),
        };
        for (id, name, input) in tool_uses {
            sink.emit(ChatEvent::ToolCall {
                id: id.clone(),
                name: name.clone(),
                arguments: input.clone(),
            })
            .await;
            let executed = executor.execute(&name, input, sink).await;
            results.content.push(ContentBlock::ToolResult {
                tool_use_id: id,
                content: executed.payload_json(),
                is_error: executed.is_error(),
            });
        }
        transcript.push(results);
    }

    Err(GatewayError::IterationOverflow {
        max: max_iterations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ToolExecutor;

    fn sink_pair() -> (EventSink, mpsc::Receiver<ChatEvent>) {
        let (tx, rx) = mpsc::channel(256);
        (EventSink::new(tx), rx)
    }

    /// **Scenario**: a plain answer finishes in one iteration with its usage.
    #[tokio::test]
    async fn single_turn_no_tools() {
        let adapter = MockAdapter::new(vec![ScriptedTurn::text("hello there", 12, 4)]);
        let executor = ToolExecutor::empty();
        let (sink, mut rx) = sink_pair();

        let outcome = drive_chat(
            &adapter,
            "mock-model",
            vec![ChatMessage::user("hi")],
            &[],
            &executor,
            &sink,
            true,
            5,
        )
        .await
        .unwrap();

        assert_eq!(outcome.content, "hello there");
        assert_eq!(outcome.iterations, 1);
        assert_eq!(outcome.usage.input_tokens, 12);
        assert_eq!(outcome.usage.output_tokens, 4);
        drop(sink);
        let ev = rx.recv().await.unwrap();
        assert!(matches!(ev, ChatEvent::Text { content } if content == "hello there"));
    }

    /// **Scenario**: usage is summed across all loop iterations.
    #[tokio::test]
    async fn usage_summed_across_iterations() {
        let adapter = MockAdapter::new(vec![
            ScriptedTurn::tool_call("echo", serde_json::json!({"text": "x"}), 100, 10),
            ScriptedTurn::text("done", 50, 5),
        ]);
        let executor = ToolExecutor::for_tests();
        let (sink, _rx) = sink_pair();

        let outcome = drive_chat(
            &adapter,
            "mock-model",
            vec![ChatMessage::user("run echo")],
            &[],
            &executor,
            &sink,
            false,
            5,
        )
        .await
        .unwrap();

        assert_eq!(outcome.iterations, 2);
        assert_eq!(outcome.usage.input_tokens, 150);
        assert_eq!(outcome.usage.output_tokens, 15);
        assert_eq!(outcome.content, "done");
    }

    /// **Scenario**: the ToolCall marker precedes execution in the event order.
    #[tokio::test]
    async fn tool_marker_precedes_results() {
        let adapter = MockAdapter::new(vec![
            ScriptedTurn::tool_call("echo", serde_json::json!({"text": "ping"}), 1, 1),
            ScriptedTurn::text("after", 1, 1),
        ]);
        let executor = ToolExecutor::for_tests();
        let (sink, mut rx) = sink_pair();

        drive_chat(
            &adapter,
            "mock-model",
            vec![ChatMessage::user("go")],
            &[],
            &executor,
            &sink,
            false,
            5,
        )
        .await
        .unwrap();
        drop(sink);

        let mut saw_marker_at = None;
        let mut saw_status_at = None;
        let mut index = 0;
        while let Some(ev) = rx.recv().await {
            match ev {
                ChatEvent::ToolCall { ref name, .. } if name == "echo" => {
                    saw_marker_at.get_or_insert(index);
                }
                ChatEvent::Status { .. } => {
                    saw_status_at.get_or_insert(index);
                }
                _ => {}
            }
            index += 1;
        }
        let marker = saw_marker_at.expect("marker emitted");
        let status = saw_status_at.expect("status emitted");
        assert!(marker < status, "marker {marker} must precede execution {status}");
    }

    /// **Scenario**: a model that keeps requesting tools is stopped after the
    /// iteration bound with a visible error.
    #[tokio::test]
    async fn iteration_overflow_is_fatal() {
        let turns: Vec<ScriptedTurn> = (0..10)
            .map(|_| ScriptedTurn::tool_call("echo", serde_json::json!({"text": "x"}), 1, 1))
            .collect();
        let adapter = MockAdapter::new(turns);
        let executor = ToolExecutor::for_tests();
        let (sink, _rx) = sink_pair();

        let err = drive_chat(
            &adapter,
            "mock-model",
            vec![ChatMessage::user("loop forever")],
            &[],
            &executor,
            &sink,
            false,
            5,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, GatewayError::IterationOverflow { max: 5 }));
        assert_eq!(adapter.calls(), 5);
    }
}
