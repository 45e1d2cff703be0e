//! OpenAI-compatible Chat Completions SSE framing.
//!
//! Converts [`ChatEvent`]s into SSE lines in the format of
//! [OpenAI streaming](https://platform.openai.com/docs/api-reference/chat-streaming).
//! No HTTP dependency: callers feed events and consume `data:`/named-event
//! strings and write them to the response body.
//!
//! Text deltas travel inside the `chatcmpl-*` envelope; tool-call markers and
//! tool output are rendered as content so chat frontends display them inline;
//! `status` and `source` go out as named events the frontend subscribes to
//! separately.

use serde::Serialize;

use crate::event::ChatEvent;

/// One streamed chunk in the OpenAI Chat Completions envelope.
#[derive(Clone, Debug, Serialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: &'static str,
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<ChunkUsage>,
}

impl ChatCompletionChunk {
    pub const OBJECT: &'static str = "chat.completion.chunk";
}

/// Single choice within a chunk (the gateway always streams index 0).
#[derive(Clone, Debug, Serialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: Delta,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

/// Incremental fields of the assistant message.
#[derive(Clone, Debug, Default, Serialize)]
pub struct Delta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// Usage block attached to the terminal chunk when requested.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ChunkUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Serializes a chunk to a single SSE line: `data: <JSON>\n\n`.
pub fn write_sse_line(chunk: &ChatCompletionChunk) -> String {
    let json = serde_json::to_string(chunk).expect("chunk serialization is infallible");
    format!("data: {json}\n\n")
}

/// Serializes a named SSE event: `event: <name>\ndata: <JSON>\n\n`.
pub fn write_named_event(name: &str, payload: &impl Serialize) -> String {
    let json = serde_json::to_string(payload).expect("payload serialization is infallible");
    format!("event: {name}\ndata: {json}\n\n")
}

/// Metadata shared by every chunk of one stream (same id, created, model).
#[derive(Debug, Clone)]
pub struct ChunkMeta {
    /// Completion id (e.g. "chatcmpl-xxx").
    pub id: String,
    /// Model name to echo in chunks.
    pub model: String,
    /// Unix timestamp (seconds) stamped on every chunk.
    pub created: u64,
}

/// Stateful adapter turning [`ChatEvent`]s into SSE lines.
///
/// Feed events via [`feed`](EventsToSse::feed); each call returns the SSE
/// string to write (or `None` when the event produces no frame). Call
/// [`finish`](EventsToSse::finish) once after the stream ends for the
/// terminal `finish_reason: "stop"` chunk, then send `data: [DONE]\n\n`.
pub struct EventsToSse {
    meta: ChunkMeta,
    usage: Option<ChunkUsage>,
    sent_initial: bool,
}

impl EventsToSse {
    pub fn new(meta: ChunkMeta) -> Self {
        Self {
            meta,
            usage: None,
            sent_initial: false,
        }
    }

    /// Records usage to attach to the terminal chunk.
    pub fn set_usage(&mut self, usage: ChunkUsage) {
        self.usage = Some(usage);
    }

    fn content_chunk(&mut self, content: String) -> String {
        let role = if self.sent_initial {
            None
        } else {
            self.sent_initial = true;
            Some("assistant".to_string())
        };
        let chunk = ChatCompletionChunk {
            id: self.meta.id.clone(),
            object: ChatCompletionChunk::OBJECT,
            created: self.meta.created,
            model: self.meta.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: Delta {
                    role,
                    content: Some(content),
                },
                finish_reason: None,
            }],
            usage: None,
        };
        write_sse_line(&chunk)
    }

    /// Converts one event into its SSE frame.
    pub fn feed(&mut self, event: &ChatEvent) -> Option<String> {
        match event {
            ChatEvent::Text { content } => Some(self.content_chunk(content.clone())),
            ChatEvent::ToolCall { name, .. } => {
                // Inline marker so frontends without tool rendering still show progress.
                Some(self.content_chunk(format!("\n\n*[Calling tool: {name}]*\n\n")))
            }
            ChatEvent::ToolOutput { content } => Some(self.content_chunk(content.clone())),
            ChatEvent::Source { citation } => Some(write_named_event("source", citation)),
            ChatEvent::Status { status } => Some(write_named_event("status", status)),
        }
    }

    /// Terminal chunk: empty delta, `finish_reason: "stop"`, optional usage.
    pub fn finish(&mut self) -> String {
        let chunk = ChatCompletionChunk {
            id: self.meta.id.clone(),
            object: ChatCompletionChunk::OBJECT,
            created: self.meta.created,
            model: self.meta.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: Delta::default(),
                finish_reason: Some("stop".to_string()),
            }],
            usage: self.usage.clone(),
        };
        write_sse_line(&chunk)
    }
}

/// The stream terminator every OpenAI-compatible client waits for.
pub const SSE_DONE: &str = "data: [DONE]\n\n";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Citation, StatusUpdate};

    fn meta() -> ChunkMeta {
        ChunkMeta {
            id: "chatcmpl-test".to_string(),
            model: "claude-sonnet-4-5".to_string(),
            created: 1_700_000_000,
        }
    }

    /// **Scenario**: the first text event carries the assistant role, later ones do not.
    #[test]
    fn first_chunk_sets_role_once() {
        let mut adapter = EventsToSse::new(meta());
        let first = adapter
            .feed(&ChatEvent::Text {
                content: "he".into(),
            })
            .unwrap();
        assert!(first.contains("\"role\":\"assistant\""));
        let second = adapter
            .feed(&ChatEvent::Text {
                content: "llo".into(),
            })
            .unwrap();
        assert!(!second.contains("\"role\""));
        assert!(second.contains("\"content\":\"llo\""));
    }

    /// **Scenario**: tool-call markers surface the tool name in the content stream.
    #[test]
    fn tool_call_marker_names_the_tool() {
        let mut adapter = EventsToSse::new(meta());
        let line = adapter
            .feed(&ChatEvent::ToolCall {
                id: "call_1".into(),
                name: "web_search".into(),
                arguments: serde_json::json!({"query": "tacos"}),
            })
            .unwrap();
        assert!(line.starts_with("data: "));
        assert!(line.contains("web_search"));
    }

    /// **Scenario**: status and source go out as named SSE events, not data chunks.
    #[test]
    fn status_and_source_are_named_events() {
        let mut adapter = EventsToSse::new(meta());
        let line = adapter
            .feed(&ChatEvent::Status {
                status: StatusUpdate::begin("Compacting conversation…"),
            })
            .unwrap();
        assert!(line.starts_with("event: status\n"));

        let line = adapter
            .feed(&ChatEvent::Source {
                citation: Citation::link("Example", "https://example.com"),
            })
            .unwrap();
        assert!(line.starts_with("event: source\n"));
        assert!(line.contains("https://example.com"));
    }

    /// **Scenario**: finish emits finish_reason stop and attached usage.
    #[test]
    fn finish_carries_stop_and_usage() {
        let mut adapter = EventsToSse::new(meta());
        adapter.set_usage(ChunkUsage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        });
        let line = adapter.finish();
        assert!(line.contains("\"finish_reason\":\"stop\""));
        assert!(line.contains("\"total_tokens\":15"));
    }
}
