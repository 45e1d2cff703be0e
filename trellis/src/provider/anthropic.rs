//! Anthropic Messages API adapter.
//!
//! Wire mapping: system messages collect into the `system` array, tool-role
//! messages become user messages carrying `tool_result` blocks, images are
//! sent as URL sources when HTTPS or inlined as base64 otherwise (plain HTTP
//! references are fetched and inlined, since the API rejects them).
//!
//! Prompt-cache discipline: one `cache_control` marker on the system prompt
//! when it is substantial, one on the last tool definition, and a marker
//! refreshed onto the last message on every iteration after the first, so
//! each new turn's prefix becomes cacheable.

use async_trait::async_trait;
use base64::Engine as _;
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use serde_json::{json, Map, Value};
use tracing::{debug, trace};

use crate::error::GatewayError;
use crate::message::{ContentBlock, ImageSource, Role};

use super::{EventSink, ProviderAdapter, StopReason, TokenUsage, TurnRequest, TurnResponse};

const API_VERSION: &str = "2023-06-01";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
/// System prompts shorter than this are not worth a cache slot.
const CACHE_SYSTEM_MIN_CHARS: usize = 1024;

/// Anthropic Messages API client implementing [`ProviderAdapter`].
pub struct AnthropicAdapter {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl AnthropicAdapter {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    /// Overrides the API base URL (tests, proxies).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn cache_marker() -> Value {
        json!({ "type": "ephemeral" })
    }

    async fn image_source(&self, source: &ImageSource) -> Result<Value, GatewayError> {
        match source {
            ImageSource::Inline { media_type, data } => Ok(json!({
                "type": "base64",
                "media_type": media_type,
                "data": data,
            })),
            ImageSource::Url { url } if url.starts_with("https://") => Ok(json!({
                "type": "url",
                "url": url,
            })),
            ImageSource::Url { url } => {
                // Plain HTTP is rejected upstream; fetch and inline.
                let resp = self
                    .client
                    .get(url)
                    .send()
                    .await
                    .map_err(|e| GatewayError::provider_retryable(format!("fetch image: {e}")))?;
                let media_type = resp
                    .headers()
                    .get(reqwest::header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("image/jpeg")
                    .to_string();
                let bytes = resp
                    .bytes()
                    .await
                    .map_err(|e| GatewayError::provider_retryable(format!("read image: {e}")))?;
                Ok(json!({
                    "type": "base64",
                    "media_type": media_type,
                    "data": base64::engine::general_purpose::STANDARD.encode(&bytes),
                }))
            }
        }
    }

    async fn translate_block(&self, block: &ContentBlock) -> Result<Value, GatewayError> {
        Ok(match block {
            ContentBlock::Text { text } => json!({ "type": "text", "text": text }),
            ContentBlock::Image { source } => json!({
                "type": "image",
                "source": self.image_source(source).await?,
            }),
            ContentBlock::ToolUse { id, name, input } => json!({
                "type": "tool_use", "id": id, "name": name, "input": input,
            }),
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => json!({
                "type": "tool_result",
                "tool_use_id": tool_use_id,
                "content": content,
                "is_error": is_error,
            }),
        })
    }

    /// Builds the request body from the canonical transcript.
    async fn build_body(
        &self,
        req: &TurnRequest<'_>,
        stream: bool,
    ) -> Result<Value, GatewayError> {
        let mut system_text = String::new();
        let mut messages: Vec<Value> = Vec::new();

        for message in req.messages {
            match message.role {
                Role::System => {
                    if !system_text.is_empty() {
                        system_text.push_str("\n\n");
                    }
                    system_text.push_str(&message.joined_text());
                }
                Role::User | Role::Tool => {
                    let mut blocks = Vec::new();
                    for block in &message.content {
                        blocks.push(self.translate_block(block).await?);
                    }
                    messages.push(json!({ "role": "user", "content": blocks }));
                }
                Role::Assistant => {
                    let mut blocks = Vec::new();
                    for block in &message.content {
                        blocks.push(self.translate_block(block).await?);
                    }
                    messages.push(json!({ "role": "assistant", "content": blocks }));
                }
            }
        }

        // Refresh the rolling cache marker on the last message's last block.
        if req.iteration > 0 {
            if let Some(last) = messages.last_mut() {
                if let Some(block) = last
                    .get_mut("content")
                    .and_then(Value::as_array_mut)
                    .and_then(|blocks| blocks.last_mut())
                    .and_then(Value::as_object_mut)
                {
                    block.insert("cache_control".to_string(), Self::cache_marker());
                }
            }
        }

        let mut body = Map::new();
        body.insert("model".to_string(), json!(req.model));
        body.insert("max_tokens".to_string(), json!(req.max_tokens));
        body.insert("messages".to_string(), Value::Array(messages));
        if stream {
            body.insert("stream".to_string(), json!(true));
        }

        if !system_text.is_empty() {
            let mut system_block = json!({ "type": "text", "text": system_text });
            if system_text.len() >= CACHE_SYSTEM_MIN_CHARS {
                system_block["cache_control"] = Self::cache_marker();
            }
            body.insert("system".to_string(), json!([system_block]));
        }

        if !req.tools.is_empty() {
            let mut tools: Vec<Value> = req.tools.iter().map(|t| t.to_anthropic()).collect();
            if let Some(last) = tools.last_mut().and_then(Value::as_object_mut) {
                last.insert("cache_control".to_string(), Self::cache_marker());
            }
            body.insert("tools".to_string(), Value::Array(tools));
        }

        Ok(Value::Object(body))
    }

    async fn post(&self, body: &Value) -> Result<reqwest::Response, GatewayError> {
        let url = format!("{}/v1/messages", self.base_url);
        trace!(url = %url, body = %body, "anthropic request");
        let resp = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(body)
            .send()
            .await
            .map_err(|e| GatewayError::provider_retryable(format!("anthropic: {e}")))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let detail = resp.text().await.unwrap_or_default();
        let message = format!("anthropic returned {status}: {detail}");
        if status.as_u16() == 429 || status.is_server_error() {
            Err(GatewayError::provider_retryable(message))
        } else {
            Err(GatewayError::provider_fatal(message))
        }
    }

    fn parse_stop_reason(raw: Option<&str>) -> StopReason {
        match raw {
            Some("end_turn") | Some("stop_sequence") => StopReason::EndTurn,
            Some("tool_use") => StopReason::ToolUse,
            Some("max_tokens") => StopReason::MaxTokens,
            _ => StopReason::Other,
        }
    }

    fn parse_usage(usage: &Value) -> TokenUsage {
        TokenUsage {
            input_tokens: usage["input_tokens"].as_u64().unwrap_or(0),
            output_tokens: usage["output_tokens"].as_u64().unwrap_or(0),
            cache_read_tokens: usage["cache_read_input_tokens"].as_u64().unwrap_or(0),
            cache_write_tokens: usage["cache_creation_input_tokens"].as_u64().unwrap_or(0),
        }
    }

    fn parse_content(blocks: &Value) -> Vec<ContentBlock> {
        let mut out = Vec::new();
        let Some(array) = blocks.as_array() else {
            return out;
        };
        for block in array {
            match block["type"].as_str() {
                Some("text") => out.push(ContentBlock::Text {
                    text: block["text"].as_str().unwrap_or_default().to_string(),
                }),
                Some("tool_use") => out.push(ContentBlock::ToolUse {
                    id: block["id"].as_str().unwrap_or_default().to_string(),
                    name: block["name"].as_str().unwrap_or_default().to_string(),
                    input: block["input"].clone(),
                }),
                _ => {}
            }
        }
        out
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    async fn run_once(&self, req: &TurnRequest<'_>) -> Result<TurnResponse, GatewayError> {
        let body = self.build_body(req, false).await?;
        let resp = self.post(&body).await?;
        let value: Value = resp
            .json()
            .await
            .map_err(|e| GatewayError::provider_fatal(format!("anthropic response: {e}")))?;
        trace!(response = %value, "anthropic response");

        Ok(TurnResponse {
            content: Self::parse_content(&value["content"]),
            stop_reason: Self::parse_stop_reason(value["stop_reason"].as_str()),
            usage: Self::parse_usage(&value["usage"]),
            response_id: None,
        })
    }

    async fn stream_once(
        &self,
        req: &TurnRequest<'_>,
        sink: &EventSink,
    ) -> Result<TurnResponse, GatewayError> {
        let body = self.build_body(req, true).await?;
        let resp = self.post(&body).await?;
        let mut events = resp.bytes_stream().eventsource();

        let mut usage = TokenUsage::default();
        let mut stop_reason = StopReason::EndTurn;
        let mut content: Vec<ContentBlock> = Vec::new();
        // Per-index buffers for tool-use argument deltas.
        let mut pending_tools: std::collections::HashMap<usize, (String, String, String)> =
            std::collections::HashMap::new();

        while let Some(event) = events.next().await {
            let event = event
                .map_err(|e| GatewayError::provider_retryable(format!("anthropic stream: {e}")))?;
            let data: Value = match serde_json::from_str(&event.data) {
                Ok(v) => v,
                Err(_) => continue,
            };
            match event.event.as_str() {
                "message_start" => {
                    let initial = Self::parse_usage(&data["message"]["usage"]);
                    usage.input_tokens = initial.input_tokens;
                    usage.cache_read_tokens = initial.cache_read_tokens;
                    usage.cache_write_tokens = initial.cache_write_tokens;
                }
                "content_block_start" => {
                    let index = data["index"].as_u64().unwrap_or(0) as usize;
                    let block = &data["content_block"];
                    match block["type"].as_str() {
                        Some("text") => {
                            content.push(ContentBlock::Text {
                                text: String::new(),
                            });
                        }
                        Some("tool_use") => {
                            pending_tools.insert(
                                index,
                                (
                                    block["id"].as_str().unwrap_or_default().to_string(),
                                    block["name"].as_str().unwrap_or_default().to_string(),
                                    String::new(),
                                ),
                            );
                        }
                        _ => {}
                    }
                }
                "content_block_delta" => {
                    let index = data["index"].as_u64().unwrap_or(0) as usize;
                    match data["delta"]["type"].as_str() {
                        Some("text_delta") => {
                            let piece = data["delta"]["text"].as_str().unwrap_or_default();
                            if let Some(ContentBlock::Text { text }) = content.last_mut() {
                                text.push_str(piece);
                            }
                            sink.text(piece).await;
                        }
                        Some("input_json_delta") => {
                            if let Some(entry) = pending_tools.get_mut(&index) {
                                entry
                                    .2
                                    .push_str(data["delta"]["partial_json"].as_str().unwrap_or(""));
                            }
                        }
                        _ => {}
                    }
                }
                "content_block_stop" => {
                    let index = data["index"].as_u64().unwrap_or(0) as usize;
                    if let Some((id, name, raw)) = pending_tools.remove(&index) {
                        let input = if raw.trim().is_empty() {
                            json!({})
                        } else {
                            serde_json::from_str(&raw).unwrap_or(json!({}))
                        };
                        content.push(ContentBlock::ToolUse { id, name, input });
                    }
                }
                "message_delta" => {
                    stop_reason =
                        Self::parse_stop_reason(data["delta"]["stop_reason"].as_str());
                    if let Some(out) = data["usage"]["output_tokens"].as_u64() {
                        usage.output_tokens = out;
                    }
                }
                "message_stop" => break,
                "error" => {
                    let message = data["error"]["message"]
                        .as_str()
                        .unwrap_or("stream error")
                        .to_string();
                    return Err(GatewayError::provider_fatal(format!("anthropic: {message}")));
                }
                _ => {}
            }
        }

        debug!(
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            cache_read = usage.cache_read_tokens,
            "anthropic stream complete"
        );
        Ok(TurnResponse {
            content,
            stop_reason,
            usage,
            response_id: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ChatMessage;
    use crate::tools::ToolSpec;

    fn request<'a>(
        messages: &'a [ChatMessage],
        tools: &'a [ToolSpec],
        iteration: u32,
    ) -> TurnRequest<'a> {
        TurnRequest {
            model: "claude-sonnet-4-5",
            messages,
            tools,
            iteration,
            chain: None,
            tail: 0,
            max_tokens: 1024,
        }
    }

    /// **Scenario**: system messages fold into the `system` array and tool
    /// results ride as user-role blocks.
    #[tokio::test]
    async fn body_shapes_roles() {
        let adapter = AnthropicAdapter::new("key");
        let messages = vec![
            ChatMessage::system("be terse"),
            ChatMessage::user("hi"),
            ChatMessage {
                role: Role::Assistant,
                content: vec![ContentBlock::ToolUse {
                    id: "t1".into(),
                    name: "echo".into(),
                    input: json!({"text": "x"}),
                }],
            },
            ChatMessage::tool_result("t1", "{\"result\":\"x\"}", false),
        ];
        let body = adapter.build_body(&request(&messages, &[], 0), false).await.unwrap();
        assert_eq!(body["system"][0]["text"], "be terse");
        let wire = body["messages"].as_array().unwrap();
        assert_eq!(wire.len(), 3);
        assert_eq!(wire[2]["role"], "user");
        assert_eq!(wire[2]["content"][0]["type"], "tool_result");
        assert_eq!(wire[2]["content"][0]["tool_use_id"], "t1");
    }

    /// **Scenario**: the last tool definition carries the cache marker; the
    /// last message gets one only after the first iteration.
    #[tokio::test]
    async fn cache_marker_placement() {
        let adapter = AnthropicAdapter::new("key");
        let tools = vec![
            ToolSpec {
                name: "a".into(),
                description: String::new(),
                input_schema: json!({}),
            },
            ToolSpec {
                name: "b".into(),
                description: String::new(),
                input_schema: json!({}),
            },
        ];
        let messages = vec![ChatMessage::user("hi")];

        let body = adapter.build_body(&request(&messages, &tools, 0), false).await.unwrap();
        let wire_tools = body["tools"].as_array().unwrap();
        assert!(wire_tools[0].get("cache_control").is_none());
        assert!(wire_tools[1].get("cache_control").is_some());
        assert!(body["messages"][0]["content"][0].get("cache_control").is_none());

        let body = adapter.build_body(&request(&messages, &tools, 1), false).await.unwrap();
        assert!(body["messages"][0]["content"][0].get("cache_control").is_some());
    }

    /// **Scenario**: a short system prompt gets no cache slot, a long one does.
    #[tokio::test]
    async fn system_cache_threshold() {
        let adapter = AnthropicAdapter::new("key");
        let short = vec![ChatMessage::system("short"), ChatMessage::user("hi")];
        let body = adapter.build_body(&request(&short, &[], 0), false).await.unwrap();
        assert!(body["system"][0].get("cache_control").is_none());

        let long = vec![
            ChatMessage::system("x".repeat(CACHE_SYSTEM_MIN_CHARS)),
            ChatMessage::user("hi"),
        ];
        let body = adapter.build_body(&request(&long, &[], 0), false).await.unwrap();
        assert!(body["system"][0].get("cache_control").is_some());
    }

    /// **Scenario**: response parsing maps content, stop reason, and cache
    /// counters.
    #[test]
    fn response_parsing() {
        let content = AnthropicAdapter::parse_content(&json!([
            {"type": "text", "text": "hello"},
            {"type": "tool_use", "id": "t1", "name": "echo", "input": {"text": "x"}}
        ]));
        assert_eq!(content.len(), 2);
        assert!(matches!(&content[0], ContentBlock::Text { text } if text == "hello"));
        assert!(matches!(&content[1], ContentBlock::ToolUse { name, .. } if name == "echo"));

        assert_eq!(
            AnthropicAdapter::parse_stop_reason(Some("tool_use")),
            StopReason::ToolUse
        );
        let usage = AnthropicAdapter::parse_usage(&json!({
            "input_tokens": 10, "output_tokens": 20,
            "cache_read_input_tokens": 5, "cache_creation_input_tokens": 2
        }));
        assert_eq!(usage.cache_read_tokens, 5);
        assert_eq!(usage.cache_write_tokens, 2);
    }
}
