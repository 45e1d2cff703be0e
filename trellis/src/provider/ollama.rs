//! Ollama chat API adapter for local models.
//!
//! Wire quirks relative to the other two: images ride in a sibling `images`
//! array on the message (base64 only; remote references are fetched and
//! inlined), tool calls carry no ids (the adapter assigns positional ones),
//! and streaming is newline-delimited JSON rather than SSE.

use async_trait::async_trait;
use base64::Engine as _;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tracing::{debug, trace};

use crate::error::GatewayError;
use crate::message::{ChatMessage, ContentBlock, ImageSource, Role};

use super::{EventSink, ProviderAdapter, StopReason, TokenUsage, TurnRequest, TurnResponse};

const DEFAULT_BASE_URL: &str = "http://localhost:11434";

/// Ollama chat client implementing [`ProviderAdapter`].
pub struct OllamaAdapter {
    client: reqwest::Client,
    base_url: String,
}

impl OllamaAdapter {
    pub fn new(base_url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        }
    }

    async fn image_base64(&self, source: &ImageSource) -> Result<String, GatewayError> {
        match source {
            ImageSource::Inline { data, .. } => Ok(data.clone()),
            ImageSource::Url { url } => {
                let resp = self
                    .client
                    .get(url)
                    .send()
                    .await
                    .map_err(|e| GatewayError::provider_retryable(format!("fetch image: {e}")))?;
                let bytes = resp
                    .bytes()
                    .await
                    .map_err(|e| GatewayError::provider_retryable(format!("read image: {e}")))?;
                Ok(base64::engine::general_purpose::STANDARD.encode(&bytes))
            }
        }
    }

    async fn translate_message(&self, message: &ChatMessage) -> Result<Vec<Value>, GatewayError> {
        match message.role {
            Role::Tool => {
                // One wire message per result; Ollama matches them by order.
                let mut out = Vec::new();
                for block in &message.content {
                    if let ContentBlock::ToolResult { content, .. } = block {
                        out.push(json!({ "role": "tool", "content": content }));
                    }
                }
                Ok(out)
            }
            role => {
                let role_str = match role {
                    Role::System => "system",
                    Role::Assistant => "assistant",
                    _ => "user",
                };
                let mut text = String::new();
                let mut images: Vec<String> = Vec::new();
                let mut tool_calls: Vec<Value> = Vec::new();
                for block in &message.content {
                    match block {
                        ContentBlock::Text { text: t } => {
                            if !text.is_empty() {
                                text.push('\n');
                            }
                            text.push_str(t);
                        }
                        ContentBlock::Image { source } => {
                            images.push(self.image_base64(source).await?);
                        }
                        ContentBlock::ToolUse { name, input, .. } => {
                            tool_calls.push(json!({
                                "function": { "name": name, "arguments": input }
                            }));
                        }
                        ContentBlock::ToolResult { .. } => {}
                    }
                }
                let mut wire = json!({ "role": role_str, "content": text });
                if !images.is_empty() {
                    wire["images"] = json!(images);
                }
                if !tool_calls.is_empty() {
                    wire["tool_calls"] = json!(tool_calls);
                }
                Ok(vec![wire])
            }
        }
    }

    async fn build_body(
        &self,
        req: &TurnRequest<'_>,
        stream: bool,
    ) -> Result<Value, GatewayError> {
        let mut messages = Vec::new();
        for message in req.messages {
            messages.extend(self.translate_message(message).await?);
        }
        let mut body = json!({
            "model": req.model,
            "messages": messages,
            "stream": stream,
            "options": { "num_predict": req.max_tokens },
        });
        if !req.tools.is_empty() {
            body["tools"] = Value::Array(req.tools.iter().map(|t| t.to_ollama()).collect());
        }
        Ok(body)
    }

    async fn post(&self, body: &Value) -> Result<reqwest::Response, GatewayError> {
        let url = format!("{}/api/chat", self.base_url);
        trace!(url = %url, body = %body, "ollama request");
        let resp = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| GatewayError::provider_retryable(format!("ollama: {e}")))?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let detail = resp.text().await.unwrap_or_default();
        let message = format!("ollama returned {status}: {detail}");
        if status.is_server_error() {
            Err(GatewayError::provider_retryable(message))
        } else {
            Err(GatewayError::provider_fatal(message))
        }
    }

    fn parse_tool_calls(message: &Value, content: &mut Vec<ContentBlock>) -> bool {
        let Some(calls) = message["tool_calls"].as_array() else {
            return false;
        };
        for (index, call) in calls.iter().enumerate() {
            let function = &call["function"];
            content.push(ContentBlock::ToolUse {
                id: format!("call_{index}"),
                name: function["name"].as_str().unwrap_or_default().to_string(),
                input: function["arguments"].clone(),
            });
        }
        !calls.is_empty()
    }

    fn parse_usage(value: &Value) -> TokenUsage {
        TokenUsage {
            input_tokens: value["prompt_eval_count"].as_u64().unwrap_or(0),
            output_tokens: value["eval_count"].as_u64().unwrap_or(0),
            cache_read_tokens: 0,
            cache_write_tokens: 0,
        }
    }
}

#[async_trait]
impl ProviderAdapter for OllamaAdapter {
    fn name(&self) -> &'static str {
        "ollama"
    }

    async fn run_once(&self, req: &TurnRequest<'_>) -> Result<TurnResponse, GatewayError> {
        let body = self.build_body(req, false).await?;
        let resp = self.post(&body).await?;
        let value: Value = resp
            .json()
            .await
            .map_err(|e| GatewayError::provider_fatal(format!("ollama response: {e}")))?;
        trace!(response = %value, "ollama response");

        let mut content = Vec::new();
        let text = value["message"]["content"].as_str().unwrap_or_default();
        if !text.is_empty() {
            content.push(ContentBlock::Text {
                text: text.to_string(),
            });
        }
        let has_tools = Self::parse_tool_calls(&value["message"], &mut content);
        let stop_reason = if has_tools {
            StopReason::ToolUse
        } else {
            match value["done_reason"].as_str() {
                Some("length") => StopReason::MaxTokens,
                _ => StopReason::EndTurn,
            }
        };
        Ok(TurnResponse {
            content,
            stop_reason,
            usage: Self::parse_usage(&value),
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

        let mut text = String::new();
        let mut content: Vec<ContentBlock> = Vec::new();
        let mut usage = TokenUsage::default();
        let mut stop_reason = StopReason::EndTurn;
        let mut has_tools = false;

        // NDJSON: one object per line, possibly split across chunks.
        let mut buffer = String::new();
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk
                .map_err(|e| GatewayError::provider_retryable(format!("ollama stream: {e}")))?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(newline) = buffer.find('\n') {
                let line: String = buffer.drain(..=newline).collect();
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let value: Value = match serde_json::from_str(line) {
                    Ok(v) => v,
                    Err(_) => continue,
                };
                let piece = value["message"]["content"].as_str().unwrap_or_default();
                if !piece.is_empty() {
                    text.push_str(piece);
                    sink.text(piece).await;
                }
                has_tools |= Self::parse_tool_calls(&value["message"], &mut content);
                if value["done"].as_bool() == Some(true) {
                    usage = Self::parse_usage(&value);
                    stop_reason = match value["done_reason"].as_str() {
                        Some("length") => StopReason::MaxTokens,
                        _ => StopReason::EndTurn,
                    };
                }
            }
        }

        if !text.is_empty() {
            content.insert(
                0,
                ContentBlock::Text {
                    text: text.clone(),
                },
            );
        }
        if has_tools {
            stop_reason = StopReason::ToolUse;
        }
        debug!(
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            "ollama stream complete"
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

    /// **Scenario**: inline images land in the sibling `images` array, not in
    /// the content string.
    #[tokio::test]
    async fn images_ride_in_sibling_array() {
        let adapter = OllamaAdapter::new(None);
        let message = ChatMessage {
            role: Role::User,
            content: vec![
                ContentBlock::Text {
                    text: "what is this".into(),
                },
                ContentBlock::Image {
                    source: ImageSource::Inline {
                        media_type: "image/png".into(),
                        data: "aGk=".into(),
                    },
                },
            ],
        };
        let wire = adapter.translate_message(&message).await.unwrap();
        assert_eq!(wire.len(), 1);
        assert_eq!(wire[0]["content"], "what is this");
        assert_eq!(wire[0]["images"][0], "aGk=");
    }

    /// **Scenario**: tool results become role=tool wire messages, one each.
    #[tokio::test]
    async fn tool_results_expand_per_block() {
        let adapter = OllamaAdapter::new(None);
        let message = ChatMessage {
            role: Role::Tool,
            content: vec![
                ContentBlock::ToolResult {
                    tool_use_id: "call_0".into(),
                    content: "one".into(),
                    is_error: false,
                },
                ContentBlock::ToolResult {
                    tool_use_id: "call_1".into(),
                    content: "two".into(),
                    is_error: true,
                },
            ],
        };
        let wire = adapter.translate_message(&message).await.unwrap();
        assert_eq!(wire.len(), 2);
        assert_eq!(wire[0]["role"], "tool");
        assert_eq!(wire[1]["content"], "two");
    }

    /// **Scenario**: tool calls get positional ids and flip the stop reason.
    #[test]
    fn positional_tool_call_ids() {
        let mut content = Vec::new();
        let has = OllamaAdapter::parse_tool_calls(
            &json!({
                "tool_calls": [
                    {"function": {"name": "web_search", "arguments": {"query": "x"}}},
                    {"function": {"name": "echo", "arguments": {"text": "y"}}}
                ]
            }),
            &mut content,
        );
        assert!(has);
        assert!(matches!(
            &content[0],
            ContentBlock::ToolUse { id, .. } if id == "call_0"
        ));
        assert!(matches!(
            &content[1],
            ContentBlock::ToolUse { id, .. } if id == "call_1"
        ));
    }

    /// **Scenario**: eval counters map to input/output tokens with no cache.
    #[test]
    fn usage_mapping() {
        let usage = OllamaAdapter::parse_usage(&json!({
            "prompt_eval_count": 32, "eval_count": 8
        }));
        assert_eq!(usage.input_tokens, 32);
        assert_eq!(usage.output_tokens, 8);
        assert_eq!(usage.cache_read_tokens, 0);
    }
}
