//! OpenAI Responses API adapter with response chaining.
//!
//! First call of a turn ships the full transcript as input items. Each
//! follow-up inside the tool loop sends `previous_response_id` plus only the
//! new `function_call_output` items (the messages past `tail`), so the
//! platform replays the earlier context server-side.
//!
//! Images are passed as URL references directly; inline bytes travel as data
//! URLs. Reported usage is treated as per-call and summed by the loop.

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tracing::{debug, trace};

use crate::error::GatewayError;
use crate::message::{ChatMessage, ContentBlock, ImageSource, Role};

use super::{EventSink, ProviderAdapter, StopReason, TokenUsage, TurnRequest, TurnResponse};

const DEFAULT_BASE_URL: &str = "https://api.openai.com";

/// OpenAI Responses API client implementing [`ProviderAdapter`].
pub struct OpenAiAdapter {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl OpenAiAdapter {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    /// Overrides the API base URL (tests, proxies, compatible servers).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn translate_message(message: &ChatMessage, items: &mut Vec<Value>) {
        match message.role {
            Role::Tool => {
                for block in &message.content {
                    if let ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        ..
                    } = block
                    {
                        items.push(json!({
                            "type": "function_call_output",
                            "call_id": tool_use_id,
                            "output": content,
                        }));
                    }
                }
            }
            Role::Assistant => {
                let mut parts = Vec::new();
                for block in &message.content {
                    match block {
                        ContentBlock::Text { text } => {
                            parts.push(json!({ "type": "output_text", "text": text }));
                        }
                        ContentBlock::ToolUse { id, name, input } => {
                            items.push(json!({
                                "type": "function_call",
                                "call_id": id,
                                "name": name,
                                "arguments": input.to_string(),
                            }));
                        }
                        _ => {}
                    }
                }
                if !parts.is_empty() {
                    items.push(json!({
                        "type": "message", "role": "assistant", "content": parts,
                    }));
                }
            }
            Role::System | Role::User => {
                let role = if message.role == Role::System {
                    "system"
                } else {
                    "user"
                };
                let mut parts = Vec::new();
                for block in &message.content {
                    match block {
                        ContentBlock::Text { text } => {
                            parts.push(json!({ "type": "input_text", "text": text }));
                        }
                        ContentBlock::Image { source } => {
                            let url = match source {
                                ImageSource::Url { url } => url.clone(),
                                ImageSource::Inline { media_type, data } => {
                                    format!("data:{media_type};base64,{data}")
                                }
                            };
                            parts.push(json!({ "type": "input_image", "image_url": url }));
                        }
                        _ => {}
                    }
                }
                items.push(json!({ "type": "message", "role": role, "content": parts }));
            }
        }
    }

    /// Builds the request body, chaining on `previous_response_id` when set.
    fn build_body(req: &TurnRequest<'_>, stream: bool) -> Value {
        let mut items = Vec::new();
        let messages = if req.chain.is_some() {
            &req.messages[req.tail.min(req.messages.len())..]
        } else {
            req.messages
        };
        for message in messages {
            Self::translate_message(message, &mut items);
        }

        let mut body = json!({
            "model": req.model,
            "input": items,
            "max_output_tokens": req.max_tokens,
        });
        if let Some(chain) = req.chain {
            body["previous_response_id"] = json!(chain);
        }
        if !req.tools.is_empty() {
            body["tools"] = Value::Array(req.tools.iter().map(|t| t.to_openai()).collect());
        }
        if stream {
            body["stream"] = json!(true);
        }
        body
    }

    async fn post(&self, body: &Value) -> Result<reqwest::Response, GatewayError> {
        let url = format!("{}/v1/responses", self.base_url);
        trace!(url = %url, body = %body, "openai request");
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| GatewayError::provider_retryable(format!("openai: {e}")))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let detail = resp.text().await.unwrap_or_default();
        let message = format!("openai returned {status}: {detail}");
        if status.as_u16() == 429 || status.is_server_error() {
            Err(GatewayError::provider_retryable(message))
        } else {
            Err(GatewayError::provider_fatal(message))
        }
    }

    fn parse_usage(usage: &Value) -> TokenUsage {
        TokenUsage {
            input_tokens: usage["input_tokens"].as_u64().unwrap_or(0),
            output_tokens: usage["output_tokens"].as_u64().unwrap_or(0),
            cache_read_tokens: usage["input_tokens_details"]["cached_tokens"]
                .as_u64()
                .unwrap_or(0),
            cache_write_tokens: 0,
        }
    }

    fn parse_response(value: &Value) -> TurnResponse {
        let mut content = Vec::new();
        let mut saw_tool_call = false;
        if let Some(output) = value["output"].as_array() {
            for item in output {
                match item["type"].as_str() {
                    Some("message") => {
                        if let Some(parts) = item["content"].as_array() {
                            for part in parts {
                                if part["type"] == "output_text" {
                                    content.push(ContentBlock::Text {
                                        text: part["text"].as_str().unwrap_or_default().to_string(),
                                    });
                                }
                            }
                        }
                    }
                    Some("function_call") => {
                        saw_tool_call = true;
                        let raw = item["arguments"].as_str().unwrap_or("{}");
                        content.push(ContentBlock::ToolUse {
                            id: item["call_id"].as_str().unwrap_or_default().to_string(),
                            name: item["name"].as_str().unwrap_or_default().to_string(),
                            input: serde_json::from_str(raw).unwrap_or(json!({})),
                        });
                    }
                    _ => {}
                }
            }
        }

        let stop_reason = if saw_tool_call {
            StopReason::ToolUse
        } else {
            match value["status"].as_str() {
                Some("completed") => StopReason::EndTurn,
                Some("incomplete") => StopReason::MaxTokens,
                _ => StopReason::Other,
            }
        };

        TurnResponse {
            content,
            stop_reason,
            usage: Self::parse_usage(&value["usage"]),
            response_id: value["id"].as_str().map(String::from),
        }
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn run_once(&self, req: &TurnRequest<'_>) -> Result<TurnResponse, GatewayError> {
        let body = Self::build_body(req, false);
        let resp = self.post(&body).await?;
        let value: Value = resp
            .json()
            .await
            .map_err(|e| GatewayError::provider_fatal(format!("openai response: {e}")))?;
        trace!(response = %value, "openai response");
        Ok(Self::parse_response(&value))
    }

    async fn stream_once(
        &self,
        req: &TurnRequest<'_>,
        sink: &EventSink,
    ) -> Result<TurnResponse, GatewayError> {
        let body = Self::build_body(req, true);
        let resp = self.post(&body).await?;
        let mut events = resp.bytes_stream().eventsource();

        let mut complete: Option<TurnResponse> = None;
        while let Some(event) = events.next().await {
            let event = event
                .map_err(|e| GatewayError::provider_retryable(format!("openai stream: {e}")))?;
            let data: Value = match serde_json::from_str(&event.data) {
                Ok(v) => v,
                Err(_) => continue,
            };
            let kind = data["type"].as_str().unwrap_or(event.event.as_str());
            match kind {
                "response.output_text.delta" => {
                    sink.text(data["delta"].as_str().unwrap_or_default()).await;
                }
                "response.completed" => {
                    complete = Some(Self::parse_response(&data["response"]));
                }
                "response.failed" | "error" => {
                    let message = data["response"]["error"]["message"]
                        .as_str()
                        .or_else(|| data["message"].as_str())
                        .unwrap_or("stream failed")
                        .to_string();
                    return Err(GatewayError::provider_fatal(format!("openai: {message}")));
                }
                _ => {}
            }
        }

        let resp = complete.ok_or_else(|| {
            GatewayError::provider_retryable("openai stream ended without completion")
        })?;
        debug!(
            input_tokens = resp.usage.input_tokens,
            output_tokens = resp.usage.output_tokens,
            cache_read = resp.usage.cache_read_tokens,
            "openai stream complete"
        );
        Ok(resp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ToolSpec;

    fn spec() -> ToolSpec {
        ToolSpec {
            name: "web_search".into(),
            description: "Search".into(),
            input_schema: json!({"type": "object"}),
        }
    }

    /// **Scenario**: the first call ships the whole transcript; a chained
    /// call ships only the messages past the tail plus the previous id.
    #[test]
    fn chaining_sends_only_new_items() {
        let messages = vec![
            ChatMessage::system("sys"),
            ChatMessage::user("hi"),
            ChatMessage {
                role: Role::Assistant,
                content: vec![ContentBlock::ToolUse {
                    id: "c1".into(),
                    name: "web_search".into(),
                    input: json!({"query": "x"}),
                }],
            },
            ChatMessage::tool_result("c1", "{\"result\":\"found\"}", false),
        ];

        let full = OpenAiAdapter::build_body(
            &TurnRequest {
                model: "gpt-4o",
                messages: &messages,
                tools: &[spec()],
                iteration: 0,
                chain: None,
                tail: 0,
                max_tokens: 256,
            },
            false,
        );
        assert!(full.get("previous_response_id").is_none());
        assert_eq!(full["input"].as_array().unwrap().len(), 4);

        let chained = OpenAiAdapter::build_body(
            &TurnRequest {
                model: "gpt-4o",
                messages: &messages,
                tools: &[spec()],
                iteration: 1,
                chain: Some("resp_abc"),
                tail: 3,
                max_tokens: 256,
            },
            false,
        );
        assert_eq!(chained["previous_response_id"], "resp_abc");
        let items = chained["input"].as_array().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["type"], "function_call_output");
        assert_eq!(items[0]["call_id"], "c1");
    }

    /// **Scenario**: image URLs pass straight through; inline bytes become
    /// data URLs.
    #[test]
    fn image_translation() {
        let message = ChatMessage {
            role: Role::User,
            content: vec![
                ContentBlock::Image {
                    source: ImageSource::Url {
                        url: "https://example.com/a.png".into(),
                    },
                },
                ContentBlock::Image {
                    source: ImageSource::Inline {
                        media_type: "image/png".into(),
                        data: "aGk=".into(),
                    },
                },
            ],
        };
        let mut items = Vec::new();
        OpenAiAdapter::translate_message(&message, &mut items);
        let parts = items[0]["content"].as_array().unwrap();
        assert_eq!(parts[0]["image_url"], "https://example.com/a.png");
        assert_eq!(parts[1]["image_url"], "data:image/png;base64,aGk=");
    }

    /// **Scenario**: function calls in the output flip the stop reason to
    /// tool use; cached tokens land in cache_read.
    #[test]
    fn response_parsing() {
        let value = json!({
            "id": "resp_1",
            "status": "completed",
            "output": [
                {"type": "message", "content": [{"type": "output_text", "text": "checking"}]},
                {"type": "function_call", "call_id": "c9", "name": "web_search",
                 "arguments": "{\"query\":\"tacos\"}"}
            ],
            "usage": {
                "input_tokens": 100, "output_tokens": 20,
                "input_tokens_details": {"cached_tokens": 40}
            }
        });
        let resp = OpenAiAdapter::parse_response(&value);
        assert_eq!(resp.stop_reason, StopReason::ToolUse);
        assert_eq!(resp.response_id.as_deref(), Some("resp_1"));
        assert_eq!(resp.usage.cache_read_tokens, 40);
        assert!(matches!(
            &resp.content[1],
            ContentBlock::ToolUse { name, input, .. }
                if name == "web_search" && input["query"] == "tacos"
        ));
    }
}
