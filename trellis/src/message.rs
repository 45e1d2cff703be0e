//! Canonical conversation types shared by the pipeline and all three
//! provider adapters.
//!
//! Roles: System, User, Assistant, Tool. Content is a sequence of blocks:
//! text, image references, tool invocations and tool results. Adapters
//! translate this shape to and from their wire formats; nothing outside the
//! adapters ever sees provider JSON.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The author of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    /// Carrier for tool results fed back into the model.
    Tool,
}

/// Where image bytes live.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ImageSource {
    /// Fetchable URL (http, https, or a gateway-local path).
    Url { url: String },
    /// Inline bytes, base64-encoded, with their media type.
    Inline { media_type: String, data: String },
}

/// One content block within a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Plain text.
    Text { text: String },
    /// An image the model should see.
    Image { source: ImageSource },
    /// A tool invocation requested by the assistant.
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    /// The result of a tool invocation, keyed by the originating call id.
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
}

/// A single message in the conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl ChatMessage {
    /// Creates a text-only message with the given role.
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    /// Creates a system message.
    pub fn system(text: impl Into<String>) -> Self {
        Self::text(Role::System, text)
    }

    /// Creates a user message.
    pub fn user(text: impl Into<String>) -> Self {
        Self::text(Role::User, text)
    }

    /// Creates an assistant message.
    pub fn assistant(text: impl Into<String>) -> Self {
        Self::text(Role::Assistant, text)
    }

    /// Creates a tool message carrying one result block.
    pub fn tool_result(tool_use_id: impl Into<String>, content: impl Into<String>, is_error: bool) -> Self {
        Self {
            role: Role::Tool,
            content: vec![ContentBlock::ToolResult {
                tool_use_id: tool_use_id.into(),
                content: content.into(),
                is_error,
            }],
        }
    }

    /// Concatenates the text blocks of this message.
    pub fn joined_text(&self) -> String {
        let mut out = String::new();
        for block in &self.content {
            if let ContentBlock::Text { text } = block {
                if !out.is_empty() {
                    out.push('\n');
                }
                out.push_str(text);
            }
        }
        out
    }

    /// Total character count of the text blocks.
    pub fn text_len(&self) -> usize {
        self.content
            .iter()
            .map(|b| match b {
                ContentBlock::Text { text } => text.len(),
                _ => 0,
            })
            .sum()
    }

    /// Number of image blocks.
    pub fn image_count(&self) -> usize {
        self.content
            .iter()
            .filter(|b| matches!(b, ContentBlock::Image { .. }))
            .count()
    }

    /// Tool-use blocks of this message (assistant turns requesting tools).
    pub fn tool_uses(&self) -> impl Iterator<Item = (&str, &str, &Value)> {
        self.content.iter().filter_map(|b| match b {
            ContentBlock::ToolUse { id, name, input } => {
                Some((id.as_str(), name.as_str(), input))
            }
            _ => None,
        })
    }

    /// Appends a text block.
    pub fn push_text(&mut self, text: impl Into<String>) {
        self.content.push(ContentBlock::Text { text: text.into() });
    }

    /// Drops every image block, keeping the rest in order.
    pub fn strip_images(&mut self) {
        self.content
            .retain(|b| !matches!(b, ContentBlock::Image { .. }));
    }
}

/// Parses an RFC 2397 data URL into `(media_type, raw bytes)`.
///
/// Only base64-encoded payloads are accepted; providers receive the decoded
/// bytes re-encoded per their wire rules.
pub fn parse_data_url(url: &str) -> Option<(String, Vec<u8>)> {
    use base64::Engine as _;

    let rest = url.strip_prefix("data:")?;
    let (header, payload) = rest.split_once(',')?;
    let header = header.strip_suffix(";base64")?;
    let media_type = if header.is_empty() {
        "application/octet-stream".to_string()
    } else {
        header.to_string()
    };
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(payload.trim())
        .ok()?;
    Some((media_type, bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: role constructors produce the expected role and one text block.
    #[test]
    fn constructors_build_single_text_block() {
        let m = ChatMessage::user("hello");
        assert_eq!(m.role, Role::User);
        assert_eq!(m.content.len(), 1);
        assert_eq!(m.joined_text(), "hello");

        let m = ChatMessage::tool_result("call_1", "ok", false);
        assert_eq!(m.role, Role::Tool);
        assert!(matches!(
            &m.content[0],
            ContentBlock::ToolResult { tool_use_id, is_error: false, .. } if tool_use_id == "call_1"
        ));
    }

    /// **Scenario**: messages round-trip through serde with tagged blocks.
    #[test]
    fn message_serde_roundtrip() {
        let mut m = ChatMessage::user("look at this");
        m.content.push(ContentBlock::Image {
            source: ImageSource::Url {
                url: "https://example.com/cat.png".into(),
            },
        });
        let json = serde_json::to_string(&m).unwrap();
        let back: ChatMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.content.len(), 2);
        assert_eq!(back.image_count(), 1);
    }

    /// **Scenario**: strip_images removes image blocks and keeps text order.
    #[test]
    fn strip_images_keeps_text() {
        let mut m = ChatMessage::user("a");
        m.content.push(ContentBlock::Image {
            source: ImageSource::Url { url: "x".into() },
        });
        m.push_text("b");
        m.strip_images();
        assert_eq!(m.content.len(), 2);
        assert_eq!(m.joined_text(), "a\nb");
    }

    /// **Scenario**: data URLs decode to media type + bytes; non-base64 is rejected.
    #[test]
    fn data_url_parsing() {
        let (mt, bytes) = parse_data_url("data:image/png;base64,aGk=").unwrap();
        assert_eq!(mt, "image/png");
        assert_eq!(bytes, b"hi");

        assert!(parse_data_url("data:image/png,plain").is_none());
        assert!(parse_data_url("https://example.com").is_none());
    }
}
