//! Fast token estimation for context budgeting.
//!
//! A deliberate approximation: 3.2 characters per text token, flat costs for
//! images, tool definitions, and per-message overhead. Used by the trim and
//! compaction steps, never for billing (the cost engine uses the usage the
//! provider reported).

use crate::message::{ChatMessage, ContentBlock};

/// Characters per token for prose.
pub const CHARS_PER_TOKEN: f64 = 3.2;
/// Flat estimate for one image block.
pub const TOKENS_PER_IMAGE: u32 = 500;
/// Flat estimate for one tool definition sent to the model.
pub const TOKENS_PER_TOOL: u32 = 350;
/// Wire overhead per message (role tags, separators).
pub const TOKENS_PER_MESSAGE: u32 = 15;

/// Estimated tokens for a piece of text.
pub fn text_tokens(text: &str) -> u32 {
    (text.chars().count() as f64 / CHARS_PER_TOKEN).ceil() as u32
}

/// Estimated tokens for one message including image blocks and overhead.
pub fn message_tokens(message: &ChatMessage) -> u32 {
    let mut total = TOKENS_PER_MESSAGE;
    for block in &message.content {
        match block {
            ContentBlock::Text { text } => total += text_tokens(text),
            ContentBlock::Image { .. } => total += TOKENS_PER_IMAGE,
            ContentBlock::ToolUse { input, .. } => {
                total += text_tokens(&input.to_string());
            }
            ContentBlock::ToolResult { content, .. } => total += text_tokens(content),
        }
    }
    total
}

/// Estimated tokens for a transcript plus `tool_count` tool definitions.
pub fn transcript_tokens(messages: &[ChatMessage], tool_count: usize) -> u32 {
    let msgs: u32 = messages.iter().map(message_tokens).sum();
    msgs + tool_count as u32 * TOKENS_PER_TOOL
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ChatMessage, ContentBlock, ImageSource};

    /// **Scenario**: 320 chars ≈ 100 tokens at 3.2 chars/token.
    #[test]
    fn text_tokens_tracks_ratio() {
        assert_eq!(text_tokens(&"x".repeat(320)), 100);
        assert_eq!(text_tokens(""), 0);
        // Rounds up: one char is still one token.
        assert_eq!(text_tokens("a"), 1);
    }

    /// **Scenario**: image blocks add the flat 500-token cost on top of text.
    #[test]
    fn message_tokens_counts_images_flat() {
        let mut m = ChatMessage::user("hi");
        let base = message_tokens(&m);
        m.content.push(ContentBlock::Image {
            source: ImageSource::Url { url: "u".into() },
        });
        assert_eq!(message_tokens(&m), base + TOKENS_PER_IMAGE);
    }

    /// **Scenario**: tool definitions are charged per tool across the transcript.
    #[test]
    fn transcript_tokens_adds_tool_definitions() {
        let msgs = vec![ChatMessage::user("hello")];
        let without = transcript_tokens(&msgs, 0);
        let with = transcript_tokens(&msgs, 3);
        assert_eq!(with - without, 3 * TOKENS_PER_TOOL);
    }
}
