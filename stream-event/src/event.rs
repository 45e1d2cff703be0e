//! Chat stream events: everything an adapter can emit while driving one turn.
//!
//! Adapters produce [`ChatEvent`]s; the gateway converts them into SSE frames
//! (text deltas inside the OpenAI-compatible envelope, `status`/`source` as
//! named events). Within one turn, events must reach the client in emission
//! order.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Where a citation points: a named source with an optional URL.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CitationSource {
    /// Display name (e.g. page title or filename).
    pub name: String,
    /// Resolvable location, when one exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// A source citation emitted for the UI to render as a reference.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Citation {
    /// Source descriptor (name + url).
    pub source: CitationSource,
    /// Excerpt or document body backing the citation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document: Option<String>,
    /// Free-form extra fields (score, published date, ...).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl Citation {
    /// Builds a citation from a name and URL with no document body.
    pub fn link(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            source: CitationSource {
                name: name.into(),
                url: Some(url.into()),
            },
            document: None,
            metadata: None,
        }
    }
}

/// Human-friendly progress notice around a tool execution or pipeline step.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusUpdate {
    /// What is happening, phrased for an end user ("Searching: tacos…").
    pub description: String,
    /// False when the step starts, true when it completes.
    pub done: bool,
}

impl StatusUpdate {
    /// Start-of-step notice.
    pub fn begin(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            done: false,
        }
    }

    /// End-of-step notice.
    pub fn finish(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            done: true,
        }
    }
}

/// One event in a chat turn's output stream.
///
/// The four callback channels of the provider contract plus status notices,
/// collapsed into a single ordered stream as one enum.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    /// Incremental assistant text.
    Text { content: String },
    /// The model requested a tool invocation (emitted before execution).
    ToolCall {
        id: String,
        name: String,
        arguments: Value,
    },
    /// Incremental tool output (sandbox stdout/stderr) to surface live.
    ToolOutput { content: String },
    /// A citation produced by a tool.
    Source { citation: Citation },
    /// Progress notice for a long-running step.
    Status { status: StatusUpdate },
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: events serialize with a snake_case `type` tag the UI can switch on.
    #[test]
    fn chat_event_serializes_with_type_tag() {
        let ev = ChatEvent::Text {
            content: "hi".to_string(),
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "text");
        assert_eq!(v["content"], "hi");

        let ev = ChatEvent::Status {
            status: StatusUpdate::begin("Searching: tacos…"),
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "status");
        assert_eq!(v["status"]["done"], false);
    }

    /// **Scenario**: Citation::link fills source name/url and omits empty fields.
    #[test]
    fn citation_link_omits_empty_fields() {
        let c = Citation::link("Example", "https://example.com");
        let v = serde_json::to_value(&c).unwrap();
        assert_eq!(v["source"]["name"], "Example");
        assert_eq!(v["source"]["url"], "https://example.com");
        assert!(v.get("document").is_none());
        assert!(v.get("metadata").is_none());
    }
}
